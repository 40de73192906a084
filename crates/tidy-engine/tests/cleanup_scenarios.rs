//! Database-backed cleanup scenarios. Each test runs in its own schema and
//! only when `TIDY_TEST_DATABASE_URL` points at a PostgreSQL 15+ server.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tidy_core::{CleanupReport, ConstraintOutcome, ConstraintSpec, StandardizationRule};
use tidy_engine::{
    constraints, dedup, detect, repair, rewrite, run_cleanup, standardize, AssumeYes,
    CancelFlag, RunOptions, SchemaCatalog,
};
use uuid::Uuid;

struct TestDb {
    admin: PgPool,
    pool: PgPool,
    schema: String,
}

impl TestDb {
    async fn connect() -> Option<Self> {
        let Ok(url) = std::env::var("TIDY_TEST_DATABASE_URL") else {
            eprintln!("TIDY_TEST_DATABASE_URL not set; skipping");
            return None;
        };
        let schema = format!("tidy_test_{}", Uuid::new_v4().simple());
        let admin = PgPool::connect(&url).await.expect("connect admin pool");
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .expect("create schema");

        let options = PgConnectOptions::from_str(&url)
            .expect("parse test url")
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .expect("connect test pool");
        sqlx::raw_sql(include_str!("fixtures/schema.sql"))
            .execute(&pool)
            .await
            .expect("load fixture schema");
        Some(Self {
            admin,
            pool,
            schema,
        })
    }

    async fn teardown(self) {
        self.pool.close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .expect("drop schema");
    }

    async fn run(&self, dry_run: bool) -> CleanupReport {
        run_cleanup(
            &self.pool,
            &SchemaCatalog::builtin(),
            RunOptions {
                dry_run,
                interactive: false,
            },
            &AssumeYes,
            &CancelFlag::new(),
        )
        .await
        .expect("cleanup run")
    }

    async fn insert_named(&self, table: &str, name: &str, age_hours: i32) -> Uuid {
        sqlx::query_scalar(&format!(
            "INSERT INTO {table} (name, created_at) \
             VALUES ($1, now() - make_interval(hours => $2)) RETURNING id"
        ))
        .bind(name)
        .bind(age_hours)
        .fetch_one(&self.pool)
        .await
        .expect("insert named row")
    }

    async fn insert_right(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        company: Uuid,
        age_hours: i32,
    ) -> Uuid {
        sqlx::query_scalar(
            "INSERT INTO broadcast_rights \
             (entity_type, entity_id, broadcast_company_id, territory, created_at) \
             VALUES ($1, $2, $3, 'National', now() - make_interval(hours => $4)) RETURNING id",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(company)
        .bind(age_hours)
        .fetch_one(&self.pool)
        .await
        .expect("insert broadcast right")
    }

    async fn insert_team(&self, league: Uuid, name: &str) -> Uuid {
        sqlx::query_scalar("INSERT INTO teams (league_id, name) VALUES ($1, $2) RETURNING id")
            .bind(league)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .expect("insert team")
    }

    async fn team_league(&self, team: Uuid) -> Uuid {
        sqlx::query_scalar("SELECT league_id FROM teams WHERE id = $1")
            .bind(team)
            .fetch_one(&self.pool)
            .await
            .expect("team league")
    }

    async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .expect("count rows")
    }
}

fn assert_clean(report: &CleanupReport) {
    assert!(
        report.errors.is_empty(),
        "unexpected errors: {:?}",
        report.errors
    );
    assert!(report.success);
}

#[tokio::test]
async fn duplicate_league_keeps_the_earliest_row() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let keep = db.insert_named("leagues", "NFL League", 3).await;
    let dup = db.insert_named("leagues", "NFL League", 2).await;
    db.insert_named("leagues", "NFL", 1).await;

    let report = db.run(false).await;
    assert_clean(&report);
    assert_eq!(report.duplicates_found["leagues"], 1);
    assert_eq!(report.duplicate_groups["leagues"], 1);
    assert_eq!(report.duplicates_removed["leagues"], 1);

    let survivors: Vec<(Uuid, String)> =
        sqlx::query_as("SELECT id, name FROM leagues ORDER BY name")
            .fetch_all(&db.pool)
            .await
            .unwrap();
    assert_eq!(survivors.len(), 2);
    assert_eq!(survivors[0].1, "NFL");
    assert_eq!(survivors[1], (keep, "NFL League".to_string()));
    assert!(survivors.iter().all(|(id, _)| *id != dup));

    db.teardown().await;
}

#[tokio::test]
async fn dependents_follow_the_surviving_row() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let keep = db.insert_named("leagues", "AFC", 5).await;
    let dup = db.insert_named("leagues", "AFC", 4).await;
    let team = db.insert_team(dup, "Chiefs").await;
    let espn = db.insert_named("broadcast_companies", "ESPN", 5).await;
    let right = db.insert_right("league", dup, espn, 1).await;

    let report = db.run(false).await;
    assert_clean(&report);
    assert_eq!(report.duplicates_removed["leagues"], 1);

    assert_eq!(db.team_league(team).await, keep);
    let entity_id: Uuid =
        sqlx::query_scalar("SELECT entity_id FROM broadcast_rights WHERE id = $1")
            .bind(right)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(entity_id, keep);

    db.teardown().await;
}

#[tokio::test]
async fn null_divisions_group_together_in_broadcast_rights() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let league = db.insert_named("leagues", "MLS", 5).await;
    let espn = db.insert_named("broadcast_companies", "ESPN", 5).await;
    db.insert_right("league", league, espn, 2).await;
    db.insert_right("league", league, espn, 1).await;

    let report = db.run(true).await;
    assert_eq!(report.duplicates_found["broadcast_rights"], 1);
    assert_eq!(report.duplicate_groups["broadcast_rights"], 1);
    assert_eq!(report.duplicate_samples["broadcast_rights"].len(), 1);
    assert_eq!(db.count("broadcast_rights").await, 2);

    let applied = db.run(false).await;
    assert_clean(&applied);
    assert_eq!(applied.duplicates_removed["broadcast_rights"], 1);
    assert_eq!(db.count("broadcast_rights").await, 1);

    db.teardown().await;
}

#[tokio::test]
async fn second_apply_finds_nothing() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let league = db.insert_named("leagues", "NBA", 9).await;
    db.insert_named("leagues", "NBA", 8).await;
    for age in [3, 2, 1] {
        sqlx::query(
            "INSERT INTO teams (league_id, name, created_at) \
             VALUES ($1, 'Celtics', now() - make_interval(hours => $2))",
        )
        .bind(league)
        .bind(age)
        .execute(&db.pool)
        .await
        .unwrap();
    }

    let first = db.run(false).await;
    assert_clean(&first);
    assert_eq!(first.duplicates_removed["leagues"], 1);
    assert_eq!(first.duplicates_removed["teams"], 2);

    let second = db.run(false).await;
    assert_clean(&second);
    assert!(second.duplicates_found.values().all(|n| *n == 0));
    assert!(second.duplicates_removed.values().all(|n| *n == 0));
    assert!(second.constraints_added.is_empty());
    assert_eq!(second.constraints_skipped.len(), first.constraints_added.len());

    db.teardown().await;
}

#[tokio::test]
async fn dry_run_leaves_every_table_untouched() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    for (name, copies) in [("Serie A", 2), ("La Liga", 2), ("Ligue 1", 3)] {
        for age in 0..copies {
            db.insert_named("leagues", name, age + 1).await;
        }
    }
    for name in ["Nike", "Adidas"] {
        db.insert_named("brands", name, 2).await;
        db.insert_named("brands", name, 1).await;
    }
    db.insert_named("broadcast_companies", "Fox  Sports", 1).await;
    let leagues_before = db.count("leagues").await;
    let brands_before = db.count("brands").await;

    let report = db.run(true).await;
    assert_clean(&report);
    assert!(report.dry_run);
    assert_eq!(report.duplicate_groups.values().sum::<u64>(), 5);
    assert_eq!(report.duplicates_found["leagues"], 4);
    assert_eq!(report.duplicates_found["brands"], 2);
    assert!(report.duplicates_removed.is_empty());
    assert_eq!(report.names_standardized["broadcast_companies"], 1);
    assert!(report.constraints_added.is_empty());
    assert_eq!(
        report.constraints_pending.len(),
        SchemaCatalog::builtin().constraints.len()
    );

    assert_eq!(db.count("leagues").await, leagues_before);
    assert_eq!(db.count("brands").await, brands_before);
    let fox: String = sqlx::query_scalar("SELECT name FROM broadcast_companies")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(fox, "Fox  Sports");

    db.teardown().await;
}

#[tokio::test]
async fn constraint_ensure_adds_once_then_skips() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let spec = ConstraintSpec::new("brands", "uq_brands_name", "UNIQUE (name)");

    assert_eq!(
        constraints::ensure(&db.pool, &spec, true).await.unwrap(),
        ConstraintOutcome::WouldAdd
    );
    assert_eq!(
        constraints::ensure(&db.pool, &spec, false).await.unwrap(),
        ConstraintOutcome::Added
    );
    assert_eq!(
        constraints::ensure(&db.pool, &spec, false).await.unwrap(),
        ConstraintOutcome::Skipped
    );
    assert!(constraints::constraint_exists(&db.pool, &spec).await.unwrap());

    db.teardown().await;
}

#[tokio::test]
async fn failing_constraint_is_recorded_and_the_run_continues() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let mut catalog = SchemaCatalog::builtin();
    catalog.constraints.insert(
        0,
        ConstraintSpec::new("brands", "ck_brands_impossible", "CHECK (name <> name)"),
    );
    db.insert_named("brands", "Puma", 1).await;

    let report = run_cleanup(
        &db.pool,
        &catalog,
        RunOptions::default(),
        &AssumeYes,
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    assert!(!report.success);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].table.as_deref(), Some("brands"));
    assert!(report.constraints_added.contains(&"uq_brands_name".to_string()));
    assert!(report.integrity_issues.contains_key("teams_orphaned_league"));

    db.teardown().await;
}

#[tokio::test]
async fn standardization_skips_colliding_names() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    db.insert_named("broadcast_companies", "ESPN", 3).await;
    let inc = db.insert_named("broadcast_companies", "ESPN, Inc.", 2).await;
    db.insert_named("broadcast_companies", "Fox  Sports ", 1).await;

    let catalog = SchemaCatalog::builtin();
    let rules = catalog.rules_for("broadcast_companies");
    let outcome = standardize::standardize(&db.pool, "broadcast_companies", &rules, false)
        .await
        .unwrap();
    assert_eq!(outcome.fixed, 2);
    assert_eq!(outcome.collisions, 1);
    assert!(outcome.failed_rules.is_empty());

    let name: String = sqlx::query_scalar("SELECT name FROM broadcast_companies WHERE id = $1")
        .bind(inc)
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(name, "ESPN, Inc.");
    let fox: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM broadcast_companies WHERE name = 'Fox Sports'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(fox, 1);

    db.teardown().await;
}

#[tokio::test]
async fn team_without_division_gets_the_earliest_in_its_league() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let league = db.insert_named("leagues", "NHL", 9).await;
    let mut divisions = Vec::new();
    for (name, age) in [("Atlantic", 5), ("Metropolitan", 4)] {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO division_conferences (league_id, name, created_at) \
             VALUES ($1, $2, now() - make_interval(hours => $3)) RETURNING id",
        )
        .bind(league)
        .bind(name)
        .bind(age)
        .fetch_one(&db.pool)
        .await
        .unwrap();
        divisions.push(id);
    }
    let team = db.insert_team(league, "Bruins").await;

    let catalog = SchemaCatalog::builtin();
    let task = catalog
        .repairs
        .iter()
        .find(|t| t.name == "teams_missing_division")
        .unwrap();

    let preview = repair::repair(&db.pool, &catalog, task, true).await.unwrap();
    assert_eq!(preview.count, 1);
    assert_eq!(preview.sample[0].id, team);
    assert_eq!(preview.sample[0].label.as_deref(), Some("Bruins"));

    let applied = repair::repair(&db.pool, &catalog, task, false).await.unwrap();
    assert_eq!(applied.count, 1);
    let division: Option<Uuid> =
        sqlx::query_scalar("SELECT division_conference_id FROM teams WHERE id = $1")
            .bind(team)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(division, Some(divisions[0]));

    let again = repair::repair(&db.pool, &catalog, task, false).await.unwrap();
    assert_eq!(again.count, 0);

    db.teardown().await;
}

#[tokio::test]
async fn integrity_findings_are_reported_without_failing() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let espn = db.insert_named("broadcast_companies", "ESPN", 2).await;
    let right = db.insert_right("team", Uuid::new_v4(), espn, 1).await;
    sqlx::query(
        "UPDATE broadcast_rights SET start_date = '2025-01-01', end_date = '2024-01-01' \
         WHERE id = $1",
    )
    .bind(right)
    .execute(&db.pool)
    .await
    .unwrap();

    let report = db.run(true).await;
    assert_clean(&report);
    let orphans = &report.integrity_issues["broadcast_rights_orphaned_team"];
    assert_eq!(orphans.count, 1);
    assert_eq!(orphans.sample[0].id, right);
    let dates = &report.integrity_issues["broadcast_rights_invalid_date_range"];
    assert_eq!(dates.count, 1);
    assert_eq!(dates.sample[0].detail.as_deref(), Some("2025-01-01 > 2024-01-01"));
    assert_eq!(report.integrity_issues["teams_orphaned_league"].count, 0);

    db.teardown().await;
}

#[tokio::test]
async fn failed_group_is_rolled_back_and_siblings_commit() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    sqlx::query("CREATE UNIQUE INDEX ux_teams_league_name ON teams (league_id, name)")
        .execute(&db.pool)
        .await
        .unwrap();
    let keep_a = db.insert_named("leagues", "A", 6).await;
    let dup_a = db.insert_named("leagues", "A", 5).await;
    let kept_team = db.insert_team(keep_a, "X").await;
    let moved_team = db.insert_team(dup_a, "X").await;
    let keep_b = db.insert_named("leagues", "B", 4).await;
    let dup_b = db.insert_named("leagues", "B", 3).await;
    let b_team = db.insert_team(dup_b, "Y").await;

    let catalog = SchemaCatalog::builtin();
    let spec = catalog.table("leagues").unwrap();
    let groups = detect::find_duplicates(&db.pool, spec).await.unwrap();
    assert_eq!(groups.len(), 2);

    let outcome = dedup::remove_duplicates(&db.pool, &catalog, spec, &groups)
        .await
        .unwrap();
    assert_eq!(outcome.removed, 1);
    assert_eq!(outcome.failed_groups.len(), 1);
    assert_eq!(outcome.failed_groups[0].0, keep_a);

    let leagues: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM leagues ORDER BY created_at")
        .fetch_all(&db.pool)
        .await
        .unwrap();
    assert_eq!(leagues, vec![keep_a, dup_a, keep_b]);
    assert_eq!(db.team_league(kept_team).await, keep_a);
    assert_eq!(db.team_league(moved_team).await, dup_a);
    assert_eq!(db.team_league(b_team).await, keep_b);

    db.teardown().await;
}

#[tokio::test]
async fn word_boundary_rule_agrees_between_dry_run_and_apply() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    let acme = db.insert_named("brands", "Acme Inc", 1).await;
    let rule = StandardizationRule::new("brands", r"\bInc\b", "Incorporated");

    let preview = standardize::standardize(&db.pool, "brands", &[&rule], true)
        .await
        .unwrap();
    assert_eq!(preview.fixed, 1);

    let applied = standardize::standardize(&db.pool, "brands", &[&rule], false)
        .await
        .unwrap();
    assert_eq!(applied.fixed, preview.fixed);
    assert!(applied.failed_rules.is_empty());

    let name: String = sqlx::query_scalar("SELECT name FROM brands WHERE id = $1")
        .bind(acme)
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(name, "Acme Incorporated");

    db.teardown().await;
}

#[tokio::test]
async fn reused_constraint_names_do_not_leak_dependents() {
    let Some(db) = TestDb::connect().await else {
        return;
    };
    sqlx::raw_sql(
        "CREATE TABLE sponsorships (id uuid PRIMARY KEY DEFAULT gen_random_uuid(), brand_id uuid, \
             CONSTRAINT owner_fk FOREIGN KEY (brand_id) REFERENCES brands (id)); \
         CREATE TABLE venues (id uuid PRIMARY KEY DEFAULT gen_random_uuid(), team_id uuid, \
             CONSTRAINT owner_fk FOREIGN KEY (team_id) REFERENCES teams (id));",
    )
    .execute(&db.pool)
    .await
    .unwrap();

    let catalog = SchemaCatalog::builtin();
    let brands = rewrite::discover_dependents(&db.pool, &catalog, "brands")
        .await
        .unwrap();
    assert_eq!(
        brands,
        vec![rewrite::Dependent::ForeignKey {
            table: "sponsorships".into(),
            column: "brand_id".into(),
        }]
    );

    let teams = rewrite::discover_dependents(&db.pool, &catalog, "teams")
        .await
        .unwrap();
    assert!(teams.contains(&rewrite::Dependent::ForeignKey {
        table: "venues".into(),
        column: "team_id".into(),
    }));
    assert!(teams.iter().all(|dep| dep.table() != "sponsorships"));

    db.teardown().await;
}
