//! End-to-end retention runs.
//!
//! Each scenario seeds a datastore with the collections of the
//! `connection_cleanup` preset, runs [`run_once`] at a fixed clock and checks
//! both the datastore afterwards and the report on disk.
//!
//! Scenarios that only need the [`DocumentStore`] trait are shared between
//! backends; the ones that need injected faults run against the memory store
//! only.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};
use rstest::rstest;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::{
    config::{PlanConfig, PlanDefinition, PlanPreset, RetentionConfig, RetentionSafety},
    db::{
        DocumentStore, MemoryStore,
        tests::harness::{create_memory_store, seed},
    },
    models::Filter,
    retention::{RetentionError, RunFailure, RunOptions, RunStats, run_once},
};

// =============================================================================
// Fixtures
// =============================================================================

const CONNECTIONS: &str = "Organization.Connections";
const USERS: &str = "users";
const ORGANIZATIONS: &str = "Organization.Organizations";
const AUTH: &str = "Unilogin.Auth";
const PAGES: &str = "Page.Pages";
const ACCESS: &str = "Access.Access";
const UNILOGINS: &str = "unilogins";

const ALL_COLLECTIONS: [&str; 7] = [
    CONNECTIONS,
    USERS,
    ORGANIZATIONS,
    AUTH,
    PAGES,
    ACCESS,
    UNILOGINS,
];

fn connection_plan() -> PlanDefinition {
    PlanConfig {
        preset: Some(PlanPreset::ConnectionCleanup),
        ..Default::default()
    }
    .resolve()
    .unwrap()
}

/// After the default 07-07 cutoff.
fn summer() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 10, 3, 0, 0).unwrap()
}

/// Before the default cutoff.
fn early_july() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 3, 0, 0).unwrap()
}

fn connection(id: &str, endyear: i64, character: &str, org: &str, method: i64) -> Value {
    json!({
        "_id": id,
        "endyear": endyear,
        "characterid": character,
        "organization": { "id": org },
        "method": method,
    })
}

/// A membership and every denormalized copy of it.
async fn seed_membership(store: &dyn DocumentStore, conn: Value) {
    let id = conn["_id"].clone();
    let character = conn["characterid"].clone();
    let org = conn["organization"]["id"].clone();

    seed(store, CONNECTIONS, vec![conn]).await;
    seed(
        store,
        USERS,
        vec![json!({ "id": character, "institutionconnections": [org, "other-org"] })],
    )
    .await;
    seed(store, ORGANIZATIONS, vec![json!({ "id": org, "connections": [id] })]).await;
    seed(store, AUTH, vec![json!({ "userid": character, "token": "t" })]).await;
    seed(
        store,
        PAGES,
        vec![json!({ "organization": { "id": org }, "allowedUsers": [character, "someone-else"] })],
    )
    .await;
    seed(
        store,
        ACCESS,
        vec![json!({ "characterid": character, "organization": { "id": org } })],
    )
    .await;
    seed(store, UNILOGINS, vec![json!({ "userid": character })]).await;
}

async fn create_all(store: &dyn DocumentStore) {
    for name in ALL_COLLECTIONS {
        store.create_collection(name).await.unwrap();
    }
}

struct Run {
    report_dir: TempDir,
    config: RetentionConfig,
}

impl Run {
    fn new(safety: RetentionSafety) -> Self {
        let report_dir = tempfile::tempdir().unwrap();
        let config = RetentionConfig {
            report_path: report_dir.path().join("report.txt"),
            safety,
            ..Default::default()
        };
        Self { report_dir, config }
    }

    fn with_batch_size(batch_size: u32) -> Self {
        Self::new(RetentionSafety {
            batch_size,
            batch_delay_ms: 0,
            ..Default::default()
        })
    }

    async fn execute(
        &self,
        store: Arc<dyn DocumentStore>,
        now: DateTime<Utc>,
    ) -> Result<RunStats, RunFailure> {
        let options = RunOptions {
            now: Some(now),
            ..Default::default()
        };
        run_once(store, &self.config, &connection_plan(), options).await
    }

    fn report(&self) -> String {
        std::fs::read_to_string(self.report_dir.path().join("report.txt")).unwrap()
    }

    fn detail_lines(&self) -> Vec<String> {
        self.report()
            .split("\n\n")
            .nth(1)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

async fn count(store: &dyn DocumentStore, collection: &str, field: &str, value: Value) -> u64 {
    store
        .count(collection, &Filter::new().eq(field, value))
        .await
        .unwrap()
}

async fn get(store: &dyn DocumentStore, collection: &str, field: &str, value: Value) -> Value {
    let doc = store
        .find_one(collection, &Filter::new().eq(field, value))
        .await
        .unwrap()
        .expect("document should exist");
    Value::Object(doc)
}

fn assert_counts_add_up(stats: &RunStats) {
    assert_eq!(
        stats.processed,
        stats.retired + stats.failed + stats.skipped,
        "processed must equal retired + failed + skipped: {stats:?}"
    );
}

// =============================================================================
// Shared scenarios
// =============================================================================

async fn test_retires_expired_and_cascades(store: Arc<dyn DocumentStore>) {
    let s = store.as_ref();
    create_all(s).await;
    seed_membership(s, connection("c1", 2022, "ch1", "o1", 1)).await;
    seed_membership(s, connection("c2", 2025, "ch2", "o2", 1)).await;
    seed_membership(s, connection("c3", 2024, "ch3", "o3", 2)).await;

    let run = Run::with_batch_size(10);
    let stats = run.execute(Arc::clone(&store), summer()).await.unwrap();

    assert_eq!(stats.processed, 3);
    assert_eq!(stats.retired, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failed, 0);
    assert!(!stats.incomplete);
    assert_counts_add_up(&stats);

    // c1: every denormalized copy is gone, including the unilogin (method 1)
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c1")).await, 0);
    assert_eq!(
        get(s, USERS, "id", json!("ch1")).await["institutionconnections"],
        json!(["other-org"])
    );
    assert_eq!(
        get(s, ORGANIZATIONS, "id", json!("o1")).await["connections"],
        json!([])
    );
    assert_eq!(count(s, AUTH, "userid", json!("ch1")).await, 0);
    assert_eq!(
        get(s, PAGES, "organization.id", json!("o1")).await["allowedUsers"],
        json!(["someone-else"])
    );
    assert_eq!(count(s, ACCESS, "characterid", json!("ch1")).await, 0);
    assert_eq!(count(s, UNILOGINS, "userid", json!("ch1")).await, 0);

    // c3: retired, but the unilogin guard (method == 1) did not hold
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c3")).await, 0);
    assert_eq!(count(s, UNILOGINS, "userid", json!("ch3")).await, 1);

    // c2: untouched
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c2")).await, 1);
    assert_eq!(count(s, ACCESS, "characterid", json!("ch2")).await, 1);

    let report = run.report();
    assert!(report.starts_with("Retention report: connection_cleanup\n"));
    assert!(report.contains("Processed: 3\n"));
    assert!(report.contains("Status: complete\n"));
    assert_eq!(
        run.detail_lines(),
        vec![
            "RETIRED: Entity ID c1",
            "SKIPPED: Entity ID c2 - Reason: does not meet retirement criteria",
            "RETIRED: Entity ID c3",
        ]
    );
}

async fn test_current_year_waits_for_cutoff(store: Arc<dyn DocumentStore>) {
    let s = store.as_ref();
    create_all(s).await;
    seed_membership(s, connection("c3", 2024, "ch3", "o3", 1)).await;

    let run = Run::with_batch_size(10);
    let stats = run.execute(Arc::clone(&store), early_july()).await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c3")).await, 1);

    let stats = run.execute(Arc::clone(&store), summer()).await.unwrap();
    assert_eq!(stats.retired, 1);
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c3")).await, 0);
}

async fn test_failing_step_rolls_back_only_that_entity(store: Arc<dyn DocumentStore>) {
    let s = store.as_ref();
    create_all(s).await;
    seed_membership(s, connection("c1", 2022, "ch1", "o1", 1)).await;
    seed_membership(s, connection("c4", 2022, "ch4", "o4", 1)).await;
    // Step 5 pulls from `allowedUsers`, which is not an array for o4.
    seed(
        s,
        PAGES,
        vec![json!({ "organization": { "id": "o4" }, "allowedUsers": "ch4" })],
    )
    .await;

    let run = Run::with_batch_size(10);
    let stats = run.execute(Arc::clone(&store), summer()).await.unwrap();

    assert_eq!(stats.retired, 1);
    assert_eq!(stats.failed, 1);
    assert_counts_add_up(&stats);

    // Steps 1-4 for c4 were rolled back with step 5.
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c4")).await, 1);
    assert_eq!(
        get(s, USERS, "id", json!("ch4")).await["institutionconnections"],
        json!(["o4", "other-org"])
    );
    assert_eq!(
        get(s, ORGANIZATIONS, "id", json!("o4")).await["connections"],
        json!(["c4"])
    );
    assert_eq!(count(s, AUTH, "userid", json!("ch4")).await, 1);

    assert_eq!(count(s, CONNECTIONS, "_id", json!("c1")).await, 0);

    let lines = run.detail_lines();
    assert_eq!(lines[0], "RETIRED: Entity ID c1");
    assert!(
        lines[1].starts_with("FAILED: Entity ID c4 - Reason: step 5 (pull_reference on 'Page.Pages')"),
        "unexpected line: {}",
        lines[1]
    );
}

async fn test_rerun_is_idempotent(store: Arc<dyn DocumentStore>) {
    let s = store.as_ref();
    create_all(s).await;
    seed_membership(s, connection("c1", 2022, "ch1", "o1", 1)).await;
    seed_membership(s, connection("c2", 2021, "ch2", "o2", 2)).await;

    let run = Run::with_batch_size(1);
    let first = run.execute(Arc::clone(&store), summer()).await.unwrap();
    assert_eq!(first.retired, 2);

    let second = run.execute(Arc::clone(&store), summer()).await.unwrap();
    assert_eq!(second, RunStats::default());
    assert!(run.report().contains("Processed: 0\n"));
}

async fn test_missing_collections_abort_before_processing(store: Arc<dyn DocumentStore>) {
    let s = store.as_ref();
    seed_membership(s, connection("c1", 2022, "ch1", "o1", 1)).await;

    // Every collection exists except the ones the access alias now points at.
    let run = Run::with_batch_size(10);
    let plan = PlanConfig {
        preset: Some(PlanPreset::ConnectionCleanup),
        collections: [(
            "Access.Access".to_string(),
            vec!["Access.Grants".to_string(), "accesses".to_string()],
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    }
    .resolve()
    .unwrap();
    let options = RunOptions {
        now: Some(summer()),
        ..Default::default()
    };

    let failure = run_once(Arc::clone(&store), &run.config, &plan, options)
        .await
        .unwrap_err();
    match &failure.error {
        RetentionError::MissingCollections(missing) => {
            assert_eq!(missing, &vec!["Access.Grants | accesses".to_string()]);
        }
        other => panic!("expected MissingCollections, got {other:?}"),
    }
    assert_eq!(failure.stats.processed, 0);
    assert!(failure.stats.incomplete);

    assert_eq!(count(s, CONNECTIONS, "_id", json!("c1")).await, 1);
    let report = run.report();
    assert!(report.contains("Processed: 0\n"));
    assert!(report.contains("Status: incomplete\n"));
}

async fn test_dry_run_writes_nothing(store: Arc<dyn DocumentStore>) {
    let s = store.as_ref();
    create_all(s).await;
    seed_membership(s, connection("c1", 2022, "ch1", "o1", 1)).await;

    let run = Run::new(RetentionSafety {
        dry_run: true,
        batch_delay_ms: 0,
        ..Default::default()
    });
    let stats = run.execute(Arc::clone(&store), summer()).await.unwrap();

    assert_eq!(stats.skipped, 1);
    assert!(stats.records_affected.is_empty());
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c1")).await, 1);
    assert_eq!(count(s, UNILOGINS, "userid", json!("ch1")).await, 1);
    assert_eq!(
        run.detail_lines(),
        vec!["SKIPPED: Entity ID c1 - Reason: dry run: eligible for retirement"]
    );
}

async fn test_single_entity_run(store: Arc<dyn DocumentStore>) {
    let s = store.as_ref();
    create_all(s).await;
    seed_membership(s, connection("c1", 2022, "ch1", "o1", 1)).await;
    seed_membership(s, connection("c2", 2022, "ch2", "o2", 1)).await;

    let run = Run::with_batch_size(10);
    let options = RunOptions {
        now: Some(summer()),
        entity: Some("c2".to_string()),
        ..Default::default()
    };
    let stats = run_once(Arc::clone(&store), &run.config, &connection_plan(), options)
        .await
        .unwrap();

    assert_eq!(stats.processed, 1);
    assert_eq!(stats.retired, 1);
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c1")).await, 1);
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c2")).await, 0);

    let options = RunOptions {
        now: Some(summer()),
        entity: Some("missing".to_string()),
        ..Default::default()
    };
    let failure = run_once(Arc::clone(&store), &run.config, &connection_plan(), options)
        .await
        .unwrap_err();
    assert!(matches!(failure.error, RetentionError::EntityNotFound(_)));
}

macro_rules! backend_tests {
    ($create:expr) => {
        #[tokio::test]
        async fn retires_expired_and_cascades() {
            super::test_retires_expired_and_cascades($create).await;
        }

        #[tokio::test]
        async fn current_year_waits_for_cutoff() {
            super::test_current_year_waits_for_cutoff($create).await;
        }

        #[tokio::test]
        async fn failing_step_rolls_back_only_that_entity() {
            super::test_failing_step_rolls_back_only_that_entity($create).await;
        }

        #[tokio::test]
        async fn rerun_is_idempotent() {
            super::test_rerun_is_idempotent($create).await;
        }

        #[tokio::test]
        async fn missing_collections_abort_before_processing() {
            super::test_missing_collections_abort_before_processing($create).await;
        }

        #[tokio::test]
        async fn dry_run_writes_nothing() {
            super::test_dry_run_writes_nothing($create).await;
        }

        #[tokio::test]
        async fn single_entity_run() {
            super::test_single_entity_run($create).await;
        }
    };
}

mod memory {
    use super::*;

    backend_tests!(Arc::new(create_memory_store()) as Arc<dyn DocumentStore>);
}

#[cfg(feature = "database-sqlite")]
mod sqlite {
    use super::*;
    use crate::db::tests::harness::create_sqlite_store;

    backend_tests!(Arc::new(create_sqlite_store().await) as Arc<dyn DocumentStore>);
}

// =============================================================================
// Memory-only scenarios (fault injection, pacing)
// =============================================================================

async fn seeded_memory(connections: usize) -> MemoryStore {
    let store = create_memory_store();
    create_all(&store).await;
    for i in 0..connections {
        seed_membership(
            &store,
            connection(&format!("c{i}"), 2020, &format!("ch{i}"), &format!("o{i}"), 2),
        )
        .await;
    }
    store
}

#[tokio::test]
async fn test_write_failure_on_last_step_leaves_entity_intact() {
    let store = create_memory_store();
    create_all(&store).await;
    seed_membership(&store, connection("c1", 2022, "ch1", "o1", 1)).await;
    seed_membership(&store, connection("c2", 2022, "ch2", "o2", 2)).await;
    store.fail_writes_to(UNILOGINS);

    let run = Run::with_batch_size(10);
    let stats = run
        .execute(Arc::new(store.clone()), summer())
        .await
        .unwrap();

    // c1 reaches the guarded unilogins step and fails there; c2 omits it.
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retired, 1);
    assert_counts_add_up(&stats);

    let s: &dyn DocumentStore = &store;
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c1")).await, 1);
    assert_eq!(count(s, AUTH, "userid", json!("ch1")).await, 1);
    assert_eq!(count(s, ACCESS, "characterid", json!("ch1")).await, 1);
    assert_eq!(
        get(s, PAGES, "organization.id", json!("o1")).await["allowedUsers"],
        json!(["ch1", "someone-else"])
    );
    assert_eq!(count(s, CONNECTIONS, "_id", json!("c2")).await, 0);

    let lines = run.detail_lines();
    assert!(lines[0].starts_with("FAILED: Entity ID c1 - Reason: step 7 (hard_delete on 'unilogins')"));
    assert_eq!(lines[1], "RETIRED: Entity ID c2");
}

#[tokio::test]
async fn test_cursor_failure_keeps_partial_report() {
    let store = seeded_memory(5).await;
    store.fail_pages_after(1);

    let run = Run::with_batch_size(2);
    let failure = run
        .execute(Arc::new(store.clone()), summer())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, RetentionError::Cursor { .. }));
    assert_eq!(failure.stats.processed, 2);
    assert_eq!(failure.stats.retired, 2);
    assert!(failure.stats.incomplete);

    let report = run.report();
    assert!(report.contains("Processed: 2\n"));
    assert!(report.contains("Status: incomplete\n"));
    assert_eq!(
        run.detail_lines(),
        vec!["RETIRED: Entity ID c0", "RETIRED: Entity ID c1"]
    );

    // Retired entities stay retired; the rest are untouched.
    assert_eq!(store.snapshot(CONNECTIONS).await.len(), 3);
}

#[tokio::test]
async fn test_report_write_failure_does_not_fail_run() {
    let store = seeded_memory(1).await;
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the report's parent directory should be.
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();

    let config = RetentionConfig {
        report_path: blocker.join("report.txt"),
        safety: RetentionSafety {
            batch_delay_ms: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let options = RunOptions {
        now: Some(summer()),
        ..Default::default()
    };
    let stats = run_once(Arc::new(store), &config, &connection_plan(), options)
        .await
        .unwrap();
    assert_eq!(stats.retired, 1);
}

#[rstest]
#[case::exact_window(3, 3, 1)]
#[case::one_past_window(3, 4, 2)]
#[case::two_windows(3, 6, 2)]
#[case::smaller_than_window(3, 1, 1)]
#[case::empty(3, 0, 0)]
#[tokio::test]
async fn test_batch_boundaries(
    #[case] batch_size: u32,
    #[case] population: usize,
    #[case] expected_batches: u64,
) {
    let store = seeded_memory(population).await;

    let run = Run::with_batch_size(batch_size);
    let stats = run.execute(Arc::new(store.clone()), summer()).await.unwrap();

    assert_eq!(stats.batches, expected_batches);
    assert_eq!(stats.processed, population as u64);
    assert_eq!(stats.retired, population as u64);
    assert_counts_add_up(&stats);
    assert!(store.snapshot(CONNECTIONS).await.is_empty());
}

#[tokio::test]
async fn test_batch_delay_paces_full_windows() {
    let store = seeded_memory(5).await;
    let delay = Duration::from_millis(40);

    let run = Run::new(RetentionSafety {
        batch_size: 2,
        batch_delay_ms: delay.as_millis() as u64,
        ..Default::default()
    });
    let started = Instant::now();
    let stats = run.execute(Arc::new(store), summer()).await.unwrap();
    let elapsed = started.elapsed();

    // Windows of 2, 2, 1: the two full ones are each followed by a pause.
    assert_eq!(stats.batches, 3);
    assert!(
        elapsed >= delay * (stats.batches as u32 - 1),
        "elapsed {elapsed:?} is shorter than the required pauses"
    );
}

#[tokio::test]
async fn test_entity_limit_marks_report_incomplete() {
    let store = seeded_memory(4).await;

    let run = Run::new(RetentionSafety {
        batch_size: 10,
        batch_delay_ms: 0,
        max_entities_per_run: 3,
        ..Default::default()
    });
    let stats = run.execute(Arc::new(store.clone()), summer()).await.unwrap();

    assert_eq!(stats.processed, 3);
    assert!(stats.incomplete);
    assert!(run.report().contains("Status: incomplete\n"));
    assert_eq!(store.snapshot(CONNECTIONS).await.len(), 1);
}

#[tokio::test]
async fn test_soft_deleted_entities_are_skipped_on_rerun() {
    let store = create_memory_store();
    seed(
        &store,
        "users",
        vec![
            json!({ "id": "u1", "endyear": 2020 }),
            json!({ "id": "u2", "endyear": 2030 }),
        ],
    )
    .await;
    seed(&store, "identifications", vec![json!({ "userId": "u1" })]).await;

    let plan: PlanConfig = toml::from_str(
        r#"
        name = "soft_users"
        collection = "users"

        [[steps]]
        collection = "users"
        match = { "id" = "{{id}}" }
        action = { type = "soft_delete", set = { "isdeleted" = true, "deletedat" = "{{now}}" } }

        [[steps]]
        collection = "identifications"
        match = { "userId" = "{{id}}" }
        action = { type = "hard_delete" }
    "#,
    )
    .unwrap();
    let plan = plan.resolve().unwrap();

    let run = Run::with_batch_size(10);
    let options = || RunOptions {
        now: Some(summer()),
        ..Default::default()
    };

    let first = run_once(Arc::new(store.clone()), &run.config, &plan, options())
        .await
        .unwrap();
    assert_eq!(first.retired, 1);
    assert_eq!(store.snapshot("users").await[0]["isdeleted"], json!(true));
    assert!(store.snapshot("identifications").await.is_empty());

    let second = run_once(Arc::new(store.clone()), &run.config, &plan, options())
        .await
        .unwrap();
    assert_eq!(second.retired, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(
        run.detail_lines(),
        vec![
            "SKIPPED: Entity ID u1 - Reason: already retired",
            "SKIPPED: Entity ID u2 - Reason: does not meet retirement criteria",
        ]
    );
}

#[test]
fn test_soft_delete_plan_without_marker_cannot_run() {
    // Without a literal marker a rerun has nothing to recognize retired
    // users by, so the plan is refused before any run starts.
    let plan: PlanConfig = toml::from_str(
        r#"
        name = "soft_users"
        collection = "users"

        [[steps]]
        collection = "users"
        match = { "id" = "{{id}}" }
        action = { type = "soft_delete", set = { "deletedat" = "{{now}}" } }
    "#,
    )
    .unwrap();
    let err = plan.resolve().unwrap_err();
    assert!(matches!(err, crate::config::ConfigError::Validation(_)));
    assert!(err.to_string().contains("step 1"));
}
