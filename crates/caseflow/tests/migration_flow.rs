//! Full migration-run tests: orchestrator + executor + resilience + mocks.

use std::sync::Arc;
use std::time::Duration;

use caseflow::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use caseflow::provider::ProviderAdapter;
use caseflow::{
    Credentials, ErrorKind, MigrationOrchestrator, OperationStatus, ProviderRegistry, RunConfig,
    RunStatus, Selection, SessionManager,
};
use caseflow_testing::{fixtures, MockProvider};

struct Fixture {
    source: Arc<MockProvider>,
    target: Arc<MockProvider>,
    orchestrator: MigrationOrchestrator,
    checkpoints: Arc<MemoryCheckpointStore>,
}

fn fixture(source: MockProvider, target: MockProvider) -> Fixture {
    let source = Arc::new(source);
    let target = Arc::new(target);

    let providers = Arc::new(ProviderRegistry::new());
    providers.register(Arc::clone(&source) as _).unwrap();
    providers.register(Arc::clone(&target) as _).unwrap();

    let sessions = Arc::new(SessionManager::new());
    sessions.set_credentials(
        source.id(),
        Credentials::Bearer {
            token: "src-token".into(),
            expires_at: None,
        },
    );
    sessions.set_credentials(
        target.id(),
        Credentials::Bearer {
            token: "dst-token".into(),
            expires_at: None,
        },
    );

    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = MigrationOrchestrator::builder(providers, sessions)
        .checkpoint_store(Arc::clone(&checkpoints) as _)
        .build();

    Fixture {
        source,
        target,
        orchestrator,
        checkpoints,
    }
}

fn fast_config() -> RunConfig {
    let mut config = RunConfig::new("alpha", "beta");
    config.retry.base_ms = 1;
    config.retry.jitter = 0.0;
    config.item_parallelism = 1;
    config
}

#[tokio::test]
async fn full_migration_happy_path() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "Login works"))
            .with_case(fixtures::test_case("TC-2", "Checkout works"))
            .with_attachment(
                "TC-1",
                fixtures::attachment("ATT-1", "trace.log"),
                serde_json::json!({ "base64": "aGVsbG8=" }),
            ),
        MockProvider::target("beta"),
    );

    let run_id = f.orchestrator.start_run(fast_config()).await.unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.total, 2);
    assert_eq!(report.counters.succeeded, 2);
    assert_eq!(report.counters.failed, 0);
    assert!(report.failures_by_kind.is_empty());
    assert!(!report.auth_failures);
    assert!(!report.network_failures);

    // Two artifacts landed on the target, with a trace link each and the
    // attachment uploaded for TC-1.
    assert_eq!(f.target.created().len(), 2);
    assert_eq!(f.target.links().len(), 2);
    assert_eq!(f.target.call_count("upload_attachment"), 1);
    assert_eq!(f.source.call_count("get_attachment_content"), 1);

    // Outcomes carry target ids; checkpoint records match.
    let outcomes = f.orchestrator.get_item_outcomes(&run_id, 0, 10).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.status == OperationStatus::Success));
    assert!(outcomes.iter().all(|o| o.target_id.is_some()));

    let records = f.checkpoints.read_items(&run_id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == OperationStatus::Success));

    // Idempotency keys were attached to every create.
    for created in f.target.created() {
        assert!(created["idempotency_key"].is_string());
    }
}

#[tokio::test]
async fn per_item_failure_is_confined_to_the_item() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .with_case(fixtures::test_case("TC-2", "Two"))
            .with_case(fixtures::test_case("TC-3", "Three"))
            .failing("get_test_case", &[404]),
        MockProvider::target("beta"),
    );

    let run_id = f.orchestrator.start_run(fast_config()).await.unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!(report.counters.succeeded, 2);
    assert_eq!(report.counters.failed, 1);
    assert_eq!(report.failures_by_kind.get("not_found"), Some(&1));
    assert_eq!(f.target.created().len(), 2);

    let outcomes = f.orchestrator.get_item_outcomes(&run_id, 0, 10).unwrap();
    let failed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.status == OperationStatus::Failure)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].source_id, "TC-1");
    assert_eq!(failed[0].error_kind, Some(ErrorKind::NotFound));
    assert!(failed[0].message.is_some());
}

#[tokio::test]
async fn transient_target_failures_are_retried_per_item() {
    let f = fixture(
        MockProvider::source("alpha").with_case(fixtures::test_case("TC-1", "One")),
        MockProvider::target("beta").failing("create_test_case", &[503, 503]),
    );

    let run_id = f.orchestrator.start_run(fast_config()).await.unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(f.target.call_count("create_test_case"), 3);
    assert_eq!(f.target.created().len(), 1);
}

#[tokio::test]
async fn resume_skips_items_already_recorded_successful() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .with_case(fixtures::test_case("TC-2", "Two"))
            .with_case(fixtures::test_case("TC-3", "Three")),
        // Exhaust the default three attempts for the first created item.
        MockProvider::target("beta").failing("create_test_case", &[500, 500, 500]),
    );

    let run_id = f.orchestrator.start_run(fast_config()).await.unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!(report.counters.succeeded, 2);
    assert_eq!(report.counters.failed, 1);

    // Resume: the two successes are skipped, the failed item goes through.
    f.orchestrator.resume_run(&run_id).await.unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.total, 3);
    assert_eq!(report.counters.succeeded, 1);
    assert_eq!(report.counters.skipped, 2);
    assert_eq!(f.target.created().len(), 3);
}

#[tokio::test]
async fn resuming_an_unknown_run_fails() {
    let f = fixture(MockProvider::source("alpha"), MockProvider::target("beta"));
    assert!(f.orchestrator.resume_run("no-such-run").await.is_err());
}

#[tokio::test]
async fn cancellation_is_terminal_and_preserves_completed_outcomes() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .with_case(fixtures::test_case("TC-2", "Two"))
            .with_case(fixtures::test_case("TC-3", "Three")),
        MockProvider::target("beta").with_call_delay(Duration::from_millis(100)),
    );

    let run_id = f.orchestrator.start_run(fast_config()).await.unwrap();

    // Cancel once the first item has landed.
    loop {
        let report = f.orchestrator.get_status(&run_id).unwrap();
        if report.counters.succeeded >= 1 {
            break;
        }
        if report.finished_at.is_some() {
            panic!("run finished before cancellation: {report:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    f.orchestrator.cancel_run(&run_id).unwrap();
    // Cancellation is idempotent.
    f.orchestrator.cancel_run(&run_id).unwrap();

    let report = f.orchestrator.wait_for(&run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.counters.succeeded >= 1);
    assert!(f.orchestrator.get_status(&run_id).unwrap().finished_at.is_some());
}

#[tokio::test]
async fn compensation_deletes_created_artifacts_on_abort() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .with_case(fixtures::test_case("TC-2", "Two"))
            .with_case(fixtures::test_case("TC-3", "Three")),
        MockProvider::target("beta").with_call_delay(Duration::from_millis(100)),
    );

    let mut config = fast_config();
    config.compensate_on_abort = true;
    let run_id = f.orchestrator.start_run(config).await.unwrap();

    loop {
        let report = f.orchestrator.get_status(&run_id).unwrap();
        if report.counters.succeeded >= 1 {
            break;
        }
        if report.finished_at.is_some() {
            panic!("run finished before cancellation: {report:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    f.orchestrator.cancel_run(&run_id).unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);

    // Every success-recorded target artifact was deleted again.
    assert!(!f.target.deleted().is_empty());
    let records = f.checkpoints.read_items(&run_id).await.unwrap();
    let compensations: Vec<_> = records.iter().filter(|r| r.compensation).collect();
    assert!(!compensations.is_empty());
    let successes: Vec<_> = records
        .iter()
        .filter(|r| !r.compensation && r.status == OperationStatus::Success)
        .collect();
    assert_eq!(compensations.len(), successes.len());
}

#[tokio::test]
async fn selection_by_explicit_ids() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .with_case(fixtures::test_case("TC-2", "Two"))
            .with_case(fixtures::test_case("TC-3", "Three")),
        MockProvider::target("beta"),
    );

    let mut config = fast_config();
    config.selection = Selection::Ids(vec!["TC-2".into()]);
    let run_id = f.orchestrator.start_run(config).await.unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.total, 1);
    assert_eq!(f.target.created().len(), 1);
    assert_eq!(f.target.created()[0]["artifact"]["source_id"], "TC-2");
}

#[tokio::test]
async fn operation_timeout_surfaces_as_item_timeout_failure() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .with_call_delay(Duration::from_millis(200)),
        MockProvider::target("beta"),
    );

    let mut config = fast_config();
    // Request deadline below the mock's delay; one attempt only.
    config.request_timeout_ms = 20;
    config.retry.max_attempts = 1;
    let run_id = f.orchestrator.start_run(config).await.unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.network_failures);
    assert!(report.failures_by_kind.contains_key("timeout"));
}

#[tokio::test]
async fn auth_failures_are_flagged_in_the_report() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .failing("get_projects", &[401, 401]),
        MockProvider::target("beta"),
    );

    let run_id = f.orchestrator.start_run(fast_config()).await.unwrap();
    let report = f.orchestrator.wait_for(&run_id).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.auth_failures);
    assert_eq!(f.target.created().len(), 0);
}

#[tokio::test]
async fn dependency_visualization_is_mermaid() {
    let f = fixture(MockProvider::source("alpha"), MockProvider::target("beta"));
    let mermaid = f
        .orchestrator
        .get_dependency_visualization("alpha", "beta")
        .unwrap();
    assert!(mermaid.starts_with("graph TD"));
    assert!(mermaid.contains("authenticate --> get_projects"));
    assert!(mermaid.contains("target__authenticate --> target__create_test_case"));
}

#[tokio::test]
async fn provider_probes_report_connection_status() {
    let f = fixture(MockProvider::source("alpha"), MockProvider::target("beta"));
    f.source.set_connection(caseflow::ConnectionStatus::Disconnected {
        kind: ErrorKind::AuthenticationFailed,
        message: "bad token".into(),
    });

    let (source_status, target_status) =
        f.orchestrator.test_providers("alpha", "beta").await.unwrap();
    assert!(!source_status.is_connected());
    assert!(target_status.is_connected());
}

#[tokio::test]
async fn start_run_rejects_miswired_provider_pairs() {
    let f = fixture(MockProvider::source("alpha"), MockProvider::target("beta"));

    // Target cannot act as a source.
    let config = RunConfig::new("beta", "alpha");
    assert!(f.orchestrator.start_run(config).await.is_err());

    // Unknown provider id.
    let config = RunConfig::new("alpha", "ghost");
    assert!(f.orchestrator.start_run(config).await.is_err());
}

#[tokio::test]
async fn shutdown_cancels_active_runs() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .with_case(fixtures::test_case("TC-2", "Two")),
        MockProvider::target("beta").with_call_delay(Duration::from_millis(200)),
    );

    let run_id = f.orchestrator.start_run(fast_config()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.orchestrator.shutdown().await;

    let report = f.orchestrator.get_status(&run_id).unwrap();
    assert!(matches!(
        report.status,
        RunStatus::Cancelled | RunStatus::Completed | RunStatus::CompletedWithErrors
    ));
    assert!(report.finished_at.is_some());
}

#[tokio::test]
async fn every_item_gets_exactly_one_terminal_outcome() {
    let f = fixture(
        MockProvider::source("alpha")
            .with_case(fixtures::test_case("TC-1", "One"))
            .with_case(fixtures::test_case("TC-2", "Two"))
            .with_case(fixtures::test_case("TC-3", "Three"))
            .failing("get_test_case", &[500, 500, 500]),
        MockProvider::target("beta"),
    );

    let run_id = f.orchestrator.start_run(fast_config()).await.unwrap();
    f.orchestrator.wait_for(&run_id).await.unwrap();

    let outcomes = f.orchestrator.get_item_outcomes(&run_id, 0, 100).unwrap();
    let mut ids: Vec<_> = outcomes.iter().map(|o| o.source_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), outcomes.len(), "one outcome per item");
    assert_eq!(outcomes.len(), 3);
}
