//! Unit tests for the PostgresDbOps reconciler

use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use kube::runtime::controller::Action;
use pg_cluster_operator::controller::{BackoffConfig, Error, KeyedLock};
use pg_cluster_operator::crd::{PostgresDbOps, RestartPhase};
use pg_cluster_operator::{dbops_error_policy, reconcile_dbops};

use crate::common::*;

const NS: &str = "default";

fn setup(count: u32) -> Harness {
    let cluster = create_test_cluster("db", NS, count as i32);
    let template = template_for(&cluster);
    let ops = FakeInstanceOps::new(compliant_instances("db", count, 0, &template))
        .with_template(template);
    let harness = Harness::new(ops);
    harness.store.put_cluster(cluster);
    harness
}

async fn pass(harness: &Harness, name: &str) -> pg_cluster_operator::Result<Action> {
    let op = harness.store.operation(NS, name).unwrap();
    reconcile_dbops(Arc::new(op), harness.ctx.clone()).await
}

fn stored(harness: &Harness, name: &str) -> PostgresDbOps {
    harness.store.operation(NS, name).unwrap()
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_runs_to_completion() {
        let harness = setup(3);
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());

        let action = pass(&harness, "restart-db").await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = stored(&harness, "restart-db").status.unwrap();
        assert_eq!(status.phase, RestartPhase::Completed);
        assert!(status.op_started.is_some());
        assert_eq!(status.op_retries, 0);
        // Surge, two replicas, switchover, primary, scale back
        assert_eq!(harness.ops.calls().len(), 7);
        assert!(harness.ops.instance("db-3").is_none());
    }

    #[tokio::test]
    async fn test_completed_operation_is_left_alone() {
        let harness = setup(2);
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());
        pass(&harness, "restart-db").await.unwrap();
        let calls = harness.ops.calls().len();
        let writes = harness.store.status_writes();

        let action = pass(&harness, "restart-db").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(harness.ops.calls().len(), calls);
        assert_eq!(harness.store.status_writes(), writes);
    }

    #[tokio::test]
    async fn test_deleting_operation_does_nothing() {
        let harness = setup(2);
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());
        harness.store.mark_operation_deleted(NS, "restart-db");

        let action = pass(&harness, "restart-db").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(harness.ops.calls().is_empty());
        assert!(stored(&harness, "restart-db").status.is_none());
    }

    #[tokio::test]
    async fn test_missing_cluster_is_retried() {
        let harness = Harness::new(FakeInstanceOps::default());
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());

        let err = pass(&harness, "restart-db").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.is_retryable());
        assert!(harness.ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_follow_up_operation_finds_nothing_pending() {
        let harness = setup(3);
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());
        harness.store.put_operation(
            PostgresDbOpsBuilder::restart("pending-db", NS, "db")
                .only_pending_restart()
                .build(),
        );

        pass(&harness, "restart-db").await.unwrap();
        let calls = harness.ops.calls().len();
        pass(&harness, "pending-db").await.unwrap();

        assert_eq!(harness.ops.calls().len(), calls);
        let status = stored(&harness, "pending-db").status.unwrap();
        assert_eq!(status.phase, RestartPhase::Completed);
        assert!(status.restart.unwrap().restarted_instances.is_empty());
    }
}

mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_operation_is_retried_and_resumes() {
        let harness = setup(3);
        harness.ops.fail("db-2", Failure::Timeout, 1);
        harness.store.put_operation(
            PostgresDbOpsBuilder::restart("restart-db", NS, "db")
                .with_max_retries(1)
                .build(),
        );

        // The failure is recorded, not returned
        let action = pass(&harness, "restart-db").await.unwrap();
        assert_eq!(action, Action::await_change());
        let status = stored(&harness, "restart-db").status.unwrap();
        assert_eq!(status.phase, RestartPhase::Failed);

        let action = pass(&harness, "restart-db").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        let status = stored(&harness, "restart-db").status.unwrap();
        assert_eq!(status.phase, RestartPhase::Initialized);
        assert_eq!(status.op_retries, 1);
        let restart = status.restart.unwrap();
        assert!(restart.failure.is_none());
        assert_eq!(
            restart.restarted_instances,
            vec!["db-3".to_string(), "db-1".to_string()]
        );

        pass(&harness, "restart-db").await.unwrap();
        let status = stored(&harness, "restart-db").status.unwrap();
        assert_eq!(status.phase, RestartPhase::Completed);
        assert_eq!(status.op_retries, 1);

        // db-1 finished before the failure and is not restarted again
        let db1 = harness
            .ops
            .restarts()
            .into_iter()
            .filter(|(_, instance)| instance == "db-1")
            .count();
        assert_eq!(db1, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_stay_failed() {
        let harness = setup(3);
        harness.ops.fail("db-1", Failure::Timeout, 1);
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());

        pass(&harness, "restart-db").await.unwrap();
        let action = pass(&harness, "restart-db").await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = stored(&harness, "restart-db").status.unwrap();
        assert_eq!(status.phase, RestartPhase::Failed);
        assert_eq!(status.op_retries, 0);
        assert!(status.restart.unwrap().failure.is_some());
    }

    #[tokio::test]
    async fn test_transient_error_is_returned_for_requeue() {
        let harness = setup(3);
        harness.ops.fail("db-1", Failure::Transient, 1);
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());

        let err = pass(&harness, "restart-db").await.unwrap_err();
        assert!(err.is_retryable());
        // Only the surge replica came up before the error
        assert_eq!(
            stored(&harness, "restart-db").status.unwrap().phase,
            RestartPhase::RestartingReplicas
        );

        pass(&harness, "restart-db").await.unwrap();
        assert_eq!(
            stored(&harness, "restart-db").status.unwrap().phase,
            RestartPhase::Completed
        );
    }

    #[test]
    fn test_error_policy_waits_longest_on_permanent_errors() {
        let harness = setup(1);
        let op = Arc::new(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());

        let action = dbops_error_policy(
            op,
            &Error::ValidationError("bad".to_string()),
            harness.ctx.clone(),
        );
        assert_eq!(action, Action::requeue(BackoffConfig::default().max_delay));
    }
}

mod locking_tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_waits_for_cluster_restart_lock() {
        let harness = setup(2);
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());

        let guard = harness
            .ctx
            .locks
            .lock(&KeyedLock::dbops_key(NS, "db"))
            .await;
        let op = Arc::new(stored(&harness, "restart-db"));
        let mut run = std::pin::pin!(reconcile_dbops(op, harness.ctx.clone()));

        assert!(matches!(futures::poll!(&mut run), Poll::Pending));
        assert!(harness.ops.calls().is_empty());
        // The start time is recorded before waiting
        assert!(stored(&harness, "restart-db").status.unwrap().op_started.is_some());

        drop(guard);
        run.await.unwrap();
        assert_eq!(
            stored(&harness, "restart-db").status.unwrap().phase,
            RestartPhase::Completed
        );
    }

    #[tokio::test]
    async fn test_operation_finished_while_waiting_is_skipped() {
        let harness = setup(2);
        harness
            .store
            .put_operation(PostgresDbOpsBuilder::restart("restart-db", NS, "db").build());
        let first = Arc::new(stored(&harness, "restart-db"));

        pass(&harness, "restart-db").await.unwrap();
        let calls = harness.ops.calls().len();

        // A stale copy from before completion
        let action = reconcile_dbops(first, harness.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(harness.ops.calls().len(), calls);
    }
}
