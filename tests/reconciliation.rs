//! Reconciliation and liveness: repeated expiry passes are idempotent, a
//! failed recovery is retried only on request, and a server that stops
//! heartbeating is expired by the liveness task.

use failover::common::MasterConfig;
use failover::master::{Collaborators, InMemoryCluster, Master, ServerName, ServerState};
use failover::procedure::{
    MemoryProcedureLog, NoopInterceptor, ProcId, ProcStatus, StepGate, StepInterceptor,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn config() -> MasterConfig {
    MasterConfig {
        liveness_interval_ms: 0,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 10,
        ..Default::default()
    }
}

async fn start(
    config: MasterConfig,
    cluster: &Arc<InMemoryCluster>,
    interceptor: Arc<dyn StepInterceptor>,
) -> Arc<Master> {
    Master::start_with(
        config,
        Collaborators::from_cluster(cluster.clone()),
        Box::new(MemoryProcedureLog::new()),
        interceptor,
    )
    .await
    .unwrap()
}

fn rs(n: u16) -> ServerName {
    ServerName::new(format!("rs{}.example", n), 16020, 1)
}

fn crash_roots(master: &Master) -> usize {
    master
        .procedures()
        .iter()
        .filter(|p| p.procedure == "ServerCrash")
        .count()
}

fn crash_root(master: &Master) -> Option<ProcId> {
    master
        .procedures()
        .iter()
        .find(|p| p.procedure == "ServerCrash" && p.parent.is_none())
        .map(|p| p.id)
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_is_idempotent() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.start_server(&rs(1));
    cluster.start_server(&rs(2));
    cluster.assign(&rs(1), ["t1,a", "t1,b"]);
    cluster.kill(&rs(1));

    let gate = Arc::new(StepGate::new("ServerCrash", "QueryPartitions", Some(rs(1))));
    let master = start(config(), &cluster, gate.clone()).await;
    assert!(gate.wait_reached(WAIT).await);
    let pid = master.crash_procedure_for(&rs(1)).expect("startup expiry");

    assert!(master.reconcile().await.unwrap().is_empty());
    let (a, b) = tokio::join!(master.reconcile(), master.reconcile());
    assert!(a.unwrap().is_empty());
    assert!(b.unwrap().is_empty());
    assert_eq!(crash_roots(&master), 1);
    assert_eq!(master.crash_procedure_for(&rs(1)), Some(pid));

    gate.release();
    assert!(master.wait_procedure(pid, WAIT).await.unwrap().is_success());
    assert!(master.reconcile().await.unwrap().is_empty());
    assert_eq!(crash_roots(&master), 1);
    assert_eq!(cluster.owner_of("t1,a"), Some(rs(2)));

    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_recovery_is_reclaimed_by_reconcile() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.start_server(&rs(1));
    cluster.assign(&rs(1), ["t1,a"]);
    cluster.kill(&rs(1));

    // No live server to take the partition: reassignment gives up.
    let config = MasterConfig {
        max_step_retries: 1,
        ..config()
    };
    let master = start(config, &cluster, Arc::new(NoopInterceptor)).await;
    let first = crash_root(&master).expect("startup expiry");
    let info = master.wait_procedure(first, WAIT).await.unwrap();
    assert_eq!(info.status, ProcStatus::Failed);

    let node = master.server_node(&rs(1)).expect("node kept after failure");
    assert!(node.state.is_crashed_family());
    assert_eq!(node.recovery, None);
    assert_eq!(master.crash_procedure_for(&rs(1)), None);

    cluster.start_server(&rs(2));
    let submitted = master.reconcile().await.unwrap();
    assert_eq!(submitted.len(), 1);
    assert_ne!(submitted[0], first);

    let info = master.wait_procedure(submitted[0], WAIT).await.unwrap();
    assert!(info.is_success(), "{:?}", info);
    assert_eq!(master.query_server_state(&rs(1)), None);
    assert_eq!(cluster.owner_of("t1,a"), Some(rs(2)));

    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_liveness_expires_dead_server() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.start_server(&rs(1));
    cluster.start_server(&rs(2));
    cluster.assign(&rs(1), ["t1,a", "t2,a"]);

    let config = MasterConfig {
        liveness_interval_ms: 20,
        ..config()
    };
    let master = start(config, &cluster, Arc::new(NoopInterceptor)).await;
    assert_eq!(master.query_server_state(&rs(1)), Some(ServerState::Online));
    assert!(master.procedures().is_empty());

    cluster.kill(&rs(1));
    assert!(eventually(|| master.query_server_state(&rs(1)).is_none()).await);
    assert!(cluster.owned_by(&rs(1)).is_empty());
    assert!(eventually(|| cluster.terminated().contains(&rs(1))).await);

    // Later ticks find nothing left to expire.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(crash_roots(&master), 1);
    assert_eq!(master.query_server_state(&rs(2)), Some(ServerState::Online));

    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_liveness_leaves_failed_recovery_alone() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.start_server(&rs(1));
    cluster.assign(&rs(1), ["t1,a"]);
    cluster.kill(&rs(1));

    let config = MasterConfig {
        liveness_interval_ms: 20,
        max_step_retries: 1,
        ..config()
    };
    let master = start(config, &cluster, Arc::new(NoopInterceptor)).await;
    let first = crash_root(&master).expect("startup expiry");
    let info = master.wait_procedure(first, WAIT).await.unwrap();
    assert_eq!(info.status, ProcStatus::Failed);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(crash_roots(&master), 1);
    assert_eq!(master.server_node(&rs(1)).unwrap().recovery, None);

    master.shutdown();
}
