//! Master restart in the middle of a recovery: the procedure resumes from its
//! last persisted step with the same children, and nothing is redone.

use failover::common::{LogSyncPolicy, MasterConfig};
use failover::master::{Collaborators, InMemoryCluster, Master, ServerName, ServerState};
use failover::procedure::{
    FileProcedureLog, NoopInterceptor, ProcedureLog, StepGate, StepInterceptor,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn config(dir: &Path) -> MasterConfig {
    MasterConfig {
        log_path: dir.join("procedures.log"),
        liveness_interval_ms: 0,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 20,
        ..Default::default()
    }
}

async fn start(
    config: &MasterConfig,
    cluster: &Arc<InMemoryCluster>,
    interceptor: Arc<dyn StepInterceptor>,
) -> Arc<Master> {
    let log = FileProcedureLog::open(&config.log_path, LogSyncPolicy::Always).unwrap();
    Master::start_with(
        config.clone(),
        Collaborators::from_cluster(cluster.clone()),
        Box::new(log),
        interceptor,
    )
    .await
    .unwrap()
}

fn dead_server_cluster() -> (Arc<InMemoryCluster>, ServerName) {
    let cluster = Arc::new(InMemoryCluster::new());
    let dead = ServerName::new("rs1.example", 16020, 1);
    let alive = ServerName::new("rs2.example", 16020, 1);
    cluster.start_server(&dead);
    cluster.start_server(&alive);
    cluster.assign(&dead, ["t1,a", "t1,b", "t2,a"]);
    cluster.add_segments(&dead, ["wal.1", "wal.2"]);
    (cluster, dead)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resume_after_persisted_steps() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let (cluster, dead) = dead_server_cluster();

    let gate = Arc::new(StepGate::new("ServerCrash", "QueryPartitions", Some(dead.clone())));
    let pid = {
        let master = start(&config, &cluster, gate.clone()).await;
        cluster.kill(&dead);
        let pid = master.submit_crash_recovery(&dead).unwrap().proc_id();
        assert!(gate.wait_reached(WAIT).await);
        assert_eq!(master.query_server_state(&dead), Some(ServerState::Offline));
        master.shutdown();
        pid
    };

    let before = cluster.calls();
    assert_eq!(before.split_segment, 2);
    assert_eq!(before.recover_logs, 1);
    assert_eq!(before.owned_partitions, 0);

    let hold = Arc::new(StepGate::new("ServerCrash", "Finish", Some(dead.clone())));
    let master = start(&config, &cluster, hold.clone()).await;
    assert!(hold.wait_reached(WAIT).await);

    // Resumed, not resubmitted.
    assert_eq!(master.crash_procedure_for(&dead), Some(pid));
    let roots: Vec<_> = master
        .procedures()
        .into_iter()
        .filter(|p| p.procedure == "ServerCrash")
        .collect();
    assert_eq!(roots.len(), 1);
    hold.release();

    let info = master.wait_procedure(pid, WAIT).await.unwrap();
    assert!(info.is_success(), "{:?}", info);
    assert_eq!(master.query_server_state(&dead), None);
    assert!(cluster.owned_by(&dead).is_empty());

    let after = cluster.calls();
    assert_eq!(after.split_segment, 2);
    assert_eq!(after.recover_logs, 1);
    assert_eq!(after.owned_partitions, 1);
    assert_eq!(after.reassign, 3);

    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resume_with_same_children() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let (cluster, dead) = dead_server_cluster();

    // Hold every segment split so the parent is suspended on its children.
    let gate = Arc::new(StepGate::new("SplitLog", "Split", Some(dead.clone())));
    let (pid, children) = {
        let master = start(&config, &cluster, gate.clone()).await;
        cluster.kill(&dead);
        let pid = master.submit_crash_recovery(&dead).unwrap().proc_id();
        assert!(gate.wait_reached(WAIT).await);

        let parent = master.query_procedure(pid).unwrap();
        assert_eq!(parent.step, "FinishLogRecovery");
        assert_eq!(parent.children.len(), 2);
        assert_eq!(master.query_server_state(&dead), Some(ServerState::Splitting));
        master.shutdown();
        (pid, parent.children)
    };
    assert_eq!(cluster.calls().split_segment, 0);

    let hold = Arc::new(StepGate::new("ServerCrash", "QueryPartitions", Some(dead.clone())));
    let master = start(&config, &cluster, hold.clone()).await;
    assert!(hold.wait_reached(WAIT).await);

    let parent = master.query_procedure(pid).unwrap();
    assert_eq!(parent.children, children);
    assert_eq!(master.query_server_state(&dead), Some(ServerState::Offline));
    hold.release();

    let info = master.wait_procedure(pid, WAIT).await.unwrap();
    assert!(info.is_success(), "{:?}", info);

    let splits = master
        .procedures()
        .into_iter()
        .filter(|p| p.procedure == "SplitLog")
        .count();
    assert_eq!(splits, 2);
    assert_eq!(cluster.calls().split_segment, 2);

    master.shutdown();
}

#[tokio::test]
async fn test_replay_of_finished_log_is_empty() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let (cluster, dead) = dead_server_cluster();

    {
        let master = start(&config, &cluster, Arc::new(NoopInterceptor)).await;
        cluster.kill(&dead);
        let pid = master.submit_crash_recovery(&dead).unwrap().proc_id();
        assert!(master.wait_procedure(pid, WAIT).await.unwrap().is_success());
        master.shutdown();
    }

    // Every record written for the finished tree has a tombstone.
    let log = FileProcedureLog::open(&config.log_path, LogSyncPolicy::Always).unwrap();
    assert!(!log.read_all().unwrap().is_empty());

    let master = start(&config, &cluster, Arc::new(NoopInterceptor)).await;
    assert!(master.procedures().is_empty());
    assert_eq!(master.query_server_state(&dead), None);

    // Ids keep increasing across restarts.
    let next = master
        .submit_crash_recovery(&ServerName::new("rs9.example", 1, 1))
        .unwrap()
        .proc_id();
    assert!(next > 1);
    master.shutdown();
}
