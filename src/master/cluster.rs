//! External collaborators
//!
//! The placement layer, write-ahead-log recovery, membership and the command
//! channel to servers live outside the master core. They are consumed through
//! the narrow traits below. [`InMemoryCluster`] implements all of them over a
//! shared map and stands in for the real cluster in the master binary and in
//! tests.

use super::server_state::{PartitionRef, ServerName};
use crate::common::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[async_trait]
pub trait PartitionSource: Send + Sync {
    async fn owned_partitions(&self, server: &ServerName) -> Result<BTreeSet<PartitionRef>>;

    /// Move `partition` off `from`. Acknowledges without doing anything if
    /// the partition already moved.
    async fn reassign(&self, partition: &PartitionRef, from: &ServerName) -> Result<()>;

    /// Current ownership of every partition, grouped by server.
    async fn assignments(&self) -> Result<BTreeMap<ServerName, BTreeSet<PartitionRef>>>;
}

/// Proof that a server's write-ahead data has been replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryToken {
    pub server: ServerName,
    pub segments: usize,
}

#[async_trait]
pub trait LogRecovery: Send + Sync {
    async fn list_segments(&self, server: &ServerName) -> Result<Vec<String>>;

    async fn split_segment(&self, server: &ServerName, segment: &str) -> Result<()>;

    /// Idempotent for a server whose logs are already recovered.
    async fn recover_logs(&self, server: &ServerName) -> Result<RecoveryToken>;
}

#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn live_servers(&self) -> Result<BTreeSet<ServerName>>;

    /// A server reported in with the partitions it serves.
    async fn record_join(
        &self,
        _server: &ServerName,
        _partitions: &BTreeSet<PartitionRef>,
    ) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ServerChannel: Send + Sync {
    /// Best-effort.
    async fn send_terminate(&self, server: &ServerName) -> Result<()>;
}

/// The collaborator set handed to the master.
#[derive(Clone)]
pub struct Collaborators {
    pub partitions: Arc<dyn PartitionSource>,
    pub logs: Arc<dyn LogRecovery>,
    pub membership: Arc<dyn ClusterMembership>,
    pub channel: Arc<dyn ServerChannel>,
}

impl Collaborators {
    pub fn from_cluster(cluster: Arc<InMemoryCluster>) -> Self {
        Self {
            partitions: cluster.clone(),
            logs: cluster.clone(),
            membership: cluster.clone(),
            channel: cluster,
        }
    }
}

/// Seed file for [`InMemoryCluster::from_file`]. Server names use the
/// `host,port,start_code` form.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClusterFile {
    #[serde(default)]
    pub assignments: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub live: Vec<String>,
    #[serde(default)]
    pub segments: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct ClusterState {
    assignments: BTreeMap<PartitionRef, ServerName>,
    live: BTreeSet<ServerName>,
    segments: BTreeMap<ServerName, BTreeSet<String>>,
    split: BTreeSet<(ServerName, String)>,
    recovered: BTreeSet<ServerName>,
    terminated: Vec<ServerName>,
}

/// Collaborator call counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub owned_partitions: usize,
    pub reassign: usize,
    pub split_segment: usize,
    pub recover_logs: usize,
    pub terminate: usize,
}

#[derive(Default)]
struct Counters {
    owned_partitions: AtomicUsize,
    reassign: AtomicUsize,
    split_segment: AtomicUsize,
    recover_logs: AtomicUsize,
    terminate: AtomicUsize,
}

#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    counters: Counters,
    failures: AtomicU32,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let file: ClusterFile = serde_json::from_str(&data)?;

        let cluster = Self::new();
        for (server, partitions) in &file.assignments {
            let server: ServerName = server.parse()?;
            cluster.assign(&server, partitions.iter().map(String::as_str));
        }
        for server in &file.live {
            cluster.start_server(&server.parse()?);
        }
        for (server, segments) in &file.segments {
            let server: ServerName = server.parse()?;
            cluster.add_segments(&server, segments.iter().map(String::as_str));
        }
        Ok(cluster)
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Place partitions on `server`.
    pub fn assign<'a>(&self, server: &ServerName, partitions: impl IntoIterator<Item = &'a str>) {
        let mut state = self.lock();
        for p in partitions {
            state.assignments.insert(PartitionRef::from(p), server.clone());
        }
    }

    pub fn start_server(&self, server: &ServerName) {
        self.lock().live.insert(server.clone());
    }

    pub fn kill(&self, server: &ServerName) {
        self.lock().live.remove(server);
    }

    pub fn kill_all(&self) {
        self.lock().live.clear();
    }

    pub fn add_segments<'a>(
        &self,
        server: &ServerName,
        segments: impl IntoIterator<Item = &'a str>,
    ) {
        let mut state = self.lock();
        let entry = state.segments.entry(server.clone()).or_default();
        entry.extend(segments.into_iter().map(str::to_string));
    }

    /// Make the next `n` collaborator calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn owned_by(&self, server: &ServerName) -> BTreeSet<PartitionRef> {
        self.lock()
            .assignments
            .iter()
            .filter(|(_, owner)| *owner == server)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn owner_of(&self, partition: &str) -> Option<ServerName> {
        self.lock()
            .assignments
            .get(&PartitionRef::from(partition))
            .cloned()
    }

    pub fn is_live(&self, server: &ServerName) -> bool {
        self.lock().live.contains(server)
    }

    pub fn is_recovered(&self, server: &ServerName) -> bool {
        self.lock().recovered.contains(server)
    }

    pub fn terminated(&self) -> Vec<ServerName> {
        self.lock().terminated.clone()
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            owned_partitions: c.owned_partitions.load(Ordering::SeqCst),
            reassign: c.reassign.load(Ordering::SeqCst),
            split_segment: c.split_segment.load(Ordering::SeqCst),
            recover_logs: c.recover_logs.load(Ordering::SeqCst),
            terminate: c.terminate.load(Ordering::SeqCst),
        }
    }

    fn injected_failure(&self, op: &str) -> Result<()> {
        let taken = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            return Err(Error::Unavailable(format!("{}: injected failure", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl PartitionSource for InMemoryCluster {
    async fn owned_partitions(&self, server: &ServerName) -> Result<BTreeSet<PartitionRef>> {
        self.counters.owned_partitions.fetch_add(1, Ordering::SeqCst);
        self.injected_failure("owned_partitions")?;
        Ok(self.owned_by(server))
    }

    async fn reassign(&self, partition: &PartitionRef, from: &ServerName) -> Result<()> {
        self.counters.reassign.fetch_add(1, Ordering::SeqCst);
        self.injected_failure("reassign")?;

        let mut state = self.lock();
        if state.assignments.get(partition) != Some(from) {
            return Ok(());
        }

        // Least-loaded live server.
        let mut load: BTreeMap<&ServerName, usize> = state
            .live
            .iter()
            .filter(|s| *s != from)
            .map(|s| (s, 0))
            .collect();
        for owner in state.assignments.values() {
            if let Some(n) = load.get_mut(owner) {
                *n += 1;
            }
        }
        let target = load
            .into_iter()
            .min_by_key(|(_, n)| *n)
            .map(|(s, _)| s.clone())
            .ok_or_else(|| Error::Unavailable(format!("no live server to take {}", partition)))?;

        tracing::debug!(partition = %partition, from = %from, to = %target, "Partition reassigned");
        state.assignments.insert(partition.clone(), target);
        Ok(())
    }

    async fn assignments(&self) -> Result<BTreeMap<ServerName, BTreeSet<PartitionRef>>> {
        let state = self.lock();
        let mut out: BTreeMap<ServerName, BTreeSet<PartitionRef>> = BTreeMap::new();
        for (partition, owner) in &state.assignments {
            out.entry(owner.clone()).or_default().insert(partition.clone());
        }
        Ok(out)
    }
}

#[async_trait]
impl LogRecovery for InMemoryCluster {
    async fn list_segments(&self, server: &ServerName) -> Result<Vec<String>> {
        self.injected_failure("list_segments")?;
        let state = self.lock();
        Ok(state
            .segments
            .get(server)
            .map(|s| {
                s.iter()
                    .filter(|seg| !state.split.contains(&(server.clone(), seg.to_string())))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn split_segment(&self, server: &ServerName, segment: &str) -> Result<()> {
        self.counters.split_segment.fetch_add(1, Ordering::SeqCst);
        self.injected_failure("split_segment")?;
        self.lock()
            .split
            .insert((server.clone(), segment.to_string()));
        Ok(())
    }

    async fn recover_logs(&self, server: &ServerName) -> Result<RecoveryToken> {
        self.counters.recover_logs.fetch_add(1, Ordering::SeqCst);
        self.injected_failure("recover_logs")?;

        let mut state = self.lock();
        let segments: Vec<String> = state
            .segments
            .get(server)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for segment in &segments {
            state.split.insert((server.clone(), segment.clone()));
        }
        state.recovered.insert(server.clone());
        Ok(RecoveryToken {
            server: server.clone(),
            segments: segments.len(),
        })
    }
}

#[async_trait]
impl ClusterMembership for InMemoryCluster {
    async fn live_servers(&self) -> Result<BTreeSet<ServerName>> {
        Ok(self.lock().live.clone())
    }

    async fn record_join(
        &self,
        server: &ServerName,
        partitions: &BTreeSet<PartitionRef>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.live.insert(server.clone());
        for p in partitions {
            state.assignments.insert(p.clone(), server.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ServerChannel for InMemoryCluster {
    async fn send_terminate(&self, server: &ServerName) -> Result<()> {
        self.counters.terminate.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.live.remove(server);
        state.terminated.push(server.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(port: u16) -> ServerName {
        ServerName::new("rs", port, 1)
    }

    #[tokio::test]
    async fn test_reassign_goes_to_least_loaded_live_server() {
        let cluster = InMemoryCluster::new();
        cluster.assign(&rs(1), ["a", "b"]);
        cluster.assign(&rs(2), ["c"]);
        cluster.start_server(&rs(2));
        cluster.start_server(&rs(3));

        cluster.reassign(&PartitionRef::from("a"), &rs(1)).await.unwrap();
        assert_eq!(cluster.owner_of("a"), Some(rs(3)));
        cluster.reassign(&PartitionRef::from("b"), &rs(1)).await.unwrap();
        assert!(cluster.owned_by(&rs(1)).is_empty());

        // Already moved: acknowledged, nothing changes.
        cluster.reassign(&PartitionRef::from("a"), &rs(1)).await.unwrap();
        assert_eq!(cluster.owner_of("a"), Some(rs(3)));
    }

    #[tokio::test]
    async fn test_reassign_without_live_servers_is_transient() {
        let cluster = InMemoryCluster::new();
        cluster.assign(&rs(1), ["a"]);
        let err = cluster
            .reassign(&PartitionRef::from("a"), &rs(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_recover_logs_is_idempotent() {
        let cluster = InMemoryCluster::new();
        cluster.add_segments(&rs(1), ["wal.1", "wal.2"]);
        cluster.split_segment(&rs(1), "wal.1").await.unwrap();
        assert_eq!(cluster.list_segments(&rs(1)).await.unwrap(), vec!["wal.2"]);

        let token = cluster.recover_logs(&rs(1)).await.unwrap();
        assert_eq!(token.segments, 2);
        assert_eq!(cluster.recover_logs(&rs(1)).await.unwrap(), token);
        assert!(cluster.list_segments(&rs(1)).await.unwrap().is_empty());
        assert!(cluster.is_recovered(&rs(1)));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next(2);
        assert!(cluster.owned_partitions(&rs(1)).await.is_err());
        assert!(cluster.owned_partitions(&rs(1)).await.is_err());
        assert!(cluster.owned_partitions(&rs(1)).await.is_ok());
        assert_eq!(cluster.calls().owned_partitions, 3);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(
            &path,
            r#"{
                "assignments": {"rs,1,1": ["t1,a", "t1,b"]},
                "live": ["rs,2,1"],
                "segments": {"rs,1,1": ["wal.1"]}
            }"#,
        )
        .unwrap();

        let cluster = InMemoryCluster::from_file(&path).unwrap();
        assert_eq!(cluster.owned_by(&rs(1)).len(), 2);
        assert!(cluster.is_live(&rs(2)));
        assert!(!cluster.is_live(&rs(1)));
    }
}
