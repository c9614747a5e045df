//! Server state tracking
//!
//! One [`ServerStateNode`] per known server generation. Nodes are created
//! when the master first observes a server (join or restart reconciliation),
//! moved through the crash lifecycle by the crash-recovery procedure, and
//! deleted exactly once when that procedure completes.
//!
//! ```text
//! Online ──mark_crash──▶ Crashed ──▶ Splitting ──▶ Offline ──delete──▶ (gone)
//! ```
//!
//! Every mutation goes through the methods on [`ServerTracker`], which hold
//! one lock over the whole map for the duration of the transition.

use crate::common::{Error, Result};
use crate::procedure::ProcId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

/// One generation of a running storage server: `host,port,start_code`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName {
    pub host: String,
    pub port: u16,
    pub start_code: u64,
}

impl ServerName {
    pub fn new(host: impl Into<String>, port: u16, start_code: u64) -> Self {
        Self {
            host: host.into(),
            port,
            start_code,
        }
    }

    /// `host:port`, shared by every generation started on that address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn same_address(&self, other: &ServerName) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.host, self.port, self.start_code)
    }
}

impl FromStr for ServerName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(',');
        let (Some(host), Some(port), Some(start_code), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidServerName(s.to_string()));
        };
        if host.is_empty() {
            return Err(Error::InvalidServerName(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| Error::InvalidServerName(s.to_string()))?;
        let start_code = start_code
            .parse()
            .map_err(|_| Error::InvalidServerName(s.to_string()))?;
        Ok(ServerName::new(host, port, start_code))
    }
}

/// A unit of data ownership (a region).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionRef(pub String);

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionRef {
    fn from(s: &str) -> Self {
        PartitionRef(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Alive and heartbeating, no recovery pending
    Online,
    /// Declared dead, recovery procedure claimed
    Crashed,
    /// Write-ahead logs being recovered
    Splitting,
    /// Logs recovered, partitions being reassigned
    Offline,
}

impl ServerState {
    /// Crashed, splitting or offline: a recovery has started and the server
    /// must not be treated as online again.
    pub fn is_crashed_family(&self) -> bool {
        !matches!(self, ServerState::Online)
    }

    fn rank(&self) -> u8 {
        match self {
            ServerState::Online => 0,
            ServerState::Crashed => 1,
            ServerState::Splitting => 2,
            ServerState::Offline => 3,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Online => write!(f, "online"),
            ServerState::Crashed => write!(f, "crashed"),
            ServerState::Splitting => write!(f, "splitting"),
            ServerState::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStateNode {
    pub name: ServerName,
    pub state: ServerState,
    /// Partitions believed owned at the last observation
    pub partitions: BTreeSet<PartitionRef>,
    /// Crash-recovery procedure that owns this node, if any
    pub recovery: Option<ProcId>,
    pub since: DateTime<Utc>,
}

impl ServerStateNode {
    fn new(name: ServerName, state: ServerState) -> Self {
        Self {
            name,
            state,
            partitions: BTreeSet::new(),
            recovery: None,
            since: Utc::now(),
        }
    }

    pub fn is_in_state(&self, state: ServerState) -> bool {
        self.state == state
    }

    fn set_state(&mut self, state: ServerState) {
        self.state = state;
        self.since = Utc::now();
    }
}

/// Why `mark_crash` refused a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkCrashRejection {
    NotFound,
    /// Already in the crashed family; `by` is the claiming procedure, if any.
    AlreadyCrashed { by: Option<ProcId> },
}

/// Map of server generation → state node.
#[derive(Debug, Default)]
pub struct ServerTracker {
    nodes: RwLock<BTreeMap<ServerName, ServerStateNode>>,
}

impl ServerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ServerName, ServerStateNode>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ServerName, ServerStateNode>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    // === Queries ===

    pub fn get(&self, name: &ServerName) -> Option<ServerStateNode> {
        self.read().get(name).cloned()
    }

    pub fn state(&self, name: &ServerName) -> Option<ServerState> {
        self.read().get(name).map(|n| n.state)
    }

    pub fn is_in_state(&self, name: &ServerName, state: ServerState) -> bool {
        self.read()
            .get(name)
            .map(|n| n.is_in_state(state))
            .unwrap_or(false)
    }

    pub fn claimant(&self, name: &ServerName) -> Option<ProcId> {
        self.read().get(name).and_then(|n| n.recovery)
    }

    pub fn nodes(&self) -> Vec<ServerStateNode> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Older generations tracked on the same address as `name`.
    pub fn older_generations(&self, name: &ServerName) -> Vec<ServerName> {
        self.read()
            .keys()
            .filter(|n| n.same_address(name) && n.start_code < name.start_code)
            .cloned()
            .collect()
    }

    // === Transitions ===

    /// Record a server observed alive. Creates the node `Online` if absent and
    /// refreshes its partitions if it is still online. Returns false when the
    /// node exists in the crashed family, which a join never overrides.
    pub fn register_online(&self, name: &ServerName, partitions: BTreeSet<PartitionRef>) -> bool {
        let mut nodes = self.write();
        let node = nodes
            .entry(name.clone())
            .or_insert_with(|| ServerStateNode::new(name.clone(), ServerState::Online));
        if node.state.is_crashed_family() {
            return false;
        }
        node.partitions = partitions;
        true
    }

    /// Record a server known only from partition ownership. Existing nodes
    /// (for example ones restored from a replayed procedure) only gain the
    /// partitions.
    pub fn observe(&self, name: &ServerName, partitions: BTreeSet<PartitionRef>) {
        let mut nodes = self.write();
        let node = nodes
            .entry(name.clone())
            .or_insert_with(|| ServerStateNode::new(name.clone(), ServerState::Online));
        node.partitions.extend(partitions);
    }

    /// `Online → Crashed`, claimed by `proc_id`. Only legal from `Online`.
    pub fn mark_crash(
        &self,
        name: &ServerName,
        proc_id: ProcId,
    ) -> std::result::Result<(), MarkCrashRejection> {
        let mut nodes = self.write();
        let node = nodes.get_mut(name).ok_or(MarkCrashRejection::NotFound)?;
        if node.state.is_crashed_family() {
            return Err(MarkCrashRejection::AlreadyCrashed { by: node.recovery });
        }
        node.set_state(ServerState::Crashed);
        node.recovery = Some(proc_id);
        Ok(())
    }

    /// Claim a crashed-family node whose previous recovery failed. The node
    /// restarts the lifecycle at `Crashed`.
    pub fn claim_orphan(&self, name: &ServerName, proc_id: ProcId) -> bool {
        let mut nodes = self.write();
        match nodes.get_mut(name) {
            Some(node) if node.state.is_crashed_family() && node.recovery.is_none() => {
                node.set_state(ServerState::Crashed);
                node.recovery = Some(proc_id);
                true
            }
            _ => false,
        }
    }

    /// Move a claimed node forward through the crash lifecycle. Re-applying
    /// the current state is a no-op; moving backwards is rejected.
    pub fn advance(&self, name: &ServerName, proc_id: ProcId, to: ServerState) -> Result<()> {
        let mut nodes = self.write();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        check_claim(node, proc_id)?;
        if to.rank() < node.state.rank() || to == ServerState::Online {
            return Err(Error::IllegalTransition {
                server: name.to_string(),
                reason: format!("{} -> {}", node.state, to),
            });
        }
        if node.state != to {
            node.set_state(to);
        }
        Ok(())
    }

    /// Remove a node once its recovery has finished. Only the claiming
    /// procedure may delete, and only from `Offline`.
    pub fn delete(&self, name: &ServerName, proc_id: ProcId) -> Result<ServerStateNode> {
        let mut nodes = self.write();
        let node = nodes
            .get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        check_claim(node, proc_id)?;
        if node.state != ServerState::Offline {
            return Err(Error::IllegalTransition {
                server: name.to_string(),
                reason: format!("delete from {}", node.state),
            });
        }
        nodes
            .remove(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    /// Drop the claim of a failed recovery, leaving the state untouched.
    pub fn release_claim(&self, name: &ServerName, proc_id: ProcId) -> bool {
        let mut nodes = self.write();
        match nodes.get_mut(name) {
            Some(node) if node.recovery == Some(proc_id) => {
                node.recovery = None;
                true
            }
            _ => false,
        }
    }

    /// Install a node rebuilt from the procedure log during replay.
    pub fn restore(&self, name: &ServerName, state: ServerState, proc_id: ProcId) {
        let mut nodes = self.write();
        let node = nodes
            .entry(name.clone())
            .or_insert_with(|| ServerStateNode::new(name.clone(), state));
        node.set_state(state);
        node.recovery = Some(proc_id);
    }
}

fn check_claim(node: &ServerStateNode, proc_id: ProcId) -> Result<()> {
    if node.recovery != Some(proc_id) {
        return Err(Error::IllegalTransition {
            server: node.name.to_string(),
            reason: format!(
                "claimed by {:?}, not procedure {}",
                node.recovery, proc_id
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(port: u16, start_code: u64) -> ServerName {
        ServerName::new("rs.example", port, start_code)
    }

    #[test]
    fn test_server_name_round_trip() {
        let name = rs(16020, 1700000000123);
        assert_eq!(name.to_string(), "rs.example,16020,1700000000123");
        assert_eq!("rs.example,16020,1700000000123".parse::<ServerName>().unwrap(), name);

        assert!("rs.example,16020".parse::<ServerName>().is_err());
        assert!("rs.example,port,1".parse::<ServerName>().is_err());
        assert!(",16020,1".parse::<ServerName>().is_err());
        assert!("a,1,2,3".parse::<ServerName>().is_err());
    }

    #[test]
    fn test_generations_are_distinct() {
        let old = rs(16020, 1);
        let new = rs(16020, 2);
        assert_ne!(old, new);
        assert!(old.same_address(&new));
        assert_eq!(old.address(), "rs.example:16020");
    }

    #[test]
    fn test_mark_crash_only_from_online() {
        let tracker = ServerTracker::new();
        let name = rs(1, 1);

        assert_eq!(tracker.mark_crash(&name, 1), Err(MarkCrashRejection::NotFound));

        tracker.register_online(&name, BTreeSet::new());
        assert!(tracker.is_in_state(&name, ServerState::Online));

        tracker.mark_crash(&name, 1).unwrap();
        assert!(tracker.is_in_state(&name, ServerState::Crashed));
        assert_eq!(tracker.claimant(&name), Some(1));

        assert_eq!(
            tracker.mark_crash(&name, 2),
            Err(MarkCrashRejection::AlreadyCrashed { by: Some(1) })
        );
    }

    #[test]
    fn test_lifecycle_to_deletion() {
        let tracker = ServerTracker::new();
        let name = rs(1, 1);
        tracker.register_online(&name, [PartitionRef::from("t1,a")].into());
        tracker.mark_crash(&name, 9).unwrap();

        // Wrong procedure can't move it.
        assert!(tracker.advance(&name, 8, ServerState::Splitting).is_err());

        tracker.advance(&name, 9, ServerState::Splitting).unwrap();
        tracker.advance(&name, 9, ServerState::Splitting).unwrap();
        assert!(tracker.delete(&name, 9).is_err());
        tracker.advance(&name, 9, ServerState::Offline).unwrap();
        assert!(tracker.advance(&name, 9, ServerState::Crashed).is_err());

        let removed = tracker.delete(&name, 9).unwrap();
        assert_eq!(removed.partitions.len(), 1);
        assert!(tracker.get(&name).is_none());
        assert_eq!(tracker.state(&name), None);
    }

    #[test]
    fn test_join_never_revives_crashed_node() {
        let tracker = ServerTracker::new();
        let name = rs(1, 1);
        tracker.register_online(&name, BTreeSet::new());
        tracker.mark_crash(&name, 3).unwrap();

        assert!(!tracker.register_online(&name, BTreeSet::new()));
        assert!(tracker.is_in_state(&name, ServerState::Crashed));
    }

    #[test]
    fn test_failed_recovery_leaves_orphan() {
        let tracker = ServerTracker::new();
        let name = rs(1, 1);
        tracker.register_online(&name, BTreeSet::new());
        tracker.mark_crash(&name, 3).unwrap();
        tracker.advance(&name, 3, ServerState::Splitting).unwrap();

        assert!(!tracker.release_claim(&name, 4));
        assert!(tracker.release_claim(&name, 3));
        assert!(tracker.is_in_state(&name, ServerState::Splitting));
        assert_eq!(tracker.claimant(&name), None);

        assert!(tracker.claim_orphan(&name, 5));
        assert!(tracker.is_in_state(&name, ServerState::Crashed));
        assert!(!tracker.claim_orphan(&name, 6));
    }

    #[test]
    fn test_older_generations() {
        let tracker = ServerTracker::new();
        tracker.observe(&rs(1, 1), BTreeSet::new());
        tracker.observe(&rs(2, 1), BTreeSet::new());

        assert_eq!(tracker.older_generations(&rs(1, 5)), vec![rs(1, 1)]);
        assert!(tracker.older_generations(&rs(1, 1)).is_empty());
    }

    #[test]
    fn test_restore_overrides_observed_state() {
        let tracker = ServerTracker::new();
        let name = rs(1, 1);
        tracker.restore(&name, ServerState::Splitting, 4);
        tracker.observe(&name, [PartitionRef::from("t1,b")].into());

        let node = tracker.get(&name).unwrap();
        assert_eq!(node.state, ServerState::Splitting);
        assert_eq!(node.recovery, Some(4));
        assert_eq!(node.partitions.len(), 1);
    }
}
