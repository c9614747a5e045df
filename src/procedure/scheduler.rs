//! Procedure scheduler
//!
//! Exclusive resource locks plus the ready queue. A procedure is handed to a
//! worker only once it holds the lock for its resource key, so work on one
//! resource is serialized while distinct resources run in parallel.
//! Procedures that lose a lock race are parked on that key and become ready,
//! in arrival order, when the holder releases it.

use super::ProcId;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct Scheduler {
    ready: VecDeque<ProcId>,
    locks: HashMap<String, ProcId>,
    waiters: HashMap<String, VecDeque<ProcId>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `key` to `proc_id` if it is free or already held by it.
    /// On denial returns the current holder.
    pub fn try_acquire(&mut self, key: &str, proc_id: ProcId) -> Result<(), ProcId> {
        match self.locks.get(key) {
            Some(&holder) if holder != proc_id => Err(holder),
            Some(_) => Ok(()),
            None => {
                self.locks.insert(key.to_string(), proc_id);
                Ok(())
            }
        }
    }

    /// Release `key` if `proc_id` holds it. The lock passes straight to the
    /// first parked waiter, which becomes ready; that waiter is returned.
    pub fn release(&mut self, key: &str, proc_id: ProcId) -> Option<ProcId> {
        if self.locks.get(key) != Some(&proc_id) {
            return None;
        }
        self.locks.remove(key);

        let next = self.waiters.get_mut(key).and_then(|q| q.pop_front());
        if self.waiters.get(key).is_some_and(|q| q.is_empty()) {
            self.waiters.remove(key);
        }
        if let Some(next) = next {
            self.locks.insert(key.to_string(), next);
            self.ready.push_back(next);
        }
        next
    }

    pub fn holder(&self, key: &str) -> Option<ProcId> {
        self.locks.get(key).copied()
    }

    /// Make a procedure runnable. Returns false if it was parked behind
    /// another holder of `key`.
    pub fn enqueue(&mut self, proc_id: ProcId, key: Option<&str>) -> bool {
        if let Some(key) = key {
            if self.try_acquire(key, proc_id).is_err() {
                let queue = self.waiters.entry(key.to_string()).or_default();
                if !queue.contains(&proc_id) {
                    queue.push_back(proc_id);
                }
                return false;
            }
        }
        if !self.ready.contains(&proc_id) {
            self.ready.push_back(proc_id);
        }
        true
    }

    /// Next procedure to run.
    pub fn poll(&mut self) -> Option<ProcId> {
        self.ready.pop_front()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn locks_held(&self) -> usize {
        self.locks.len()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.locks.clear();
        self.waiters.clear();
    }
}
