//! Records of auxiliary processes, addressed by a random numeric id.
//!
//! Slots live in an arena. Exited processes are tombstoned in place so a
//! reader holding an id sees "gone" rather than "unknown" until the slot is
//! reused. Reuse bumps the generation and forgets the previous owner's id,
//! which from then on reads as unknown. The id map never holds more entries
//! than there are slots.

use std::collections::HashMap;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};

/// A spawned auxiliary process and the stdio handles not yet claimed by a
/// stream endpoint.
#[derive(Debug, Default)]
pub struct ProcessRecord {
    pub command: Vec<String>,
    /// Zero once the process has exited.
    pub id: u64,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ProcessRecord {
    pub fn new(
        command: Vec<String>,
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    ) -> Self {
        Self {
            command,
            id: 0,
            stdin,
            stdout,
            stderr,
        }
    }

    pub fn is_live(&self) -> bool {
        self.id != 0
    }
}

/// Why a lookup did not produce a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Unknown,
    Gone,
    AlreadyClaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotRef {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    /// Id of the latest occupant, kept after it is tombstoned.
    owner: u64,
    record: ProcessRecord,
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    slots: Vec<Slot>,
    ids: HashMap<u64, SlotRef>,
    free: Vec<usize>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, id: u64) -> Result<&ProcessRecord, Claim> {
        let slot_ref = self.ids.get(&id).ok_or(Claim::Unknown)?;
        let slot = &self.slots[slot_ref.index];
        if slot.generation != slot_ref.generation || slot.record.id != id {
            return Err(Claim::Gone);
        }
        Ok(&slot.record)
    }

    fn resolve_mut(&mut self, id: u64) -> Result<&mut ProcessRecord, Claim> {
        let slot_ref = *self.ids.get(&id).ok_or(Claim::Unknown)?;
        let slot = &mut self.slots[slot_ref.index];
        if slot.generation != slot_ref.generation || slot.record.id != id {
            return Err(Claim::Gone);
        }
        Ok(&mut slot.record)
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.resolve(id).is_ok()
    }

    pub fn get(&self, id: u64) -> Result<&ProcessRecord, Claim> {
        self.resolve(id)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_live()).count()
    }

    /// Register `record` under the first candidate id that is non-zero and
    /// not held by a live process.
    pub fn insert_with<F>(&mut self, mut candidate: F, mut record: ProcessRecord) -> u64
    where
        F: FnMut() -> u64,
    {
        let id = loop {
            let id = candidate();
            if id != 0 && !self.is_live(id) {
                break id;
            }
            tracing::debug!("Process ID {} collides, drawing again", id);
        };
        record.id = id;
        let slot_ref = match self.free.pop() {
            Some(index) => {
                let previous = SlotRef {
                    index,
                    generation: self.slots[index].generation,
                };
                let stale = self.slots[index].owner;
                if self.ids.get(&stale) == Some(&previous) {
                    self.ids.remove(&stale);
                }
                let slot = &mut self.slots[index];
                slot.generation = slot.generation.wrapping_add(1);
                slot.owner = id;
                slot.record = record;
                SlotRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    owner: id,
                    record,
                });
                SlotRef {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };
        self.ids.insert(id, slot_ref);
        id
    }

    /// Mark the process as exited. Unclaimed handles are released and the
    /// slot becomes reusable.
    pub fn tombstone(&mut self, id: u64) -> bool {
        let Some(slot_ref) = self.ids.get(&id).copied() else {
            return false;
        };
        let slot = &mut self.slots[slot_ref.index];
        if slot.generation != slot_ref.generation || slot.record.id != id {
            return false;
        }
        slot.record.id = 0;
        slot.record.stdin = None;
        slot.record.stdout = None;
        slot.record.stderr = None;
        self.free.push(slot_ref.index);
        true
    }

    pub fn claim_stdin(&mut self, id: u64) -> Result<ChildStdin, Claim> {
        self.resolve_mut(id)?.stdin.take().ok_or(Claim::AlreadyClaimed)
    }

    pub fn claim_stdout(&mut self, id: u64) -> Result<ChildStdout, Claim> {
        self.resolve_mut(id)?.stdout.take().ok_or(Claim::AlreadyClaimed)
    }

    pub fn claim_stderr(&mut self, id: u64) -> Result<ChildStderr, Claim> {
        self.resolve_mut(id)?.stderr.take().ok_or(Claim::AlreadyClaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn record(name: &str) -> ProcessRecord {
        ProcessRecord::new(vec![name.to_string()], None, None, None)
    }

    fn sequence(ids: &[u64]) -> impl FnMut() -> u64 + Send + 'static {
        let ids = ids.to_vec();
        let mut i = 0;
        move || {
            let id = ids[i.min(ids.len() - 1)];
            i += 1;
            id
        }
    }

    #[test]
    fn collision_with_live_id_retries() {
        let mut table = ProcessTable::new();
        assert_eq!(table.insert_with(sequence(&[7]), record("a")), 7);
        assert_eq!(table.insert_with(sequence(&[7, 0, 8]), record("b")), 8);
        assert_eq!(table.get(7).unwrap().command, vec!["a"]);
        assert_eq!(table.get(8).unwrap().command, vec!["b"]);
        assert_eq!(table.live_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_ids() {
        let table = Arc::new(RwLock::new(ProcessTable::new()));
        let a = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.write().await.insert_with(sequence(&[7, 9]), record("a")) })
        };
        let b = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.write().await.insert_with(sequence(&[7, 8]), record("b")) })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_ne!(a, b);
        assert!(a == 7 || b == 7);

        let table = table.read().await;
        assert_eq!(table.get(a).unwrap().command, vec!["a"]);
        assert_eq!(table.get(b).unwrap().command, vec!["b"]);
    }

    #[test]
    fn tombstoned_id_reports_gone() {
        let mut table = ProcessTable::new();
        let id = table.insert_with(sequence(&[42]), record("a"));
        assert!(table.tombstone(id));
        assert!(!table.tombstone(id));
        assert_eq!(table.get(id).unwrap_err(), Claim::Gone);
        assert_eq!(table.claim_stdout(id).unwrap_err(), Claim::Gone);
        assert_eq!(table.get(43).unwrap_err(), Claim::Unknown);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn reused_slot_does_not_resurrect_old_id() {
        let mut table = ProcessTable::new();
        let old = table.insert_with(sequence(&[1]), record("old"));
        table.tombstone(old);
        assert_eq!(table.get(old).unwrap_err(), Claim::Gone);
        let new = table.insert_with(sequence(&[2]), record("new"));
        assert_eq!(table.slots.len(), 1);
        assert_eq!(table.get(old).unwrap_err(), Claim::Unknown);
        assert_eq!(table.get(new).unwrap().command, vec!["new"]);
    }

    #[test]
    fn id_map_stays_bounded_by_slots() {
        let mut table = ProcessTable::new();
        for id in 1..=100 {
            let id = table.insert_with(sequence(&[id]), record("aux"));
            assert!(table.tombstone(id));
        }
        assert_eq!(table.slots.len(), 1);
        assert_eq!(table.ids.len(), 1);
        assert_eq!(table.get(100).unwrap_err(), Claim::Gone);
        assert_eq!(table.get(99).unwrap_err(), Claim::Unknown);
    }

    #[test]
    fn redrawn_id_in_other_slot_survives_old_slot_reuse() {
        let mut table = ProcessTable::new();
        let a = table.insert_with(sequence(&[1]), record("a"));
        let b = table.insert_with(sequence(&[2]), record("b"));
        table.tombstone(a);
        table.tombstone(b);
        // Slot of `b` is reused first, then id 1 is drawn again there.
        assert_eq!(table.insert_with(sequence(&[1]), record("again")), 1);
        table.insert_with(sequence(&[3]), record("c"));
        assert_eq!(table.get(1).unwrap().command, vec!["again"]);
        assert_eq!(table.get(2).unwrap_err(), Claim::Unknown);
        assert_eq!(table.get(3).unwrap().command, vec!["c"]);
    }

    #[test]
    fn tombstoned_id_may_be_drawn_again() {
        let mut table = ProcessTable::new();
        let id = table.insert_with(sequence(&[5]), record("first"));
        table.tombstone(id);
        assert_eq!(table.insert_with(sequence(&[5]), record("second")), 5);
        assert_eq!(table.get(5).unwrap().command, vec!["second"]);
    }

    #[tokio::test]
    async fn handles_are_claimed_once() {
        let mut child = tokio::process::Command::new("cat")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let mut table = ProcessTable::new();
        let id = table.insert_with(
            sequence(&[3]),
            ProcessRecord::new(
                vec!["cat".into()],
                child.stdin.take(),
                child.stdout.take(),
                child.stderr.take(),
            ),
        );
        assert!(table.claim_stdout(id).is_ok());
        assert_eq!(table.claim_stdout(id).unwrap_err(), Claim::AlreadyClaimed);
        drop(table.claim_stdin(id).unwrap());
        child.wait().await.unwrap();
    }
}
