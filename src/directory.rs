use crate::address::Addr;
use crate::entry::{DirectoryEntry, State};
use crate::error::DirectoryError;
use crate::mshr::Mshr;
use std::collections::{HashMap, VecDeque};

/// Maps `baseAddr -> DirectoryEntry` for every live block, plus an LRU list
/// tracking which of those entries are "cached" (available without a
/// simulated memory round-trip). Spilling a directory entry never actually
/// discards its state here — this is a simulator, the entry object always
/// lives in `entries` — it only flips `cached` to false and makes the
/// caller pay a fetch latency the next time the entry is touched.
pub struct DirectoryMap {
    entries: HashMap<Addr, DirectoryEntry>,
    /// Front = most recently used, back = least recently used.
    lru: VecDeque<Addr>,
    max_size: usize,
}

impl DirectoryMap {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: VecDeque::new(),
            max_size,
        }
    }

    pub fn get(&self, addr: Addr) -> Option<&DirectoryEntry> {
        self.entries.get(&addr)
    }

    pub fn get_mut(&mut self, addr: Addr) -> Option<&mut DirectoryEntry> {
        self.entries.get_mut(&addr)
    }

    pub fn contains(&self, addr: Addr) -> bool {
        self.entries.contains_key(&addr)
    }

    /// Returns the entry for `addr`, creating it (born cached, state I) if
    /// absent. New entries are unconditionally cached, preserving the
    /// original's "cheatin'" behavior on creation.
    pub fn get_or_create(&mut self, addr: Addr) -> &mut DirectoryEntry {
        if !self.entries.contains_key(&addr) {
            self.entries.insert(addr, DirectoryEntry::new(addr));
            self.lru.push_front(addr);
        }
        self.entries.get_mut(&addr).unwrap()
    }

    /// Marks `addr`'s entry as undergoing a directory-entry fetch: flips
    /// its stable state to the matching `_d` transient. Errors if the
    /// entry's current state is not one of the three stable states.
    pub fn begin_entry_fetch(&mut self, addr: Addr) -> Result<(), DirectoryError> {
        let entry = self
            .entries
            .get_mut(&addr)
            .ok_or(DirectoryError::MissingEntry { addr })?;
        entry.state = match entry.state {
            State::I => State::ID,
            State::S => State::SdFetch,
            State::M => State::MdFetch,
            other => return Err(DirectoryError::UnexpectedState {
                cmd: crate::event::Command::GetS,
                addr,
                state: other,
            }),
        };
        Ok(())
    }

    /// Restores the stable state after a directory-entry fetch completes.
    /// This is the explicit, non-fall-through rendition of the original's
    /// `I_d -> I`, `S_d -> S`, `M_d -> M` mapping.
    pub fn complete_entry_fetch(&mut self, addr: Addr) -> Result<(), DirectoryError> {
        let entry = self
            .entries
            .get_mut(&addr)
            .ok_or(DirectoryError::MissingEntry { addr })?;
        entry.state = match entry.state {
            State::ID => State::I,
            State::SdFetch => State::S,
            State::MdFetch => State::M,
            other => return Err(DirectoryError::InvalidDirEntryFetchState { state: other }),
        };
        entry.cached = true;
        Ok(())
    }

    fn unlink(&mut self, addr: Addr) {
        if let Some(pos) = self.lru.iter().position(|&a| a == addr) {
            self.lru.remove(pos);
        }
    }

    /// Runs after every state transition. Deletes the entry if it settled
    /// back to `I`; otherwise promotes it to MRU and evicts from the LRU
    /// tail while oversize, stopping the moment the oldest candidate has
    /// outstanding MSHR traffic (pinning in-flight work is mandatory).
    /// Returns the addresses spilled to the backing store this call, for
    /// the caller to emit stub writes for.
    pub fn update_cache(&mut self, addr: Addr, mshr: &Mshr) -> Vec<Addr> {
        if self.max_size == 0 {
            if let Some(entry) = self.entries.get_mut(&addr) {
                entry.cached = false;
            }
            self.unlink(addr);
            return vec![addr];
        }

        self.unlink(addr);

        let is_invalid = self
            .entries
            .get(&addr)
            .is_some_and(|e| e.state == State::I);
        if is_invalid {
            self.entries.remove(&addr);
            return Vec::new();
        }

        self.lru.push_front(addr);

        let mut spilled = Vec::new();
        while self.lru.len() > self.max_size {
            let Some(&victim) = self.lru.back() else { break };
            if mshr.is_hit(victim) {
                break;
            }
            self.lru.pop_back();
            if let Some(entry) = self.entries.get_mut(&victim) {
                entry.cached = false;
            }
            spilled.push(victim);
        }
        spilled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_cached_entries() {
        let mut dm = DirectoryMap::new(32);
        let e = dm.get_or_create(0x40);
        assert!(e.cached);
        assert_eq!(e.state, State::I);
    }

    #[test]
    fn invalid_entries_are_erased_on_update() {
        let mut dm = DirectoryMap::new(32);
        dm.get_or_create(0x40);
        let mshr = Mshr::new(None);
        dm.update_cache(0x40, &mshr);
        assert!(!dm.contains(0x40));
    }

    #[test]
    fn evicts_lru_when_oversize() {
        let mut dm = DirectoryMap::new(1);
        let mshr = Mshr::new(None);

        dm.get_or_create(0x40).state = State::S;
        dm.update_cache(0x40, &mshr);

        dm.get_or_create(0x80).state = State::S;
        let spilled = dm.update_cache(0x80, &mshr);

        assert_eq!(spilled, vec![0x40]);
        assert!(!dm.get(0x40).unwrap().cached);
        assert!(dm.get(0x80).unwrap().cached);
    }

    #[test]
    fn pins_entries_with_outstanding_mshr_traffic() {
        use crate::event::{Command, Event, EventFlags, EventId};

        let mut dm = DirectoryMap::new(1);
        let mut mshr = Mshr::new(None);
        mshr.insert(
            0x40,
            Event {
                id: EventId { epoch: 0, seq: 1 },
                cmd: Command::GetS,
                base_addr: 0x40,
                addr: 0x40,
                size: 64,
                src: "a".into(),
                dst: "b".into(),
                delivery_time: 0,
                response_to: None,
                nacked_event: None,
                flags: EventFlags::empty(),
                payload: None,
                granted_state: None,
            },
        );

        dm.get_or_create(0x40).state = State::S;
        dm.update_cache(0x40, &mshr);

        dm.get_or_create(0x80).state = State::S;
        let spilled = dm.update_cache(0x80, &mshr);

        assert!(spilled.is_empty());
        assert!(dm.get(0x40).unwrap().cached);
    }

    #[test]
    fn entry_fetch_round_trip() {
        let mut dm = DirectoryMap::new(32);
        dm.get_or_create(0x40).state = State::S;
        dm.begin_entry_fetch(0x40).unwrap();
        assert_eq!(dm.get(0x40).unwrap().state, State::SdFetch);
        dm.complete_entry_fetch(0x40).unwrap();
        assert_eq!(dm.get(0x40).unwrap().state, State::S);
    }
}
