//! Per-identity sequence number tracking
//!
//! Classifies every data message as in-order, duplicate or gapped. A gap
//! desynchronizes its identity: everything after it is suppressed until a
//! snapshot (or a fresh subscription) establishes a new baseline, so deltas
//! are never applied on top of a book that missed messages.

use std::collections::HashMap;

use crate::protocol::ChannelId;

/// Result of admitting a seqnum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    InOrder,
    Duplicate,
    Gap { expected: u64, got: u64 },
    /// Identity is desynchronized and waiting for a snapshot
    Suppressed,
}

#[derive(Debug, Clone, Copy, Default)]
struct SequenceState {
    last_seqnum: Option<u64>,
    desynchronized: bool,
}

#[derive(Debug, Default)]
pub struct Sequencer {
    states: HashMap<ChannelId, SequenceState>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
        }
    }

    /// Admit a delta-style message
    pub fn admit(&mut self, id: &ChannelId, seqnum: u64) -> SequenceOutcome {
        let state = self.states.entry(id.clone()).or_default();

        if state.desynchronized {
            return SequenceOutcome::Suppressed;
        }

        match state.last_seqnum {
            None => {
                state.last_seqnum = Some(seqnum);
                SequenceOutcome::InOrder
            }
            Some(last) if seqnum <= last => SequenceOutcome::Duplicate,
            Some(last) if seqnum == last + 1 => {
                state.last_seqnum = Some(seqnum);
                SequenceOutcome::InOrder
            }
            Some(last) => {
                state.desynchronized = true;
                SequenceOutcome::Gap {
                    expected: last + 1,
                    got: seqnum,
                }
            }
        }
    }

    /// Admit a full-state message
    ///
    /// Snapshots rebase a fresh or desynchronized identity. An in-sync
    /// identity only drops snapshots at or below its baseline.
    pub fn admit_snapshot(&mut self, id: &ChannelId, seqnum: u64) -> SequenceOutcome {
        let state = self.states.entry(id.clone()).or_default();

        match state.last_seqnum {
            Some(last) if !state.desynchronized && seqnum <= last => SequenceOutcome::Duplicate,
            _ => {
                state.last_seqnum = Some(seqnum);
                state.desynchronized = false;
                SequenceOutcome::InOrder
            }
        }
    }

    /// Forget an identity; its next message seeds a new baseline
    pub fn reset(&mut self, id: &ChannelId) {
        self.states.remove(id);
    }

    /// Forget an identity and suppress deltas until its first snapshot
    ///
    /// Book channels need this: a delta has nothing to apply to, so it must
    /// not become the baseline a later snapshot is compared against.
    pub fn await_snapshot(&mut self, id: &ChannelId) {
        self.states.insert(
            id.clone(),
            SequenceState {
                last_seqnum: None,
                desynchronized: true,
            },
        );
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn is_desynchronized(&self, id: &ChannelId) -> bool {
        self.states
            .get(id)
            .map(|state| state.desynchronized)
            .unwrap_or(false)
    }

    pub fn last_seqnum(&self, id: &ChannelId) -> Option<u64> {
        self.states.get(id).and_then(|state| state.last_seqnum)
    }
}
