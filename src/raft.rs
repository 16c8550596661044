//! Raft consumer contract: the interface this crate requires from the
//! external consensus module.
//!
//! The core proposes opaque command bytes and receives them back, in agreed
//! order on every replica of the group, through the apply stream.

use tokio::sync::mpsc;

/// Term number type, defined for better code readability.
pub type Term = u64;

/// Raft log slot index type.
pub type LogIndex = u64;

/// One message on the ordered commit stream from Raft.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ApplyMsg {
    /// A committed log entry carrying an opaque command payload.
    Command {
        index: LogIndex,
        term: Term,
        data: Vec<u8>,
    },

    /// A snapshot the state machine should adopt, subject to the
    /// `cond_install_snapshot` gate.
    Snapshot {
        term: Term,
        index: LogIndex,
        data: Vec<u8>,
    },
}

/// Receiver half of the commit stream, fed into the apply loop.
pub type ApplyReceiver = mpsc::UnboundedReceiver<ApplyMsg>;

/// Handle to the consensus module of this group.
pub trait RaftApi: Send + Sync {
    /// Proposes a command. Returns the log slot and term the entry will
    /// occupy if committed, or `None` if this replica is not the leader.
    fn propose(&self, data: Vec<u8>) -> Option<(LogIndex, Term)>;

    /// Current term and whether this replica believes it is the leader.
    fn state(&self) -> (Term, bool);

    /// Size in bytes of Raft's persisted state, consulted by the snapshot
    /// trigger.
    fn state_size(&self) -> usize;

    /// Hands Raft a snapshot covering the log up to and including `index`
    /// so it can discard that prefix. The blob is co-persisted atomically
    /// with Raft's own state.
    fn snapshot(&self, index: LogIndex, data: Vec<u8>);

    /// Gate called before adopting a leader-installed snapshot; Raft may
    /// refuse based on its own rules.
    fn cond_install_snapshot(
        &self,
        term: Term,
        index: LogIndex,
        data: &[u8],
    ) -> bool;
}
