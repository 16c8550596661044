//! Wait-slot table: the single-delivery handoff from the apply loop to the
//! RPC handler that proposed a command at a given Raft log index.

use std::collections::HashMap;

use crate::raft::LogIndex;
use crate::server::statemach::CommandReply;

use tokio::sync::oneshot;

/// One delivery slot. Whichever side arrives first creates the entry: a
/// handler parks a sender to be filled, the apply loop parks a buffered
/// reply (capacity-one channel semantics).
#[derive(Debug)]
enum WaitSlot {
    Waiting(oneshot::Sender<CommandReply>),
    Delivered(CommandReply),
}

/// Map from Raft log index to its delivery slot. Lives under the server
/// lock; both the RPC handlers and the apply loop touch it.
#[derive(Debug, Default)]
pub struct WaitTable {
    slots: HashMap<LogIndex, WaitSlot>,
}

impl WaitTable {
    pub fn new() -> Self {
        WaitTable {
            slots: HashMap::new(),
        }
    }

    /// Registers interest in `index` and returns the receiving half. If the
    /// apply loop already delivered for this index, the receiver resolves
    /// immediately. A previous waiter at the same index (possible when the
    /// leader lost and regained the slot across terms) is dropped, waking
    /// it with a closed-channel error.
    pub fn register(
        &mut self,
        index: LogIndex,
    ) -> oneshot::Receiver<CommandReply> {
        let (tx, rx) = oneshot::channel();
        match self.slots.remove(&index) {
            Some(WaitSlot::Delivered(reply)) => {
                let _ = tx.send(reply);
            }
            _ => {
                self.slots.insert(index, WaitSlot::Waiting(tx));
            }
        }
        rx
    }

    /// Delivers the reply for `index`, waking the registered handler or
    /// buffering the reply if no handler has registered yet. At most one
    /// delivery per index reaches a handler.
    pub fn deliver(&mut self, index: LogIndex, reply: CommandReply) {
        match self.slots.remove(&index) {
            Some(WaitSlot::Waiting(tx)) => {
                // handler may have timed out and gone already
                let _ = tx.send(reply);
            }
            _ => {
                self.slots.insert(index, WaitSlot::Delivered(reply));
            }
        }
    }

    /// Removes the slot for `index`; idempotent. Called by the handler
    /// after it wakes (success, mismatch, or timeout).
    pub fn remove(&mut self, index: LogIndex) {
        self.slots.remove(&index);
    }

    /// Drops every slot, waking all pending handlers with a closed-channel
    /// error. Used at shutdown.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}
