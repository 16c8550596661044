//! Shard-partitioned state machine: the deterministic map from shard ID to
//! per-shard key/value table. Mutated only by the apply loop, in the order
//! Raft delivers commits.

use std::collections::HashMap;

use crate::api::ErrCode;
use crate::ctrl::ShardId;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a shard held by this group.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ShardState {
    /// Owned and serving client operations.
    Ready,

    /// Owned per the current configuration, but the data has not been
    /// received from the previous owner group yet.
    Waiting,

    /// No longer owned; retained only to answer peer pulls until reclaimed.
    Gc,
}

/// A shard's key/value table together with its lifecycle state.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ShardData {
    pub state: ShardState,
    pub db: HashMap<String, String>,
}

impl ShardData {
    /// A freshly allocated, empty, serving shard.
    fn fresh() -> Self {
        ShardData {
            state: ShardState::Ready,
            db: HashMap::new(),
        }
    }

    /// `Some(code)` if this shard cannot serve client operations right now.
    fn serving_gate(&self) -> Option<ErrCode> {
        match self.state {
            ShardState::Ready => None,
            ShardState::Waiting => Some(ErrCode::NotReady),
            ShardState::Gc => Some(ErrCode::WrongGroup),
        }
    }
}

/// Execution result handed from the apply loop to the RPC handler that
/// proposed the command.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub err: ErrCode,
    pub value: String,
}

impl CommandReply {
    /// A reply carrying only a code.
    pub fn plain(err: ErrCode) -> Self {
        CommandReply {
            err,
            value: String::new(),
        }
    }
}

/// The deterministic shard map. Only shards this group owns (or recently
/// owned) are present; a shard's entry is created on its first write or
/// installed on migration receipt.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ShardStateMachine {
    shards: HashMap<ShardId, ShardData>,
}

impl ShardStateMachine {
    /// Looks up a key in the given shard.
    pub fn get(&self, shard: ShardId, key: &str) -> (ErrCode, String) {
        match self.shards.get(&shard) {
            None => (ErrCode::NoKey, String::new()),
            Some(data) => {
                if let Some(code) = data.serving_gate() {
                    return (code, String::new());
                }
                match data.db.get(key) {
                    Some(value) => (ErrCode::Ok, value.clone()),
                    None => (ErrCode::NoKey, String::new()),
                }
            }
        }
    }

    /// Stores a value into the given shard.
    pub fn put(&mut self, shard: ShardId, key: &str, value: &str) -> ErrCode {
        let data = self.shards.entry(shard).or_insert_with(ShardData::fresh);
        if let Some(code) = data.serving_gate() {
            return code;
        }
        data.db.insert(key.to_string(), value.to_string());
        ErrCode::Ok
    }

    /// Appends to a value in the given shard, starting from empty if the
    /// key is absent.
    pub fn append(&mut self, shard: ShardId, key: &str, value: &str) -> ErrCode {
        let data = self.shards.entry(shard).or_insert_with(ShardData::fresh);
        if let Some(code) = data.serving_gate() {
            return code;
        }
        data.db.entry(key.to_string()).or_default().push_str(value);
        ErrCode::Ok
    }

    /// Current lifecycle state of a shard, if allocated.
    pub fn shard_state(&self, shard: ShardId) -> Option<ShardState> {
        self.shards.get(&shard).map(|data| data.state)
    }

    /// Sets the lifecycle state of a shard, allocating an empty entry if
    /// the shard was never populated.
    pub fn set_shard_state(&mut self, shard: ShardId, state: ShardState) {
        let data = self.shards.entry(shard).or_insert_with(ShardData::fresh);
        data.state = state;
    }

    /// Installs migrated shard contents: creates the shard if absent,
    /// otherwise overlays the delivered entries; the shard becomes `Ready`
    /// either way.
    pub fn install_shard(&mut self, shard: ShardId, db: HashMap<String, String>) {
        match self.shards.get_mut(&shard) {
            None => {
                self.shards.insert(
                    shard,
                    ShardData {
                        state: ShardState::Ready,
                        db,
                    },
                );
            }
            Some(data) => {
                data.state = ShardState::Ready;
                data.db.extend(db);
            }
        }
    }

    /// Owned deep copy of a shard's table, empty if never populated. The
    /// copy is what travels in a migration reply while the live table keeps
    /// mutating.
    pub fn shard_db_copy(&self, shard: ShardId) -> HashMap<String, String> {
        self.shards
            .get(&shard)
            .map(|data| data.db.clone())
            .unwrap_or_default()
    }

    /// IDs of all shards currently in `Waiting`.
    pub fn waiting_shards(&self) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|(_, data)| data.state == ShardState::Waiting)
            .map(|(&shard, _)| shard)
            .collect()
    }
}
