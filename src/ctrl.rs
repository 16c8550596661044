//! Shard controller contract: the configuration type, the deterministic
//! key-to-shard mapping, and the query interface the config poller consumes.
//!
//! The controller itself is an external replicated service; this crate only
//! ever asks it "what is configuration N".

use std::collections::HashMap;

use crate::utils::ShardsetError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// Number of key partitions. Fixed for the lifetime of the system and part
/// of the wire contract shared by every group and the controller.
pub const NSHARDS: usize = 10;

/// Shard ID type, in `[0, NSHARDS)`.
pub type ShardId = usize;

/// Replica group ID type. Group 0 means "unassigned".
pub type GroupId = u64;

/// An assignment of all shards to groups, uniquely numbered by the shard
/// controller. Number 0 is the bootstrap configuration in which no group
/// owns anything.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Configuration number; strictly increasing along the controller feed.
    pub num: u64,

    /// Owner group of each shard.
    pub shards: [GroupId; NSHARDS],

    /// Server addresses of each active group.
    pub groups: HashMap<GroupId, Vec<String>>,
}

impl ShardConfig {
    /// Owner group of the given shard.
    pub fn owner_of(&self, shard: ShardId) -> GroupId {
        self.shards[shard]
    }
}

/// Maps a key to the shard responsible for it. Pure function over the key
/// bytes, identical across all groups.
pub fn key_to_shard(key: &str) -> ShardId {
    let lead = key.as_bytes().first().copied().unwrap_or(0);
    lead as ShardId % NSHARDS
}

/// Query stub to the shard controller service.
#[async_trait]
pub trait CtrlClient: Send + Sync {
    /// Returns the configuration numbered `num`, or the latest one if `num`
    /// is `None` or beyond the controller's feed.
    async fn query(&self, num: Option<u64>)
        -> Result<ShardConfig, ShardsetError>;
}
