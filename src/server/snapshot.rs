//! Snapshot manager: encode/decode of the group's full deterministic state,
//! restored on startup and on accepted install-snapshot messages.

use std::collections::HashMap;

use crate::api::{ClientId, CommandId};
use crate::ctrl::{GroupId, ShardConfig, ShardId};
use crate::server::replica::GroupState;
use crate::server::statemach::ShardStateMachine;
use crate::utils::ShardsetError;

use serde::{Deserialize, Serialize};

/// The persisted tuple, in fixed field order. Everything a replica needs
/// to resume its role, including any in-flight migration bookkeeping.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotPayload {
    kv: ShardStateMachine,
    cache: HashMap<ClientId, CommandId>,
    pull_gid: HashMap<ShardId, GroupId>,
    pull_groups: HashMap<GroupId, Vec<String>>,
    config: ShardConfig,
}

impl GroupState {
    /// Serializes the replicated state into the opaque blob handed to Raft.
    pub(crate) fn snapshot_bytes(&self) -> Result<Vec<u8>, ShardsetError> {
        let payload = SnapshotPayload {
            kv: self.kv.clone(),
            cache: self.cache.clone(),
            pull_gid: self.pull_gid.clone(),
            pull_groups: self.pull_groups.clone(),
            config: self.config.clone(),
        };
        Ok(rmp_serde::encode::to_vec(&payload)?)
    }

    /// Adopts a snapshot blob. An empty blob (bootstrap without any state)
    /// is a no-op; a blob that fails to decode logs a fault and leaves
    /// state untouched, letting the replica recover through normal Raft
    /// catch-up.
    pub(crate) fn install_snapshot_bytes(&mut self, prefix: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match rmp_serde::decode::from_slice::<SnapshotPayload>(data) {
            Ok(payload) => {
                self.kv = payload.kv;
                self.cache = payload.cache;
                self.pull_gid = payload.pull_gid;
                self.pull_groups = payload.pull_groups;
                self.config = payload.config;
                pf_info!(prefix; "restored snapshot at config {}",
                                 self.config.num);
            }
            Err(e) => {
                pf_warn!(prefix; "snapshot decode failed, state kept: {}", e);
            }
        }
    }
}
