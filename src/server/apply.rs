//! Apply loop: the single consumer of Raft's commit stream and the only
//! writer of replicated group state. Also defines the tagged command
//! payloads that travel through Raft as opaque bytes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::api::{ClientId, CommandId, ErrCode};
use crate::ctrl::{GroupId, ShardConfig, ShardId};
use crate::raft::{ApplyMsg, ApplyReceiver, RaftApi};
use crate::server::replica::{GroupReplica, GroupState};
use crate::server::statemach::{CommandReply, ShardState};
use crate::utils::ShardsetError;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;

/// Client operation flavor.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub(crate) enum OpKind {
    Get,
    Put,
    Append,
}

/// A client command as proposed into Raft.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) struct Op {
    pub kind: OpKind,
    pub key: String,
    pub value: String,
    pub shard: ShardId,
    pub client_id: ClientId,
    pub command_id: CommandId,
}

/// A configuration/migration command. Sequenced through Raft so that every
/// replica of the group makes the same decision in the same order.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum ShardOp {
    /// Adopt the next configuration.
    UpdateConfig { new_config: ShardConfig },

    /// Transition one shard's lifecycle state; `Waiting` additionally
    /// records where to pull the shard's data from.
    UpdateShardState {
        shard: ShardId,
        new_state: ShardState,
        target_gid: GroupId,
        target_servers: Vec<String>,
    },

    /// Install migrated shard contents and merge the source group's
    /// duplicate table.
    UpdateShardDb {
        shard: ShardId,
        db: HashMap<String, String>,
        cache: HashMap<ClientId, CommandId>,
        target_gid: GroupId,
    },
}

/// Tagged command payload carried as opaque bytes through Raft. The enum
/// tag is the explicit discriminator in the persisted/transmitted form.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum Command {
    Client(Op),
    Shard(ShardOp),
}

impl Command {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, ShardsetError> {
        Ok(rmp_serde::encode::to_vec(self)?)
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<Command, ShardsetError> {
        Ok(rmp_serde::decode::from_slice(data)?)
    }
}

// GroupState command application logic
impl GroupState {
    /// True if this client's write numbered `command_id` has already been
    /// acknowledged.
    pub(crate) fn cache_hit(
        &self,
        client: ClientId,
        command: CommandId,
    ) -> bool {
        self.cache.get(&client).map_or(false, |&seen| seen >= command)
    }

    /// Applies one client command, producing the reply for its proposer.
    fn apply_client_op(&mut self, gid: GroupId, op: &Op) -> CommandReply {
        // a write already acknowledged must not touch the db again
        if op.kind != OpKind::Get && self.cache_hit(op.client_id, op.command_id)
        {
            return CommandReply::plain(ErrCode::Ok);
        }

        // the configuration may have advanced between the propose and this
        // apply; re-validate ownership here so followers agree
        if self.config.owner_of(op.shard) != gid {
            return CommandReply::plain(ErrCode::WrongGroup);
        }

        let reply = match op.kind {
            OpKind::Get => {
                let (err, value) = self.kv.get(op.shard, &op.key);
                CommandReply { err, value }
            }
            OpKind::Put => {
                CommandReply::plain(self.kv.put(op.shard, &op.key, &op.value))
            }
            OpKind::Append => CommandReply::plain(self.kv.append(
                op.shard,
                &op.key,
                &op.value,
            )),
        };

        if op.kind != OpKind::Get && reply.err == ErrCode::Ok {
            self.cache.insert(op.client_id, op.command_id);
        }
        reply
    }

    /// Applies one configuration/migration command.
    fn apply_shard_op(&mut self, prefix: &str, sop: ShardOp) {
        match sop {
            ShardOp::UpdateConfig { new_config } => {
                // configurations advance exactly one step at a time
                if new_config.num != self.config.num + 1 {
                    pf_debug!(prefix; "discarding config {} at config {}",
                                      new_config.num, self.config.num);
                    return;
                }
                pf_info!(prefix; "adopted config {}", new_config.num);
                self.config = new_config;
            }

            ShardOp::UpdateShardState {
                shard,
                new_state,
                target_gid,
                target_servers,
            } => {
                self.kv.set_shard_state(shard, new_state);
                if new_state == ShardState::Waiting {
                    self.pull_gid.insert(shard, target_gid);
                    self.pull_groups.insert(target_gid, target_servers);
                }
                pf_debug!(prefix; "shard {} now {:?}", shard, new_state);
            }

            ShardOp::UpdateShardDb {
                shard,
                db,
                cache,
                target_gid,
            } => {
                self.kv.install_shard(shard, db);
                // adopt the source group's highest acknowledged command per
                // client, preserving exactly-once across the migration
                for (client, seen) in cache {
                    let slot = self.cache.entry(client).or_insert(0);
                    if seen > *slot {
                        *slot = seen;
                    }
                }
                self.pull_gid.remove(&shard);
                self.pull_groups.remove(&target_gid);
                pf_info!(prefix; "installed migrated shard {}", shard);
            }
        }
    }
}

// GroupReplica apply loop
impl GroupReplica {
    /// Apply loop task: consumes the ordered commit stream until Raft drops
    /// its sender or the termination signal fires.
    pub(crate) async fn applier_task(
        prefix: String,
        gid: GroupId,
        state: Arc<RwLock<GroupState>>,
        raft: Arc<dyn RaftApi>,
        mut apply_rx: ApplyReceiver,
        max_raft_state: usize,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(prefix; "applier task spawned");

        loop {
            tokio::select! {
                msg = apply_rx.recv() => {
                    match msg {
                        Some(msg) => Self::handle_apply_msg(
                            &prefix,
                            gid,
                            &state,
                            raft.as_ref(),
                            max_raft_state,
                            msg,
                        ),
                        None => break, // commit stream closed
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(prefix; "applier task exitted");
    }

    /// Processes one commit stream message. Holds the server write lock
    /// across the whole message so that the state change, duplicate-table
    /// update, and wait-slot delivery land atomically.
    pub(crate) fn handle_apply_msg(
        prefix: &str,
        gid: GroupId,
        state: &RwLock<GroupState>,
        raft: &dyn RaftApi,
        max_raft_state: usize,
        msg: ApplyMsg,
    ) {
        match msg {
            ApplyMsg::Snapshot { term, index, data } => {
                if !raft.cond_install_snapshot(term, index, &data) {
                    return;
                }
                let mut guard = state.write().unwrap();
                guard.install_snapshot_bytes(prefix, &data);
                guard.last_applied = index;
                guard.maybe_trigger_snapshot(prefix, raft, max_raft_state);
            }

            ApplyMsg::Command { index, term, data } => {
                let mut guard = state.write().unwrap();
                if index <= guard.last_applied {
                    pf_debug!(prefix; "discarding outdated entry {} <= {}",
                                      index, guard.last_applied);
                    return;
                }
                guard.last_applied = index;

                match Command::from_bytes(&data) {
                    Ok(Command::Client(op)) => {
                        let reply = guard.apply_client_op(gid, &op);
                        pf_trace!(prefix; "applied {:?} of client {} -> {}",
                                          op.kind, op.client_id, reply.err);
                        // wake the proposing handler only if leadership was
                        // held through this entry's term; a stale commit
                        // must let the handler time out instead
                        let (curr_term, is_leader) = raft.state();
                        if is_leader && curr_term == term {
                            guard.wait.deliver(index, reply);
                        }
                    }
                    Ok(Command::Shard(sop)) => {
                        guard.apply_shard_op(prefix, sop);
                    }
                    Err(e) => {
                        pf_error!(prefix; "undecodable entry at {}: {}",
                                          index, e);
                    }
                }

                guard.maybe_trigger_snapshot(prefix, raft, max_raft_state);
            }
        }
    }
}

impl GroupState {
    /// Hands Raft a fresh snapshot once its persisted state outgrows the
    /// configured threshold (0 disables snapshotting).
    fn maybe_trigger_snapshot(
        &mut self,
        prefix: &str,
        raft: &dyn RaftApi,
        max_raft_state: usize,
    ) {
        if max_raft_state == 0
            || raft.state_size() <= max_raft_state
            || self.last_applied <= self.last_snapshot
        {
            return;
        }
        match self.snapshot_bytes() {
            Ok(bytes) => {
                pf_debug!(prefix; "snapshotting at {} ({} bytes)",
                                  self.last_applied, bytes.len());
                raft.snapshot(self.last_applied, bytes);
                self.last_snapshot = self.last_applied;
            }
            Err(e) => {
                pf_error!(prefix; "snapshot encode failed: {}", e);
            }
        }
    }
}
