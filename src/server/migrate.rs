//! Shard migration protocol: the leader-only configuration poller, the
//! puller that fetches waiting shards from their previous owner groups, and
//! the server-side handler answering peer pulls.
//!
//! Neither loop mutates local state directly; every decision is proposed
//! into Raft so all replicas of the group sequence it identically.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::api::{ErrCode, PeerLink, ShardMigrationReply, ShardMigrationRequest};
use crate::ctrl::{CtrlClient, GroupId, ShardId, NSHARDS};
use crate::raft::RaftApi;
use crate::server::apply::{Command, ShardOp};
use crate::server::replica::{GroupReplica, GroupState};
use crate::server::statemach::ShardState;
use crate::utils::ShardsetError;

use futures::future::join_all;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

/// Encodes and proposes a shard op; losing leadership mid-propose is fine,
/// the next leader redoes the work.
fn propose_shard_op(prefix: &str, raft: &dyn RaftApi, sop: ShardOp) {
    match Command::Shard(sop).to_bytes() {
        Ok(bytes) => {
            raft.propose(bytes);
        }
        Err(e) => {
            pf_error!(prefix; "shard op encode failed: {}", e);
        }
    }
}

// GroupReplica configuration poller
impl GroupReplica {
    /// Config poller task: the leader periodically asks the shard
    /// controller for the next configuration and sequences the resulting
    /// transitions through Raft.
    pub(crate) async fn config_poller_task(
        prefix: String,
        gid: GroupId,
        state: Arc<RwLock<GroupState>>,
        raft: Arc<dyn RaftApi>,
        ctrl: Arc<dyn CtrlClient>,
        query_interval_ms: u64,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(prefix; "config poller task spawned");

        let mut ticker =
            time::interval(Duration::from_millis(query_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = Self::poll_config_once(
                        &prefix,
                        gid,
                        &state,
                        raft.as_ref(),
                        ctrl.as_ref(),
                    )
                    .await
                    {
                        pf_warn!(prefix; "config poll failed: {}", e);
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(prefix; "config poller task exitted");
    }

    /// One poll round: query for configuration `num + 1` and, if the
    /// controller has published it, propose the config change followed by
    /// the per-shard `Waiting` transitions for shards newly owned.
    async fn poll_config_once(
        prefix: &str,
        gid: GroupId,
        state: &RwLock<GroupState>,
        raft: &dyn RaftApi,
        ctrl: &dyn CtrlClient,
    ) -> Result<(), ShardsetError> {
        let (_, is_leader) = raft.state();
        if !is_leader {
            return Ok(());
        }

        // clone under the read lock; never hold it across the query
        let old_config = state.read().unwrap().config.clone();
        let new_config = ctrl.query(Some(old_config.num + 1)).await?;
        if new_config.num != old_config.num + 1 {
            return Ok(());
        }

        pf_info!(prefix; "controller published config {}", new_config.num);
        propose_shard_op(
            prefix,
            raft,
            ShardOp::UpdateConfig {
                new_config: new_config.clone(),
            },
        );

        // at bootstrap there is no previous owner to pull from
        if old_config.num == 0 {
            return Ok(());
        }

        for shard in 0..NSHARDS {
            let new_owner = new_config.owner_of(shard);
            let old_owner = old_config.owner_of(shard);
            if new_owner == gid && old_owner != gid && old_owner != 0 {
                let target_servers = old_config
                    .groups
                    .get(&old_owner)
                    .cloned()
                    .unwrap_or_default();
                propose_shard_op(
                    prefix,
                    raft,
                    ShardOp::UpdateShardState {
                        shard,
                        new_state: ShardState::Waiting,
                        target_gid: old_owner,
                        target_servers,
                    },
                );
            }
            // shards lost in this step are retained rather than collected;
            // they keep answering peer pulls from their new owner
        }

        Ok(())
    }
}

// GroupReplica migration puller
impl GroupReplica {
    /// Shard puller task: the leader periodically fans out one worker per
    /// `Waiting` shard to fetch its contents from the previous owner group.
    pub(crate) async fn shard_puller_task(
        prefix: String,
        state: Arc<RwLock<GroupState>>,
        raft: Arc<dyn RaftApi>,
        peers: Arc<dyn PeerLink>,
        pull_interval_ms: u64,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(prefix; "shard puller task spawned");

        let mut ticker =
            time::interval(Duration::from_millis(pull_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    Self::pull_waiting_shards(
                        &prefix,
                        &state,
                        raft.clone(),
                        peers.clone(),
                    )
                    .await;
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(prefix; "shard puller task exitted");
    }

    /// One pull round: snapshot the waiting set under the read lock, then
    /// run all pull workers to completion concurrently.
    async fn pull_waiting_shards(
        prefix: &str,
        state: &RwLock<GroupState>,
        raft: Arc<dyn RaftApi>,
        peers: Arc<dyn PeerLink>,
    ) {
        let (_, is_leader) = raft.state();
        if !is_leader {
            return;
        }

        let (pulls, config_num) = {
            let guard = state.read().unwrap();
            let pulls: Vec<(ShardId, GroupId, Vec<String>)> = guard
                .kv
                .waiting_shards()
                .into_iter()
                .filter_map(|shard| {
                    guard.pull_gid.get(&shard).map(|&target_gid| {
                        (
                            shard,
                            target_gid,
                            guard
                                .pull_groups
                                .get(&target_gid)
                                .cloned()
                                .unwrap_or_default(),
                        )
                    })
                })
                .collect();
            (pulls, guard.config.num)
        };
        if pulls.is_empty() {
            return;
        }

        let workers = pulls.into_iter().map(|(shard, target_gid, servers)| {
            let raft = raft.clone();
            let peers = peers.clone();
            let prefix = prefix.to_string();
            async move {
                Self::pull_one_shard(
                    &prefix, raft, peers, shard, target_gid, servers,
                    config_num,
                )
                .await;
            }
        });
        join_all(workers).await;
    }

    /// Pull worker for a single shard: try each server of the previous
    /// owner group; on the first `OK` reply, propose the installation
    /// through Raft and stop.
    async fn pull_one_shard(
        prefix: &str,
        raft: Arc<dyn RaftApi>,
        peers: Arc<dyn PeerLink>,
        shard: ShardId,
        target_gid: GroupId,
        servers: Vec<String>,
        config_num: u64,
    ) {
        let req = ShardMigrationRequest { shard, config_num };
        for server in &servers {
            match peers.shard_migration(server, req.clone()).await {
                Ok(reply) if reply.err == ErrCode::Ok => {
                    pf_debug!(prefix; "pulled shard {} from group {} via {}",
                                      shard, target_gid, server);
                    propose_shard_op(
                        prefix,
                        raft.as_ref(),
                        ShardOp::UpdateShardDb {
                            shard: reply.shard,
                            db: reply.data,
                            cache: reply.cache,
                            target_gid,
                        },
                    );
                    return;
                }
                Ok(reply) => {
                    pf_trace!(prefix; "peer {} refused shard {}: {}",
                                      server, shard, reply.err);
                }
                Err(e) => {
                    pf_trace!(prefix; "pull of shard {} from {} failed: {}",
                                      shard, server, e);
                }
            }
        }
    }
}

// GroupReplica migration server handler
impl GroupReplica {
    /// Handler for peer groups pulling a shard this group previously
    /// owned. Answers only on the leader, and only once this group's
    /// configuration has caught up with the requester's; the copies
    /// returned are owned, so the live maps keep mutating underneath.
    pub async fn shard_migration(
        &self,
        req: ShardMigrationRequest,
    ) -> ShardMigrationReply {
        let (_, is_leader) = self.raft.state();
        if !is_leader {
            return ShardMigrationReply::refused(
                ErrCode::WrongLeader,
                req.shard,
                0,
            );
        }

        let guard = self.state.read().unwrap();
        if req.config_num > guard.config.num {
            pf_debug!(self.prefix; "shard {} pull at config {} ahead of {}",
                                   req.shard, req.config_num, guard.config.num);
            return ShardMigrationReply::refused(
                ErrCode::NotReady,
                req.shard,
                guard.config.num,
            );
        }

        pf_debug!(self.prefix; "serving shard {} to a peer at config {}",
                               req.shard, guard.config.num);
        ShardMigrationReply {
            err: ErrCode::Ok,
            shard: req.shard,
            config_num: guard.config.num,
            data: guard.kv.shard_db_copy(req.shard),
            cache: guard.cache.clone(),
        }
    }
}
