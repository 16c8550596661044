//! Group server replica: ties the functionality modules together, spawns
//! the long-running tasks, and exposes the client-facing RPC handlers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::api::{
    ClientId, CommandId, ErrCode, GetReply, GetRequest, PeerLink,
    PutAppendOp, PutAppendReply, PutAppendRequest,
};
use crate::ctrl::{key_to_shard, CtrlClient, GroupId, ShardConfig, ShardId};
use crate::raft::{ApplyReceiver, LogIndex, RaftApi};
use crate::server::apply::{Command, Op, OpKind};
use crate::server::notify::WaitTable;
use crate::server::statemach::{CommandReply, ShardStateMachine};
use crate::utils::ShardsetError;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

/// Server replica ID type (index within its group).
pub type ReplicaId = u8;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupReplicaConfig {
    /// How long a client RPC handler waits for its proposal to apply, in
    /// millisecs, before telling the client to retry.
    pub op_timeout_ms: u64,

    /// Cadence of the leader's shard controller polling, in millisecs.
    pub query_interval_ms: u64,

    /// Cadence of the leader's migration pull rounds, in millisecs.
    pub pull_interval_ms: u64,

    /// Snapshot once Raft's persisted state exceeds this many bytes. 0
    /// means never snapshot.
    pub max_raft_state: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for GroupReplicaConfig {
    fn default() -> Self {
        GroupReplicaConfig {
            op_timeout_ms: 250,
            query_interval_ms: 50,
            pull_interval_ms: 10,
            max_raft_state: 0,
        }
    }
}

/// All replicated state of the group replica, guarded by one server lock.
/// Only the apply loop writes the replicated fields; the wait table is
/// shared with the RPC handlers.
pub(crate) struct GroupState {
    /// Shard-partitioned key/value state machine.
    pub(crate) kv: ShardStateMachine,

    /// Duplicate table: per client, the highest acknowledged write.
    pub(crate) cache: HashMap<ClientId, CommandId>,

    /// Wait slots of in-flight client RPCs, keyed by Raft log index.
    pub(crate) wait: WaitTable,

    /// Currently adopted shard configuration.
    pub(crate) config: ShardConfig,

    /// For each `Waiting` shard, the previous owner group to pull from.
    pub(crate) pull_gid: HashMap<ShardId, GroupId>,

    /// Server addresses of groups we are pulling from.
    pub(crate) pull_groups: HashMap<GroupId, Vec<String>>,

    /// Index of the highest applied log entry.
    pub(crate) last_applied: LogIndex,

    /// Index covered by the last snapshot handed to Raft.
    pub(crate) last_snapshot: LogIndex,
}

impl GroupState {
    pub(crate) fn new() -> Self {
        GroupState {
            kv: ShardStateMachine::default(),
            cache: HashMap::new(),
            wait: WaitTable::new(),
            config: ShardConfig::default(),
            pull_gid: HashMap::new(),
            pull_groups: HashMap::new(),
            last_applied: 0,
            last_snapshot: 0,
        }
    }
}

/// Shard group server replica module.
pub struct GroupReplica {
    /// ID of the group this replica belongs to.
    gid: GroupId,

    /// Log prefix string ("gid-me").
    pub(crate) prefix: String,

    /// Configuration parameters struct.
    config: GroupReplicaConfig,

    /// Handle to the group's consensus module.
    pub(crate) raft: Arc<dyn RaftApi>,

    /// Replicated state under the server lock.
    pub(crate) state: Arc<RwLock<GroupState>>,

    /// Termination signal to the long-running tasks.
    tx_term: watch::Sender<bool>,

    /// Join handles of the applier, config poller, and shard puller tasks.
    applier_handle: Option<JoinHandle<()>>,
    poller_handle: Option<JoinHandle<()>>,
    puller_handle: Option<JoinHandle<()>>,
}

impl GroupReplica {
    /// Creates the replica, restores any initial snapshot handed over by
    /// the persistence owner, and spawns the applier, config poller, and
    /// shard puller tasks.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_and_setup(
        gid: GroupId,
        me: ReplicaId,
        config_str: Option<&str>,
        raft: Arc<dyn RaftApi>,
        ctrl: Arc<dyn CtrlClient>,
        peers: Arc<dyn PeerLink>,
        apply_rx: ApplyReceiver,
        initial_snapshot: Option<Vec<u8>>,
    ) -> Result<Self, ShardsetError> {
        let prefix = format!("{}-{}", gid, me);

        let config = parsed_config!(config_str => GroupReplicaConfig;
                                    op_timeout_ms, query_interval_ms,
                                    pull_interval_ms, max_raft_state)?;
        if config.op_timeout_ms == 0 {
            return logged_err!(prefix; "invalid op_timeout_ms {}",
                                       config.op_timeout_ms);
        }
        if config.query_interval_ms == 0 {
            return logged_err!(prefix; "invalid query_interval_ms {}",
                                       config.query_interval_ms);
        }
        if config.pull_interval_ms == 0 {
            return logged_err!(prefix; "invalid pull_interval_ms {}",
                                       config.pull_interval_ms);
        }

        let mut init_state = GroupState::new();
        if let Some(snap) = initial_snapshot {
            init_state.install_snapshot_bytes(&prefix, &snap);
        }
        let state = Arc::new(RwLock::new(init_state));

        let (tx_term, rx_term) = watch::channel(false);

        let applier_handle = tokio::spawn(Self::applier_task(
            prefix.clone(),
            gid,
            state.clone(),
            raft.clone(),
            apply_rx,
            config.max_raft_state,
            rx_term.clone(),
        ));
        let poller_handle = tokio::spawn(Self::config_poller_task(
            prefix.clone(),
            gid,
            state.clone(),
            raft.clone(),
            ctrl,
            config.query_interval_ms,
            rx_term.clone(),
        ));
        let puller_handle = tokio::spawn(Self::shard_puller_task(
            prefix.clone(),
            state.clone(),
            raft.clone(),
            peers,
            config.pull_interval_ms,
            rx_term,
        ));

        pf_info!(prefix; "group replica setup done");
        Ok(GroupReplica {
            gid,
            prefix,
            config,
            raft,
            state,
            tx_term,
            applier_handle: Some(applier_handle),
            poller_handle: Some(poller_handle),
            puller_handle: Some(puller_handle),
        })
    }

    /// ID of the group this replica belongs to.
    pub fn gid(&self) -> GroupId {
        self.gid
    }

    /// Whether this replica currently believes it is its group's leader.
    pub fn is_leader(&self) -> bool {
        self.raft.state().1
    }

    /// Signals all long-running tasks to exit and waits for them; pending
    /// client RPC handlers are woken and their replies dropped.
    pub async fn shutdown(&mut self) -> Result<(), ShardsetError> {
        self.tx_term.send(true)?;
        self.state.write().unwrap().wait.clear();
        for handle in [
            self.applier_handle.take(),
            self.poller_handle.take(),
            self.puller_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.await?;
        }
        pf_info!(self.prefix; "group replica shut down");
        Ok(())
    }
}

// GroupReplica client RPC handlers
impl GroupReplica {
    /// `Get` RPC handler.
    pub async fn get(&self, req: GetRequest) -> GetReply {
        let shard = key_to_shard(&req.key);
        {
            let guard = self.state.read().unwrap();
            if guard.config.owner_of(shard) != self.gid {
                pf_debug!(self.prefix; "shard {} of key belongs to group {}",
                                       shard, guard.config.owner_of(shard));
                return GetReply {
                    err: ErrCode::WrongGroup,
                    value: String::new(),
                };
            }
        }

        let op = Op {
            kind: OpKind::Get,
            key: req.key,
            value: String::new(),
            shard,
            client_id: req.client_id,
            command_id: req.command_id,
        };
        let reply = self.await_applied(op).await;
        GetReply {
            err: reply.err,
            value: reply.value,
        }
    }

    /// `PutAppend` RPC handler.
    pub async fn put_append(&self, req: PutAppendRequest) -> PutAppendReply {
        let shard = key_to_shard(&req.key);
        {
            let guard = self.state.read().unwrap();
            if guard.config.owner_of(shard) != self.gid {
                pf_debug!(self.prefix; "shard {} of key belongs to group {}",
                                       shard, guard.config.owner_of(shard));
                return PutAppendReply {
                    err: ErrCode::WrongGroup,
                };
            }
            // an already-acknowledged write needs no consensus round
            if guard.cache_hit(req.client_id, req.command_id) {
                pf_debug!(self.prefix; "suppressed duplicate {} of client {}",
                                       req.command_id, req.client_id);
                return PutAppendReply { err: ErrCode::Ok };
            }
        }

        let kind = match req.op {
            PutAppendOp::Put => OpKind::Put,
            PutAppendOp::Append => OpKind::Append,
        };
        let op = Op {
            kind,
            key: req.key,
            value: req.value,
            shard,
            client_id: req.client_id,
            command_id: req.command_id,
        };
        let reply = self.await_applied(op).await;
        PutAppendReply { err: reply.err }
    }

    /// Proposes a client op into Raft and parks on a wait slot until the
    /// apply loop delivers the reply or the deadline passes.
    async fn await_applied(&self, op: Op) -> CommandReply {
        let bytes = match Command::Client(op).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                pf_error!(self.prefix; "client op encode failed: {}", e);
                return CommandReply::plain(ErrCode::Timeout);
            }
        };
        let Some((index, _term)) = self.raft.propose(bytes) else {
            return CommandReply::plain(ErrCode::WrongLeader);
        };

        let rx = self.state.write().unwrap().wait.register(index);
        let deadline = Duration::from_millis(self.config.op_timeout_ms);
        let reply = match time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            // slot replaced or table cleared from under us; same treatment
            // as a timeout, the client retries safely
            Ok(Err(_)) => CommandReply::plain(ErrCode::Timeout),
            Err(_) => {
                pf_debug!(self.prefix; "timed out waiting on slot {}", index);
                CommandReply::plain(ErrCode::Timeout)
            }
        };
        self.state.write().unwrap().wait.remove(index);
        reply
    }
}
