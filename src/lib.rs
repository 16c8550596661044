//! Public interface to the Shardset core library: the replicated key/value
//! group server, and the contracts it consumes from its external
//! collaborators (consensus module, shard controller, RPC transport).

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod api;
mod ctrl;
mod raft;
mod server;

#[cfg(test)]
mod testing;

pub use api::{
    ClientId, CommandId, ErrCode, GetReply, GetRequest, PeerLink,
    PutAppendOp, PutAppendReply, PutAppendRequest, ShardMigrationReply,
    ShardMigrationRequest,
};
pub use ctrl::{
    key_to_shard, CtrlClient, GroupId, ShardConfig, ShardId, NSHARDS,
};
pub use raft::{ApplyMsg, ApplyReceiver, LogIndex, RaftApi, Term};
pub use server::{
    CommandReply, GroupReplica, GroupReplicaConfig, ReplicaId, ShardData,
    ShardState, ShardStateMachine,
};
pub use utils::ShardsetError;
