//! Shardset's group server functionality modules.

mod apply;
mod migrate;
mod notify;
mod replica;
mod snapshot;
mod statemach;

pub use replica::{GroupReplica, GroupReplicaConfig, ReplicaId};
pub use statemach::{
    CommandReply, ShardData, ShardState, ShardStateMachine,
};
