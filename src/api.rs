//! Wire-visible API types: client requests and replies, the inter-group
//! migration RPC, the reply code taxonomy, and the connector trait used to
//! reach peer groups. Serialization of these types is part of the wire
//! contract; the transport carrying them is external.

use std::collections::HashMap;
use std::fmt;

use crate::ctrl::ShardId;
use crate::utils::ShardsetError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// Client ID type; chosen by the client clerk, unique across clients.
pub type ClientId = u64;

/// Per-client command sequence number; monotonically increasing.
pub type CommandId = u64;

/// Wire-visible reply code. The serialized representation (and `Display`)
/// are the exact strings peers and clerks match on.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ErrCode {
    /// Operation applied (or was a suppressed duplicate write).
    #[serde(rename = "OK")]
    Ok,

    /// Key not present; definitive, no retry required.
    #[serde(rename = "ErrNoKey")]
    NoKey,

    /// This group does not own the key's shard under its current
    /// configuration; the clerk should re-consult the controller.
    #[serde(rename = "ErrWrongGroup")]
    WrongGroup,

    /// This replica is not the Raft leader of its group.
    #[serde(rename = "ErrWrongLeader")]
    WrongLeader,

    /// The proposal did not apply within the deadline; safe to retry.
    #[serde(rename = "ErrTimeout")]
    Timeout,

    /// The shard is owned but its data has not been migrated in yet.
    #[serde(rename = "ErrNotReady")]
    NotReady,
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrCode::Ok => "OK",
            ErrCode::NoKey => "ErrNoKey",
            ErrCode::WrongGroup => "ErrWrongGroup",
            ErrCode::WrongLeader => "ErrWrongLeader",
            ErrCode::Timeout => "ErrTimeout",
            ErrCode::NotReady => "ErrNotReady",
        };
        write!(f, "{}", s)
    }
}

/// Which write flavor a `PutAppend` request carries.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum PutAppendOp {
    Put,
    Append,
}

/// `Get` RPC request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    pub client_id: ClientId,
    pub command_id: CommandId,
}

/// `Get` RPC reply.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub err: ErrCode,
    pub value: String,
}

/// `PutAppend` RPC request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PutAppendRequest {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub client_id: ClientId,
    pub command_id: CommandId,
}

/// `PutAppend` RPC reply.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub err: ErrCode,
}

/// `ShardMigration` inter-group RPC request: the puller of a waiting shard
/// asks the shard's previous owner group for its contents.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ShardMigrationRequest {
    pub shard: ShardId,
    pub config_num: u64,
}

/// `ShardMigration` inter-group RPC reply. `data` and `cache` are owned
/// deep copies; `config_num` is informational.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ShardMigrationReply {
    pub err: ErrCode,
    pub shard: ShardId,
    pub config_num: u64,
    pub data: HashMap<String, String>,
    pub cache: HashMap<ClientId, CommandId>,
}

impl ShardMigrationReply {
    /// A refusal reply carrying no data.
    pub(crate) fn refused(
        err: ErrCode,
        shard: ShardId,
        config_num: u64,
    ) -> Self {
        ShardMigrationReply {
            err,
            shard,
            config_num,
            data: HashMap::new(),
            cache: HashMap::new(),
        }
    }
}

/// Connector for reaching the servers of peer groups. Implemented by the
/// external RPC transport; the migration puller tries each server of the
/// previous owner group through this seam.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Sends a `ShardMigration` request to the named peer server.
    async fn shard_migration(
        &self,
        server: &str,
        req: ShardMigrationRequest,
    ) -> Result<ShardMigrationReply, ShardsetError>;
}

#[cfg(test)]
mod api_tests {
    use super::*;

    #[test]
    fn err_code_wire_strings() {
        assert_eq!(format!("{}", ErrCode::Ok), "OK");
        assert_eq!(format!("{}", ErrCode::NoKey), "ErrNoKey");
        assert_eq!(format!("{}", ErrCode::WrongGroup), "ErrWrongGroup");
        assert_eq!(format!("{}", ErrCode::WrongLeader), "ErrWrongLeader");
        assert_eq!(format!("{}", ErrCode::Timeout), "ErrTimeout");
        assert_eq!(format!("{}", ErrCode::NotReady), "ErrNotReady");
    }

    #[test]
    fn err_code_codec() -> Result<(), ShardsetError> {
        for code in [
            ErrCode::Ok,
            ErrCode::NoKey,
            ErrCode::WrongGroup,
            ErrCode::WrongLeader,
            ErrCode::Timeout,
            ErrCode::NotReady,
        ] {
            let bytes = rmp_serde::encode::to_vec(&code)?;
            let back: ErrCode = rmp_serde::decode::from_slice(&bytes)?;
            assert_eq!(back, code);
        }
        Ok(())
    }

    #[test]
    fn migration_reply_codec() -> Result<(), ShardsetError> {
        let mut data = HashMap::new();
        data.insert("k".to_string(), "v".to_string());
        let mut cache = HashMap::new();
        cache.insert(7, 42);
        let reply = ShardMigrationReply {
            err: ErrCode::Ok,
            shard: 3,
            config_num: 2,
            data,
            cache,
        };
        let bytes = rmp_serde::encode::to_vec(&reply)?;
        let back: ShardMigrationReply = rmp_serde::decode::from_slice(&bytes)?;
        assert_eq!(back, reply);
        Ok(())
    }
}
