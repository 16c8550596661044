//! In-process mock collaborators for driving the group server in tests: a
//! single-voter Raft that commits proposals immediately, a shard controller
//! serving a scripted configuration feed, and a loopback peer connector
//! routing inter-group RPCs to in-process replicas.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::api::{PeerLink, ShardMigrationReply, ShardMigrationRequest};
use crate::ctrl::{CtrlClient, ShardConfig};
use crate::raft::{ApplyMsg, ApplyReceiver, LogIndex, RaftApi, Term};
use crate::server::GroupReplica;
use crate::utils::ShardsetError;

use async_trait::async_trait;

use tokio::sync::mpsc;

struct LocalRaftInner {
    term: Term,
    leader: bool,
    /// Entries at log indexes `base + 1 ..= base + entries.len()`.
    entries: Vec<(Term, Vec<u8>)>,
    /// Highest compacted index.
    base: LogIndex,
    snapshot: Option<(LogIndex, Term, Vec<u8>)>,
    tx: mpsc::UnboundedSender<ApplyMsg>,
}

/// A one-replica "cluster": every proposal commits immediately, in order,
/// onto the apply stream. Supports leadership toggling, log compaction,
/// and restart replay of snapshot + surviving tail.
pub(crate) struct LocalRaft {
    inner: Mutex<LocalRaftInner>,
}

impl LocalRaft {
    pub(crate) fn new_leader() -> (Arc<Self>, ApplyReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let raft = LocalRaft {
            inner: Mutex::new(LocalRaftInner {
                term: 1,
                leader: true,
                entries: vec![],
                base: 0,
                snapshot: None,
                tx,
            }),
        };
        (Arc::new(raft), rx)
    }

    pub(crate) fn set_leader(&self, leader: bool) {
        self.inner.lock().unwrap().leader = leader;
    }

    pub(crate) fn stored_snapshot(&self) -> Option<(LogIndex, Term, Vec<u8>)> {
        self.inner.lock().unwrap().snapshot.clone()
    }

    pub(crate) fn log_len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Simulates a crash-restart: hands out a fresh apply stream carrying
    /// the stored snapshot (if any) followed by the surviving log tail.
    pub(crate) fn restart(&self) -> ApplyReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.lock().unwrap();
        guard.tx = tx;
        if let Some((index, term, data)) = guard.snapshot.clone() {
            let _ = guard.tx.send(ApplyMsg::Snapshot { term, index, data });
        }
        for (offset, (term, data)) in guard.entries.iter().enumerate() {
            let _ = guard.tx.send(ApplyMsg::Command {
                index: guard.base + 1 + offset as LogIndex,
                term: *term,
                data: data.clone(),
            });
        }
        rx
    }
}

impl RaftApi for LocalRaft {
    fn propose(&self, data: Vec<u8>) -> Option<(LogIndex, Term)> {
        let mut guard = self.inner.lock().unwrap();
        if !guard.leader {
            return None;
        }
        let term = guard.term;
        guard.entries.push((term, data.clone()));
        let index = guard.base + guard.entries.len() as LogIndex;
        let _ = guard.tx.send(ApplyMsg::Command { index, term, data });
        Some((index, term))
    }

    fn state(&self) -> (Term, bool) {
        let guard = self.inner.lock().unwrap();
        (guard.term, guard.leader)
    }

    fn state_size(&self) -> usize {
        let guard = self.inner.lock().unwrap();
        guard.entries.iter().map(|(_, data)| data.len()).sum()
    }

    fn snapshot(&self, index: LogIndex, data: Vec<u8>) {
        let mut guard = self.inner.lock().unwrap();
        if index <= guard.base {
            return;
        }
        let drop_n = ((index - guard.base) as usize).min(guard.entries.len());
        guard.entries.drain(0..drop_n);
        guard.base = index;
        let term = guard.term;
        guard.snapshot = Some((index, term, data));
    }

    fn cond_install_snapshot(
        &self,
        _term: Term,
        _index: LogIndex,
        _data: &[u8],
    ) -> bool {
        true
    }
}

/// Shard controller stub serving a scripted, monotonically numbered feed.
pub(crate) struct StaticCtrl {
    configs: Mutex<Vec<ShardConfig>>,
}

impl StaticCtrl {
    /// Starts with only the bootstrap configuration (num 0).
    pub(crate) fn new() -> Self {
        StaticCtrl {
            configs: Mutex::new(vec![ShardConfig::default()]),
        }
    }

    /// Publishes the next configuration; its num must extend the feed.
    pub(crate) fn push(&self, config: ShardConfig) {
        let mut configs = self.configs.lock().unwrap();
        assert_eq!(config.num as usize, configs.len());
        configs.push(config);
    }
}

#[async_trait]
impl CtrlClient for StaticCtrl {
    async fn query(
        &self,
        num: Option<u64>,
    ) -> Result<ShardConfig, ShardsetError> {
        let configs = self.configs.lock().unwrap();
        let config = match num {
            Some(n) if (n as usize) < configs.len() => {
                configs[n as usize].clone()
            }
            _ => configs.last().unwrap().clone(),
        };
        Ok(config)
    }
}

/// Peer connector routing migration RPCs to in-process replicas by server
/// name; unregistered names behave like unreachable hosts.
pub(crate) struct LoopbackPeers {
    routes: Mutex<HashMap<String, Arc<GroupReplica>>>,
}

impl LoopbackPeers {
    pub(crate) fn new() -> Self {
        LoopbackPeers {
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, server: &str, replica: Arc<GroupReplica>) {
        self.routes
            .lock()
            .unwrap()
            .insert(server.to_string(), replica);
    }
}

#[async_trait]
impl PeerLink for LoopbackPeers {
    async fn shard_migration(
        &self,
        server: &str,
        req: ShardMigrationRequest,
    ) -> Result<ShardMigrationReply, ShardsetError> {
        let target = self.routes.lock().unwrap().get(server).cloned();
        match target {
            Some(replica) => Ok(replica.shard_migration(req).await),
            None => Err(ShardsetError(format!("no route to '{}'", server))),
        }
    }
}

#[cfg(test)]
mod testing_tests {
    use super::*;

    #[tokio::test]
    async fn local_raft_commits_in_order() {
        let (raft, mut rx) = LocalRaft::new_leader();
        assert_eq!(raft.propose(vec![1]), Some((1, 1)));
        assert_eq!(raft.propose(vec![2]), Some((2, 1)));
        raft.set_leader(false);
        assert_eq!(raft.propose(vec![3]), None);

        match rx.recv().await.unwrap() {
            ApplyMsg::Command { index, data, .. } => {
                assert_eq!((index, data), (1, vec![1]));
            }
            msg => panic!("unexpected msg {:?}", msg),
        }
        match rx.recv().await.unwrap() {
            ApplyMsg::Command { index, data, .. } => {
                assert_eq!((index, data), (2, vec![2]));
            }
            msg => panic!("unexpected msg {:?}", msg),
        }
    }

    #[tokio::test]
    async fn local_raft_compacts_and_replays() {
        let (raft, _rx) = LocalRaft::new_leader();
        for i in 0..5u8 {
            raft.propose(vec![i]);
        }
        raft.snapshot(3, vec![0xaa]);
        assert_eq!(raft.log_len(), 2);
        assert_eq!(raft.state_size(), 2);

        let mut rx = raft.restart();
        match rx.recv().await.unwrap() {
            ApplyMsg::Snapshot { index, data, .. } => {
                assert_eq!((index, data), (3, vec![0xaa]));
            }
            msg => panic!("unexpected msg {:?}", msg),
        }
        match rx.recv().await.unwrap() {
            ApplyMsg::Command { index, data, .. } => {
                assert_eq!((index, data), (4, vec![3]));
            }
            msg => panic!("unexpected msg {:?}", msg),
        }
        match rx.recv().await.unwrap() {
            ApplyMsg::Command { index, data, .. } => {
                assert_eq!((index, data), (5, vec![4]));
            }
            msg => panic!("unexpected msg {:?}", msg),
        }
    }

    #[tokio::test]
    async fn static_ctrl_feed() -> Result<(), ShardsetError> {
        let ctrl = StaticCtrl::new();
        assert_eq!(ctrl.query(Some(1)).await?.num, 0); // beyond feed: latest
        let mut config = ShardConfig::default();
        config.num = 1;
        ctrl.push(config);
        assert_eq!(ctrl.query(Some(1)).await?.num, 1);
        assert_eq!(ctrl.query(None).await?.num, 1);
        assert_eq!(ctrl.query(Some(7)).await?.num, 1);
        Ok(())
    }
}
