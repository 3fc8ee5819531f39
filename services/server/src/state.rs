//! Shared server state handed to every connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::pubsub::{ConnId, PubSub};
use crate::replication::Replication;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "slave",
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<KvStore>,
    pub pubsub: Arc<PubSub>,
    pub replication: Arc<Replication>,
    /// Transaction exclusivity: ordinary commands execute under a read
    /// guard, `EXEC` drains its queue under the write guard. Parking
    /// commands (BLPOP, blocking XREAD, WAIT) run ungated so a blocked
    /// client cannot stall every transaction.
    pub exec_gate: Arc<RwLock<()>>,
    next_conn_id: Arc<AtomicU64>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        ServerState {
            config: Arc::new(config),
            store: Arc::new(KvStore::new()),
            pubsub: Arc::new(PubSub::new()),
            replication: Arc::new(Replication::new()),
            exec_gate: Arc::new(RwLock::new(())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn role(&self) -> Role {
        if self.config.replicaof.is_some() {
            Role::Replica
        } else {
            Role::Master
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}
