//! Master-side replication state and write fan-out.
//!
//! Replica links are the outbound senders of the connections that completed
//! a PSYNC; propagation re-encodes the original command as a RESP array and
//! pushes the same bytes into every link's write queue, preserving the
//! order in which the master accepted the commands. A link whose connection
//! has died fails the push and is dropped from the fan-out.
//!
//! Offsets are byte-exact: the master offset advances by the encoded length
//! of every propagated frame, and the replica offset (when this server runs
//! as a replica) advances by the wire length of every command consumed from
//! the master.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::pubsub::ConnId;

struct ReplicaLink {
    conn_id: ConnId,
    tx: UnboundedSender<Vec<u8>>,
}

pub struct Replication {
    /// 40-hex-char replication id: generated at startup on a master,
    /// replaced by the master's id after a replica handshake.
    replid: RwLock<String>,
    /// Total bytes of frames propagated to replicas (master role).
    offset: Mutex<u64>,
    /// Bytes consumed from the master's command stream (replica role).
    replica_offset: Mutex<u64>,
    /// Acknowledgments gathered since the last `WAIT` reset.
    acks: Mutex<usize>,
    replicas: RwLock<Vec<ReplicaLink>>,
}

fn generate_replid() -> String {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex.truncate(40);
    hex
}

impl Default for Replication {
    fn default() -> Self {
        Self::new()
    }
}

impl Replication {
    pub fn new() -> Self {
        Replication {
            replid: RwLock::new(generate_replid()),
            offset: Mutex::new(0),
            replica_offset: Mutex::new(0),
            acks: Mutex::new(0),
            replicas: RwLock::new(Vec::new()),
        }
    }

    pub async fn replid(&self) -> String {
        self.replid.read().await.clone()
    }

    /// Adopt the master's replication id (replica handshake).
    pub async fn set_replid(&self, replid: String) {
        *self.replid.write().await = replid;
    }

    pub async fn offset(&self) -> u64 {
        *self.offset.lock().await
    }

    pub async fn add_offset(&self, bytes: u64) {
        *self.offset.lock().await += bytes;
    }

    pub async fn replica_offset(&self) -> u64 {
        *self.replica_offset.lock().await
    }

    pub async fn add_replica_offset(&self, bytes: u64) {
        *self.replica_offset.lock().await += bytes;
    }

    pub async fn replica_count(&self) -> usize {
        self.replicas.read().await.len()
    }

    /// Attach a freshly synchronized replica to the fan-out.
    pub async fn register_replica(&self, conn_id: ConnId, tx: UnboundedSender<Vec<u8>>) {
        info!(conn_id, "replica registered");
        self.replicas.write().await.push(ReplicaLink { conn_id, tx });
    }

    /// Forward a mutating command to every replica and advance the master
    /// offset by the exact frame length.
    pub async fn propagate(&self, parts: &[String]) {
        let frame = kv_wire::encode_bulk_array(parts);
        *self.offset.lock().await += frame.len() as u64;
        self.fan_out(&frame).await;
    }

    /// Send `REPLCONF GETACK *` to every replica. Returns the frame length;
    /// the `WAIT` barrier adds it to the master offset only after the wait,
    /// so the acks it gathers compare against the pre-GETACK offset.
    pub async fn send_getack(&self) -> u64 {
        let frame = kv_wire::encode_bulk_array(&["REPLCONF", "GETACK", "*"]);
        let len = frame.len() as u64;
        self.fan_out(&frame).await;
        len
    }

    async fn fan_out(&self, frame: &[u8]) {
        let mut replicas = self.replicas.write().await;
        let before = replicas.len();
        replicas.retain(|link| {
            let alive = link.tx.send(frame.to_vec()).is_ok();
            if !alive {
                debug!(conn_id = link.conn_id, "dropping dead replica link");
            }
            alive
        });
        if replicas.len() < before {
            info!(
                remaining = replicas.len(),
                "removed unreachable replicas from fan-out"
            );
        }
    }

    pub async fn reset_acks(&self) {
        *self.acks.lock().await = 0;
    }

    pub async fn acks(&self) -> usize {
        *self.acks.lock().await
    }

    /// Count an ack whose offset has caught up to the master offset at the
    /// moment of receipt.
    pub async fn record_ack(&self, ack_offset: u64) {
        let current = *self.offset.lock().await;
        if ack_offset >= current {
            *self.acks.lock().await += 1;
        }
        debug!(ack_offset, master_offset = current, "replica ack");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn replid_is_forty_hex_chars() {
        let id = generate_replid();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_replid());
    }

    #[tokio::test]
    async fn propagate_advances_offset_by_frame_length() {
        let repl = Replication::new();
        let parts = vec!["SET".to_owned(), "k".to_owned(), "v".to_owned()];
        let expected = kv_wire::encode_bulk_array(&parts).len() as u64;
        repl.propagate(&parts).await;
        assert_eq!(repl.offset().await, expected);
        repl.propagate(&parts).await;
        assert_eq!(repl.offset().await, expected * 2);
    }

    #[tokio::test]
    async fn replicas_receive_frames_in_order() {
        let repl = Replication::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        repl.register_replica(1, tx).await;

        repl.propagate(&["SET".to_owned(), "a".to_owned(), "1".to_owned()])
            .await;
        repl.propagate(&["SET".to_owned(), "b".to_owned(), "2".to_owned()])
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, kv_wire::encode_bulk_array(&["SET", "a", "1"]));
        assert_eq!(second, kv_wire::encode_bulk_array(&["SET", "b", "2"]));
    }

    #[tokio::test]
    async fn dead_links_are_dropped_from_the_fan_out() {
        let repl = Replication::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        repl.register_replica(1, tx).await;
        assert_eq!(repl.replica_count().await, 1);
        repl.propagate(&["SET".to_owned(), "k".to_owned(), "v".to_owned()])
            .await;
        assert_eq!(repl.replica_count().await, 0);
    }

    #[tokio::test]
    async fn acks_count_only_caught_up_replicas() {
        let repl = Replication::new();
        repl.propagate(&["SET".to_owned(), "k".to_owned(), "v".to_owned()])
            .await;
        let offset = repl.offset().await;

        repl.record_ack(offset - 1).await;
        assert_eq!(repl.acks().await, 0);
        repl.record_ack(offset).await;
        assert_eq!(repl.acks().await, 1);
        repl.record_ack(offset + 10).await;
        assert_eq!(repl.acks().await, 2);

        repl.reset_acks().await;
        assert_eq!(repl.acks().await, 0);
    }
}
