//! Per-connection state machine.
//!
//! Every accepted socket runs three cooperating tasks:
//!
//! - a **reader** that decodes command arrays and hands them over on a
//!   bounded channel of depth one (pipelining is preserved, but a slow
//!   dispatcher back-pressures the socket),
//! - a **dispatcher** (this module plus `handlers`) that applies the
//!   subscription-mode gate, the transaction queue, write propagation, and
//!   the reply policy, and
//! - a **writer** that drains the connection's outbound byte queue.
//!
//! The outbound queue is the connection's identity for fan-out: pub/sub
//! delivery and replica propagation clone its sender, so everything that
//! reaches the peer flows through one ordered channel.

use std::collections::HashSet;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pubsub::ConnId;
use crate::state::ServerState;

/// A parsed command plus its exact wire length, which replica-side offset
/// accounting needs.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub name: String,
    pub args: Vec<String>,
    pub wire_len: usize,
}

pub(crate) struct Connection {
    pub state: ServerState,
    pub conn_id: ConnId,
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub in_transaction: bool,
    pub queued: Vec<Command>,
    pub subscribed: HashSet<String>,
    /// True when the peer is a master feeding us its command stream.
    pub is_replica_link: bool,
}

/// Serve an accepted client socket until it closes.
pub(crate) async fn serve(state: ServerState, stream: TcpStream, is_replica_link: bool) {
    let (read_half, write_half) = stream.into_split();
    serve_parts(state, BufReader::new(read_half), write_half, is_replica_link).await;
}

/// Serve an already-split connection. The replica role enters here with the
/// handshake traffic already consumed from the buffered reader.
pub(crate) async fn serve_parts(
    state: ServerState,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    is_replica_link: bool,
) {
    let conn_id = state.next_conn_id();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(1);
    let reader_task = tokio::spawn(read_loop(reader, cmd_tx));

    let mut connection = Connection {
        state: state.clone(),
        conn_id,
        outbound: out_tx,
        in_transaction: false,
        queued: Vec::new(),
        subscribed: HashSet::new(),
        is_replica_link,
    };
    connection.dispatch_loop(cmd_rx).await;

    // Subscriptions die with the connection; replica links are pruned from
    // the fan-out when their next send fails.
    state.pubsub.drop_connection(conn_id).await;
    reader_task.abort();
    writer_task.abort();
    debug!(conn_id, "connection closed");
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, commands: mpsc::Sender<Command>) {
    loop {
        match kv_wire::read_command(&mut reader).await {
            Ok((parts, wire_len)) => {
                let mut parts = parts.into_iter();
                let Some(name) = parts.next() else {
                    continue;
                };
                let command = Command {
                    name,
                    args: parts.collect(),
                    wire_len,
                };
                if commands.send(command).await.is_err() {
                    break;
                }
            }
            Err(kv_wire::WireError::Eof) => {
                debug!("peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "dropping connection on protocol error");
                break;
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(error = %e, "write failed, stopping writer");
            break;
        }
    }
}

impl Connection {
    async fn dispatch_loop(&mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            let reply = self.handle_command(&command, false).await;

            // A replica link only ever answers REPLCONF GETACK; every other
            // reply is discarded. Empty replies are never written.
            let is_getack = kv_wire::keyword_eq(&command.name, "REPLCONF")
                && command
                    .args
                    .first()
                    .is_some_and(|a| kv_wire::keyword_eq(a, "GETACK"));
            if (!self.is_replica_link || is_getack)
                && !reply.is_empty()
                && self.outbound.send(reply).is_err()
            {
                break;
            }

            if self.is_replica_link {
                self.state
                    .replication
                    .add_replica_offset(command.wire_len as u64)
                    .await;
            }
        }
    }

    /// The per-command pipeline: subscription gate, transaction gate,
    /// propagation, then execution. EXEC drains its queue back through this
    /// same pipeline with `in_exec = true` (and the transaction flag off),
    /// so queued mutations propagate exactly like top-level ones.
    async fn handle_command(&mut self, command: &Command, in_exec: bool) -> Vec<u8> {
        if !self.subscribed.is_empty() && !is_sub_mode_command(&command.name) {
            return kv_wire::encode_error(&format!(
                "Can't execute '{}': only (P|S)SUBSCRIBE / (P|S)UNSUBSCRIBE / PING / QUIT / RESET are allowed in this context",
                command.name
            ));
        }

        if self.in_transaction
            && !kv_wire::keyword_eq(&command.name, "EXEC")
            && !kv_wire::keyword_eq(&command.name, "DISCARD")
        {
            self.queued.push(command.clone());
            return kv_wire::encode_simple("QUEUED");
        }

        if is_write_command(&command.name) {
            let mut parts = Vec::with_capacity(command.args.len() + 1);
            parts.push(command.name.clone());
            parts.extend(command.args.iter().cloned());
            self.state.replication.propagate(&parts).await;
        }

        self.execute(command, in_exec).await
    }

    /// Route execution through the transaction gate: ordinary commands run
    /// under the read guard, EXEC takes the write side, and inside EXEC the
    /// write guard is already held. Parking commands manage the gate in
    /// their handlers — the immediate attempt runs under the read guard,
    /// only an actual park releases it.
    async fn execute(&mut self, command: &Command, in_exec: bool) -> Vec<u8> {
        if kv_wire::keyword_eq(&command.name, "EXEC") {
            return self.run_exec().await;
        }
        if in_exec || is_parking_command(command) {
            return self.run(command, in_exec).await;
        }
        let gate = std::sync::Arc::clone(&self.state.exec_gate);
        let _guard = gate.read().await;
        self.run(command, false).await
    }

    async fn run_exec(&mut self) -> Vec<u8> {
        if !self.in_transaction {
            return kv_wire::encode_error("EXEC without MULTI");
        }
        self.in_transaction = false;
        let queued = std::mem::take(&mut self.queued);
        if queued.is_empty() {
            return kv_wire::empty_array();
        }

        // No other connection's commands may interleave with the queue.
        let gate = std::sync::Arc::clone(&self.state.exec_gate);
        let _guard = gate.write().await;

        let mut reply = format!("*{}\r\n", queued.len()).into_bytes();
        for command in &queued {
            // Back through the full dispatcher, transaction flag off, so
            // queued mutations are propagated to replicas. Boxed: this
            // re-entry makes the dispatch future recursive.
            let part = Box::pin(self.handle_command(command, true)).await;
            reply.extend_from_slice(&part);
        }
        reply
    }
}

const WRITE_COMMANDS: [&str; 16] = [
    "SET", "DEL", "INCR", "DECR", "RPUSH", "LPUSH", "LPOP", "RPOP", "XADD", "HMSET", "HSET",
    "HDEL", "EXPIRE", "PEXPIRE", "FLUSHDB", "FLUSHALL",
];

const SUB_MODE_COMMANDS: [&str; 6] = [
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
];

fn is_write_command(name: &str) -> bool {
    WRITE_COMMANDS.iter().any(|c| kv_wire::keyword_eq(c, name))
}

fn is_sub_mode_command(name: &str) -> bool {
    SUB_MODE_COMMANDS
        .iter()
        .any(|c| kv_wire::keyword_eq(c, name))
}

/// Commands that may suspend for a client-supplied duration.
fn is_parking_command(command: &Command) -> bool {
    if kv_wire::keyword_eq(&command.name, "BLPOP") || kv_wire::keyword_eq(&command.name, "WAIT") {
        return true;
    }
    kv_wire::keyword_eq(&command.name, "XREAD")
        && command
            .args
            .iter()
            .any(|a| kv_wire::keyword_eq(a, "BLOCK"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str, args: &[&str]) -> Command {
        Command {
            name: name.to_owned(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            wire_len: 0,
        }
    }

    #[test]
    fn write_command_set_is_case_insensitive() {
        assert!(is_write_command("set"));
        assert!(is_write_command("XADD"));
        assert!(is_write_command("FlushAll"));
        assert!(!is_write_command("GET"));
        assert!(!is_write_command("EXEC"));
    }

    #[test]
    fn parking_commands_are_detected() {
        assert!(is_parking_command(&command("BLPOP", &["q", "0"])));
        assert!(is_parking_command(&command("wait", &["1", "100"])));
        assert!(is_parking_command(&command(
            "XREAD",
            &["BLOCK", "100", "STREAMS", "s", "0-0"]
        )));
        assert!(!is_parking_command(&command(
            "XREAD",
            &["STREAMS", "s", "0-0"]
        )));
        assert!(!is_parking_command(&command("GET", &["k"])));
    }

    #[test]
    fn sub_mode_allows_only_subscription_commands() {
        assert!(is_sub_mode_command("SUBSCRIBE"));
        assert!(is_sub_mode_command("ping"));
        assert!(is_sub_mode_command("QUIT"));
        assert!(!is_sub_mode_command("GET"));
        assert!(!is_sub_mode_command("PUBLISH"));
    }
}
