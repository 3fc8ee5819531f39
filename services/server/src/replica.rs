//! Replica-role client: dial the master, run the handshake, then feed the
//! same connection into the regular dispatcher as a command intake.
//!
//! # Protocol
//! 1. Connect to the master's TCP address
//! 2. Send `PING` — expect one reply line
//! 3. Send `REPLCONF listening-port <own port>` — expect one reply line
//! 4. Send `REPLCONF capa psync2` — expect one reply line
//! 5. Send `PSYNC ? -1` — expect `+FULLRESYNC <replid> <offset>`
//! 6. Read the snapshot payload and load its string records
//! 7. Hand the connection to the dispatcher with `is_replica_link = true`

use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::connection;
use crate::state::ServerState;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("failed to connect to master: {0}")]
    Connect(std::io::Error),
    #[error("handshake io: {0}")]
    Wire(#[from] kv_wire::WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake protocol: {0}")]
    Protocol(String),
}

/// Run the replica role against `host:port`. Returns only on handshake
/// failure or when the master link closes.
pub(crate) async fn run_replica(
    state: ServerState,
    host: &str,
    port: u16,
    own_port: u16,
) -> Result<(), ReplicaError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(ReplicaError::Connect)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    send_and_expect(&mut reader, &mut writer, &["PING"]).await?;
    let listening_port = own_port.to_string();
    send_and_expect(
        &mut reader,
        &mut writer,
        &["REPLCONF", "listening-port", listening_port.as_str()],
    )
    .await?;
    send_and_expect(&mut reader, &mut writer, &["REPLCONF", "capa", "psync2"]).await?;

    writer
        .write_all(&kv_wire::encode_bulk_array(&["PSYNC", "?", "-1"]))
        .await?;
    let (line, _) = kv_wire::read_line(&mut reader).await?;
    let Some(fields) = line.strip_prefix("+FULLRESYNC ") else {
        return Err(ReplicaError::Protocol(format!(
            "expected +FULLRESYNC, got {line:?}"
        )));
    };
    let fields: Vec<&str> = fields.split_whitespace().collect();
    let [replid, offset] = fields.as_slice() else {
        return Err(ReplicaError::Protocol(format!(
            "malformed FULLRESYNC line: {line:?}"
        )));
    };
    state.replication.set_replid((*replid).to_owned()).await;

    let (payload, _) = kv_wire::read_rdb_payload(&mut reader).await?;
    match kv_snapshot::read_snapshot(payload.as_slice()) {
        Ok(records) => {
            let count = records.len();
            state.store.load_snapshot(records).await;
            info!(replid, offset, records = count, "full resync complete");
        }
        Err(e) => warn!(error = %e, "snapshot payload unreadable, starting empty"),
    }

    // The handshake connection becomes the command intake: the master now
    // streams its writes here, and the only replies it gets are GETACK acks.
    connection::serve_parts(state, reader, writer, true).await;
    info!("master link closed");
    Ok(())
}

async fn send_and_expect(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    parts: &[&str],
) -> Result<(), ReplicaError> {
    writer.write_all(&kv_wire::encode_bulk_array(parts)).await?;
    let (line, _) = kv_wire::read_line(reader).await?;
    if !line.starts_with('+') {
        return Err(ReplicaError::Protocol(format!(
            "unexpected reply to {:?}: {line:?}",
            parts.join(" ")
        )));
    }
    debug!(command = parts.join(" "), reply = %line, "handshake step");
    Ok(())
}
