//! Listener and accept loop.
//!
//! `bind` and `run` are split so tests can bind port 0, learn the real
//! address, and drive the server in-process.

use std::io::BufReader;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection;
use crate::replica;
use crate::state::ServerState;

pub struct Server {
    listener: TcpListener,
    state: ServerState,
}

impl Server {
    /// Load the startup snapshot (when configured) and bind the listener.
    /// A missing snapshot file is not an error; a bind failure is.
    pub async fn bind(config: ServerConfig) -> Result<Self, std::io::Error> {
        let state = ServerState::new(config);

        if let Some(path) = state.config.snapshot_path() {
            match std::fs::File::open(&path) {
                Ok(file) => match kv_snapshot::read_snapshot(BufReader::new(file)) {
                    Ok(records) => {
                        info!(path = %path.display(), records = records.len(), "loaded snapshot");
                        state.store.load_snapshot(records).await;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "snapshot unreadable, starting empty"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "no snapshot file, starting empty");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot open snapshot, starting empty"),
            }
        }

        let listener = TcpListener::bind(("0.0.0.0", state.config.port)).await?;
        Ok(Server { listener, state })
    }

    /// The bound address; the port is meaningful when 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    /// Accept connections until the listener fails. When configured as a
    /// replica, the outbound handshake runs alongside the accept loop and
    /// its failure does not stop normal serving.
    pub async fn run(self) -> Result<(), std::io::Error> {
        if let Some(master) = self.state.config.replicaof.clone() {
            let state = self.state.clone();
            let own_port = self.local_addr().port();
            info!(master_host = %master.host, master_port = master.port, "starting replica handshake");
            tokio::spawn(async move {
                if let Err(e) =
                    replica::run_replica(state, &master.host, master.port, own_port).await
                {
                    error!(error = %e, "replica role failed");
                }
            });
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let state = self.state.clone();
                    tokio::spawn(connection::serve(state, stream, false));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(e);
                }
            }
        }
    }
}
