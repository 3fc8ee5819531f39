//! Keyva: a single-node, in-memory, multi-type key/value server speaking
//! RESP2, with an optional replica role (snapshot transfer plus a
//! continuous command stream from a master).

pub mod config;
mod connection;
mod geo;
mod handlers;
mod pubsub;
mod replica;
mod replication;
mod server;
mod state;
mod store;

pub use config::{ConfigError, ReplicaOf, ServerConfig, parse_replicaof};
pub use server::Server;
pub use state::{Role, ServerState};

use tracing::info;

/// Bind and serve until the listener fails.
pub async fn run(config: ServerConfig) -> Result<(), std::io::Error> {
    let server = Server::bind(config).await?;
    info!(addr = %server.local_addr(), "listening");
    server.run().await
}
