//! Server configuration.
//!
//! All configuration arrives on the command line; there is no config file.
//! `--dir` and `--dbfilename` only take effect together — that pair names
//! the startup snapshot, and a missing snapshot file is not an error.

use std::path::PathBuf;
use thiserror::Error;

/// The master a replica mirrors, from `--replicaof "<host> <port>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub replicaof: Option<ReplicaOf>,
    pub dir: Option<String>,
    pub dbfilename: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 6379,
            replicaof: None,
            dir: None,
            dbfilename: None,
        }
    }
}

impl ServerConfig {
    /// The snapshot file to load at startup, when both halves are set.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        match (&self.dir, &self.dbfilename) {
            (Some(dir), Some(file)) => Some(PathBuf::from(dir).join(file)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid --replicaof value '{0}': expected \"<host> <port>\"")]
    InvalidReplicaOf(String),
}

/// Parse the `--replicaof` argument, a single string of `<host> <port>`.
pub fn parse_replicaof(value: &str) -> Result<ReplicaOf, ConfigError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    let [host, port] = parts.as_slice() else {
        return Err(ConfigError::InvalidReplicaOf(value.to_owned()));
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidReplicaOf(value.to_owned()))?;
    Ok(ReplicaOf {
        host: (*host).to_owned(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicaof_accepts_host_and_port() {
        let r = parse_replicaof("localhost 6380").unwrap();
        assert_eq!(
            r,
            ReplicaOf {
                host: "localhost".to_owned(),
                port: 6380,
            }
        );
    }

    #[test]
    fn replicaof_rejects_malformed_values() {
        assert!(parse_replicaof("localhost").is_err());
        assert!(parse_replicaof("localhost 6380 extra").is_err());
        assert!(parse_replicaof("localhost notaport").is_err());
        assert!(parse_replicaof("").is_err());
    }

    #[test]
    fn snapshot_path_requires_both_halves() {
        let mut config = ServerConfig::default();
        assert!(config.snapshot_path().is_none());
        config.dir = Some("/var/lib/keyva".to_owned());
        assert!(config.snapshot_path().is_none());
        config.dbfilename = Some("dump.rdb".to_owned());
        assert_eq!(
            config.snapshot_path(),
            Some(PathBuf::from("/var/lib/keyva/dump.rdb"))
        );
    }
}
