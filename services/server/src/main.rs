use clap::{Arg, Command};
use server::{ReplicaOf, ServerConfig};
use tracing::{error, info};

fn validate_port(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
}

fn validate_replicaof(value: &str) -> Result<ReplicaOf, String> {
    server::parse_replicaof(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("Keyva Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("An in-memory RESP2 key/value server with replica support")
        .arg(
            Arg::new("port")
                .help("The TCP port to listen on")
                .long("port")
                .value_parser(validate_port)
                .default_value("6379"),
        )
        .arg(
            Arg::new("replicaof")
                .help("Run as a replica of a master, given as \"<host> <port>\"")
                .long("replicaof")
                .value_parser(validate_replicaof),
        )
        .arg(
            Arg::new("dir")
                .help("Directory containing the startup snapshot")
                .long("dir"),
        )
        .arg(
            Arg::new("dbfilename")
                .help("Snapshot file name inside --dir")
                .long("dbfilename"),
        )
        .get_matches();

    let config = ServerConfig {
        port: *matches.get_one::<u16>("port").expect("port has a default"),
        replicaof: matches.get_one::<ReplicaOf>("replicaof").cloned(),
        dir: matches.get_one::<String>("dir").cloned(),
        dbfilename: matches.get_one::<String>("dbfilename").cloned(),
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        "keyva server starting"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}
