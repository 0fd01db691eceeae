use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Shunt - TCP port forwarder with live reconfiguration
#[derive(Parser, Debug)]
#[command(name = "shunt")]
#[command(about = "Forward listening ports to backends, reconfigured without restarts", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "SHUNT_LOG_LEVEL")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the forwarding daemon
    #[command(long_about = r#"
Run the forwarding daemon. Ports are opened, retargeted and closed as the
configuration changes; connections on unchanged ports are never disturbed.

The configuration comes from exactly one place:
  --config FILE               re-read on SIGHUP or after a signed upload
  --zk-servers / --zk-path    a coordination-service node (zookeeper feature)
  --pull-url URL              a grove serving a signed configuration

EXAMPLES:
  # Forward ports listed in a local file, reload with `kill -HUP`
  shunt run --config /etc/shunt.yaml

  # Also accept signed uploads on the admin listener
  shunt run --config /etc/shunt.yaml --keyring /etc/shunt.keys

  # Follow a grove
  shunt run --pull-url http://grove:8080/config --keyring /etc/shunt.keys
"#)]
    Run {
        /// Configuration file
        #[arg(short, long, env = "SHUNT_CONFIG")]
        config: Option<PathBuf>,

        /// Trusted public keys for signed configuration
        #[arg(long, env = "SHUNT_KEYRING")]
        keyring: Option<PathBuf>,

        /// Admin listener serving /metrics and /upload
        #[arg(long, env = "SHUNT_ADMIN_ADDR", default_value = "127.0.0.1:9090")]
        admin_addr: SocketAddr,

        /// Coordination-service servers (comma-separated host:port)
        #[arg(long, env = "ZOOKEEPER_SERVERS")]
        zk_servers: Option<String>,

        /// Node holding the configuration document
        #[arg(long, env = "SHUNT_ZK_PATH")]
        zk_path: Option<String>,

        /// Grove endpoint to pull signed configuration from
        #[arg(long, env = "SHUNT_PULL_URL")]
        pull_url: Option<String>,
    },

    /// Sign a configuration file and upload it to a running daemon
    Push {
        /// Configuration file to upload
        #[arg(short, long)]
        config: PathBuf,

        /// Signing key written by `shunt keygen`
        #[arg(short, long, env = "SHUNT_SIGNING_KEY")]
        key: PathBuf,

        /// Upload endpoint, e.g. http://host:9090/upload
        #[arg(short, long)]
        url: String,
    },

    /// Serve a configuration file, signed, for daemons to pull
    Grove {
        /// Configuration file to serve
        #[arg(short, long)]
        config: PathBuf,

        /// Signing key written by `shunt keygen`
        #[arg(short, long, env = "SHUNT_SIGNING_KEY")]
        key: PathBuf,

        /// Address to serve /config on
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },

    /// Generate a signing key pair
    Keygen {
        /// Output prefix; writes PREFIX.key and PREFIX.pub
        #[arg(short, long)]
        out: PathBuf,
    },
}
