//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` in the working directory)
//! - Merging CLI with file config (CLI takes precedence)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::core::config::{DEFAULT_RELAY_LISTEN, MAX_CHUNK_SIZE};
use crate::core::node::NodeSettings;
use crate::utils::data_dir::DataDir;

/// Cybercall - relay-signaled peer sessions, chat and file transfer.
#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for all persistent data (identity, friends, posts, chunks).
    /// Defaults to ~/.cybercall/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Run an endpoint.
    Peer {
        /// Signaling relay URL.
        #[clap(long)]
        server: Option<String>,

        /// Bytes per file chunk.
        #[clap(long)]
        chunk_size: Option<u32>,

        /// STUN/TURN server URL; repeat for several.
        #[clap(long = "ice-server")]
        ice_servers: Vec<String>,
    },
    /// Run the signaling relay.
    Relay {
        /// Address to listen on.
        #[clap(long)]
        listen: Option<String>,
    },
}

/// Shape of `config.toml`. Every key is optional.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub verbose: Option<u8>,
    pub conf: Option<PathBuf>,
    pub server: Option<String>,
    pub chunk_size: Option<u32>,
    pub ice_servers: Option<Vec<String>>,
    pub listen: Option<String>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before any working directory change
        cli_args.conf = cli_args.conf.map(Self::resolve_path);

        let default_path = PathBuf::from("config.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load config from a TOML file. A broken file is reported and ignored.
    fn from_file(path: &Path) -> Option<FileConfig> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<FileConfig>(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("ignoring {}: {e}", path.display());
                None
            }
        }
    }

    /// Merge file config with CLI args (CLI takes precedence).
    fn merge(file: FileConfig, mut cli: Args) -> Args {
        if cli.verbose == 0 {
            cli.verbose = file.verbose.unwrap_or(0);
        }
        if cli.conf.is_none() {
            cli.conf = file.conf.map(Self::resolve_path);
        }
        match &mut cli.command {
            Command::Peer {
                server,
                chunk_size,
                ice_servers,
            } => {
                if server.is_none() {
                    *server = file.server;
                }
                if chunk_size.is_none() {
                    *chunk_size = file.chunk_size;
                }
                if ice_servers.is_empty() {
                    *ice_servers = file.ice_servers.unwrap_or_default();
                }
            }
            Command::Relay { listen } => {
                if listen.is_none() {
                    *listen = file.listen;
                }
            }
        }
        cli
    }

    /// Endpoint settings for `peer` mode, defaults filled in.
    pub fn node_settings(&self, data_dir: DataDir) -> Result<NodeSettings> {
        let mut settings = NodeSettings::new(data_dir);
        let Command::Peer {
            server,
            chunk_size,
            ice_servers,
        } = &self.command
        else {
            return Ok(settings);
        };
        if let Some(server) = server {
            settings.server_url = server.clone();
        }
        if let Some(size) = *chunk_size {
            if size == 0 || size > MAX_CHUNK_SIZE {
                bail!("chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes");
            }
            settings.chunk_size = size;
        }
        if !ice_servers.is_empty() {
            settings.ice_servers = ice_servers.clone();
        }
        Ok(settings)
    }

    /// Listen address for `relay` mode.
    pub fn listen_addr(&self) -> String {
        match &self.command {
            Command::Relay { listen: Some(addr) } => addr.clone(),
            _ => DEFAULT_RELAY_LISTEN.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CHUNK_SIZE, DEFAULT_SIGNALING_URL};

    fn temp_data_dir() -> (PathBuf, DataDir) {
        let dir = std::env::temp_dir().join(format!("cybercall_test_args_{}", uuid::Uuid::new_v4()));
        let data_dir = DataDir::resolve(Some(dir.as_path())).unwrap();
        (dir, data_dir)
    }

    #[test]
    fn parses_subcommands() {
        let args = Args::try_parse_from(["cybercall", "-vv", "peer", "--server", "ws://relay:1/ws"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(
            args.command,
            Command::Peer {
                server: Some("ws://relay:1/ws".into()),
                chunk_size: None,
                ice_servers: vec![],
            }
        );

        let args = Args::try_parse_from(["cybercall", "relay", "--listen", "127.0.0.1:9000", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);
        assert_eq!(args.listen_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn cli_wins_over_file() {
        let file: FileConfig = toml::from_str(
            r#"
            verbose = 1
            server = "ws://file/ws"
            chunk_size = 8192
            ice_servers = ["stun:file:3478"]
            "#,
        )
        .unwrap();
        let cli = Args::try_parse_from(["cybercall", "peer", "--server", "ws://cli/ws"]).unwrap();
        let merged = Args::merge(file, cli);

        assert_eq!(merged.verbose, 1);
        assert_eq!(
            merged.command,
            Command::Peer {
                server: Some("ws://cli/ws".into()),
                chunk_size: Some(8192),
                ice_servers: vec!["stun:file:3478".into()],
            }
        );
    }

    #[test]
    fn settings_fill_defaults() {
        let (dir, data_dir) = temp_data_dir();
        let args = Args::try_parse_from(["cybercall", "peer"]).unwrap();
        let settings = args.node_settings(data_dir.clone()).unwrap();
        assert_eq!(settings.server_url, DEFAULT_SIGNALING_URL);
        assert_eq!(settings.chunk_size, CHUNK_SIZE as u32);
        assert_eq!(settings.data_dir, data_dir);

        for bad in ["0", "65537"] {
            let args = Args::try_parse_from(["cybercall", "peer", "--chunk-size", bad]).unwrap();
            assert!(args.node_settings(data_dir.clone()).is_err());
        }
        let args = Args::try_parse_from(["cybercall", "peer", "--chunk-size", "65536"]).unwrap();
        assert_eq!(args.node_settings(data_dir).unwrap().chunk_size, 65536);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn relay_defaults_listen_address() {
        let args = Args::try_parse_from(["cybercall", "relay"]).unwrap();
        assert_eq!(args.listen_addr(), DEFAULT_RELAY_LISTEN);
    }
}
