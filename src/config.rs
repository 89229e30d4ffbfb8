//! Repo configuration.
//!
//! A repo directory holds `config.json` plus the sled stores. The identity
//! private key lives in the config as hex-encoded PKCS#8 DER, the way the
//! rest of the file is meant to be copied between machines wholesale.

use crate::crypto::{CryptoError, Identity};
use crate::net::multiaddr::{Multiaddr, MultiaddrError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Environment override for the repo directory.
pub const REPO_ENV: &str = "CAIRN_PATH";

/// Default repo directory under `$HOME`.
pub const DEFAULT_REPO_DIR: &str = ".cairn";

pub const CONFIG_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Json(#[from] serde_json::Error),

    #[error("identity key: {0}")]
    Crypto(#[from] CryptoError),

    #[error("identity key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("bad multiaddress in config: {0}")]
    Multiaddr(#[from] MultiaddrError),

    #[error("repo already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("no repo at {0}, run init first")]
    NotInitialized(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityConfig {
    pub peer_id: String,
    /// PKCS#8 DER, hex encoded.
    pub priv_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressConfig {
    pub swarm: String,
    pub api: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationConfig {
    /// Approved replication peers, as multiaddresses with peer ids.
    pub peers: Vec<String>,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub identity: IdentityConfig,
    pub addresses: AddressConfig,
    pub bootstrap: Vec<String>,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

/// Resolve the repo directory: explicit flag, then env, then `~/.cairn`.
pub fn repo_path(cli: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Ok(path) = std::env::var(REPO_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(DEFAULT_REPO_DIR)
}

impl Config {
    /// Create a fresh repo: generate an identity, write the default config.
    pub fn init(repo: &Path) -> Result<(Self, Identity), ConfigError> {
        let file = repo.join(CONFIG_FILE);
        if file.exists() {
            return Err(ConfigError::AlreadyInitialized(repo.to_path_buf()));
        }
        std::fs::create_dir_all(repo)?;

        info!("generating identity key, this can take a moment");
        let identity = Identity::generate()?;
        let config = Self {
            identity: IdentityConfig {
                peer_id: identity.peer_id().as_str().to_string(),
                priv_key: hex::encode(identity.to_pkcs8_der()?),
            },
            addresses: AddressConfig {
                swarm: "/ip4/0.0.0.0/tcp/4001".to_string(),
                api: "/ip4/127.0.0.1/tcp/5001".to_string(),
            },
            bootstrap: Vec::new(),
            replication: ReplicationConfig { peers: Vec::new(), interval_secs: 60 },
        };
        config.save(repo)?;
        info!("initialized repo at {} with peer id {}", repo.display(), identity.peer_id());
        Ok((config, identity))
    }

    pub fn load(repo: &Path) -> Result<Self, ConfigError> {
        let file = repo.join(CONFIG_FILE);
        if !file.exists() {
            return Err(ConfigError::NotInitialized(repo.to_path_buf()));
        }
        Ok(serde_json::from_slice(&std::fs::read(file)?)?)
    }

    pub fn save(&self, repo: &Path) -> Result<(), ConfigError> {
        let file = repo.join(CONFIG_FILE);
        std::fs::write(file, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Reconstruct the identity from the stored key, verifying the peer id.
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        let der = hex::decode(&self.identity.priv_key)?;
        let identity = Identity::from_pkcs8_der(&der)?;
        if identity.peer_id().as_str() != self.identity.peer_id {
            // key and recorded id drifted apart; trust the key
            info!(
                "config peer id {} does not match key, using {}",
                self.identity.peer_id,
                identity.peer_id()
            );
        }
        Ok(identity)
    }

    pub fn swarm_addr(&self) -> Result<Multiaddr, ConfigError> {
        Ok(self.addresses.swarm.parse()?)
    }

    pub fn bootstrap_addrs(&self) -> Result<Vec<Multiaddr>, ConfigError> {
        self.bootstrap
            .iter()
            .map(|s| s.parse().map_err(ConfigError::from))
            .collect()
    }

    pub fn replication_addrs(&self) -> Result<Vec<Multiaddr>, ConfigError> {
        self.replication
            .peers
            .iter()
            .map(|s| s.parse().map_err(ConfigError::from))
            .collect()
    }
}
