// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use apx_transport::ConnectTarget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_queue_depth() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectConfig {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl ConnectConfig {
    pub fn target(&self) -> ConnectTarget {
        match self {
            ConnectConfig::Tcp { host, port } => {
                ConnectTarget::Tcp { host: host.clone(), port: *port }
            }
            ConnectConfig::Unix { path } => ConnectTarget::Unix { path: path.clone() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub connect: ConnectConfig,
    #[serde(default = "default_queue_depth")]
    pub session_queue_depth: usize,
}

impl ClientConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            connect: ConnectConfig::Tcp { host: host.into(), port },
            session_queue_depth: default_queue_depth(),
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ClientConfig {
            connect: ConnectConfig::Unix { path: path.into() },
            session_queue_depth: default_queue_depth(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_tcp_config() {
        let json = r#"{"connect": {"type": "tcp", "host": "127.0.0.1", "port": 5000}}"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.connect,
            ConnectConfig::Tcp { host: "127.0.0.1".into(), port: 5000 }
        );
        assert_eq!(config.session_queue_depth, 64);
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = ClientConfig::unix("/tmp/apx.sock");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes()).unwrap();
        let loaded = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_connect_type_rejected() {
        let json = r#"{"connect": {"type": "carrier_pigeon"}}"#;
        assert!(serde_json::from_str::<ClientConfig>(json).is_err());
    }
}
