//! Remote server models

use serde::{Deserialize, Serialize};

/// Connection parameters for a remote Docker host reached over SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServer {
    /// Unique server ID
    pub server_id: String,

    /// Hostname or IP address
    pub host: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// SSH user
    #[serde(default = "default_ssh_user")]
    pub username: String,

    /// Optional path to an SSH identity file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

impl RemoteServer {
    /// "user@host" destination string for ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}
