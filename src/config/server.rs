// ABOUTME: Tunnel server connection settings
// Filled in by the setup wizard; the reconciler only passes them through to the
// rendered client configuration.

use serde::{Deserialize, Serialize};

/// How the tunnel client authenticates to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    /// No authentication
    #[default]
    None,

    /// Shared token
    Token {
        /// The token value
        token: String,
    },

    /// OIDC client credentials
    Oidc {
        /// OIDC client id
        client_id: String,
        /// OIDC client secret
        client_secret: String,
        /// Issuer URL
        issuer_url: String,
        /// Optional explicit token endpoint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_endpoint: Option<String>,
    },
}

/// Tunnel server address and credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname or IP
    #[serde(default)]
    pub server_addr: String,

    /// Server control port
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Authentication parameters
    #[serde(default)]
    pub auth: AuthMethod,
}

fn default_server_port() -> u16 {
    7000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            server_port: default_server_port(),
            auth: AuthMethod::default(),
        }
    }
}

impl ServerConfig {
    /// Whether enough is filled in to start the tunnel client
    pub fn is_complete(&self) -> bool {
        if self.server_addr.is_empty() || self.server_port == 0 {
            return false;
        }

        match &self.auth {
            AuthMethod::None => true,
            AuthMethod::Token { token } => !token.is_empty(),
            AuthMethod::Oidc {
                client_id,
                client_secret,
                issuer_url,
                ..
            } => !client_id.is_empty() && !client_secret.is_empty() && !issuer_url.is_empty(),
        }
    }
}
