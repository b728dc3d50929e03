// ABOUTME: Config synthesizer - renders the frpc client configuration
//
// `render` is a pure function of the desired mapping set and the server
// settings: the same inputs always give byte-identical output, which is what
// lets the reconciler skip rewrites and reloads when nothing changed.
//
// Output follows the frpc TOML layout:
//
// ```toml
// serverAddr = "frp.example.com"
// serverPort = 7000
//
// [auth]
// method = "token"
// token = "..."
//
// [[proxies]]
// name = "tcp_8080_to_16080"
// type = "tcp"
// localIP = "127.0.0.1"
// localPort = 8080
// remotePort = 16080
// ```

use crate::config::{AuthMethod, ServerConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Address the tunnel client forwards to
pub const LOCAL_IP: &str = "127.0.0.1";

/// Errors from rendering a configuration
#[derive(Debug, Error)]
pub enum RenderError {
    /// Local port outside 1..=65535
    #[error("Invalid local port {0}")]
    InvalidLocalPort(u16),

    /// Remote port outside 1..=65535
    #[error("Invalid remote port {remote_port} for local port {local_port}")]
    InvalidRemotePort {
        /// Local side of the mapping
        local_port: u16,
        /// The offending remote port
        remote_port: u16,
    },

    /// TOML serialization failed
    #[error("Failed to serialize client config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A rendered client configuration document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    text: String,
    mappings: BTreeMap<u16, u16>,
}

impl RenderedConfig {
    /// Document text
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Document bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// The local -> remote set this document was rendered from
    pub const fn mappings(&self) -> &BTreeMap<u16, u16> {
        &self.mappings
    }

    /// Atomically write the document to `path`
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        crate::fsutil::write_atomic(path, self.as_bytes())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientDocument<'a> {
    server_addr: &'a str,
    server_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<AuthSection<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    proxies: Vec<ProxyStanza>,
}

#[derive(Serialize)]
struct AuthSection<'a> {
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    oidc: Option<OidcSection<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcSection<'a> {
    #[serde(rename = "clientID")]
    client_id: &'a str,
    client_secret: &'a str,
    #[serde(rename = "tokenEndpointURL")]
    token_endpoint_url: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyStanza {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "localIP")]
    local_ip: &'static str,
    local_port: u16,
    remote_port: u16,
}

/// Stanza name for a mapping
pub fn proxy_name(local_port: u16, remote_port: u16) -> String {
    format!("tcp_{local_port}_to_{remote_port}")
}

/// Check that a mapping can be rendered.
pub fn validate_mapping(local_port: u16, remote_port: u16) -> Result<(), RenderError> {
    if local_port == 0 {
        return Err(RenderError::InvalidLocalPort(local_port));
    }
    if remote_port == 0 {
        return Err(RenderError::InvalidRemotePort {
            local_port,
            remote_port,
        });
    }
    Ok(())
}

fn auth_section(auth: &AuthMethod) -> Option<AuthSection<'_>> {
    match auth {
        AuthMethod::None => None,
        AuthMethod::Token { token } => Some(AuthSection {
            method: "token",
            token: Some(token),
            oidc: None,
        }),
        AuthMethod::Oidc {
            client_id,
            client_secret,
            issuer_url,
            token_endpoint,
        } => Some(AuthSection {
            method: "oidc",
            token: None,
            oidc: Some(OidcSection {
                client_id,
                client_secret,
                token_endpoint_url: token_endpoint.as_deref().unwrap_or(issuer_url),
            }),
        }),
    }
}

/// Render the client configuration for `mappings` (local -> remote).
pub fn render(
    mappings: &BTreeMap<u16, u16>,
    server: &ServerConfig,
) -> Result<RenderedConfig, RenderError> {
    let proxies = mappings
        .iter()
        .map(|(&local_port, &remote_port)| {
            validate_mapping(local_port, remote_port)?;
            Ok(ProxyStanza {
                name: proxy_name(local_port, remote_port),
                kind: "tcp",
                local_ip: LOCAL_IP,
                local_port,
                remote_port,
            })
        })
        .collect::<Result<Vec<_>, RenderError>>()?;

    let document = ClientDocument {
        server_addr: &server.server_addr,
        server_port: server.server_port,
        auth: auth_section(&server.auth),
        proxies,
    };

    Ok(RenderedConfig {
        text: toml::to_string(&document)?,
        mappings: mappings.clone(),
    })
}
