//! BuildKit endpoint addresses.
//!
//! Parses `BUILDKIT_HOST`-style strings into the transport to dial.

use std::fmt;
use std::path::PathBuf;

use crate::error::{ReproError, Result};

/// Address used when `BUILDKIT_HOST` is unset.
#[cfg(unix)]
pub const DEFAULT_ADDRESS: &str = "unix:///run/buildkit/buildkitd.sock";

/// Address used when `BUILDKIT_HOST` is unset.
#[cfg(windows)]
pub const DEFAULT_ADDRESS: &str = "npipe:////./pipe/buildkitd";

/// A parsed BuildKit endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildkitAddress {
    /// `unix:///path/to/buildkitd.sock`
    Unix(PathBuf),
    /// `tcp://host:port`
    Tcp { host: String, port: u16 },
    /// `docker-container://name[?context=ctx]`, dialed through
    /// `buildctl dial-stdio` inside the container.
    DockerContainer {
        container: String,
        context: Option<String>,
    },
    /// `npipe:////./pipe/buildkitd`, held as the Windows pipe name
    /// (`\\.\pipe\buildkitd`).
    Npipe(String),
}

impl BuildkitAddress {
    /// Parse an endpoint string.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let (scheme, rest) = address.split_once("://").ok_or_else(|| {
            ReproError::Config(format!(
                "invalid buildkit address '{}': expected <scheme>://...",
                address
            ))
        })?;

        match scheme {
            "unix" => {
                if rest.is_empty() {
                    return Err(ReproError::Config(format!(
                        "invalid buildkit address '{}': empty socket path",
                        address
                    )));
                }
                Ok(BuildkitAddress::Unix(PathBuf::from(rest)))
            }
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                    ReproError::Config(format!(
                        "invalid buildkit address '{}': expected tcp://host:port",
                        address
                    ))
                })?;
                let port = port.trim_end_matches('/').parse::<u16>().map_err(|e| {
                    ReproError::Config(format!(
                        "invalid port in buildkit address '{}': {}",
                        address, e
                    ))
                })?;
                if host.is_empty() {
                    return Err(ReproError::Config(format!(
                        "invalid buildkit address '{}': empty host",
                        address
                    )));
                }
                Ok(BuildkitAddress::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "docker-container" => {
                let (container, query) = match rest.split_once('?') {
                    Some((c, q)) => (c, Some(q)),
                    None => (rest, None),
                };
                let container = container.trim_end_matches('/');
                if container.is_empty() {
                    return Err(ReproError::Config(format!(
                        "invalid buildkit address '{}': empty container name",
                        address
                    )));
                }
                let context = query.and_then(|q| {
                    q.split('&')
                        .filter_map(|pair| pair.split_once('='))
                        .find(|(k, _)| *k == "context")
                        .map(|(_, v)| v.to_string())
                        .filter(|v| !v.is_empty())
                });
                Ok(BuildkitAddress::DockerContainer {
                    container: container.to_string(),
                    context,
                })
            }
            "npipe" => {
                if rest.trim_matches('/').is_empty() {
                    return Err(ReproError::Config(format!(
                        "invalid buildkit address '{}': empty pipe name",
                        address
                    )));
                }
                Ok(BuildkitAddress::Npipe(rest.replace('/', "\\")))
            }
            other => Err(ReproError::Config(format!(
                "unsupported buildkit address scheme '{}' in '{}'",
                other, address
            ))),
        }
    }
}

impl fmt::Display for BuildkitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildkitAddress::Unix(path) => write!(f, "unix://{}", path.display()),
            BuildkitAddress::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            BuildkitAddress::DockerContainer { container, context } => match context {
                Some(ctx) => write!(f, "docker-container://{}?context={}", container, ctx),
                None => write!(f, "docker-container://{}", container),
            },
            BuildkitAddress::Npipe(name) => write!(f, "npipe://{}", name.replace('\\', "/")),
        }
    }
}
