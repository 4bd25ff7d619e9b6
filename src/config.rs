use std::{net::SocketAddr, path::PathBuf, time::Duration};

use tracing::{info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SSE_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKER_PORT: u16 = 3000;
pub const DEFAULT_WORKER_COMMAND: &str =
    "cd C:/Users/samue/matlab-mcp-server && node build/index.js";
pub const DEFAULT_MATLAB_PATH: &str = "E:/MATLAB/bin/matlab.exe";
pub const DEFAULT_SSH_PROGRAM: &str = "ssh";

/// Everything the bridge needs to run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub http: HttpServerSettings,
    pub upstream: UpstreamConfig,
    pub request_timeout: Duration,
    /// Skip connecting altogether and serve simulated responses.
    pub offline: bool,
}

/// Settings for the HTTP server
#[derive(Debug, Clone)]
pub struct HttpServerSettings {
    pub bind_addr: SocketAddr,
    pub sse_ping_interval: Duration,
}

/// Where the MATLAB MCP server lives and how to reach it.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub worker_port: u16,
    /// `None` disables the direct TCP attempt.
    pub direct_timeout: Option<Duration>,
    pub ssh: SshConfig,
    pub worker_command: String,
    pub matlab_path: String,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    /// The `ssh` client to run, by name or path.
    pub program: String,
    pub port: u16,
    pub username: String,
    pub credentials: SshCredentials,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct SshCredentials {
    pub private_key: Option<PathBuf>,
    pub password: Option<String>,
}

impl std::fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredentials")
            .field("private_key", &self.private_key)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SshCredentials {
    /// Keep the key only when it can actually be read; otherwise fall back to the
    /// password (or nothing) without failing.
    pub fn resolve(key_path: Option<PathBuf>, password: Option<String>) -> Self {
        let private_key = match key_path {
            Some(path) => match std::fs::File::open(&path) {
                Ok(_) => {
                    info!("SSH private key loaded from {}", path.display());
                    Some(path)
                }
                Err(e) => {
                    warn!("Failed to load SSH key from {}: {}", path.display(), e);
                    None
                }
            },
            None => {
                info!("No SSH key path specified, will use password authentication");
                None
            }
        };

        Self {
            private_key,
            password: password.filter(|p| !p.is_empty()),
        }
    }
}

impl UpstreamConfig {
    /// Remote command that reports whether something listens on the worker port.
    pub fn probe_command(&self) -> String {
        format!("netstat -an | findstr :{}", self.worker_port)
    }

    pub fn port_marker(&self) -> String {
        format!(":{}", self.worker_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_falls_back_silently() {
        let creds = SshCredentials::resolve(
            Some(PathBuf::from("/nonexistent/id_ed25519")),
            Some("secret".to_string()),
        );
        assert_eq!(creds.private_key, None);
        assert_eq!(creds.password.as_deref(), Some("secret"));
    }

    #[test]
    fn readable_key_is_kept() {
        let path = std::env::temp_dir().join(format!("bridge-key-{}", std::process::id()));
        std::fs::write(&path, "not really a key").unwrap();

        let creds = SshCredentials::resolve(Some(path.clone()), None);
        assert_eq!(creds.private_key.as_deref(), Some(path.as_path()));
        assert_eq!(creds.password, None);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn empty_password_means_none() {
        let creds = SshCredentials::resolve(None, Some(String::new()));
        assert_eq!(creds, SshCredentials::default());
    }

    #[test]
    fn password_is_not_printed() {
        let creds = SshCredentials::resolve(None, Some("hunter2".to_string()));
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
