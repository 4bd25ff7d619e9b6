/**
 * The entry point for the matlab-bridge application.
 * It sets up logging and runs either the bridge server or the smoke client.
 */
use clap::Parser;
use mcp_bridge::{
    config::{
        BridgeConfig, HttpServerSettings, SshConfig, SshCredentials, UpstreamConfig,
        DEFAULT_DIRECT_TIMEOUT, DEFAULT_MATLAB_PATH, DEFAULT_SSE_PING_INTERVAL,
        DEFAULT_SSH_PROGRAM, DEFAULT_WORKER_COMMAND, DEFAULT_WORKER_PORT,
    },
    run_http_server, run_smoke_client,
    smoke_client::SmokeClientConfig,
};
use std::{error::Error, net::SocketAddr, path::PathBuf, time::Duration};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// MATLAB MCP Bridge CLI arguments
#[derive(Parser)]
#[command(
    name = "matlab-bridge",
    version = env!("CARGO_PKG_VERSION"),
    about = concat!("MATLAB MCP Bridge v", env!("CARGO_PKG_VERSION"), ". Relay MCP requests over HTTP/SSE to a remote MATLAB MCP server."),
    long_about = None,
    after_help = "Examples:\n  \
        Serve on port 8080, reaching MATLAB over SSH with a key:\n  \
        matlab-bridge --matlab-host 192.168.1.111 --ssh-key-path ~/.ssh/id_ed25519\n  \
        Serve simulated responses only:\n  \
        matlab-bridge --offline\n  \
        Check a running bridge:\n  \
        matlab-bridge http://localhost:8080
",
)]
struct Cli {
    /// URL of a running bridge. When given, run the smoke checks against it instead of serving.
    url: Option<String>,

    /// Port to expose the HTTP server on
    #[arg(long = "port", env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Host to expose the HTTP server on
    #[arg(long = "bind-host", env = "BIND_HOST", default_value = "0.0.0.0")]
    bind_host: String,

    /// Host running the MATLAB MCP server
    #[arg(long = "matlab-host", env = "MATLAB_HOST", default_value = "192.168.1.111")]
    matlab_host: String,

    /// SSH port on the MATLAB host
    #[arg(long = "ssh-port", env = "MATLAB_SSH_PORT", default_value_t = 22)]
    ssh_port: u16,

    /// SSH user on the MATLAB host
    #[arg(long = "ssh-user", env = "MATLAB_SSH_USER", default_value = "samue")]
    ssh_user: String,

    /// Private key for SSH. Falls back to the password when missing or unreadable.
    #[arg(long = "ssh-key-path", env = "MATLAB_SSH_KEY_PATH")]
    ssh_key_path: Option<PathBuf>,

    /// SSH password, used through sshpass
    #[arg(long = "ssh-password", env = "MATLAB_SSH_PASSWORD", hide_env_values = true)]
    ssh_password: Option<String>,

    /// ssh client binary
    #[arg(long = "ssh-program", env = "MATLAB_SSH_PROGRAM", default_value = DEFAULT_SSH_PROGRAM)]
    ssh_program: String,

    /// Port the MATLAB MCP server listens on
    #[arg(long = "worker-port", env = "MATLAB_WORKER_PORT", default_value_t = DEFAULT_WORKER_PORT)]
    worker_port: u16,

    /// Remote command that starts the MATLAB MCP server
    #[arg(long = "worker-command", env = "MATLAB_WORKER_COMMAND", default_value = DEFAULT_WORKER_COMMAND)]
    worker_command: String,

    /// MATLAB executable handed to the server as MATLAB_PATH
    #[arg(long = "matlab-path", env = "MATLAB_PATH", default_value = DEFAULT_MATLAB_PATH)]
    matlab_path: String,

    /// Seconds to wait for a response from MATLAB
    #[arg(long = "request-timeout-secs", env = "MATLAB_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Skip the direct TCP attempt and go straight to SSH
    #[arg(long = "no-direct", env = "MATLAB_NO_DIRECT")]
    no_direct: bool,

    /// Do not connect at all; serve simulated responses
    #[arg(long = "offline", env = "MATLAB_OFFLINE")]
    offline: bool,
}

impl Cli {
    fn into_config(self) -> Result<BridgeConfig, Box<dyn Error>> {
        let bind_addr = format!("{}:{}", self.bind_host, self.port).parse::<SocketAddr>()?;

        Ok(BridgeConfig {
            http: HttpServerSettings {
                bind_addr,
                sse_ping_interval: DEFAULT_SSE_PING_INTERVAL,
            },
            upstream: UpstreamConfig {
                host: self.matlab_host,
                worker_port: self.worker_port,
                direct_timeout: (!self.no_direct).then_some(DEFAULT_DIRECT_TIMEOUT),
                ssh: SshConfig {
                    program: self.ssh_program,
                    port: self.ssh_port,
                    username: self.ssh_user,
                    credentials: SshCredentials::resolve(self.ssh_key_path, self.ssh_password),
                },
                worker_command: self.worker_command,
                matlab_path: self.matlab_path,
            },
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            offline: self.offline,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cli = Cli::parse();

    if let Some(url) = cli.url.take() {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("expected an http(s) URL, got {url:?}").into());
        }
        debug!("Running smoke checks");

        let report = run_smoke_client(SmokeClientConfig {
            url,
            sse_timeout: Duration::from_secs(5),
        })
        .await?;
        info!(
            connected = report.connected,
            sse_events = report.sse_events,
            tools = ?report.tools,
            "All tests completed successfully"
        );
        return Ok(());
    }

    debug!("Starting MATLAB MCP bridge");
    let config = cli.into_config()?;
    run_http_server(config).await?;

    Ok(())
}
