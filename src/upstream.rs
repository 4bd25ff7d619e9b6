//! The single upstream link to the MATLAB MCP server.
//!
//! The link is either a TCP socket (direct) or the stdio of an `ssh` child process
//! (tunnelled). Both are treated as a duplex byte stream carrying one JSON message
//! per line.
use std::{
    fmt,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::{Child, Command},
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{config::UpstreamConfig, correlator::UpstreamSink, error::BridgeError};

/// Exit status `ssh` uses for its own connection and authentication errors.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Line(String),
    /// The reader reached EOF or failed. Sent once per channel.
    Closed,
}

pub type UpstreamEvents = mpsc::UnboundedReceiver<UpstreamEvent>;

/// How the current channel reaches the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Direct,
    /// Stdio forward to a worker that was already listening.
    SshForward,
    /// Stdio of a worker launched over SSH.
    SshLaunch,
    /// Any other stream handed to [`ConnectionManager::attach`].
    Attached,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Direct => "direct",
            Transport::SshForward => "ssh-forward",
            Transport::SshLaunch => "ssh-launch",
            Transport::Attached => "attached",
        })
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connectivity shared between the manager and channel reader tasks.
///
/// Every installed channel gets a generation number. The generation only changes
/// inside the watch sender's lock, so a reader can never mark a newer link down.
struct LinkState {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

impl LinkState {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            generation: AtomicU64::new(0),
        }
    }

    fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }

    /// Marks a new channel connected and returns its generation.
    fn begin(&self) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = ConnectionState::Connected;
        });
        generation
    }

    /// Marks the link down if `generation` is still the installed channel.
    fn end(&self, generation: u64) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation
                || *state == ConnectionState::Disconnected
            {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        })
    }

    /// Retires the current channel, whichever it is.
    fn reset(&self) {
        self.state.send_modify(|state| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = ConnectionState::Disconnected;
        });
    }
}

/// One live duplex stream to the worker.
pub struct UpstreamChannel {
    transport: Transport,
    writer: Mutex<Option<BoxedWriter>>,
    child: Option<Arc<Mutex<Child>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UpstreamChannel {
    fn spawn<R>(
        transport: Transport,
        reader: R,
        writer: BoxedWriter,
        child: Option<Child>,
        link: Arc<LinkState>,
        generation: u64,
    ) -> (Self, UpstreamEvents)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        debug!(stream = "stdout", "MATLAB output: {}", line);
                        if events_tx.send(UpstreamEvent::Line(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!(%transport, "MATLAB server connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(%transport, "Error reading from MATLAB server: {}", e);
                        break;
                    }
                }
            }
            if !link.end(generation) {
                debug!(%transport, generation, "Stale channel closed");
            }
            let _ = events_tx.send(UpstreamEvent::Closed);
        }));

        let child = child.map(|child| Arc::new(Mutex::new(child)));
        if let Some(child) = &child {
            tasks.push(spawn_exit_watcher(child.clone()));
        }

        let channel = Self {
            transport,
            writer: Mutex::new(Some(writer)),
            child,
            tasks,
        };
        (channel, events_rx)
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upstream writer closed")
        })?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(child) = &self.child {
            if let Err(e) = child.lock().await.start_kill() {
                debug!("MATLAB process already gone: {}", e);
            }
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Logs the tunnel process exit as a structured event.
fn spawn_exit_watcher(child: Arc<Mutex<Child>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;

            let status = child.lock().await.try_wait();
            match status {
                Ok(Some(status)) => {
                    info!("{}", exit_event(status));
                    break;
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to check MATLAB process status: {}", e);
                    break;
                }
            }
        }
    })
}

fn exit_event(status: ExitStatus) -> serde_json::Value {
    let timestamp = chrono::Utc::now().to_rfc3339();
    if let Some(code) = status.code() {
        return serde_json::json!({
            "event": "process_exit",
            "exit_type": "normal",
            "exit_code": code,
            "timestamp": timestamp
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return serde_json::json!({
                "event": "process_exit",
                "exit_type": "signal",
                "signal_number": signal,
                "timestamp": timestamp
            });
        }
    }

    serde_json::json!({
        "event": "process_exit",
        "exit_type": "signal",
        "timestamp": timestamp
    })
}

/// A fully spelled-out `ssh` (or `sshpass -e ssh`) command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl SshInvocation {
    /// Key authentication first when a key is configured; with a password the
    /// invocation goes through `sshpass` so the password answers any prompt after
    /// the key is refused. Without a password `ssh` must never prompt.
    pub fn build(config: &UpstreamConfig, extra: &[String], remote: Option<&str>) -> Self {
        let ssh = &config.ssh;
        let mut program = ssh.program.clone();
        let mut args = Vec::new();
        let mut env = Vec::new();

        if let Some(password) = &ssh.credentials.password {
            program = "sshpass".to_string();
            args.push("-e".to_string());
            args.push(ssh.program.clone());
            env.push(("SSHPASS".to_string(), password.clone()));
        }

        args.extend(["-p".to_string(), ssh.port.to_string()]);
        for option in [
            "ConnectTimeout=10",
            "StrictHostKeyChecking=accept-new",
            "ServerAliveInterval=15",
        ] {
            args.extend(["-o".to_string(), option.to_string()]);
        }
        if ssh.credentials.password.is_none() {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        if let Some(key) = &ssh.credentials.private_key {
            args.extend(["-i".to_string(), key.display().to_string()]);
        }

        args.extend(extra.iter().cloned());
        args.push(format!("{}@{}", ssh.username, config.host));
        if let Some(remote) = remote {
            args.push(remote.to_string());
        }

        Self { program, args, env }
    }

    pub fn uses_sshpass(&self) -> bool {
        self.program == "sshpass"
    }

    /// Whether the exit status means the SSH session itself failed, as opposed to
    /// the remote command returning non-zero.
    pub fn is_connection_failure(&self, status: ExitStatus) -> bool {
        match status.code() {
            Some(SSH_CONNECTION_FAILURE) => true,
            // sshpass reserves 2..=6 for its own errors (bad password, host key, ...).
            Some(code) if self.uses_sshpass() => (2..=6).contains(&code),
            Some(_) => false,
            None => true,
        }
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

/// Owns the one upstream channel and its connectivity state.
pub struct ConnectionManager {
    config: UpstreamConfig,
    link: Arc<LinkState>,
    channel: RwLock<Option<Arc<UpstreamChannel>>>,
}

impl ConnectionManager {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            link: Arc::new(LinkState::new()),
            channel: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    /// How the installed channel reaches the worker, if there is one.
    pub async fn transport(&self) -> Option<Transport> {
        self.channel
            .read()
            .await
            .as_ref()
            .map(|channel| channel.transport())
    }

    /// Direct TCP first, then the SSH tunnel. On failure the state is left
    /// `Disconnected` and the caller decides whether to carry on degraded.
    pub async fn connect(&self) -> Result<UpstreamEvents, BridgeError> {
        self.link.set(ConnectionState::Connecting);
        info!("Attempting to connect to MATLAB MCP server...");

        let direct_error = match self.try_direct().await {
            Ok(events) => return Ok(events),
            Err(e) => e,
        };
        info!("Direct connection failed ({}), trying SSH tunnel...", direct_error);

        match self.try_tunnel().await {
            Ok(events) => Ok(events),
            Err(ssh_error) => {
                self.link.set(ConnectionState::Disconnected);
                error!(
                    direct = %direct_error,
                    ssh = %ssh_error,
                    "Both direct and SSH connections failed"
                );
                Err(BridgeError::Connect(format!(
                    "direct: {direct_error}; ssh: {ssh_error}"
                )))
            }
        }
    }

    /// Adopt an already-open duplex stream as the upstream channel.
    pub async fn attach<R, W>(&self, reader: R, writer: W, transport: Transport) -> UpstreamEvents
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.install(transport, reader, Box::new(writer), None).await
    }

    /// Close the channel, killing a tunnel process if there is one.
    pub async fn close(&self) {
        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            info!(transport = %channel.transport(), "Closing MATLAB connection");
            channel.close().await;
        }
        self.link.reset();
    }

    async fn install<R>(
        &self,
        transport: Transport,
        reader: R,
        writer: BoxedWriter,
        child: Option<Child>,
    ) -> UpstreamEvents
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        // Writers wait on this lock, so nobody sees `Connected` without a channel.
        let mut slot = self.channel.write().await;
        if let Some(previous) = slot.take() {
            previous.close().await;
        }

        // Connected before the reader starts: a stream that is already at EOF
        // must be able to take the state back down.
        let generation = self.link.begin();
        let (channel, events) = UpstreamChannel::spawn(
            transport,
            reader,
            writer,
            child,
            self.link.clone(),
            generation,
        );
        *slot = Some(Arc::new(channel));
        drop(slot);

        info!(%transport, generation, "Connected to MATLAB MCP server");
        events
    }

    async fn try_direct(&self) -> Result<UpstreamEvents, BridgeError> {
        let Some(limit) = self.config.direct_timeout else {
            return Err(BridgeError::Connect(
                "direct connection disabled".to_string(),
            ));
        };

        let addr = (self.config.host.as_str(), self.config.worker_port);
        let stream = tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| BridgeError::Connect("direct connection timed out".to_string()))??;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        Ok(self
            .install(Transport::Direct, reader, Box::new(writer), None)
            .await)
    }

    async fn try_tunnel(&self) -> Result<UpstreamEvents, BridgeError> {
        let ssh = &self.config.ssh;
        info!(
            "Attempting SSH connection to {}:{} as {}",
            self.config.host, ssh.port, ssh.username
        );

        let probe = SshInvocation::build(&self.config, &[], Some(&self.config.probe_command()));
        let output = probe
            .command()
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if probe.is_connection_failure(output.status) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BridgeError::Connect(format!(
                "ssh failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }
        info!("SSH connection established successfully");

        let listening = String::from_utf8_lossy(&output.stdout).contains(&self.config.port_marker());
        if listening {
            info!(
                "MATLAB MCP server is already running on port {}",
                self.config.worker_port
            );
            let forward = vec![
                "-W".to_string(),
                format!("127.0.0.1:{}", self.config.worker_port),
            ];
            let invocation = SshInvocation::build(&self.config, &forward, None);
            self.spawn_process(Transport::SshForward, &invocation).await
        } else {
            info!("Starting MATLAB MCP server...");
            let set_env = vec![
                "-o".to_string(),
                format!("SetEnv=MATLAB_PATH={}", self.config.matlab_path),
            ];
            let invocation =
                SshInvocation::build(&self.config, &set_env, Some(&self.config.worker_command));
            self.spawn_process(Transport::SshLaunch, &invocation).await
        }
    }

    async fn spawn_process(
        &self,
        transport: Transport,
        invocation: &SshInvocation,
    ) -> Result<UpstreamEvents, BridgeError> {
        let start_log = serde_json::json!({
            "event": "process_start",
            "command": invocation.program,
            "args": invocation.args,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        info!("{}", start_log);

        let mut command = invocation.command();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            BridgeError::Connect("MATLAB process stdin not available".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::Connect("MATLAB process stdout not available".to_string())
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(stream = "stderr", "MATLAB stderr: {}", line);
                    }
                }
            });
        }

        Ok(self
            .install(transport, stdout, Box::new(stdin), Some(child))
            .await)
    }
}

impl UpstreamSink for ConnectionManager {
    async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let channel = self.channel.read().await.clone();
        match channel {
            Some(channel) => channel.send_line(line).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "MATLAB server not connected",
            )),
        }
    }
}
