use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::BridgeConfig,
    correlator::Correlator,
    error::BridgeError,
    protocol::JsonRpcMessage,
    simulation::simulated_response,
    upstream::{ConnectionManager, ConnectionState, Transport, UpstreamEvent, UpstreamEvents},
};

/// The bridge's shared context: the upstream link and the requests waiting on it.
/// Cloned into every HTTP handler as an `Arc`.
pub struct BridgeSession {
    upstream: ConnectionManager,
    correlator: Correlator,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl BridgeSession {
    pub fn new(config: &BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            upstream: ConnectionManager::new(config.upstream.clone()),
            correlator: Correlator::new(config.request_timeout),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Build the session and try to reach MATLAB. A failed connection leaves the
    /// session in simulation mode; it is never an error.
    pub async fn connect(config: &BridgeConfig) -> Arc<Self> {
        let session = Self::new(config);
        if config.offline {
            info!("Offline mode requested, serving simulated responses");
            return session;
        }

        match session.upstream.connect().await {
            Ok(events) => session.clone().spawn_pump(events),
            Err(e) => {
                warn!("Running in simulation mode: {}", e);
            }
        }
        session
    }

    /// Use an already-open stream as the upstream link.
    pub async fn attach<R, W>(self: &Arc<Self>, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let events = self
            .upstream
            .attach(reader, writer, Transport::Attached)
            .await;
        self.clone().spawn_pump(events);
    }

    pub fn is_connected(&self) -> bool {
        self.upstream.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.upstream.state()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Cancelled once [`shutdown`](Self::shutdown) runs; long-lived streams end on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Forward to MATLAB when connected, otherwise answer from the simulator.
    pub async fn dispatch(&self, request: JsonRpcMessage) -> Result<Value, BridgeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown);
        }
        if !self.is_connected() {
            debug!(method = request.method_name(), "Answering from simulation");
            return Ok(simulated_response(&request));
        }
        self.correlator.dispatch(&self.upstream, request).await
    }

    /// Close the upstream link and fail everything still waiting on it.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down MATLAB MCP Bridge...");
        self.shutdown.cancel();
        self.upstream.close().await;
        let failed = self.correlator.fail_all(|| BridgeError::ShuttingDown);
        if failed > 0 {
            info!("Rejected {} pending requests", failed);
        }
    }

    fn spawn_pump(self: Arc<Self>, mut events: UpstreamEvents) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    UpstreamEvent::Line(line) => {
                        self.correlator.handle_line(&line);
                    }
                    UpstreamEvent::Closed => {
                        let failed = self.correlator.fail_all(|| BridgeError::UpstreamClosed);
                        warn!(
                            failed,
                            "MATLAB connection lost, continuing in simulation mode"
                        );
                        break;
                    }
                }
            }
        });
    }
}
