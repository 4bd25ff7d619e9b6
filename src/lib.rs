//! MATLAB MCP Bridge Library
//!
//! Relays MCP JSON-RPC requests to a single remote MATLAB MCP server:
//! 1. HTTP server exposing `/mcp` (request relay), `/sse` (liveness stream) and `/health`
//! 2. One upstream link, direct TCP or through an SSH tunnel, with responses matched
//!    back to callers by request id
//! 3. Simulated responses while no upstream is reachable
pub mod config;
pub mod correlator;
pub mod error;
pub mod http_server;
pub mod protocol;
pub mod session;
pub mod simulation;
pub mod smoke_client;
pub mod upstream;

// Export main functions
pub use self::error::BridgeError;
pub use self::http_server::{router, run_http_server};
pub use self::session::BridgeSession;
pub use self::smoke_client::run_smoke_client;
