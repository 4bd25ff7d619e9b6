//! Matches requests written upstream with the responses the worker prints back.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    error::BridgeError,
    protocol::{InboundMessage, JsonRpcMessage, RequestId},
};

/// Where serialized requests are written. Implemented by the upstream channel.
#[allow(async_fn_in_trait)]
pub trait UpstreamSink {
    async fn send_line(&self, line: &str) -> std::io::Result<()>;
}

type ResponseSender = oneshot::Sender<Result<Value, BridgeError>>;

struct PendingRequest {
    ticket: u64,
    sender: ResponseSender,
}

/// What happened to one line of upstream output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDisposition {
    Resolved(RequestId),
    /// A response whose id is not pending: late, duplicate or never sent.
    Unmatched,
    /// A request or notification initiated by the worker.
    Notification,
    /// Not JSON; the worker's own log output.
    Diagnostic,
    Empty,
}

pub struct Correlator {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    next_ticket: AtomicU64,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.table().contains_key(id)
    }

    /// Register the request, write it through `sink` and wait for the matching
    /// response, a timeout, or a failure of the link.
    pub async fn dispatch<S: UpstreamSink>(
        &self,
        sink: &S,
        mut request: JsonRpcMessage,
    ) -> Result<Value, BridgeError> {
        let id = request.id.clone().unwrap_or_else(RequestId::generate);
        request.id = Some(id.clone());
        let line = request.to_line()?;

        let (mut guard, mut receiver) = self.register(id.clone())?;
        debug!(%id, method = request.method_name(), "Forwarding request to MATLAB");

        if let Err(e) = sink.send_line(&line).await {
            guard.release();
            return Err(BridgeError::UpstreamWrite(e));
        }

        let waited = tokio::time::timeout(self.timeout, &mut receiver).await;
        let outcome = match waited {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::UpstreamClosed),
            Err(_) => {
                if guard.release() {
                    warn!(%id, timeout = ?self.timeout, "Request timed out");
                    Err(BridgeError::Timeout {
                        id: id.clone(),
                        after: self.timeout,
                    })
                } else {
                    // Resolved in the same instant the deadline fired.
                    receiver.try_recv().unwrap_or(Err(BridgeError::Timeout {
                        id: id.clone(),
                        after: self.timeout,
                    }))
                }
            }
        };
        guard.disarm();
        outcome
    }

    /// Route one line of upstream output.
    pub fn handle_line(&self, line: &str) -> LineDisposition {
        let line = line.trim();
        if line.is_empty() {
            return LineDisposition::Empty;
        }

        let Some(message) = InboundMessage::parse(line) else {
            debug!("MATLAB log: {}", line);
            return LineDisposition::Diagnostic;
        };

        if !message.is_response {
            debug!(id = ?message.id, "Ignoring worker-initiated message");
            return LineDisposition::Notification;
        }

        let Some(id) = message.id else {
            debug!("Discarding response without id");
            return LineDisposition::Unmatched;
        };

        let Some(pending) = self.table().remove(&id) else {
            debug!(%id, "Discarding response for a request that is no longer pending");
            return LineDisposition::Unmatched;
        };

        if pending.sender.send(Ok(message.body)).is_err() {
            debug!(%id, "Caller went away before the response arrived");
        }
        LineDisposition::Resolved(id)
    }

    /// Fail every pending request. Returns how many were failed.
    pub fn fail_all(&self, error: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<_> = self.table().drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            debug!(%id, "Failing pending request");
            let _ = pending.sender.send(Err(error()));
        }
        count
    }

    fn register(
        &self,
        id: RequestId,
    ) -> Result<(PendingGuard<'_>, oneshot::Receiver<Result<Value, BridgeError>>), BridgeError>
    {
        let (sender, receiver) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut table = self.table();
        if table.contains_key(&id) {
            return Err(BridgeError::DuplicateRequestId(id));
        }
        table.insert(id.clone(), PendingRequest { ticket, sender });
        drop(table);

        let guard = PendingGuard {
            correlator: self,
            id,
            ticket,
            armed: true,
        };
        Ok((guard, receiver))
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes this caller's entry if the dispatch future is dropped mid-flight.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: RequestId,
    ticket: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    /// Remove the entry if it is still ours. `false` means a resolver already took it.
    fn release(&mut self) -> bool {
        self.armed = false;
        let mut table = self.correlator.table();
        match table.get(&self.id) {
            Some(pending) if pending.ticket == self.ticket => {
                table.remove(&self.id);
                true
            }
            _ => false,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        lines: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        async fn wait_for_lines(&self, count: usize) -> Vec<String> {
            loop {
                let lines = self.lines();
                if lines.len() >= count {
                    return lines;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    impl UpstreamSink for RecordingSink {
        async fn send_line(&self, line: &str) -> std::io::Result<()> {
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    struct BrokenSink;

    impl UpstreamSink for BrokenSink {
        async fn send_line(&self, _line: &str) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin not available",
            ))
        }
    }

    fn request(id: Option<&str>, method: &str) -> JsonRpcMessage {
        JsonRpcMessage {
            jsonrpc: Some("2.0".to_string()),
            id: id.map(RequestId::from),
            method: Some(method.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_with_caller_supplied_id() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();

        let (result, _) = tokio::join!(
            correlator.dispatch(&sink, request(Some("t1"), "tools/list")),
            async {
                let lines = sink.wait_for_lines(1).await;
                let sent: Value = serde_json::from_str(lines[0].trim_end()).unwrap();
                assert_eq!(sent["id"], "t1");
                assert_eq!(sent["method"], "tools/list");
                assert_eq!(
                    correlator.handle_line(r#"{"jsonrpc":"2.0","id":"t1","result":{"tools":[]}}"#),
                    LineDisposition::Resolved("t1".into())
                );
            }
        );

        let response = result.unwrap();
        assert_eq!(response["id"], "t1");
        assert_eq!(response["result"], json!({"tools": []}));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn generates_an_id_when_none_is_supplied() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();

        let (result, _) = tokio::join!(correlator.dispatch(&sink, request(None, "tools/list")), async {
            let lines = sink.wait_for_lines(1).await;
            let sent: Value = serde_json::from_str(lines[0].trim_end()).unwrap();
            let id = sent["id"].as_str().unwrap().to_string();
            assert!(uuid::Uuid::parse_str(&id).is_ok());
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": {}});
            correlator.handle_line(&reply.to_string());
        });

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_discards_late_response() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();
        let started = tokio::time::Instant::now();

        let result = correlator.dispatch(&sink, request(Some("abc"), "tools/call")).await;

        assert!(started.elapsed() >= Duration::from_secs(30));
        match result {
            Err(BridgeError::Timeout { id, after }) => {
                assert_eq!(id, RequestId::from("abc"));
                assert_eq!(after, Duration::from_secs(30));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!correlator.is_pending(&"abc".into()));
        assert_eq!(
            correlator.handle_line(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#),
            LineDisposition::Unmatched
        );
    }

    #[tokio::test]
    async fn overlapping_duplicate_id_is_rejected() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();

        let (first, _) = tokio::join!(correlator.dispatch(&sink, request(Some("dup"), "a")), async {
            sink.wait_for_lines(1).await;
            let second = correlator.dispatch(&sink, request(Some("dup"), "b")).await;
            assert!(matches!(second, Err(BridgeError::DuplicateRequestId(_))));
            assert_eq!(sink.lines().len(), 1);
            correlator.handle_line(r#"{"id":"dup","result":"first"}"#);
        });

        assert_eq!(first.unwrap()["result"], "first");
    }

    #[tokio::test]
    async fn write_failure_fails_immediately() {
        let correlator = Correlator::new(Duration::from_secs(30));

        let result = correlator.dispatch(&BrokenSink, request(Some("w1"), "tools/list")).await;

        assert!(matches!(result, Err(BridgeError::UpstreamWrite(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_releases_waiting_callers() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();

        let (result, failed) = tokio::join!(correlator.dispatch(&sink, request(Some("x"), "m")), async {
            sink.wait_for_lines(1).await;
            correlator.fail_all(|| BridgeError::UpstreamClosed)
        });

        assert_eq!(failed, 1);
        assert!(matches!(result, Err(BridgeError::UpstreamClosed)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_response_with_same_id_is_discarded() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();

        let (result, _) = tokio::join!(correlator.dispatch(&sink, request(Some("r"), "m")), async {
            sink.wait_for_lines(1).await;
            assert_eq!(
                correlator.handle_line(r#"{"id":"r","result":1}"#),
                LineDisposition::Resolved("r".into())
            );
            assert_eq!(
                correlator.handle_line(r#"{"id":"r","result":2}"#),
                LineDisposition::Unmatched
            );
        });

        assert_eq!(result.unwrap()["result"], 1);
    }

    #[tokio::test]
    async fn worker_messages_and_logs_do_not_resolve() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();

        let (result, _) = tokio::join!(correlator.dispatch(&sink, request(Some("n"), "m")), async {
            sink.wait_for_lines(1).await;
            assert_eq!(correlator.handle_line("   "), LineDisposition::Empty);
            assert_eq!(
                correlator.handle_line("Starting MATLAB engine"),
                LineDisposition::Diagnostic
            );
            assert_eq!(
                correlator.handle_line(r#"{"id":"n","method":"sampling/createMessage"}"#),
                LineDisposition::Notification
            );
            assert!(correlator.is_pending(&"n".into()));
            correlator.handle_line(r#"{"id":"n","result":"ok"}"#);
        });

        assert_eq!(result.unwrap()["result"], "ok");
    }

    #[tokio::test]
    async fn dropped_caller_leaves_no_entry() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();

        {
            let dispatch = correlator.dispatch(&sink, request(Some("gone"), "m"));
            tokio::pin!(dispatch);
            let _ = poll_briefly(dispatch.as_mut()).await;
            assert!(correlator.is_pending(&"gone".into()));
        }

        assert_eq!(correlator.pending_count(), 0);
    }

    async fn poll_briefly<F: std::future::Future + Unpin>(future: F) {
        let _ = tokio::time::timeout(Duration::from_millis(10), future).await;
    }
}
