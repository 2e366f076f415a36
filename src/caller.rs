//! Outbound calls.
//!
//! `Link` is the state shared between an endpoint, its reader task, and every
//! `Caller` handle. A `Caller` is cheap to clone and is what handlers receive
//! to make re-entrant calls back to the peer.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::actor::pending::{PendingCallTable, Resolution};
use crate::config::CallTimeout;
use crate::endpoint::state::{EndpointState, Lifecycle};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{CallMessage, CorrelationId};
use crate::transport::TransportWriter;

/// Upper bound on shutting down the writer; a stalled write holds its lock.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) struct Link {
    pub(crate) pending: PendingCallTable,
    writer: OnceLock<Arc<TransportWriter>>,
    pub(crate) lifecycle: Lifecycle,
    /// Cancelled when the link closes; the reader task watches a child token.
    pub(crate) shutdown: CancellationToken,
    default_timeout: CallTimeout,
}

impl Link {
    pub(crate) fn new(default_timeout: CallTimeout) -> Self {
        Self {
            pending: PendingCallTable::new(),
            writer: OnceLock::new(),
            lifecycle: Lifecycle::new(),
            shutdown: CancellationToken::new(),
            default_timeout,
        }
    }

    /// Install the writer and move to Active.
    ///
    /// The writer is set before the state flips, so any caller that observes
    /// Active also finds a writer.
    pub(crate) fn activate(&self, writer: Arc<TransportWriter>) -> BridgeResult<()> {
        let state = self.lifecycle.state();
        if state != EndpointState::Created {
            return Err(BridgeError::InvalidState {
                expected: EndpointState::Created.as_str(),
                actual: state.as_str(),
            });
        }
        if self.writer.set(writer).is_err() {
            return Err(BridgeError::InvalidState {
                expected: EndpointState::Created.as_str(),
                actual: EndpointState::Active.as_str(),
            });
        }
        self.lifecycle.activate()
    }

    pub(crate) fn writer(&self) -> Option<&Arc<TransportWriter>> {
        self.writer.get()
    }

    /// Move to Closed and fail every pending call with `reason`.
    ///
    /// Returns `true` for the call that performed the transition.
    pub(crate) fn close(&self, reason: &str) -> bool {
        let transitioned = self.lifecycle.close();
        let failed = self.pending.close(reason);
        self.shutdown.cancel();

        if transitioned {
            log::debug!(
                target: "crosspulse::endpoint",
                "Link closed ({}); failed {} pending call(s)",
                reason,
                failed
            );
        }
        transitioned
    }

    /// Shut down the write side, if one was ever installed.
    ///
    /// Gives up after [`WRITER_CLOSE_TIMEOUT`] if a write to a peer that stopped
    /// reading is holding the writer.
    pub(crate) async fn close_transport(&self) {
        let Some(writer) = self.writer() else {
            return;
        };
        match tokio::time::timeout(WRITER_CLOSE_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!(
                target: "crosspulse::transport",
                "Error while closing writer: {}",
                e
            ),
            Err(_) => log::warn!(
                target: "crosspulse::transport",
                "Writer still busy after {:?}, leaving it to the peer to unblock",
                WRITER_CLOSE_TIMEOUT
            ),
        }
    }
}

/// How long a single call waits for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Default,
    After(Duration),
    Never,
}

/// Builder for one outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    method: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    deadline: Deadline,
}

impl CallRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            deadline: Deadline::Default,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Override the endpoint's default timeout for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Deadline::After(timeout);
        self
    }

    /// Wait for the reply for as long as the connection stays open.
    pub fn without_timeout(mut self) -> Self {
        self.deadline = Deadline::Never;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Releases the pending slot if the call future is dropped mid-wait.
struct SlotGuard<'a> {
    pending: &'a PendingCallTable,
    id: CorrelationId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.release(self.id);
    }
}

/// Handle for issuing calls to the peer.
#[derive(Clone)]
pub struct Caller {
    link: Arc<Link>,
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("state", &self.link.lifecycle.state())
            .field("pending", &self.link.pending.pending_count())
            .finish()
    }
}

impl Caller {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Call `method` with positional arguments and the default timeout.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> BridgeResult<Value> {
        self.invoke(CallRequest::new(method).args(args)).await
    }

    /// Call and decode the result into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(&self, request: CallRequest) -> BridgeResult<T> {
        let value = self.invoke(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send one call and wait for its outcome.
    ///
    /// Exactly one of these is returned per call: the peer's result, the peer's
    /// error (`Remote`), `Timeout`, `ConnectionClosed`, or a local failure to
    /// send (`NotConnected`, `Transport`, `Serialization`).
    pub async fn invoke(&self, request: CallRequest) -> BridgeResult<Value> {
        let link = &self.link;
        if link.lifecycle.state() != EndpointState::Active {
            return Err(BridgeError::NotConnected);
        }
        let writer = link.writer().ok_or(BridgeError::NotConnected)?;

        let CallRequest {
            method,
            args,
            kwargs,
            deadline,
        } = request;

        let (id, mut rx) = link.pending.allocate()?;
        let _slot = SlotGuard {
            pending: &link.pending,
            id,
        };

        let line = CallMessage::new(id, method.as_str(), args, kwargs).to_line()?;

        // The deadline covers the write too: a peer that stopped reading
        // must not hold the caller past it.
        let limit = match deadline {
            Deadline::Default => Some(link.default_timeout.as_duration()),
            Deadline::After(duration) => Some(duration),
            Deadline::Never => None,
        }
        .map(|duration| (duration, Instant::now() + duration));

        log::trace!(
            target: "crosspulse::caller",
            "Sending call {} to '{}'",
            id,
            method
        );

        let write = writer.write_line(&line);
        let written = match limit {
            Some((duration, at)) => match tokio::time::timeout_at(at, write).await {
                Ok(written) => written,
                Err(_elapsed) => {
                    log::debug!(
                        target: "crosspulse::caller",
                        "Call {} to '{}' could not be written within {:?}",
                        id,
                        method,
                        duration
                    );
                    return Err(BridgeError::Timeout {
                        method,
                        timeout: duration,
                    });
                }
            },
            None => write.await,
        };
        if let Err(e) = written {
            log::warn!(
                target: "crosspulse::caller",
                "Failed to write call {} to '{}': {}",
                id,
                method,
                e
            );
            link.close(&format!("transport error: {}", e));
            return Err(BridgeError::Transport(e));
        }

        let received = match limit {
            Some((duration, at)) => match tokio::time::timeout_at(at, &mut rx).await {
                Ok(received) => received,
                Err(_elapsed) => match after_deadline(&link.pending, id, rx).await {
                    Some(received) => received,
                    None => {
                        log::debug!(
                            target: "crosspulse::caller",
                            "Call {} to '{}' timed out after {:?}",
                            id,
                            method,
                            duration
                        );
                        return Err(BridgeError::Timeout {
                            method,
                            timeout: duration,
                        });
                    }
                },
            },
            None => rx.await,
        };

        outcome(received)
    }

    pub fn state(&self) -> EndpointState {
        self.link.lifecycle.state()
    }
}

/// Settle a call whose deadline has elapsed.
///
/// `None` means the timeout won and the slot is gone. Otherwise a reply was
/// resolved before the slot could be expired, and it is already in `rx`.
async fn after_deadline(
    pending: &PendingCallTable,
    id: CorrelationId,
    rx: oneshot::Receiver<Resolution>,
) -> Option<Result<Resolution, oneshot::error::RecvError>> {
    if pending.expire(id) {
        return None;
    }
    Some(rx.await)
}

fn outcome(received: Result<Resolution, oneshot::error::RecvError>) -> BridgeResult<Value> {
    match received {
        Ok(Resolution::Success(value)) => Ok(value),
        Ok(Resolution::Failure(message)) => Err(BridgeError::remote(message)),
        Ok(Resolution::Closed(reason)) => Err(BridgeError::connection_closed(reason)),
        Err(_) => Err(BridgeError::connection_closed("reply channel dropped")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InboundMessage, parse_line};
    use crate::transport::{Transport, TransportReader};
    use serde_json::json;

    fn active_link(timeout: Duration) -> (Arc<Link>, TransportReader) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let (_unused_reader, writer) = Transport::new(our_read, our_write).split();
        let (peer_reader, _peer_writer) = Transport::new(their_read, their_write).split();

        let link = Arc::new(Link::new(CallTimeout::new(timeout).unwrap()));
        link.activate(Arc::new(writer)).unwrap();
        (link, peer_reader)
    }

    async fn next_call(reader: &mut TransportReader) -> CallMessage {
        let line = reader.next_line().await.unwrap().expect("call line");
        match parse_line(&line).unwrap() {
            InboundMessage::Call(call) => call,
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn request_builder_collects_arguments() {
        let request = CallRequest::new("add")
            .arg(2)
            .args([3, 4])
            .kwarg("scale", "double")
            .timeout(Duration::from_millis(5));

        assert_eq!(request.method(), "add");
        assert_eq!(request.args, vec![json!(2), json!(3), json!(4)]);
        assert_eq!(request.kwargs.get("scale"), Some(&json!("double")));
        assert_eq!(request.deadline, Deadline::After(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn call_before_activation_is_not_connected() {
        let caller = Caller::new(Arc::new(Link::new(CallTimeout::default())));
        let err = caller.call("add", vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn reply_resolves_pending_call() {
        let (link, mut peer) = active_link(Duration::from_secs(5));
        let caller = Caller::new(Arc::clone(&link));

        let call = tokio::spawn({
            let caller = caller.clone();
            async move { caller.call("add", vec![json!(2), json!(3)]).await }
        });

        let sent = next_call(&mut peer).await;
        assert_eq!(sent.method, "add");
        assert_eq!(sent.args, vec![json!(2), json!(3)]);
        assert!(link.pending.resolve(sent.id, Resolution::Success(json!(5))));

        assert_eq!(call.await.unwrap().unwrap(), json!(5));
        assert_eq!(link.pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn failure_reply_becomes_remote_error() {
        let (link, mut peer) = active_link(Duration::from_secs(5));
        let caller = Caller::new(Arc::clone(&link));

        let call = tokio::spawn(async move { caller.call("ghost", vec![]).await });
        let sent = next_call(&mut peer).await;
        link.pending.resolve(
            sent.id,
            Resolution::Failure("Method not found: ghost".to_string()),
        );

        match call.await.unwrap() {
            Err(BridgeError::Remote { message }) => assert_eq!(message, "Method not found: ghost"),
            other => panic!("expected Remote, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unanswered_call_times_out_and_frees_slot() {
        let (link, mut peer) = active_link(Duration::from_millis(30));
        let caller = Caller::new(Arc::clone(&link));

        let call = tokio::spawn(async move { caller.call("slow", vec![]).await });
        let sent = next_call(&mut peer).await;

        match call.await.unwrap() {
            Err(BridgeError::Timeout { method, timeout }) => {
                assert_eq!(method, "slow");
                assert_eq!(timeout, Duration::from_millis(30));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert!(!link.pending.is_pending(sent.id));
        // A late reply is a no-op
        assert!(!link.pending.resolve(sent.id, Resolution::Success(json!(1))));
    }

    #[tokio::test]
    async fn per_call_timeout_overrides_default() {
        let (link, mut peer) = active_link(Duration::from_secs(60));
        let caller = Caller::new(Arc::clone(&link));

        let call = tokio::spawn(async move {
            caller
                .invoke(CallRequest::new("slow").timeout(Duration::from_millis(20)))
                .await
        });
        let _ = next_call(&mut peer).await;

        assert!(matches!(
            call.await.unwrap(),
            Err(BridgeError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn close_fails_waiting_call_with_reason() {
        let (link, mut peer) = active_link(Duration::from_secs(5));
        let caller = Caller::new(Arc::clone(&link));

        let call = tokio::spawn({
            let caller = caller.clone();
            async move {
                caller
                    .invoke(CallRequest::new("wait").without_timeout())
                    .await
            }
        });
        let _ = next_call(&mut peer).await;
        assert!(link.close("peer closed the stream"));

        match call.await.unwrap() {
            Err(BridgeError::ConnectionClosed { reason }) => {
                assert_eq!(reason, "peer closed the stream")
            }
            other => panic!("expected ConnectionClosed, got {:?}", other),
        }

        assert!(matches!(
            caller.call("after", vec![]).await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn dropped_call_future_releases_slot() {
        let (link, mut peer) = active_link(Duration::from_secs(5));
        let caller = Caller::new(Arc::clone(&link));

        let call = tokio::spawn(async move { caller.call("abandoned", vec![]).await });
        let sent = next_call(&mut peer).await;
        assert!(link.pending.is_pending(sent.id));

        call.abort();
        let _ = call.await;
        assert!(!link.pending.is_pending(sent.id));
    }

    #[tokio::test]
    async fn invoke_as_decodes_result() {
        let (link, mut peer) = active_link(Duration::from_secs(5));
        let caller = Caller::new(Arc::clone(&link));

        let call = tokio::spawn(async move {
            caller
                .invoke_as::<Vec<String>>(CallRequest::new("methods"))
                .await
        });
        let sent = next_call(&mut peer).await;
        link.pending
            .resolve(sent.id, Resolution::Success(json!(["add", "echo"])));

        assert_eq!(call.await.unwrap().unwrap(), vec!["add", "echo"]);
    }

    #[tokio::test]
    async fn write_failure_closes_link() {
        let (ours, theirs) = tokio::io::duplex(64);
        let (our_read, our_write) = tokio::io::split(ours);
        let (_reader, writer) = Transport::new(our_read, our_write).split();
        drop(theirs);

        let link = Arc::new(Link::new(CallTimeout::default()));
        link.activate(Arc::new(writer)).unwrap();
        let caller = Caller::new(Arc::clone(&link));

        let err = caller.call("add", vec![json!(1)]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)), "got {:?}", err);
        assert_eq!(link.lifecycle.state(), EndpointState::Closed);
        assert_eq!(link.pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_resolved_before_expiry_wins_over_deadline() {
        let pending = PendingCallTable::new();
        let (id, rx) = pending.allocate().unwrap();

        // The reply lands after the deadline fired but before expire runs
        assert!(pending.resolve(id, Resolution::Success(json!(5))));

        let received = after_deadline(&pending, id, rx)
            .await
            .expect("reply should win over the timeout");
        assert_eq!(outcome(received).unwrap(), json!(5));
        assert!(!pending.expire(id));
    }

    #[tokio::test]
    async fn unresolved_call_after_deadline_is_a_timeout() {
        let pending = PendingCallTable::new();
        let (id, rx) = pending.allocate().unwrap();

        assert!(after_deadline(&pending, id, rx).await.is_none());
        assert!(!pending.resolve(id, Resolution::Success(json!(1))));
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn stalled_peer_cannot_hold_caller_past_deadline() {
        // The peer never reads, so a large call fills the pipe and blocks
        let (ours, _theirs) = tokio::io::duplex(64);
        let (our_read, our_write) = tokio::io::split(ours);
        let (_reader, writer) = Transport::new(our_read, our_write).split();
        let link = Arc::new(Link::new(CallTimeout::default()));
        link.activate(Arc::new(writer)).unwrap();
        let caller = Caller::new(Arc::clone(&link));

        let request = CallRequest::new("echo")
            .arg("x".repeat(64 * 1024))
            .timeout(Duration::from_millis(100));
        let err = tokio::time::timeout(Duration::from_secs(2), caller.invoke(request))
            .await
            .expect("call should give up at its deadline")
            .unwrap_err();

        match err {
            BridgeError::Timeout { method, timeout } => {
                assert_eq!(method, "echo");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert_eq!(link.pending.pending_count(), 0);
        // The half-written line poisoned the stream
        assert!(link.writer().unwrap().is_closed().await);

        tokio::time::timeout(Duration::from_secs(2), link.close_transport())
            .await
            .expect("closing a poisoned writer should not block");
    }

    #[test]
    fn activate_twice_is_invalid_state() {
        let link = Link::new(CallTimeout::default());
        let (_r, w1) = Transport::new(tokio::io::empty(), tokio::io::sink()).split();
        let (_r, w2) = Transport::new(tokio::io::empty(), tokio::io::sink()).split();

        link.activate(Arc::new(w1)).unwrap();
        assert!(matches!(
            link.activate(Arc::new(w2)),
            Err(BridgeError::InvalidState { .. })
        ));
    }
}
