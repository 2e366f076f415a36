//! Endpoint: one side of a bridge.
//!
//! An endpoint owns the method registry, the link to its peer (pending calls,
//! writer, lifecycle), and once started, the reader task and optionally the
//! spawned peer process. A spawned peer is terminated and reaped as soon as
//! the reader stops, whether that was end of stream or `disconnect()`.
//!
//! ```text
//! Created --listen/connect/attach--> Active --disconnect/EOF/error--> Closed
//! ```

pub(crate) mod state;

pub use state::EndpointState;

use std::future::Future;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actor::dispatcher::Dispatcher;
use crate::actor::reader::{ReaderContext, ReaderTaskHandle, spawn_reader_task};
use crate::caller::{CallRequest, Caller, Link};
use crate::config::EndpointConfig;
use crate::error::{BridgeError, BridgeResult, HandlerError, LockResultExt};
use crate::process::{PeerCommand, PeerProcess};
use crate::registry::{CallContext, MethodRegistry};
use crate::transport::Transport;

/// Resources that exist only while started.
struct Attachment {
    reader: ReaderTaskHandle,
    /// Owns the peer process until it has been terminated.
    reaper: Option<JoinHandle<BridgeResult<ExitStatus>>>,
}

pub struct Endpoint {
    config: EndpointConfig,
    registry: MethodRegistry,
    link: Arc<Link>,
    /// Cancelled once the reader task has exited, or by `disconnect()`.
    finished: CancellationToken,
    peer_status: Arc<OnceLock<ExitStatus>>,
    attachment: Mutex<Option<Attachment>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("state", &self.state())
            .field("methods", &self.registry.names())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(EndpointConfig::default())
    }
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        let link = Arc::new(Link::new(config.call_timeout));
        Self {
            config,
            registry: MethodRegistry::new(),
            link,
            finished: CancellationToken::new(),
            peer_status: Arc::new(OnceLock::new()),
            attachment: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Register a synchronous handler. Returns `self` so registrations chain.
    pub fn register<F, V>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(CallContext) -> Result<V, HandlerError> + Send + Sync + 'static,
        V: Serialize + 'static,
    {
        self.registry.register(name, f);
        self
    }

    /// Register a handler that returns a future.
    pub fn register_async<F, Fut, V>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, HandlerError>> + Send + 'static,
        V: Serialize + 'static,
    {
        self.registry.register_async(name, f);
        self
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// A cloneable handle for issuing calls from other tasks.
    pub fn caller(&self) -> Caller {
        Caller::new(Arc::clone(&self.link))
    }

    pub fn state(&self) -> EndpointState {
        self.link.lifecycle.state()
    }

    /// Number of outbound calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.link.pending.pending_count()
    }

    /// Exit status of the spawned peer, once it has been reaped.
    pub fn peer_status(&self) -> Option<ExitStatus> {
        self.peer_status.get().copied()
    }

    /// Start over an arbitrary transport.
    pub fn attach(&self, transport: Transport) -> BridgeResult<()> {
        self.start(transport, None)
    }

    /// Start over this process's stdin/stdout.
    pub fn listen(&self) -> BridgeResult<()> {
        log::debug!(target: "crosspulse::endpoint", "Listening on stdio");
        self.attach(Transport::stdio())
    }

    /// Spawn `command` as the peer and start over its stdin/stdout.
    pub fn connect(&self, command: &PeerCommand) -> BridgeResult<()> {
        let state = self.state();
        if state != EndpointState::Created {
            return Err(BridgeError::InvalidState {
                expected: EndpointState::Created.as_str(),
                actual: state.as_str(),
            });
        }

        let (peer, transport) = PeerProcess::spawn(command, &self.config.peer)?;
        log::debug!(
            target: "crosspulse::endpoint",
            "Connected to peer '{}'",
            command.program()
        );
        self.start(transport, Some(peer))
    }

    fn start(&self, transport: Transport, peer: Option<PeerProcess>) -> BridgeResult<()> {
        let mut attachment = self.attachment.lock().recover_poison("Endpoint::start");

        let (reader, writer) = transport.split();
        let writer = Arc::new(writer);
        // On failure `peer` is dropped here, which kills it
        self.link.activate(Arc::clone(&writer))?;

        let dispatcher = Dispatcher::new(self.registry.clone(), self.caller());
        let reader = spawn_reader_task(
            reader,
            ReaderContext {
                link: Arc::clone(&self.link),
                writer,
                dispatcher,
                finished: self.finished.clone(),
            },
        );
        let reaper = peer.map(|peer| {
            tokio::spawn(reap_peer(
                peer,
                self.finished.clone(),
                self.config.peer.terminate_grace(),
                Arc::clone(&self.peer_status),
            ))
        });

        *attachment = Some(Attachment { reader, reaper });
        Ok(())
    }

    /// Call `method` on the peer with the default timeout.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> BridgeResult<Value> {
        self.caller().call(method, args).await
    }

    pub async fn invoke(&self, request: CallRequest) -> BridgeResult<Value> {
        self.caller().invoke(request).await
    }

    /// Resolves once the endpoint is Closed, for whatever reason.
    pub async fn closed(&self) {
        self.link.lifecycle.closed().await;
    }

    /// Resolves once the reader has stopped and the writer is shut down.
    ///
    /// After end of stream this is later than [`Endpoint::closed`]: calls the
    /// peer sent before closing its output are answered first.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    /// Close the connection and release the stream and peer process.
    ///
    /// Pending calls fail with `ConnectionClosed`; later calls fail with
    /// `NotConnected`. Calls the peer made that are still being handled are
    /// abandoned. Safe to call more than once.
    pub async fn disconnect(&self) -> BridgeResult<()> {
        let attachment = self
            .attachment
            .lock()
            .recover_poison("Endpoint::disconnect")
            .take();

        self.link.close("endpoint disconnected");
        // Peer sees end of input before any signal
        self.link.close_transport().await;

        let Some(Attachment { reader, reaper }) = attachment else {
            self.finished.cancel();
            return Ok(());
        };

        reader.cancel();
        reader.join().await;
        self.finished.cancel();

        if let Some(reaper) = reaper {
            match reaper.await {
                Ok(status) => {
                    status?;
                }
                Err(e) => log::error!(
                    target: "crosspulse::endpoint",
                    "Peer reaper task failed: {}",
                    e
                ),
            }
        }
        Ok(())
    }
}

/// Terminate the peer once the reader has stopped.
async fn reap_peer(
    peer: PeerProcess,
    finished: CancellationToken,
    grace: Duration,
    peer_status: Arc<OnceLock<ExitStatus>>,
) -> BridgeResult<ExitStatus> {
    finished.cancelled().await;
    let status = peer.terminate(grace).await?;
    log::debug!(
        target: "crosspulse::endpoint",
        "Peer exited with {}",
        status
    );
    let _ = peer_status.set(status);
    Ok(status)
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Fails outstanding calls made through cloned callers; the stopped
        // reader then lets the reaper terminate any peer
        self.link.close("endpoint dropped");
    }
}
