//! Inbound call dispatch.
//!
//! Looks up the handler for an inbound call, runs it on its own task, and
//! turns every outcome (result, handler error, panic) into exactly one reply.

use std::any::Any;

use serde_json::Value;
use thiserror::Error;

use crate::caller::Caller;
use crate::error::HandlerError;
use crate::protocol::{CallMessage, ReplyMessage};
use crate::registry::{CallContext, MethodRegistry};

/// Why a dispatched call produced a failure reply.
///
/// The Display text is what goes on the wire as the reply's `error`.
#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    Handler(#[from] HandlerError),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Handler was cancelled")]
    Cancelled,
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    registry: MethodRegistry,
    caller: Caller,
}

impl Dispatcher {
    pub(crate) fn new(registry: MethodRegistry, caller: Caller) -> Self {
        Self { registry, caller }
    }

    /// Run the handler for `call` and build its reply.
    pub(crate) async fn dispatch(&self, call: CallMessage) -> ReplyMessage {
        let id = call.id;
        let method = call.method.clone();

        match self.run(call).await {
            Ok(value) => ReplyMessage::success(id, value),
            Err(e) => {
                if matches!(e, DispatchError::Panicked(_)) {
                    log::error!(
                        target: "crosspulse::dispatcher",
                        "Handler for '{}' (call {}) panicked: {}",
                        method,
                        id,
                        e
                    );
                } else {
                    log::debug!(
                        target: "crosspulse::dispatcher",
                        "Call {} to '{}' failed: {}",
                        id,
                        method,
                        e
                    );
                }
                ReplyMessage::failure(id, e.to_string())
            }
        }
    }

    async fn run(&self, call: CallMessage) -> Result<Value, DispatchError> {
        let CallMessage {
            id,
            method,
            args,
            kwargs,
        } = call;

        let Some(handler) = self.registry.get(&method) else {
            return Err(DispatchError::MethodNotFound(method));
        };

        let ctx = CallContext::new(id, method, args, kwargs, self.caller.clone());

        // Run on a separate task so a panicking handler is reported instead of
        // taking down the reader loop.
        match tokio::spawn(async move { handler.call(ctx).await }).await {
            Ok(result) => Ok(result?),
            Err(e) if e.is_panic() => Err(DispatchError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(DispatchError::Cancelled),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
