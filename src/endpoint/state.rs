//! Endpoint lifecycle state machine.

use tokio::sync::watch;

use crate::error::BridgeError;

/// State of an endpoint.
///
/// - Created: handlers may be registered, no stream attached yet
/// - Active: reader loop running, calls accepted
/// - Closed: stream released, pending calls failed (terminal state)
///
/// State transitions:
/// - Created -> Active (on listen/connect/attach)
/// - Created -> Closed (on disconnect before start)
/// - Active -> Closed (on disconnect, end of stream, or transport error)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Active,
    Closed,
}

impl EndpointState {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointState::Created => "created",
            EndpointState::Active => "active",
            EndpointState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable lifecycle cell.
///
/// Transitions are compare-and-set under the watch channel's lock, so two
/// racing closers see exactly one successful transition.
pub(crate) struct Lifecycle {
    tx: watch::Sender<EndpointState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(EndpointState::Created);
        Self { tx }
    }

    pub(crate) fn state(&self) -> EndpointState {
        *self.tx.borrow()
    }

    /// Created -> Active.
    pub(crate) fn activate(&self) -> Result<(), BridgeError> {
        let mut actual = EndpointState::Created;
        let activated = self.tx.send_if_modified(|state| {
            actual = *state;
            if *state == EndpointState::Created {
                *state = EndpointState::Active;
                true
            } else {
                false
            }
        });

        if activated {
            Ok(())
        } else {
            Err(BridgeError::InvalidState {
                expected: EndpointState::Created.as_str(),
                actual: actual.as_str(),
            })
        }
    }

    /// Any state -> Closed. Returns `true` only for the call that performed it.
    pub(crate) fn close(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == EndpointState::Closed {
                false
            } else {
                *state = EndpointState::Closed;
                true
            }
        })
    }

    /// Resolves once the state is Closed.
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|state| *state == EndpointState::Closed).await;
    }
}
