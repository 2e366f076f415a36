//! Bidirectional line-delimited JSON RPC between two processes.
//!
//! Each side runs an [`Endpoint`]: it serves registered methods to its peer
//! and calls the peer's methods, over one pair of byte streams (the child's
//! stdin/stdout in connect mode, the process's own stdio in listen mode).

mod actor;
pub mod caller;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use caller::{CallRequest, Caller};
pub use config::{CallTimeout, EndpointConfig, PeerSettings, StderrMode};
pub use endpoint::{Endpoint, EndpointState};
pub use error::{BridgeError, BridgeResult, HandlerError};
pub use process::{PeerCommand, PeerProcess};
pub use protocol::{CallMessage, CorrelationId, ReplyMessage};
pub use registry::{CallContext, MethodHandler, MethodRegistry};
pub use transport::Transport;
