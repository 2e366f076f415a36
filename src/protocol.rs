//! Wire protocol for the bridge.
//!
//! ## Module Structure
//!
//! - `correlation_id` - CorrelationId type joining calls to replies
//! - `message` - Call/Reply messages and line classification

mod correlation_id;
mod message;

pub use correlation_id::CorrelationId;
pub use message::{CallMessage, InboundMessage, ProtocolViolation, ReplyMessage, parse_line};
