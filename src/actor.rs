//! Background machinery of a running endpoint.
//!
//! - `pending`: correlation table for outbound calls
//! - `dispatcher`: runs local handlers for inbound calls
//! - `reader`: the task that reads and routes every inbound line

pub(crate) mod dispatcher;
pub(crate) mod pending;
pub(crate) mod reader;
