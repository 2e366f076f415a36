//! Correlation ID type joining a call to its reply.
//!
//! This module provides a type-safe wrapper for correlation IDs, preventing
//! confusion with other integer types that travel in call arguments.

use serde::{Deserialize, Serialize};

/// Correlation ID for one outbound call.
///
/// Wraps `u64` so IDs can only be non-negative. An endpoint allocates them in
/// increasing order; the peer allocates its own IDs for the calls it issues,
/// so the two directions never share a namespace.
///
/// # Wire Format
///
/// Serialized transparently as a JSON integer: `{"id": 7, ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Extract a CorrelationId from a raw message.
    ///
    /// Returns `None` if the "id" field is missing, null, negative, or not an
    /// integer.
    pub fn from_json(message: &serde_json::Value) -> Option<Self> {
        message.get("id")?.as_u64().map(Self)
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<CorrelationId> for u64 {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
