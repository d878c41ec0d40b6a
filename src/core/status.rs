// src/core/status.rs

//! The client-visible status kinds returned by the serializer and the
//! protocols. Unlike [`crate::core::errors::ClusterError`] (an internal,
//! non-wire `Result` error), this enum rides inside Join/VDI-op response
//! payloads and over the request-completion channel, so its encoding must
//! stay stable.

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum ClusterStatusCode {
    Success,
    /// The request carried an epoch older than the node's current epoch.
    OldNodeVer,
    /// The request carried an epoch newer than the node's current epoch, or
    /// the local node just changed epoch underneath an in-flight join.
    NewNodeVer,
    InvalidCtime,
    InvalidEpoch,
    NotFormatted,
    WaitForFormat,
    WaitForJoin,
    Shutdown,
    JoinFailed,
    Halt,
    VerMismatch,
    /// The epoch log has no entry for the requested epoch.
    NoTag,
    NoMem,
    SystemError,
    Unknown,
}

impl std::fmt::Display for ClusterStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl Default for ClusterStatusCode {
    fn default() -> Self {
        Self::Success
    }
}
