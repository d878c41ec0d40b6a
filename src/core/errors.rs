// src/core/errors.rs

//! Defines the primary error type for the coordination core.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum for the cluster core. Using `thiserror` gives clean
/// error definitions and automatic `From` trait implementations, the same
/// approach the rest of this codebase's error handling follows.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("failed to encode wire message: {0}")]
    Encode(String),

    #[error("failed to decode wire message: {0}")]
    Decode(String),

    #[error("the cluster driver disconnected")]
    DriverDisconnected,

    #[error("driver join request failed: {0}")]
    DriverJoinFailed(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("the event serializer FIFO is closed")]
    SerializerClosed,

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Clone for ClusterError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(Arc::clone(e)),
            Self::Encode(s) => Self::Encode(s.clone()),
            Self::Decode(s) => Self::Decode(s.clone()),
            Self::DriverDisconnected => Self::DriverDisconnected,
            Self::DriverJoinFailed(s) => Self::DriverJoinFailed(s.clone()),
            Self::InvalidAddress(s) => Self::InvalidAddress(s.clone()),
            Self::SerializerClosed => Self::SerializerClosed,
            Self::Internal(s) => Self::Internal(s.clone()),
            Self::Config(s) => Self::Config(s.clone()),
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<std::net::AddrParseError> for ClusterError {
    fn from(e: std::net::AddrParseError) -> Self {
        Self::InvalidAddress(e.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Encode(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}
