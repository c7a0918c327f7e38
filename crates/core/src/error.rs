//! Core error types.

use thiserror::Error;

use crate::peer_id::PeerId;

/// Result alias used throughout the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by core domain types and capability implementations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid peer id '{value}': {reason}")]
    InvalidPeerId { value: String, reason: String },

    #[error("unknown capability type tag {0}")]
    UnknownCapabilityType(u8),

    #[error("registry word exceeds 32 bytes: '{0}'")]
    WordTooLong(String),

    #[error("registry word is not valid utf-8")]
    WordNotUtf8,

    #[error("invalid signer '{value}': {reason}")]
    InvalidSigner { value: String, reason: String },

    #[error("no node registered for peer {0}")]
    UnknownNode(PeerId),

    #[error("service {0} already started")]
    AlreadyStarted(&'static str),

    #[error("service {0} is not running")]
    NotRunning(&'static str),

    #[error("capability failure: {0}")]
    Capability(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
