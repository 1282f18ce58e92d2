use crate::host::HostState;
use crate::transport::TransportError;
use membership_core::{ConfigError, MemberListError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Operation not allowed while {0}")]
    IllegalState(HostState),

    #[error("Invalid options: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Join cancelled by shutdown")]
    JoinCancelled,

    #[error("Member list error: {0}")]
    MemberList(#[from] MemberListError),

    #[error("Agent host is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, HostError>;
