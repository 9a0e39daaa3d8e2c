// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Error types for the shim subsystem
//!
//! This module provides typed errors for all shim components,
//! replacing string-based errors with structured error types.

use thiserror::Error;

/// Main error type for shim IPCP operations
#[derive(Error, Debug)]
pub enum ShimError {
    #[error("Bad argument: {0}")]
    BadArgument(String),

    #[error("Operation not valid in flow state {0}")]
    WrongState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Name conflict: {0}")]
    NameConflict(String),

    #[error("Would block, retry after enable-write")]
    WouldBlock,

    #[error("Resource allocation failed: {0}")]
    Resource(String),

    #[error("Peer refused the flow allocation")]
    PeerRefused,

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Control codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised by the ARP-like resolver
#[derive(Error, Debug, Clone)]
pub enum ResolverError {
    #[error("No registration for handle {0}")]
    UnknownHandle(u64),

    #[error("Protocol address is not valid")]
    BadAddress,

    #[error("Resolution of {0} timed out")]
    Timeout(String),

    #[error("Malformed resolver packet: {0}")]
    MalformedPacket(String),
}

/// Errors raised while (de)serializing control-channel messages
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("Truncated message while reading {0}")]
    Truncated(&'static str),

    #[error("Unknown command {0}")]
    UnknownCommand(u8),

    #[error("Message too long: {0} bytes")]
    TooLong(usize),
}

impl From<std::io::Error> for ShimError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            ShimError::WouldBlock
        } else {
            ShimError::Resource(err.to_string())
        }
    }
}

// Conversion to String for callers still using string-based errors
impl From<ShimError> for String {
    fn from(err: ShimError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_would_block_maps_to_would_block() {
        let io = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert!(matches!(ShimError::from(io), ShimError::WouldBlock));
    }

    #[test]
    fn test_io_other_maps_to_resource() {
        let io = std::io::Error::from(std::io::ErrorKind::AddrInUse);
        assert!(matches!(ShimError::from(io), ShimError::Resource(_)));
    }
}
