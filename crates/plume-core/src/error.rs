//! Error types for plume.

use std::io;

use thiserror::Error;

/// Main error type for plume.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Peer closed the stream. Treated like DISCONNECT only when a
    /// DISCONNECT packet was the last thing received.
    #[error("connection closed by peer")]
    Eof,

    /// Keep-alive deadline elapsed without traffic.
    #[error("keep-alive timeout")]
    Timeout,

    /// Packet identifier space or a bounded queue is exhausted on a path
    /// that cannot drop.
    #[error("resource exhausted: {0}")]
    Full(&'static str),

    /// Invariant violation. The connection is closed, the session survives.
    #[error("internal error: {0}")]
    Internal(String),
}

/// MQTT protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid protocol name: {0:?}")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,

    #[error("CONNECT received on an established connection")]
    SecondConnect,
}

pub type Result<T> = std::result::Result<T, Error>;
