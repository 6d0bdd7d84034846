//! plume-core - MQTT 3.1 / 3.1.1 packet types and codec.
//!
//! This crate provides the wire-level types shared by the broker and its
//! test harnesses. It performs no I/O: callers hand it byte slices and get
//! packets back, or hand it packets and get bytes.

pub mod error;
pub mod packet;

pub use error::{Error, ProtocolError, Result};
pub use packet::*;
