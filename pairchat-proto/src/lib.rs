//! Shared protocol definitions for the `PairChat` wire format.

pub mod address;
pub mod stomp;
pub mod wire;
