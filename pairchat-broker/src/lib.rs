//! `PairChat` broker library.
//!
//! Exposes the broker for use in tests and embedding. The broker accepts
//! STOMP sessions over WebSocket, keeps a log per conversation, delivers
//! every accepted message to the conversation's subscribers, and serves the
//! log over HTTP.

pub mod broker;
pub mod config;
pub mod store;
