//! `PairChat`: ordered, duplicate-free two-party chat sync client library.

pub mod chat;
pub mod config;
pub mod connection;
pub mod resolver;
