//! Built-in node executors

pub mod http;
