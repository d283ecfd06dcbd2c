//! The CNI plugin protocol: invocation environment and JSON payloads.

pub mod args;
pub mod schema;
