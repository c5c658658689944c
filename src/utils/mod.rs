//! Process-level helpers shared by the binary and the connector.

pub mod bootstrap;
pub mod retry;
