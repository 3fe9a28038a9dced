//! Transport implementations.
//!
//! Production brokers plug in behind the traits in [`crate::transport`]; the
//! in-memory broker here backs tests, demos and the command-line runner.

pub mod memory;

pub use memory::{BrokerEvent, BrokerOperation, Fault, InMemoryConfig, InMemoryTransport};
