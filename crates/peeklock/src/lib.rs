//! # peeklock
//!
//! Peek-lock message consumption runtime.
//!
//! A receiver leases messages from a broker, hands them to application
//! handlers and settles each one with the disposition the handler chose.
//! While a handler runs the runtime either renews the message lock or bounds
//! the processing time with a deadline.
//!
//! This library provides:
//! - Three dispatch topologies: parallel workers, serial and whole-batch
//! - Lock renewal and deadline guards for in-flight messages
//! - Best-effort settlement that never stops the receive loop
//! - A delegating batch receiver whose handler settles messages itself
//! - A sender that checks message size before transmission
//! - B3 trace propagation through message properties
//! - A supervisor running several receivers together
//! - An in-memory broker for tests and local runs
//!
//! ## Module Organization
//!
//! - [`transport`] - Traits implemented by broker transports
//! - [`receiver`] - Peek-lock receiver and its configuration
//! - [`handler`] - Handler traits, outcomes and handler sets
//! - [`disposition`] - Dispositions and how they are applied
//! - [`sender`] - Size-checked sending
//! - [`startup`] - Running several listeners together
//! - [`providers`] - Transport implementations

pub mod batch_receiver;
pub mod deadline;
mod dispatcher;
pub mod disposition;
pub mod error;
pub mod handler;
pub mod lease;
pub mod message;
pub mod providers;
pub mod receiver;
pub mod sender;
pub mod settings;
pub mod settle;
pub mod startup;
pub mod trace;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root for convenience
pub use batch_receiver::{BatchReceiver, BatchReceiverConfig};
pub use disposition::{Disposer, Disposition};
pub use error::{BusError, ConfigurationError, ValidationError};
pub use handler::{
    BatchHandler, BatchOutcome, DelegatingBatchHandler, Handler, HandlerError, HandlerOutcome,
    HandlerSet, MessageContext,
};
pub use lease::{DEFAULT_RENEWAL_TIME, PEEK_LOCK_TIMEOUT};
pub use message::{
    EntityName, LockToken, MessageId, OutMessage, OutMessageBatch, ReceivedMessage, Timestamp,
};
pub use providers::{InMemoryConfig, InMemoryTransport};
pub use receiver::{Receiver, ReceiverConfig};
pub use sender::{Sender, SenderConfig};
pub use settings::{DispatchMode, WorkerSettings};
pub use settle::MessageSettler;
pub use startup::{Listener, Listeners};
pub use trace::{B3Propagator, NoopPropagator, TraceContext, TracePropagator};
pub use transport::{
    BusAdministration, BusTransport, ReceiverEntity, ReceiverLink, SenderLink, SubQueue,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
