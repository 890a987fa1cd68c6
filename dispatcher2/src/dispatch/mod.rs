//! The request dispatch engine: producer, consumer pool, per-target state
//! machine, retry sweeper, and the destination HTTP client.

pub mod client;
pub mod consumer;
pub mod dhis2;
pub mod processor;
pub mod producer;
pub mod sweeper;

pub use processor::DispatchContext;
pub use producer::InFlight;
