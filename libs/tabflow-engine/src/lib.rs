//! Execution engine over partitioned row data.
//!
//! A [`Frame`] couples a schema with the [`Part`](tabflow_api::Part)s it
//! describes. Every plan execution streams the Parts through a fresh
//! [`Buffer`], which opens Parts lazily and closes each one exactly once.
//! [`plan`] holds the sequential and concurrent strategies; [`sink`] holds
//! the concurrent batching writer.

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod plan;
pub mod sink;
mod sync;

pub use buffer::Buffer;
pub use config::{ConfigParser, EngineConfig, PlanConfig, SinkConfig, TomlParser};
pub use error::EngineError;
pub use frame::Frame;
pub use plan::{Aggregator, Count, Distinct, Parallel, Plan, PlanFuture, Scan, aggregate};
pub use sink::{ConcurrentSink, SinkReport, copy};
