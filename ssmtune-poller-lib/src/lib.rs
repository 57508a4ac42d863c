//! Live parameter polling for SSM devices
//!
//! [`QueryCoalescer`] turns the enabled [`ParameterDescriptor`]s into one read
//! request and decodes its replies; [`PollingWorker`] issues that request on a
//! background thread and reports results as [`WorkerEvent`]s.

mod coalescer;
mod config;
mod error;
mod parameter;
pub mod worker;

pub use coalescer::{Query, QueryCoalescer, Reading, MAX_QUERY_ADDRESSES};
pub use config::{load_parameters, PollerConfig, MAX_CYCLE_SLEEP_MS, MAX_REQUEST_TIMEOUT_MS};
pub use error::{ConfigError, QueryError};
pub use parameter::{ByteAddresses, ByteOrder, DataType, ParameterDescriptor, Scaling, Value};
pub use worker::{PollingWorker, WorkerCommand, WorkerEvent, WorkerFlag, WorkerHandle, WorkerState};
