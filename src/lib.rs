pub mod api;
pub mod config;
pub mod error;
pub mod inventory;
pub mod node;
pub mod publisher;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod telemetry;

pub use error::{Result, SchedulerError};
