//! Background task record store.
//!
//! [`TaskService`] persists and retrieves task rows, their typed parameters,
//! their log lines and their stack records through a [`TaskProvider`].

pub mod log_params;
pub mod model;
pub mod params;
pub mod provider;
pub mod service;
pub mod store;

pub use model::{
    BackgroundTask, BackgroundTaskLogRecord, BackgroundTaskParameter, BackgroundTaskStatus,
    Severity,
};
pub use params::{ParamRegistry, ParamValue, TaskParamType};
pub use provider::TaskProvider;
pub use service::TaskService;
pub use store::SqlTaskProvider;
