mod config;
mod context;
mod lifecycle;
mod procedures;

pub use config::{Callback, JobConfig, JobMode};
pub use context::WorkerContext;
pub use lifecycle::dispatch;
pub use procedures::{Job, JobProcedures, Procedure};
