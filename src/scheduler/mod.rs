mod drain;
pub mod handlers;
mod service;

pub use drain::{DrainOutcome, DrainReport, Drainer};
pub use service::{ResetState, ResetStatus, SchedulerError, SchedulerService, WindowResetTask};
