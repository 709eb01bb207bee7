pub mod models;

pub use models::{GroupCount, QueueItem, QueueReason, QueueStatus, StatusCounts};
