pub mod handlers;
pub mod models;
mod service;

pub use models::{AppLimitView, UserStatsView, WindowStatsView};
pub use service::{project_window, StatsError, StatsService, WindowSnapshot};
