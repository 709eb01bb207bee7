pub mod controller;
pub mod handlers;
pub mod models;

pub use controller::{AdmissionController, AdmissionError};
pub use models::{AdmissionOutcome, AttemptRequest, Capacity, Decision};
