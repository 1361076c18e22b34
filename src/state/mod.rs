//! Session state and the capture/compare lifecycle

pub mod session;

pub use session::{ComparisonSession, ResourceSnapshot, SessionConfig};
