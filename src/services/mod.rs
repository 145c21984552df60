//! Services - check-in decisions and the task that runs them
//!
//! - `dwell_tracker` - Single-venue dwell state machine
//! - `engine` - Decision engine: dwell, suppression, undo lifecycle
//! - `dispatcher` - Worker performing check-in and undo calls
//! - `settings_gate` - Preconditions for running the tick timer
//! - `controller` - Actor owning the engine, timers and channels

pub mod controller;
pub mod dispatcher;
pub mod dwell_tracker;
pub mod engine;
pub mod settings_gate;

// Re-export commonly used types
pub use controller::{start_controller, ControllerClient, ControllerHandle, ControllerInputs, SessionSettings};
pub use dispatcher::DispatchOutcome;
pub use engine::{CheckinEngine, EngineSnapshot};
