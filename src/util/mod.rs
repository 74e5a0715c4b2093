//! Small shared utilities: wall-clock helpers and telemetry setup.

pub mod clock;
pub mod telemetry;

pub use clock::*;
pub use telemetry::*;
