pub mod phase;
pub mod rc;
pub mod telemetry;
