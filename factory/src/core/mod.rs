//! Deterministic, pure logic shared by the factory.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod build_targets;
pub mod feedback;
pub mod judge;
pub mod nfr;
pub mod record;
pub mod root_cause;
pub mod scenario;
pub mod scenario_format;
pub mod state;
pub mod test_quality;
pub mod trajectory;
pub mod types;
