//! Energy measurement around benchmark iterations.
//!
//! The calling process brackets each timed iteration with [`Sampler::start`]
//! and [`Sampler::stop`]; the sampler turns the two counter snapshots into
//! an [`EnergyReading`] (per-domain joules + total), which the
//! [`ReportSink`] accumulates and appends to a CSV file.
//!
//! Foreign benchmark runners use the exported `start_rapl`/`stop_rapl`
//! symbols from [`ffi`] instead of the Rust API; they loop
//! `while (start_rapl()) { workload(); stop_rapl(); }` and the iteration
//! budget comes from the `RAPL_ITERATIONS` environment variable.

pub mod control;
pub mod ffi;
pub mod sampler;
pub mod sink;
pub mod synthetic;

pub use control::LoopController;
pub use sampler::{DomainEnergy, EnergyReading, Sampler, SamplerError};
pub use sink::ReportSink;
pub use synthetic::SyntheticSource;
