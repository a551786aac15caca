//! Instrument abstraction and sweep engine for IV/CV diode measurements.
//!
//! The crate is organised in three layers:
//!
//! - [`transport`]: command channels (TCP, serial, mock) speaking
//!   line-terminated command protocols, plus retry wrapping.
//! - [`driver`]: per-model drivers behind capability traits
//!   ([`driver::Instrument`], [`driver::SourceMeter`], [`driver::LcrMeter`],
//!   [`driver::Dmm`]) and the role registry that binds models to the
//!   roles of a run.
//! - [`measurement`]: the linear voltage range, shared run state, the
//!   reading queue and the [`measurement::SweepEngine`] that drives a
//!   configure/sweep/continuous lifecycle.
//!
//! Configuration is file based ([`config::Settings`]), one role table per
//! connected instrument plus the sweep parameters.

pub mod config;
pub mod driver;
pub mod error;
pub mod measurement;
pub mod transport;

#[cfg(test)]
pub(crate) mod tests_support;

pub use error::{DaqError, Result};
