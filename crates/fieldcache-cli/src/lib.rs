//! # fieldcache-cli
//!
//! Command-line host for the `fieldcache` field-value cache.
//!
//! Provides commands for:
//! - Sampling a simulated fleet and printing the latest values
//! - Summarizing one field across the fleet
//! - Listing the field catalog
//! - Writing a default configuration file
//!
//! # Architecture
//!
//! A [`session::Session`] builds a `FieldCache` over a static inventory,
//! watches the configured fields on every entity and drives a
//! [`sim::SimulatedSource`] from a tokio interval.
//!
//! ```text
//! ┌──────────────┐  tick   ┌────────────────┐  record  ┌────────────┐
//! │ tokio timer  │────────►│ SamplingDriver │─────────►│ FieldCache │
//! └──────────────┘         └────────────────┘          └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod output;
pub mod session;
pub mod sim;

pub use cli::{Cli, Commands, Format, KindArg, SimArgs, SummaryArgs};
pub use config::{CliConfig, SimulationConfig};
pub use error::CliError;
pub use output::OutputFormat;
pub use session::{resolve_field, RunStats, Session};
pub use sim::SimulatedSource;
