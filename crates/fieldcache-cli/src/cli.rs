//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// fieldcache - watch and retain GPU fleet field values.
#[derive(Parser, Debug, Clone)]
#[command(name = "fieldcache")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long, env = "FIELDCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a simulated fleet and print the latest watched values.
    Run(SimArgs),

    /// Run a simulated fleet and summarize one field per entity.
    Summary(SummaryArgs),

    /// List the field catalog.
    Fields,

    /// Write the default configuration file.
    InitConfig {
        /// Path to write the config to.
        #[arg(short, long, default_value = "fieldcache.toml")]
        output: PathBuf,
    },
}

/// Overrides for the `[simulation]` config table.
#[derive(Args, Debug, Clone, Default)]
pub struct SimArgs {
    /// Number of simulated GPUs.
    #[arg(long)]
    pub gpus: Option<u32>,

    /// Number of simulated switches.
    #[arg(long)]
    pub switches: Option<u32>,

    /// How long to sample for, in seconds.
    #[arg(short, long)]
    pub duration_secs: Option<u64>,

    /// Sampling driver tick, in milliseconds.
    #[arg(long)]
    pub tick_millis: Option<u64>,

    /// Fields to watch, by id or tag (comma-separated). Defaults to the
    /// configured list.
    #[arg(long, value_delimiter = ',')]
    pub fields: Vec<String>,
}

/// Arguments for the summary command.
#[derive(Args, Debug, Clone)]
pub struct SummaryArgs {
    /// Field to summarize, by id or tag.
    #[arg(required = true)]
    pub field: String,

    /// Summary kinds (comma-separated). Defaults to every kind the field
    /// supports.
    #[arg(short, long, value_enum, value_delimiter = ',')]
    pub kinds: Vec<KindArg>,

    /// Simulation overrides.
    #[command(flatten)]
    pub sim: SimArgs,
}

/// A summary kind on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Mean value.
    Avg,
    /// Sum of values.
    Sum,
    /// Number of samples.
    Count,
    /// Time integral in value-seconds.
    Integral,
    /// Last minus first value.
    Diff,
}

impl From<KindArg> for fieldcache::SummaryKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Min => Self::Min,
            KindArg::Max => Self::Max,
            KindArg::Avg => Self::Avg,
            KindArg::Sum => Self::Sum,
            KindArg::Count => Self::Count,
            KindArg::Integral => Self::Integral,
            KindArg::Diff => Self::Diff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_overrides() {
        let cli = Cli::parse_from(["fieldcache", "run", "--gpus", "4", "-d", "2"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.gpus, Some(4));
                assert_eq!(args.duration_secs, Some(2));
                assert!(args.fields.is_empty());
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parses_field_list() {
        let cli = Cli::parse_from(["fieldcache", "run", "--fields", "gpu_temp,155"]);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.fields, vec!["gpu_temp", "155"]),
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parses_summary_kinds() {
        let cli = Cli::parse_from(["fieldcache", "summary", "power_usage", "-k", "min,avg"]);
        match cli.command {
            Commands::Summary(args) => {
                assert_eq!(args.field, "power_usage");
                assert_eq!(args.kinds, vec![KindArg::Min, KindArg::Avg]);
            }
            _ => panic!("expected summary command"),
        }
    }

    #[test]
    fn respects_global_flags() {
        let cli = Cli::parse_from(["fieldcache", "--format", "json", "--log-json", "fields"]);
        assert_eq!(cli.format, Format::Json);
        assert!(cli.log_json);
        assert!(matches!(cli.command, Commands::Fields));
    }
}
