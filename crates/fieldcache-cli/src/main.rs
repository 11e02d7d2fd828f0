//! fieldcache - field-value cache host
//!
//! Runs a field cache over a simulated GPU fleet and prints what it holds.

use std::io::{self, Write};

use anyhow::Context;
use clap::Parser;
use fieldcache::{FieldCache, FieldRegistry, SummaryKind, SummaryMask};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fieldcache_cli::cli::{Cli, Commands};
use fieldcache_cli::output::{ConfigWritten, FieldCatalog, OutputFormat};
use fieldcache_cli::{resolve_field, CliConfig, Session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let format = OutputFormat::new(cli.format);
    let mut config = CliConfig::load(cli.config.as_deref())?;
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Run(args) => {
            config.apply(&args)?;
            let mut session = Session::new(&config)?;
            let stats = session.run().await;
            format.write(&mut stdout, &session.latest(stats)?)?;
        }
        Commands::Summary(args) => {
            config.apply(&args.sim)?;
            let registry = FieldRegistry::with_defaults();
            let field = resolve_field(&registry, &args.field)?;
            let watched = config
                .simulation
                .fields
                .iter()
                .any(|name| resolve_field(&registry, name).is_ok_and(|id| id == field));
            if !watched {
                config.simulation.fields.push(args.field.clone());
            }
            let mask = args
                .kinds
                .iter()
                .fold(SummaryMask::NONE, |mask, kind| mask | SummaryKind::from(*kind));

            let mut session = Session::new(&config)?;
            session.run().await;
            format.write(&mut stdout, &session.summarize(field, mask)?)?;
        }
        Commands::Fields => {
            let cache = FieldCache::builder().config(config.cache).build()?;
            let catalog = FieldCatalog {
                fields: cache.registry().descriptors().into_iter().cloned().collect(),
            };
            format.write(&mut stdout, &catalog)?;
        }
        Commands::InitConfig { output } => {
            let rendered = CliConfig::default().to_toml()?;
            std::fs::write(&output, rendered)
                .with_context(|| format!("failed to write {}", output.display()))?;
            let written = ConfigWritten {
                path: output.display().to_string(),
            };
            format.write(&mut stdout, &written)?;
        }
    }

    stdout.flush()?;
    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
    Ok(())
}
