//! Command-line interface for the Vigil orchestrator.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use vigil_core::{Severity, VigilConfig};

use crate::runner;

/// Vigil - multi-agent incident response orchestrator.
#[derive(Parser)]
#[command(name = "vigil", version, about)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the full response pipeline for one incident
    Respond {
        /// Short incident title
        #[arg(long)]
        title: String,

        /// Free-form description fed to the detection agents
        #[arg(long, default_value = "")]
        description: String,

        /// Incident severity
        #[arg(long, value_enum, default_value_t = SeverityArg::Medium)]
        severity: SeverityArg,

        /// Affected service name
        #[arg(long)]
        service: Option<String>,

        /// Estimated downtime cost per minute, in dollars
        #[arg(long)]
        cost_per_minute: Option<f64>,

        /// Use Redis for the low-latency transport instead of in-memory
        #[arg(long)]
        redis: bool,
    },

    /// Validate the configuration file and print the effective settings
    CheckConfig,
}

/// Severity as a CLI argument.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SeverityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<SeverityArg> for Severity {
    fn from(arg: SeverityArg) -> Self {
        match arg {
            SeverityArg::Low => Severity::Low,
            SeverityArg::Medium => Severity::Medium,
            SeverityArg::High => Severity::High,
            SeverityArg::Critical => Severity::Critical,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<VigilConfig> {
    let config = match path {
        Some(path) => VigilConfig::load_from_path(path)?,
        None => VigilConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Respond {
            title,
            description,
            severity,
            service,
            cost_per_minute,
            redis,
        } => {
            let request = runner::RespondRequest {
                title,
                description,
                severity: severity.into(),
                service,
                cost_per_minute,
                use_redis: redis,
            };
            runner::respond(config, request).await
        }
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
