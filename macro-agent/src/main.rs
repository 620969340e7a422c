use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use macro_agent::commands;
use macro_agent::utils::{init_logging, parse_var};
use macro_engine::{EngineConfig, Value};
use macro_recorder::Precision;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Macro agent - validate, inspect and dry-run macro libraries")]
struct Args {
    /// Engine configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true, env = "MACRO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check every macro of a library
    Validate { file: PathBuf },
    /// Print the macros of a library
    List { file: PathBuf },
    /// Run one macro against the logging injector
    Run {
        file: PathBuf,
        macro_id: String,
        /// Initial variable, as name=value. Repeatable.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
        /// Write updated statistics back to the library
        #[arg(long)]
        save: bool,
    },
    /// Print per-macro statistics as JSON
    Stats { file: PathBuf },
    /// Turn a saved event capture into a draft macro
    Convert {
        events: PathBuf,
        #[arg(short, long, default_value = "Recorded macro")]
        name: String,
        #[arg(short, long, value_enum, default_value = "medium")]
        precision: PrecisionArg,
        /// Library to append the draft to
        #[arg(long)]
        into: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PrecisionArg {
    /// 10 ms steps
    High,
    /// 50 ms steps
    Medium,
    /// 100 ms steps
    Low,
}

impl From<PrecisionArg> for Precision {
    fn from(arg: PrecisionArg) -> Self {
        match arg {
            PrecisionArg::High => Precision::High,
            PrecisionArg::Medium => Precision::Medium,
            PrecisionArg::Low => Precision::Low,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::from_file(path)?),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging()?;
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Validate { file } => {
            let problems = commands::validate(&file, &config).await?;
            if problems.is_empty() {
                println!("{}: all macros valid", file.display());
                return Ok(());
            }
            for problem in &problems {
                println!("{} ({}): {}", problem.name, problem.macro_id, problem.message);
            }
            bail!("{} invalid macro(s)", problems.len());
        }
        Command::List { file } => {
            for m in commands::list(&file)? {
                println!(
                    "{:<38} {:<12} {:<24} {:<18} {:>3} actions{}",
                    m.id,
                    m.category,
                    m.name,
                    m.hotkey.as_deref().unwrap_or("-"),
                    m.actions,
                    if m.enabled { "" } else { " (disabled)" }
                );
            }
        }
        Command::Run {
            file,
            macro_id,
            vars,
            save,
        } => {
            let report = commands::run(&file, &macro_id, vars, &config, save).await?;
            println!(
                "run {} of {}: {:?} after {:.3}s, {} actions",
                report.run_id,
                report.macro_id,
                report.state,
                report.duration.as_secs_f64(),
                report.actions_executed
            );
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if let Some(error) = &report.error {
                bail!("{error}");
            }
        }
        Command::Stats { file } => {
            let stats = commands::stats(&file, &config).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Convert {
            events,
            name,
            precision,
            into,
        } => {
            let definition = commands::convert(&events, &name, precision.into(), into.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&definition)?);
        }
    }

    Ok(())
}
