//! sapl-cli: a thin developer CLI for exercising the engine outside any
//! PEP integration (spec Section 1 scopes those out). `sapl check`
//! compiles a policy document and reports compile errors; `sapl eval`
//! additionally runs it through the dispatcher against a file-backed
//! subscription and a static demo attribute broker.
//!
//! Mirrors `tenor-cli`'s role as the ambient operator surface over the
//! core engine (SPEC_FULL Section 2), radically smaller in scope: no
//! server, template, trust, or connect subcommands, since SAPL's core has
//! no PEP/deployment/codegen surface to drive.

mod commands;
mod finders;
mod policy_json;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// SAPL policy evaluation engine toolchain.
#[derive(Parser)]
#[command(name = "sapl", version, about = "SAPL policy evaluation engine toolchain")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a JSON policy document and report compile errors
    Check {
        /// Path to the JSON policy document
        file: PathBuf,
    },

    /// Evaluate a compiled policy against a subscription
    Eval {
        /// Path to the JSON policy document
        policy: PathBuf,
        /// Path to the subscription JSON file (subject/action/resource/environment)
        #[arg(long)]
        subscription: PathBuf,
        /// Path to a flat JSON file of qualified-name -> constant-value attribute finders
        #[arg(long)]
        attributes: Option<PathBuf>,
        /// Top-level combining algorithm
        #[arg(long, default_value = "deny-overrides")]
        algorithm: String,
        /// Maximum number of aggregate decisions to print before exiting
        #[arg(long, default_value_t = 1)]
        limit: usize,
    },
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => eprintln!("{{\"error\": \"{}\"}}", msg.replace('"', "\\\"")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file } => {
            commands::check::cmd_check(&file, cli.output, cli.quiet);
        }
        Commands::Eval {
            policy,
            subscription,
            attributes,
            algorithm,
            limit,
        } => {
            commands::eval::cmd_eval(&policy, &subscription, attributes.as_ref(), &algorithm, limit, cli.output, cli.quiet)
                .await;
        }
    }

    process::exit(0);
}
