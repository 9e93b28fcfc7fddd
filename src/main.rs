//! Binary entry point for pipconnect.
//!
//! Composes and validates backend connections from a configuration file.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use clap::{Args, Parser, Subcommand};
use pipconnect::config::ConfigParams;
use pipconnect::observability;
use pipconnect::{BackendKind, ConnectionComposer};
use std::path::PathBuf;
use std::process::ExitCode;

/// pipconnect - backend connection resolution.
#[derive(Parser)]
#[command(name = "pipconnect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Backend and configuration selection.
#[derive(Args)]
struct Target {
    /// Backend: couchbase, mongodb, sqlserver, sqlite, mqtt or http.
    #[arg(short, long, value_parser = parse_backend)]
    backend: BackendKind,

    /// Configuration file (TOML, YAML or JSON).
    #[arg(short, long, env = "PIPCONNECT_CONFIG")]
    config: PathBuf,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Print the composed connection.
    Compose {
        #[command(flatten)]
        target: Target,

        /// Print the password instead of masking it.
        #[arg(long)]
        show_secrets: bool,
    },

    /// Validate the connection configuration.
    Validate {
        #[command(flatten)]
        target: Target,
    },
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    BackendKind::parse(s).ok_or_else(|| {
        let known: Vec<&str> = BackendKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown backend '{s}' (expected one of: {})", known.join(", "))
    })
}

fn load(target: &Target) -> pipconnect::Result<ConfigParams> {
    Ok(ConfigParams::load_from_file(&target.config)?.with_env_overrides())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = observability::init_from_env(cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Commands::Compose {
            target,
            show_secrets,
        } => cmd_compose(&target, show_secrets),
        Commands::Validate { target } => cmd_validate(&target),
    }
}

fn cmd_compose(target: &Target, show_secrets: bool) -> ExitCode {
    let composed = match load(target)
        .and_then(|config| ConnectionComposer::for_backend(target.backend).resolve(&config))
    {
        Ok(composed) => composed,
        Err(e) => {
            eprintln!("Error [{}]: {e}", e.code());
            return ExitCode::FAILURE;
        },
    };

    let uri = if show_secrets {
        composed.uri().to_string()
    } else {
        composed.redacted_uri()
    };
    println!("uri:      {uri}");
    if let Some(database) = composed.database() {
        println!("database: {database}");
    }
    if let Some(username) = composed.username() {
        println!("username: {username}");
    }
    if let Some(password) = composed.password() {
        println!("password: {}", if show_secrets { password } else { "****" });
    }
    for (key, value) in composed.options() {
        println!("option:   {key}={value}");
    }
    ExitCode::SUCCESS
}

fn cmd_validate(target: &Target) -> ExitCode {
    let result = load(target)
        .and_then(|config| ConnectionComposer::for_backend(target.backend).resolve(&config));
    match result {
        Ok(composed) => {
            println!("OK: {} connection to {}", target.backend.as_str(), composed.target_name());
            ExitCode::SUCCESS
        },
        Err(e) => {
            println!("{}: {e}", e.code());
            ExitCode::FAILURE
        },
    }
}
