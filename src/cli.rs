// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

/// Multi-tenant relay exposing OpenAI/Gemini/Anthropic-compatible chat
/// endpoints over a pool of harvested upstream credentials.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
pub struct Cli {
    /// Path to `config.yaml`. Defaults to `./config.yaml`.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Directory holding `accounts/<project>/*.json` credential files.
    #[arg(long, default_value = "accounts")]
    pub accounts_dir: PathBuf,

    /// Directory for the Grok media cache (`data/temp/{image,video}`).
    #[arg(long, default_value = "data/temp")]
    pub media_dir: PathBuf,

    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Running with no subcommand starts the server.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay server (the default action).
    Serve,

    /// Print the effective configuration and exit.
    ShowConfig,

    /// Replace the admin password in `config.yaml` with a new one
    /// (stored in the hashed `$encrypt$` form).
    RegenerateAdminPassword {
        /// The new plaintext password.
        password: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
