//! CLI surface: one-shot runs, an interactive REPL, status, and manual
//! trigger firing. The CLI is one channel of the multi-channel design;
//! chat integrations and HTTP receivers are external collaborators that
//! consume the same session API and event feed.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "osa", version, about = "Autonomous operating-system agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Send one message and print the reply.
    Run {
        message: String,
        /// Reuse (or create) a named session instead of a throwaway one.
        #[arg(long)]
        session: Option<String>,
        /// Provider override for this session (e.g. "anthropic").
        #[arg(long)]
        provider: Option<String>,
        /// Model override for this session.
        #[arg(long)]
        model: Option<String>,
    },

    /// Interactive chat session.
    Chat {
        #[arg(long)]
        session: Option<String>,
    },

    /// Show providers, budget, and treasury state.
    Status,

    /// Fire a configured trigger with a JSON payload.
    Trigger {
        id: String,
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}
