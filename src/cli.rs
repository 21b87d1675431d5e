//! CLI command definitions and subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ralph",
    about = "Drives a coding-agent CLI through repeated iterations against a PRD",
    version
)]
pub struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true, env = "RALPH_VERBOSE")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a loop against a task's PRD until it completes or exhausts its
    /// iteration budget.
    Run {
        /// Directory containing prd.json. Defaults to the current directory.
        #[arg(value_name = "TASK_DIR")]
        task_dir: Option<PathBuf>,

        /// Maximum iterations before giving up.
        #[arg(short = 'i', long, default_value_t = 50)]
        max_iterations: u32,

        /// Agent backend to use (claude, opencode). Defaults to the PRD's
        /// `agent` field, then the configured default order.
        #[arg(short = 'a', long, env = "RALPH_AGENT")]
        agent: Option<String>,

        /// Model identifier to pass through to the chosen agent backend.
        #[arg(short = 'm', long)]
        model: Option<String>,

        /// Skip confirmation prompts (non-interactive environments).
        #[arg(short = 'y', long)]
        yes: bool,

        /// Path to a prompt template overriding the resolved default.
        #[arg(short = 'p', long, env = "RALPH_PROMPT")]
        prompt: Option<PathBuf>,

        /// Run in this process instead of forking a detached supervisor.
        #[arg(long)]
        foreground: bool,
    },

    /// Show the status of one or every known session.
    Status {
        /// Task name to query. Shows every known session if omitted.
        task: Option<String>,
    },

    /// Request a running loop to stop after its current iteration.
    Stop {
        /// Task name, as shown by `ralph status`.
        task: String,
    },

    /// Request a running loop to checkpoint and exit, resumable later.
    Checkpoint {
        /// Task name, as shown by `ralph status`.
        task: String,
    },

    /// Attach to a running loop's PTY for interactive control.
    Attach {
        /// Task name, as shown by `ralph status`.
        task: String,
    },

    /// Mark sessions whose supervisor process has died as failed.
    Clean,

    /// Write a starter PRD and prompt template into the current directory.
    Init,
}
