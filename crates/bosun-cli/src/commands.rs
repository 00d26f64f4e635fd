//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a master
    Serve {
        /// Path to the master configuration
        #[arg(short, long, default_value = "bosun.yaml")]
        config: PathBuf,
    },

    /// Validate a master configuration without starting it
    Validate {
        /// Path to the master configuration
        #[arg(default_value = "bosun.yaml")]
        config: PathBuf,
    },

    /// Drop a try job into a scheduler's job directory
    Try {
        /// The try_jobdir scheduler's job directory
        #[arg(long)]
        jobdir: PathBuf,

        /// Builders to run on; defaults to every builder the scheduler allows
        #[arg(short, long = "builder")]
        builders: Vec<String>,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        revision: Option<String>,

        /// Diff to apply on top of the revision
        #[arg(long)]
        diff: Option<PathBuf>,

        /// Patch strip level
        #[arg(short = 'p', long, default_value_t = 1)]
        patchlevel: u32,

        #[arg(long)]
        who: Option<String>,

        #[arg(long)]
        comment: Option<String>,

        #[arg(long, default_value = "")]
        codebase: String,

        #[arg(long, default_value = "")]
        repository: String,

        #[arg(long, default_value = "")]
        project: String,

        /// Build property as NAME=VALUE
        #[arg(long = "property")]
        properties: Vec<String>,
    },

    /// Report a change to a running master
    Sendchange {
        /// Master API URL; defaults to the CLI configuration
        #[arg(long)]
        master: Option<String>,

        #[arg(long, default_value = "unknown")]
        who: String,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        revision: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long, default_value = "")]
        project: String,

        #[arg(long, default_value = "")]
        repository: String,

        #[arg(long, default_value = "")]
        codebase: String,

        #[arg(short = 'm', long, default_value = "")]
        comments: String,

        /// Files touched by the change
        files: Vec<String>,
    },
}
