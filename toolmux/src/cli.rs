//! CLI argument definitions.

use std::path::PathBuf;

use clap::Args;

/// Arguments for `toolmux serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to the configuration bundle (servers, policies, tasks).
    #[arg(long)]
    pub config: PathBuf,

    /// Optional template registry for `toolmux resolve`-style lookups.
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Append audit entries to this JSONL file instead of keeping them
    /// in memory only.
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Name of the configured policy gating this session's calls. With no
    /// policy, every tool call is denied (listing stays open).
    #[arg(long)]
    pub policy: Option<String>,

    /// Re-read the config file when it changes and apply server diffs.
    #[arg(long)]
    pub watch: bool,

    /// Poll interval for `--watch`, in seconds.
    #[arg(long, default_value_t = 5)]
    pub watch_interval_secs: u64,

    /// Deadline for a single downstream call, in seconds.
    #[arg(long, default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Arguments for `toolmux resolve`.
#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Registry key to look up.
    pub key: String,

    /// Path to the template registry.
    #[arg(long)]
    pub registry: PathBuf,

    /// Name for the materialized server entry; defaults to the key.
    #[arg(long)]
    pub name: Option<String>,
}
