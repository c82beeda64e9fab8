//! Clap derive structures for the `camproxy` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// camproxy -- present a third-party camera to a UniFi Protect NVR
#[derive(Debug, Parser)]
#[command(
    name = "camproxy",
    version,
    about = "Adopt third-party cameras into a UniFi Protect NVR",
    long_about = "Emulates a UniFi camera on the NVR control channel while relaying\n\
        the real camera's RTSP streams, translating its motion events and\n\
        serving snapshots on demand.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (TOML)
    #[arg(long, short = 'c', env = "CAMPROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, env = "CAMPROXY_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the camera adapter until interrupted
    Run(RunArgs),

    /// Create the identity artifact if needed and print its location
    Identity(OverrideArgs),

    /// Fetch an adoption token from the NVR and print it
    Token(OverrideArgs),

    /// Print the effective configuration (secrets omitted)
    Config(OverrideArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: OverrideArgs,

    /// HTTP trigger port (0 disables)
    #[arg(long)]
    pub http_port: Option<u16>,
}

/// Flags that override the config file and environment.
#[derive(Debug, Default, Args)]
pub struct OverrideArgs {
    /// NVR address
    #[arg(long, short = 'H')]
    pub nvr_host: Option<String>,

    /// Adoption token
    #[arg(long, short = 't', hide_env = true, env = "CAMPROXY_TOKEN")]
    pub token: Option<String>,

    /// NVR username, for fetching a token
    #[arg(long)]
    pub nvr_username: Option<String>,

    /// NVR password, for fetching a token
    #[arg(long, hide_env = true, env = "CAMPROXY_NVR_PASSWORD")]
    pub nvr_password: Option<String>,

    /// MAC address to present
    #[arg(long, short = 'm')]
    pub mac: Option<String>,

    /// Camera name shown by the NVR
    #[arg(long, short = 'n')]
    pub name: Option<String>,

    /// Hardware model to identify as
    #[arg(long)]
    pub model: Option<String>,

    /// Identity artifact path
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Camera vendor preset
    #[arg(long)]
    pub vendor: Option<VendorArg>,

    /// Camera address
    #[arg(long)]
    pub camera_host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VendorArg {
    /// Generic RTSP camera
    Rtsp,
    /// TP-Link Tapo
    Tapo,
    /// Yi camera behind a local restreamer
    Yi,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
