// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Every option falls back to an environment variable.

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keyfw")]
#[command(about = "Run a remote command over SSH with the private key forwarded as an agent")]
#[command(version)]
pub struct Cli {
    /// Target host as host:port
    #[arg(long, env = "HOST", default_value = "localhost:22")]
    pub host: String,

    /// Remote login user (defaults to $USER)
    #[arg(long, env = "SSHUSER")]
    pub user: Option<String>,

    /// Command to run on the remote host
    #[arg(short, long, env = "COMMAND")]
    pub command: String,

    /// Private key contents (PEM or OpenSSH format)
    #[arg(long, env = "PRIVATEKEY", hide_env_values = true, conflicts_with = "key_file")]
    pub private_key: Option<String>,

    /// Path to a private key file
    #[arg(long, env = "KEYFILE")]
    pub key_file: Option<PathBuf>,

    /// Skip host key verification (development only)
    #[arg(
        long,
        env = "INSECURE",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub insecure: bool,

    /// known_hosts file used when not insecure (defaults to ~/.ssh/known_hosts)
    #[arg(long, env = "KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Print only the remote output
    #[arg(short, long, conflicts_with = "json")]
    pub quiet: bool,

    /// Print the result as a JSON line
    #[arg(long)]
    pub json: bool,
}
