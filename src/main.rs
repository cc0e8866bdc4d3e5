// ABOUTME: Entry point for the keyfw example driver.
// ABOUTME: Connects once, runs one command and reports its captured output.

mod cli;

use clap::Parser;
use cli::Cli;
use keyfw::error::{Error, Result};
use keyfw::output::{Output, OutputMode};
use keyfw::ssh::{ForwarderConfig, KeyForwarder};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };
    let mut output = Output::new(mode);
    output.start_timer();

    if let Err(e) = run(cli, &output).await {
        output.error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    let private_key = load_private_key(&cli)?;
    let user = cli
        .user
        .clone()
        .unwrap_or_else(|| env::var("USER").unwrap_or_else(|_| "root".to_string()));

    let mut config = ForwarderConfig::new(private_key).insecure(cli.insecure);
    if let Some(path) = &cli.known_hosts {
        config = config.known_hosts_path(path);
    }

    let mut forwarder = KeyForwarder::new(config);

    output.progress(&format!("→ Connecting to {} as {}...", cli.host, user));
    forwarder.connect(&cli.host, &user).await?;

    output.progress(&format!("→ Running {:?}...", cli.command));
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let result = forwarder
        .run(&cli.command, &mut stdout, &mut stderr, None::<&[u8]>)
        .await;

    forwarder.close().await;

    // Show whatever the command produced, even when it failed
    output.command_result(&stdout, &stderr);
    result?;
    Ok(())
}

fn load_private_key(cli: &Cli) -> Result<Vec<u8>> {
    if let Some(key) = &cli.private_key {
        return Ok(key.clone().into_bytes());
    }
    match &cli.key_file {
        Some(path) => std::fs::read(path).map_err(|source| Error::KeyFile {
            path: path.clone(),
            source,
        }),
        None => Err(Error::MissingKey),
    }
}
