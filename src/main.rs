use clap::Parser;
use kbflow::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load settings, initialize logging and execute the command
    cli.execute().await?;

    Ok(())
}
