use anyhow::Result;
use clap::Parser;
use shadow_proxy::bootstrap::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}
