//! Bookmarks CLI: check, summarize, and tag a bookmark export.
//!
//! Reads a Pinboard-style JSON export, verifies every URL, fills in missing
//! notes and tags with an LLM, and writes the processed export. All expensive
//! work is cached, so an interrupted run resumes where it stopped.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
