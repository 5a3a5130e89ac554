//! Temporal-History: document inspection tool

use anyhow::Context;
use clap::Parser;
use temporal_history::cli::{inspect, Cli, Commands, Document};

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { file } => {
            let document = Document::open(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let info = document.info();
            println!("head:        {}", info.head);
            if let Some(at) = info.head.to_datetime() {
                println!("head time:   {}", at.to_rfc3339());
            }
            println!("events:      {}", info.events);
            println!("milestones:  {}", info.milestones);
            println!("entries:     {}", info.entries);
            println!(
                "size:        {} bytes ({} uncompressed)",
                info.compressed_bytes, info.raw_bytes
            );
            Ok(())
        }
        Commands::Events { file, chain } => {
            let document = Document::open(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            for event in document.events(chain)? {
                println!("{}", inspect::event_line(event, document.head()));
            }
            Ok(())
        }
        Commands::Verify { file } => {
            let document = Document::open(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let problems = document.verify();
            if problems.is_empty() {
                println!("ok: {} events, {} entries", document.info().events, document.info().entries);
                return Ok(());
            }
            for problem in &problems {
                println!("{}", problem);
            }
            anyhow::bail!("{} problem(s) found in {}", problems.len(), file.display())
        }
    }
}
