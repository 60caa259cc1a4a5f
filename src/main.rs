//! dirsend - serve a directory tree to a dirrecv receiver
//!
//! Crawls the source root, listens on host:port, and keeps the session
//! alive across receiver reconnects until every file has been delivered.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use dirsend::cli::{init_tracing, SendArgs};
use dirsend::SenderSession;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let args = SendArgs::parse();
    init_tracing(args.common.verbose);
    let config = args.resolve()?;
    let logger = args.common.logger("SENT")?;

    println!("Starting dirsend:");
    println!("  Source: {}", config.source_root.display());
    println!("  Destination: {}", config.destination_root.display());
    println!("  Bind: {}", config.addr());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let session = SenderSession::crawl(config)
            .await
            .context("Failed to crawl source")?
            .with_logger(logger);
        println!("  Files: {}", session.file_count());
        let listener = session.bind().await?;
        let report = session.run(listener).await?;
        info!(reconnects = report.reconnects, "transfer complete");
        println!(
            "Finished: {} files, {} bytes ({} reconnects)",
            report.progress.files_completed, report.progress.bytes_transferred, report.reconnects
        );
        Ok(())
    })
}
