use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::time::Duration;

use dirsend::cli::{init_tracing, RecvArgs};
use dirsend::progress::{ProgressCounters, ProgressDisplay};
use dirsend::protocol::defaults::PROGRESS_TICK_MS;
use dirsend::receiver::{prepare_destination, AlwaysRestart, AlwaysResume, ResumePrompt};
use dirsend::{Mode, ReceiverSession, SessionMonitor, SessionState};

/// Ask on the terminal; anything but an explicit no resumes
struct StdinPrompt;

impl ResumePrompt for StdinPrompt {
    fn confirm_resume(&self, existing_files: usize) -> bool {
        print!(
            "Destination already holds {existing_files} files. Continue the previous transfer? [Y/n] "
        );
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).is_err() {
            return true;
        }
        !matches!(line.trim().to_ascii_lowercase().as_str(), "n" | "no")
    }
}

/// Redraw the bar from the counters until the session reaches a terminal state
async fn watch_progress(monitor: SessionMonitor, counters: ProgressCounters, display: &ProgressDisplay) {
    let mut states = monitor.subscribe();
    let mut tick = tokio::time::interval(Duration::from_millis(PROGRESS_TICK_MS));
    loop {
        tokio::select! {
            _ = tick.tick() => display.update(&counters.snapshot()),
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *states.borrow_and_update();
                match state {
                    SessionState::Reconnecting => display.println("connection lost, resuming..."),
                    s if s.is_terminal() => return,
                    _ => {}
                }
            }
        }
    }
}

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let args = RecvArgs::parse();
    init_tracing(args.common.verbose);
    let config = args.resolve()?;
    let logger = args.common.logger("SAVED")?;

    let prompt: Box<dyn ResumePrompt> = if args.resume {
        Box::new(AlwaysResume)
    } else if args.fresh {
        Box::new(AlwaysRestart)
    } else {
        Box::new(StdinPrompt)
    };
    let mode = prepare_destination(&config.destination_root, prompt.as_ref())
        .context("Failed to prepare destination")?;

    println!("Receiving into {} from {}", config.destination_root.display(), config.addr());
    if mode == Mode::Continue {
        println!("  Mode: continue");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let session = ReceiverSession::new(config).with_logger(logger);
    let display = ProgressDisplay::new(Duration::from_millis(PROGRESS_TICK_MS));
    let counters = session.progress();

    let outcome = rt.block_on(async {
        let (result, ()) = tokio::join!(
            session.run(mode),
            watch_progress(session.monitor(), counters.clone(), &display)
        );
        result
    });

    match outcome {
        Ok(report) => {
            display.update(&report.progress);
            display.finish_success(&report.progress);
            Ok(())
        }
        Err(e) => {
            display.finish_restart(&e.to_string());
            std::process::exit(1);
        }
    }
}
