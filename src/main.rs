//! ferry - peer-to-peer file and directory transfer
//!
//! One thread accepts inbound connections, each accepted connection runs on
//! a thread of its own, and the main thread drives the operator console.
//! Inbound transfers start only after the operator answers the accept
//! prompt; outbound transfers are issued from the same console.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;

use ferry::cli::Args;
use ferry::console::Console;
use ferry::gate::Gate;
use ferry::logger::{Reporter, StderrReporter, TextReporter};
use ferry::server::Service;
use ferry::session::GatedHandler;

fn main() -> Result<()> {
    let args = Args::parse();

    let reporter: Arc<dyn Reporter> = match &args.log_file {
        Some(path) => Arc::new(TextReporter::new(path).context("open log file")?),
        None => Arc::new(StderrReporter),
    };

    let gate = Arc::new(Gate::new(|peer| {
        println!("\nNew connection from {}... accept it? [Y/N]", peer);
        std::io::stdout().flush().ok();
    }));

    let service = if args.no_listen {
        None
    } else {
        let handler = Arc::new(GatedHandler {
            gate: Arc::clone(&gate),
            receive_root: args.receive_root.clone(),
            reporter: Arc::clone(&reporter),
        });
        let service =
            Service::start(args.port, handler, Arc::clone(&reporter)).context("start listener")?;
        reporter.notice(&format!("listening on {}", service.local_addr()));
        Some(Arc::new(service))
    };

    // Ctrl-C stops accepting before the process goes down
    {
        let service = service.clone();
        ctrlc::set_handler(move || {
            if let Some(s) = &service {
                s.reject();
            }
            std::process::exit(0);
        })
        .context("install interrupt handler")?;
    }

    let console = Console::new(
        gate,
        Arc::clone(&reporter),
        args.port,
        args.receive_root.clone(),
    );
    console.run()?;

    if let Some(service) = service {
        service.reject();
    }
    println!("Closing...");
    Ok(())
}
