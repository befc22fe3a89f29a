//! dfstore storage node executable.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dfstore::{logger_init, pf_error, DfsError, StorageNode};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Data port of this node, also its identity.
    /// This port must be available at process launch.
    #[arg(short, long)]
    port: u16,

    /// Port of the Controller.
    #[arg(short, long, default_value_t = 52700)]
    cport: u16,

    /// Payload and peer transfer timeout in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Folder holding this node's blobs.
    #[arg(short, long)]
    folder: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Storage node configuration in TOML format.
    #[arg(long, default_value_t = String::from(""))]
    config: String,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(DfsError)` on any error.
    fn sanitize(&self) -> Result<(), DfsError> {
        if self.port <= 1024 {
            Err(DfsError::msg(format!("invalid port {}", self.port)))
        } else if self.cport <= 1024 {
            Err(DfsError::msg(format!("invalid cport {}", self.cport)))
        } else if self.port == self.cport {
            Err(DfsError::msg(format!("port == cport {}", self.port)))
        } else if self.timeout_ms == 0 {
            Err(DfsError::msg(format!(
                "invalid timeout {} ms",
                self.timeout_ms
            )))
        } else if self.folder.is_empty() {
            Err(DfsError::msg("empty folder path"))
        } else if self.threads < 2 {
            Err(DfsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of a storage node. Returns an error once the
/// Controller is lost.
fn dstore_main() -> Result<(), DfsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let me = args.port;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(me; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name(format!("tokio-worker-dstore{}", me))
            .build()?;

        // enter tokio runtime, setup the storage node, and start the main
        // event loop logic
        runtime.block_on(async move {
            let mut node = StorageNode::new_and_setup(
                args.port,
                args.cport,
                Duration::from_millis(args.timeout_ms),
                &args.folder,
                Some(&args.config),
            )
            .await?;

            node.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DfsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a storage node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = dstore_main() {
        pf_error!("d"; "dstore_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
