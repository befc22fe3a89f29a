//! dfstore Controller executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dfstore::{logger_init, pf_error, Controller, DfsError};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Port for both clients and storage nodes.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    port: u16,

    /// Replication factor R.
    #[arg(short, long, default_value_t = 3)]
    replication: usize,

    /// Quorum wait timeout in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Rebalance cycle interval in milliseconds.
    #[arg(long, default_value_t = 10000)]
    rebalance_ms: u64,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Controller configuration in TOML format.
    #[arg(long, default_value_t = String::from(""))]
    config: String,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(DfsError)` on any error.
    fn sanitize(&self) -> Result<(), DfsError> {
        if self.port <= 1024 {
            Err(DfsError::msg(format!("invalid port {}", self.port)))
        } else if self.replication == 0 {
            Err(DfsError::msg(format!(
                "invalid replication factor {}",
                self.replication
            )))
        } else if self.timeout_ms == 0 {
            Err(DfsError::msg(format!(
                "invalid timeout {} ms",
                self.timeout_ms
            )))
        } else if self.rebalance_ms == 0 {
            Err(DfsError::msg(format!(
                "invalid rebalance interval {} ms",
                self.rebalance_ms
            )))
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

/// Actual main function of the Controller.
fn controller_main() -> Result<(), DfsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), args.port);

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("c"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-controller")
            .build()?;

        // enter tokio runtime, setup the controller, and start the main
        // accept loop
        runtime.block_on(async move {
            let mut controller = Controller::new_and_setup(
                bind_addr,
                args.replication,
                Duration::from_millis(args.timeout_ms),
                Duration::from_millis(args.rebalance_ms),
                Some(&args.config),
            )
            .await?;

            controller.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DfsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the Controller.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = controller_main() {
        pf_error!("c"; "controller_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
