//! dfstore client executable.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use bytes::Bytes;

use clap::{Parser, Subcommand};

use dfstore::{logger_init, pf_error, pf_info, ClientEndpoint, DfsError, Outcome};

use tokio::runtime::Builder;

/// Client operation to perform.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Operation {
    /// Store a local file under the given name.
    Store { name: String, path: String },

    /// Load a stored file into a local path.
    Load { name: String, path: String },

    /// List stored filenames.
    List,

    /// Remove a stored file.
    Remove { name: String },
}

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Controller address.
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], 52700)))]
    controller: SocketAddr,

    /// Reply timeout in milliseconds; should exceed the Controller's
    /// quorum timeout.
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    #[command(subcommand)]
    op: Operation,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(DfsError)` on any error.
    fn sanitize(&self) -> Result<(), DfsError> {
        if self.timeout_ms == 0 {
            Err(DfsError::msg(format!(
                "invalid timeout duration {} ms",
                self.timeout_ms
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

/// Turns a non-`Done` outcome into an error.
fn done<T>(op: &str, outcome: Outcome<T>) -> Result<T, DfsError> {
    match outcome {
        Outcome::Done(value) => Ok(value),
        Outcome::Rejected(rej) => {
            Err(DfsError::msg(format!("{} rejected: {}", op, rej)))
        }
        Outcome::NoReply => {
            Err(DfsError::msg(format!("{} got no reply in time", op)))
        }
    }
}

/// Runs one operation against the cluster.
async fn run_operation(
    endpoint: &mut ClientEndpoint,
    op: Operation,
) -> Result<(), DfsError> {
    match op {
        Operation::Store { name, path } => {
            let data = Bytes::from(tokio::fs::read(&path).await?);
            let size = data.len();
            done("STORE", endpoint.store(&name, data).await?)?;
            pf_info!("cli"; "stored '{}' ({} bytes)", name, size);
        }
        Operation::Load { name, path } => {
            let data = done("LOAD", endpoint.load(&name).await?)?;
            tokio::fs::write(&path, &data).await?;
            pf_info!("cli"; "loaded '{}' into '{}' ({} bytes)",
                            name, path, data.len());
        }
        Operation::List => {
            for name in done("LIST", endpoint.list().await?)? {
                println!("{}", name);
            }
        }
        Operation::Remove { name } => {
            done("REMOVE", endpoint.remove(&name).await?)?;
            pf_info!("cli"; "removed '{}'", name);
        }
    }
    Ok(())
}

/// Actual main function of the client.
fn client_main() -> Result<(), DfsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let mut endpoint = ClientEndpoint::new_and_setup(
            args.controller,
            Duration::from_millis(args.timeout_ms),
        )
        .await?;
        run_operation(&mut endpoint, args.op).await
    })
}

/// Main function of the client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("cli"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn parse_subcommands() {
        let args = CliArgs::parse_from(["dfstore_client", "store", "f", "/tmp/f"]);
        assert_eq!(
            args.op,
            Operation::Store {
                name: "f".into(),
                path: "/tmp/f".into()
            }
        );
        assert_eq!(args.controller, SocketAddr::from(([127, 0, 0, 1], 52700)));

        let args = CliArgs::parse_from(["dfstore_client", "-c", "10.0.0.1:9000", "list"]);
        assert_eq!(args.op, Operation::List);
        assert_eq!(args.controller.port(), 9000);
    }

    #[test]
    fn sanitize_invalid() {
        let mut args = CliArgs::parse_from(["dfstore_client", "list"]);
        assert!(args.sanitize().is_ok());
        args.timeout_ms = 0;
        assert!(args.sanitize().is_err());
        args.timeout_ms = 100;
        args.threads = 1;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn outcome_to_result() {
        assert_eq!(done("LIST", Outcome::Done(3)), Ok(3));
        assert!(done::<()>("LOAD", Outcome::NoReply).is_err());
    }
}
