//! Controller process: accepts connections and runs the rebalancer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::controller::acks::AckHub;
use crate::controller::membership::Placement;
use crate::controller::rebalancer::rebalancer_thread;
use crate::controller::session::session_thread;
use crate::controller::state::ClusterState;
use crate::protocol::Diagnostics;
use crate::utils::{tcp_bind_with_retry, DfsError};

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Notify, RwLock};

/// Secondary configuration knobs of the Controller.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ControllerConfig {
    /// Replica placement policy for new files.
    pub placement: Placement,

    /// Path of the diagnostic log for malformed lines; empty means logger
    /// only.
    pub diag_log: String,
}

#[allow(clippy::derivable_impls)]
impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            placement: Placement::LeastLoaded,
            diag_log: "".into(),
        }
    }
}

/// State shared by every session task and the rebalancer.
pub(crate) struct ControllerShared {
    /// Replication factor R.
    pub(crate) replication: usize,

    /// Bound on every quorum wait.
    pub(crate) timeout: Duration,

    /// Membership and file index, mutated one transaction at a time.
    pub(crate) state: Mutex<ClusterState>,

    /// Acknowledgement fan-in.
    pub(crate) acks: Arc<AckHub>,

    /// Client requests hold it shared; a rebalance cycle holds it exclusive.
    pub(crate) gate: RwLock<()>,

    /// Sink for malformed or unexpected lines.
    pub(crate) diag: Diagnostics,

    /// Wakes the rebalancer ahead of its timer.
    pub(crate) rebalance_kick: Notify,
}

/// The Controller: membership, file index, quorum coordination, and
/// rebalancing. Never touches file bytes.
pub struct Controller {
    /// Address the listener is bound to.
    bind_addr: SocketAddr,

    /// Listener for both clients and storage nodes.
    listener: TcpListener,

    /// Period of the background rebalance cycle.
    rebalance_interval: Duration,

    shared: Arc<ControllerShared>,
}

impl Controller {
    /// Creates a Controller bound to `bind_addr`. `config_str` carries
    /// `ControllerConfig` fields in TOML.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        replication: usize,
        timeout: Duration,
        rebalance_interval: Duration,
        config_str: Option<&str>,
    ) -> Result<Self, DfsError> {
        if replication == 0 {
            return logged_err!("c"; "invalid replication factor {}", replication);
        }
        if timeout.is_zero() || rebalance_interval.is_zero() {
            return logged_err!("c"; "invalid timeout {:?} or interval {:?}",
                                    timeout, rebalance_interval);
        }

        let config = parsed_config!(config_str => ControllerConfig;
                                    placement, diag_log)?;
        let diag = Diagnostics::new_and_setup("c", &config.diag_log).await?;

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        pf_info!("c"; "listening on '{}' with R={} placement {:?}",
                      bind_addr, replication, config.placement);

        Ok(Controller {
            bind_addr,
            listener,
            rebalance_interval,
            shared: Arc::new(ControllerShared {
                replication,
                timeout,
                state: Mutex::new(ClusterState::new(
                    replication,
                    config.placement,
                )),
                acks: Arc::new(AckHub::new()),
                gate: RwLock::new(()),
                diag,
                rebalance_kick: Notify::new(),
            }),
        })
    }

    /// Main accept loop. Spawns one session task per connection and the
    /// background rebalancer. Breaks out of the loop only upon catching a
    /// termination signal.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DfsError> {
        let rebalancer_handle = tokio::spawn(rebalancer_thread(
            self.shared.clone(),
            self.rebalance_interval,
        ));

        loop {
            tokio::select! {
                // new client or storage node connection
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            pf_debug!("c"; "accepted connection from '{}'", addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                pf_warn!("c"; "error setting nodelay: {}", e);
                            }
                            tokio::spawn(session_thread(
                                self.shared.clone(),
                                stream,
                                addr,
                            ));
                        }
                        Err(e) => {
                            pf_warn!("c"; "error accepting connection: {}", e);
                        }
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("c"; "controller on '{}' caught termination signal",
                                  self.bind_addr);
                    break;
                }
            }
        }

        rebalancer_handle.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_placement_parsed() -> Result<(), DfsError> {
        let config = parsed_config!(Some("placement = 'random'") => ControllerConfig;
                                    placement, diag_log)?;
        assert_eq!(config.placement, Placement::Random);
        assert_eq!(config.diag_log, "");
        Ok(())
    }

    #[test]
    fn config_bad_placement() {
        let config = parsed_config!(Some("placement = 'round_robin'") => ControllerConfig;
                                    placement, diag_log);
        assert!(config.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_replication_refused() {
        let addr: SocketAddr = "127.0.0.1:47811".parse().unwrap();
        let controller = Controller::new_and_setup(
            addr,
            0,
            Duration::from_millis(100),
            Duration::from_millis(100),
            None,
        )
        .await;
        assert!(controller.is_err());
    }
}
