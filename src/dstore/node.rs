//! Storage node process.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::dstore::blobstore::{BlobStore, FolderStore};
use crate::dstore::control::ControlHub;
use crate::dstore::data::data_session_thread;
use crate::dstore::rebalance::execute_rebalance;
use crate::protocol::{Diagnostics, Line, Message};
use crate::utils::{tcp_bind_with_retry, DfsError};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Secondary configuration knobs of a storage node.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DstoreConfig {
    /// IP of the Controller and of every peer node; also the bind IP.
    pub host: IpAddr,

    /// Path of the diagnostic log for malformed lines; empty means logger
    /// only.
    pub diag_log: String,

    /// Empty the blob folder at startup.
    pub wipe_folder: bool,

    /// Largest blob accepted from a client or peer, in bytes.
    pub max_blob_size: u64,
}

impl Default for DstoreConfig {
    fn default() -> Self {
        DstoreConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            diag_log: "".into(),
            wipe_folder: true,
            max_blob_size: 1 << 30,
        }
    }
}

/// State shared by the node's data sessions and rebalance tasks.
pub(crate) struct NodeShared {
    /// My data port, also my NodeId; used as logging prefix.
    pub(crate) me: u16,

    /// Bound on payload reads and peer transfers.
    pub(crate) timeout: Duration,

    /// IP peers are reached at.
    pub(crate) peer_host: IpAddr,

    /// Announced sizes above this are refused before `ACK`.
    pub(crate) max_blob_size: u64,

    pub(crate) store: Arc<dyn BlobStore>,

    /// Queue to the Controller control connection.
    pub(crate) tx_ctrl: mpsc::UnboundedSender<Message>,

    pub(crate) diag: Diagnostics,
}

/// A storage node: serves client and peer data connections and obeys the
/// Controller over a single control connection.
pub struct StorageNode {
    /// Controller address.
    controller: SocketAddr,

    /// Listener for data connections.
    listener: TcpListener,

    /// ControlHub module.
    control_hub: ControlHub,

    shared: Arc<NodeShared>,
}

impl StorageNode {
    /// Creates a storage node listening on `port`, backed by `folder`, and
    /// joins the Controller at `cport`. `config_str` carries `DstoreConfig`
    /// fields in TOML.
    pub async fn new_and_setup(
        port: u16,
        cport: u16,
        timeout: Duration,
        folder: &str,
        config_str: Option<&str>,
    ) -> Result<Self, DfsError> {
        if port == cport {
            return logged_err!(port; "node port equals controller port {}",
                                     cport);
        }
        if timeout.is_zero() {
            return logged_err!(port; "invalid timeout {:?}", timeout);
        }

        let config = parsed_config!(config_str => DstoreConfig;
                                    host, diag_log, wipe_folder,
                                    max_blob_size)?;
        let store = FolderStore::new_and_setup(folder, config.wipe_folder).await?;
        let diag = Diagnostics::new_and_setup(port, &config.diag_log).await?;

        // listen before joining so that the Controller never names an
        // unreachable node
        let listener =
            tcp_bind_with_retry(SocketAddr::new(config.host, port), 10).await?;
        let controller = SocketAddr::new(config.host, cport);
        let control_hub = ControlHub::new_and_setup(port, controller).await?;
        pf_info!(port; "joined controller '{}' with folder '{}'",
                       controller, folder);

        Ok(StorageNode {
            controller,
            listener,
            shared: Arc::new(NodeShared {
                me: port,
                timeout,
                peer_host: config.host,
                max_blob_size: config.max_blob_size,
                store: Arc::new(store),
                tx_ctrl: control_hub.sender(),
                diag,
            }),
            control_hub,
        })
    }

    /// Main event loop. Returns `Ok` upon catching a termination signal and
    /// an error once the control connection is lost.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DfsError> {
        let me = self.shared.me;
        loop {
            tokio::select! {
                // new client or peer data connection
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                pf_warn!(me; "error setting nodelay: {}", e);
                            }
                            tokio::spawn(data_session_thread(
                                self.shared.clone(),
                                stream,
                                addr,
                            ));
                        }
                        Err(e) => {
                            pf_warn!(me; "error accepting connection: {}", e);
                        }
                    }
                },

                // control line from the controller
                line = self.control_hub.recv_ctrl() => {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            return logged_err!(me; "lost controller: {}", e);
                        }
                    };
                    if let Err(e) = self.handle_ctrl_line(&line).await {
                        pf_error!(me; "error handling ctrl '{}': {}", line, e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(me; "storage node caught termination signal");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles one line from the Controller.
    async fn handle_ctrl_line(&mut self, line: &Line) -> Result<(), DfsError> {
        let msg = match line.parse_msg() {
            Ok(msg) => msg,
            Err(e) => {
                self.shared.diag.record(self.controller, line, &e).await;
                return Ok(());
            }
        };

        match msg {
            Message::Remove { name } => {
                let reply = if self.shared.store.delete(&name).await? {
                    Message::RemoveAck { name }
                } else {
                    Message::NoSuchFile { name }
                };
                self.control_hub.send_ctrl(reply)
            }
            Message::List { files } if files.is_empty() => {
                let files = self.shared.store.list().await?;
                self.control_hub.send_ctrl(Message::List { files })
            }
            Message::Rebalance(instr) => {
                // runs concurrently so control stays responsive
                tokio::spawn(execute_rebalance(self.shared.clone(), instr));
                Ok(())
            }
            _ => {
                let reason = DfsError::msg("unexpected on control session");
                self.shared.diag.record(self.controller, line, &reason).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_overrides() -> Result<(), DfsError> {
        let config = parsed_config!(None => DstoreConfig;
                                    host, diag_log, wipe_folder,
                                    max_blob_size)?;
        assert_eq!(config, DstoreConfig::default());

        let config = parsed_config!(Some("host = '10.0.0.7'\nwipe_folder = false")
                                    => DstoreConfig;
                                    host, diag_log, wipe_folder,
                                    max_blob_size)?;
        assert_eq!(config.host, "10.0.0.7".parse::<IpAddr>()?);
        assert!(!config.wipe_folder);
        assert_eq!(config.max_blob_size, 1 << 30);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_port_refused() {
        let node = StorageNode::new_and_setup(
            47831,
            47831,
            Duration::from_millis(100),
            "/tmp/dfstore-node-test-0",
            None,
        )
        .await;
        assert!(node.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exits_when_controller_lost() -> Result<(), DfsError> {
        let caddr: SocketAddr = "127.0.0.1:47832".parse()?;
        let clistener = tcp_bind_with_retry(caddr, 3).await?;
        let controller = tokio::spawn(async move {
            let (stream, _) = clistener.accept().await?;
            let mut reader = crate::protocol::FrameReader::new(stream);
            // JOIN arrives, then the controller goes away
            reader.read_line().await
        });

        let mut node = StorageNode::new_and_setup(
            47833,
            47832,
            Duration::from_millis(500),
            "/tmp/dfstore-node-test-1",
            None,
        )
        .await?;
        let joined = controller.await.map_err(DfsError::msg)??;
        assert_eq!(joined, Some("JOIN 47833".into()));

        let (_tx_term, rx_term) = watch::channel(false);
        assert!(node.run(rx_term).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_store_refused() -> Result<(), DfsError> {
        use crate::protocol::{FrameReader, FrameWriter};
        use tokio::net::TcpStream;

        let caddr: SocketAddr = "127.0.0.1:47834".parse()?;
        let clistener = tcp_bind_with_retry(caddr, 3).await?;
        let controller = tokio::spawn(async move {
            let (stream, _) = clistener.accept().await?;
            let mut reader = FrameReader::new(stream);
            let joined = reader.read_line().await?;
            let acked = reader.read_line().await?;
            Ok::<_, DfsError>((joined, acked))
        });

        let mut node = StorageNode::new_and_setup(
            47835,
            47834,
            Duration::from_millis(500),
            "/tmp/dfstore-node-test-2",
            Some("max_blob_size = 16"),
        )
        .await?;
        let (_tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move { node.run(rx_term).await });

        // a huge announced size is dropped without ACK and the node survives
        let stream = TcpStream::connect("127.0.0.1:47835").await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        writer
            .send(&Message::Store {
                name: "huge".into(),
                size: 1 << 40,
            })
            .await?;
        assert_eq!(reader.read_line().await?, None);

        let stream = TcpStream::connect("127.0.0.1:47835").await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        writer
            .send(&Message::Store {
                name: "small".into(),
                size: 5,
            })
            .await?;
        assert_eq!(reader.read_line().await?, Some("ACK".into()));
        writer.send_payload(b"hello").await?;

        let (joined, acked) = controller.await.map_err(DfsError::msg)??;
        assert_eq!(joined, Some("JOIN 47835".into()));
        assert_eq!(acked, Some("STORE_ACK small".into()));
        Ok(())
    }
}
