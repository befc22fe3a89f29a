//! Data-path sessions of a storage node: client and peer connections.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::dstore::node::NodeShared;
use crate::protocol::{FrameReader, FrameWriter, Line, Message};
use crate::utils::DfsError;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;

/// Receives one payload after `ACK` and persists it. Returns false if the
/// connection should be closed.
async fn receive_blob(
    shared: &NodeShared,
    reader: &mut FrameReader<OwnedReadHalf>,
    name: &str,
    size: u64,
) -> Result<bool, DfsError> {
    let len = usize::try_from(size).map_err(DfsError::msg)?;
    let data = match time::timeout(shared.timeout, reader.read_payload(len)).await
    {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            pf_warn!(shared.me; "short payload for '{}': {}", name, e);
            return Ok(false);
        }
        Err(_) => {
            pf_warn!(shared.me; "payload for '{}' timed out", name);
            return Ok(false);
        }
    };

    shared.store.put(name, data).await?;
    Ok(true)
}

/// Session task of one accepted data connection.
pub(crate) async fn data_session_thread(
    shared: Arc<NodeShared>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    loop {
        let line = match reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                pf_debug!(shared.me; "error reading from '{}': {}", addr, e);
                break;
            }
        };

        let keep_open = match line.parse_msg() {
            Ok(Message::Store { name, size }) => {
                let upload = Upload { name, size, notify: true };
                handle_store(&shared, &mut reader, &mut writer, addr, &line, upload)
                    .await
            }
            Ok(Message::RebalanceStore { name, size }) => {
                let upload = Upload { name, size, notify: false };
                handle_store(&shared, &mut reader, &mut writer, addr, &line, upload)
                    .await
            }
            Ok(Message::LoadData { name }) => match shared.store.get(&name).await {
                Ok(Some(data)) => {
                    writer.send_payload(&data).await.map(|_| true)
                }
                // hanging up is the only failure signal on this path
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            },
            Ok(_) => {
                let reason = DfsError::msg("unexpected on data session");
                shared.diag.record(addr, &line, &reason).await;
                Ok(true)
            }
            Err(e) => {
                shared.diag.record(addr, &line, &e).await;
                Ok(true)
            }
        };

        match keep_open {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                pf_warn!(shared.me; "data session '{}' failed: {}", addr, e);
                break;
            }
        }
    }
}

/// An announced incoming blob.
struct Upload {
    name: String,
    size: u64,

    /// Report `STORE_ACK` to the Controller once persisted.
    notify: bool,
}

/// STORE and REBALANCE_STORE share one path; only client stores are
/// acknowledged to the Controller.
async fn handle_store(
    shared: &NodeShared,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
    addr: SocketAddr,
    line: &Line,
    upload: Upload,
) -> Result<bool, DfsError> {
    let Upload { name, size, notify } = upload;
    if size > shared.max_blob_size {
        let reason = DfsError::msg(format!(
            "size exceeds limit of {} bytes",
            shared.max_blob_size
        ));
        shared.diag.record(addr, line, &reason).await;
        // the payload that would follow cannot be told apart from lines
        return Ok(false);
    }

    writer.send(&Message::Ack).await?;
    if !receive_blob(shared, reader, &name, size).await? {
        return Ok(false);
    }
    pf_debug!(shared.me; "stored '{}' ({} bytes)", name, size);

    if notify {
        shared.tx_ctrl.send(Message::StoreAck { name })?;
    }
    Ok(true)
}
