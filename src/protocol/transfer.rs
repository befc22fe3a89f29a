//! One-shot data connections to a storage node.

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{FrameReader, FrameWriter, Message};
use crate::utils::{tcp_connect_with_retry, DfsError};

use bytes::Bytes;

use tokio::time;

/// Pushes a blob to the node at `addr`: sends `header` (a `STORE` or
/// `REBALANCE_STORE` line), waits for `ACK`, then writes the payload and
/// closes. The whole exchange is bounded by `timeout`.
pub async fn push_blob(
    addr: SocketAddr,
    header: &Message,
    data: &[u8],
    timeout: Duration,
) -> Result<(), DfsError> {
    time::timeout(timeout, async {
        let stream = tcp_connect_with_retry(addr, 0).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        writer.send(header).await?;
        match reader.read_line().await? {
            Some(line) if line.parse_msg() == Ok(Message::Ack) => {}
            reply => {
                return Err(DfsError::msg(format!(
                    "expected ACK from '{}', got {:?}",
                    addr, reply
                )));
            }
        }

        writer.send_payload(data).await?;
        writer.close().await
    })
    .await?
}

/// Fetches the `size`-byte blob `name` from the node at `addr`. A node that
/// does not hold the blob closes the connection, which surfaces here as an
/// error.
pub async fn fetch_blob(
    addr: SocketAddr,
    name: &str,
    size: u64,
    timeout: Duration,
) -> Result<Bytes, DfsError> {
    let len = usize::try_from(size).map_err(DfsError::msg)?;
    time::timeout(timeout, async {
        let stream = tcp_connect_with_retry(addr, 0).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        writer
            .send(&Message::LoadData { name: name.into() })
            .await?;
        reader.read_payload(len).await
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tcp_bind_with_retry;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn push_waits_for_ack() -> Result<(), DfsError> {
        let addr: SocketAddr = "127.0.0.1:47821".parse()?;
        let listener = tcp_bind_with_retry(addr, 3).await?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (read_half, write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            let mut writer = FrameWriter::new(write_half);
            let line = reader.read_line().await?.unwrap_or_default();
            assert_eq!(
                line.parse_msg()?,
                Message::RebalanceStore {
                    name: "f".into(),
                    size: 5
                }
            );
            writer.send(&Message::Ack).await?;
            reader.read_payload(5).await
        });

        let header = Message::RebalanceStore {
            name: "f".into(),
            size: 5,
        };
        push_blob(addr, &header, b"hello", Duration::from_secs(2)).await?;
        let received = server.await.map_err(DfsError::msg)??;
        assert_eq!(&received[..], b"hello");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_from_closing_node_fails() -> Result<(), DfsError> {
        let addr: SocketAddr = "127.0.0.1:47822".parse()?;
        let listener = tcp_bind_with_retry(addr, 3).await?;
        tokio::spawn(async move {
            // read the request, then hang up without data
            if let Ok((stream, _)) = listener.accept().await {
                let mut reader = FrameReader::new(stream);
                let _ = reader.read_line().await;
            }
        });

        let fetched = fetch_blob(addr, "f", 5, Duration::from_secs(2)).await;
        assert!(fetched.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn push_to_nobody_fails() {
        let addr: SocketAddr = "127.0.0.1:47823".parse().unwrap();
        let header = Message::Store {
            name: "f".into(),
            size: 1,
        };
        assert!(push_blob(addr, &header, b"x", Duration::from_secs(1))
            .await
            .is_err());
    }
}
