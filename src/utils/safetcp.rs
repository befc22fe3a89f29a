//! TCP bind/connect helper functions with retrying logic.

use std::net::SocketAddr;

use crate::utils::DfsError;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, DfsError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.bind(bind_addr).and_then(|_| socket.listen(1024)) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(DfsError::msg(format!(
                        "binding '{}' failed: {}",
                        bind_addr, err
                    )));
                }
                retries -= 1;
                time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, DfsError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(DfsError::msg(format!(
                        "connecting '{}' failed: {}",
                        conn_addr, err
                    )));
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_then_connect() -> Result<(), DfsError> {
        let addr: SocketAddr = "127.0.0.1:47801".parse()?;
        let listener = tcp_bind_with_retry(addr, 3).await?;
        let acceptor = tokio::spawn(async move { listener.accept().await });
        let stream = tcp_connect_with_retry(addr, 3).await?;
        assert_eq!(stream.peer_addr()?, addr);
        assert!(acceptor.await.is_ok());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_gives_up() -> Result<(), DfsError> {
        // nothing listens on this port
        let addr: SocketAddr = "127.0.0.1:47802".parse()?;
        assert!(tcp_connect_with_retry(addr, 1).await.is_err());
        Ok(())
    }
}
