//! Client side of the storage protocol.

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{
    fetch_blob, push_blob, FrameReader, FrameWriter, Message, NodeId, Rejection,
};
use crate::utils::{tcp_connect_with_retry, DfsError};

use bytes::Bytes;

use futures::future::join_all;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time;

/// Result of one client operation.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Outcome<T> {
    /// The operation completed.
    Done(T),

    /// The Controller refused the request.
    Rejected(Rejection),

    /// The Controller stayed silent past the client timeout, as it does
    /// on a quorum timeout.
    NoReply,
}

/// A client connection to the Controller. Node addresses named by the
/// Controller are reached at the Controller's IP.
pub struct ClientEndpoint {
    /// Controller address.
    controller: SocketAddr,

    /// Bound on every reply wait and data transfer. Should exceed the
    /// Controller's quorum timeout.
    timeout: Duration,

    reader: FrameReader<OwnedReadHalf>,

    writer: FrameWriter<OwnedWriteHalf>,
}

impl ClientEndpoint {
    /// Connects to the Controller.
    pub async fn new_and_setup(
        controller: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, DfsError> {
        pf_debug!("cli"; "connecting to controller '{}'...", controller);
        let stream = tcp_connect_with_retry(controller, 10).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(ClientEndpoint {
            controller,
            timeout,
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
        })
    }

    fn node_addr(&self, node: NodeId) -> SocketAddr {
        SocketAddr::new(self.controller.ip(), node.0)
    }

    /// Waits for the next reply line; `None` on timeout.
    async fn recv_reply(&mut self) -> Result<Option<Message>, DfsError> {
        match time::timeout(self.timeout, self.reader.read_line()).await {
            Ok(Ok(Some(line))) => Ok(Some(line.parse_msg()?)),
            Ok(Ok(None)) => {
                logged_err!("cli"; "controller closed the connection")
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn request(&mut self, msg: &Message) -> Result<Option<Message>, DfsError> {
        self.writer.send(msg).await?;
        self.recv_reply().await
    }

    /// Stores `data` as `name`: asks the Controller for target nodes, pushes
    /// the bytes to each of them, then waits for `STORE_COMPLETE`.
    pub async fn store(
        &mut self,
        name: &str,
        data: Bytes,
    ) -> Result<Outcome<()>, DfsError> {
        let header = Message::Store {
            name: name.into(),
            size: data.len() as u64,
        };
        let nodes = match self.request(&header).await? {
            Some(Message::StoreTo { nodes }) => nodes,
            Some(Message::Rejected(rej)) => return Ok(Outcome::Rejected(rej)),
            Some(reply) => {
                return logged_err!("cli"; "unexpected reply to STORE: {}", reply)
            }
            None => return Ok(Outcome::NoReply),
        };

        let addrs: Vec<SocketAddr> =
            nodes.iter().map(|node| self.node_addr(*node)).collect();
        let pushes = addrs
            .iter()
            .map(|addr| push_blob(*addr, &header, &data, self.timeout));
        for (node, result) in nodes.iter().zip(join_all(pushes).await) {
            if let Err(e) = result {
                pf_warn!("cli"; "error pushing '{}' to {}: {}", name, node, e);
            }
        }

        match self.recv_reply().await? {
            Some(Message::StoreComplete) => Ok(Outcome::Done(())),
            Some(reply) => {
                logged_err!("cli"; "unexpected reply to STORE: {}", reply)
            }
            None => Ok(Outcome::NoReply),
        }
    }

    /// Loads `name`, asking for another replica with `RELOAD` whenever a
    /// node fails to deliver.
    pub async fn load(&mut self, name: &str) -> Result<Outcome<Bytes>, DfsError> {
        let mut request = Message::Load { name: name.into() };
        loop {
            match self.request(&request).await? {
                Some(Message::LoadFrom { node, size }) => {
                    let addr = self.node_addr(node);
                    match fetch_blob(addr, name, size, self.timeout).await {
                        Ok(data) => return Ok(Outcome::Done(data)),
                        Err(e) => {
                            pf_warn!("cli"; "loading '{}' from {} failed: {}",
                                            name, node, e);
                            request = Message::Reload { name: name.into() };
                        }
                    }
                }
                Some(Message::Rejected(rej)) => return Ok(Outcome::Rejected(rej)),
                Some(reply) => {
                    return logged_err!("cli"; "unexpected reply to LOAD: {}", reply)
                }
                None => return Ok(Outcome::NoReply),
            }
        }
    }

    /// Lists every stored filename.
    pub async fn list(&mut self) -> Result<Outcome<Vec<String>>, DfsError> {
        match self.request(&Message::List { files: vec![] }).await? {
            Some(Message::List { files }) => Ok(Outcome::Done(files)),
            Some(Message::Rejected(rej)) => Ok(Outcome::Rejected(rej)),
            Some(reply) => {
                logged_err!("cli"; "unexpected reply to LIST: {}", reply)
            }
            None => Ok(Outcome::NoReply),
        }
    }

    /// Removes `name` from every node holding it.
    pub async fn remove(&mut self, name: &str) -> Result<Outcome<()>, DfsError> {
        match self.request(&Message::Remove { name: name.into() }).await? {
            Some(Message::RemoveComplete) => Ok(Outcome::Done(())),
            Some(Message::Rejected(rej)) => Ok(Outcome::Rejected(rej)),
            Some(reply) => {
                logged_err!("cli"; "unexpected reply to REMOVE: {}", reply)
            }
            None => Ok(Outcome::NoReply),
        }
    }
}
