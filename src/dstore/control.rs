//! Storage node control link to the Controller.

use std::net::SocketAddr;

use crate::protocol::{FrameReader, FrameWriter, Line, Message};
use crate::utils::{tcp_connect_with_retry, DfsError};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The Controller control message handler module.
pub(crate) struct ControlHub {
    /// My node port, used as logging prefix.
    me: u16,

    /// Receiver side of the recv channel; carries raw lines so that the
    /// owner can record malformed ones.
    rx_recv: mpsc::UnboundedReceiver<Line>,

    /// Sender side of the send channel.
    tx_send: mpsc::UnboundedSender<Message>,

    /// Control messenger thread join handle.
    control_messenger_handle: JoinHandle<()>,
}

// ControlHub public API implementation
impl ControlHub {
    /// Connects to the Controller and announces my data port with `JOIN`.
    /// Spawns the control messenger thread.
    pub(crate) async fn new_and_setup(
        me: u16,
        controller: SocketAddr,
    ) -> Result<Self, DfsError> {
        pf_debug!(me; "connecting to controller '{}'...", controller);
        let stream = tcp_connect_with_retry(controller, 10).await?;

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_send.send(Message::Join { port: me })?;

        let control_messenger_handle = tokio::spawn(
            Self::control_messenger_thread(me, stream, tx_recv, rx_send),
        );

        Ok(ControlHub {
            me,
            rx_recv,
            tx_send,
            control_messenger_handle,
        })
    }

    /// Waits for the next line from the Controller. Fails once the control
    /// connection is gone.
    pub(crate) async fn recv_ctrl(&mut self) -> Result<Line, DfsError> {
        match self.rx_recv.recv().await {
            Some(line) => Ok(line),
            None => logged_err!(self.me; "control connection has been closed"),
        }
    }

    /// Sends a control message to the Controller.
    pub(crate) fn send_ctrl(&self, msg: Message) -> Result<(), DfsError> {
        self.tx_send.send(msg)?;
        Ok(())
    }

    /// A sender handle usable from data sessions and rebalance tasks.
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.tx_send.clone()
    }
}

// ControlHub control_messenger thread implementation
impl ControlHub {
    /// Controller control message listener and sender thread function.
    async fn control_messenger_thread(
        me: u16,
        conn: TcpStream,
        tx_recv: mpsc::UnboundedSender<Line>,
        mut rx_send: mpsc::UnboundedReceiver<Message>,
    ) {
        pf_debug!(me; "control_messenger thread spawned");

        let (conn_read, conn_write) = conn.into_split();
        let mut reader = FrameReader::new(conn_read);
        let mut writer = FrameWriter::new(conn_write);

        loop {
            tokio::select! {
                // gets a message to send to the controller
                msg = rx_send.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = writer.send(&msg).await {
                                pf_error!(me; "error sending ctrl: {}", e);
                                break;
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // receives a control line from the controller
                line = reader.read_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Err(e) = tx_recv.send(line) {
                                pf_error!(me; "error sending to tx_recv: {}", e);
                            }
                        },
                        Ok(None) => {
                            pf_warn!(me; "controller closed the control connection");
                            break;
                        },
                        Err(e) => {
                            pf_error!(me; "error reading ctrl: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        pf_debug!(me; "control_messenger thread exitted");
    }
}

impl Drop for ControlHub {
    fn drop(&mut self) {
        self.control_messenger_handle.abort();
    }
}
