//! Wire protocol: command grammar, framing, data transfers, and noise
//! diagnostics.

mod diag;
mod framing;
mod message;
mod transfer;

pub use diag::Diagnostics;
pub use framing::{FrameReader, FrameWriter, Line};
pub use message::{Message, NodeId, RebalanceInstr, Rejection};
pub use transfer::{fetch_blob, push_blob};
