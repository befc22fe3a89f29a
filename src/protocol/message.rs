//! Text command grammar shared by the Controller, storage nodes and clients.
//!
//! Every message is a single line of space-separated ASCII tokens. The
//! `STORE` and `REBALANCE_STORE` lines are followed by exactly `size` raw
//! payload bytes on the same connection; see `protocol::framing`.

use std::fmt;
use std::str::FromStr;

use crate::utils::DfsError;

/// Stable identifier of a storage node: the port it listens on for data
/// connections. Ordering follows the port number.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = DfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NodeId(s.parse()?))
    }
}

/// Protocol-level refusal of a client request. Each variant maps to exactly
/// one error token on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Rejection {
    /// Fewer than R storage nodes are live.
    NotEnoughDstores,

    /// STORE of a name that is already present or in flight.
    AlreadyExists,

    /// Name absent, being stored, or being removed.
    DoesNotExist,

    /// RELOAD after every replica has been tried.
    LoadFailed,
}

impl Rejection {
    fn token(&self) -> &'static str {
        match self {
            Rejection::NotEnoughDstores => "ERROR_NOT_ENOUGH_DSTORES",
            Rejection::AlreadyExists => "ERROR_FILE_ALREADY_EXISTS",
            Rejection::DoesNotExist => "ERROR_FILE_DOES_NOT_EXIST",
            Rejection::LoadFailed => "ERROR_LOAD",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Shipping/deletion instruction for one storage node within a rebalance
/// cycle.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct RebalanceInstr {
    /// Files this node must push, each with the peers that need a copy.
    pub sends: Vec<(String, Vec<NodeId>)>,

    /// Files this node must delete locally after shipping.
    pub deletes: Vec<String>,
}

impl RebalanceInstr {
    /// An instruction with nothing to ship and nothing to delete is never
    /// sent.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.deletes.is_empty()
    }
}

/// A single protocol line, in any direction.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    /// Node -> Controller: announce my data port.
    Join { port: u16 },

    /// Client -> Controller: request to store; client -> node: payload
    /// follows.
    Store { name: String, size: u64 },

    /// Controller -> client: push the bytes to these nodes.
    StoreTo { nodes: Vec<NodeId> },

    /// Node -> Controller: copy persisted.
    StoreAck { name: String },

    /// Controller -> client.
    StoreComplete,

    /// Client -> Controller.
    Load { name: String },

    /// Client -> Controller: previous replica failed, try another.
    Reload { name: String },

    /// Controller -> client: fetch from this node.
    LoadFrom { node: NodeId, size: u64 },

    /// Client -> node.
    LoadData { name: String },

    /// Client -> Controller, or Controller -> node.
    Remove { name: String },

    /// Node -> Controller.
    RemoveAck { name: String },

    /// Controller -> client.
    RemoveComplete,

    /// Request (empty) or response, depending on direction.
    List { files: Vec<String> },

    /// Controller -> node.
    Rebalance(RebalanceInstr),

    /// Node -> node: replication copy, payload follows.
    RebalanceStore { name: String, size: u64 },

    /// Node -> Controller.
    RebalanceComplete,

    /// Node -> client or node: ready to receive payload.
    Ack,

    /// Node -> Controller: the named file was not held.
    NoSuchFile { name: String },

    /// Controller -> client refusal.
    Rejected(Rejection),
}

/// Cursor over the whitespace-separated tokens of one line.
struct Tokens<'a> {
    iter: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn next_str(&mut self) -> Result<&'a str, DfsError> {
        self.iter
            .next()
            .ok_or_else(|| DfsError::msg("too few arguments"))
    }

    fn next_num<T>(&mut self) -> Result<T, DfsError>
    where
        T: FromStr<Err = std::num::ParseIntError>,
    {
        Ok(self.next_str()?.parse::<T>()?)
    }

    fn finish(mut self, msg: Message) -> Result<Message, DfsError> {
        match self.iter.next() {
            None => Ok(msg),
            Some(tok) => Err(DfsError::msg(format!(
                "unexpected trailing token '{}'",
                tok
            ))),
        }
    }
}

impl FromStr for Message {
    type Err = DfsError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut toks = Tokens {
            iter: line.split_whitespace(),
        };
        let verb = toks
            .iter
            .next()
            .ok_or_else(|| DfsError::msg("empty line"))?;

        let msg = match verb {
            "JOIN" => Message::Join {
                port: toks.next_num()?,
            },
            "STORE" => Message::Store {
                name: toks.next_str()?.into(),
                size: toks.next_num()?,
            },
            "STORE_TO" => {
                let nodes = toks
                    .iter
                    .by_ref()
                    .map(|t| t.parse())
                    .collect::<Result<Vec<NodeId>, _>>()?;
                if nodes.is_empty() {
                    return Err(DfsError::msg("STORE_TO without nodes"));
                }
                Message::StoreTo { nodes }
            }
            "STORE_ACK" => Message::StoreAck {
                name: toks.next_str()?.into(),
            },
            "STORE_COMPLETE" => Message::StoreComplete,
            "LOAD" => Message::Load {
                name: toks.next_str()?.into(),
            },
            "RELOAD" => Message::Reload {
                name: toks.next_str()?.into(),
            },
            "LOAD_FROM" => Message::LoadFrom {
                node: toks.next_str()?.parse()?,
                size: toks.next_num()?,
            },
            "LOAD_DATA" => Message::LoadData {
                name: toks.next_str()?.into(),
            },
            "REMOVE" => Message::Remove {
                name: toks.next_str()?.into(),
            },
            "REMOVE_ACK" => Message::RemoveAck {
                name: toks.next_str()?.into(),
            },
            "REMOVE_COMPLETE" => Message::RemoveComplete,
            "LIST" => Message::List {
                files: toks.iter.by_ref().map(String::from).collect(),
            },
            "REBALANCE" => Message::Rebalance(parse_rebalance(&mut toks)?),
            "REBALANCE_STORE" => Message::RebalanceStore {
                name: toks.next_str()?.into(),
                size: toks.next_num()?,
            },
            "REBALANCE_COMPLETE" => Message::RebalanceComplete,
            "ACK" => Message::Ack,
            "ERROR_FILE_DOES_NOT_EXIST" => match toks.iter.next() {
                Some(name) => Message::NoSuchFile { name: name.into() },
                None => Message::Rejected(Rejection::DoesNotExist),
            },
            "ERROR_NOT_ENOUGH_DSTORES" => {
                Message::Rejected(Rejection::NotEnoughDstores)
            }
            "ERROR_FILE_ALREADY_EXISTS" => {
                Message::Rejected(Rejection::AlreadyExists)
            }
            "ERROR_LOAD" => Message::Rejected(Rejection::LoadFailed),
            _ => {
                return Err(DfsError::msg(format!("unknown verb '{}'", verb)))
            }
        };

        toks.finish(msg)
    }
}

/// Parses the body of a `REBALANCE` line:
/// `<sendCount> (<file> <destCount> <dest>*)* <deleteCount> <file>*`.
fn parse_rebalance(toks: &mut Tokens) -> Result<RebalanceInstr, DfsError> {
    let mut instr = RebalanceInstr::default();

    let num_sends: usize = toks.next_num()?;
    for _ in 0..num_sends {
        let name = toks.next_str()?.to_string();
        let num_dests: usize = toks.next_num()?;
        let mut dests = Vec::with_capacity(num_dests.min(64));
        for _ in 0..num_dests {
            dests.push(toks.next_str()?.parse()?);
        }
        instr.sends.push((name, dests));
    }

    let num_deletes: usize = toks.next_num()?;
    for _ in 0..num_deletes {
        instr.deletes.push(toks.next_str()?.to_string());
    }

    Ok(instr)
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter,
    items: &[T],
) -> fmt::Result {
    for item in items {
        write!(f, " {}", item)?;
    }
    Ok(())
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::Join { port } => write!(f, "JOIN {}", port),
            Message::Store { name, size } => {
                write!(f, "STORE {} {}", name, size)
            }
            Message::StoreTo { nodes } => {
                write!(f, "STORE_TO")?;
                write_joined(f, nodes)
            }
            Message::StoreAck { name } => write!(f, "STORE_ACK {}", name),
            Message::StoreComplete => write!(f, "STORE_COMPLETE"),
            Message::Load { name } => write!(f, "LOAD {}", name),
            Message::Reload { name } => write!(f, "RELOAD {}", name),
            Message::LoadFrom { node, size } => {
                write!(f, "LOAD_FROM {} {}", node, size)
            }
            Message::LoadData { name } => write!(f, "LOAD_DATA {}", name),
            Message::Remove { name } => write!(f, "REMOVE {}", name),
            Message::RemoveAck { name } => write!(f, "REMOVE_ACK {}", name),
            Message::RemoveComplete => write!(f, "REMOVE_COMPLETE"),
            Message::List { files } => {
                write!(f, "LIST")?;
                write_joined(f, files)
            }
            Message::Rebalance(instr) => {
                write!(f, "REBALANCE {}", instr.sends.len())?;
                for (name, dests) in &instr.sends {
                    write!(f, " {} {}", name, dests.len())?;
                    write_joined(f, dests)?;
                }
                write!(f, " {}", instr.deletes.len())?;
                write_joined(f, &instr.deletes)
            }
            Message::RebalanceStore { name, size } => {
                write!(f, "REBALANCE_STORE {} {}", name, size)
            }
            Message::RebalanceComplete => write!(f, "REBALANCE_COMPLETE"),
            Message::Ack => write!(f, "ACK"),
            Message::NoSuchFile { name } => {
                write!(f, "ERROR_FILE_DOES_NOT_EXIST {}", name)
            }
            Message::Rejected(rejection) => write!(f, "{}", rejection),
        }
    }
}
