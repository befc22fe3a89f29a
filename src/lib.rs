//! Public interface to the dfstore core library, linked by the controller,
//! storage node, and client executables.

#[macro_use]
mod utils;

mod client;
mod controller;
mod dstore;
mod protocol;

// Helper utilities, functions, and macros
pub use utils::{logger_init, DfsError};

// Wire protocol
pub use protocol::{
    fetch_blob, push_blob, Message, NodeId, RebalanceInstr, Rejection,
};

// Controller
pub use controller::{Controller, ControllerConfig, Placement};

// Storage node
pub use dstore::{BlobStore, DstoreConfig, FolderStore, StorageNode};

// Client
pub use client::{ClientEndpoint, Outcome};
