//! Storage node (Dstore): local blob store, control link, data path and
//! rebalance participation.

mod blobstore;
mod control;
mod data;
mod node;
mod rebalance;

pub use blobstore::{BlobStore, FolderStore};
pub use node::{DstoreConfig, StorageNode};
