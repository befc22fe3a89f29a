//! Controller: membership, file state, quorum coordination, rebalancing.

mod acks;
mod cluster;
mod filestate;
mod membership;
mod planner;
mod rebalancer;
mod session;
mod state;

pub use cluster::{Controller, ControllerConfig};
pub use membership::Placement;
