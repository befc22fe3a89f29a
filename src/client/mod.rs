//! Client library: the external side of the Controller protocol.

mod endpoint;

pub use endpoint::{ClientEndpoint, Outcome};
