//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::DfsError;
pub use print::logger_init;

pub(crate) use safetcp::{tcp_bind_with_retry, tcp_connect_with_retry};
