//! Listener ownership: bind, TLS acceptance, dispatch, drain.

pub mod listener;
pub mod tls;

pub use listener::{router, serve, ClientAddr, ServeError};
