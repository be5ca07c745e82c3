//! Errors from the server crate's own bootstrap, distinct from
//! `relay::error::RelayError` (which covers in-flight request failures).
//! TLS termination is explicitly out of scope (spec §1); this is just
//! the bind/serve failure path.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind to address: {0}")]
    Bind(#[source] std::io::Error),

    #[error("server error: {0}")]
    Server(#[source] std::io::Error),
}
