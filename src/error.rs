use thiserror::Error;

use crate::config::ConfigError;
use crate::connector::ConnectorError;
use crate::protocol::ProtocolError;
use crate::router::RouterError;
use crate::store::{KvError, StoreError};

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module errors; components keep reporting
/// their own canonical types.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("signal handler setup failed: {0}")]
    Signals(std::io::Error),
}
