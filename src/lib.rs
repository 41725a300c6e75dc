#![forbid(unsafe_code)]

pub mod config;
pub mod connector;
pub mod daemon;
pub mod error;
pub mod protocol;
pub mod router;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main types at crate root for convenience
pub use crate::connector::{
    Connector, ConnectorConfig, Manager, Metadata, Queue, Request, ResponseHandler, Sender,
    SenderError, Subscriber,
};
pub use crate::protocol::{Message, Path};
pub use crate::router::{AccessManager, AllowAll, Route, RouteConfig, RouteParams, Router};
pub use crate::store::filestore::{FileMessageStore, PartitionConfig};
pub use crate::store::{FetchRequest, KvStore, MemoryKvStore, MessageStore};
