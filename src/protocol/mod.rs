//! Message and topic-path primitives.

mod message;
mod path;

pub use message::{Message, ProtocolError};
pub use path::Path;
