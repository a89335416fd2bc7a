pub mod cipher;
pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod node;
pub mod slice;
pub mod store;
pub mod task;
pub mod transport;

pub use engine::SliceProtocolEngine;
pub use error::{NodeError, Result};
pub use node::PpNode;
