pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod status;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{Result, TrellisError};
pub use event::{EventBus, NodeEvent};
pub use filter::NodeFilter;
pub use status::Status;
pub use types::*;
