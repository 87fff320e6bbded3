pub mod config;
pub mod decode;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod notify;
pub mod null_output;
pub mod queue;
pub mod registry;
pub mod resample;
pub mod session;
pub mod transport;
pub mod uri;

pub use config::{Backend, EngineConfig};
pub use error::PlayerError;
pub use registry::PlayerRegistry;
pub use transport::Transport;
