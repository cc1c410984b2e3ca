pub mod bootstrap;
pub mod config;
pub mod health;
pub mod monitor;
pub mod notify;
pub mod runtime;
pub mod server;
pub mod session;
pub mod state;
pub mod supervisor;

pub use config::TunnelConfig;
pub use health::Health;
pub use runtime::{ContainerRecord, Runtime, RuntimeError};
pub use session::Session;
pub use state::{Store, TunnelState, TunnelStatus};
pub use supervisor::Supervisor;
