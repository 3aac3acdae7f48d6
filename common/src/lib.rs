pub mod error;
pub mod heartbeat;
pub mod layout;

pub use error::{KeeperError, Result};
pub use heartbeat::Heartbeat;
pub use layout::{base_name, KeyLayout, KeyPath};

/// Default directory under which groups are discovered
pub const DEFAULT_DISCOVERY_ROOT: &str = "/apus/agent-groups";
