pub mod cli;
pub mod config;
pub mod discovery;
pub mod protocol;
pub mod statement;

pub use cli::{Command, CommandError, prompt};
pub use config::{ClientConfig, ConfigError};
pub use discovery::{Discoverer, DiscoveryError};
pub use protocol::{LiteConnection, LiteServer, QueryExecutor};
pub use statement::StatementType;
