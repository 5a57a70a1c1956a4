pub mod config;
pub mod source;
pub mod types;

pub use config::RelayConfig;
pub use source::ProgramSource;
pub use types::*;
