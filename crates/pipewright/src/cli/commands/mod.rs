//! CLI commands

mod cache;
mod init;

pub use cache::CacheCommand;
pub use init::InitCommand;
