//! Syndica - external platform publishing for creator tools
//!
//! This library provides the integration layer between a creator publishing
//! product and third-party social platforms: OAuth account connection, an
//! encrypted credential vault, and a scheduling engine that turns post
//! intents into platform API calls exactly once.

pub mod billing;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod logging;
pub mod platforms;
pub mod scheduler;
pub mod scheduling;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use dispatch::{DispatchEngine, DispatchResult, IntentService};
pub use error::{Result, SyndicaError};
pub use executor::{Executor, RetryPolicy};
pub use handshake::HandshakeManager;
pub use platforms::{AdapterRegistry, PlatformAdapter, PlatformId};
pub use scheduler::Scheduler;
pub use types::{IntentStatus, PostIntent, PublishContent, PublishOutcome};
pub use vault::Vault;
