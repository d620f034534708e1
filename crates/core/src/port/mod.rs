// Port Layer - Interfaces for external dependencies

pub mod agent_wire;
pub mod id_provider; // For deterministic testing
pub mod package_agent;
pub mod store;
pub mod time_provider;

// Re-exports
pub use agent_wire::{WireError, WireRequest, WireSignal};
pub use id_provider::{IdProvider, UuidProvider};
pub use package_agent::{AgentError, AgentNotice, AgentSignal, PackageAgent};
pub use store::TransactionStore;
pub use time_provider::{SystemTimeProvider, TimeProvider};
