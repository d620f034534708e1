// pkgtxn Infrastructure - System Adapters
// Implements: PackageAgent over a privileged worker process

pub mod subprocess_agent;

pub use subprocess_agent::{SubprocessAgent, SubprocessAgentConfig};
