// Application Layer - Use Cases and Business Logic

pub mod event_channel;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod session;

// Re-exports
pub use event_channel::{EventChannel, EventStream};
pub use queue::{EnqueueOutcome, QueueSnapshot, Resolution, TransactionQueue};
pub use recovery::RecoveryService;
pub use scheduler::{
    channel, shutdown_channel, AgentSink, AnswerOutcome, CancelOutcome, QueueListing, Scheduler,
    SchedulerConfig, SchedulerHandle, SchedulerInbox, ShutdownListener, ShutdownTrigger,
};
pub use session::{ClientSession, SessionRegistry};
