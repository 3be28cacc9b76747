pub mod balloon;
pub mod barrier;
pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod hypervisor;
pub mod libvirt;
pub mod logger;
pub mod pci;
pub mod protocol;
pub mod sim;
pub mod task;
pub mod transport;
pub mod work;

pub use error::ShiftError;

pub type Result<T> = std::result::Result<T, ShiftError>;

// Convenience re-exports for embedding the orchestrator
pub use executor::TaskExecutor;
pub use protocol::MigrationProtocol;
pub use task::{ResultContainer, Task, TaskResult};
pub use work::WorkCounter;
