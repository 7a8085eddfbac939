pub mod error;
pub mod job;
pub mod wire;

pub use error::{BindError, RegistryError, SupervisorError};
pub use job::{validate_transition, JobId, JobRecord, JobState, ScanRequest, ScanSummary};
pub use wire::{Ack, ListScansParams, OpAck};
