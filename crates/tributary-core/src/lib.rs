pub mod action;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod health;
pub mod mock;
pub mod planner;
pub mod retry;
pub mod stats;
pub mod store;
pub mod types;

pub use action::ApplyAction;
pub use descriptor::{validate_identifier, DescriptorBuilder, LogTableDescriptor};
pub use engine::{ReplicationConfig, ReplicationEngine, ReplicationOutcome};
pub use error::{Error, Result};
pub use health::{HealthMonitor, HealthReport, HealthStatus, DEFAULT_PENDING_THRESHOLD};
pub use planner::plan;
pub use retry::RetryPolicy;
pub use stats::{OperationStats, ReplicationStatistics};
pub use store::{CaptureStatus, ChangeCapture, ChangeLog, DeadLetter, TargetStore};
pub use types::{parse_image, Change, ChangeRecord, Operation, RecordId, RowMap, Value};
