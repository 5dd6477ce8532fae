//! Per-tenant fetch loop: scheduling, reentrancy guard, and status.

pub mod background;
pub mod coordinator;
pub mod status;
pub mod tenant;

pub use background::{BackgroundError, BackgroundTask, ErrorReporter, spawn_error_drain};
pub use coordinator::FetchCoordinator;
pub use status::{AccountStatus, CycleOutcome, CycleSummary, FetcherStatus};
pub use tenant::{TenantRegistry, TenantSession};
