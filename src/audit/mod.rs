pub mod log;
pub mod trace_bus;

pub use log::{AuditLog, AuditLogConfig};
pub use trace_bus::{Subscription as TraceSubscription, TraceBus};
