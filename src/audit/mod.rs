//! Violation reporting and audit persistence.

mod reporter;
mod sink;

pub use reporter::{ViolationRecord, ViolationReporter, RATE_LIMIT_EXCEEDED_ACTION};
pub use sink::{
    AuditEvent, AuditSink, JsonLinesAuditSink, MemoryAuditSink, StaticUserDirectory,
    UserDirectory, UserRecord,
};
