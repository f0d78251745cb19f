pub mod audit_service;
pub mod derive;

pub use audit_service::{AuditService, AuditSink};
pub use derive::{derive_audit_entry, AuditOverrides};
