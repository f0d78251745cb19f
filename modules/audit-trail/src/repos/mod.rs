pub mod audit_log_repo;
