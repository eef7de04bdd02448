pub mod job_log_lines;
pub mod jobs;
pub mod port_allocations;
pub mod servers;
pub mod sftp_grants;
