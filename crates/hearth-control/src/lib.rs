//! The hearth provisioning engine: job scheduling, port allocation, VM
//! provisioning, gateway forwarding and the per-action pipeline that ties
//! them to the playbook runner.

pub mod actions;
pub mod admission;
pub mod config;
pub mod games;
pub mod gateway;
pub mod joblog;
pub mod notify;
pub mod playbook_vars;
pub mod ports;
pub mod provisioner;
pub mod proxmox;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod store_db;
pub mod store_memory;

#[cfg(test)]
pub mod testing;
