//! Shared vocabulary for the hearth provisioning engine.
//!
//! Nothing in here performs I/O: the control plane, the record store and the
//! migrations all agree on these types and on the string forms they persist.

pub mod record;
pub mod status;

pub use record::{
    ConfigMap, ConfigValue, Job, ModEntry, NotifyTarget, PortAllocation, ServerRecord,
    is_private_key, keys,
};
pub use status::{
    JobAction, JobStatus, ServerStatus, UnknownVariant, ValidationError, validate_action,
};
