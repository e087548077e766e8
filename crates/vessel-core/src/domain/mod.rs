//! Domain layer — pure business logic, no I/O, no async.
//!
//! Mirrors the teacher's `domain` module discipline: zero imports from
//! `crate::infra` or `crate::application`, zero imports from `tokio`,
//! `reqwest`, or `std::net`. Every function takes data in and returns data
//! out.

pub mod network_sniffer;
pub mod resource_check;
pub mod token_estimate;
pub mod vmid;

pub use network_sniffer::detect_network_access;
pub use resource_check::evaluate_resource_check;
pub use token_estimate::estimate_tokens;
pub use vmid::next_free_vmid;
