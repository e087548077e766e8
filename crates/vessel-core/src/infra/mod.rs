//! Concrete adapters implementing the `application::ports` traits.
//!
//! Only this module may depend on `reqwest`; everything above it talks to
//! `Provider`/`MultiHostList`/`TaskStatusSource`.

pub mod proxmox;
pub mod ssh;

pub use ssh::{FileCaKeyReader, ProcessSshSession};
