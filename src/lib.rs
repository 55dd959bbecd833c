//! # virtbak — consistent live backups of libvirt-managed VM disk images
//!
//! Facade crate that re-exports the virtbak workspace crates and holds the
//! runtime-facing modules: the hypervisor contract, the snapshot
//! coordinator, the per-VM backup drivers, and the group orchestrator.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`](virtbak_core) | virtbak-core | Error enum, metadata records, naming, retention, config |
//! | [`storage`](virtbak_storage) | virtbak-storage | Cancellable streaming packagers |
//! | [`hypervisor`] | virtbak | Hypervisor traits and the built-in test driver |
//! | [`snapshot`] | virtbak | External snapshot + block-commit lifecycle |
//! | [`backup`] | virtbak | Pending (write) and complete (read) backup drivers |
//! | [`groups`] | virtbak | Concurrent scheduling across VMs, catalog, retention |

pub use virtbak_core as core;
pub use virtbak_storage as storage;

pub mod backup;
pub mod groups;
pub mod hypervisor;
pub mod logging;
pub mod snapshot;

pub use virtbak_core::{CancelToken, Error, Result, VERSION};
pub use virtbak_storage::{ReadPackager, WritePackager};
