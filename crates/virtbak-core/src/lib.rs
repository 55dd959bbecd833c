// virtbak-core: pure types, metadata records, and planning logic.
// No hypervisor or archive dependencies — this is the foundation crate.

pub mod cancel;
pub mod compat;
pub mod config;
pub mod domain_xml;
pub mod error;
pub mod metadata;
pub mod naming;
pub mod pattern;
pub mod retention;

pub use cancel::CancelToken;
pub use error::{Error, Result};

/// Version stamped into every definition and pending-info record.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
