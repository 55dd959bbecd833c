// virtbak-storage: the packager subsystem.
//
// A packager is the container holding one backup's artifacts: a plain
// directory, a single (optionally compressed) tar archive, or one zstd file
// per artifact. Every byte-moving operation streams through a fixed-size
// buffer and honors a cooperative cancellation flag.

pub mod packager;
pub mod stream;

pub use packager::{ReadPackager, WritePackager};
