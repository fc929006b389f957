//! Content-addressed cache of extracted root filesystem archives.
//!
//! A rootfs archive (a tar stream, optionally compressed) is identified by
//! the SHA-256 of its bytes, never by its filename. Each digest maps to one
//! extraction directory under the per-user cache root; a completion marker
//! inside the directory certifies the extraction as usable, and a sibling
//! lockfile serializes first use across processes.

pub mod cache;
pub mod detect;
pub mod digest;
pub mod error;
mod extract;

pub use cache::{COMPLETION_MARKER, RootfsCache};
pub use detect::Compression;
pub use error::RootfsError;
