//! Bulk archive bootstrap

pub mod archive;
pub mod bulk;
pub mod manifest;

pub use archive::{ArchiveError, ArchiveSource, DirectoryArchive, HttpArchive};
pub use bulk::{BootstrapError, BootstrapReport, BulkBootstrapper};
pub use manifest::{Manifest, ManifestEntry};
