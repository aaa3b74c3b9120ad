//! Filesystem side of the migration: legacy export reading, registry files,
//! atomic snapshot commits and the post-commit scanner.

pub mod fsutil;
pub mod registry_files;
pub mod scanner;
pub mod snapshot;
pub mod source;

pub use registry_files::{load_registry, persist_registry, registry_path};
pub use scanner::{scan, ScanScope};
pub use snapshot::{ModuleEntities, SnapshotLock, SnapshotWriter};
pub use source::{run_export_command, ExportDirSource};
