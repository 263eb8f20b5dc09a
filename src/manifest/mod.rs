//! # Manifest Store
//!
//! The durable, inspectable record of every unit: current state, append-only
//! history, file inventory and error records, persisted as `manifest.json`
//! next to the unit's files.
//!
//! ## Guarantees
//!
//! - **Atomic commits**: each commit is a temp-file write, `fsync` and rename;
//!   a failed commit leaves the previous document in place.
//! - **Per-unit serialisation**: commits for the same unit never interleave.
//! - **Forward migration**: documents written by older schema versions load
//!   with defaults for the fields they lack.

pub mod errors;
pub mod inventory;
pub mod mutation;
pub mod schema;
pub mod store;

pub use errors::{ManifestError, ManifestResult};
pub use inventory::{
    carry_forward, describe_file_async, diff_inventory, relative_path, scan_inventory,
    scan_inventory_async, scan_staged_async, verify_inventory, InventoryDiff,
};
pub use mutation::ManifestMutation;
pub use schema::{ErrorRecord, HistoryEntry, InventoryEntry, Manifest, UnitId};
pub use store::{FsManifestStore, ManifestStore};
