//! Device storage: one backend over a chain of interchangeable tiers.

pub mod traits;
pub mod memory;
pub mod file;
pub mod sql;
pub mod tiered;
pub mod platform;

pub use traits::{SetOptions, StorageError, StorageTier, StoredEntry};
pub use tiered::TieredStorage;
pub use platform::{PlatformCapabilities, StoragePlan, TierKind};
