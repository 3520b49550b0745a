//! Chunk placement and worker liveness for the czar.
//!
//! Architecture role:
//! - turns the replication system's size-weighted chunk inventory into an immutable
//!   [`ChunkMap`] per database family, assigning every chunk one shared-scan worker;
//! - publishes the current [`FamilyMap`] through a copy-on-write [`FamilyMapHandle`] so
//!   readers never observe a half-built map;
//! - tracks worker contact info and liveness ([`WorkerContactMap`]);
//! - abstracts the registry service behind [`RegistryClient`].

pub mod chunk_map;
pub mod contacts;
pub mod family_map;
pub mod inventory;
pub mod registry;

pub use chunk_map::{ChunkEntry, ChunkMap, WorkerEntry};
pub use contacts::{WorkerContact, WorkerContactMap, WorkerContactSnapshot};
pub use family_map::{FamilyMap, FamilyMapHandle};
pub use inventory::{ChunkInventory, ChunkInventorySnapshot, FamilyLayout};
pub use registry::{InMemoryRegistry, JsonDirRegistry, RegistryClient};
