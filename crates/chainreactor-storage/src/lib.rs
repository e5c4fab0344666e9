//! chainreactor-storage — storage backends for ChainReactor.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing/simulation, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Both implement every store trait of `chainreactor_core::store`, so either
//! can back a pipeline as `Arc<dyn ReactorStore>`.

#[cfg(feature = "memory")]
pub mod memory {
    //! Re-export of the core's in-memory store.
    pub use chainreactor_core::memory::MemoryStore;
}

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
