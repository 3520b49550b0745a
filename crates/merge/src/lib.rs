//! Result merging for the czar.
//!
//! Architecture role:
//! - [`SqlConnection`] is the only contact with the result database; [`SqliteConnection`]
//!   implements it on an embedded SQLite file or in-memory database
//! - worker row batches arrive as Arrow IPC streams and are turned into a [`VirtualFile`]
//!   tagged with the originating job attempt
//! - [`InfileMerger`] ingests batches concurrently into one merge table per query under a
//!   hard result-size cap, supports purging rows of superseded attempts, and runs the final
//!   aggregation into the result table

pub mod infile_merger;
pub mod sql;
pub mod sqlite;
pub mod virtual_file;

pub use infile_merger::{
    InfileMerger, InfileMergerConfig, MergeOutcome, MergeSkip, MergeSpec, MergeStats,
};
pub use sql::{quote_ident, SqlConnection, SqlRows, SqlValue};
pub use sqlite::SqliteConnection;
pub use virtual_file::{decode_ipc_bytes, encode_record_batches_ipc, VirtualFile, ATTEMPT_COLUMN};
