//! Output persistence: the in-memory record map and its durable snapshots.

pub mod csv;
pub mod libsql_backend;
pub mod migrations;
pub mod output;
pub mod traits;

pub use csv::CsvSnapshotStore;
pub use libsql_backend::LibSqlSnapshotStore;
pub use output::{OutputRecord, OutputStore};
pub use traits::{FanoutStore, NullStore, PersistentStore};
