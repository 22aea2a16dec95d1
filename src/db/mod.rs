//! Location document store: row models and SQL repositories.
//!
//! - `model`: row structs decoded straight from SQLite.
//! - `repo`: SQL-only functions that map rows into domain records.
//!
//! Callers import from `location_photos::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;
