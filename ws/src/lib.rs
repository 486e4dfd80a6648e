//! workstore - versioned per-record file persistence
//!
//! Each record is a self-contained JSON file under
//! `<root>/<collection>/<id>.json`. Updates go through compare-and-swap on a
//! monotonic version counter; a per-id lock serializes the
//! load-verify-write window so concurrent in-process callers cannot
//! interleave. Writes are staged to a temp file, fsynced, then renamed.
//!
//! No indexes, no database. At orchestration scale (tens of records) a full
//! directory scan is cheaper than maintaining secondary structures.

mod record;
mod store;

pub use record::{Record, now_ms};
pub use store::{Store, StoreError};
