//! Record trait implemented by every persisted type

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A persistable record with identity and CAS versioning.
///
/// `version` starts at 0 on creation and is bumped by exactly 1 on every
/// successful CAS update. `updated_at` is stamped by the store on write.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Unique identifier, used as the file stem
    fn id(&self) -> &str;

    /// Monotonic version counter for compare-and-swap
    fn version(&self) -> u64;

    /// Replace the version counter (called by the store on update)
    fn set_version(&mut self, version: u64);

    /// Stamp the last-modified time (called by the store on write)
    fn touch(&mut self, now_ms: i64);

    /// Directory name under the store root
    fn collection_name() -> &'static str;
}
