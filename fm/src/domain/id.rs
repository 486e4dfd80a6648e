//! Id and branch-name composition
//!
//! Planner breakdowns carry local ids (`task-1`, `task-2`, ...). When a
//! breakdown is accepted, the planning session's short id is spliced in to
//! make the id unique across sessions: `task-<short8>-<n>`. Branch names get
//! the full task id appended so no two tasks can ever share a branch.

use std::sync::LazyLock;

use regex::Regex;

/// Breakdown ids as emitted by the planner: `task-1`, `task-17`
pub static BREAKDOWN_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^task-[1-9][0-9]*$").expect("valid regex"));

/// Fully resolved ids: `task-<short8>-<n>`
pub static RESOLVED_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^task-[a-f0-9]{8}-\d+$").expect("valid regex"));

/// Generate a new planning-session id (UUIDv7, time-ordered)
pub fn new_session_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// First 8 hex chars of a session id, used to namespace task ids
pub fn session_short(session_id: &str) -> &str {
    &session_id[..8.min(session_id.len())]
}

/// Compose the globally-unique task id from a session short and a breakdown
/// ordinal: `task-<short8>-<n>`
pub fn compose_task_id(short: &str, ordinal: u32) -> String {
    format!("task-{}-{}", short, ordinal)
}

/// Extract the ordinal from a breakdown id (`task-3` -> 3)
pub fn breakdown_ordinal(breakdown_id: &str) -> Option<u32> {
    breakdown_id.strip_prefix("task-")?.parse().ok()
}

/// Append the task id to the planner-chosen branch name. The suffix is the
/// uniqueness guarantee and must survive commit and push untouched.
pub fn compose_branch(planner_branch: &str, task_id: &str) -> String {
    format!("{}-{}", planner_branch.trim_end_matches('/'), task_id)
}
