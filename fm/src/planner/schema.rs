//! Planner output schema and validation
//!
//! The planner must answer with a JSON array of task breakdowns. Validation
//! distinguishes JSON-syntax failures (retried on a separate budget) from
//! semantic failures (fed back to the planner as accumulated errors).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::TaskType;
use crate::domain::id::BREAKDOWN_ID_RE;

/// Maximum summary length
const SUMMARY_MAX: usize = 50;
/// Minimum estimated duration in hours
const DURATION_MIN: f64 = 0.5;

/// One task as proposed by the planner (camelCase on the wire)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBreakdown {
    /// Local id within this planning round (`task-1`, `task-2`, ...)
    pub id: String,
    pub description: String,
    pub branch: String,
    pub scope_paths: Vec<String>,
    pub acceptance: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub estimated_duration: f64,
    pub context: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Validation limits (from configuration)
#[derive(Debug, Clone)]
pub struct BreakdownLimits {
    pub max_task_duration: f64,
    pub max_tasks: u32,
    /// Require a non-empty context brief on every task
    pub strict_context_validation: bool,
    /// Require a summary on every task (continuation planning does)
    pub require_summary: bool,
}

impl Default for BreakdownLimits {
    fn default() -> Self {
        Self {
            max_task_duration: 4.0,
            max_tasks: 5,
            strict_context_validation: false,
            require_summary: false,
        }
    }
}

/// Validate a full breakdown set. Returns every problem found, so the
/// planner gets all the feedback in one round trip.
pub fn validate_breakdowns(breakdowns: &[TaskBreakdown], limits: &BreakdownLimits) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if breakdowns.len() > limits.max_tasks as usize {
        errors.push(format!(
            "{} tasks proposed, maximum is {}",
            breakdowns.len(),
            limits.max_tasks
        ));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for b in breakdowns {
        if !BREAKDOWN_ID_RE.is_match(&b.id) {
            errors.push(format!("id '{}' does not match task-<n>", b.id));
        }
        if !seen_ids.insert(&b.id) {
            errors.push(format!("duplicate id '{}'", b.id));
        }
        if b.scope_paths.is_empty() {
            errors.push(format!("{}: scopePaths must not be empty", b.id));
        }
        if b.acceptance.trim().is_empty() {
            errors.push(format!("{}: acceptance must not be empty", b.id));
        }
        if b.branch.trim().is_empty() {
            errors.push(format!("{}: branch must not be empty", b.id));
        }
        if !(DURATION_MIN..=limits.max_task_duration).contains(&b.estimated_duration) {
            errors.push(format!(
                "{}: estimatedDuration {} outside [{}, {}]",
                b.id, b.estimated_duration, DURATION_MIN, limits.max_task_duration
            ));
        }
        if limits.strict_context_validation && b.context.trim().is_empty() {
            errors.push(format!("{}: context must not be empty", b.id));
        }
        match &b.summary {
            Some(summary) if summary.chars().count() > SUMMARY_MAX => {
                errors.push(format!("{}: summary longer than {} chars", b.id, SUMMARY_MAX));
            }
            None if limits.require_summary => {
                errors.push(format!("{}: summary is required", b.id));
            }
            _ => {}
        }
    }

    // Dependencies must reference sibling ids and stay acyclic
    let ids: HashSet<&str> = breakdowns.iter().map(|b| b.id.as_str()).collect();
    for b in breakdowns {
        for dep in &b.dependencies {
            if !BREAKDOWN_ID_RE.is_match(dep) {
                errors.push(format!("{}: dependency '{}' does not match task-<n>", b.id, dep));
            } else if !ids.contains(dep.as_str()) {
                errors.push(format!("{}: dependency '{}' references no sibling task", b.id, dep));
            }
        }
    }

    if let Some(cycle) = find_cycle(breakdowns) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// DFS cycle check over breakdown dependencies
fn find_cycle(breakdowns: &[TaskBreakdown]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = breakdowns
        .iter()
        .map(|b| (b.id.as_str(), b.dependencies.as_slice()))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if stack.contains(&node) {
            let from = stack.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = stack[from..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }

        stack.push(node);
        if let Some(node_deps) = deps.get(node) {
            for dep in node_deps.iter() {
                if deps.contains_key(dep.as_str())
                    && let Some(cycle) = visit(dep.as_str(), deps, visited, stack)
                {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        None
    }

    for b in breakdowns {
        if let Some(cycle) = visit(b.id.as_str(), &deps, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakdown(id: &str, deps: &[&str]) -> TaskBreakdown {
        TaskBreakdown {
            id: id.to_string(),
            description: "do something".to_string(),
            branch: "feature/something".to_string(),
            scope_paths: vec!["src/".to_string()],
            acceptance: "it works".to_string(),
            task_type: TaskType::Implementation,
            estimated_duration: 1.0,
            context: "a complete brief".to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            summary: Some("short summary".to_string()),
        }
    }

    #[test]
    fn test_valid_set_passes() {
        let set = vec![breakdown("task-1", &[]), breakdown("task-2", &["task-1"])];
        assert!(validate_breakdowns(&set, &BreakdownLimits::default()).is_ok());
    }

    #[test]
    fn test_bad_id_rejected() {
        let set = vec![breakdown("task-01", &[])];
        let errors = validate_breakdowns(&set, &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("task-01")));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let set = vec![breakdown("task-1", &[]), breakdown("task-1", &[])];
        let errors = validate_breakdowns(&set, &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let set = vec![breakdown("task-1", &["task-9"])];
        let errors = validate_breakdowns(&set, &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("task-9")));
    }

    #[test]
    fn test_cycle_rejected() {
        let set = vec![breakdown("task-1", &["task-2"]), breakdown("task-2", &["task-1"])];
        let errors = validate_breakdowns(&set, &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn test_duration_bounds() {
        let mut low = breakdown("task-1", &[]);
        low.estimated_duration = 0.25;
        let errors = validate_breakdowns(&[low], &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("estimatedDuration")));

        let mut high = breakdown("task-1", &[]);
        high.estimated_duration = 6.0;
        let errors = validate_breakdowns(&[high], &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("estimatedDuration")));
    }

    #[test]
    fn test_empty_scope_rejected() {
        let mut b = breakdown("task-1", &[]);
        b.scope_paths.clear();
        let errors = validate_breakdowns(&[b], &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("scopePaths")));
    }

    #[test]
    fn test_summary_length_cap() {
        let mut b = breakdown("task-1", &[]);
        b.summary = Some("x".repeat(51));
        let errors = validate_breakdowns(&[b], &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("summary")));
    }

    #[test]
    fn test_missing_summary_only_when_required() {
        let mut b = breakdown("task-1", &[]);
        b.summary = None;
        assert!(validate_breakdowns(std::slice::from_ref(&b), &BreakdownLimits::default()).is_ok());

        let limits = BreakdownLimits {
            require_summary: true,
            ..Default::default()
        };
        let errors = validate_breakdowns(&[b], &limits).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("summary is required")));
    }

    #[test]
    fn test_too_many_tasks_rejected() {
        let set: Vec<TaskBreakdown> = (1..=6).map(|n| breakdown(&format!("task-{}", n), &[])).collect();
        let errors = validate_breakdowns(&set, &BreakdownLimits::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("maximum")));
    }

    #[test]
    fn test_wire_format_round_trip() {
        let json = r#"{
            "id": "task-1",
            "description": "add endpoint",
            "branch": "feature/endpoint",
            "scopePaths": ["src/api/"],
            "acceptance": "GET /health returns 200",
            "type": "implementation",
            "estimatedDuration": 1.5,
            "context": "router lives in src/api/mod.rs",
            "dependencies": [],
            "summary": "health endpoint"
        }"#;
        let b: TaskBreakdown = serde_json::from_str(json).unwrap();
        assert_eq!(b.id, "task-1");
        assert_eq!(b.scope_paths, vec!["src/api/".to_string()]);
        assert_eq!(b.task_type, TaskType::Implementation);

        // Round-trip is stable
        let emitted = serde_json::to_string(&b).unwrap();
        let again: TaskBreakdown = serde_json::from_str(&emitted).unwrap();
        assert_eq!(b, again);
    }
}
