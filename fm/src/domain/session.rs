//! Planner session record

use serde::{Deserialize, Serialize};
use workstore::{Record, now_ms};

use super::id::new_session_id;

/// One turn of planner conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Persisted record of one planning session. Continuation sessions point at
/// their parent; `root_session_id` groups a whole orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSession {
    pub session_id: String,
    pub parent_session_id: Option<String>,
    pub root_session_id: String,

    /// The user instruction this session decomposes
    pub instruction: String,

    /// Ids of tasks this session produced
    pub generated_task_ids: Vec<String>,

    /// Prompt/response history, kept for continuation planning
    pub conversation: Vec<ConversationTurn>,

    pub created_at: i64,
    pub completed_at: Option<i64>,

    pub version: u64,
    pub updated_at: i64,
}

impl PlannerSession {
    /// Start a fresh root session
    pub fn new(instruction: impl Into<String>) -> Self {
        let id = new_session_id();
        let now = now_ms();
        Self {
            session_id: id.clone(),
            parent_session_id: None,
            root_session_id: id,
            instruction: instruction.into(),
            generated_task_ids: Vec::new(),
            conversation: Vec::new(),
            created_at: now,
            completed_at: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Start a continuation session under an existing root
    pub fn continuation(parent: &PlannerSession, instruction: impl Into<String>) -> Self {
        let mut session = Self::new(instruction);
        session.parent_session_id = Some(parent.session_id.clone());
        session.root_session_id = parent.root_session_id.clone();
        session
    }

    pub fn record_turn(&mut self, turn: ConversationTurn) {
        self.conversation.push(turn);
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(now_ms());
    }
}

impl Record for PlannerSession {
    fn id(&self) -> &str {
        &self.session_id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self, now_ms: i64) {
        self.updated_at = now_ms;
    }

    fn collection_name() -> &'static str {
        "sessions"
    }
}
