//! # Sessions
//!
//! A session bundles everything that belongs to one conversation: the
//! candidate record, the quiz slot, the guided-flow stage and the queue of
//! planned quizzes. Sessions are persisted through an injected
//! [`SessionStore`]; longer-lived per-user facts (chosen role, module
//! progress) go through a [`ProfileStore`].

use crate::candidate::CandidateState;
use crate::quiz::{QuizKind, QuizSlot};
use crate::verdict::{CompetencyTable, all_required_recorded};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Where the conversation stands in the guided flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStage {
    New,
    RolePending,
    ActivitySelection,
    AssessmentTypeSelection,
    Practice,
    AssessmentInProgress,
    AssessmentComplete,
}

impl FlowStage {
    /// Stages that are only left through an explicit menu choice.
    pub fn is_menu_driven(self) -> bool {
        matches!(
            self,
            FlowStage::ActivitySelection | FlowStage::AssessmentTypeSelection | FlowStage::Practice
        )
    }
}

/// Which question pool an assessment run draws knowledge questions from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentTrack {
    General,
    #[default]
    Technical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub user_id: String,
    pub stage: FlowStage,
    pub track: AssessmentTrack,
    pub candidate: CandidateState,
    pub quiz: QuizSlot,
    /// Quizzes still to run in this assessment, in order.
    pub plan: Vec<QuizKind>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: &str, user_id: &str) -> Self {
        Self {
            key: key.to_string(),
            user_id: user_id.to_string(),
            stage: FlowStage::New,
            track: AssessmentTrack::default(),
            candidate: CandidateState::create(None, None),
            quiz: QuizSlot::default(),
            plan: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Replaces the plan and queues its skills on the candidate record.
    pub fn set_plan(&mut self, plan: Vec<QuizKind>) {
        self.candidate
            .add_pending_skills(plan.iter().map(|kind| kind.skill_name()));
        self.plan = plan;
    }

    /// The first planned quiz that has not been completed yet.
    pub fn next_planned(&self) -> Option<QuizKind> {
        let done = &self.candidate.session_metadata().completed_skills;
        self.plan
            .iter()
            .copied()
            .find(|kind| !done.iter().any(|skill| skill == kind.skill_name()))
    }

    /// The knowledge pool for this session's track.
    pub fn question_pool(&self) -> Option<&str> {
        match self.track {
            AssessmentTrack::General => Some(crate::question_bank::GENERAL_POOL),
            AssessmentTrack::Technical => self.candidate.target_role(),
        }
    }

    /// Re-derives the stage from the candidate record. Menu-driven stages
    /// are left alone.
    pub fn refresh_stage(&mut self, competency: &CompetencyTable) {
        if self.stage.is_menu_driven() {
            return;
        }
        let candidate = &self.candidate;
        self.stage = if !candidate.role_identified() {
            FlowStage::RolePending
        } else if self.quiz.is_active() || candidate.current_assessment().is_some() {
            FlowStage::AssessmentInProgress
        } else if self.is_assessment_complete(competency) {
            FlowStage::AssessmentComplete
        } else {
            FlowStage::AssessmentInProgress
        };
    }

    fn is_assessment_complete(&self, competency: &CompetencyTable) -> bool {
        let history = self.candidate.assessment_history();
        let plan_done = !history.is_empty() && self.next_planned().is_none();
        let role_done = self.track == AssessmentTrack::Technical
            && self
                .candidate
                .target_role()
                .is_some_and(|role| all_required_recorded(history, competency, role));
        plan_done || role_done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Completed,
}

impl ProgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProgressStatus::Pending),
            "in_progress" => Ok(ProgressStatus::InProgress),
            "completed" => Ok(ProgressStatus::Completed),
            other => Err(anyhow::anyhow!("unknown progress status '{other}'")),
        }
    }
}

/// Per-user progress on one assessment module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub skill: String,
    pub module_id: String,
    pub status: ProgressStatus,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Session>>;

    async fn save(&self, session: &Session) -> Result<()>;

    /// Loads the session for `key`, creating (but not saving) a new one if
    /// none exists. The flag is `true` for a new session.
    async fn get_or_create(&self, key: &str, user_id: &str) -> Result<(Session, bool)> {
        match self.load(key).await? {
            Some(session) => Ok((session, false)),
            None => Ok((Session::new(key, user_id), true)),
        }
    }
}

/// Persistence for facts that outlive a session.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load_role(&self, user_id: &str) -> Result<Option<String>>;

    async fn save_role(&self, user_id: &str, role: &str) -> Result<()>;

    async fn load_progress(&self, user_id: &str) -> Result<Vec<ProgressRecord>>;

    async fn save_progress(&self, user_id: &str, record: &ProgressRecord) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, key: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.key.clone(), session.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    roles: RwLock<HashMap<String, String>>,
    progress: RwLock<HashMap<String, Vec<ProgressRecord>>>,
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn load_role(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.roles.read().await.get(user_id).cloned())
    }

    async fn save_role(&self, user_id: &str, role: &str) -> Result<()> {
        self.roles
            .write()
            .await
            .insert(user_id.to_string(), role.to_string());
        Ok(())
    }

    async fn load_progress(&self, user_id: &str) -> Result<Vec<ProgressRecord>> {
        Ok(self
            .progress
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_progress(&self, user_id: &str, record: &ProgressRecord) -> Result<()> {
        let mut progress = self.progress.write().await;
        let records = progress.entry(user_id.to_string()).or_default();
        match records
            .iter_mut()
            .find(|r| r.skill == record.skill && r.module_id == record.module_id)
        {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }
}

/// Serializes turns per session key. Turns for different keys run
/// concurrently; turns for the same key queue in arrival order.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
