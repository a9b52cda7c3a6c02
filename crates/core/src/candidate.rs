//! # Candidate State
//!
//! The per-candidate record of role, assessment progress and interaction
//! history. Every mutation goes through a method that validates the
//! transition and refreshes `last_activity`, so the record can never hold
//! two assessments in flight or drift out of sync with its metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle of the candidate's current assessment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    Started,
    InProgress,
    Completed,
}

/// One finished skill assessment, appended to the history in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub skill: String,
    pub score: f64,
    pub grade: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl AssessmentRecord {
    /// The accuracy reported in `details`, falling back to the raw score.
    pub fn accuracy(&self) -> f64 {
        self.details
            .get("accuracy")
            .and_then(Value::as_f64)
            .unwrap_or(self.score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    UserQuery,
    AgentResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEntry {
    pub timestamp: DateTime<Utc>,
    pub action: InteractionAction,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub total_assessments: u32,
    pub completed_skills: Vec<String>,
    pub pending_skills: Vec<String>,
    pub last_activity: DateTime<Utc>,
}

/// A rejected state transition. The record is left untouched when one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTransition {
    #[error("an assessment for '{0}' is already in progress")]
    AssessmentInProgress(String),
    #[error("no assessment is in progress")]
    NoAssessmentInProgress,
    #[error("the assessment in progress is for '{expected}', not '{actual}'")]
    SkillMismatch { expected: String, actual: String },
    #[error("score must be a finite number")]
    NonFiniteScore,
}

/// Everything the system knows about one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateState {
    candidate_id: String,
    name: Option<String>,
    role_identified: bool,
    target_role: Option<String>,
    current_assessment: Option<String>,
    assessment_status: Option<AssessmentStatus>,
    skill_levels: BTreeMap<String, f64>,
    assessment_history: Vec<AssessmentRecord>,
    interaction_history: Vec<InteractionEntry>,
    session_metadata: SessionMetadata,
}

impl CandidateState {
    /// Creates a fresh record with a short random id. A known role is
    /// recorded as identified straight away.
    pub fn create(name: Option<String>, role: Option<String>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let target_role = role
            .map(|role| role.trim().to_string())
            .filter(|role| !role.is_empty());
        Self {
            candidate_id: id[..8].to_string(),
            name,
            role_identified: target_role.is_some(),
            target_role,
            current_assessment: None,
            assessment_status: None,
            skill_levels: BTreeMap::new(),
            assessment_history: Vec::new(),
            interaction_history: Vec::new(),
            session_metadata: SessionMetadata {
                total_assessments: 0,
                completed_skills: Vec::new(),
                pending_skills: Vec::new(),
                last_activity: Utc::now(),
            },
        }
    }

    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn role_identified(&self) -> bool {
        self.role_identified
    }

    pub fn target_role(&self) -> Option<&str> {
        self.target_role.as_deref()
    }

    pub fn current_assessment(&self) -> Option<&str> {
        self.current_assessment.as_deref()
    }

    pub fn assessment_status(&self) -> Option<AssessmentStatus> {
        self.assessment_status
    }

    pub fn skill_levels(&self) -> &BTreeMap<String, f64> {
        &self.skill_levels
    }

    pub fn assessment_history(&self) -> &[AssessmentRecord] {
        &self.assessment_history
    }

    pub fn interaction_history(&self) -> &[InteractionEntry] {
        &self.interaction_history
    }

    pub fn session_metadata(&self) -> &SessionMetadata {
        &self.session_metadata
    }

    /// The last `limit` interactions, oldest first.
    pub fn recent_interactions(&self, limit: usize) -> &[InteractionEntry] {
        let start = self.interaction_history.len().saturating_sub(limit);
        &self.interaction_history[start..]
    }

    /// Sets the target role. Setting the same role twice changes nothing
    /// except the activity timestamp.
    pub fn update_role(&mut self, role: &str) {
        let role = role.trim();
        if self.target_role.as_deref() != Some(role) {
            self.target_role = Some(role.to_string());
        }
        self.role_identified = true;
        self.touch();
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.trim().to_string());
        self.touch();
    }

    /// Marks `skill` as the assessment in progress.
    ///
    /// Fails when another assessment is already running; restarting the
    /// same skill is also refused so a run cannot silently reset.
    pub fn start_assessment(&mut self, skill: &str) -> Result<(), InvalidTransition> {
        if let Some(current) = &self.current_assessment {
            return Err(InvalidTransition::AssessmentInProgress(current.clone()));
        }
        self.current_assessment = Some(skill.to_string());
        self.assessment_status = Some(AssessmentStatus::InProgress);
        self.session_metadata
            .pending_skills
            .retain(|pending| pending != skill);
        self.touch();
        Ok(())
    }

    /// Closes the running assessment and appends it to the history.
    pub fn complete_assessment(
        &mut self,
        skill: &str,
        score: f64,
        grade: &str,
        details: Value,
    ) -> Result<(), InvalidTransition> {
        let Some(current) = &self.current_assessment else {
            return Err(InvalidTransition::NoAssessmentInProgress);
        };
        if current != skill {
            return Err(InvalidTransition::SkillMismatch {
                expected: current.clone(),
                actual: skill.to_string(),
            });
        }
        if !score.is_finite() {
            return Err(InvalidTransition::NonFiniteScore);
        }

        self.assessment_history.push(AssessmentRecord {
            skill: skill.to_string(),
            score,
            grade: grade.to_string(),
            timestamp: Utc::now(),
            details,
        });
        self.skill_levels.insert(skill.to_string(), score);
        self.current_assessment = None;
        self.assessment_status = Some(AssessmentStatus::Completed);

        let metadata = &mut self.session_metadata;
        metadata.total_assessments += 1;
        if !metadata.completed_skills.iter().any(|s| s == skill) {
            metadata.completed_skills.push(skill.to_string());
        }
        metadata.pending_skills.retain(|pending| pending != skill);
        self.touch();
        Ok(())
    }

    /// Queues skills that still need assessing, skipping ones already done
    /// or already queued.
    pub fn add_pending_skills<I, S>(&mut self, skills: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for skill in skills {
            let skill = skill.as_ref();
            let metadata = &mut self.session_metadata;
            let known = metadata.completed_skills.iter().any(|s| s == skill)
                || metadata.pending_skills.iter().any(|s| s == skill);
            if !known {
                metadata.pending_skills.push(skill.to_string());
            }
        }
        self.touch();
    }

    pub fn record_interaction(&mut self, action: InteractionAction, payload: Value) {
        self.interaction_history.push(InteractionEntry {
            timestamp: Utc::now(),
            action,
            payload,
        });
        self.touch();
    }

    fn touch(&mut self) {
        self.session_metadata.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_has_short_id_and_no_role() {
        let state = CandidateState::create(None, None);
        assert_eq!(state.candidate_id().len(), 8);
        assert!(!state.role_identified());
        assert!(state.target_role().is_none());
        assert_eq!(state.session_metadata().total_assessments, 0);
    }

    #[test]
    fn test_create_with_known_role() {
        let state = CandidateState::create(Some("Ravi".into()), Some(" Fitter ".into()));
        assert_eq!(state.name(), Some("Ravi"));
        assert!(state.role_identified());
        assert_eq!(state.target_role(), Some("Fitter"));

        let blank = CandidateState::create(None, Some("  ".into()));
        assert!(!blank.role_identified());
        assert!(blank.target_role().is_none());
    }

    #[test]
    fn test_update_role_is_idempotent() {
        let mut state = CandidateState::create(Some("Asha".into()), None);
        state.update_role("Electrician");
        let snapshot = state.clone();
        state.update_role("Electrician");

        assert!(state.role_identified());
        assert_eq!(state.target_role(), Some("Electrician"));
        assert_eq!(state.assessment_history(), snapshot.assessment_history());
        assert_eq!(state.skill_levels(), snapshot.skill_levels());
    }

    #[test]
    fn test_start_while_in_progress_is_rejected() {
        let mut state = CandidateState::create(None, None);
        state.start_assessment("Label Reading").unwrap();
        let before = state.clone();

        let err = state.start_assessment("Technical Knowledge").unwrap_err();
        assert_eq!(
            err,
            InvalidTransition::AssessmentInProgress("Label Reading".into())
        );
        assert_eq!(state, before);
    }

    #[test]
    fn test_complete_appends_history_and_updates_metadata() {
        let mut state = CandidateState::create(None, None);
        state.add_pending_skills(["Label Reading", "Technical Knowledge"]);
        state.start_assessment("Label Reading").unwrap();
        state
            .complete_assessment("Label Reading", 66.67, "Good", json!({"accuracy": 66.67}))
            .unwrap();

        assert_eq!(state.current_assessment(), None);
        assert_eq!(state.assessment_status(), Some(AssessmentStatus::Completed));
        assert_eq!(state.assessment_history().len(), 1);
        assert_eq!(state.skill_levels().get("Label Reading"), Some(&66.67));
        let metadata = state.session_metadata();
        assert_eq!(metadata.total_assessments, 1);
        assert_eq!(metadata.completed_skills, vec!["Label Reading".to_string()]);
        assert_eq!(
            metadata.pending_skills,
            vec!["Technical Knowledge".to_string()]
        );
    }

    #[test]
    fn test_complete_without_start_or_for_other_skill_fails() {
        let mut state = CandidateState::create(None, None);
        assert_eq!(
            state.complete_assessment("Label Reading", 50.0, "Fair", Value::Null),
            Err(InvalidTransition::NoAssessmentInProgress)
        );

        state.start_assessment("Label Reading").unwrap();
        let err = state
            .complete_assessment("Photo Identification", 50.0, "Fair", Value::Null)
            .unwrap_err();
        assert!(matches!(err, InvalidTransition::SkillMismatch { .. }));
        assert_eq!(state.current_assessment(), Some("Label Reading"));
        assert!(state.assessment_history().is_empty());
    }

    #[test]
    fn test_non_finite_score_is_rejected() {
        let mut state = CandidateState::create(None, None);
        state.start_assessment("Label Reading").unwrap();
        assert_eq!(
            state.complete_assessment("Label Reading", f64::NAN, "?", Value::Null),
            Err(InvalidTransition::NonFiniteScore)
        );
        assert!(state.assessment_history().is_empty());
    }

    #[test]
    fn test_recent_interactions_window() {
        let mut state = CandidateState::create(None, None);
        for i in 0..15 {
            state.record_interaction(InteractionAction::UserQuery, json!({ "query": i }));
        }
        let recent = state.recent_interactions(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].payload, json!({ "query": 5 }));
        assert_eq!(state.recent_interactions(100).len(), 15);
    }

    #[test]
    fn test_record_accuracy_falls_back_to_score() {
        let record = AssessmentRecord {
            skill: "Label Reading".into(),
            score: 72.0,
            grade: "Good".into(),
            timestamp: Utc::now(),
            details: Value::Null,
        };
        assert_eq!(record.accuracy(), 72.0);
    }
}
