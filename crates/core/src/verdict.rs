//! # Verdict Calculator
//!
//! Compares a candidate's assessment history against the competency table
//! for their role and produces a pass/fail decision per required skill.
//! The calculation is a pure function of its inputs.

use crate::candidate::AssessmentRecord;
use crate::quiz::QuizKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Thresholds a skill result must meet. Absent thresholds always pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillThresholds {
    #[serde(default, alias = "min_quality_rating")]
    pub min_score: Option<f64>,
    #[serde(default, alias = "required_professional_grade")]
    pub required_grades: Option<Vec<String>>,
    #[serde(default)]
    pub min_accuracy: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleRequirements {
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub passing_thresholds: BTreeMap<String, SkillThresholds>,
    /// Quizzes run, in order, when the candidate takes the technical track.
    #[serde(default)]
    pub assessment_plan: Vec<QuizKind>,
}

/// Role name to requirements, as loaded from `competency_map.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetencyTable {
    #[serde(default)]
    pub roles: BTreeMap<String, RoleRequirements>,
}

impl CompetencyTable {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read competency map {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse competency map {}", path.display()))
    }

    /// Case-insensitive role lookup, returning the canonical role name.
    pub fn role(&self, name: &str) -> Option<(&str, &RoleRequirements)> {
        let name = name.trim();
        self.roles
            .iter()
            .find(|(role, _)| role.eq_ignore_ascii_case(name))
            .map(|(role, requirements)| (role.as_str(), requirements))
    }

    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Pass,
    Fail,
    Incomplete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SkillStatus {
    Missing,
    Completed,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillVerdict {
    pub status: SkillStatus,
    pub pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_checks: Vec<String>,
}

impl SkillVerdict {
    fn missing() -> Self {
        Self {
            status: SkillStatus::Missing,
            pass: false,
            score: None,
            grade: None,
            failed_checks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictResult {
    pub decision: Decision,
    pub per_skill: BTreeMap<String, SkillVerdict>,
    pub overall_pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Computes the verdict for `role` from `history`.
///
/// For each required skill the most recent history entry whose skill name
/// contains, or is contained in, the required name (case-insensitive) is
/// checked against that skill's thresholds. An unknown or absent role gives
/// [`Decision::Incomplete`] with no per-skill entries.
pub fn calculate_verdict(
    history: &[AssessmentRecord],
    table: &CompetencyTable,
    role: Option<&str>,
) -> VerdictResult {
    let Some((role_name, requirements)) = role.and_then(|r| table.role(r)) else {
        return VerdictResult {
            decision: Decision::Incomplete,
            per_skill: BTreeMap::new(),
            overall_pass: false,
            reason: Some(match role {
                Some(r) => format!("no competency requirements for role '{r}'"),
                None => "role not identified".to_string(),
            }),
        };
    };

    let mut per_skill = BTreeMap::new();
    for skill in &requirements.required_skills {
        let verdict = match find_latest(history, skill) {
            None => SkillVerdict::missing(),
            Some(record) => {
                let thresholds = requirements
                    .passing_thresholds
                    .get(skill)
                    .cloned()
                    .unwrap_or_default();
                check_record(record, &thresholds)
            }
        };
        per_skill.insert(skill.clone(), verdict);
    }

    let any_invalid = per_skill
        .values()
        .any(|v| v.status == SkillStatus::Invalid);
    let overall_pass = !any_invalid && per_skill.values().all(|v| v.pass);
    let decision = if any_invalid {
        Decision::Error
    } else if overall_pass {
        Decision::Pass
    } else {
        Decision::Fail
    };

    VerdictResult {
        decision,
        per_skill,
        overall_pass,
        reason: any_invalid.then(|| format!("invalid score recorded for role '{role_name}'")),
    }
}

/// True when every required skill of `role` has a matching history entry.
pub fn all_required_recorded(
    history: &[AssessmentRecord],
    table: &CompetencyTable,
    role: &str,
) -> bool {
    table.role(role).is_some_and(|(_, requirements)| {
        requirements
            .required_skills
            .iter()
            .all(|skill| find_latest(history, skill).is_some())
    })
}

fn skills_match(required: &str, recorded: &str) -> bool {
    let required = required.trim().to_lowercase();
    let recorded = recorded.trim().to_lowercase();
    if required.is_empty() || recorded.is_empty() {
        return false;
    }
    required.contains(&recorded) || recorded.contains(&required)
}

fn find_latest<'a>(history: &'a [AssessmentRecord], skill: &str) -> Option<&'a AssessmentRecord> {
    history
        .iter()
        .rev()
        .find(|record| skills_match(skill, &record.skill))
}

fn check_record(record: &AssessmentRecord, thresholds: &SkillThresholds) -> SkillVerdict {
    let accuracy = record.accuracy();
    if !record.score.is_finite() || !accuracy.is_finite() {
        return SkillVerdict {
            status: SkillStatus::Invalid,
            pass: false,
            score: None,
            grade: Some(record.grade.clone()),
            failed_checks: vec!["score is not a number".to_string()],
        };
    }

    let mut failed_checks = Vec::new();
    if let Some(min) = thresholds.min_score {
        if record.score < min {
            failed_checks.push(format!("score {} below minimum {min}", record.score));
        }
    }
    if let Some(grades) = &thresholds.required_grades {
        let grade = record.grade.trim();
        if !grades.iter().any(|g| g.trim().eq_ignore_ascii_case(grade)) {
            failed_checks.push(format!("grade '{grade}' not in {grades:?}"));
        }
    }
    if let Some(min) = thresholds.min_accuracy {
        if accuracy < min {
            failed_checks.push(format!("accuracy {accuracy} below minimum {min}"));
        }
    }

    SkillVerdict {
        status: SkillStatus::Completed,
        pass: failed_checks.is_empty(),
        score: Some(record.score),
        grade: Some(record.grade.clone()),
        failed_checks,
    }
}
