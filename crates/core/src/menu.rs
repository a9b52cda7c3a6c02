//! # Guided Menus
//!
//! Menu-driven channels walk the candidate through role selection, activity
//! selection and assessment-type selection before the conversational model
//! takes over. Each step is a pure state transition on the session.

use crate::quiz::QuizKind;
use crate::session::{AssessmentTrack, FlowStage, Session};
use crate::verdict::CompetencyTable;
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;

const MENU_COMMANDS: [&str; 5] = ["menu", "switch", "options", "home", "back"];
const INVALID_OPTION: &str = "Please select a valid option.";
const MIN_FUZZY_SCORE: i64 = 40;

/// What the orchestrator should do with a guided-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuStep {
    /// Answer with this menu text; the model is not involved.
    Reply(String),
    /// Hand this text to the model in place of the candidate's message.
    Forward(String),
    /// Not a menu turn; hand the candidate's message to the model unchanged.
    Pass,
}

pub fn role_menu(competency: &CompetencyTable) -> String {
    let mut menu = String::from("Which role are you preparing for?\n\n");
    for (index, role) in competency.role_names().enumerate() {
        menu.push_str(&format!("{}. {}\n", index + 1, role));
    }
    menu.push_str("\nReply with the number or the name of the role.");
    menu
}

pub fn activity_menu() -> String {
    "What would you like to do?\n\n1. Practice for interviews\n2. Take skills assessment\n\nReply with '1' or '2' only.".to_string()
}

pub fn assessment_type_menu() -> String {
    "Which assessment would you like to take?\n\n1. General interview questions\n2. Technical questions for your role\n\nReply with '1' or '2' only.".to_string()
}

/// Resolves a role reply: a menu number, a role name in any case, or a
/// close fuzzy match such as "electrcian".
pub fn parse_role_choice(input: &str, competency: &CompetencyTable) -> Option<String> {
    let input = input.trim().trim_end_matches('.').trim();
    if input.is_empty() {
        return None;
    }
    let roles: Vec<&str> = competency.role_names().collect();
    if let Ok(number) = input.parse::<usize>() {
        return number
            .checked_sub(1)
            .and_then(|index| roles.get(index))
            .map(|role| role.to_string());
    }
    if let Some((name, _)) = competency.role(input) {
        return Some(name.to_string());
    }

    let needle = input.to_lowercase();
    let matcher = SkimMatcherV2::default();
    roles
        .iter()
        .filter_map(|role| {
            let haystack = role.to_lowercase();
            let score = matcher
                .fuzzy_match(&haystack, &needle)
                .or_else(|| matcher.fuzzy_match(&needle, &haystack))?;
            Some((score, *role))
        })
        .filter(|(score, _)| *score >= MIN_FUZZY_SCORE)
        .max_by_key(|(score, _)| *score)
        .map(|(_, role)| role.to_string())
}

fn numbered_choice(input: &str, first: &[&str], second: &[&str]) -> Option<u8> {
    let input = input.trim().trim_end_matches('.').trim().to_lowercase();
    match input.as_str() {
        "1" => return Some(1),
        "2" => return Some(2),
        _ => {}
    }
    if first.iter().any(|keyword| input.contains(keyword)) {
        Some(1)
    } else if second.iter().any(|keyword| input.contains(keyword)) {
        Some(2)
    } else {
        None
    }
}

pub fn is_menu_command(input: &str) -> bool {
    let input = input.trim().to_lowercase();
    MENU_COMMANDS.contains(&input.as_str())
}

/// Advances the guided flow by one candidate message.
///
/// `saved_role` is the role remembered from an earlier session, used to
/// skip role selection for returning candidates.
pub fn step(
    session: &mut Session,
    input: &str,
    saved_role: Option<String>,
    competency: &CompetencyTable,
) -> MenuStep {
    if session.stage != FlowStage::New && is_menu_command(input) {
        return if session.candidate.role_identified() {
            session.stage = FlowStage::ActivitySelection;
            MenuStep::Reply(activity_menu())
        } else {
            session.stage = FlowStage::RolePending;
            MenuStep::Reply(role_menu(competency))
        };
    }

    match session.stage {
        FlowStage::New => match saved_role {
            Some(role) => {
                select_role(session, &role, competency);
                MenuStep::Reply(format!(
                    "Welcome back! You're preparing for the {role} role.\n\n{}",
                    activity_menu()
                ))
            }
            None => {
                session.stage = FlowStage::RolePending;
                MenuStep::Reply(format!(
                    "Welcome! I'll help you get ready for your next job.\n\n{}",
                    role_menu(competency)
                ))
            }
        },
        FlowStage::RolePending => match parse_role_choice(input, competency) {
            Some(role) => {
                select_role(session, &role, competency);
                MenuStep::Reply(format!(
                    "Great! You're preparing for the {role} role.\n\n{}",
                    activity_menu()
                ))
            }
            None => MenuStep::Reply(format!("{INVALID_OPTION}\n\n{}", role_menu(competency))),
        },
        FlowStage::ActivitySelection => {
            match numbered_choice(input, &["practice", "practise", "interview"], &["assess", "test", "skill"]) {
                Some(1) => {
                    session.stage = FlowStage::Practice;
                    MenuStep::Forward("I'd like to practice for interviews.".to_string())
                }
                Some(_) => {
                    session.stage = FlowStage::AssessmentTypeSelection;
                    MenuStep::Reply(assessment_type_menu())
                }
                None => MenuStep::Reply(format!("{INVALID_OPTION}\n\n{}", activity_menu())),
            }
        }
        FlowStage::AssessmentTypeSelection => {
            match numbered_choice(input, &["general"], &["technical", "role"]) {
                Some(1) => {
                    session.track = AssessmentTrack::General;
                    session.set_plan(vec![QuizKind::Knowledge]);
                    session.stage = FlowStage::AssessmentInProgress;
                    MenuStep::Forward("Please start my general interview assessment.".to_string())
                }
                Some(_) => {
                    session.track = AssessmentTrack::Technical;
                    let plan = session
                        .candidate
                        .target_role()
                        .and_then(|role| competency.role(role))
                        .map(|(_, requirements)| requirements.assessment_plan.clone())
                        .filter(|plan| !plan.is_empty())
                        .unwrap_or_else(|| vec![QuizKind::Knowledge]);
                    session.set_plan(plan);
                    session.stage = FlowStage::AssessmentInProgress;
                    MenuStep::Forward(
                        "Please start the technical assessment for my role.".to_string(),
                    )
                }
                None => MenuStep::Reply(format!("{INVALID_OPTION}\n\n{}", assessment_type_menu())),
            }
        }
        _ => MenuStep::Pass,
    }
}

fn select_role(session: &mut Session, role: &str, competency: &CompetencyTable) {
    let role = competency
        .role(role)
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| role.to_string());
    session.candidate.update_role(&role);
    session.stage = FlowStage::ActivitySelection;
}
