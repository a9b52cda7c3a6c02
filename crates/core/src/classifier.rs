//! # Turn Classifier
//!
//! Turns the model's raw reply into a structured outcome: whether the turn
//! still needs candidate input, the reply text with control markers removed,
//! and the media the reply refers to. All text-pattern parsing of model
//! output lives here.

use crate::media::MediaRef;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Appended by the model when the whole assessment flow is finished.
pub const COMPLETION_MARKER: &str = "[STATUS:completed]";
/// Appended by the model when it is waiting for the candidate.
pub const CONTINUATION_MARKER: &str = "[STATUS:input_required]";

const CANONICAL_PREFIX: &str = "Looking at [Image:";

static IMAGE_ANNOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[Image:\s*([^\]]+?)\s*\]").expect("image annotation pattern is valid")
});

static LEGACY_IMAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*Image:\s*(\S+)\s*$").expect("legacy image pattern is valid")
});

static CANONICAL_LEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Looking at (?:\[Image:[^\]]*\]\s*)+-\s*").expect("canonical lead pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    InputRequired,
    Completed,
}

/// The structured result of one agent reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub clean_text: String,
    pub media_refs: Vec<MediaRef>,
}

impl TurnOutcome {
    /// The reply with image annotations removed, for channels that deliver
    /// the media as separate attachments.
    pub fn display_text(&self) -> String {
        let without_lead = CANONICAL_LEAD.replace_all(&self.clean_text, "");
        let without_refs = IMAGE_ANNOTATION.replace_all(&without_lead, "");
        let without_legacy = LEGACY_IMAGE_LINE.replace_all(&without_refs, "");
        without_legacy
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

pub struct TurnClassifier;

impl TurnClassifier {
    pub fn classify(raw: &str) -> TurnOutcome {
        let status = detect_status(raw);
        let clean_text = strip_markers(raw);
        let media_refs = extract_media_refs(&clean_text);
        TurnOutcome {
            status,
            clean_text,
            media_refs,
        }
    }
}

/// Only the marker at the very end of the reply decides the status; a reply
/// without one is treated as waiting for input.
pub fn detect_status(raw: &str) -> TurnStatus {
    if raw.trim_end().ends_with(COMPLETION_MARKER) {
        TurnStatus::Completed
    } else {
        TurnStatus::InputRequired
    }
}

/// Removes every status marker, wherever it appears.
pub fn strip_markers(raw: &str) -> String {
    raw.replace(COMPLETION_MARKER, "")
        .replace(CONTINUATION_MARKER, "")
        .trim()
        .to_string()
}

/// Collects media references in order of appearance, without duplicates.
///
/// Canonical question lines (`Looking at [Image: ...] - Question X/Y`) win
/// when present. Otherwise any `[Image: ...]` annotation outside lines that
/// look like structured data is taken, and finally bare `Image: path` lines.
pub fn extract_media_refs(text: &str) -> Vec<MediaRef> {
    let canonical: Vec<&str> = text
        .lines()
        .filter_map(|line| line.find(CANONICAL_PREFIX).map(|at| &line[at..]))
        .flat_map(annotations)
        .collect();

    let raw_refs = if !canonical.is_empty() {
        canonical
    } else {
        let annotated: Vec<&str> = text
            .lines()
            .filter(|line| !looks_structured(line))
            .flat_map(annotations)
            .collect();
        if !annotated.is_empty() {
            annotated
        } else {
            LEGACY_IMAGE_LINE
                .captures_iter(text)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
                .collect()
        }
    };

    let mut refs: Vec<MediaRef> = Vec::new();
    for raw in raw_refs {
        let media = MediaRef::new(raw);
        if !media.raw.is_empty() && !refs.iter().any(|seen| seen.raw == media.raw) {
            refs.push(media);
        }
    }
    refs
}

fn annotations(line: &str) -> Vec<&str> {
    IMAGE_ANNOTATION
        .captures_iter(line)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

fn looks_structured(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('"') || trimmed.contains("\":")
}
