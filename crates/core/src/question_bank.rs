//! # Question Bank
//!
//! Produces the question set for each quiz kind. Label and photo questions
//! come from JSON datasets on disk; knowledge and scenario questions come
//! from built-in pools that can be overridden the same way.

use crate::evaluator::AnswerPolicy;
use crate::quiz::{Question, QuizKind};
use anyhow::{Context, Result};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

const LABEL_CATEGORIES: [&str; 4] = ["warehouse", "grocery", "beverage", "condiments"];
const LABEL_FIELDS: [&str; 6] = ["product", "brand", "net_weight", "volume", "variant", "wattage"];
const MAX_LABELS: usize = 3;
const MAX_QUESTIONS_PER_LABEL: usize = 3;
const KNOWLEDGE_SAMPLE: usize = 5;
const SCENARIO_SAMPLE: usize = 5;

/// Key of the knowledge pool used when a role has no pool of its own.
pub const GENERAL_POOL: &str = "general";

/// One product label in `label_dataset/index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelItem {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl LabelItem {
    fn images(&self) -> Vec<String> {
        if !self.file_paths.is_empty() {
            return self.file_paths.clone();
        }
        self.file_path.iter().cloned().collect()
    }
}

/// One pre-analysed safety photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoItem {
    pub image_path: String,
    pub question: String,
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub question: String,
    pub answer: String,
}

/// A multiple-choice workplace scenario with options `a` to `d`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioItem {
    pub question: String,
    pub options: BTreeMap<String, String>,
    pub correct: String,
}

impl ScenarioItem {
    fn to_question(&self) -> Question {
        let mut prompt = self.question.clone();
        prompt.push('\n');
        for (letter, text) in &self.options {
            prompt.push_str(&format!("{}. {}\n", letter.to_uppercase(), text));
        }
        prompt.push_str("(Reply with A, B, C, or D)");

        Question {
            prompt,
            expected_answer: self.correct.clone(),
            accepted_answers: self.options.get(&self.correct).cloned().into_iter().collect(),
            media_refs: Vec::new(),
            policy: AnswerPolicy::ExactNormalizedCompare,
            explanation: None,
        }
    }
}

/// All question sources, loaded once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct QuestionBank {
    labels: Vec<LabelItem>,
    photos: Vec<PhotoItem>,
    knowledge: BTreeMap<String, Vec<KnowledgeItem>>,
    scenarios: Vec<ScenarioItem>,
}

impl QuestionBank {
    pub fn new(
        labels: Vec<LabelItem>,
        mut photos: Vec<PhotoItem>,
        knowledge: BTreeMap<String, Vec<KnowledgeItem>>,
        scenarios: Vec<ScenarioItem>,
    ) -> Self {
        photos.sort_by(|a, b| a.image_path.cmp(&b.image_path));
        Self {
            labels,
            photos,
            knowledge,
            scenarios,
        }
    }

    /// Only the built-in knowledge and scenario pools.
    pub fn builtin() -> Self {
        Self::new(Vec::new(), Vec::new(), builtin_knowledge(), builtin_scenarios())
    }

    /// Loads datasets from `data_dir`. Missing files leave that source empty
    /// (or on the built-in pool); malformed files are an error.
    ///
    /// Expected layout:
    /// * `label_dataset/index.json` - array of [`LabelItem`]
    /// * `photo_identification.json` - array of [`PhotoItem`]
    /// * `knowledge.json` - map of role to array of [`KnowledgeItem`]
    /// * `scenarios.json` - array of [`ScenarioItem`]
    pub fn load(data_dir: &Path) -> Result<Self> {
        let labels = read_optional(&data_dir.join("label_dataset").join("index.json"))?
            .unwrap_or_default();
        let photos = read_optional(&data_dir.join("photo_identification.json"))?
            .unwrap_or_default();

        let mut knowledge = builtin_knowledge();
        if let Some(extra) =
            read_optional::<BTreeMap<String, Vec<KnowledgeItem>>>(&data_dir.join("knowledge.json"))?
        {
            for (role, items) in extra {
                knowledge.insert(role.to_lowercase(), items);
            }
        }
        let scenarios =
            read_optional(&data_dir.join("scenarios.json"))?.unwrap_or_else(builtin_scenarios);

        let bank = Self::new(labels, photos, knowledge, scenarios);
        info!(
            labels = bank.labels.len(),
            photos = bank.photos.len(),
            knowledge_pools = bank.knowledge.len(),
            scenarios = bank.scenarios.len(),
            "Question bank loaded"
        );
        Ok(bank)
    }

    /// Builds a fresh question set for `kind`. `pool` picks the knowledge
    /// pool (usually the candidate's role); unknown pools fall back to
    /// [`GENERAL_POOL`].
    pub fn questions_for(&self, kind: QuizKind, pool: Option<&str>) -> Vec<Question> {
        self.questions_with_rng(kind, pool, &mut rand::rng())
    }

    pub fn questions_with_rng<R: Rng + ?Sized>(
        &self,
        kind: QuizKind,
        pool: Option<&str>,
        rng: &mut R,
    ) -> Vec<Question> {
        match kind {
            QuizKind::LabelReading => self.label_questions(),
            QuizKind::PhotoIdentification => self.photo_questions(),
            QuizKind::Knowledge => self.knowledge_questions(pool, rng),
            QuizKind::Scenario => self
                .scenarios
                .choose_multiple(rng, SCENARIO_SAMPLE)
                .map(ScenarioItem::to_question)
                .collect(),
        }
    }

    fn label_questions(&self) -> Vec<Question> {
        let relevant: Vec<&LabelItem> = self
            .labels
            .iter()
            .filter(|item| {
                item.category
                    .as_deref()
                    .is_some_and(|c| LABEL_CATEGORIES.contains(&c))
            })
            .collect();
        let selected: Vec<&LabelItem> = if relevant.is_empty() {
            self.labels.iter().take(MAX_LABELS).collect()
        } else {
            relevant.into_iter().take(MAX_LABELS).collect()
        };

        selected
            .into_iter()
            .flat_map(|item| {
                let images = item.images();
                LABEL_FIELDS
                    .iter()
                    .filter_map(|field| item.fields.get(*field).map(|value| (*field, value)))
                    .take(MAX_QUESTIONS_PER_LABEL)
                    .map(move |(field, value)| Question {
                        prompt: format!("What is the {field}?"),
                        expected_answer: value.clone(),
                        accepted_answers: Vec::new(),
                        media_refs: images.clone(),
                        policy: AnswerPolicy::ExactNormalizedCompare,
                        explanation: None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn photo_questions(&self) -> Vec<Question> {
        self.photos
            .iter()
            .map(|photo| Question {
                prompt: photo.question.clone(),
                expected_answer: photo.correct_answer.clone(),
                accepted_answers: Vec::new(),
                media_refs: vec![photo.image_path.clone()],
                policy: AnswerPolicy::ExactNormalizedCompare,
                explanation: photo.explanation.clone(),
            })
            .collect()
    }

    fn knowledge_questions<R: Rng + ?Sized>(&self, pool: Option<&str>, rng: &mut R) -> Vec<Question> {
        let items = pool
            .map(str::to_lowercase)
            .and_then(|key| self.knowledge.get(&key))
            .or_else(|| self.knowledge.get(GENERAL_POOL));
        let Some(items) = items else {
            return Vec::new();
        };
        items
            .choose_multiple(rng, KNOWLEDGE_SAMPLE)
            .map(|item| Question {
                prompt: item.question.clone(),
                expected_answer: item.answer.clone(),
                accepted_answers: Vec::new(),
                media_refs: Vec::new(),
                policy: AnswerPolicy::DelegatedSemanticCompare,
                explanation: None,
            })
            .collect()
    }
}

fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        warn!(path = %path.display(), "Dataset not found, skipping");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset {}", path.display()))?;
    let parsed = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse dataset {}", path.display()))?;
    Ok(Some(parsed))
}

fn knowledge(items: &[(&str, &str)]) -> Vec<KnowledgeItem> {
    items
        .iter()
        .map(|(question, answer)| KnowledgeItem {
            question: (*question).to_string(),
            answer: (*answer).to_string(),
        })
        .collect()
}

fn builtin_knowledge() -> BTreeMap<String, Vec<KnowledgeItem>> {
    let electrician = knowledge(&[
        ("Which tool is used to check current flow?", "Multimeter/Tester"),
        ("What is the color coding for Earth wire in India?", "Green/Green-Yellow"),
        ("What color is typically used for the neutral wire in India?", "Blue"),
        ("In India, which color is usually used for the live wire?", "Red or Brown"),
        ("The standard household supply voltage in India is:", "220-240V"),
        ("Which tool is commonly used to strip insulation from wires?", "Wire stripper"),
        ("Before working on an electrical circuit, the first step should be:", "Switch off the main power"),
        ("Why should electricians use insulated tools?", "They prevent electric shock"),
        ("A fuse is used to:", "Break the circuit during overload"),
        ("What does the acronym \"MCB\" stand for?", "Miniature Circuit Breaker"),
        ("What is the purpose of grounding in electrical systems?", "To provide a safe path for fault current"),
        (
            "What is the function of a Residual Current Device (RCD)?",
            "To quickly disconnect a circuit when leakage current is detected",
        ),
        ("What is used to measure electrical power?", "Wattmeter"),
        ("What is the unit of electrical resistance?", "Ohm"),
        ("What is the unit of insulation resistance?", "Mega ohm"),
        ("What is the full form of XLPE?", "Cross Linked Poly Ethylene"),
        ("Why should a soldering iron be kept on a stand when not in use?", "It prevents burning and fire"),
    ]);
    let fitter = knowledge(&[
        ("Which tool is used to measure small dimensions accurately?", "Vernier caliper"),
        ("What is a micrometer used for?", "Measuring thickness/diameter precisely"),
        ("Which tool is used for tightening nuts and bolts?", "Spanner"),
        ("What is the purpose of lubrication in machines?", "Reduce friction and wear"),
        ("Which safety gear protects eyes while grinding?", "Goggles"),
        ("Which tool would you use to cut a metal rod?", "Hacksaw"),
        ("What does 'tolerance' mean in fitting work?", "Permissible variation in dimensions"),
        ("Which instrument checks alignment of machine parts?", "Dial gauge"),
    ]);
    let general = knowledge(&[
        ("What should you do first if you see a co-worker injured on site?", "Alert the supervisor and call for first aid"),
        ("Why is personal protective equipment worn at work?", "To protect the body from workplace hazards"),
        ("What should you do with a tool you find damaged?", "Stop using it and report it"),
        ("Why is it important to keep the work area clean?", "To prevent accidents such as trips and falls"),
        ("Who should you tell if you do not understand a work instruction?", "Your supervisor"),
        ("What does a red fire extinguisher label or sign indicate?", "Fire fighting equipment"),
    ]);

    BTreeMap::from([
        ("electrician".to_string(), electrician),
        ("fitter".to_string(), fitter),
        (GENERAL_POOL.to_string(), general),
    ])
}

fn scenario(question: &str, options: [&str; 4], correct: &str) -> ScenarioItem {
    ScenarioItem {
        question: question.to_string(),
        options: ["a", "b", "c", "d"]
            .into_iter()
            .zip(options)
            .map(|(letter, text)| (letter.to_string(), text.to_string()))
            .collect(),
        correct: correct.to_string(),
    }
}

fn builtin_scenarios() -> Vec<ScenarioItem> {
    vec![
        scenario(
            "Loose bolt in a Machine",
            [
                "Ignore it until the next scheduled maintenance.",
                "Tighten it immediately with the proper tool.",
                "Hit it with a hammer.",
                "Call the supervisor without checking.",
            ],
            "b",
        ),
        scenario(
            "Pipe Joint Leaking Slightly",
            [
                "Apply sealant without shutting the system.",
                "Shut down system pressure and then repair.",
                "Wrap it with cloth temporarily.",
                "Ignore if the leak is small.",
            ],
            "b",
        ),
        scenario(
            "Fitting a Shaft",
            [
                "Use brute force with a hammer.",
                "Align properly and use a mallet or press fit.",
                "File the shaft down until it fits loosely.",
                "Push it by hand even if misaligned.",
            ],
            "b",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{AnswerKey, matches_exact};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::fs;

    fn label(category: &str, image: &str, fields: &[(&str, &str)]) -> LabelItem {
        LabelItem {
            category: Some(category.to_string()),
            file_path: Some(image.to_string()),
            file_paths: Vec::new(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_label_questions_cap_fields_per_label() {
        let bank = QuestionBank::new(
            vec![label(
                "grocery",
                "label_dataset/samples/salt.jpeg",
                &[
                    ("brand", "Tata"),
                    ("product", "Salt"),
                    ("net_weight", "1 kg"),
                    ("variant", "Iodised"),
                ],
            )],
            Vec::new(),
            BTreeMap::new(),
            Vec::new(),
        );

        let questions = bank.questions_for(QuizKind::LabelReading, None);
        let prompts: Vec<_> = questions.iter().map(|q| q.prompt.as_str()).collect();
        assert_eq!(
            prompts,
            vec![
                "What is the product?",
                "What is the brand?",
                "What is the net_weight?"
            ]
        );
        assert_eq!(questions[0].media_refs, vec!["label_dataset/samples/salt.jpeg"]);
    }

    #[test]
    fn test_label_questions_fall_back_to_first_labels() {
        let labels = (0..5)
            .map(|i| label("electronics", &format!("l{i}.jpg"), &[("brand", "X")]))
            .collect();
        let bank = QuestionBank::new(labels, Vec::new(), BTreeMap::new(), Vec::new());
        assert_eq!(bank.questions_for(QuizKind::LabelReading, None).len(), 3);
    }

    #[test]
    fn test_photo_questions_sorted_by_path() {
        let photo = |path: &str| PhotoItem {
            image_path: path.to_string(),
            question: "Is the practice shown safe or unsafe?".to_string(),
            correct_answer: "unsafe".to_string(),
            explanation: None,
        };
        let bank = QuestionBank::new(
            Vec::new(),
            vec![photo("ElectricianAssessment/b.jpg"), photo("ElectricianAssessment/a.jpg")],
            BTreeMap::new(),
            Vec::new(),
        );
        let questions = bank.questions_for(QuizKind::PhotoIdentification, None);
        assert_eq!(questions[0].media_refs, vec!["ElectricianAssessment/a.jpg"]);
    }

    #[test]
    fn test_knowledge_pool_by_role_with_general_fallback() {
        let bank = QuestionBank::builtin();
        let mut rng = StdRng::seed_from_u64(7);

        let fitter = bank.questions_with_rng(QuizKind::Knowledge, Some("Fitter"), &mut rng);
        assert_eq!(fitter.len(), KNOWLEDGE_SAMPLE);
        assert!(
            fitter
                .iter()
                .all(|q| q.policy == AnswerPolicy::DelegatedSemanticCompare)
        );

        let unknown = bank.questions_with_rng(QuizKind::Knowledge, Some("Tailor"), &mut rng);
        assert_eq!(unknown.len(), KNOWLEDGE_SAMPLE);
        let general: Vec<_> = bank.knowledge[GENERAL_POOL]
            .iter()
            .map(|item| item.question.clone())
            .collect();
        assert!(unknown.iter().all(|q| general.contains(&q.prompt)));
    }

    #[test]
    fn test_scenario_question_accepts_letter_or_text() {
        let question = builtin_scenarios()[0].to_question();
        assert!(question.prompt.contains("B. Tighten it immediately with the proper tool."));
        assert!(question.prompt.ends_with("(Reply with A, B, C, or D)"));

        let key = AnswerKey {
            expected: &question.expected_answer,
            accepted: &question.accepted_answers,
        };
        assert!(matches_exact(key, "Option B"));
        assert!(matches_exact(key, "tighten it immediately with the proper tool"));
        assert!(!matches_exact(key, "a"));
    }

    #[test]
    fn test_load_reads_datasets_and_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("label_dataset")).unwrap();
        fs::write(
            dir.path().join("label_dataset").join("index.json"),
            r#"[{"category":"beverage","file_paths":["label_dataset/a.jpg","label_dataset/b.jpg"],"fields":{"brand":"Frooti"}}]"#,
        )
        .unwrap();

        let bank = QuestionBank::load(dir.path()).unwrap();
        let labels = bank.questions_for(QuizKind::LabelReading, None);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].media_refs.len(), 2);
        assert!(bank.questions_for(QuizKind::PhotoIdentification, None).is_empty());
        assert!(!bank.questions_for(QuizKind::Scenario, None).is_empty());
    }

    #[test]
    fn test_load_rejects_malformed_dataset() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("photo_identification.json"), "{not json").unwrap();
        assert!(QuestionBank::load(dir.path()).is_err());
    }
}
