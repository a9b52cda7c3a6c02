//! Session Orchestrator
//!
//! Drives one candidate turn end to end: serializes turns per session, runs
//! the guided menus for menu-driven channels, then runs a bounded ReAct loop
//! against the language model with the assessment tools. Tool effects land on
//! a staged copy of the session that is committed only when the turn
//! succeeds. Collaborator failures are retried and, when they persist,
//! turned into an apologetic reply instead of an error.

use crate::candidate::InteractionAction;
use crate::classifier::{TurnClassifier, TurnOutcome, TurnStatus};
use crate::evaluator::{AnswerEvaluator, NormalizedEvaluator};
use crate::llm_client::{LLMAction, LLMClient, system_message, user_message};
use crate::media::{InboundMedia, InlineImage, MediaLoader, MediaResolver, ResolvedMedia};
use crate::menu::{self, MenuStep};
use crate::prompt::{self, PromptSet};
use crate::question_bank::QuestionBank;
use crate::retry::{CollaboratorFailure, FailureClass, RetryPolicy, call_with_retry};
use crate::session::{FlowStage, ProfileStore, ProgressRecord, Session, SessionLocks, SessionStore};
use crate::tools::{AssessmentTools, ProfileEffect, tool_definitions};
use crate::verdict::{CompetencyTable, VerdictResult, calculate_verdict};
use anyhow::Context;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestToolMessageArgs, ChatCompletionTool,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const BUDGET_EXCEEDED_REPLY: &str =
    "Sorry, I got stuck working that out. Could you send your last message again?";
const IMAGE_UNAVAILABLE_NOTE: &str = "(The image for this question is unavailable right now.)";
const IMAGE_NOT_LOADED_NOTE: &str = "(The candidate attached an image that could not be loaded.)";

/// Failures while handling a turn.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("collaborator failed after {attempts} attempt(s): {message}")]
    TransientCollaborator {
        class: FailureClass,
        attempts: u32,
        message: String,
    },
    #[error("collaborator failed: {message}")]
    NonTransientCollaborator { message: String },
    #[error("turn exceeded the limit of {limit} tool calls")]
    TurnBudgetExceeded { limit: usize },
    #[error("session store failure: {0:#}")]
    Store(anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<CollaboratorFailure> for TurnError {
    fn from(failure: CollaboratorFailure) -> Self {
        if failure.class.is_transient() {
            TurnError::TransientCollaborator {
                class: failure.class,
                attempts: failure.attempts,
                message: failure.message,
            }
        } else {
            TurnError::NonTransientCollaborator {
                message: failure.message,
            }
        }
    }
}

impl TurnError {
    /// The failure class reported to the candidate for this error.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            TurnError::TransientCollaborator { class, .. } => *class,
            _ => FailureClass::NonTransient,
        }
    }

    pub fn reply_text(&self) -> String {
        match self {
            TurnError::TurnBudgetExceeded { .. } => BUDGET_EXCEEDED_REPLY.to_string(),
            other => other.failure_class().reply_text(),
        }
    }
}

/// The channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Chat,
    WhatsApp,
    Rpc,
}

impl Channel {
    /// Menu-driven channels run the guided flow before the model is involved.
    pub fn is_guided(self) -> bool {
        matches!(self, Channel::WhatsApp)
    }
}

/// A candidate message, already normalized by its channel adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub session_key: String,
    /// Stable user identity for the profile store. Defaults to the session key.
    pub user_id: Option<String>,
    pub channel: Channel,
    pub text: String,
    pub media: Vec<InboundMedia>,
}

/// The orchestrator's answer to one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReply {
    pub status: TurnStatus,
    /// Reply text with control markers removed.
    pub text: String,
    /// Reply text with image annotations removed as well, for channels that
    /// deliver `media` as attachments.
    pub display_text: String,
    pub media: Vec<ResolvedMedia>,
    pub stage: FlowStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
}

impl TurnReply {
    /// A text-only reply that waits for the candidate.
    pub fn plain(text: String, stage: FlowStage, failure: Option<FailureClass>) -> Self {
        Self {
            status: TurnStatus::InputRequired,
            display_text: text.clone(),
            text,
            media: Vec::new(),
            stage,
            failure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on tool calls within one turn.
    pub max_tool_calls: usize,
    /// Number of past interactions replayed to the model.
    pub history_window: usize,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 8,
            history_window: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// The collaborators an orchestrator is built from.
pub struct OrchestratorParts {
    pub llm: Arc<dyn LLMClient>,
    pub sessions: Arc<dyn SessionStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub resolver: Arc<dyn MediaResolver>,
    pub bank: Arc<QuestionBank>,
    pub competency: Arc<CompetencyTable>,
    pub prompts: Arc<PromptSet>,
}

pub struct SessionOrchestrator {
    llm: Arc<dyn LLMClient>,
    sessions: Arc<dyn SessionStore>,
    profiles: Arc<dyn ProfileStore>,
    resolver: Arc<dyn MediaResolver>,
    evaluator: Arc<dyn AnswerEvaluator>,
    bank: Arc<QuestionBank>,
    competency: Arc<CompetencyTable>,
    prompts: Arc<PromptSet>,
    loader: MediaLoader,
    locks: SessionLocks,
    config: OrchestratorConfig,
}

impl SessionOrchestrator {
    pub fn new(parts: OrchestratorParts, config: OrchestratorConfig) -> Self {
        Self {
            llm: parts.llm,
            sessions: parts.sessions,
            profiles: parts.profiles,
            resolver: parts.resolver,
            evaluator: Arc::new(NormalizedEvaluator),
            bank: parts.bank,
            competency: parts.competency,
            prompts: parts.prompts,
            loader: MediaLoader::default(),
            locks: SessionLocks::default(),
            config,
        }
    }

    /// Replaces the default answer evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn AnswerEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_media_loader(mut self, loader: MediaLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn competency(&self) -> &CompetencyTable {
        &self.competency
    }

    /// The stored session for `key`, if any.
    pub async fn session(&self, key: &str) -> Result<Option<Session>, TurnError> {
        self.sessions.load(key).await.map_err(TurnError::Store)
    }

    /// The current verdict for the session's candidate.
    pub async fn verdict(&self, key: &str) -> Result<Option<VerdictResult>, TurnError> {
        Ok(self.session(key).await?.map(|session| {
            calculate_verdict(
                session.candidate.assessment_history(),
                &self.competency,
                session.candidate.target_role(),
            )
        }))
    }

    /// Handles one candidate message and returns the reply.
    ///
    /// Collaborator failures and runaway tool loops produce a reply with
    /// `failure` set rather than an error; only session-store failures are
    /// returned as `Err`.
    #[instrument(skip_all, fields(session_key = %inbound.session_key, channel = ?inbound.channel))]
    pub async fn handle_turn(&self, inbound: InboundMessage) -> Result<TurnReply, TurnError> {
        let _turn = self.locks.acquire(&inbound.session_key).await;
        let user_id = inbound
            .user_id
            .clone()
            .unwrap_or_else(|| inbound.session_key.clone());
        let (mut session, created) = self
            .sessions
            .get_or_create(&inbound.session_key, &user_id)
            .await
            .map_err(TurnError::Store)?;
        if created {
            info!(user_id = %user_id, "New session created");
        }
        let text = inbound.text.trim();

        if inbound.channel.is_guided() {
            let saved_role = if session.stage == FlowStage::New {
                self.saved_role(&session.user_id).await
            } else {
                None
            };
            let role_before = session.candidate.target_role().map(str::to_owned);
            let step = menu::step(&mut session, text, saved_role, &self.competency);

            let mut effects = Vec::new();
            if let Some(role) = session.candidate.target_role() {
                if role_before.as_deref() != Some(role) {
                    effects.push(ProfileEffect::RoleSelected(role.to_string()));
                }
            }
            match step {
                MenuStep::Reply(reply) => {
                    return self.finish_menu_turn(session, text, reply, effects).await;
                }
                MenuStep::Forward(prompt_text) => {
                    return self
                        .run_agent_turn(session, text, &prompt_text, &inbound.media, effects)
                        .await;
                }
                MenuStep::Pass => {}
            }
        }

        self.run_agent_turn(session, text, text, &inbound.media, Vec::new())
            .await
    }

    async fn finish_menu_turn(
        &self,
        mut session: Session,
        text: &str,
        reply: String,
        effects: Vec<ProfileEffect>,
    ) -> Result<TurnReply, TurnError> {
        debug!(stage = ?session.stage, "Menu turn");
        session
            .candidate
            .record_interaction(InteractionAction::UserQuery, json!({ "query": text }));
        session
            .candidate
            .record_interaction(InteractionAction::AgentResponse, json!({ "response": reply }));
        self.sessions.save(&session).await.map_err(TurnError::Store)?;
        self.apply_effects(&session.user_id, effects).await;
        Ok(TurnReply::plain(reply, session.stage, None))
    }

    async fn run_agent_turn(
        &self,
        session: Session,
        recorded_text: &str,
        prompt_text: &str,
        media: &[InboundMedia],
        mut effects: Vec<ProfileEffect>,
    ) -> Result<TurnReply, TurnError> {
        let image = self.load_image(media).await;
        let prompt_text = if !media.is_empty() && image.is_none() {
            format!("{prompt_text}\n\n{IMAGE_NOT_LOADED_NOTE}")
        } else {
            prompt_text.to_string()
        };

        let mut staged = session.clone();
        staged.candidate.record_interaction(
            InteractionAction::UserQuery,
            json!({ "query": recorded_text, "image_provided": image.is_some() }),
        );
        staged.refresh_stage(&self.competency);

        match self
            .react_loop(&mut staged, &prompt_text, image.as_ref(), &mut effects)
            .await
        {
            Ok(raw_reply) => {
                let outcome = TurnClassifier::classify(&raw_reply);
                staged.candidate.record_interaction(
                    InteractionAction::AgentResponse,
                    json!({ "response": outcome.clean_text }),
                );
                staged.refresh_stage(&self.competency);
                self.sessions.save(&staged).await.map_err(TurnError::Store)?;
                self.apply_effects(&staged.user_id, effects).await;
                info!(status = ?outcome.status, stage = ?staged.stage, "Turn completed");
                Ok(self.build_reply(outcome, staged.stage))
            }
            Err(error) => {
                self.fail_turn(session, recorded_text, image.is_some(), error)
                    .await
            }
        }
    }

    /// Runs the model until it answers with text, executing tool calls on
    /// `staged` in between.
    async fn react_loop(
        &self,
        staged: &mut Session,
        user_text: &str,
        image: Option<&InlineImage>,
        effects: &mut Vec<ProfileEffect>,
    ) -> Result<String, TurnError> {
        let template = if staged.stage == FlowStage::Practice {
            &self.prompts.practice
        } else {
            &self.prompts.assessment
        };
        let system_prompt = prompt::render(template, staged, &self.competency)?;
        let tools = tool_definitions(staged.stage)?;

        let mut messages = vec![system_message(&system_prompt).context("failed to build system message")?];
        messages.extend(self.history_messages(staged)?);
        messages.push(user_message(user_text, image).context("failed to build user message")?);

        let mut tool_calls_used = 0usize;
        loop {
            match self.decide(&messages, &tools).await? {
                LLMAction::TextResponse(text) => return Ok(text),
                LLMAction::ToolCall(calls) => {
                    tool_calls_used += calls.len();
                    if tool_calls_used > self.config.max_tool_calls {
                        return Err(TurnError::TurnBudgetExceeded {
                            limit: self.config.max_tool_calls,
                        });
                    }

                    messages.push(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .tool_calls(calls.clone())
                            .build()
                            .context("failed to build assistant tool-call message")?
                            .into(),
                    );
                    let mut tools_exec = AssessmentTools {
                        session: &mut *staged,
                        bank: &self.bank,
                        competency: &self.competency,
                        evaluator: self.evaluator.as_ref(),
                        effects: &mut *effects,
                    };
                    for call in &calls {
                        let output = tools_exec.dispatch(&call.function.name, &call.function.arguments);
                        messages.push(
                            ChatCompletionRequestToolMessageArgs::default()
                                .tool_call_id(call.id.clone())
                                .content(output)
                                .build()
                                .context("failed to build tool result message")?
                                .into(),
                        );
                    }
                }
            }
        }
    }

    async fn decide(
        &self,
        messages: &[ChatCompletionRequestMessage],
        tools: &[ChatCompletionTool],
    ) -> Result<LLMAction, TurnError> {
        call_with_retry(&self.config.retry, "llm.decide_action", || {
            self.llm.decide_action(messages.to_vec(), tools.to_vec())
        })
        .await
        .map_err(TurnError::from)
    }

    /// Replays recent interactions, excluding the message being handled.
    fn history_messages(&self, session: &Session) -> Result<Vec<ChatCompletionRequestMessage>, TurnError> {
        let recent = session
            .candidate
            .recent_interactions(self.config.history_window + 1);
        let past = &recent[..recent.len().saturating_sub(1)];
        past.iter()
            .filter_map(|entry| match entry.action {
                InteractionAction::UserQuery => entry
                    .payload
                    .get("query")
                    .and_then(|v| v.as_str())
                    .map(|text| user_message(text, None)),
                InteractionAction::AgentResponse => {
                    entry.payload.get("response").and_then(|v| v.as_str()).map(|text| {
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(text)
                            .build()
                            .map(Into::into)
                    })
                }
            })
            .map(|message| message.context("failed to build history message").map_err(TurnError::from))
            .collect()
    }

    async fn fail_turn(
        &self,
        mut session: Session,
        text: &str,
        image_provided: bool,
        error: TurnError,
    ) -> Result<TurnReply, TurnError> {
        if let TurnError::Store(_) = error {
            return Err(error);
        }
        warn!(error = %error, "Turn failed, staged changes discarded");
        let reply = error.reply_text();
        session.candidate.record_interaction(
            InteractionAction::UserQuery,
            json!({ "query": text, "image_provided": image_provided }),
        );
        session.candidate.record_interaction(
            InteractionAction::AgentResponse,
            json!({ "response": reply, "error": error.to_string() }),
        );
        session.refresh_stage(&self.competency);
        self.sessions.save(&session).await.map_err(TurnError::Store)?;
        Ok(TurnReply::plain(
            reply,
            session.stage,
            Some(error.failure_class()),
        ))
    }

    fn build_reply(&self, outcome: TurnOutcome, stage: FlowStage) -> TurnReply {
        let mut unavailable = false;
        let media: Vec<ResolvedMedia> = outcome
            .media_refs
            .iter()
            .filter_map(|media_ref| match self.resolver.resolve(media_ref) {
                Ok(resolved) => Some(resolved),
                Err(e) => {
                    warn!(error = %e, "Media reference dropped");
                    unavailable = true;
                    None
                }
            })
            .collect();

        let mut text = outcome.clean_text.clone();
        let mut display_text = outcome.display_text();
        if unavailable {
            text = format!("{text}\n\n{IMAGE_UNAVAILABLE_NOTE}");
            display_text = format!("{display_text}\n\n{IMAGE_UNAVAILABLE_NOTE}");
        }
        TurnReply {
            status: outcome.status,
            text,
            display_text,
            media,
            stage,
            failure: None,
        }
    }

    async fn load_image(&self, media: &[InboundMedia]) -> Option<InlineImage> {
        let first = media.first()?;
        if media.len() > 1 {
            debug!(count = media.len(), "Only the first attached image is used");
        }
        match self.loader.load(first).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(error = %e, "Inbound media could not be loaded");
                None
            }
        }
    }

    async fn saved_role(&self, user_id: &str) -> Option<String> {
        match self.profiles.load_role(user_id).await {
            Ok(role) => role,
            Err(e) => {
                warn!(error = %e, "Failed to load saved role");
                None
            }
        }
    }

    /// Profile writes are best effort; the committed session is the source
    /// of truth for the turn.
    async fn apply_effects(&self, user_id: &str, effects: Vec<ProfileEffect>) {
        for effect in effects {
            let result = match &effect {
                ProfileEffect::RoleSelected(role) => self.profiles.save_role(user_id, role).await,
                ProfileEffect::Progress {
                    skill,
                    module_id,
                    status,
                } => {
                    let record = ProgressRecord {
                        skill: skill.clone(),
                        module_id: module_id.clone(),
                        status: *status,
                        updated_at: Utc::now(),
                    };
                    self.profiles.save_progress(user_id, &record).await
                }
            };
            if let Err(e) = result {
                warn!(error = %e, ?effect, "Failed to persist profile update");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{MockLLMClient, ToolCall};
    use crate::media::PublicUrlResolver;
    use crate::question_bank::{KnowledgeItem, LabelItem};
    use crate::quiz::QuizKind;
    use crate::session::{InMemoryProfileStore, InMemorySessionStore, ProgressStatus};
    use anyhow::anyhow;
    use async_openai::types::{ChatCompletionToolType, FunctionCall};
    use mockall::Sequence;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            r#type: ChatCompletionToolType::Function,
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    fn competency() -> CompetencyTable {
        serde_json::from_value(json!({
            "roles": {
                "Warehouse Picker": {
                    "required_skills": ["Label Reading"],
                    "passing_thresholds": { "Label Reading": { "min_accuracy": 60 } },
                    "assessment_plan": ["label_reading"]
                },
                "Fitter": {
                    "required_skills": ["Technical Knowledge"],
                    "assessment_plan": ["knowledge"]
                }
            }
        }))
        .unwrap()
    }

    fn bank() -> QuestionBank {
        let labels = vec![
            LabelItem {
                category: Some("grocery".into()),
                file_path: None,
                file_paths: vec![
                    "label_dataset/samples/salt_front.jpg".into(),
                    "label_dataset/samples/salt_back.jpg".into(),
                ],
                fields: BTreeMap::from([
                    ("product".into(), "Salt".into()),
                    ("brand".into(), "Tata".into()),
                    ("net_weight".into(), "1 kg".into()),
                ]),
            },
        ];
        let knowledge = BTreeMap::from([(
            "fitter".to_string(),
            vec![KnowledgeItem {
                question: "Which tool is used for tightening nuts and bolts?".into(),
                answer: "Spanner".into(),
            }],
        )]);
        QuestionBank::new(labels, Vec::new(), knowledge, Vec::new())
    }

    struct Harness {
        orchestrator: SessionOrchestrator,
        sessions: Arc<InMemorySessionStore>,
        profiles: Arc<InMemoryProfileStore>,
    }

    fn harness(llm: MockLLMClient) -> Harness {
        let sessions = Arc::new(InMemorySessionStore::default());
        let profiles = Arc::new(InMemoryProfileStore::default());
        let prompts = PromptSet {
            assessment: "You assess candidates for {available_roles}.".into(),
            practice: "You help candidates practice.".into(),
        };
        let config = OrchestratorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                factor: 2.0,
                max_delay: Duration::from_millis(4),
                call_timeout: Duration::from_secs(5),
            },
            ..OrchestratorConfig::default()
        };
        let orchestrator = SessionOrchestrator::new(
            OrchestratorParts {
                llm: Arc::new(llm),
                sessions: sessions.clone(),
                profiles: profiles.clone(),
                resolver: Arc::new(PublicUrlResolver::new("https://assess.example.org")),
                bank: Arc::new(bank()),
                competency: Arc::new(competency()),
                prompts: Arc::new(prompts),
            },
            config,
        );
        Harness {
            orchestrator,
            sessions,
            profiles,
        }
    }

    fn chat(key: &str, text: &str) -> InboundMessage {
        InboundMessage {
            session_key: key.to_string(),
            user_id: Some(format!("user-{key}")),
            channel: Channel::Chat,
            text: text.to_string(),
            media: Vec::new(),
        }
    }

    fn whatsapp(key: &str, text: &str) -> InboundMessage {
        InboundMessage {
            channel: Channel::WhatsApp,
            ..chat(key, text)
        }
    }

    fn expect_tool(
        llm: &mut MockLLMClient,
        seq: &mut Sequence,
        id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) {
        let call = tool_call(id, name, arguments);
        llm.expect_decide_action()
            .times(1)
            .in_sequence(seq)
            .returning(move |_, _| Ok(LLMAction::ToolCall(vec![call.clone()])));
    }

    fn expect_text(llm: &mut MockLLMClient, seq: &mut Sequence, text: &str) {
        let text = text.to_string();
        llm.expect_decide_action()
            .times(1)
            .in_sequence(seq)
            .returning(move |_, _| Ok(LLMAction::TextResponse(text.clone())));
    }

    #[tokio::test]
    async fn test_label_quiz_scores_two_of_three() {
        let mut llm = MockLLMClient::new();
        let mut seq = Sequence::new();
        expect_tool(&mut llm, &mut seq, "c1", "update_candidate_role", json!({"role": "Warehouse Picker"}));
        expect_tool(&mut llm, &mut seq, "c2", "start_quiz", json!({}));
        expect_text(
            &mut llm,
            &mut seq,
            "Let's begin!\nLooking at [Image: label_dataset/samples/salt_front.jpg] [Image: label_dataset/samples/salt_back.jpg] - Question 1/3: What is the product?\n[STATUS:input_required]",
        );
        for (i, answer) in ["Salt", "Nestle", "1 KG"].iter().enumerate() {
            expect_tool(&mut llm, &mut seq, &format!("a{i}"), "answer_quiz_question", json!({"answer": answer}));
            expect_text(&mut llm, &mut seq, "Noted. [STATUS:input_required]");
        }
        let h = harness(llm);

        let first = h
            .orchestrator
            .handle_turn(chat("s1", "I want a warehouse picker job"))
            .await
            .unwrap();
        assert_eq!(first.status, TurnStatus::InputRequired);
        assert_eq!(first.media.len(), 2);
        assert_eq!(
            first.media[0].url,
            "https://assess.example.org/label-media/samples/salt_front.jpg"
        );
        assert_eq!(
            first.display_text,
            "Let's begin!\nQuestion 1/3: What is the product?"
        );

        for answer in ["Salt", "Nestle", "1 KG"] {
            h.orchestrator.handle_turn(chat("s1", answer)).await.unwrap();
        }

        let session = h.sessions.load("s1").await.unwrap().unwrap();
        let history = session.candidate.assessment_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].skill, "Label Reading");
        assert_eq!(history[0].score, 66.67);
        assert_eq!(session.stage, FlowStage::AssessmentComplete);

        let verdict = h.orchestrator.verdict("s1").await.unwrap().unwrap();
        assert!(verdict.overall_pass);

        let progress = h.profiles.load_progress("user-s1").await.unwrap();
        assert_eq!(progress[0].status, ProgressStatus::Completed);
        assert_eq!(
            h.profiles.load_role("user-s1").await.unwrap().as_deref(),
            Some("Warehouse Picker")
        );
    }

    #[tokio::test]
    async fn test_overloaded_model_is_retried_then_apologises() {
        let mut llm = MockLLMClient::new();
        llm.expect_decide_action()
            .times(3)
            .returning(|_, _| Err(anyhow!("503 overloaded")));
        let h = harness(llm);

        let reply = h.orchestrator.handle_turn(chat("s2", "hello")).await.unwrap();
        assert_eq!(reply.failure, Some(FailureClass::Overloaded));
        assert!(reply.text.starts_with("The assessment service is busy right now."));

        let session = h.sessions.load("s2").await.unwrap().unwrap();
        assert_eq!(session.candidate.interaction_history().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_turn_discards_tool_effects() {
        let mut llm = MockLLMClient::new();
        let mut seq = Sequence::new();
        expect_tool(&mut llm, &mut seq, "c1", "update_candidate_role", json!({"role": "Fitter"}));
        llm.expect_decide_action()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(anyhow!("invalid request")));
        let h = harness(llm);

        let reply = h.orchestrator.handle_turn(chat("s3", "I'm a fitter")).await.unwrap();
        assert_eq!(reply.failure, Some(FailureClass::NonTransient));

        let session = h.sessions.load("s3").await.unwrap().unwrap();
        assert!(!session.candidate.role_identified());
        assert!(h.profiles.load_role("user-s3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tool_loop_is_bounded() {
        let mut llm = MockLLMClient::new();
        llm.expect_decide_action()
            .times(9)
            .returning(|_, _| Ok(LLMAction::ToolCall(vec![tool_call("x", "get_quiz_status", json!({}))])));
        let h = harness(llm);

        let reply = h.orchestrator.handle_turn(chat("s4", "hi")).await.unwrap();
        assert_eq!(reply.text, BUDGET_EXCEEDED_REPLY);
        assert_eq!(reply.failure, Some(FailureClass::NonTransient));
    }

    #[tokio::test]
    async fn test_answer_without_active_quiz_reaches_model_as_error() {
        let mut llm = MockLLMClient::new();
        let mut seq = Sequence::new();
        expect_tool(&mut llm, &mut seq, "c1", "answer_quiz_question", json!({"answer": "b"}));
        llm.expect_decide_action()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|messages, _| {
                matches!(
                    messages.last(),
                    Some(ChatCompletionRequestMessage::Tool(tool))
                        if format!("{:?}", tool.content).contains("no quiz is active")
                )
            })
            .returning(|_, _| Ok(LLMAction::TextResponse("There is no quiz running yet.".into())));
        let h = harness(llm);

        let reply = h.orchestrator.handle_turn(chat("s5", "b")).await.unwrap();
        assert_eq!(reply.text, "There is no quiz running yet.");
        assert!(reply.failure.is_none());
    }

    #[tokio::test]
    async fn test_completion_marker_sets_completed_status() {
        let mut llm = MockLLMClient::new();
        llm.expect_decide_action()
            .times(1)
            .returning(|_, _| Ok(LLMAction::TextResponse("Thanks, that's everything! [STATUS:completed]".into())));
        let h = harness(llm);

        let reply = h.orchestrator.handle_turn(chat("s6", "bye")).await.unwrap();
        assert_eq!(reply.status, TurnStatus::Completed);
        assert_eq!(reply.text, "Thanks, that's everything!");
    }

    #[tokio::test]
    async fn test_unresolvable_media_degrades_to_note() {
        let mut llm = MockLLMClient::new();
        llm.expect_decide_action().times(1).returning(|_, _| {
            Ok(LLMAction::TextResponse(
                "Looking at [Image: /tmp/private.jpg] - Question 1/1: What is the brand?".into(),
            ))
        });
        let h = harness(llm);

        let reply = h.orchestrator.handle_turn(chat("s7", "ready")).await.unwrap();
        assert!(reply.media.is_empty());
        assert!(reply.text.ends_with(IMAGE_UNAVAILABLE_NOTE));
    }

    #[tokio::test]
    async fn test_guided_menus_run_without_model_then_forward() {
        let mut llm = MockLLMClient::new();
        let mut seq = Sequence::new();
        expect_tool(&mut llm, &mut seq, "c1", "start_quiz", json!({}));
        expect_text(
            &mut llm,
            &mut seq,
            "Question 1/1: Which tool is used for tightening nuts and bolts? [STATUS:input_required]",
        );
        let h = harness(llm);

        let welcome = h.orchestrator.handle_turn(whatsapp("w1", "hi")).await.unwrap();
        assert!(welcome.text.contains("1. Fitter\n2. Warehouse Picker"));
        h.orchestrator.handle_turn(whatsapp("w1", "fitter")).await.unwrap();
        h.orchestrator.handle_turn(whatsapp("w1", "2")).await.unwrap();
        let started = h.orchestrator.handle_turn(whatsapp("w1", "2")).await.unwrap();

        assert_eq!(started.stage, FlowStage::AssessmentInProgress);
        assert!(started.text.contains("tightening nuts and bolts"));
        let session = h.sessions.load("w1").await.unwrap().unwrap();
        assert_eq!(session.quiz.active().map(|q| q.kind()), Some(QuizKind::Knowledge));
        assert_eq!(
            h.profiles.load_role("user-w1").await.unwrap().as_deref(),
            Some("Fitter")
        );
    }

    #[tokio::test]
    async fn test_returning_whatsapp_user_gets_saved_role() {
        let h = harness(MockLLMClient::new());
        h.profiles.save_role("user-w2", "Fitter").await.unwrap();

        let reply = h.orchestrator.handle_turn(whatsapp("w2", "hello")).await.unwrap();
        assert!(reply.text.starts_with("Welcome back! You're preparing for the Fitter role."));
        assert_eq!(reply.stage, FlowStage::ActivitySelection);
    }
}
