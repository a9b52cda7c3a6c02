//! API Models
//!
//! Request and response bodies for the REST API, with `utoipa` schemas for
//! the OpenAPI document. Core types without a schema of their own are
//! documented as plain objects or strings.

use assessor_core::classifier::TurnStatus;
use assessor_core::media::{InboundMedia, ResolvedMedia};
use assessor_core::orchestrator::TurnReply;
use assessor_core::quiz::QuizKind;
use assessor_core::retry::FailureClass;
use assessor_core::session::{AssessmentTrack, FlowStage, Session};
use assessor_core::verdict::VerdictResult;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// An image attached to a chat message: a URI, or base64 bytes.
#[derive(Deserialize, ToSchema, Debug, Clone)]
pub struct ChatMedia {
    #[schema(example = "https://example.org/photos/site.jpg")]
    pub uri: Option<String>,
    /// Base64-encoded image bytes.
    pub data: Option<String>,
    #[schema(example = "image/jpeg")]
    pub mime_type: Option<String>,
}

impl ChatMedia {
    pub fn into_inbound(self) -> Result<InboundMedia, String> {
        if let Some(data) = self.data {
            let bytes = STANDARD
                .decode(data.trim())
                .map_err(|e| format!("media data is not valid base64: {e}"))?;
            return Ok(InboundMedia::Bytes {
                data: bytes,
                mime_type: self.mime_type,
            });
        }
        self.uri
            .map(InboundMedia::Uri)
            .ok_or_else(|| "media needs either 'uri' or 'data'".to_string())
    }
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct ChatRequest {
    #[schema(example = "web-7f3a")]
    pub session_key: String,
    #[schema(example = "I'm looking for work as an electrician")]
    pub text: String,
    /// Stable user id for saved roles and progress. Defaults to the session key.
    pub user_id: Option<String>,
    #[serde(default)]
    pub media: Vec<ChatMedia>,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct ChatResponse {
    #[schema(value_type = String, example = "input_required")]
    pub status: TurnStatus,
    pub text: String,
    pub display_text: String,
    #[schema(value_type = Vec<Object>)]
    pub media: Vec<ResolvedMedia>,
    #[schema(value_type = String, example = "ASSESSMENT_IN_PROGRESS")]
    pub stage: FlowStage,
    #[schema(value_type = Option<String>, example = "overloaded")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
}

impl From<TurnReply> for ChatResponse {
    fn from(reply: TurnReply) -> Self {
        Self {
            status: reply.status,
            text: reply.text,
            display_text: reply.display_text,
            media: reply.media,
            stage: reply.stage,
            failure: reply.failure,
        }
    }
}

/// A read-only view of a stored session.
#[derive(Serialize, ToSchema, Debug)]
pub struct SessionView {
    pub session_key: String,
    pub user_id: String,
    #[schema(value_type = String, example = "ROLE_PENDING")]
    pub stage: FlowStage,
    #[schema(value_type = String, example = "technical")]
    pub track: AssessmentTrack,
    #[schema(value_type = Vec<String>)]
    pub plan: Vec<QuizKind>,
    /// The candidate record: role, skill levels, histories.
    #[schema(value_type = Object)]
    pub candidate: Value,
    #[schema(value_type = Option<Object>)]
    pub quiz: Option<Value>,
}

impl SessionView {
    pub fn from_session(session: &Session) -> Result<Self, serde_json::Error> {
        Ok(Self {
            session_key: session.key.clone(),
            user_id: session.user_id.clone(),
            stage: session.stage,
            track: session.track,
            plan: session.plan.clone(),
            candidate: serde_json::to_value(&session.candidate)?,
            quiz: session.quiz.engine().map(|engine| {
                serde_json::json!({
                    "kind": engine.kind(),
                    "active": engine.is_active(),
                    "score": engine.score(),
                    "answered": engine.results().len(),
                    "total": engine.total(),
                    "current_question": engine.current_view().map(|v| v.render()),
                })
            }),
        })
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct VerdictResponse {
    pub session_key: String,
    pub role: Option<String>,
    #[schema(value_type = Object)]
    pub verdict: VerdictResult,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_request_deserialization() {
        let json = r#"{"session_key": "web-1", "text": "hello"}"#;
        let request: ChatRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.session_key, "web-1");
        assert_eq!(request.text, "hello");
        assert!(request.user_id.is_none());
        assert!(request.media.is_empty());
    }

    #[test]
    fn test_chat_media_conversion() {
        let inline = ChatMedia {
            uri: None,
            data: Some("aGVsbG8=".into()),
            mime_type: Some("image/png".into()),
        };
        assert_eq!(
            inline.into_inbound().unwrap(),
            InboundMedia::Bytes {
                data: b"hello".to_vec(),
                mime_type: Some("image/png".into())
            }
        );

        let linked = ChatMedia {
            uri: Some("https://example.org/a.jpg".into()),
            data: None,
            mime_type: None,
        };
        assert_eq!(
            linked.into_inbound().unwrap(),
            InboundMedia::Uri("https://example.org/a.jpg".into())
        );

        let empty = ChatMedia {
            uri: None,
            data: None,
            mime_type: None,
        };
        assert!(empty.into_inbound().is_err());
    }

    #[test]
    fn test_chat_response_omits_missing_failure() {
        let response = ChatResponse {
            status: TurnStatus::Completed,
            text: "Done".into(),
            display_text: "Done".into(),
            media: Vec::new(),
            stage: FlowStage::AssessmentComplete,
            failure: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "completed",
                "text": "Done",
                "display_text": "Done",
                "media": [],
                "stage": "ASSESSMENT_COMPLETE",
            })
        );
    }

    #[test]
    fn test_session_view_from_session() {
        let mut session = Session::new("web-1", "u1");
        session.candidate.update_role("Fitter");
        let view = SessionView::from_session(&session).unwrap();

        assert_eq!(view.session_key, "web-1");
        assert_eq!(view.stage, FlowStage::New);
        assert!(view.quiz.is_none());
        assert_eq!(view.candidate["target_role"], "Fitter");
    }
}
