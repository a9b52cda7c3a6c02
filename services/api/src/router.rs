//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the channel endpoints, the chat WebSocket, static media and the
//! OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ChatMedia, ChatRequest, ChatResponse, ErrorResponse, HealthResponse, SessionView,
        VerdictResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use assessor_core::media::{LABEL_MEDIA_MOUNT, PHOTO_MEDIA_MOUNT};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Folder under the data path that holds the label images.
const LABEL_DATASET_DIR: &str = "label_dataset";

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::chat,
        handlers::whatsapp_webhook,
        handlers::a2a,
        handlers::get_session,
        handlers::get_verdict,
        handlers::health,
    ),
    components(
        schemas(ChatRequest, ChatMedia, ChatResponse, SessionView, VerdictResponse, HealthResponse, ErrorResponse)
    ),
    tags(
        (name = "Assessor API", description = "Conversational skills assessment for job candidates")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let data_path = app_state.config.data_path.clone();

    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/chat", post(handlers::chat))
        .route("/webhooks/whatsapp", post(handlers::whatsapp_webhook))
        .route("/a2a", post(handlers::a2a))
        .route("/sessions/{key}", get(handlers::get_session))
        .route("/sessions/{key}/verdict", get(handlers::get_verdict))
        .route("/health", get(handlers::health))
        .route("/ws", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    let media_router = Router::new()
        .nest_service(
            &format!("/{LABEL_MEDIA_MOUNT}"),
            ServeDir::new(data_path.join(LABEL_DATASET_DIR)),
        )
        .nest_service(
            &format!("/{PHOTO_MEDIA_MOUNT}"),
            ServeDir::new(data_path.join(PHOTO_MEDIA_MOUNT)),
        );

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
        .merge(media_router)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Provider};
    use anyhow::Result;
    use assessor_core::llm_client::{LLMAction, LLMClient};
    use assessor_core::media::PublicUrlResolver;
    use assessor_core::orchestrator::{OrchestratorConfig, OrchestratorParts, SessionOrchestrator};
    use assessor_core::prompt::PromptSet;
    use assessor_core::retry::FailureClass;
    use assessor_core::question_bank::QuestionBank;
    use assessor_core::session::{
        FlowStage, InMemoryProfileStore, InMemorySessionStore, Session, SessionStore,
    };
    use assessor_core::verdict::CompetencyTable;
    use async_openai::types::{ChatCompletionRequestMessage, ChatCompletionTool};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;
    use tracing::Level;

    /// Always answers with the same text.
    struct FixedReply(&'static str);

    #[async_trait]
    impl LLMClient for FixedReply {
        async fn decide_action(
            &self,
            _messages: Vec<ChatCompletionRequestMessage>,
            _tools: Vec<ChatCompletionTool>,
        ) -> Result<LLMAction> {
            Ok(LLMAction::TextResponse(self.0.to_string()))
        }
    }

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:5000".parse().unwrap(),
            database_url: "sqlite::memory:".to_string(),
            provider: Provider::OpenAI,
            openai_api_key: Some("test".to_string()),
            gemini_api_key: None,
            chat_model: "gpt-4o".to_string(),
            log_level: Level::INFO,
            prompts_path: PathBuf::from("./prompts"),
            data_path: PathBuf::from("./data"),
            public_base_url: "https://assess.example.org".to_string(),
            max_tool_calls: 8,
            llm_max_attempts: 1,
            llm_base_delay: Duration::from_millis(1),
            llm_backoff_factor: 2.0,
            llm_max_delay: Duration::from_millis(1),
            llm_timeout: Duration::from_secs(5),
        }
    }

    /// Serves stored sessions but fails every write.
    struct ReadOnlySessions(InMemorySessionStore);

    #[async_trait]
    impl SessionStore for ReadOnlySessions {
        async fn load(&self, key: &str) -> Result<Option<Session>> {
            self.0.load(key).await
        }

        async fn save(&self, _session: &Session) -> Result<()> {
            anyhow::bail!("database is locked")
        }
    }

    fn app(reply: &'static str) -> Router {
        create_router(app_state(reply, Arc::new(InMemorySessionStore::default())))
    }

    fn app_state(reply: &'static str, sessions: Arc<dyn SessionStore>) -> Arc<AppState> {
        let config = test_config();
        let competency: CompetencyTable = serde_json::from_value(json!({
            "roles": {
                "Electrician": { "required_skills": ["Technical Knowledge"] },
                "Fitter": { "required_skills": ["Scenario Judgement"] }
            }
        }))
        .unwrap();
        let orchestrator = SessionOrchestrator::new(
            OrchestratorParts {
                llm: Arc::new(FixedReply(reply)),
                sessions,
                profiles: Arc::new(InMemoryProfileStore::default()),
                resolver: Arc::new(PublicUrlResolver::new(config.public_base_url.clone())),
                bank: Arc::new(QuestionBank::builtin()),
                competency: Arc::new(competency),
                prompts: Arc::new(PromptSet {
                    assessment: "Assess the candidate.".to_string(),
                    practice: "Help the candidate practice.".to_string(),
                }),
            },
            OrchestratorConfig {
                retry: config.retry_policy(),
                ..OrchestratorConfig::default()
            },
        );
        Arc::new(AppState {
            orchestrator: Arc::new(orchestrator),
            config: Arc::new(config),
        })
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app("hi")
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_chat_turn_then_session_view() {
        let app = app(
            "Looking at [Image: label_dataset/images/tea.jpg] - Question 1/3: What is the brand?\n[STATUS:input_required]",
        );
        let response = app
            .clone()
            .oneshot(json_request(
                "/chat",
                json!({ "session_key": "web-1", "text": "ready" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "input_required");
        assert_eq!(body["display_text"], "Question 1/3: What is the brand?");
        assert_eq!(
            body["media"][0]["url"],
            "https://assess.example.org/label-media/images/tea.jpg"
        );

        let response = app
            .oneshot(Request::get("/sessions/web-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(view["session_key"], "web-1");
        assert_eq!(
            view["candidate"]["interaction_history"].as_array().unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_session_key() {
        let response = app("hi")
            .oneshot(json_request("/chat", json!({ "session_key": " ", "text": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let response = app("hi")
            .oneshot(Request::get("/sessions/nobody/verdict").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_whatsapp_webhook_replies_with_role_menu() {
        let request = Request::post("/webhooks/whatsapp")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("From=whatsapp%3A%2B919876543210&Body=hi&NumMedia=0"))
            .unwrap();
        let response = app("unused").oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/xml"
        );
        let xml = body_string(response).await;
        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?><Response><Message><Body>"#));
        assert!(xml.contains("1. Electrician\n2. Fitter"));
    }

    #[tokio::test]
    async fn test_whatsapp_store_failure_keeps_stored_stage() {
        let seeded = InMemorySessionStore::default();
        let mut session = Session::new("whatsapp:+919876543210", "whatsapp:+919876543210");
        session.stage = FlowStage::RolePending;
        seeded.save(&session).await.unwrap();
        let state = app_state("unused", Arc::new(ReadOnlySessions(seeded)));

        let request = Request::post("/webhooks/whatsapp")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("From=whatsapp%3A%2B919876543210&Body=1&NumMedia=0"))
            .unwrap();
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let xml = body_string(response).await;
        assert!(xml.contains("I&apos;m having trouble processing your request."));

        let reply = handlers::whatsapp_failure_reply(&state, "whatsapp:+919876543210").await;
        assert_eq!(reply.stage, FlowStage::RolePending);
        assert_eq!(reply.failure, Some(FailureClass::NonTransient));

        let reply = handlers::whatsapp_failure_reply(&state, "whatsapp:+10000000000").await;
        assert_eq!(reply.stage, FlowStage::New);
    }

    #[tokio::test]
    async fn test_a2a_message_send_and_unknown_method() {
        let app = app("Thanks, your assessment is complete. [STATUS:completed]");
        let response = app
            .clone()
            .oneshot(json_request(
                "/a2a",
                json!({
                    "jsonrpc": "2.0",
                    "id": 7,
                    "method": "message/send",
                    "params": {
                        "message": {
                            "role": "user",
                            "contextId": "ctx-1",
                            "parts": [{ "kind": "text", "text": "done" }]
                        }
                    }
                }),
            ))
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["id"], 7);
        assert_eq!(body["result"]["status"]["state"], "completed");
        assert_eq!(
            body["result"]["artifacts"][0]["parts"][0]["text"],
            "Thanks, your assessment is complete."
        );

        let response = app
            .oneshot(json_request(
                "/a2a",
                json!({ "jsonrpc": "2.0", "id": 8, "method": "tasks/cancel", "params": {} }),
            ))
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"]["code"], -32601);
    }
}
