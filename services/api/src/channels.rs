//! Channel Adapters
//!
//! Normalizes what each channel delivers into an [`InboundMessage`] and
//! renders a [`TurnReply`] back into the channel's own format:
//!
//! - `whatsapp`: Twilio webhook form fields in, TwiML out.
//! - `a2a`: JSON-RPC `message/send` in, an A2A task object out.

use assessor_core::classifier::TurnStatus;
use assessor_core::media::InboundMedia;
use assessor_core::orchestrator::{Channel, InboundMessage, TurnReply};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

pub const WHATSAPP_PREFIX: &str = "whatsapp:";
pub const A2A_PREFIX: &str = "a2a:";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

// --- WhatsApp (Twilio) ---

/// Builds an inbound message from Twilio's webhook form fields.
///
/// The sender's number, without the `whatsapp:` prefix, is the stable user
/// id; the session key keeps the prefix so it cannot collide with other
/// channels.
pub fn whatsapp_inbound(form: &HashMap<String, String>) -> Result<InboundMessage, ChannelError> {
    let from = form
        .get("From")
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .ok_or(ChannelError::MissingField("From"))?;
    let number = from.strip_prefix(WHATSAPP_PREFIX).unwrap_or(from).trim();
    let text = form.get("Body").cloned().unwrap_or_default();

    let count = match form.get("NumMedia").map(|n| n.trim()) {
        None | Some("") => 0,
        Some(raw) => raw.parse::<usize>().map_err(|e| ChannelError::InvalidField {
            field: "NumMedia",
            reason: e.to_string(),
        })?,
    };
    let media = (0..count)
        .filter_map(|i| form.get(&format!("MediaUrl{i}")))
        .map(|url| InboundMedia::Uri(url.trim().to_string()))
        .collect();

    Ok(InboundMessage {
        session_key: format!("{WHATSAPP_PREFIX}{number}"),
        user_id: Some(number.to_string()),
        channel: Channel::WhatsApp,
        text,
        media,
    })
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Renders a reply as TwiML. The first image rides along with the text;
/// WhatsApp takes one image per message, so any further images get a
/// message of their own.
pub fn render_twiml(reply: &TurnReply) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
    let mut media = reply.media.iter();

    xml.push_str("<Message><Body>");
    xml.push_str(&xml_escape(&reply.display_text));
    xml.push_str("</Body>");
    if let Some(first) = media.next() {
        xml.push_str(&format!("<Media>{}</Media>", xml_escape(&first.url)));
    }
    xml.push_str("</Message>");
    for item in media {
        xml.push_str(&format!(
            "<Message><Media>{}</Media></Message>",
            xml_escape(&item.url)
        ));
    }

    xml.push_str("</Response>");
    xml
}

// --- A2A (JSON-RPC) ---

pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
pub const JSONRPC_INVALID_PARAMS: i64 = -32602;
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Base64 content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum A2aPart {
    Text { text: String },
    File { file: A2aFile },
    Data { data: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aMessage {
    #[serde(default = "default_role")]
    pub role: String,
    pub parts: Vec<A2aPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Debug, Deserialize)]
struct SendParams {
    message: A2aMessage,
}

/// Builds an inbound message from `message/send` params. Returns it with
/// the conversation's context id, which is generated when the caller did
/// not supply one.
pub fn a2a_inbound(params: Value) -> Result<(InboundMessage, String), ChannelError> {
    let params: SendParams =
        serde_json::from_value(params).map_err(|e| ChannelError::InvalidField {
            field: "params",
            reason: e.to_string(),
        })?;
    let message = params.message;
    let context_id = message
        .context_id
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut text = Vec::new();
    let mut media = Vec::new();
    for part in message.parts {
        match part {
            A2aPart::Text { text: t } => text.push(t),
            A2aPart::File { file } => media.push(file_media(file)?),
            A2aPart::Data { .. } => {}
        }
    }

    let inbound = InboundMessage {
        session_key: format!("{A2A_PREFIX}{context_id}"),
        user_id: None,
        channel: Channel::Rpc,
        text: text.join("\n"),
        media,
    };
    Ok((inbound, context_id))
}

fn file_media(file: A2aFile) -> Result<InboundMedia, ChannelError> {
    if let Some(bytes) = file.bytes {
        let data = STANDARD
            .decode(bytes.trim())
            .map_err(|e| ChannelError::InvalidField {
                field: "file.bytes",
                reason: e.to_string(),
            })?;
        return Ok(InboundMedia::Bytes {
            data,
            mime_type: file.mime_type,
        });
    }
    if let Some(uri) = file.uri {
        return Ok(InboundMedia::Uri(uri));
    }
    if let Some(path) = file.path {
        return Ok(InboundMedia::Path(PathBuf::from(path)));
    }
    Err(ChannelError::MissingField("file.uri"))
}

/// Renders a reply as an A2A task. Finished assessments carry the final
/// text as an `assessment_result` artifact as well.
pub fn a2a_task(reply: &TurnReply, context_id: &str) -> Value {
    let mut parts = vec![A2aPart::Text {
        text: reply.display_text.clone(),
    }];
    parts.extend(reply.media.iter().map(|m| A2aPart::File {
        file: A2aFile {
            uri: Some(m.url.clone()),
            mime_type: Some(m.mime_type.clone()),
            bytes: None,
            path: None,
            name: None,
        },
    }));
    let message = A2aMessage {
        role: "agent".to_string(),
        parts,
        message_id: Some(Uuid::new_v4().to_string()),
        context_id: Some(context_id.to_string()),
    };

    let state = match reply.status {
        TurnStatus::InputRequired => "input-required",
        TurnStatus::Completed => "completed",
    };
    let mut task = json!({
        "kind": "task",
        "id": Uuid::new_v4().to_string(),
        "contextId": context_id,
        "status": {
            "state": state,
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
    });
    if reply.status == TurnStatus::Completed {
        task["artifacts"] = json!([{
            "artifactId": Uuid::new_v4().to_string(),
            "name": "assessment_result",
            "parts": [{ "kind": "text", "text": reply.display_text }],
        }]);
    }
    task
}

pub fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assessor_core::media::ResolvedMedia;
    use assessor_core::session::FlowStage;

    fn reply(status: TurnStatus, text: &str, urls: &[&str]) -> TurnReply {
        TurnReply {
            status,
            text: text.to_string(),
            display_text: text.to_string(),
            media: urls
                .iter()
                .map(|url| ResolvedMedia {
                    url: url.to_string(),
                    mime_type: "image/jpeg".to_string(),
                })
                .collect(),
            stage: FlowStage::AssessmentInProgress,
            failure: None,
        }
    }

    #[test]
    fn test_whatsapp_form_with_media() {
        let form = HashMap::from([
            ("From".to_string(), "whatsapp:+919876543210".to_string()),
            ("Body".to_string(), "Here is my answer".to_string()),
            ("NumMedia".to_string(), "2".to_string()),
            ("MediaUrl0".to_string(), "https://api.twilio.com/m/1".to_string()),
            ("MediaUrl1".to_string(), "https://api.twilio.com/m/2".to_string()),
        ]);

        let inbound = whatsapp_inbound(&form).unwrap();
        assert_eq!(inbound.session_key, "whatsapp:+919876543210");
        assert_eq!(inbound.user_id.as_deref(), Some("+919876543210"));
        assert_eq!(inbound.channel, Channel::WhatsApp);
        assert_eq!(inbound.text, "Here is my answer");
        assert_eq!(
            inbound.media,
            vec![
                InboundMedia::Uri("https://api.twilio.com/m/1".into()),
                InboundMedia::Uri("https://api.twilio.com/m/2".into()),
            ]
        );
    }

    #[test]
    fn test_whatsapp_form_requires_sender() {
        let form = HashMap::from([("Body".to_string(), "hi".to_string())]);
        assert_eq!(
            whatsapp_inbound(&form).unwrap_err(),
            ChannelError::MissingField("From")
        );

        let form = HashMap::from([
            ("From".to_string(), "whatsapp:+1".to_string()),
            ("NumMedia".to_string(), "many".to_string()),
        ]);
        assert!(matches!(
            whatsapp_inbound(&form),
            Err(ChannelError::InvalidField { field: "NumMedia", .. })
        ));
    }

    #[test]
    fn test_twiml_escapes_and_splits_media() {
        let xml = render_twiml(&reply(
            TurnStatus::InputRequired,
            "Is <this> safe & sound?",
            &["https://a.example/1.jpg", "https://a.example/2.jpg"],
        ));
        assert_eq!(
            xml,
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#,
                "<Message><Body>Is &lt;this&gt; safe &amp; sound?</Body>",
                "<Media>https://a.example/1.jpg</Media></Message>",
                "<Message><Media>https://a.example/2.jpg</Media></Message>",
                "</Response>"
            )
        );
    }

    #[test]
    fn test_a2a_parts_are_normalized() {
        let params = json!({
            "message": {
                "role": "user",
                "contextId": "ctx-1",
                "messageId": "m-1",
                "parts": [
                    { "kind": "text", "text": "This is the photo" },
                    { "kind": "file", "file": { "bytes": "aGVsbG8=", "mimeType": "image/png" } },
                    { "kind": "file", "file": { "uri": "file:///tmp/site.jpg" } },
                    { "kind": "file", "file": { "path": "uploads/site.jpg" } }
                ]
            }
        });

        let (inbound, context_id) = a2a_inbound(params).unwrap();
        assert_eq!(context_id, "ctx-1");
        assert_eq!(inbound.session_key, "a2a:ctx-1");
        assert_eq!(inbound.channel, Channel::Rpc);
        assert_eq!(inbound.text, "This is the photo");
        assert_eq!(
            inbound.media,
            vec![
                InboundMedia::Bytes {
                    data: b"hello".to_vec(),
                    mime_type: Some("image/png".into())
                },
                InboundMedia::Uri("file:///tmp/site.jpg".into()),
                InboundMedia::Path(PathBuf::from("uploads/site.jpg")),
            ]
        );
    }

    #[test]
    fn test_a2a_without_context_gets_a_fresh_one() {
        let params = json!({ "message": { "parts": [{ "kind": "text", "text": "hi" }] } });
        let (inbound, context_id) = a2a_inbound(params).unwrap();
        assert!(!context_id.is_empty());
        assert_eq!(inbound.session_key, format!("a2a:{context_id}"));
    }

    #[test]
    fn test_a2a_rejects_bad_params() {
        assert!(a2a_inbound(json!({ "nope": true })).is_err());
        let params = json!({
            "message": { "parts": [{ "kind": "file", "file": { "bytes": "%%%" } }] }
        });
        assert!(matches!(
            a2a_inbound(params),
            Err(ChannelError::InvalidField { field: "file.bytes", .. })
        ));
    }

    #[test]
    fn test_a2a_task_state_follows_reply_status() {
        let waiting = a2a_task(
            &reply(TurnStatus::InputRequired, "Question 1/3: ?", &["https://a.example/x.png"]),
            "ctx-9",
        );
        assert_eq!(waiting["status"]["state"], "input-required");
        assert_eq!(waiting["contextId"], "ctx-9");
        assert_eq!(waiting["status"]["message"]["parts"][1]["file"]["uri"], "https://a.example/x.png");
        assert!(waiting.get("artifacts").is_none());

        let done = a2a_task(&reply(TurnStatus::Completed, "All done.", &[]), "ctx-9");
        assert_eq!(done["status"]["state"], "completed");
        assert_eq!(done["artifacts"][0]["name"], "assessment_result");
        assert_eq!(done["artifacts"][0]["parts"][0]["text"], "All done.");
    }
}
