//! Request validation and flattening of a chat transcript into the single
//! prompt the chat page accepts.

use base64::Engine;
use chat_relay_error::RelayError;

use crate::openai::{ChatMessage, ContentPart, MessageContent};

const SYSTEM_PREFIX: &str = "System instruction:\n";
const TURN_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub text: String,
    pub images: Vec<ImageAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    /// e.g. `image/png`
    pub media_type: String,
    pub data: Vec<u8>,
}

pub fn validate_chat_request(messages: &[ChatMessage]) -> Result<(), RelayError> {
    if messages.is_empty() {
        return Err(RelayError::invalid_request(
            "'messages' must contain at least one message",
        ));
    }
    if messages.iter().all(|message| message.role == "system") {
        return Err(RelayError::invalid_request(
            "all messages have the system role; at least one user or assistant message is required",
        ));
    }
    Ok(())
}

pub fn prepare_combined_prompt(request_id: &str, messages: &[ChatMessage]) -> Prompt {
    let mut parts: Vec<String> = Vec::new();
    let mut images = Vec::new();

    // Only the first system message counts; the rest are dropped.
    let first_system = messages.iter().position(|message| message.role == "system");
    if let Some(index) = first_system {
        if let Some(MessageContent::Text(text)) = &messages[index].content {
            let text = text.trim();
            if !text.is_empty() {
                parts.push(format!("{SYSTEM_PREFIX}{text}"));
            }
        }
    }

    for message in messages.iter().filter(|message| message.role != "system") {
        let mut turn = String::new();
        let content = match &message.content {
            None => String::new(),
            Some(MessageContent::Text(text)) => text.trim().to_string(),
            Some(MessageContent::Parts(items)) => {
                let mut texts = Vec::new();
                for item in items {
                    match item {
                        ContentPart::Text { text } => texts.push(text.as_str()),
                        ContentPart::ImageUrl { image_url } => {
                            match decode_data_url(&image_url.url) {
                                Some(image) => images.push(image),
                                None => tracing::warn!(
                                    request_id = %request_id,
                                    "skipping image that is not an inline base64 data url"
                                ),
                            }
                        }
                        ContentPart::Unsupported => tracing::warn!(
                            request_id = %request_id,
                            role = %message.role,
                            "skipping unsupported content part"
                        ),
                    }
                }
                texts.join("\n").trim().to_string()
            }
        };
        turn.push_str(&content);

        if message.role == "assistant" {
            if let Some(tool_calls) = message.tool_calls.as_ref().filter(|calls| !calls.is_empty()) {
                if !content.is_empty() {
                    turn.push('\n');
                }
                let rendered: Vec<String> = tool_calls
                    .iter()
                    .filter(|call| call.kind == "function")
                    .map(|call| {
                        let arguments = render_arguments(&call.function.arguments);
                        format!(
                            "Function call request: {}\nParameters:\n{arguments}",
                            call.function.name
                        )
                    })
                    .collect();
                turn.push_str(&rendered.join("\n"));
            }
        }

        if !turn.is_empty() {
            parts.push(turn);
        }
    }

    let mut text = parts.join(TURN_SEPARATOR);
    if !text.is_empty() {
        text.push('\n');
    }
    tracing::debug!(
        request_id = %request_id,
        prompt_len = text.len(),
        images = images.len(),
        "prepared combined prompt"
    );
    Prompt { text, images }
}

fn render_arguments(raw: &str) -> String {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| raw.to_string())
}

fn decode_data_url(url: &str) -> Option<ImageAttachment> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    if !media_type.starts_with("image/") {
        return None;
    }
    let data = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()?;
    Some(ImageAttachment {
        media_type: media_type.to_string(),
        data,
    })
}
