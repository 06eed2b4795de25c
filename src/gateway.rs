use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::menu::MenuOption;
use crate::store::SessionStore;

pub const MAX_BODY_LEN: usize = 1024;
pub const MAX_BUTTON_TITLE_LEN: usize = 20;
pub const MAX_BUTTONS: usize = 3;
pub const MAX_LIST_ROWS: usize = 10;
pub const MAX_ROW_TITLE_LEN: usize = 24;
pub const MAX_ROW_DESC_END: usize = 72;
pub const MAX_HEADER_LEN: usize = 60;
pub const TEXT_CHUNK_LEN: usize = 3000;

/// The chat transport capability: deliver one message payload, fetch one
/// media object. Implemented against the Graph API in production and mocked
/// in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, payload: Value) -> Result<Value, String>;
    async fn fetch_media(&self, media_id: &str) -> Result<(Vec<u8>, String), String>;
}

/// WhatsApp Cloud API transport.
pub struct GraphTransport {
    client: reqwest::Client,
    phone_id: String,
    access_token: String,
}

impl GraphTransport {
    pub fn new(phone_id: &str, access_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            phone_id: phone_id.to_string(),
            access_token: access_token.to_string(),
        }
    }
}

#[async_trait]
impl Transport for GraphTransport {
    async fn deliver(&self, payload: Value) -> Result<Value, String> {
        let response = self
            .client
            .post(format!(
                "https://graph.facebook.com/v21.0/{}/messages",
                self.phone_id
            ))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(format!("send failed {}: {}", status.as_u16(), raw_body));
        }
        Ok(serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body })))
    }

    async fn fetch_media(&self, media_id: &str) -> Result<(Vec<u8>, String), String> {
        let metadata_response = self
            .client
            .get(format!("https://graph.facebook.com/v21.0/{media_id}"))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !metadata_response.status().is_success() {
            let status = metadata_response.status();
            let body = metadata_response.text().await.unwrap_or_default();
            return Err(format!("media metadata error {}: {}", status.as_u16(), body));
        }
        let metadata = metadata_response
            .json::<Value>()
            .await
            .unwrap_or_else(|_| json!({}));
        let media_url = metadata
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if media_url.is_empty() {
            return Err("missing media url".to_string());
        }
        let fallback_mime = metadata
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();

        let media_response = self
            .client
            .get(media_url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !media_response.status().is_success() {
            let status = media_response.status();
            let body = media_response.text().await.unwrap_or_default();
            return Err(format!("media download error {}: {}", status.as_u16(), body));
        }
        let content_type = media_response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&fallback_mime)
            .to_string();
        let bytes = media_response.bytes().await.map_err(|e| e.to_string())?;
        Ok((bytes.to_vec(), content_type))
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn truncate_with_ellipsis(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        let mut out: String = value.chars().take(max.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}

fn char_slice(value: &str, start: usize, end: usize) -> String {
    value.chars().skip(start).take(end.saturating_sub(start)).collect()
}

fn scrub_body(text: &str) -> String {
    let cleaned = text.replace('\0', "").replace('\r', "\n");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "New message".to_string()
    } else {
        truncate_with_ellipsis(cleaned, MAX_BODY_LEN)
    }
}

/// Outbound message shaping: size limits, malformed-option repair and the
/// fixed degradation chain (list → text, buttons → text). Successful sends
/// land in the interaction log; failed ones do not.
#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn Transport>,
    store: SessionStore,
}

impl Gateway {
    pub fn new(transport: Arc<dyn Transport>, store: SessionStore) -> Self {
        Self { transport, store }
    }

    fn base_payload(to: &str) -> Value {
        json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
        })
    }

    /// Plain text. Oversized bodies are split into fixed-size chunks, each
    /// delivered independently; one failed chunk does not cancel the rest.
    pub async fn send_text(&self, to: &str, text: &str) -> bool {
        let chars: Vec<char> = text.chars().collect();
        let mut ok = true;
        let mut sent_any = false;
        for part in chars.chunks(TEXT_CHUNK_LEN) {
            let body: String = part.iter().collect();
            let mut payload = Self::base_payload(to);
            payload["type"] = json!("text");
            payload["text"] = json!({ "preview_url": false, "body": body });
            match self.transport.deliver(payload).await {
                Ok(_) => sent_any = true,
                Err(err) => {
                    tracing::error!(to, error = %err, "text send failed");
                    ok = false;
                }
            }
        }
        if sent_any {
            self.store
                .append_log(to, "out", "text", json!({ "text": text }))
                .await;
        }
        ok
    }

    /// Quick-reply buttons, at most three. Titles are truncated to the
    /// transport limit and blank ids repaired positionally. On rejection the
    /// same body goes out as text with a bulleted option list, and the
    /// attempt is reported as failed.
    pub async fn send_buttons(&self, to: &str, text: &str, buttons: &[MenuOption<'_>]) -> bool {
        let body = scrub_body(text);
        let mut button_items = Vec::new();
        for (i, button) in buttons.iter().take(MAX_BUTTONS).enumerate() {
            let id = if button.id.trim().is_empty() || button.id.len() > 256 {
                format!("button_{}", i + 1)
            } else {
                button.id.to_string()
            };
            let title = if button.title.trim().is_empty() {
                "Button".to_string()
            } else {
                truncate_with_ellipsis(button.title, MAX_BUTTON_TITLE_LEN)
            };
            button_items.push(json!({
                "type": "reply",
                "reply": { "id": id, "title": title }
            }));
        }
        if button_items.is_empty() {
            return self.send_buttons_fallback(to, &body, buttons).await;
        }

        let mut payload = Self::base_payload(to);
        payload["type"] = json!("interactive");
        payload["interactive"] = json!({
            "type": "button",
            "body": { "text": body },
            "action": { "buttons": button_items }
        });

        match self.transport.deliver(payload).await {
            Ok(_) => {
                self.store
                    .append_log(
                        to,
                        "out",
                        "button",
                        json!({
                            "text": body,
                            "buttons": buttons
                                .iter()
                                .take(MAX_BUTTONS)
                                .map(|b| b.title)
                                .collect::<Vec<_>>()
                        }),
                    )
                    .await;
                true
            }
            Err(err) => {
                tracing::warn!(to, error = %err, "button send rejected, degrading to text");
                self.send_buttons_fallback(to, &body, buttons).await
            }
        }
    }

    async fn send_buttons_fallback(
        &self,
        to: &str,
        body: &str,
        buttons: &[MenuOption<'_>],
    ) -> bool {
        let listing = buttons
            .iter()
            .take(MAX_BUTTONS)
            .map(|b| format!("- {}", b.title))
            .collect::<Vec<_>>()
            .join("\n");
        self.send_text(to, &format!("{body}\n\n{listing}")).await;
        false
    }

    /// Scrollable list, at most ten rows. Row titles are capped; the
    /// overflow becomes the row description. On rejection the options go
    /// out as a numbered text enumeration, reported as failed.
    pub async fn send_list(&self, to: &str, text: &str, options: &[MenuOption<'_>]) -> bool {
        let rows: Vec<Value> = options
            .iter()
            .take(MAX_LIST_ROWS)
            .map(|option| {
                json!({
                    "id": option.id,
                    "title": truncate_chars(option.title, MAX_ROW_TITLE_LEN),
                    "description": char_slice(option.title, MAX_ROW_TITLE_LEN, MAX_ROW_DESC_END),
                })
            })
            .collect();

        let mut payload = Self::base_payload(to);
        payload["type"] = json!("interactive");
        payload["interactive"] = json!({
            "type": "list",
            "header": { "type": "text", "text": truncate_chars("", MAX_HEADER_LEN) },
            "body": { "text": truncate_chars(text, MAX_BODY_LEN) },
            "footer": { "text": truncate_chars(" ", MAX_HEADER_LEN) },
            "action": {
                "button": "Options",
                "sections": [{ "title": "Available Options", "rows": rows }]
            }
        });

        match self.transport.deliver(payload).await {
            Ok(_) => {
                self.store
                    .append_log(
                        to,
                        "out",
                        "list",
                        json!({
                            "text": text,
                            "options": options
                                .iter()
                                .take(MAX_LIST_ROWS)
                                .map(|o| o.title)
                                .collect::<Vec<_>>()
                        }),
                    )
                    .await;
                true
            }
            Err(err) => {
                tracing::warn!(to, error = %err, "list send rejected, degrading to text");
                let listing = options
                    .iter()
                    .take(MAX_LIST_ROWS)
                    .enumerate()
                    .map(|(i, o)| format!("{}. {}", i + 1, o.title))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.send_text(to, &format!("{text}\n\n{listing}")).await;
                false
            }
        }
    }

    /// Re-send an already-uploaded media object by its transport id, used to
    /// relay customer attachments to an operator.
    pub async fn send_image_by_id(&self, to: &str, media_id: &str, caption: &str) -> bool {
        let mut payload = Self::base_payload(to);
        payload["type"] = json!("image");
        let mut image = json!({ "id": media_id });
        if !caption.trim().is_empty() {
            image["caption"] = json!(truncate_chars(caption, MAX_BODY_LEN));
        }
        payload["image"] = image;
        match self.transport.deliver(payload).await {
            Ok(_) => {
                self.store
                    .append_log(to, "out", "image", json!({ "media_id": media_id }))
                    .await;
                true
            }
            Err(err) => {
                tracing::error!(to, media_id, error = %err, "image relay failed");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::sync::Mutex;

    /// Transport double that records payloads and fails on demand.
    #[derive(Default)]
    pub struct MockTransport {
        pub sent: Mutex<Vec<Value>>,
        pub reject_interactive: Mutex<bool>,
        pub media: Mutex<Option<(Vec<u8>, String)>>,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn reject_interactive(self: &Arc<Self>, reject: bool) {
            *self.reject_interactive.lock().await = reject;
        }

        pub async fn stage_media(self: &Arc<Self>, bytes: Vec<u8>, content_type: &str) {
            *self.media.lock().await = Some((bytes, content_type.to_string()));
        }

        pub async fn sent(&self) -> Vec<Value> {
            self.sent.lock().await.clone()
        }

        pub async fn sent_to(&self, to: &str) -> Vec<Value> {
            self.sent
                .lock()
                .await
                .iter()
                .filter(|p| p.get("to").and_then(Value::as_str) == Some(to))
                .cloned()
                .collect()
        }

        pub async fn clear(&self) {
            self.sent.lock().await.clear();
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn deliver(&self, payload: Value) -> Result<Value, String> {
            let is_interactive =
                payload.get("type").and_then(Value::as_str) == Some("interactive");
            if is_interactive && *self.reject_interactive.lock().await {
                return Err("470 rejected".to_string());
            }
            self.sent.lock().await.push(payload);
            Ok(json!({ "messages": [{ "id": "wamid.test" }] }))
        }

        async fn fetch_media(&self, media_id: &str) -> Result<(Vec<u8>, String), String> {
            self.media
                .lock()
                .await
                .clone()
                .ok_or_else(|| format!("media {media_id} unavailable"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockTransport;
    use super::*;
    use crate::store::MemoryStore;

    fn gateway(transport: Arc<MockTransport>) -> Gateway {
        Gateway::new(transport, SessionStore::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn long_text_is_chunked_independently() {
        let transport = MockTransport::new();
        let gw = gateway(transport.clone());
        let text = "a".repeat(TEXT_CHUNK_LEN * 2 + 5);
        assert!(gw.send_text("+263771234567", &text).await);
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 3);
        let first = sent[0]["text"]["body"].as_str().unwrap();
        assert_eq!(first.len(), TEXT_CHUNK_LEN);
        let last = sent[2]["text"]["body"].as_str().unwrap();
        assert_eq!(last.len(), 5);
    }

    #[tokio::test]
    async fn buttons_are_capped_at_three_and_titles_truncated() {
        let transport = MockTransport::new();
        let gw = gateway(transport.clone());
        let buttons = [
            MenuOption { id: "a", title: "A title that is far too long for a button" },
            MenuOption { id: "", title: "Second" },
            MenuOption { id: "c", title: "Third" },
            MenuOption { id: "d", title: "Fourth" },
        ];
        assert!(gw.send_buttons("+263771234567", "Pick one", &buttons).await);
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        let rendered = sent[0]["interactive"]["action"]["buttons"].as_array().unwrap();
        assert_eq!(rendered.len(), MAX_BUTTONS);
        let first_title = rendered[0]["reply"]["title"].as_str().unwrap();
        assert_eq!(first_title.chars().count(), MAX_BUTTON_TITLE_LEN);
        assert!(first_title.ends_with("..."));
        // blank id repaired positionally
        assert_eq!(rendered[1]["reply"]["id"], "button_2");
    }

    #[tokio::test]
    async fn rejected_buttons_degrade_to_bulleted_text() {
        let transport = MockTransport::new();
        transport.reject_interactive(true).await;
        let gw = gateway(transport.clone());
        let buttons = [
            MenuOption { id: "restart_yes", title: "Yes" },
            MenuOption { id: "restart_no", title: "No" },
        ];
        let ok = gw.send_buttons("+263771234567", "Anything else?", &buttons).await;
        assert!(!ok);
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "text");
        let body = sent[0]["text"]["body"].as_str().unwrap();
        assert!(body.contains("- Yes"));
        assert!(body.contains("- No"));
    }

    #[tokio::test]
    async fn lists_are_capped_at_ten_rows() {
        let transport = MockTransport::new();
        let gw = gateway(transport.clone());
        let options: Vec<MenuOption> = (0..11)
            .map(|_| MenuOption { id: "x", title: "Row" })
            .collect();
        assert!(gw.send_list("+263771234567", "Pick", &options).await);
        let sent = transport.sent().await;
        let rows = sent[0]["interactive"]["action"]["sections"][0]["rows"]
            .as_array()
            .unwrap();
        assert_eq!(rows.len(), MAX_LIST_ROWS);
    }

    #[tokio::test]
    async fn long_row_titles_spill_into_the_description() {
        let transport = MockTransport::new();
        let gw = gateway(transport.clone());
        let options = [MenuOption {
            id: "two_6_8",
            title: "6 inch + 8 inch cakes with fresh cream filling - $110",
        }];
        gw.send_list("+263771234567", "Pick", &options).await;
        let sent = transport.sent().await;
        let row = &sent[0]["interactive"]["action"]["sections"][0]["rows"][0];
        assert_eq!(row["title"].as_str().unwrap().chars().count(), MAX_ROW_TITLE_LEN);
        assert!(!row["description"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_list_degrades_to_numbered_text() {
        let transport = MockTransport::new();
        transport.reject_interactive(true).await;
        let gw = gateway(transport.clone());
        let options = [
            MenuOption { id: "a", title: "First" },
            MenuOption { id: "b", title: "Second" },
        ];
        let ok = gw.send_list("+263771234567", "Pick one", &options).await;
        assert!(!ok);
        let sent = transport.sent().await;
        assert_eq!(sent[0]["type"], "text");
        let body = sent[0]["text"]["body"].as_str().unwrap();
        assert!(body.contains("1. First"));
        assert!(body.contains("2. Second"));
    }
}
