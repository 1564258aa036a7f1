//! Telegram Bot API transport

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

use super::chat::{BotCommand, ChatInfo, ChatTransport, CommandScope, MessageFormat};
use crate::config::ChatSettings;
use crate::error::{Result, SpikeError};

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatResult {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Telegram notification client
#[derive(Clone)]
pub struct TelegramTransport {
    client: Client,
    api_url: String,
    bot_token: String,
}

impl TelegramTransport {
    pub fn new(settings: &ChatSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SpikeError::Internal(format!("failed to build chat HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            bot_token: settings.bot_token.clone(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }

    /// Call a Bot API method and unwrap its `result`
    async fn call(&self, method: &str, payload: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        let body: ApiResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                return Err(SpikeError::Internal(format!(
                    "{} returned HTTP {} with unreadable body: {}",
                    method, status, e
                )))
            }
        };

        if !status.is_success() || !body.ok {
            let reason = body
                .description
                .unwrap_or_else(|| format!("HTTP {}", status));
            error!("Telegram {} failed: {}", method, reason);
            return Err(SpikeError::Internal(reason));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        format: MessageFormat,
        disable_preview: bool,
    ) -> Result<()> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": disable_preview,
        });
        if let Some(mode) = format.parse_mode() {
            payload["parse_mode"] = json!(mode);
        }

        self.call("sendMessage", &payload)
            .await
            .map_err(|e| SpikeError::NotificationDelivery {
                chat_id,
                reason: e.to_string(),
            })?;
        debug!(chat_id, "Telegram message sent");
        Ok(())
    }

    async fn get_chat(&self, chat_id: i64) -> Result<ChatInfo> {
        let result = self.call("getChat", &json!({ "chat_id": chat_id })).await?;
        let chat: ChatResult = serde_json::from_value(result).unwrap_or_default();

        let full_name = match (chat.first_name, chat.last_name) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (Some(first), None) => Some(first),
            (None, Some(last)) => Some(last),
            (None, None) => chat.title,
        };
        Ok(ChatInfo {
            full_name,
            username: chat.username,
        })
    }

    async fn set_commands(&self, scope: CommandScope, commands: &[BotCommand]) -> Result<()> {
        let scope = match scope {
            CommandScope::Default => json!({ "type": "default" }),
            CommandScope::Chat(chat_id) => json!({ "type": "chat", "chat_id": chat_id }),
        };
        self.call(
            "setMyCommands",
            &json!({ "commands": commands, "scope": scope }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, routing::post, Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn transport(api_url: String) -> TelegramTransport {
        TelegramTransport::new(&ChatSettings {
            api_url,
            bot_token: "123:abc".into(),
            ..ChatSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_method_url() {
        let t = transport("https://api.telegram.org/".into());
        assert_eq!(
            t.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[tokio::test]
    async fn test_send_message_success() {
        let app = Router::new().route(
            "/:bot/sendMessage",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["parse_mode"], "Markdown");
                assert_eq!(body["disable_web_page_preview"], true);
                Json(json!({"ok": true, "result": {"message_id": 1}}))
            }),
        );
        let t = transport(serve(app).await);
        t.send_message(5, "*hi*", MessageFormat::Markdown, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_message_blocked_user() {
        let app = Router::new().route(
            "/:bot/sendMessage",
            post(|| async {
                (
                    axum::http::StatusCode::FORBIDDEN,
                    Json(json!({"ok": false, "description": "Forbidden: bot was blocked by the user"})),
                )
            }),
        );
        let t = transport(serve(app).await);
        let err = t
            .send_message(5, "hi", MessageFormat::Plain, false)
            .await
            .unwrap_err();
        match err {
            SpikeError::NotificationDelivery { chat_id, reason } => {
                assert_eq!(chat_id, 5);
                assert!(reason.contains("blocked"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_get_chat_names() {
        let app = Router::new().route(
            "/:bot/:method",
            post(|Path((_, method)): Path<(String, String)>| async move {
                assert_eq!(method, "getChat");
                Json(json!({"ok": true, "result": {"id": 5, "first_name": "Ada", "last_name": "L"}}))
            }),
        );
        let t = transport(serve(app).await);
        let info = t.get_chat(5).await.unwrap();
        assert_eq!(info.full_name.as_deref(), Some("Ada L"));
        assert_eq!(info.display_name(5), "Ada L");
    }
}
