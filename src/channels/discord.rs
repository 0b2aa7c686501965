use super::traits::{MessageTransport, TransportError};
use crate::compose::{Embed, RenderedBody};
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Discord's maximum message length for regular messages
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

/// Upper bound on a single rate-limit sleep.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Discord transport over the REST API (bot token auth).
pub struct DiscordTransport {
    bot_token: String,
    api_base: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl DiscordTransport {
    pub fn new(bot_token: String, api_base: Option<String>, max_retries: u32) -> Self {
        let api_base = api_base
            .filter(|base| !base.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            bot_token,
            api_base: api_base.trim_end_matches('/').to_string(),
            max_retries,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self, destination: &str) -> String {
        format!("{}/channels/{destination}/messages", self.api_base)
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        destination: &str,
        payload: &Value,
    ) -> Result<String, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let resp = self
                .client
                .request(method.clone(), url)
                .header("Authorization", format!("Bot {}", self.bot_token))
                .json(payload)
                .send()
                .await?;

            let status = resp.status();
            if status.is_success() {
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
                return body
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        TransportError::InvalidResponse("message response without id".into())
                    });
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let header_wait = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok());
                let body_wait = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|b| b.get("retry_after").and_then(Value::as_f64));

                if attempt > self.max_retries {
                    return Err(TransportError::RateLimited {
                        transport: self.name().to_string(),
                        attempts: attempt,
                    });
                }

                let wait = retry_delay(body_wait.or(header_wait));
                tracing::warn!(
                    destination,
                    attempt,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "Discord rate limited; retrying"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
                return Err(TransportError::PermanentDestination {
                    destination: destination.to_string(),
                    status: status.as_u16(),
                });
            }

            let body = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
            return Err(TransportError::Http {
                transport: self.name().to_string(),
                status: status.as_u16(),
                body: truncate_with_ellipsis(&body, 300),
            });
        }
    }
}

fn retry_delay(seconds: Option<f64>) -> Duration {
    let secs = seconds.filter(|s| s.is_finite() && *s >= 0.0).unwrap_or(1.0);
    Duration::from_secs_f64(secs).min(MAX_RETRY_AFTER)
}

fn embed_json(embed: &Embed) -> Value {
    let mut out = json!({
        "title": embed.title,
        "color": embed.color,
        "fields": embed
            .fields
            .iter()
            .map(|f| json!({ "name": f.name, "value": f.value, "inline": true }))
            .collect::<Vec<_>>(),
    });
    if let Some(url) = &embed.url {
        out["url"] = json!(url);
    }
    if let Some(thumb) = &embed.thumbnail_url {
        out["thumbnail"] = json!({ "url": thumb });
    }
    out
}

/// Build the create/edit payload. An absent embed clears embeds and buttons.
fn message_payload(body: &RenderedBody) -> Value {
    let content = truncate_with_ellipsis(&body.text, DISCORD_MAX_MESSAGE_LENGTH - 3);
    let Some(embed) = &body.embed else {
        return json!({ "content": content, "embeds": [], "components": [] });
    };

    let buttons: Vec<Value> = embed
        .buttons
        .iter()
        .map(|b| json!({ "type": 2, "style": 5, "label": b.label, "url": b.url }))
        .collect();
    let components = if buttons.is_empty() {
        Vec::new()
    } else {
        vec![json!({ "type": 1, "components": buttons })]
    };

    json!({
        "content": content,
        "embeds": [embed_json(embed)],
        "components": components,
    })
}

#[async_trait]
impl MessageTransport for DiscordTransport {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, destination: &str, body: &RenderedBody) -> Result<String, TransportError> {
        let url = self.messages_url(destination);
        self.execute(Method::POST, &url, destination, &message_payload(body))
            .await
    }

    async fn update(
        &self,
        destination: &str,
        message_id: &str,
        body: &RenderedBody,
    ) -> Result<String, TransportError> {
        let url = format!("{}/{message_id}", self.messages_url(destination));
        self.execute(Method::PATCH, &url, destination, &message_payload(body))
            .await
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::LinkButton;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn body_with_embed() -> RenderedBody {
        RenderedBody {
            text: "streamer is live".into(),
            embed: Some(Embed {
                title: "Title".into(),
                url: Some("https://twitch.tv/streamer".into()),
                color: 0x9146FF,
                thumbnail_url: None,
                fields: Vec::new(),
                buttons: vec![LinkButton {
                    label: "Watch on Twitch".into(),
                    url: "https://twitch.tv/streamer".into(),
                }],
            }),
        }
    }

    fn transport(server: &MockServer, max_retries: u32) -> DiscordTransport {
        DiscordTransport::new("token".into(), Some(server.uri()), max_retries)
    }

    #[test]
    fn default_api_base_is_used_when_unset() {
        let t = DiscordTransport::new("t".into(), Some("  ".into()), 0);
        assert_eq!(t.api_base, DEFAULT_API_BASE);
        assert_eq!(t.name(), "discord");
    }

    #[test]
    fn payload_without_embed_clears_components() {
        let payload = message_payload(&RenderedBody {
            text: "offline".into(),
            embed: None,
        });
        assert_eq!(payload["embeds"], json!([]));
        assert_eq!(payload["components"], json!([]));
    }

    #[test]
    fn payload_with_buttons_builds_action_row() {
        let payload = message_payload(&body_with_embed());
        assert_eq!(payload["components"][0]["type"], 1);
        assert_eq!(payload["components"][0]["components"][0]["style"], 5);
        assert_eq!(payload["embeds"][0]["url"], "https://twitch.tv/streamer");
    }

    #[test]
    fn retry_delay_is_capped_and_defaults() {
        assert_eq!(retry_delay(None), Duration::from_secs(1));
        assert_eq!(retry_delay(Some(600.0)), MAX_RETRY_AFTER);
        assert_eq!(retry_delay(Some(-1.0)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn send_returns_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/123/messages"))
            .and(header("Authorization", "Bot token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "m-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let id = transport(&server, 0)
            .send("123", &body_with_embed())
            .await
            .unwrap();
        assert_eq!(id, "m-1");
    }

    #[tokio::test]
    async fn update_patches_existing_message() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/channels/123/messages/m-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "m-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let id = transport(&server, 0)
            .update("123", "m-1", &body_with_embed())
            .await
            .unwrap();
        assert_eq!(id, "m-1");
    }

    #[tokio::test]
    async fn rate_limit_is_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/123/messages"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(json!({ "retry_after": 0.01, "global": false })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/123/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "m-2" })))
            .mount(&server)
            .await;

        let id = transport(&server, 2)
            .send("123", &body_with_embed())
            .await
            .unwrap();
        assert_eq!(id, "m-2");
    }

    #[tokio::test]
    async fn rate_limit_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({ "retry_after": 0.01 })),
            )
            .expect(2)
            .mount(&server)
            .await;

        let err = transport(&server, 1)
            .send("123", &body_with_embed())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RateLimited { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn forbidden_is_a_permanent_destination_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Missing Access"))
            .mount(&server)
            .await;

        let err = transport(&server, 3)
            .send("123", &body_with_embed())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn server_error_is_reported_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let err = transport(&server, 3)
            .send("123", &body_with_embed())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn success_without_id_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let err = transport(&server, 0)
            .send("123", &body_with_embed())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidResponse(_)));
    }
}
