use async_trait::async_trait;
use serde_json::{Value, json};

use herald_common::types::Item;

use crate::{DeliveryError, Subscriber, check_response, format_size};

/// Posts announcements to a Discord webhook as a single embed.
pub struct DiscordSubscriber {
    http: reqwest::Client,
    webhook_url: String,
    public_url: String,
}

impl DiscordSubscriber {
    pub fn new(
        http: reqwest::Client,
        webhook_url: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            webhook_url: webhook_url.into(),
            public_url: public_url.into(),
        }
    }

    /// Webhook body for `item`.
    pub fn render(&self, item: &Item) -> Value {
        let mut lines = Vec::new();
        if let Some(episode) = &item.episode {
            lines.push(episode.to_string());
        }
        for payload in &item.payload_refs {
            lines.push(format!(
                "[{}]({}) ({})",
                payload.quality.as_deref().unwrap_or("Download"),
                payload.download_url(&self.public_url),
                format_size(payload.size_bytes)
            ));
        }

        let mut embed = json!({
            "title": item.title,
            "description": lines.join("\n"),
            "timestamp": item.published_at.to_rfc3339(),
            "footer": { "text": item.source.as_str() },
        });
        if let Some(url) = &item.page_url {
            embed["url"] = json!(url);
        }
        if let Some(poster) = &item.poster_url {
            embed["thumbnail"] = json!({ "url": poster });
        }

        json!({ "embeds": [embed] })
    }
}

#[async_trait]
impl Subscriber for DiscordSubscriber {
    fn channel(&self) -> &str {
        "discord"
    }

    async fn on_new_item(&self, item: &Item) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&self.render(item))
            .send()
            .await?;
        check_response(response).await
    }
}
