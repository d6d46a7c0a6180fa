use async_trait::async_trait;
use serde_json::json;

use herald_common::types::Item;

use crate::{DeliveryError, Subscriber, check_response, format_size};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Posts announcements to a Telegram chat through the Bot API.
pub struct TelegramSubscriber {
    http: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
    public_url: String,
}

impl TelegramSubscriber {
    pub fn new(
        http: reqwest::Client,
        token: impl Into<String>,
        chat_id: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
            public_url: public_url.into(),
        }
    }

    /// Point the subscriber at another Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// HTML message body for `item`.
    pub fn render(&self, item: &Item) -> String {
        let mut text = match &item.page_url {
            Some(url) => format!(
                "<b><a href=\"{}\">{}</a></b>",
                escape_html(url),
                escape_html(&item.title)
            ),
            None => format!("<b>{}</b>", escape_html(&item.title)),
        };
        if let Some(episode) = &item.episode {
            text.push_str(&format!("\n{}", episode));
        }

        for payload in &item.payload_refs {
            let label = payload.quality.as_deref().unwrap_or("Download");
            text.push_str(&format!(
                "\n<a href=\"{}\">{}</a> ({})",
                escape_html(&payload.download_url(&self.public_url)),
                escape_html(label),
                format_size(payload.size_bytes)
            ));
        }
        text
    }
}

#[async_trait]
impl Subscriber for TelegramSubscriber {
    fn channel(&self) -> &str {
        "telegram"
    }

    async fn on_new_item(&self, item: &Item) -> Result<(), DeliveryError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": self.render(item),
                "parse_mode": "HTML",
            }))
            .send()
            .await?;
        check_response(response).await
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
