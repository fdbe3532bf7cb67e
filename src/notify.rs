//! Webhook notifications for page operations.
//!
//! Payloads are Adaptive Cards (the incoming-webhook format Teams and
//! compatible clients accept). Delivery is fire-and-forget relative to
//! the content mutation that triggered it: callers run it under its own
//! task and downgrade any failure to `completed_with_errors`.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::time::Duration;

/// Build the Adaptive Card for a page operation.
///
/// `page_url` is omitted for deletions (there is nothing to link to).
pub fn build_card(operation: &str, page_title: &str, page_url: Option<&str>) -> Value {
    let message = match operation {
        "created" => format!("New page created: {}", page_title),
        "updated" => format!("Page updated: {}", page_title),
        "deleted" => format!("Page deleted: {}", page_title),
        "moved" => format!("Page moved: {}", page_title),
        "archived" => format!("Page archived: {}", page_title),
        other => format!("Page {}: {}", other, page_title),
    };

    let mut content = json!({
        "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
        "version": "1.2",
        "type": "AdaptiveCard",
        "body": [
            {
                "type": "TextBlock",
                "text": message,
                "size": "Medium",
                "weight": "Bolder",
            }
        ],
    });

    if let Some(url) = page_url {
        content["actions"] = json!([
            {
                "type": "Action.OpenUrl",
                "title": "View Page",
                "url": url,
            }
        ]);
    }

    json!({
        "type": "message",
        "attachments": [
            {
                "contentType": "application/vnd.microsoft.card.adaptive",
                "content": content,
            }
        ],
    })
}

/// Absolute URL for a wiki page, from the configured site base URL.
pub fn page_url(site_url: &str, page_path: &str) -> Result<String> {
    let site_url = site_url.trim();
    if site_url.is_empty() {
        bail!("site_url not configured");
    }
    if !site_url.starts_with("http://") && !site_url.starts_with("https://") {
        bail!("site_url must start with http:// or https://, got: {}", site_url);
    }

    Ok(format!("{}/wiki/{}/", site_url.trim_end_matches('/'), page_path))
}

/// POST the card to the webhook with a bounded timeout. Any HTTP error
/// status is an error here; the caller decides what it means for the
/// task.
pub async fn send_webhook(
    client: &reqwest::Client,
    webhook_url: &str,
    card: &Value,
    timeout: Duration,
) -> Result<()> {
    let response = client
        .post(webhook_url)
        .json(card)
        .timeout(timeout)
        .send()
        .await
        .with_context(|| "webhook request failed")?;

    response
        .error_for_status()
        .with_context(|| "webhook returned error status")?;
    Ok(())
}
