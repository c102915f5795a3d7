#![forbid(unsafe_code)]

//! Completion notifications: terminal bell, desktop, webhook.
//!
//! Every channel failure is a warning; notifications never fail the run.

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct Notifier {
    webhook_url: String,
    desktop_enabled: bool,
    bell_enabled: bool,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

impl Notifier {
    #[must_use]
    pub fn new(cfg: &Config) -> Self {
        Self {
            webhook_url: cfg.webhook_url.clone(),
            desktop_enabled: cfg.notification_desktop,
            bell_enabled: cfg.notification_bell,
        }
    }

    /// A notifier with every channel disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            webhook_url: String::new(),
            desktop_enabled: false,
            bell_enabled: false,
        }
    }

    pub async fn notify_complete(&self, summary: &str) {
        if self.bell_enabled {
            print!("\x07");
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }

        if self.desktop_enabled
            && let Err(e) = send_desktop("claude-autopilot", summary).await
        {
            warn!("desktop notification failed: {e}");
        }

        if !self.webhook_url.is_empty()
            && let Err(e) = send_webhook(&self.webhook_url, summary).await
        {
            warn!("webhook notification failed: {e}");
        }
    }
}

/// POSTs a JSON payload; one retry after 5 s on failure.
async fn send_webhook(url: &str, message: &str) -> anyhow::Result<()> {
    let payload = WebhookPayload { text: message };

    match post_once(url, &payload).await {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!("webhook first attempt failed: {first}; retrying in 5s");
            tokio::time::sleep(Duration::from_secs(5)).await;
            post_once(url, &payload)
                .await
                .map_err(|retry| anyhow::anyhow!("webhook failed after retry: {retry} (first: {first})"))
        }
    }
}

async fn post_once(url: &str, payload: &WebhookPayload<'_>) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let resp = client.post(url).json(payload).send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("webhook returned status {status}");
    }
    Ok(())
}

async fn send_desktop(title: &str, message: &str) -> anyhow::Result<()> {
    if cfg!(target_os = "macos") {
        let script = format!("display notification {message:?} with title {title:?}");
        let status = tokio::process::Command::new("osascript")
            .args(["-e", &script])
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("osascript exited with {:?}", status.code());
        }
        return Ok(());
    }

    if cfg!(target_os = "linux") {
        let status = tokio::process::Command::new("notify-send")
            .args([title, message])
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("notify-send exited with {:?}", status.code());
        }
        return Ok(());
    }

    anyhow::bail!("desktop notifications not supported on this platform")
}
