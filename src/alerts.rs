use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use url::Url;

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn emoji(self) -> &'static str {
        match self {
            Self::Info => "\u{2139}\u{fe0f}",
            Self::Warn => "\u{26a0}\u{fe0f}",
            Self::Error => "\u{1f6a8}",
        }
    }

    fn discord_color(self) -> u32 {
        match self {
            Self::Info => 3_447_003,
            Self::Warn => 16_776_960,
            Self::Error => 15_158_332,
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "invalid alert level '{other}', expected one of: info, warn, error"
            )),
        }
    }
}

/// Everything a webhook payload mentions about one alert.
pub struct AlertContext<'a> {
    pub level: AlertLevel,
    pub title: &'a str,
    pub text: Option<&'a str>,
    pub project: &'a str,
    pub run: &'a str,
    pub step: Option<i64>,
    pub timestamp: &'a str,
}

/// Minimum-level gate: `None` means every level is forwarded.
pub fn should_send_webhook(level: AlertLevel, min_level: Option<AlertLevel>) -> bool {
    min_level.is_none_or(|min| level >= min)
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

fn is_slack_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.ends_with("hooks.slack.com")))
        .unwrap_or(false)
}

fn is_discord_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| {
                (h.ends_with("discord.com") || h.ends_with("discordapp.com"))
                    && u.path().starts_with("/api/webhooks")
            })
        })
        .unwrap_or(false)
}

/// Build the payload whose shape depends on the destination host.
pub fn build_payload(url: &str, ctx: &AlertContext<'_>) -> JsonValue {
    if is_slack_url(url) {
        build_slack_payload(ctx)
    } else if is_discord_url(url) {
        build_discord_payload(ctx)
    } else {
        build_generic_payload(ctx)
    }
}

fn step_suffix(step: Option<i64>) -> String {
    step.map(|s| format!("  \u{2022}  Step {s}")).unwrap_or_default()
}

fn build_slack_payload(ctx: &AlertContext<'_>) -> JsonValue {
    let header = format!(
        "{} *[{}] {}*",
        ctx.level.emoji(),
        ctx.level.as_str().to_uppercase(),
        ctx.title
    );
    let context = format!(
        "Project: {}  \u{2022}  Run: {}{}",
        ctx.project,
        ctx.run,
        step_suffix(ctx.step)
    );
    let mut blocks = vec![json!({
        "type": "section",
        "text": {"type": "mrkdwn", "text": header},
    })];
    if let Some(text) = ctx.text {
        blocks.push(json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": text},
        }));
    }
    blocks.push(json!({
        "type": "context",
        "elements": [{"type": "mrkdwn", "text": context}],
    }));
    json!({ "blocks": blocks })
}

fn build_discord_payload(ctx: &AlertContext<'_>) -> JsonValue {
    let mut embed = json!({
        "title": format!(
            "{} [{}] {}",
            ctx.level.emoji(),
            ctx.level.as_str().to_uppercase(),
            ctx.title
        ),
        "color": ctx.level.discord_color(),
        "footer": {
            "text": format!(
                "Project: {}  \u{2022}  Run: {}{}",
                ctx.project,
                ctx.run,
                step_suffix(ctx.step)
            )
        },
    });
    if let Some(text) = ctx.text {
        embed["description"] = json!(text);
    }
    json!({ "embeds": [embed] })
}

fn build_generic_payload(ctx: &AlertContext<'_>) -> JsonValue {
    json!({
        "level": ctx.level.as_str(),
        "title": ctx.title,
        "text": ctx.text,
        "project": ctx.project,
        "run": ctx.run,
        "step": ctx.step,
        "timestamp": ctx.timestamp,
    })
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

fn webhook_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("webhook client")
    })
}

/// POST an alert to a webhook URL. Failures are logged and swallowed; an
/// alert must never take down the run that raised it.
pub async fn send_webhook(url: &str, ctx: &AlertContext<'_>) {
    let payload = build_payload(url, ctx);
    match webhook_client()
        .post(url)
        .header("Content-Type", "application/json")
        .json(&payload)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(url, "alert webhook delivered");
        }
        Ok(response) => {
            tracing::warn!(url, status = %response.status(), "alert webhook rejected");
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "alert webhook delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(level: AlertLevel) -> AlertContext<'static> {
        AlertContext {
            level,
            title: "loss diverged",
            text: Some("loss hit inf at step 40"),
            project: "p",
            run: "r",
            step: Some(40),
            timestamp: "2026-01-01T00:00:00Z",
        }
    }

    #[test]
    fn level_parsing_and_order() {
        assert_eq!("WARN".parse::<AlertLevel>().unwrap(), AlertLevel::Warn);
        assert_eq!("warning".parse::<AlertLevel>().unwrap(), AlertLevel::Warn);
        assert!("fatal".parse::<AlertLevel>().is_err());
        assert!(AlertLevel::Error > AlertLevel::Warn);
    }

    #[test]
    fn min_level_gate() {
        assert!(should_send_webhook(AlertLevel::Error, Some(AlertLevel::Warn)));
        assert!(!should_send_webhook(AlertLevel::Info, Some(AlertLevel::Warn)));
        assert!(should_send_webhook(AlertLevel::Info, None));
    }

    #[test]
    fn slack_payload_shape() {
        let payload = build_payload("https://hooks.slack.com/services/T/B/x", &ctx(AlertLevel::Warn));
        let blocks = payload["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0]["type"], "section");
        assert_eq!(blocks[2]["type"], "context");
    }

    #[test]
    fn discord_payload_shape() {
        let payload = build_payload(
            "https://discord.com/api/webhooks/1/tok",
            &ctx(AlertLevel::Error),
        );
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], 15_158_332);
        assert_eq!(embed["description"], "loss hit inf at step 40");
    }

    #[test]
    fn generic_payload_shape() {
        let payload = build_payload("https://example.com/hook", &ctx(AlertLevel::Info));
        assert_eq!(payload["level"], "info");
        assert_eq!(payload["project"], "p");
        assert_eq!(payload["step"], 40);
    }

    #[test]
    fn host_detection_ignores_lookalikes() {
        assert!(!is_slack_url("https://hooks.slack.com.evil.example/x"));
        assert!(!is_discord_url("https://discord.com/not/webhooks"));
    }
}
