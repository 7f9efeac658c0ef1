//! Notification collaborator: render a sweep's [`AlertDigest`] and deliver it.

use std::time::Duration;

use askama::Template;
use async_trait::async_trait;
use kiwatch_core::Observation;
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::alerts::AlertDigest;

pub const DEFAULT_SUBJECT: &str = "New Known Issues Published!";
pub const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification transport failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("notification not configured: {0}")]
    NotConfigured(String),
    #[error("rendering notification failed: {0}")]
    Render(#[from] askama::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one consolidated digest. Never called with an empty digest.
    async fn notify(
        &self,
        digest: &AlertDigest,
        recipients: &[String],
    ) -> Result<(), NotificationError>;
}

struct EmailEntry {
    last_updated: String,
    summary: String,
    status: String,
    originating_update: String,
    classification: String,
    comment: String,
}

impl EmailEntry {
    fn from_observation(observation: &Observation) -> Self {
        let row = observation.payload.row();
        Self {
            last_updated: row.last_updated.clone(),
            summary: row.summary.clone(),
            status: row.status.clone(),
            originating_update: row.originating_update.clone(),
            classification: observation
                .classification
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            comment: observation.comment.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

struct EmailGroup {
    url: String,
    title: String,
    entries: Vec<EmailEntry>,
}

#[derive(Template)]
#[template(
    ext = "html",
    source = r#"New scrapes found:<br><br>
{%- for group in groups %}
Product: <a href="{{ group.url }}">{{ group.title }}</a><br>
{%- for entry in group.entries %}
Known Issues:<br>
Last updated: {{ entry.last_updated }}<br>
Summary: {{ entry.summary }}<br>
Status: {{ entry.status }}<br>
Originating update: {{ entry.originating_update }}<br>
Classification: {{ entry.classification }}<br>
Comment: {{ entry.comment }}<br>
---<br>
{%- endfor %}
{%- endfor %}
"#
)]
struct AlertEmailTemplate {
    groups: Vec<EmailGroup>,
}

/// HTML body listing every new observation, grouped by product page.
pub fn render_email_html(digest: &AlertDigest) -> Result<String, NotificationError> {
    let groups = digest
        .groups
        .iter()
        .map(|group| EmailGroup {
            url: group.target.url.clone(),
            title: product_title_from_url(&group.target.url),
            entries: group
                .observations
                .iter()
                .map(EmailEntry::from_observation)
                .collect(),
        })
        .collect();
    Ok(AlertEmailTemplate { groups }.render()?)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Human-readable product name derived from a release-health page URL.
///
/// `.../release-health/status-windows-11-23h2` becomes `Windows 11 23h2`.
pub fn product_title_from_url(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let path = path.replace("status-", "").replace("/status/", "");

    let mut parts = path.rsplit('/');
    let last = match parts.next() {
        Some("") => parts.next().unwrap_or(""),
        Some(part) => part,
        None => "",
    };
    let stem = match last.rfind('.') {
        Some(idx) if idx + 1 < last.len() => &last[..idx],
        _ => last,
    };

    stem.split('-').map(capitalize).collect::<Vec<_>>().join(" ")
}

/// Writes digests to the log instead of sending mail.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        digest: &AlertDigest,
        recipients: &[String],
    ) -> Result<(), NotificationError> {
        for group in &digest.groups {
            info!(
                target_id = group.target.id,
                url = %group.target.url,
                new_observations = group.observations.len(),
                "new known issues"
            );
        }
        info!(
            targets = digest.len(),
            observations = digest.observation_count(),
            recipients = recipients.len(),
            "alert digest logged; no mail transport configured"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub from_email: String,
    pub subject: String,
    pub endpoint: String,
    pub timeout: Duration,
}

impl SendGridConfig {
    pub fn new(api_key: impl Into<String>, from_email: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            from_email: from_email.into(),
            subject: DEFAULT_SUBJECT.to_string(),
            endpoint: SENDGRID_ENDPOINT.to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Serialize)]
struct MailAddress<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<MailAddress<'a>>,
}

#[derive(Debug, Serialize)]
struct MailContent<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: String,
}

#[derive(Debug, Serialize)]
struct MailSend<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: MailAddress<'a>,
    subject: &'a str,
    content: Vec<MailContent<'a>>,
}

/// SendGrid v3 `mail/send` transport.
#[derive(Debug, Clone)]
pub struct SendGridNotifier {
    client: reqwest::Client,
    config: SendGridConfig,
}

impl SendGridNotifier {
    pub fn new(config: SendGridConfig) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn mail<'a>(&'a self, recipients: &'a [String], html: String) -> MailSend<'a> {
        MailSend {
            personalizations: vec![Personalization {
                to: recipients
                    .iter()
                    .map(|email| MailAddress { email })
                    .collect(),
            }],
            from: MailAddress {
                email: &self.config.from_email,
            },
            subject: &self.config.subject,
            content: vec![MailContent {
                kind: "text/html",
                value: html,
            }],
        }
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    async fn notify(
        &self,
        digest: &AlertDigest,
        recipients: &[String],
    ) -> Result<(), NotificationError> {
        if recipients.is_empty() {
            return Err(NotificationError::NotConfigured(
                "no alert recipients".to_string(),
            ));
        }
        let html = render_email_html(digest)?;
        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&self.mail(recipients, html))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(
            status = status.as_u16(),
            recipients = recipients.len(),
            observations = digest.observation_count(),
            "alert email sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertAggregator;
    use chrono::Utc;
    use kiwatch_core::{CanonicalPayload, Classification, Fingerprint, KnownIssueRow, Target};

    fn digest(summary: &str) -> AlertDigest {
        let payload = CanonicalPayload::new(
            "Known issues",
            KnownIssueRow {
                summary: summary.to_string(),
                originating_update: "OS Build 22621.1 | KB5030000".into(),
                status: "Mitigated".into(),
                last_updated: "2024-01-02".into(),
            },
        );
        let observation = Observation {
            id: 1,
            target_id: 7,
            captured_at: Utc::now(),
            fingerprint: Fingerprint::of(&payload).unwrap(),
            payload,
            classification: Some(Classification::Critical),
            comment: None,
            alert: false,
        };
        let target = Target {
            id: 7,
            url: "https://learn.microsoft.com/en-us/windows/release-health/status-windows-11-23h2"
                .into(),
            last_swept_at: None,
        };
        let mut aggregator = AlertAggregator::new();
        aggregator.record(&target, vec![observation]);
        aggregator.drain()
    }

    #[test]
    fn product_titles_come_from_the_last_path_segment() {
        assert_eq!(
            product_title_from_url(
                "https://learn.microsoft.com/en-us/windows/release-health/status-windows-11-23h2"
            ),
            "Windows 11 23h2"
        );
        assert_eq!(
            product_title_from_url("https://example.com/docs/windows-server-2022/"),
            "Windows Server 2022"
        );
        assert_eq!(
            product_title_from_url("https://example.com/pages/OFFICE-known-issues.html"),
            "Office Known Issues"
        );
    }

    #[test]
    fn email_lists_each_observation_under_its_product() {
        let html = render_email_html(&digest("Printers might fail to install")).unwrap();
        assert!(html.starts_with("New scrapes found:<br><br>"));
        assert!(html.contains(">Windows 11 23h2</a>"));
        assert!(html.contains("Summary: Printers might fail to install<br>"));
        assert!(html.contains("Status: Mitigated<br>"));
        assert!(html.contains("Last updated: 2024-01-02<br>"));
        assert!(html.contains("Classification: Critical<br>"));
        assert!(html.contains("Comment: -<br>"));
    }

    #[test]
    fn email_escapes_page_text() {
        let html = render_email_html(&digest("<script>alert(1)</script>")).unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn sendgrid_payload_has_expected_shape() {
        let notifier =
            SendGridNotifier::new(SendGridConfig::new("key", "alerts@example.com")).unwrap();
        let recipients = vec!["a@example.com".to_string(), "b@example.com".to_string()];
        let value = serde_json::to_value(notifier.mail(&recipients, "<b>hi</b>".into())).unwrap();
        assert_eq!(value["from"]["email"], "alerts@example.com");
        assert_eq!(value["subject"], DEFAULT_SUBJECT);
        assert_eq!(value["personalizations"][0]["to"][1]["email"], "b@example.com");
        assert_eq!(value["content"][0]["type"], "text/html");
        assert_eq!(value["content"][0]["value"], "<b>hi</b>");
    }

    #[tokio::test]
    async fn sendgrid_requires_recipients() {
        let notifier =
            SendGridNotifier::new(SendGridConfig::new("key", "alerts@example.com")).unwrap();
        let err = notifier.notify(&digest("x"), &[]).await.unwrap_err();
        assert!(matches!(err, NotificationError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn log_notifier_accepts_any_digest() {
        LogNotifier.notify(&digest("x"), &[]).await.unwrap();
    }
}
