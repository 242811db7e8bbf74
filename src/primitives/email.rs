//! `email`: send mail through a local sendmail binary.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

use super::{optional_str, process, require_str, string_list, Primitive, StepContext};

/// Pipes an RFC 5322 message into `sendmail -t -i`.
///
/// Input: `to` (string or list), `subject`, `body`, optional `cc` and
/// `from`. Output: `recipients` and `sent_at`.
pub struct Email {
    sendmail_path: String,
    default_from: Option<String>,
}

impl Email {
    pub fn new(sendmail_path: impl Into<String>, default_from: Option<String>) -> Self {
        Self {
            sendmail_path: sendmail_path.into(),
            default_from,
        }
    }

    /// Render the message text handed to sendmail
    pub fn compose(&self, input: &Value) -> Result<(String, Vec<String>)> {
        let to = string_list(input, "to", "email")?;
        if to.is_empty() {
            return Err(OrchestratorError::bad_request(
                "email input must define at least one recipient in 'to'",
            ));
        }
        let cc = string_list(input, "cc", "email")?;
        let subject = require_str(input, "subject", "email")?;
        let body = optional_str(input, "body").unwrap_or_default();

        for header in to.iter().chain(cc.iter()).map(String::as_str).chain([subject]) {
            if header.contains(['\r', '\n']) {
                return Err(OrchestratorError::bad_request(
                    "email headers must not contain line breaks",
                ));
            }
        }

        let mut message = String::new();
        if let Some(from) = optional_str(input, "from").or(self.default_from.as_deref()) {
            message.push_str(&format!("From: {}\n", from));
        }
        message.push_str(&format!("To: {}\n", to.join(", ")));
        if !cc.is_empty() {
            message.push_str(&format!("Cc: {}\n", cc.join(", ")));
        }
        message.push_str(&format!("Subject: {}\n", subject));
        message.push_str(&format!("Date: {}\n", Utc::now().to_rfc2822()));
        message.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        message.push_str(body);
        if !message.ends_with('\n') {
            message.push('\n');
        }

        let recipients = to.into_iter().chain(cc).collect();
        Ok((message, recipients))
    }
}

#[async_trait]
impl Primitive for Email {
    fn name(&self) -> &str {
        "email"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        self.compose(input).map(|_| ())
    }

    async fn run(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let (message, recipients) = self.compose(input)?;
        debug!(step = %ctx.step_name, recipients = recipients.len(), "Sending email");

        let mut command = Command::new(&self.sendmail_path);
        command.args(["-t", "-i"]);

        let output = process::run(command, Some(message.as_bytes()), "sendmail", &ctx.cancel).await?;
        output.check("sendmail")?;

        Ok(json!({
            "recipients": recipients,
            "sent_at": Utc::now(),
        }))
    }
}
