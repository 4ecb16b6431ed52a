pub mod mailer;
pub mod template;
pub mod trigger;

use thiserror::Error;

pub use mailer::{LogMailer, Mailer};
pub use trigger::{TriggerBatch, TriggerDispatcher, TriggerOutcome};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Trigger template is not valid JSON: {0}")]
    InvalidTemplate(#[source] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook responded with status {0}")]
    Status(u16),

    #[error("Mail error: {0}")]
    Mail(String),

    #[error("Paybutton {0} has no owner email")]
    MissingEmail(i64),
}
