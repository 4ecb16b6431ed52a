use super::mailer::Mailer;
use super::template::{self, TemplateValues};
use super::DispatchError;
use crate::db::trigger as trigger_db;
use crate::models::{BroadcastTxData, Network, Paybutton, SimplifiedTransaction, Trigger, TriggerAction};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOutcome {
    pub trigger_id: i64,
    pub action: TriggerAction,
    pub tx_hash: String,
    pub success: bool,
}

/// Detached trigger executions for one broadcast.
#[derive(Debug, Default)]
pub struct TriggerBatch {
    handles: Vec<JoinHandle<TriggerOutcome>>,
}

impl TriggerBatch {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn extend(&mut self, other: TriggerBatch) {
        self.handles.extend(other.handles);
    }

    /// Waits for every execution. Dropping the batch instead leaves the
    /// tasks running.
    pub async fn join(self) -> Vec<TriggerOutcome> {
        let results = futures::future::join_all(self.handles).await;
        results
            .into_iter()
            .filter_map(|r| match r {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!("Trigger task failed to complete: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct TriggerDispatcher {
    pool: SqlitePool,
    http: reqwest::Client,
    mailer: Arc<dyn Mailer>,
}

impl TriggerDispatcher {
    pub fn new(pool: SqlitePool, webhook_timeout: Duration, mailer: Arc<dyn Mailer>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(webhook_timeout).build()?;
        Ok(Self { pool, http, mailer })
    }

    /// Spawns one task per (trigger, transaction) for every paybutton that
    /// owns the broadcast address. Each task catches and logs its own
    /// failure; none of them affect the caller or each other.
    pub async fn execute_address_triggers(
        &self,
        broadcast: &BroadcastTxData,
        network: Network,
    ) -> Result<TriggerBatch, sqlx::Error> {
        let triggers = trigger_db::fetch_triggers_for_address(&self.pool, &broadcast.address).await?;
        let mut batch = TriggerBatch::default();
        if triggers.is_empty() {
            return Ok(batch);
        }

        info!(
            "Executing {} triggers for {} transactions of {}",
            triggers.len(),
            broadcast.txs.len(),
            broadcast.address
        );

        for tx in &broadcast.txs {
            for (trigger, paybutton) in &triggers {
                if !trigger.post_url.is_empty() {
                    let this = self.clone();
                    let (trigger, paybutton, tx) = (trigger.clone(), paybutton.clone(), tx.clone());
                    batch.handles.push(tokio::spawn(async move {
                        this.run_post(trigger, paybutton, tx, network).await
                    }));
                }
                if trigger.send_email {
                    let this = self.clone();
                    let (trigger, paybutton, tx) = (trigger.clone(), paybutton.clone(), tx.clone());
                    batch.handles.push(tokio::spawn(async move {
                        this.run_email(trigger, paybutton, tx, network).await
                    }));
                }
            }
        }

        Ok(batch)
    }

    async fn post(&self, trigger: &Trigger, body: &Value) -> Result<String, DispatchError> {
        let response = self.http.post(&trigger.post_url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DispatchError::Status(status.as_u16()));
        }
        Ok(text)
    }

    async fn run_post(
        &self,
        trigger: Trigger,
        paybutton: Paybutton,
        tx: SimplifiedTransaction,
        network: Network,
    ) -> TriggerOutcome {
        let values = TemplateValues {
            tx: &tx,
            currency: network.ticker(),
            button_name: &paybutton.name,
        };

        let result = match template::render(&trigger.post_data, &values) {
            Ok(body) => self.post(&trigger, &body).await.map(|response| (body, response)),
            Err(e) => Err(e),
        };

        let (success, data) = match result {
            Ok((body, response)) => {
                info!("Trigger {} posted {} to {}", trigger.id, tx.hash, trigger.post_url);
                (
                    true,
                    json!({ "postedData": body, "postedURL": trigger.post_url, "responseData": response }),
                )
            }
            Err(e) => {
                error!(
                    trigger_id = trigger.id,
                    template = %trigger.post_data,
                    url = %trigger.post_url,
                    "Trigger {} failed for {}: {}",
                    trigger.id,
                    tx.hash,
                    e
                );
                (
                    false,
                    json!({
                        "errorName": error_name(&e),
                        "errorMessage": e.to_string(),
                        "triggerPostData": trigger.post_data,
                        "triggerPostURL": trigger.post_url,
                    }),
                )
            }
        };

        self.log_execution(trigger.id, TriggerAction::PostData, !success, &data).await;
        TriggerOutcome {
            trigger_id: trigger.id,
            action: TriggerAction::PostData,
            tx_hash: tx.hash,
            success,
        }
    }

    async fn run_email(
        &self,
        trigger: Trigger,
        paybutton: Paybutton,
        tx: SimplifiedTransaction,
        network: Network,
    ) -> TriggerOutcome {
        let result = match paybutton.owner_email.as_deref() {
            Some(to) => {
                let subject = format!("Payment received on {}", paybutton.name);
                let body = format!(
                    "{} received {} {} in transaction {}",
                    tx.address,
                    tx.amount,
                    network.ticker(),
                    tx.hash
                );
                self.mailer
                    .send(to, &subject, &body)
                    .await
                    .map(|_| to.to_string())
                    .map_err(DispatchError::Mail)
            }
            None => Err(DispatchError::MissingEmail(paybutton.id)),
        };

        let (success, data) = match result {
            Ok(to) => (true, json!({ "email": to, "txId": tx.hash })),
            Err(e) => {
                error!(trigger_id = trigger.id, "Email trigger {} failed for {}: {}", trigger.id, tx.hash, e);
                (false, json!({ "errorName": error_name(&e), "errorMessage": e.to_string() }))
            }
        };

        self.log_execution(trigger.id, TriggerAction::SendEmail, !success, &data).await;
        TriggerOutcome {
            trigger_id: trigger.id,
            action: TriggerAction::SendEmail,
            tx_hash: tx.hash,
            success,
        }
    }

    async fn log_execution(&self, trigger_id: i64, action: TriggerAction, is_error: bool, data: &Value) {
        if let Err(e) = trigger_db::insert_trigger_log(&self.pool, trigger_id, action, is_error, data).await {
            warn!("Failed to store log for trigger {}: {}", trigger_id, e);
        }
    }
}

fn error_name(e: &DispatchError) -> &'static str {
    match e {
        DispatchError::InvalidTemplate(_) => "InvalidTemplate",
        DispatchError::Http(_) => "HttpError",
        DispatchError::Status(_) => "HttpStatus",
        DispatchError::Mail(_) => "MailError",
        DispatchError::MissingEmail(_) => "MissingEmail",
    }
}
