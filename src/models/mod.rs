use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Supported networks. The slug doubles as the cashaddr prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ecash,
    BitcoinCash,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Ecash, Network::BitcoinCash];

    pub fn id(&self) -> i64 {
        match self {
            Network::Ecash => 1,
            Network::BitcoinCash => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.id() == id)
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Network::Ecash => "ecash",
            Network::BitcoinCash => "bitcoincash",
        }
    }

    pub fn ticker(&self) -> &'static str {
        match self {
            Network::Ecash => "XEC",
            Network::BitcoinCash => "BCH",
        }
    }

    /// Number of decimal places between a satoshi and one coin.
    pub fn decimals(&self) -> u32 {
        match self {
            Network::Ecash => 2,
            Network::BitcoinCash => 8,
        }
    }

    /// Confirmed history older than this (unix seconds) belongs to the
    /// pre-fork chain and is never ingested.
    pub fn timestamp_threshold(&self) -> i64 {
        match self {
            Network::Ecash => 1_605_398_400,
            Network::BitcoinCash => 1_501_593_374,
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|n| n.slug().eq_ignore_ascii_case(prefix))
    }

    /// Network of a prefixed address such as `ecash:qq...`.
    pub fn from_address(address: &str) -> Option<Self> {
        address
            .split_once(':')
            .and_then(|(prefix, _)| Self::from_prefix(prefix))
    }

    pub fn sats_to_amount(&self, sats: i64) -> Decimal {
        Decimal::new(sats, self.decimals())
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// A watched address as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub address: String,
    pub network: Network,
    pub synced: bool,
    pub last_synced: Option<i64>,
    pub created_at: i64,
}

/// A persisted transaction, owned by exactly one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub hash: String,
    pub amount: Decimal,
    pub timestamp: i64,
    pub confirmed: bool,
    pub address_id: i64,
    pub op_return: Option<OpReturnData>,
}

/// Value of a key in a `key=value` payment message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpReturnValue {
    List(Vec<String>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpReturnMessage {
    Map(BTreeMap<String, OpReturnValue>),
    List(Vec<String>),
    Text(String),
}

impl fmt::Display for OpReturnMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpReturnMessage::Text(text) => f.write_str(text),
            OpReturnMessage::List(items) => f.write_str(&items.join("|")),
            OpReturnMessage::Map(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| match v {
                        OpReturnValue::Text(text) => format!("{}={}", k, text),
                        OpReturnValue::List(items) => format!("{}={}", k, items.join("|")),
                    })
                    .collect();
                f.write_str(&parts.join(" "))
            }
        }
    }
}

/// Payload of a paybutton protocol null-data output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpReturnData {
    pub message: OpReturnMessage,
    pub payment_id: String,
}

/// Network-independent transaction record for one watched address.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTransaction {
    pub hash: String,
    pub amount: Decimal,
    pub timestamp: i64,
    pub confirmed: bool,
    pub op_return: Option<OpReturnData>,
    /// Counterparties sorted by value, largest first.
    pub input_addresses: Vec<String>,
    pub output_addresses: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastType {
    NewTx,
    OldTx,
}

/// Transaction as handed to side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimplifiedTransaction {
    pub hash: String,
    pub amount: Decimal,
    pub address: String,
    pub timestamp: i64,
    pub confirmed: bool,
    pub op_return: Option<OpReturnData>,
    pub input_addresses: Vec<String>,
    pub output_addresses: Vec<String>,
}

impl SimplifiedTransaction {
    pub fn from_canonical(tx: &CanonicalTransaction, address: &str) -> Self {
        Self {
            hash: tx.hash.clone(),
            amount: tx.amount,
            address: address.to_string(),
            timestamp: tx.timestamp,
            confirmed: tx.confirmed,
            op_return: tx.op_return.clone(),
            input_addresses: tx.input_addresses.clone(),
            output_addresses: tx.output_addresses.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastTxData {
    pub address: String,
    pub message_type: BroadcastType,
    pub txs: Vec<SimplifiedTransaction>,
}

/// Per-address outcome of a sync call: transaction counts for the
/// addresses that succeeded, reasons for the ones that did not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub successful: BTreeMap<String, usize>,
    pub failed: BTreeMap<String, String>,
}

impl SyncReport {
    pub fn record_success(&mut self, address: &str, count: usize) {
        self.failed.remove(address);
        self.successful.insert(address.to_string(), count);
    }

    pub fn record_failure(&mut self, address: &str, reason: impl Into<String>) {
        self.failed.insert(address.to_string(), reason.into());
    }

    pub fn merge(&mut self, other: SyncReport) {
        self.successful.extend(other.successful);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Lifecycle of a watched address inside the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum AddressState {
    Unsynced,
    Backfilling,
    Synced,
    Subscribed,
    SyncFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paybutton {
    pub id: i64,
    pub name: String,
    pub provider_user_id: String,
    pub owner_email: Option<String>,
}

/// Paybutton fields denormalized into cached payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonDisplayData {
    pub id: i64,
    pub name: String,
    pub provider_user_id: String,
}

impl From<&Paybutton> for ButtonDisplayData {
    fn from(button: &Paybutton) -> Self {
        Self {
            id: button.id,
            name: button.name.clone(),
            provider_user_id: button.provider_user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: i64,
    pub paybutton_id: i64,
    pub send_email: bool,
    #[serde(rename = "postURL")]
    pub post_url: String,
    pub post_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerAction {
    PostData,
    SendEmail,
}

impl TriggerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerAction::PostData => "PostData",
            TriggerAction::SendEmail => "SendEmail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerLog {
    pub id: i64,
    pub trigger_id: i64,
    pub action: String,
    pub is_error: bool,
    pub data: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quote {
    Usd,
    Cad,
}

impl Quote {
    pub const ALL: [Quote; 2] = [Quote::Usd, Quote::Cad];

    pub fn slug(&self) -> &'static str {
        match self {
            Quote::Usd => "usd",
            Quote::Cad => "cad",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteValues {
    pub usd: Decimal,
    pub cad: Decimal,
}

/// Cached projection of a confirmed, positive-value transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub hash: String,
    pub timestamp: i64,
    pub amount: Decimal,
    pub value: QuoteValues,
    pub network: Network,
    pub address: String,
    pub paybuttons: Vec<ButtonDisplayData>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressBalance {
    pub balance: Decimal,
    pub payment_count: usize,
}
