//! Wire types of the Chronik indexer API.

use crate::models::Network;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
    /// Absent for coinbase inputs.
    #[serde(default)]
    pub output_script: Option<String>,
    #[serde(default)]
    pub sats: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOutput {
    pub output_script: String,
    #[serde(default)]
    pub sats: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub height: i64,
    pub hash: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChronikTx {
    pub txid: String,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub block: Option<BlockMeta>,
    #[serde(default)]
    pub time_first_seen: i64,
}

impl ChronikTx {
    /// Block time when mined, first-seen time otherwise.
    pub fn timestamp(&self) -> i64 {
        self.block
            .as_ref()
            .map(|b| b.timestamp)
            .unwrap_or(self.time_first_seen)
    }
}

/// A transaction tagged with the network it was fetched from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "network", content = "tx", rename_all = "lowercase")]
pub enum NativeTx {
    Ecash(ChronikTx),
    BitcoinCash(ChronikTx),
}

impl NativeTx {
    pub fn new(network: Network, tx: ChronikTx) -> Self {
        match network {
            Network::Ecash => NativeTx::Ecash(tx),
            Network::BitcoinCash => NativeTx::BitcoinCash(tx),
        }
    }

    pub fn network(&self) -> Network {
        match self {
            NativeTx::Ecash(_) => Network::Ecash,
            NativeTx::BitcoinCash(_) => Network::BitcoinCash,
        }
    }

    pub fn tx(&self) -> &ChronikTx {
        match self {
            NativeTx::Ecash(tx) | NativeTx::BitcoinCash(tx) => tx,
        }
    }

    pub fn txid(&self) -> &str {
        &self.tx().txid
    }

    pub fn is_confirmed(&self) -> bool {
        self.tx().block.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxHistoryPage {
    #[serde(default)]
    pub txs: Vec<ChronikTx>,
    #[serde(default)]
    pub num_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainInfo {
    pub tip_hash: String,
    pub tip_height: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResponse {
    pub block_info: BlockMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxMsgType {
    TxAddedToMempool,
    TxRemovedFromMempool,
    TxConfirmed,
    TxFinalized,
}

/// Push message received over the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename_all = "camelCase")]
    Tx { msg_type: TxMsgType, txid: String },
    #[serde(rename_all = "camelCase")]
    Block {
        msg_type: String,
        block_hash: String,
        #[serde(default)]
        block_height: i64,
    },
    Error { msg: String },
}

/// Subscription request sent over the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsRequest {
    #[serde(rename_all = "camelCase")]
    Script {
        subscribe: bool,
        script_type: String,
        payload: String,
    },
    Blocks { subscribe: bool },
}
