//! Conversion of indexer transactions into canonical records.

use crate::blockchain::cashaddr::{self, output_script_to_address};
use crate::blockchain::models::NativeTx;
use crate::models::{Address, CanonicalTransaction, Network, OpReturnData, OpReturnMessage, OpReturnValue};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const PAY_PROTOCOL_PREFIX: &str = "6a0450415900";
const PUSHDATA1: &str = "4c";

/// Builds the canonical record of `native` as seen by `watched`.
///
/// Returns `None` when the watched address receives nothing from the
/// transaction; spends from the address alone never produce a record.
pub fn normalize(native: &NativeTx, watched: &Address, confirmed: bool) -> Option<CanonicalTransaction> {
    let network = native.network();
    if network != watched.network {
        warn!(
            "Transaction {} from {} offered to {} address {}",
            native.txid(),
            network,
            watched.network,
            watched.address
        );
        return None;
    }

    let script = match cashaddr::decode(&watched.address) {
        Ok(decoded) => decoded.output_script(),
        Err(e) => {
            warn!("Cannot derive script for {}: {}", watched.address, e);
            return None;
        }
    };

    let tx = native.tx();
    let received: i64 = tx
        .outputs
        .iter()
        .filter(|o| o.output_script.eq_ignore_ascii_case(&script))
        .map(|o| o.sats)
        .sum();
    if received <= 0 {
        debug!("Skipping {} for {}: nothing received", tx.txid, watched.address);
        return None;
    }

    let op_return = tx
        .outputs
        .iter()
        .find_map(|o| parse_pay_output(&o.output_script));

    let input_addresses = rank_addresses(
        network,
        tx.inputs
            .iter()
            .filter_map(|i| i.output_script.as_deref().map(|s| (s, i.sats))),
    );
    let output_addresses = rank_addresses(
        network,
        tx.outputs.iter().map(|o| (o.output_script.as_str(), o.sats)),
    );

    Some(CanonicalTransaction {
        hash: tx.txid.clone(),
        amount: network.sats_to_amount(received),
        timestamp: tx.timestamp(),
        confirmed: confirmed || native.is_confirmed(),
        op_return,
        input_addresses,
        output_addresses,
    })
}

/// Every watched address that shows up anywhere in the transaction.
pub fn related_addresses(native: &NativeTx) -> Vec<String> {
    let network = native.network();
    let tx = native.tx();
    let mut out: Vec<String> = tx
        .inputs
        .iter()
        .filter_map(|i| i.output_script.as_deref())
        .chain(tx.outputs.iter().map(|o| o.output_script.as_str()))
        .filter_map(|s| output_script_to_address(network, s))
        .collect();
    out.sort();
    out.dedup();
    out
}

fn rank_addresses<'a>(network: Network, scripts: impl Iterator<Item = (&'a str, i64)>) -> Vec<String> {
    let mut totals: HashMap<String, i64> = HashMap::new();
    for (script, sats) in scripts {
        if let Some(address) = output_script_to_address(network, script) {
            *totals.entry(address).or_default() += sats;
        }
    }
    let mut ranked: Vec<(String, i64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().map(|(address, _)| address).collect()
}

fn read_push(script: &str, at: usize) -> Option<(usize, usize)> {
    let mut start = at + 2;
    let mut len_hex = script.get(at..start)?;
    if len_hex.eq_ignore_ascii_case(PUSHDATA1) {
        len_hex = script.get(start..start + 2)?;
        start += 2;
    }
    let len = usize::from_str_radix(len_hex, 16).ok()?;
    Some((start, len))
}

/// Parses a paybutton protocol output:
/// `OP_RETURN <"PAY\0"> <version> <data> [<payment id>]`.
///
/// Truncated or non UTF-8 payloads yield `None`; a truncated payment id is
/// dropped.
pub fn parse_pay_output(script: &str) -> Option<OpReturnData> {
    if script.len() % 2 != 0 {
        return None;
    }
    let prefix = script.get(..PAY_PROTOCOL_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(PAY_PROTOCOL_PREFIX) {
        return None;
    }
    // skip the version byte
    let (data_start, data_len) = read_push(script, PAY_PROTOCOL_PREFIX.len() + 2)?;
    let data_end = data_start + data_len * 2;
    let data = hex::decode(script.get(data_start..data_end)?).ok()?;
    let raw_message = String::from_utf8(data).ok()?;

    let payment_id = match read_push(script, data_end) {
        Some((id_start, id_len)) => script
            .get(id_start..id_start + id_len * 2)
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default(),
        None => String::new(),
    };

    Some(OpReturnData {
        message: parse_message(&raw_message),
        payment_id,
    })
}

fn split_list(value: &str) -> Vec<String> {
    value.split('|').map(str::to_string).collect()
}

/// `k=v k2=a|b` becomes a map, `a|b` a list, anything else stays text.
pub fn parse_message(raw: &str) -> OpReturnMessage {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let is_map = !tokens.is_empty()
        && tokens
            .iter()
            .all(|t| matches!(t.split_once('='), Some((k, _)) if !k.is_empty()));
    if is_map {
        let mut map = BTreeMap::new();
        for token in tokens {
            if let Some((key, value)) = token.split_once('=') {
                let value = if value.contains('|') {
                    OpReturnValue::List(split_list(value))
                } else {
                    OpReturnValue::Text(value.to_string())
                };
                map.insert(key.to_string(), value);
            }
        }
        return OpReturnMessage::Map(map);
    }
    if raw.contains('|') {
        return OpReturnMessage::List(split_list(raw));
    }
    OpReturnMessage::Text(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::models::{BlockMeta, ChronikTx, TxInput, TxOutput};
    use rust_decimal::Decimal;

    const WATCHED: &str = "ecash:qpm2qsznhks23z7629mms6s4cwef74vcwva87rkuu2";
    const WATCHED_SCRIPT: &str = "76a91476a04053bda0a88bda5177b86a15c3b29f55987388ac";
    const OTHER_SCRIPT: &str = "76a914111111111111111111111111111111111111111188ac";

    fn watched() -> Address {
        Address {
            id: 1,
            address: WATCHED.to_string(),
            network: Network::Ecash,
            synced: false,
            last_synced: None,
            created_at: 0,
        }
    }

    fn hex_of(s: &str) -> String {
        hex::encode(s.as_bytes())
    }

    fn pay_script(message: &str, payment_id: Option<&str>) -> String {
        let mut script = format!("{}00{:02x}{}", PAY_PROTOCOL_PREFIX, message.len(), hex_of(message));
        if let Some(id) = payment_id {
            script.push_str(&format!("{:02x}{}", id.len() / 2, id));
        }
        script
    }

    fn tx(outputs: Vec<(&str, i64)>, inputs: Vec<(&str, i64)>, block: Option<i64>) -> NativeTx {
        NativeTx::Ecash(ChronikTx {
            txid: "aa".repeat(32),
            inputs: inputs
                .into_iter()
                .map(|(s, v)| TxInput { output_script: Some(s.to_string()), sats: v })
                .collect(),
            outputs: outputs
                .into_iter()
                .map(|(s, v)| TxOutput { output_script: s.to_string(), sats: v })
                .collect(),
            block: block.map(|ts| BlockMeta { height: 800_000, hash: "bb".repeat(32), timestamp: ts }),
            time_first_seen: 1_700_000_100,
        })
    }

    #[test]
    fn sums_outputs_paying_watched_address() {
        let native = tx(
            vec![(WATCHED_SCRIPT, 1000), (OTHER_SCRIPT, 5000), (WATCHED_SCRIPT, 250)],
            vec![(OTHER_SCRIPT, 6300)],
            Some(1_700_000_000),
        );
        let canonical = normalize(&native, &watched(), false).unwrap();
        assert_eq!(canonical.amount, Decimal::new(1250, 2));
        assert_eq!(canonical.timestamp, 1_700_000_000);
        assert!(canonical.confirmed);
        assert_eq!(canonical.input_addresses.len(), 1);
        assert_eq!(canonical.output_addresses[0], "ecash:qqg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyquz9y96w");
    }

    #[test]
    fn pure_spend_is_discarded() {
        let native = tx(vec![(OTHER_SCRIPT, 900)], vec![(WATCHED_SCRIPT, 1000)], Some(1_700_000_000));
        assert!(normalize(&native, &watched(), true).is_none());
    }

    #[test]
    fn change_back_to_self_counts_only_outputs() {
        let native = tx(
            vec![(OTHER_SCRIPT, 500), (WATCHED_SCRIPT, 400)],
            vec![(WATCHED_SCRIPT, 1000)],
            None,
        );
        let canonical = normalize(&native, &watched(), false).unwrap();
        assert_eq!(canonical.amount, Decimal::new(400, 2));
        assert!(!canonical.confirmed);
        assert_eq!(canonical.timestamp, 1_700_000_100);
    }

    #[test]
    fn extracts_pay_protocol_payload() {
        let script = pay_script("order=42 items=a|b", Some("0a1b2c3d"));
        let native = tx(vec![(&script, 0), (WATCHED_SCRIPT, 1000)], vec![], None);
        let op_return = normalize(&native, &watched(), false).unwrap().op_return.unwrap();
        assert_eq!(op_return.payment_id, "0a1b2c3d");
        match op_return.message {
            OpReturnMessage::Map(map) => {
                assert_eq!(map.get("order"), Some(&OpReturnValue::Text("42".into())));
                assert_eq!(map.get("items"), Some(&OpReturnValue::List(vec!["a".into(), "b".into()])));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn malformed_payload_is_ignored() {
        let truncated = format!("{}0010{}", PAY_PROTOCOL_PREFIX, hex_of("short"));
        let native = tx(vec![(&truncated, 0), (WATCHED_SCRIPT, 1000)], vec![], None);
        let canonical = normalize(&native, &watched(), false).unwrap();
        assert!(canonical.op_return.is_none());
    }

    #[test]
    fn non_utf8_message_drops_payload() {
        let script = format!("{}0002fffe", PAY_PROTOCOL_PREFIX);
        assert!(parse_pay_output(&script).is_none());
        let native = tx(vec![(&script, 0), (WATCHED_SCRIPT, 1000)], vec![], None);
        let canonical = normalize(&native, &watched(), false).unwrap();
        assert!(canonical.op_return.is_none(), "Invalid text is not stored as a message");
    }

    #[test]
    fn pushdata1_payload() {
        let message = "x".repeat(80);
        let script = format!("{}004c{:02x}{}", PAY_PROTOCOL_PREFIX, message.len(), hex_of(&message));
        let parsed = parse_pay_output(&script).unwrap();
        assert_eq!(parsed.message, OpReturnMessage::Text(message));
        assert_eq!(parsed.payment_id, "");
    }

    #[test]
    fn message_shapes() {
        assert_eq!(parse_message("hello world"), OpReturnMessage::Text("hello world".into()));
        assert_eq!(
            parse_message("a|b|c"),
            OpReturnMessage::List(vec!["a".into(), "b".into(), "c".into()])
        );
        assert!(matches!(parse_message("k=v"), OpReturnMessage::Map(_)));
        assert_eq!(parse_message(""), OpReturnMessage::Text(String::new()));
    }

    #[test]
    fn related_addresses_cover_both_sides() {
        let native = tx(vec![(OTHER_SCRIPT, 10)], vec![(WATCHED_SCRIPT, 20)], None);
        let related = related_addresses(&native);
        assert!(related.contains(&WATCHED.to_string()));
        assert_eq!(related.len(), 2);
    }
}
