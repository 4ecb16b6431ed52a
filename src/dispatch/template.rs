//! Webhook body templates.
//!
//! A template is JSON text with bare placeholder tokens such as
//! `{"amount": <amount>, "tx": <txId>}`. Each token is replaced with a JSON
//! literal and the result must parse as JSON.

use super::DispatchError;
use crate::models::{OpReturnData, SimplifiedTransaction};
use serde_json::Value;
use std::str::FromStr;

const TOKENS: [&str; 10] = [
    "<amount>",
    "<currency>",
    "<txId>",
    "<address>",
    "<timestamp>",
    "<buttonName>",
    "<opReturn>",
    "<paymentId>",
    "<message>",
    "<confirmed>",
];

pub struct TemplateValues<'a> {
    pub tx: &'a SimplifiedTransaction,
    pub currency: &'a str,
    pub button_name: &'a str,
}

fn amount_literal(tx: &SimplifiedTransaction) -> String {
    let text = tx.amount.normalize().to_string();
    match serde_json::Number::from_str(&text) {
        Ok(number) => number.to_string(),
        Err(_) => Value::String(text).to_string(),
    }
}

fn op_return_literal(op_return: Option<&OpReturnData>) -> String {
    op_return
        .and_then(|data| serde_json::to_string(data).ok())
        .unwrap_or_else(|| "null".to_string())
}

fn string_literal(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Copies `template` through, replacing each known token with the literal
/// `literal_for` gives it. Inserted literals are never scanned again.
fn substitute(template: &str, literal_for: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open..];
        match TOKENS.iter().copied().find(|token| candidate.starts_with(token)) {
            Some(token) => {
                out.push_str(&literal_for(token));
                rest = &candidate[token.len()..];
            }
            None => {
                out.push('<');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// The template with every token replaced by `null`, for checking its
/// shape before any transaction exists.
pub fn probe(template: &str) -> String {
    substitute(template, |_| "null".to_string())
}

pub fn render(template: &str, values: &TemplateValues<'_>) -> Result<Value, DispatchError> {
    let tx = values.tx;
    let op_return = tx.op_return.as_ref();
    let body = substitute(template, |token| match token {
        "<amount>" => amount_literal(tx),
        "<currency>" => string_literal(values.currency),
        "<txId>" => string_literal(&tx.hash),
        "<address>" => string_literal(&tx.address),
        "<timestamp>" => tx.timestamp.to_string(),
        "<buttonName>" => string_literal(values.button_name),
        "<opReturn>" => op_return_literal(op_return),
        "<paymentId>" => string_literal(op_return.map(|o| o.payment_id.as_str()).unwrap_or("")),
        "<message>" => string_literal(&op_return.map(|o| o.message.to_string()).unwrap_or_default()),
        "<confirmed>" => tx.confirmed.to_string(),
        _ => "null".to_string(),
    });

    serde_json::from_str(&body).map_err(DispatchError::InvalidTemplate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpReturnMessage;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn tx() -> SimplifiedTransaction {
        SimplifiedTransaction {
            hash: "ab".repeat(32),
            amount: Decimal::new(12_50, 2),
            address: "ecash:qqg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyquz9y96w".to_string(),
            timestamp: 1_700_000_000,
            confirmed: true,
            op_return: Some(OpReturnData {
                message: OpReturnMessage::Text("thanks".into()),
                payment_id: "0a0b".into(),
            }),
            input_addresses: vec![],
            output_addresses: vec![],
        }
    }

    #[test]
    fn renders_all_tokens() {
        let tx = tx();
        let values = TemplateValues { tx: &tx, currency: "XEC", button_name: "Shop" };
        let body = render(
            r#"{"amount": <amount>, "currency": <currency>, "txId": <txId>, "name": <buttonName>,
                "ts": <timestamp>, "paymentId": <paymentId>, "message": <message>,
                "confirmed": <confirmed>, "opReturn": <opReturn>, "address": <address>}"#,
            &values,
        )
        .unwrap();
        assert_eq!(body["amount"], json!(12.5));
        assert_eq!(body["currency"], "XEC");
        assert_eq!(body["name"], "Shop");
        assert_eq!(body["ts"], 1_700_000_000);
        assert_eq!(body["paymentId"], "0a0b");
        assert_eq!(body["message"], "thanks");
        assert_eq!(body["confirmed"], true);
        assert_eq!(body["opReturn"]["paymentId"], "0a0b");
    }

    #[test]
    fn probe_replaces_every_token() {
        let probed = probe(r#"{"a": <amount>, "b": [<txId>, <opReturn>]}"#);
        assert_eq!(probed, r#"{"a": null, "b": [null, null]}"#);
    }

    #[test]
    fn tokens_inside_transaction_text_stay_literal() {
        let mut tx = tx();
        tx.op_return = Some(OpReturnData {
            message: OpReturnMessage::Text("hi <message> <confirmed>".into()),
            payment_id: "".into(),
        });
        let values = TemplateValues { tx: &tx, currency: "XEC", button_name: "<paymentId> shop" };
        let body = render(
            r#"{"op": <opReturn>, "m": <message>, "name": <buttonName>}"#,
            &values,
        )
        .unwrap();
        assert_eq!(body["m"], "hi <message> <confirmed>");
        assert_eq!(body["op"]["message"], "hi <message> <confirmed>");
        assert_eq!(body["name"], "<paymentId> shop");
        assert_eq!(body.as_object().unwrap().len(), 3, "No fields can be injected");
    }

    #[test]
    fn unknown_angle_brackets_pass_through() {
        assert_eq!(probe(r#"{"a": "<b>", "c": <amount>}"#), r#"{"a": "<b>", "c": null}"#);
    }

    #[test]
    fn malformed_template_is_an_error() {
        let tx = tx();
        let values = TemplateValues { tx: &tx, currency: "XEC", button_name: "Shop" };
        let err = render(r#"{"amount": <amount>, "currency": <currency>"#, &values).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTemplate(_)));
    }
}
