use crate::blockchain::cashaddr::{self, CashAddrError};
use crate::models::Network;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: CashAddrError,
    },

    #[error("Address {0} is not on {1}")]
    WrongNetwork(String, Network),

    #[error("Invalid JSON template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Checks a prefixed cashaddr and returns its network.
pub fn validate_address(address: &str) -> Result<Network, ValidationError> {
    if address.trim().is_empty() {
        return Err(ValidationError::MissingParameter("address".to_string()));
    }
    cashaddr::decode(address)
        .map(|decoded| decoded.network)
        .map_err(|source| ValidationError::InvalidAddress {
            address: address.to_string(),
            source,
        })
}

pub fn validate_address_for(address: &str, network: Network) -> Result<(), ValidationError> {
    if validate_address(address)? != network {
        return Err(ValidationError::WrongNetwork(address.to_string(), network));
    }
    Ok(())
}

pub fn validate_addresses(addresses: &[String]) -> Result<(), ValidationError> {
    if addresses.is_empty() {
        return Err(ValidationError::MissingParameter("addresses".to_string()));
    }
    addresses.iter().try_for_each(|a| validate_address(a).map(|_| ()))
}

/// Post data must be a JSON object once every placeholder is replaced by a
/// literal.
pub fn validate_post_data(template: &str) -> Result<(), ValidationError> {
    if template.trim().is_empty() {
        return Ok(());
    }
    let probe = crate::dispatch::template::probe(template);
    match serde_json::from_str::<serde_json::Value>(&probe) {
        Ok(serde_json::Value::Object(_)) => Ok(()),
        Ok(_) => Err(ValidationError::InvalidTemplate("expected a JSON object".to_string())),
        Err(e) => Err(ValidationError::InvalidTemplate(e.to_string())),
    }
}

/// A webhook needs both an http(s) URL and post data; email-only
/// triggers carry neither.
pub fn validate_trigger(send_email: bool, post_url: &str, post_data: &str) -> Result<(), ValidationError> {
    let post_url = post_url.trim();
    if post_url.is_empty() != post_data.trim().is_empty() {
        return Err(ValidationError::InvalidParameter(
            "postURL and postData must be given together".to_string(),
        ));
    }
    if post_url.is_empty() {
        if !send_email {
            return Err(ValidationError::MissingParameter("postURL or sendEmail".to_string()));
        }
        return Ok(());
    }
    if !(post_url.starts_with("http://") || post_url.starts_with("https://")) {
        return Err(ValidationError::InvalidParameter(format!("postURL {} is not an http(s) URL", post_url)));
    }
    validate_post_data(post_data)
}
