//! Cashaddr encoding shared by eCash and Bitcoin Cash.
//!
//! Only 160-bit P2PKH and P2SH payloads are supported, which covers every
//! address a paybutton can be registered with.

use crate::models::Network;
use thiserror::Error;

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const GENERATORS: [u64; 5] = [
    0x98f2bc8e61,
    0x79b76d99e2,
    0xf33e5fb3c4,
    0xae2eabe2a8,
    0x1e4f43e470,
];
const CHECKSUM_LEN: usize = 8;
const HASH_LEN: usize = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CashAddrError {
    #[error("Address has no network prefix: {0}")]
    MissingPrefix(String),

    #[error("Unknown address prefix: {0}")]
    UnknownPrefix(String),

    #[error("Invalid character {0:?} in address")]
    InvalidCharacter(char),

    #[error("Address checksum mismatch")]
    InvalidChecksum,

    #[error("Unsupported address payload")]
    InvalidPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    P2pkh,
    P2sh,
}

impl AddressKind {
    fn version_byte(&self) -> u8 {
        match self {
            AddressKind::P2pkh => 0x00,
            AddressKind::P2sh => 0x08,
        }
    }

    /// Script type segment used by the indexer's script endpoints.
    pub fn script_type(&self) -> &'static str {
        match self {
            AddressKind::P2pkh => "p2pkh",
            AddressKind::P2sh => "p2sh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAddress {
    pub network: Network,
    pub kind: AddressKind,
    pub hash: [u8; HASH_LEN],
}

impl DecodedAddress {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Hex of the locking script paying this address.
    pub fn output_script(&self) -> String {
        match self.kind {
            AddressKind::P2pkh => format!("76a914{}88ac", self.hash_hex()),
            AddressKind::P2sh => format!("a914{}87", self.hash_hex()),
        }
    }
}

fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07_ffff_ffff) << 5) ^ u64::from(d);
        for (i, generator) in GENERATORS.iter().enumerate() {
            if c0 & (1 << i) != 0 {
                c ^= generator;
            }
        }
    }
    c ^ 1
}

fn expand_prefix(prefix: &str) -> Vec<u8> {
    let mut out: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    out.push(0);
    out
}

fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let max = (1u32 << to) - 1;
    let max_acc = (1u32 << (from + to - 1)) - 1;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);
    for &value in data {
        let value = u32::from(value);
        if value >> from != 0 {
            return None;
        }
        acc = ((acc << from) | value) & max_acc;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & max) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & max) != 0 {
        return None;
    }
    Some(out)
}

pub fn encode(network: Network, kind: AddressKind, hash: &[u8; HASH_LEN]) -> String {
    let prefix = network.slug();
    let mut payload = Vec::with_capacity(HASH_LEN + 1);
    payload.push(kind.version_byte());
    payload.extend_from_slice(hash);
    // 8-to-5 conversion with padding cannot fail
    let data = convert_bits(&payload, 8, 5, true).unwrap_or_default();

    let mut checksum_input = expand_prefix(prefix);
    checksum_input.extend_from_slice(&data);
    checksum_input.extend_from_slice(&[0u8; CHECKSUM_LEN]);
    let checksum = polymod(&checksum_input);

    let mut out = String::with_capacity(prefix.len() + 1 + data.len() + CHECKSUM_LEN);
    out.push_str(prefix);
    out.push(':');
    for d in &data {
        out.push(CHARSET[*d as usize] as char);
    }
    for i in 0..CHECKSUM_LEN {
        let d = (checksum >> (5 * (CHECKSUM_LEN - 1 - i))) & 0x1f;
        out.push(CHARSET[d as usize] as char);
    }
    out
}

pub fn decode(address: &str) -> Result<DecodedAddress, CashAddrError> {
    let lower = address.trim().to_ascii_lowercase();
    let (prefix, body) = lower
        .split_once(':')
        .ok_or_else(|| CashAddrError::MissingPrefix(address.to_string()))?;
    let network =
        Network::from_prefix(prefix).ok_or_else(|| CashAddrError::UnknownPrefix(prefix.to_string()))?;

    let mut data = Vec::with_capacity(body.len());
    for ch in body.chars() {
        let idx = CHARSET
            .iter()
            .position(|c| *c as char == ch)
            .ok_or(CashAddrError::InvalidCharacter(ch))?;
        data.push(idx as u8);
    }
    if data.len() <= CHECKSUM_LEN {
        return Err(CashAddrError::InvalidPayload);
    }

    let mut checksum_input = expand_prefix(prefix);
    checksum_input.extend_from_slice(&data);
    if polymod(&checksum_input) != 0 {
        return Err(CashAddrError::InvalidChecksum);
    }

    let payload = convert_bits(&data[..data.len() - CHECKSUM_LEN], 5, 8, false)
        .ok_or(CashAddrError::InvalidPayload)?;
    if payload.len() != HASH_LEN + 1 {
        return Err(CashAddrError::InvalidPayload);
    }
    let kind = match payload[0] {
        0x00 => AddressKind::P2pkh,
        0x08 => AddressKind::P2sh,
        _ => return Err(CashAddrError::InvalidPayload),
    };
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&payload[1..]);

    Ok(DecodedAddress { network, kind, hash })
}

/// Address paid by a locking script, if the script is a standard
/// P2PKH or P2SH one.
pub fn output_script_to_address(network: Network, script_hex: &str) -> Option<String> {
    let script = script_hex.to_ascii_lowercase();
    let (kind, hash_hex) = if script.len() == 50 && script.starts_with("76a914") && script.ends_with("88ac") {
        (AddressKind::P2pkh, &script[6..46])
    } else if script.len() == 46 && script.starts_with("a914") && script.ends_with("87") {
        (AddressKind::P2sh, &script[4..44])
    } else {
        return None;
    };
    let bytes = hex::decode(hash_hex).ok()?;
    let hash: [u8; HASH_LEN] = bytes.try_into().ok()?;
    Some(encode(network, kind, &hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "76a04053bda0a88bda5177b86a15c3b29f559873";

    fn hash() -> [u8; HASH_LEN] {
        hex::decode(HASH).unwrap().try_into().unwrap()
    }

    #[test]
    fn encodes_known_vectors() {
        assert_eq!(
            encode(Network::BitcoinCash, AddressKind::P2pkh, &hash()),
            "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a"
        );
        assert_eq!(
            encode(Network::BitcoinCash, AddressKind::P2sh, &hash()),
            "bitcoincash:ppm2qsznhks23z7629mms6s4cwef74vcwvn0h829pq"
        );
        assert_eq!(
            encode(Network::Ecash, AddressKind::P2pkh, &hash()),
            "ecash:qpm2qsznhks23z7629mms6s4cwef74vcwva87rkuu2"
        );
    }

    #[test]
    fn decodes_and_builds_scripts() {
        let decoded = decode("ecash:ppm2qsznhks23z7629mms6s4cwef74vcwv2zrv3l8h").unwrap();
        assert_eq!(decoded.network, Network::Ecash);
        assert_eq!(decoded.kind, AddressKind::P2sh);
        assert_eq!(decoded.hash_hex(), HASH);
        assert_eq!(decoded.output_script(), format!("a914{}87", HASH));

        let upper = decode("BITCOINCASH:QPM2QSZNHKS23Z7629MMS6S4CWEF74VCWVY22GDX6A").unwrap();
        assert_eq!(upper.output_script(), format!("76a914{}88ac", HASH));
    }

    #[test]
    fn rejects_bad_addresses() {
        assert_eq!(
            decode("ecash:qpm2qsznhks23z7629mms6s4cwef74vcwva87rkuu3"),
            Err(CashAddrError::InvalidChecksum)
        );
        assert!(matches!(decode("qpm2qsznhks23z7629"), Err(CashAddrError::MissingPrefix(_))));
        assert!(matches!(decode("bchtest:qpm2qsznhks"), Err(CashAddrError::UnknownPrefix(_))));
        assert_eq!(decode("ecash:qpm2qsznhkb"), Err(CashAddrError::InvalidCharacter('b')));
    }

    #[test]
    fn script_to_address_roundtrip() {
        let script = format!("76a914{}88ac", HASH);
        assert_eq!(
            output_script_to_address(Network::Ecash, &script).as_deref(),
            Some("ecash:qpm2qsznhks23z7629mms6s4cwef74vcwva87rkuu2")
        );
        assert_eq!(output_script_to_address(Network::Ecash, "6a0450415900"), None);
    }
}
