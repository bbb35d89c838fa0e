//! Pure decoding of CTF Exchange `OrderFilled` logs.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;

use crate::errors::DecodeError;
use crate::models::Side;

/// CTF Exchange contract on Polygon.
pub const CTF_EXCHANGE: &str = "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e";

/// NegRisk CTF Exchange contract on Polygon.
pub const NEG_RISK_CTF_EXCHANGE: &str = "0xc5d563a36ae78145c45a50134d48a1215220f80a";

/// Keccak256 of OrderFilled(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)
pub const ORDER_FILLED_TOPIC: &str =
    "0xd0a08e8c493f9c94f29311604c9de1b4e8c8d4c06bd0c789af57f2d65bfec0f6";

/// USDC and outcome tokens both use 6 decimals.
const AMOUNT_DECIMALS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Maker,
    Taker,
}

/// Side, size and price of a fill from one party's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillTerms {
    pub side: Side,
    /// Outcome token id, decimal string.
    pub asset_id: String,
    /// Outcome tokens received (buy) or given (sell).
    pub size: Decimal,
    /// USDC paid or received per outcome token.
    pub price: Decimal,
}

/// Compute the fill from `role`'s perspective.
///
/// `maker_asset` is what the maker gives and the taker receives; `taker_asset`
/// is what the taker gives and the maker receives. Asset id 0 is USDC. Exactly one
/// of the two assets must be USDC and both amounts must be non-zero.
pub fn fill_terms(
    role: Role,
    maker_asset: &str,
    taker_asset: &str,
    maker_amount: Decimal,
    taker_amount: Decimal,
) -> Result<FillTerms, DecodeError> {
    let maker_gives_usdc = is_zero_asset(maker_asset);
    let taker_gives_usdc = is_zero_asset(taker_asset);
    if maker_gives_usdc == taker_gives_usdc {
        return Err(DecodeError::AmbiguousAssets);
    }
    if maker_amount.is_zero() || taker_amount.is_zero() {
        return Err(DecodeError::ZeroAmount);
    }

    let token = if maker_gives_usdc {
        format_asset_id(taker_asset)
    } else {
        format_asset_id(maker_asset)
    };

    let (side, size, price) = match (role, maker_gives_usdc) {
        // Maker gives USDC, receives tokens.
        (Role::Maker, true) => (Side::Buy, taker_amount, maker_amount / taker_amount),
        // Maker gives tokens, receives USDC.
        (Role::Maker, false) => (Side::Sell, maker_amount, taker_amount / maker_amount),
        // Taker gives USDC (taker asset is zero), receives the maker's tokens.
        (Role::Taker, false) => (Side::Buy, maker_amount, taker_amount / maker_amount),
        // Taker gives tokens, receives the maker's USDC.
        (Role::Taker, true) => (Side::Sell, taker_amount, maker_amount / taker_amount),
    };

    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return Err(DecodeError::PriceOutOfRange(price));
    }

    Ok(FillTerms {
        side,
        asset_id: token,
        size,
        price,
    })
}

/// A log entry as delivered by `eth_subscribe("logs")` or `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub log_index: Option<String>,
    /// Only some nodes include this on logs; block heads always carry it.
    #[serde(default)]
    pub block_timestamp: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn block(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(parse_hex_u64)
    }

    pub fn index(&self) -> Option<u64> {
        self.log_index.as_deref().and_then(parse_hex_u64)
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.block_timestamp.as_deref().and_then(parse_hex_u64)
    }
}

/// A tracked wallet's side of a decoded `OrderFilled` log.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFill {
    pub wallet: String,
    pub role: Role,
    pub terms: FillTerms,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

impl DecodedFill {
    pub fn usdc_value(&self) -> Decimal {
        self.terms.size * self.terms.price
    }
}

/// Decode an `OrderFilled` log for whichever tracked wallet is party to it.
///
/// Returns `Ok(None)` when neither maker nor taker is tracked, or the log is not
/// an `OrderFilled` event. When both parties are tracked the maker wins.
pub fn decode_order_filled(
    log: &RawLog,
    tracked: &HashSet<String>,
) -> Result<Option<DecodedFill>, DecodeError> {
    if log.topics.len() < 4 || log.topics[0].to_lowercase() != ORDER_FILLED_TOPIC {
        return Ok(None);
    }

    // topics[1] = orderHash, topics[2] = maker, topics[3] = taker
    let maker = extract_address(&log.topics[2])?;
    let taker = extract_address(&log.topics[3])?;

    let (wallet, role) = if tracked.contains(&maker) {
        (maker, Role::Maker)
    } else if tracked.contains(&taker) {
        (taker, Role::Taker)
    } else {
        return Ok(None);
    };

    let tx_hash = log
        .transaction_hash
        .clone()
        .ok_or(DecodeError::MissingField("transactionHash"))?;
    let log_index = log.index().ok_or(DecodeError::MissingField("logIndex"))?;
    let block_number = log.block().ok_or(DecodeError::MissingField("blockNumber"))?;

    // data: makerAssetId, takerAssetId, makerAmountFilled, takerAmountFilled, fee
    let data = log.data.strip_prefix("0x").unwrap_or(&log.data);
    if data.len() < 320 || !data.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidNumber {
            field: "data",
            value: format!("{} hex chars", data.len()),
        });
    }

    let maker_amount = parse_uint256_decimal(&data[128..192], AMOUNT_DECIMALS)?;
    let taker_amount = parse_uint256_decimal(&data[192..256], AMOUNT_DECIMALS)?;
    let terms = fill_terms(role, &data[0..64], &data[64..128], maker_amount, taker_amount)?;

    Ok(Some(DecodedFill {
        wallet,
        role,
        terms,
        tx_hash: tx_hash.to_lowercase(),
        log_index,
        block_number,
    }))
}

/// Extract a 20-byte address from a 32-byte zero-padded hex topic.
pub fn extract_address(topic: &str) -> Result<String, DecodeError> {
    let hex = topic.strip_prefix("0x").unwrap_or(topic);
    if hex.len() < 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidNumber {
            field: "topic",
            value: topic.to_string(),
        });
    }
    let addr = &hex[hex.len() - 40..];
    Ok(format!("0x{addr}").to_lowercase())
}

/// Pad a 20-byte address into a 32-byte topic, for log filters.
pub fn address_topic(address: &str) -> String {
    let hex = address.strip_prefix("0x").unwrap_or(address).to_lowercase();
    format!("0x{hex:0>64}")
}

pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(hex, 16).ok()
}

/// Parse a 64-char hex uint256 into a Decimal with the given decimal places.
fn parse_uint256_decimal(hex: &str, decimals: u32) -> Result<Decimal, DecodeError> {
    let trimmed = hex.trim_start_matches('0');
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }
    let value = u128::from_str_radix(trimmed, 16)
        .ok()
        .and_then(|v| i128::try_from(v).ok())
        .and_then(|v| Decimal::try_from_i128_with_scale(v, decimals).ok())
        .ok_or_else(|| DecodeError::InvalidNumber {
            field: "amount",
            value: hex.to_string(),
        })?;
    Ok(value)
}

/// A hex-encoded uint256 asset id of zero is the USDC side of the trade.
fn is_zero_asset(hex: &str) -> bool {
    hex.trim_start_matches("0x").trim_start_matches('0').is_empty()
}

/// Convert a hex uint256 to its decimal string. ERC-1155 token ids overflow u128.
fn format_asset_id(hex: &str) -> String {
    let hex = hex.trim_start_matches("0x").trim_start_matches('0');
    if hex.is_empty() {
        return "0".to_string();
    }

    if hex.len() <= 32 {
        if let Ok(v) = u128::from_str_radix(hex, 16) {
            return v.to_string();
        }
    }

    // Decimal digits, least significant first.
    let mut digits: Vec<u32> = vec![0];
    for ch in hex.chars() {
        let Some(nibble) = ch.to_digit(16) else {
            return hex.to_string();
        };
        let mut carry = nibble;
        for d in digits.iter_mut() {
            let val = *d * 16 + carry;
            *d = val % 10;
            carry = val / 10;
        }
        while carry > 0 {
            digits.push(carry % 10);
            carry /= 10;
        }
    }

    digits
        .iter()
        .rev()
        .filter_map(|d| char::from_digit(*d, 10))
        .collect()
}
