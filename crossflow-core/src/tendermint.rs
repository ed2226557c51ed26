use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

/// Results of executing one Tendermint block.
///
/// Mirrors the `block_results` RPC response: transactional events grouped per
/// tx, plus the non-transactional events emitted by block finalization.
/// Newer chains emit `finalize_block_events`; older ABCI versions (and
/// Namada) still use `end_block_events`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockResults {
    /// Height these results belong to.
    #[serde(deserialize_with = "string_or_u64")]
    pub height: u64,
    /// Per-transaction execution results, in tx order.
    #[serde(deserialize_with = "null_as_empty")]
    pub txs_results: Vec<TxResult>,
    /// Events emitted by FinalizeBlock.
    #[serde(deserialize_with = "null_as_empty")]
    pub finalize_block_events: Vec<AbciEvent>,
    /// Events emitted by EndBlock.
    #[serde(deserialize_with = "null_as_empty")]
    pub end_block_events: Vec<AbciEvent>,
}

/// Execution result of a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxResult {
    /// ABCI result code; zero is success.
    pub code: u32,
    /// Events emitted during execution.
    #[serde(deserialize_with = "null_as_empty")]
    pub events: Vec<AbciEvent>,
}

impl TxResult {
    /// Whether the transaction executed successfully.
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// One ABCI event with keyed attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbciEvent {
    /// Event type, e.g. `coin_received`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Key/value attributes.
    pub attributes: Vec<EventAttribute>,
}

impl AbciEvent {
    /// Look up an attribute value by key.
    ///
    /// Some nodes still base64-encode attribute keys and values; both the
    /// plain and decoded forms are consulted, so callers never see the
    /// encoding difference.
    pub fn attr(&self, key: &str) -> Option<String> {
        self.attributes.iter().find_map(|attribute| {
            if attribute.key == key {
                return Some(decoded_or_raw(&attribute.value));
            }
            if decode_utf8(&attribute.key).as_deref() == Some(key) {
                return Some(decoded_or_raw(&attribute.value));
            }
            None
        })
    }
}

/// A single event attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventAttribute {
    /// Attribute key, possibly base64-encoded.
    pub key: String,
    /// Attribute value, possibly base64-encoded.
    pub value: String,
}

/// A transaction looked up by hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxLookup {
    /// Transaction hash (upper-case hex, no prefix).
    pub hash: String,
    /// Height the tx was included at.
    #[serde(deserialize_with = "string_or_u64")]
    pub height: u64,
    /// Execution result.
    pub tx_result: TxResult,
}

/// One page of a transaction search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxSearch {
    /// Matching transactions on this page.
    pub txs: Vec<TxLookup>,
    /// Total matches across all pages.
    #[serde(deserialize_with = "string_or_u64")]
    pub total_count: u64,
}

fn decode_utf8(raw: &str) -> Option<String> {
    BASE64
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Base64-decoded value when it decodes to clean UTF-8 that differs from the
/// raw form only by encoding, otherwise the raw value.
fn decoded_or_raw(raw: &str) -> String {
    // Heuristic: plain-text attribute values (bech32 addresses, JSON, digits)
    // are passed through; only values that both decode and re-encode to the
    // same base64 string are treated as encoded.
    match decode_utf8(raw) {
        Some(decoded) if BASE64.encode(decoded.as_bytes()) == raw => decoded,
        _ => raw.to_owned(),
    }
}

/// Tendermint encodes heights as JSON strings; accept both.
fn string_or_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// `txs_results` and event arrays arrive as `null` on empty blocks.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
