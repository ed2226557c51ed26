use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

/// The IBC success acknowledgement, as it appears in `packet_ack`.
pub const IBC_ACK_SUCCESS: &str = r#"{"result":"AQ=="}"#;

/// Strip one layer of surrounding double-quotes.
///
/// CCTP module events quote their attribute values; comparisons are done on
/// the bare value.
pub fn strip_quotes(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
}

/// Decode a `packet_data` attribute into JSON.
///
/// The value arrives in one of three shapes depending on the emitting stack:
/// raw JSON, a `{ "value": "<json>" }` wrapper, or base64-encoded JSON. The
/// decoders are tried in that order and the first that parses wins.
pub fn decode_packet_data(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(inner) = value.get("value").and_then(Value::as_str) {
            if let Ok(unwrapped) = serde_json::from_str::<Value>(inner) {
                return Some(unwrapped);
            }
        }
        return Some(value);
    }
    let bytes = BASE64.decode(raw).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// A decoded fungible-token IBC packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketData {
    /// Sending address.
    pub sender: String,
    /// Receiving address.
    pub receiver: String,
    /// Token denom.
    pub denom: String,
    /// Amount, as the packet carried it (digits, possibly suffixed).
    pub amount: String,
    /// Memo, when present.
    pub memo: Option<String>,
}

impl PacketData {
    /// Pull the fungible-token fields out of decoded packet JSON.
    pub fn from_json(value: &Value) -> Option<Self> {
        let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
        // Amount may be a JSON number on some stacks.
        let amount = match value.get("amount") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return None,
        };
        Some(Self {
            sender: field("sender")?,
            receiver: field("receiver")?,
            denom: field("denom").unwrap_or_default(),
            amount,
            memo: field("memo"),
        })
    }
}

/// Numeric equality of two uusdc amounts, each possibly carrying the
/// `uusdc` suffix.
pub fn amounts_equal_uusdc(left: &str, right: &str) -> bool {
    match (parse_uusdc(left), parse_uusdc(right)) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}

fn parse_uusdc(raw: &str) -> Option<u128> {
    raw.trim().trim_end_matches("uusdc").parse().ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn strips_one_quote_layer() {
        assert_eq!(strip_quotes("\"100000\""), "100000");
        assert_eq!(strip_quotes("100000"), "100000");
        assert_eq!(strip_quotes("\"unbalanced"), "\"unbalanced");
    }

    #[test]
    fn decodes_raw_json() {
        let decoded = decode_packet_data(r#"{"amount":"100000","denom":"uusdc"}"#).unwrap();
        assert_eq!(decoded["amount"], "100000");
    }

    #[test]
    fn decodes_value_wrapper() {
        let decoded =
            decode_packet_data(r#"{"value":"{\"amount\":\"100000\",\"denom\":\"uusdc\"}"}"#)
                .unwrap();
        assert_eq!(decoded["denom"], "uusdc");
    }

    #[test]
    fn decodes_base64_json() {
        let encoded = BASE64.encode(r#"{"amount":"100000"}"#);
        let decoded = decode_packet_data(&encoded).unwrap();
        assert_eq!(decoded["amount"], "100000");
    }

    #[test]
    fn garbage_decodes_to_none() {
        assert!(decode_packet_data("not json, not base64!!").is_none());
    }

    #[test]
    fn packet_data_accepts_numeric_amounts() {
        let packet = PacketData::from_json(&json!({
            "sender": "noble1s",
            "receiver": "tnam1r",
            "denom": "uusdc",
            "amount": 100000,
        }))
        .unwrap();
        assert_eq!(packet.amount, "100000");
    }

    #[test]
    fn uusdc_amounts_compare_numerically() {
        assert!(amounts_equal_uusdc("100000uusdc", "100000"));
        assert!(amounts_equal_uusdc("100000", "100000"));
        assert!(!amounts_equal_uusdc("100000uusdc", "99999uusdc"));
        assert!(!amounts_equal_uusdc("abc", "abc"));
    }
}
