use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Flow;

/// The two supported flow shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    /// EVM burn → Noble CCTP mint → Noble IBC forward → Namada ack.
    Deposit,
    /// Namada IBC send → Noble receive → Noble CCTP burn → EVM mint.
    Payment,
}

impl FlowType {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Deposit => "deposit",
            FlowType::Payment => "payment",
        }
    }
}

/// Matching parameters for a deposit flow.
///
/// Every field is optional: a stage whose prerequisites are absent is skipped
/// rather than failing the whole flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DepositParams {
    /// Hash of the initiating EVM burn transaction.
    pub evm_burn_tx_hash: Option<String>,
    /// Noble forwarding address the CCTP mint lands on.
    pub forwarding_address: Option<String>,
    /// Namada receiver of the IBC forward.
    pub namada_receiver: Option<String>,
    /// Expected amount in Cosmos notation, e.g. `100000uusdc`.
    pub expected_amount_uusdc: Option<String>,
}

/// Matching parameters for a payment flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaymentParams {
    /// Hash of the initiating Namada IBC transaction.
    pub namada_ibc_tx_hash: Option<String>,
    /// Exact memo JSON carried by the IBC packet.
    pub memo_json: Option<String>,
    /// Noble forwarding (orbiter) address receiving the packet.
    pub forwarding_address: Option<String>,
    /// Transfer amount in base units (uusdc digits).
    pub amount_base_units: Option<String>,
    /// Base64 CCTP destination caller.
    pub destination_caller_b64: Option<String>,
    /// Base64 CCTP mint recipient.
    pub mint_recipient_b64: Option<String>,
    /// CCTP destination domain id.
    pub destination_domain: Option<u32>,
    /// USDC token contract on the destination EVM chain.
    pub usdc_address: Option<String>,
    /// EVM recipient of the destination mint.
    pub recipient: Option<String>,
    /// IBC channel id, pass-through for clients.
    pub channel_id: Option<String>,
}

/// Typed tracking parameters, tagged by flow type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "flowType")]
pub enum FlowParams {
    /// Parameters for a deposit flow.
    Deposit(DepositParams),
    /// Parameters for a payment flow.
    Payment(PaymentParams),
}

impl FlowParams {
    /// Derive typed parameters from a flow's free-form metadata.
    ///
    /// Lookup uses the primary key, then the documented fallbacks, and only
    /// accepts non-empty strings. The initiating tx hash doubles as the EVM
    /// burn hash for deposits when metadata does not carry one.
    pub fn derive(flow: &Flow) -> Self {
        let meta = &flow.metadata;
        match flow.flow_type {
            FlowType::Deposit => FlowParams::Deposit(DepositParams {
                evm_burn_tx_hash: lookup(meta, &["evmBurnTxHash", "burnTxHash"])
                    .or_else(|| flow.tx_hash.clone()),
                forwarding_address: lookup(meta, &["forwardingAddress", "nobleForwardingAddress"]),
                namada_receiver: lookup(meta, &["namadaReceiver", "destinationAddress"]),
                expected_amount_uusdc: expected_amount_uusdc(meta),
            }),
            FlowType::Payment => FlowParams::Payment(PaymentParams {
                namada_ibc_tx_hash: lookup(meta, &["namadaIbcTxHash"]),
                memo_json: lookup(meta, &["memoJson"]),
                forwarding_address: lookup(meta, &["forwardingAddress", "nobleForwardingAddress"]),
                amount_base_units: lookup(meta, &["amountBaseUnits", "amount"]),
                destination_caller_b64: lookup(meta, &["destinationCallerB64"]),
                mint_recipient_b64: lookup(meta, &["mintRecipientB64"]),
                destination_domain: numeric(meta, "destinationDomain"),
                usdc_address: lookup(meta, &["usdcAddress"]),
                recipient: lookup(meta, &["recipient", "destinationEvmAddress"]),
                channel_id: lookup(meta, &["channelId"]),
            }),
        }
    }

    /// The flow type this parameter set belongs to.
    pub fn flow_type(&self) -> FlowType {
        match self {
            FlowParams::Deposit(_) => FlowType::Deposit,
            FlowParams::Payment(_) => FlowType::Payment,
        }
    }
}

/// First non-empty string value among the given metadata keys.
fn lookup(meta: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        meta.get(*key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    })
}

/// `expectedAmountUusdc`, falling back to `amountBaseUnits` with a `uusdc`
/// suffix appended when missing.
fn expected_amount_uusdc(meta: &Map<String, Value>) -> Option<String> {
    if let Some(explicit) = lookup(meta, &["expectedAmountUusdc"]) {
        return Some(explicit);
    }
    lookup(meta, &["amountBaseUnits", "amount"]).map(|amount| {
        if amount.ends_with("uusdc") {
            amount
        } else {
            format!("{amount}uusdc")
        }
    })
}

/// Numeric metadata value, accepting JSON numbers and numeric strings.
fn numeric(meta: &Map<String, Value>, key: &str) -> Option<u32> {
    match meta.get(key) {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) if !s.is_empty() => s.parse().ok(),
        _ => None,
    }
}
