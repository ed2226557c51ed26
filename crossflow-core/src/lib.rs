//! Core types and traits for the crossflow transfer tracker.
//!
//! Everything chain-facing or store-facing shares the vocabulary defined
//! here: the flow state model, the chain registry, the typed tracking
//! parameters derived from client metadata, the RPC error taxonomy and the
//! seams (`FlowStore`, `EvmProvider`, `TendermintProvider`, `StatusEvents`)
//! that the adapter and agent crates plug into.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use chain::*;
pub use error::*;
pub use flow::*;
pub use params::*;
pub use poll::*;
pub use retry::*;
pub use tendermint::*;
pub use traits::*;

mod chain;
mod error;
mod flow;
mod params;
mod poll;
mod retry;
mod tendermint;
mod traits;

/// Stage symbols recorded in chain progress entries and status logs.
pub mod stages {
    /// Initiating USDC burn observed on the EVM source chain.
    pub const EVM_USDC_BURNED: &str = "evm_usdc_burned";
    /// CCTP mint landed on the Noble forwarding account.
    pub const NOBLE_CCTP_MINTED: &str = "noble_cctp_minted";
    /// Noble forwarded the minted funds over IBC.
    pub const NOBLE_IBC_FORWARDED: &str = "noble_ibc_forwarded";
    /// Namada acknowledged the inbound IBC transfer.
    pub const NAMADA_RECEIVED: &str = "namada_received";
    /// Outbound IBC transfer left Namada.
    pub const NAMADA_IBC_SENT: &str = "namada_ibc_sent";
    /// Noble acknowledged the inbound IBC packet from Namada.
    pub const NOBLE_IBC_RECEIVED: &str = "noble_ibc_received";
    /// CCTP burn observed on Noble.
    pub const NOBLE_CCTP_BURNED: &str = "noble_cctp_burned";
    /// Destination USDC mint observed on the EVM chain.
    pub const EVM_USDC_MINTED: &str = "evm_usdc_minted";
}
