//! Tendermint side of crossflow: a REST RPC client, event attribute
//! decoding shared by the Noble and Namada pollers, and the pollers
//! themselves.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use events::*;
pub use rpc::*;
pub use scan::*;

mod events;
// Both chains expose a `poll_for_deposit`; keep them namespaced.
/// Namada-side pollers: deposit acknowledgement and IBC send confirmation.
pub mod namada;
/// Noble-side pollers: deposit (CCTP mint + IBC forward) and orbiter
/// (IBC receive + CCTP burn).
pub mod noble;
mod rpc;
mod scan;
