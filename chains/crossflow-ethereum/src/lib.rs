//! EVM side of crossflow: a retrying JSON-RPC client and the USDC
//! mint/burn pollers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use poller::*;
pub use rpc::*;

mod poller;
mod rpc;
