use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers_core::types::{H160, H256, U256};

use crossflow_core::{
    BlockResults, ChainResult, ChainRpcError, EvmLog, EvmProvider, EvmReceipt, EvmTransaction,
    LogQuery, TendermintProvider, TxLookup, TxSearch,
};

/// Programmable EVM provider for tests.
#[derive(Debug, Default)]
pub struct MockEvmProvider {
    state: Mutex<EvmState>,
}

#[derive(Debug, Default)]
struct EvmState {
    block_number: u64,
    logs: Vec<EvmLog>,
    receipts: HashMap<H256, EvmReceipt>,
    transactions: HashMap<H256, EvmTransaction>,
}

impl MockEvmProvider {
    /// Provider whose chain tip starts at `block_number`.
    pub fn new(block_number: u64) -> Self {
        Self {
            state: Mutex::new(EvmState {
                block_number,
                ..Default::default()
            }),
        }
    }

    /// Move the chain tip.
    pub fn set_block_number(&self, block_number: u64) {
        self.state.lock().unwrap().block_number = block_number;
    }

    /// Register an ERC-20 Transfer log with a 32-byte big-endian value.
    #[allow(clippy::too_many_arguments)]
    pub fn add_transfer_log(
        &self,
        address: H160,
        topic0: H256,
        topic1: H256,
        topic2: H256,
        value: U256,
        block_number: u64,
        transaction_hash: H256,
    ) {
        let mut data = [0u8; 32];
        value.to_big_endian(&mut data);
        self.state.lock().unwrap().logs.push(EvmLog {
            address,
            topics: vec![topic0, topic1, topic2],
            data: data.to_vec(),
            block_number,
            transaction_hash,
        });
    }

    /// Register a transaction receipt.
    pub fn add_receipt(&self, hash: H256, block_number: Option<u64>, status: Option<u64>) {
        self.state.lock().unwrap().receipts.insert(
            hash,
            EvmReceipt {
                transaction_hash: hash,
                block_number,
                status,
            },
        );
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(hash, EvmTransaction { hash, block_number });
    }
}

#[async_trait]
impl EvmProvider for MockEvmProvider {
    async fn block_number(&self) -> ChainResult<u64> {
        Ok(self.state.lock().unwrap().block_number)
    }

    async fn logs(&self, query: &LogQuery) -> ChainResult<Vec<EvmLog>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.address == query.address
                    && log.block_number >= query.from_block
                    && log.block_number <= query.to_block
                    && query.topics.iter().enumerate().all(|(i, topic)| match topic {
                        Some(expected) => log.topics.get(i) == Some(expected),
                        None => true,
                    })
            })
            .cloned()
            .collect())
    }

    async fn transaction(&self, hash: H256) -> ChainResult<Option<EvmTransaction>> {
        Ok(self.state.lock().unwrap().transactions.get(&hash).cloned())
    }

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<EvmReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }
}

/// Programmable Tendermint provider for tests.
#[derive(Debug, Default)]
pub struct MockTendermintProvider {
    state: Mutex<TendermintState>,
}

#[derive(Debug, Default)]
struct TendermintState {
    height: u64,
    blocks: HashMap<u64, BlockResults>,
    failing: HashSet<u64>,
    transactions: HashMap<String, TxLookup>,
}

impl MockTendermintProvider {
    /// Provider whose latest height starts at `height`.
    pub fn new(height: u64) -> Self {
        Self {
            state: Mutex::new(TendermintState {
                height,
                ..Default::default()
            }),
        }
    }

    /// Move the chain tip.
    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    /// Register block results for a height.
    pub fn add_block(&self, height: u64, block: BlockResults) {
        self.state.lock().unwrap().blocks.insert(height, block);
    }

    /// Make a height fail permanently (HTTP 404).
    pub fn fail_block(&self, height: u64) {
        self.state.lock().unwrap().failing.insert(height);
    }

    /// Register a transaction, keyed by its hash.
    pub fn add_transaction(&self, tx: TxLookup) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(tx.hash.clone(), tx);
    }
}

#[async_trait]
impl TendermintProvider for MockTendermintProvider {
    async fn latest_block_height(&self) -> ChainResult<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn block_results(&self, height: u64) -> ChainResult<Option<BlockResults>> {
        let state = self.state.lock().unwrap();
        if state.failing.contains(&height) {
            return Err(ChainRpcError::HttpStatus(404));
        }
        if let Some(block) = state.blocks.get(&height) {
            return Ok(Some(block.clone()));
        }
        // Heights at or below the tip exist but carry no events; anything
        // beyond the tip is not yet available.
        if height <= state.height {
            Ok(Some(BlockResults {
                height,
                ..Default::default()
            }))
        } else {
            Ok(None)
        }
    }

    async fn transaction(&self, hash: &str) -> ChainResult<Option<TxLookup>> {
        Ok(self.state.lock().unwrap().transactions.get(hash).cloned())
    }

    async fn search_transactions(
        &self,
        _query: &str,
        _page: u32,
        _per_page: u8,
    ) -> ChainResult<TxSearch> {
        let state = self.state.lock().unwrap();
        let txs: Vec<TxLookup> = state.transactions.values().cloned().collect();
        Ok(TxSearch {
            total_count: txs.len() as u64,
            txs,
        })
    }
}
