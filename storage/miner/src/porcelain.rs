// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;

use crate::error::Error;

/// Subset of the node's porcelain API that the storage miner depends on.
/// The full node implements this against its chain store, message pool and
/// configuration; tests swap in a scripted provider.
#[async_trait]
pub trait MinerPorcelain: Send + Sync {
    /// Current best-chain block height.
    async fn chain_block_height(&self) -> Result<ChainEpoch, Error>;

    /// The miner's offered storage price per byte per block, from the
    /// `mining.storagePrice` configuration key. The node's configuration is
    /// dynamically typed; narrowing happens behind this port.
    fn config_storage_price(&self) -> Result<TokenAmount, Error>;

    /// Enqueue a signed message and return its cid.
    async fn message_send(
        &self,
        from: Address,
        to: Address,
        value: TokenAmount,
        gas_price: TokenAmount,
        gas_limit: u64,
        method: &str,
        params: RawBytes,
    ) -> Result<Cid, Error>;

    /// Read-only actor call; returns the raw return values.
    async fn message_query(
        &self,
        from: Option<Address>,
        to: Address,
        method: &str,
        params: RawBytes,
    ) -> Result<Vec<RawBytes>, Error>;

    /// Resolve once the given message appears in a committed block, however
    /// long that takes. Callers bound the wait with their own deadline.
    async fn message_wait(&self, msg_cid: &Cid) -> Result<(), Error>;
}

/// Content-addressed fetch of piece data.
#[async_trait]
pub trait DagService: Send + Sync {
    /// Fetch the DAG rooted at `cid` from the network into the local block
    /// store.
    async fn fetch(&self, cid: &Cid) -> Result<(), Error>;
}
