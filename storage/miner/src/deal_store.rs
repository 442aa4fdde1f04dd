// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;
use db::Store;
use fvm_ipld_encoding::{from_slice, to_vec};
use parking_lot::Mutex;

use crate::error::Error;
use crate::protocol::{DealResponse, DealState, StorageDeal};

const MINER_DATASTORE_PREFIX: &str = "miner";

/// Durable map from proposal cid to storage deal. One lock covers the
/// in-memory map and the datastore write, so a successful return never
/// leaves the two diverged. The lock is never held across an await.
pub struct DealStore<DB> {
    deals: Mutex<HashMap<Cid, StorageDeal>>,
    ds: Arc<DB>,
}

impl<DB> DealStore<DB>
where
    DB: Store,
{
    pub fn new(ds: Arc<DB>) -> Self {
        DealStore {
            deals: Mutex::new(HashMap::new()),
            ds,
        }
    }

    fn key(proposal_cid: &Cid) -> String {
        format!("{}/{}", MINER_DATASTORE_PREFIX, proposal_cid)
    }

    /// Add or replace the record under its proposal cid, then persist it.
    /// On a persistence failure the in-memory record remains; callers mark
    /// the deal failed and surface the error.
    pub fn insert(&self, deal: StorageDeal) -> Result<(), Error> {
        let proposal_cid = deal.response.proposal_cid;
        let mut deals = self.deals.lock();
        let encoded = to_vec(&deal)?;
        deals.insert(proposal_cid, deal);
        self.ds.write(Self::key(&proposal_cid), encoded)?;
        Ok(())
    }

    /// Apply `mutator` to the stored response, then persist the record.
    pub fn update<F>(&self, proposal_cid: &Cid, mutator: F) -> Result<(), Error>
    where
        F: FnOnce(&mut DealResponse),
    {
        let mut deals = self.deals.lock();
        let deal = deals
            .get_mut(proposal_cid)
            .ok_or(Error::DealNotFound(*proposal_cid))?;
        mutator(&mut deal.response);
        let encoded = to_vec(deal)?;
        self.ds.write(Self::key(proposal_cid), encoded)?;
        Ok(())
    }

    /// Overwrite the in-memory response state without touching the
    /// datastore. Last resort for when the store itself is the thing that
    /// failed.
    pub fn mark_failed(&self, proposal_cid: &Cid, message: &str) {
        if let Some(deal) = self.deals.lock().get_mut(proposal_cid) {
            deal.response.state = DealState::Failed;
            deal.response.message = message.to_string();
        }
    }

    /// In-memory read of a deal record.
    pub fn get(&self, proposal_cid: &Cid) -> Option<StorageDeal> {
        self.deals.lock().get(proposal_cid).cloned()
    }

    /// The stored response, or an `Unknown` response if there is no record.
    pub fn query(&self, proposal_cid: &Cid) -> DealResponse {
        match self.deals.lock().get(proposal_cid) {
            Some(deal) => deal.response.clone(),
            None => DealResponse {
                state: DealState::Unknown,
                message: "no such deal".to_string(),
                ..Default::default()
            },
        }
    }

    /// Rebuild the in-memory map from the `miner/` namespace of the store.
    pub fn load_deals(&self) -> Result<(), Error> {
        let mut deals = self.deals.lock();
        deals.clear();
        for (_, value) in self
            .ds
            .iter_prefix(format!("{}/", MINER_DATASTORE_PREFIX))?
        {
            let deal: StorageDeal = from_slice(&value)?;
            deals.insert(deal.response.proposal_cid, deal);
        }
        Ok(())
    }
}
