// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Book-keeping for the race between `add_piece` returning a sector id and
//! that sector's seal outcome arriving. A sector commit can land on chain
//! before the deal worker records the sector/deal mapping, so seal outcomes
//! are cached here and either arrival order produces the same callbacks.

use std::collections::HashMap;

use cid::Cid;
use fvm_shared::sector::SectorNumber;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::sectorbuilder::SealedSectorMetadata;

pub type OnSealSuccess = Box<dyn Fn(Cid, &SealedSectorMetadata) + Send + Sync>;
pub type OnSealFail = Box<dyn Fn(Cid, &str) + Send + Sync>;

/// The serialized portion of the registry. A sector id lives in at most one
/// of the three maps at any instant.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AwaitingSealState {
    /// Deals with a piece in the sector, awaiting its seal outcome.
    #[serde(with = "cids_json")]
    pub sectors_to_deals: HashMap<SectorNumber, Vec<Cid>>,
    /// Seal successes that arrived before any deal registered against them.
    pub successful_sectors: HashMap<SectorNumber, SealedSectorMetadata>,
    /// Seal failures that arrived before any deal registered against them.
    pub failed_sectors: HashMap<SectorNumber, String>,
}

/// Reconciles per-sector seal outcomes with per-deal registrations arriving
/// in either order. Callbacks into the deal store are installed at
/// construction and invoked with the registry lock held; they must not call
/// back in.
pub struct DealsAwaitingSeal {
    state: Mutex<AwaitingSealState>,
    on_success: OnSealSuccess,
    on_fail: OnSealFail,
}

impl DealsAwaitingSeal {
    pub fn new(on_success: OnSealSuccess, on_fail: OnSealFail) -> Self {
        DealsAwaitingSeal {
            state: Mutex::new(AwaitingSealState::default()),
            on_success,
            on_fail,
        }
    }

    /// Register a deal against the sector carrying its piece. If the
    /// sector's seal outcome already arrived, the matching callback fires
    /// now and the cached outcome is consumed; at most one late
    /// registration is expected per sector.
    pub fn register(&self, sector_id: SectorNumber, deal_cid: Cid) {
        let mut state = self.state.lock();
        if let Some(sector) = state.successful_sectors.remove(&sector_id) {
            (self.on_success)(deal_cid, &sector);
        } else if let Some(message) = state.failed_sectors.remove(&sector_id) {
            (self.on_fail)(deal_cid, &message);
        } else {
            state
                .sectors_to_deals
                .entry(sector_id)
                .or_default()
                .push(deal_cid);
        }
    }

    /// Record a successful seal, notifying every deal already registered
    /// against the sector and caching the outcome for late registrations.
    pub fn report_success(&self, sector: SealedSectorMetadata) {
        let mut state = self.state.lock();
        if let Some(deals) = state.sectors_to_deals.remove(&sector.sector_id) {
            for deal_cid in deals {
                (self.on_success)(deal_cid, &sector);
            }
        }
        state.successful_sectors.insert(sector.sector_id, sector);
    }

    /// Record a failed seal; symmetric to [`Self::report_success`].
    pub fn report_failure(&self, sector_id: SectorNumber, message: &str) {
        let mut state = self.state.lock();
        if let Some(deals) = state.sectors_to_deals.remove(&sector_id) {
            for deal_cid in deals {
                (self.on_fail)(deal_cid, message);
            }
        }
        state.failed_sectors.insert(sector_id, message.to_string());
    }

    /// The three maps as one blob, for persistence under a single key.
    pub fn snapshot(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(&*self.state.lock())?)
    }

    /// Replace the maps with a blob previously written by
    /// [`Self::snapshot`].
    pub fn restore(&self, bytes: &[u8]) -> Result<(), Error> {
        *self.state.lock() = serde_json::from_slice(bytes)?;
        Ok(())
    }

    pub(crate) fn state(&self) -> AwaitingSealState {
        self.state.lock().clone()
    }
}

/// Cids as strings inside the text-encoded registry blob, matching how the
/// blob has historically been written to disk.
mod cids_json {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(
        map: &HashMap<SectorNumber, Vec<Cid>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let stringified: HashMap<&SectorNumber, Vec<String>> = map
            .iter()
            .map(|(k, cids)| (k, cids.iter().map(|c| c.to_string()).collect()))
            .collect();
        stringified.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<SectorNumber, Vec<Cid>>, D::Error> {
        let stringified: HashMap<SectorNumber, Vec<String>> =
            Deserialize::deserialize(deserializer)?;
        stringified
            .into_iter()
            .map(|(k, cids)| {
                let cids = cids
                    .iter()
                    .map(|c| Cid::from_str(c).map_err(D::Error::custom))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((k, cids))
            })
            .collect()
    }
}
