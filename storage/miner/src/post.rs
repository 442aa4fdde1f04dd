// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Proving-period scheduling. Every head change is a chance to notice that a
//! new proving period has started; at most one proof-of-spacetime is
//! generated and submitted per period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fvm_ipld_encoding::{BytesSer, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use log::{debug, error, warn};
use num_traits::Zero;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::commitments::{CommR, Commitments, PoStChallengeSeed};
use crate::error::Error;
use crate::porcelain::MinerPorcelain;
use crate::sectorbuilder::{GeneratePoStRequest, SectorBuilder};

/// Length of a proving period in blocks. Shared with the miner actor.
pub const PROVING_PERIOD_BLOCKS: ChainEpoch = 2000;

// TODO: replace these with queries to pick a reasonable gas price and limit.
const SUBMIT_POST_GAS_PRICE: u64 = 0;
const SUBMIT_POST_GAS_LIMIT: u64 = 300;

const SUBMIT_POST_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// A change to the heaviest chain tip, carrying the new height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadChange {
    Apply(ChainEpoch),
}

/// Decides, on every head change, whether to generate and submit a
/// proof-of-spacetime for the current proving period.
pub(crate) struct PoStScheduler<P> {
    miner_addr: Address,
    miner_owner_addr: Address,
    api: Arc<P>,
    sector_builder: Option<Arc<dyn SectorBuilder>>,
    /// Start of the period currently being proved. Not cleared on worker
    /// failure, so an unsuccessful attempt is not retried until the next
    /// period.
    post_in_process: Mutex<Option<ChainEpoch>>,
}

impl<P> PoStScheduler<P>
where
    P: MinerPorcelain + 'static,
{
    pub fn new(
        miner_addr: Address,
        miner_owner_addr: Address,
        api: Arc<P>,
        sector_builder: Option<Arc<dyn SectorBuilder>>,
    ) -> Self {
        PoStScheduler {
            miner_addr,
            miner_owner_addr,
            api,
            sector_builder,
            post_in_process: Mutex::new(None),
        }
    }

    /// Called on every new heaviest tipset. Failures are logged and
    /// contained here; they never propagate to the head-change source.
    pub async fn on_new_heaviest_tipset(&self, height: ChainEpoch) {
        if let Err(err) = self.maybe_generate_post(height).await {
            error!("proving period check failed: {}", err);
        }
    }

    async fn maybe_generate_post(&self, height: ChainEpoch) -> Result<(), Error> {
        let sector_builder = match &self.sector_builder {
            Some(sector_builder) => sector_builder.clone(),
            None => return Ok(()),
        };

        let ret = self
            .api
            .message_query(
                None,
                self.miner_addr,
                "getSectorCommitments",
                RawBytes::default(),
            )
            .await?;
        let commitments: HashMap<String, Commitments> = match ret.first() {
            Some(bytes) => bytes.deserialize()?,
            None => {
                return Err(Error::Other(
                    "empty return from getSectorCommitments".to_string(),
                ))
            }
        };

        let comm_rs: Vec<CommR> = commitments.values().map(|c| c.comm_r).collect();
        if comm_rs.is_empty() {
            // No sector sealed, nothing to prove.
            return Ok(());
        }

        let proving_period_start = self.get_proving_period_start().await?;
        let challenge_seed = post_challenge_seed(proving_period_start);
        let proving_period_end = proving_period_start + PROVING_PERIOD_BLOCKS;

        {
            let mut post_in_process = self.post_in_process.lock();
            if *post_in_process == Some(proving_period_start) {
                // A proof is already being generated for this period.
                return Ok(());
            }
            if height < proving_period_start {
                return Ok(());
            }
            if height >= proving_period_end {
                // TODO: fault accounting for a missed proving period.
                error!(
                    "too late to generate PoSt: start={} end={} current={}",
                    proving_period_start, proving_period_end, height
                );
                return Ok(());
            }
            *post_in_process = Some(proving_period_start);
        }

        let api = self.api.clone();
        let miner_addr = self.miner_addr;
        let miner_owner_addr = self.miner_owner_addr;
        tokio::spawn(async move {
            generate_and_submit_post(
                api,
                sector_builder,
                miner_addr,
                miner_owner_addr,
                proving_period_start,
                proving_period_end,
                challenge_seed,
                comm_rs,
            )
            .await;
        });

        Ok(())
    }

    async fn get_proving_period_start(&self) -> Result<ChainEpoch, Error> {
        let ret = self
            .api
            .message_query(
                None,
                self.miner_addr,
                "getProvingPeriodStart",
                RawBytes::default(),
            )
            .await?;
        match ret.first() {
            Some(bytes) => Ok(bytes.deserialize()?),
            None => Err(Error::Other(
                "empty return from getProvingPeriodStart".to_string(),
            )),
        }
    }

    #[cfg(test)]
    pub(crate) fn post_in_process(&self) -> Option<ChainEpoch> {
        *self.post_in_process.lock()
    }
}

/// Challenge seed for the proving period starting at the given height.
fn post_challenge_seed(proving_period_start: ChainEpoch) -> PoStChallengeSeed {
    let digest = Sha256::digest(proving_period_start.to_be_bytes());
    digest.into()
}

/// Generate the proof and submit it, bailing out if the period ended while
/// the proof was being generated. Failures leave `post_in_process` set for
/// the period.
#[allow(clippy::too_many_arguments)]
async fn generate_and_submit_post<P>(
    api: Arc<P>,
    sector_builder: Arc<dyn SectorBuilder>,
    miner_addr: Address,
    miner_owner_addr: Address,
    proving_period_start: ChainEpoch,
    proving_period_end: ChainEpoch,
    challenge_seed: PoStChallengeSeed,
    comm_rs: Vec<CommR>,
) where
    P: MinerPorcelain,
{
    let req = GeneratePoStRequest {
        comm_rs,
        challenge_seed,
    };
    let res = match sector_builder.generate_post(req).await {
        Ok(res) => res,
        Err(err) => {
            error!("failed to generate PoSt: {}", err);
            return;
        }
    };
    if !res.faults.is_empty() {
        // TODO: proper fault handling before submission.
        warn!("some faults when generating PoSt: {:?}", res.faults);
    }

    let height = match api.chain_block_height().await {
        Ok(height) => height,
        Err(err) => {
            error!(
                "failed to submit PoSt, the current block height can not be determined: {}",
                err
            );
            return;
        }
    };
    if height < proving_period_start {
        error!(
            "PoSt generation took negative block time: {} < {}",
            height, proving_period_start
        );
        return;
    }
    if height >= proving_period_end {
        error!(
            "PoSt generation was too slow: height={} proving_period_end={}",
            height, proving_period_end
        );
        return;
    }

    let params = match RawBytes::serialize(BytesSer(&res.proof)) {
        Ok(params) => params,
        Err(err) => {
            error!("failed to encode PoSt proof: {}", err);
            return;
        }
    };

    let send = api.message_send(
        miner_owner_addr,
        miner_addr,
        TokenAmount::zero(),
        TokenAmount::from_atto(SUBMIT_POST_GAS_PRICE),
        SUBMIT_POST_GAS_LIMIT,
        "submitPoSt",
        params,
    );
    match tokio::time::timeout(SUBMIT_POST_DEADLINE, send).await {
        Ok(Ok(_)) => debug!("submitted PoSt"),
        Ok(Err(err)) => error!("failed to submit PoSt: {}", err),
        Err(_) => error!("timed out submitting PoSt"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPorcelain, TestSectorBuilder};

    struct Harness {
        scheduler: PoStScheduler<TestPorcelain>,
        api: Arc<TestPorcelain>,
        sector_builder: Arc<TestSectorBuilder>,
    }

    fn harness(proving_period_start: ChainEpoch, sealed_sectors: u64) -> Harness {
        let api = Arc::new(TestPorcelain::default());
        *api.proving_period_start.lock() = proving_period_start;
        *api.block_height.lock() = proving_period_start + 50;
        {
            let mut commitments = api.commitments.lock();
            for i in 0..sealed_sectors {
                commitments.insert(
                    i.to_string(),
                    Commitments {
                        comm_d: [i as u8; 32],
                        comm_r: [i as u8 + 1; 32],
                        comm_r_star: [i as u8 + 2; 32],
                    },
                );
            }
        }
        let sector_builder = Arc::new(TestSectorBuilder::returning_sector(1));
        let scheduler = PoStScheduler::new(
            api.miner_addr,
            api.miner_owner_addr,
            api.clone(),
            Some(sector_builder.clone()),
        );
        Harness {
            scheduler,
            api,
            sector_builder,
        }
    }

    async fn settle() {
        // Let the spawned proof worker run to completion.
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn submits_one_post_per_period() {
        let h = harness(100, 2);

        h.scheduler.on_new_heaviest_tipset(150).await;
        h.scheduler.on_new_heaviest_tipset(151).await;
        settle().await;

        let sent = h.api.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "submitPoSt");
        assert_eq!(sent[0].to, h.api.miner_addr);
        assert_eq!(h.scheduler.post_in_process(), Some(100));

        // The proof covered every sealed sector.
        let generated = h.sector_builder.generated.lock();
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].comm_rs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_to_prove_without_sealed_sectors() {
        let h = harness(100, 0);

        h.scheduler.on_new_heaviest_tipset(150).await;
        settle().await;

        assert!(h.api.sent.lock().is_empty());
        assert_eq!(h.scheduler.post_in_process(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_before_the_period_starts() {
        let h = harness(100, 1);

        h.scheduler.on_new_heaviest_tipset(99).await;
        settle().await;

        assert!(h.api.sent.lock().is_empty());
        assert_eq!(h.scheduler.post_in_process(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn too_late_in_the_period_is_skipped() {
        let h = harness(100, 1);

        h.scheduler
            .on_new_heaviest_tipset(100 + PROVING_PERIOD_BLOCKS)
            .await;
        settle().await;

        assert!(h.api.sent.lock().is_empty());
        assert_eq!(h.scheduler.post_in_process(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn generation_failure_suppresses_retry_within_period() {
        let h = harness(100, 1);
        h.sector_builder.fail_generate_post();

        h.scheduler.on_new_heaviest_tipset(150).await;
        settle().await;
        assert!(h.api.sent.lock().is_empty());

        // Still marked in-process for the period; no second attempt.
        assert_eq!(h.scheduler.post_in_process(), Some(100));
        h.scheduler.on_new_heaviest_tipset(160).await;
        settle().await;
        assert!(h.api.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn submission_is_abandoned_when_the_period_ends_mid_proof() {
        let h = harness(100, 1);

        h.scheduler.on_new_heaviest_tipset(150).await;
        // The chain moves past the period end before the proof returns.
        *h.api.block_height.lock() = 100 + PROVING_PERIOD_BLOCKS;
        settle().await;

        assert!(h.api.sent.lock().is_empty());
        assert_eq!(h.scheduler.post_in_process(), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn next_period_gets_its_own_post() {
        let h = harness(100, 1);

        h.scheduler.on_new_heaviest_tipset(150).await;
        settle().await;
        assert_eq!(h.api.sent.lock().len(), 1);

        // A new period begins.
        *h.api.proving_period_start.lock() = 100 + PROVING_PERIOD_BLOCKS;
        *h.api.block_height.lock() = 100 + PROVING_PERIOD_BLOCKS + 50;
        h.scheduler
            .on_new_heaviest_tipset(100 + PROVING_PERIOD_BLOCKS + 50)
            .await;
        settle().await;

        assert_eq!(h.api.sent.lock().len(), 2);
        assert_eq!(
            h.scheduler.post_in_process(),
            Some(100 + PROVING_PERIOD_BLOCKS)
        );
    }

    #[test]
    fn challenge_seed_is_stable_per_period() {
        assert_eq!(post_challenge_seed(100), post_challenge_seed(100));
        assert_ne!(post_challenge_seed(100), post_challenge_seed(2100));
    }
}
