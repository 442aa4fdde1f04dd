// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::{Arc, Weak};

use cid::Cid;
use db::Store;
use futures::{AsyncRead, AsyncWrite, SinkExt, StreamExt};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use log::{debug, error, warn};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use crate::deal_store::DealStore;
use crate::deals_awaiting_seal::{DealsAwaitingSeal, OnSealFail, OnSealSuccess};
use crate::error::Error;
use crate::payment::validate_deal_payment;
use crate::porcelain::{DagService, MinerPorcelain};
use crate::post::{HeadChange, PoStScheduler};
use crate::protocol::{
    DealProposal, DealResponse, DealState, MessageCodec, ProofInfo, QueryRequest, StorageDeal,
};
use crate::sectorbuilder::{PieceInfo, SealedSectorMetadata, SectorBuilder};

const DEALS_AWAITING_SEAL_KEY: &str = "dealsAwaitingSeal";

/// A storage miner: accepts deal proposals over the make-deal protocol,
/// answers state queries over the query protocol, drives accepted deals
/// through the sealing pipeline, and schedules proof-of-spacetime
/// submission.
pub struct Miner<DB, P> {
    miner_owner_addr: Address,
    deals: Arc<DealStore<DB>>,
    deals_awaiting_seal: Arc<DealsAwaitingSeal>,
    post: PoStScheduler<P>,
    api: Arc<P>,
    dag_service: Arc<dyn DagService>,
    sector_builder: Option<Arc<dyn SectorBuilder>>,
    ds: Arc<DB>,
    workers: TaskTracker,
    me: Weak<Self>,
}

impl<DB, P> Miner<DB, P>
where
    DB: Store + Send + Sync + 'static,
    P: MinerPorcelain + 'static,
{
    /// Create a miner, restoring persisted deals and awaiting-seal state
    /// from the datastore. A miner without a sector builder still answers
    /// both protocols but rejects every proposal.
    pub fn new(
        miner_addr: Address,
        miner_owner_addr: Address,
        api: Arc<P>,
        ds: Arc<DB>,
        dag_service: Arc<dyn DagService>,
        sector_builder: Option<Arc<dyn SectorBuilder>>,
    ) -> Result<Arc<Self>, Error> {
        let deals = Arc::new(DealStore::new(ds.clone()));
        deals.load_deals()?;

        let on_success: OnSealSuccess = {
            let deals = deals.clone();
            Box::new(move |deal_cid, sector| on_commit_success(&deals, deal_cid, sector))
        };
        let on_fail: OnSealFail = {
            let deals = deals.clone();
            Box::new(move |deal_cid, message| on_commit_fail(&deals, deal_cid, message))
        };

        let deals_awaiting_seal = Arc::new(DealsAwaitingSeal::new(on_success, on_fail));
        if let Some(bytes) = ds.read(DEALS_AWAITING_SEAL_KEY)? {
            deals_awaiting_seal.restore(&bytes)?;
        }

        let post = PoStScheduler::new(
            miner_addr,
            miner_owner_addr,
            api.clone(),
            sector_builder.clone(),
        );

        Ok(Arc::new_cyclic(|me| Miner {
            miner_owner_addr,
            deals,
            deals_awaiting_seal,
            post,
            api,
            dag_service,
            sector_builder,
            ds,
            workers: TaskTracker::new(),
            me: me.clone(),
        }))
    }

    /// Handle one inbound make-deal stream: read a single proposal, write a
    /// single response, done. The response is written whether the proposal
    /// is accepted or rejected.
    pub async fn handle_make_deal<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed =
            asynchronous_codec::Framed::new(stream, MessageCodec::<DealProposal, DealResponse>::default());

        let proposal = match framed.next().await {
            Some(Ok(proposal)) => proposal,
            Some(Err(err)) => {
                error!("received invalid proposal: {}", err);
                return;
            }
            None => {
                error!("make-deal stream closed before a proposal was read");
                return;
            }
        };

        let response = match self.receive_storage_proposal(proposal).await {
            Ok(response) => response,
            Err(err) => {
                error!("failed to process proposal: {}", err);
                return;
            }
        };

        if let Err(err) = framed.send(response).await {
            error!("failed to write proposal response: {}", err);
        }
    }

    /// Handle one inbound query stream: read a proposal cid, write the
    /// deal's current response, done.
    pub async fn handle_query_deal<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed =
            asynchronous_codec::Framed::new(stream, MessageCodec::<QueryRequest, DealResponse>::default());

        let request = match framed.next().await {
            Some(Ok(request)) => request,
            Some(Err(err)) => {
                error!("received invalid query: {}", err);
                return;
            }
            None => {
                error!("query stream closed before a request was read");
                return;
            }
        };

        if let Err(err) = framed.send(self.query(&request.cid)).await {
            error!("failed to write query response: {}", err);
        }
    }

    /// Entry point for the storage deal protocol.
    pub async fn receive_storage_proposal(
        &self,
        proposal: DealProposal,
    ) -> Result<DealResponse, Error> {
        // TODO: authenticate the proposal against a client signature once
        // proposals carry one.
        match validate_deal_payment(self.api.as_ref(), &self.miner_owner_addr, &proposal).await {
            Ok(()) => self.accept_proposal(proposal).await,
            Err(Error::ProposalRejected(reason)) => self.reject_proposal(proposal, &reason),
            Err(err) => {
                // Validation hit an infrastructure failure rather than a bad
                // proposal; refuse the deal, but log the underlying error.
                error!("failed validating proposal: {}", err);
                let reason = err.to_string();
                self.reject_proposal(proposal, &reason)
            }
        }
    }

    fn reject_proposal(&self, proposal: DealProposal, reason: &str) -> Result<DealResponse, Error> {
        let proposal_cid = proposal.cid()?;
        let response = DealResponse {
            state: DealState::Rejected,
            message: reason.to_string(),
            proposal_cid,
            proof_info: None,
            signature: Some(self.response_signature()),
        };

        self.deals.insert(StorageDeal {
            proposal,
            response: response.clone(),
        })?;
        Ok(response)
    }

    async fn accept_proposal(&self, proposal: DealProposal) -> Result<DealResponse, Error> {
        if self.sector_builder.is_none() {
            return Err(Error::MiningDisabled);
        }

        let proposal_cid = proposal.cid()?;
        let response = DealResponse {
            state: DealState::Accepted,
            message: String::new(),
            proposal_cid,
            proof_info: None,
            signature: Some(self.response_signature()),
        };

        if let Err(err) = self.deals.insert(StorageDeal {
            proposal,
            response: response.clone(),
        }) {
            self.deals
                .mark_failed(&proposal_cid, "Could not persist deal due to internal error");
            return Err(err);
        }

        if let Some(miner) = self.me.upgrade() {
            self.workers
                .spawn(async move { miner.process_storage_deal(proposal_cid).await });
        }

        Ok(response)
    }

    /// Drive an accepted deal: fetch the piece, stage it with the sector
    /// builder, and register for the sector's seal outcome. Terminates once
    /// the deal is Staged; seal completion arrives as a separate event.
    async fn process_storage_deal(&self, proposal_cid: Cid) {
        debug!("process_storage_deal({})", proposal_cid);
        let deal = match self.deals.get(&proposal_cid) {
            Some(deal) => deal,
            None => {
                error!("no deal found for proposal {}", proposal_cid);
                return;
            }
        };
        if deal.response.state != DealState::Accepted {
            // A deal that was mid-flight at shutdown reloads in a later
            // state; resumption is not handled yet.
            error!("attempted to process an already started deal");
            return;
        }

        if let Err(err) = self.dag_service.fetch(&deal.proposal.piece_ref).await {
            error!("failed to fetch piece data: {}", err);
            self.fail_deal(&proposal_cid, "Transfer failed");
            return;
        }

        let sector_builder = match &self.sector_builder {
            Some(sector_builder) => sector_builder,
            None => return,
        };

        let piece = PieceInfo {
            piece_ref: deal.proposal.piece_ref,
            // Presence was checked before the deal was accepted.
            size: deal.proposal.size.unwrap_or_default(),
        };

        // The sector may seal, and its commitment land on chain, between
        // add_piece returning and the registration below; the registry
        // accepts either order.
        let sector_id = match sector_builder.add_piece(piece).await {
            Ok(sector_id) => sector_id,
            Err(err) => {
                error!("failed to add piece: {}", err);
                self.fail_deal(&proposal_cid, "failed to submit seal proof");
                return;
            }
        };

        if let Err(err) = self
            .deals
            .update(&proposal_cid, |resp| resp.state = DealState::Staged)
        {
            error!("could not update deal to 'Staged' state: {}", err);
        }

        // This can resolve the deal straight to Posted or Failed, so it has
        // to come after the Staged transition.
        self.deals_awaiting_seal.register(sector_id, proposal_cid);
        if let Err(err) = self.save_deals_awaiting_seal() {
            error!("could not save deals awaiting seal: {}", err);
        }
    }

    fn fail_deal(&self, proposal_cid: &Cid, message: &str) {
        let result = self.deals.update(proposal_cid, |resp| {
            resp.state = DealState::Failed;
            resp.message = message.to_string();
        });
        if let Err(err) = result {
            error!("could not update deal to 'Failed' state: {}", err);
        }
    }

    /// Callback from the sealing layer once a sector's commitment message is
    /// on chain, or sealing failed.
    pub fn on_commitment_added_to_chain(
        &self,
        sector: SealedSectorMetadata,
        seal_error: Option<String>,
    ) {
        let sector_id = sector.sector_id;
        debug!("on_commitment_added_to_chain({})", sector_id);

        match seal_error {
            Some(reason) => {
                let message = format!("failed sealing sector: {}: {}", sector_id, reason);
                error!("{}", message);
                self.deals_awaiting_seal.report_failure(sector_id, &message);
            }
            None => self.deals_awaiting_seal.report_success(sector),
        }

        if let Err(err) = self.save_deals_awaiting_seal() {
            // The outcome was delivered but will not survive a restart;
            // record the sector as failed so deals against it are not left
            // dangling.
            let message = format!("failed persisting deals awaiting seal: {}", err);
            error!("{}", message);
            self.deals_awaiting_seal.report_failure(sector_id, &message);
        }
    }

    fn save_deals_awaiting_seal(&self) -> Result<(), Error> {
        let bytes = self.deals_awaiting_seal.snapshot()?;
        self.ds.write(DEALS_AWAITING_SEAL_KEY, bytes)?;
        Ok(())
    }

    /// The current response for the deal with the given proposal cid.
    pub fn query(&self, proposal_cid: &Cid) -> DealResponse {
        self.deals.query(proposal_cid)
    }

    /// The latest head has changed; give the proving scheduler a chance to
    /// run for the new period.
    pub async fn on_new_heaviest_tipset(&self, height: ChainEpoch) {
        self.post.on_new_heaviest_tipset(height).await;
    }

    /// Consume head-change notifications until the publisher goes away.
    pub async fn run_head_changes(&self, mut head_changes: broadcast::Receiver<HeadChange>) {
        loop {
            match head_changes.recv().await {
                Ok(HeadChange::Apply(height)) => self.on_new_heaviest_tipset(height).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("head change subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Wait for in-flight deal workers to finish.
    pub async fn shutdown(&self) {
        self.workers.close();
        self.workers.wait().await;
    }

    // TODO: sign with the miner owner key once the keystore is plumbed
    // through.
    fn response_signature(&self) -> Signature {
        Signature::new_secp256k1(Vec::new())
    }
}

/// Move a deal to Posted and attach its proof info. Runs under the
/// registry lock; only takes the deal lock.
fn on_commit_success<DB: Store>(
    deals: &DealStore<DB>,
    deal_cid: Cid,
    sector: &SealedSectorMetadata,
) {
    let result = deals.update(&deal_cid, |resp| {
        resp.state = DealState::Posted;
        resp.proof_info = Some(ProofInfo {
            sector_id: sector.sector_id,
            comm_r: sector.comm_r.to_vec(),
            comm_d: sector.comm_d.to_vec(),
        });
    });
    if let Err(err) = result {
        error!(
            "commit succeeded but could not update deal to 'Posted' state: {}",
            err
        );
    }
}

fn on_commit_fail<DB: Store>(deals: &DealStore<DB>, deal_cid: Cid, message: &str) {
    let result = deals.update(&deal_cid, |resp| {
        resp.state = DealState::Failed;
        resp.message = message.to_string();
    });
    if let Err(err) = result {
        error!(
            "commit failed and the deal could not be moved to 'Failed': {}",
            err
        );
    }
}
