// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Scripted stand-ins for the node, sector builder and block service,
//! shared by the unit tests across this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_encoding::{RawBytes, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use num_traits::Zero;
use parking_lot::Mutex;
use rand::rngs::OsRng;

use crate::error::Error;
use crate::paymentbroker::{
    sign_voucher, ChannelId, PaymentChannel, PaymentVoucher, CHANNEL_EXPIRY_INTERVAL,
};
use crate::porcelain::{DagService, MinerPorcelain};
use crate::protocol::{DealProposal, PaymentInfo};
use crate::sectorbuilder::{
    GeneratePoStRequest, GeneratePoStResponse, PieceInfo, SealedSectorMetadata, SectorBuilder,
};

pub(crate) fn test_cid(data: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(data))
}

pub(crate) fn test_sector(sector_id: SectorNumber) -> SealedSectorMetadata {
    SealedSectorMetadata {
        sector_id,
        comm_r: [1; 32],
        comm_d: [2; 32],
        comm_r_star: [3; 32],
        proof: vec![4; 32],
    }
}

/// A deal proposal with a consistently signed voucher schedule, plus the
/// payer key that signed it. The default proposal is priced exactly at the
/// miner's asking price: 1024 bytes * 100 blocks * 10 atto.
pub(crate) struct ProposalFixture {
    pub proposal: DealProposal,
    pub payer_key: libsecp256k1::SecretKey,
}

impl Default for ProposalFixture {
    fn default() -> Self {
        Self::new(1_024_000, &[(10, 400_000), (20, 800_000), (30, 1_024_000)])
    }
}

impl ProposalFixture {
    pub fn with_total_price(total_price: u64) -> Self {
        Self::new(total_price, &[(10, 400_000), (20, 800_000), (30, 1_024_000)])
    }

    pub fn with_vouchers(vouchers: &[(ChainEpoch, u64)]) -> Self {
        Self::new(1_024_000, vouchers)
    }

    fn new(total_price: u64, vouchers: &[(ChainEpoch, u64)]) -> Self {
        let payer_key = libsecp256k1::SecretKey::random(&mut OsRng);
        let public_key = libsecp256k1::PublicKey::from_secret_key(&payer_key);
        let payer = Address::new_secp256k1(&public_key.serialize()).unwrap();
        let channel = ChannelId(9);

        let vouchers = vouchers
            .iter()
            .map(|(valid_at, amount)| {
                let amount = TokenAmount::from_atto(*amount);
                let signature =
                    sign_voucher(&payer, channel, &amount, *valid_at, &payer_key).unwrap();
                PaymentVoucher {
                    amount,
                    valid_at: *valid_at,
                    signature,
                }
            })
            .collect();

        let proposal = DealProposal {
            piece_ref: test_cid(b"piece-data"),
            size: Some(1024),
            total_price: TokenAmount::from_atto(total_price),
            duration: 100,
            payment: PaymentInfo {
                payer,
                channel,
                channel_msg_cid: test_cid(b"create-channel"),
                vouchers,
            },
        };

        ProposalFixture {
            proposal,
            payer_key,
        }
    }

    pub fn channel_key(&self) -> String {
        self.proposal.payment.channel.key()
    }

    /// An on-chain channel that satisfies the default proposal: funded to
    /// the full price and open past the final voucher.
    pub fn payment_channel(&self, target: Address) -> PaymentChannel {
        let last_valid_at = self
            .proposal
            .payment
            .vouchers
            .last()
            .map(|v| v.valid_at)
            .unwrap_or_default();
        PaymentChannel {
            target,
            amount: self.proposal.total_price.clone(),
            amount_redeemed: TokenAmount::zero(),
            eol: last_valid_at + CHANNEL_EXPIRY_INTERVAL,
        }
    }
}

pub(crate) struct SentMessage {
    pub from: Address,
    pub to: Address,
    pub value: TokenAmount,
    pub gas_price: TokenAmount,
    pub gas_limit: u64,
    pub method: String,
    pub params: RawBytes,
}

/// Scripted porcelain provider: chain state is whatever the test says it is,
/// and every sent message is recorded instead of hitting a message pool.
pub(crate) struct TestPorcelain {
    pub miner_addr: Address,
    pub miner_owner_addr: Address,
    pub block_height: Mutex<ChainEpoch>,
    pub storage_price: TokenAmount,
    pub channels: Mutex<HashMap<String, PaymentChannel>>,
    pub commitments: Mutex<HashMap<String, crate::commitments::Commitments>>,
    pub proving_period_start: Mutex<ChainEpoch>,
    pub sent: Mutex<Vec<SentMessage>>,
    pub never_confirm_messages: bool,
}

impl Default for TestPorcelain {
    fn default() -> Self {
        TestPorcelain {
            miner_addr: Address::new_id(1000),
            miner_owner_addr: Address::new_id(1001),
            block_height: Mutex::new(0),
            storage_price: TokenAmount::from_atto(10),
            channels: Mutex::new(HashMap::new()),
            commitments: Mutex::new(HashMap::new()),
            proving_period_start: Mutex::new(0),
            sent: Mutex::new(Vec::new()),
            never_confirm_messages: false,
        }
    }
}

impl TestPorcelain {
    /// A porcelain whose payment broker knows the fixture's channel, funded
    /// for the fixture's proposal and targeted at this miner's owner.
    pub fn with_channel_for(fixture: &ProposalFixture) -> Self {
        let api = TestPorcelain::default();
        api.channels.lock().insert(
            fixture.channel_key(),
            fixture.payment_channel(api.miner_owner_addr),
        );
        api
    }
}

#[async_trait]
impl MinerPorcelain for TestPorcelain {
    async fn chain_block_height(&self) -> Result<ChainEpoch, Error> {
        Ok(*self.block_height.lock())
    }

    fn config_storage_price(&self) -> Result<TokenAmount, Error> {
        Ok(self.storage_price.clone())
    }

    async fn message_send(
        &self,
        from: Address,
        to: Address,
        value: TokenAmount,
        gas_price: TokenAmount,
        gas_limit: u64,
        method: &str,
        params: RawBytes,
    ) -> Result<Cid, Error> {
        let mut sent = self.sent.lock();
        let msg_cid = test_cid(format!("message-{}-{}", method, sent.len()).as_bytes());
        sent.push(SentMessage {
            from,
            to,
            value,
            gas_price,
            gas_limit,
            method: method.to_string(),
            params,
        });
        Ok(msg_cid)
    }

    async fn message_query(
        &self,
        _from: Option<Address>,
        _to: Address,
        method: &str,
        _params: RawBytes,
    ) -> Result<Vec<RawBytes>, Error> {
        match method {
            "ls" => Ok(vec![RawBytes::serialize(&*self.channels.lock())?]),
            "getSectorCommitments" => Ok(vec![RawBytes::serialize(&*self.commitments.lock())?]),
            "getProvingPeriodStart" => {
                Ok(vec![RawBytes::serialize(*self.proving_period_start.lock())?])
            }
            other => Err(Error::Other(format!("unexpected query method: {}", other))),
        }
    }

    async fn message_wait(&self, _msg_cid: &Cid) -> Result<(), Error> {
        if self.never_confirm_messages {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

pub(crate) struct TestSectorBuilder {
    sector_id: SectorNumber,
    pub added: Mutex<Vec<PieceInfo>>,
    pub generated: Mutex<Vec<GeneratePoStRequest>>,
    fail_add_piece: AtomicBool,
    fail_generate_post: AtomicBool,
}

impl TestSectorBuilder {
    /// A sector builder that assigns every piece to the same sector.
    pub fn returning_sector(sector_id: SectorNumber) -> Self {
        TestSectorBuilder {
            sector_id,
            added: Mutex::new(Vec::new()),
            generated: Mutex::new(Vec::new()),
            fail_add_piece: AtomicBool::new(false),
            fail_generate_post: AtomicBool::new(false),
        }
    }

    pub fn fail_add_piece(&self) {
        self.fail_add_piece.store(true, Ordering::SeqCst);
    }

    pub fn fail_generate_post(&self) {
        self.fail_generate_post.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SectorBuilder for TestSectorBuilder {
    async fn add_piece(&self, piece: PieceInfo) -> Result<SectorNumber, Error> {
        if self.fail_add_piece.load(Ordering::SeqCst) {
            return Err(Error::Other("staging area full".to_string()));
        }
        self.added.lock().push(piece);
        Ok(self.sector_id)
    }

    async fn generate_post(
        &self,
        req: GeneratePoStRequest,
    ) -> Result<GeneratePoStResponse, Error> {
        if self.fail_generate_post.load(Ordering::SeqCst) {
            return Err(Error::Other("prover crashed".to_string()));
        }
        self.generated.lock().push(req);
        Ok(GeneratePoStResponse {
            proof: vec![7; 192],
            faults: Vec::new(),
        })
    }
}

#[derive(Default)]
pub(crate) struct TestDagService {
    fail: bool,
    pub fetched: Mutex<Vec<Cid>>,
}

impl TestDagService {
    pub fn failing() -> Self {
        TestDagService {
            fail: true,
            fetched: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DagService for TestDagService {
    async fn fetch(&self, cid: &Cid) -> Result<(), Error> {
        if self.fail {
            return Err(Error::Other("peer went away".to_string()));
        }
        self.fetched.lock().push(*cid);
        Ok(())
    }
}
