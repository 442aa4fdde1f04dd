// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wire types for the storage deal protocols. Each protocol carries a single
//! request and a single response per stream; messages are varint
//! length-prefixed CBOR (see [`codec`]).

mod codec;

pub use codec::MessageCodec;

use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{serde_bytes, to_vec, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::paymentbroker::{ChannelId, PaymentVoucher};

/// Protocol id on which deal proposals are received.
pub const MAKE_DEAL_PROTOCOL_ID: &str = "/fil/storage/mk/1.0.0";
/// Protocol id on which deal state is queried.
pub const QUERY_DEAL_PROTOCOL_ID: &str = "/fil/storage/qry/1.0.0";

/// State a deal moves through on the miner. Terminal states are `Rejected`,
/// `Failed` and `Posted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealState {
    /// No record exists for the queried proposal.
    Unknown = 0,
    /// Proposal refused; the response message carries the reason.
    Rejected = 1,
    /// Proposal validated; piece data transfer not yet complete.
    Accepted = 2,
    /// Piece data received and added to an unsealed sector.
    Staged = 3,
    /// Fatal error at some stage; the response message carries the reason.
    Failed = 4,
    /// The containing sector sealed and its commitment observed on chain.
    Posted = 5,
}

impl DealState {
    fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(DealState::Unknown),
            1 => Some(DealState::Rejected),
            2 => Some(DealState::Accepted),
            3 => Some(DealState::Staged),
            4 => Some(DealState::Failed),
            5 => Some(DealState::Posted),
            _ => None,
        }
    }
}

impl Serialize for DealState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*self as u64)
    }
}

impl<'de> Deserialize<'de> for DealState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u64::deserialize(deserializer)?;
        DealState::from_u64(v)
            .ok_or_else(|| de::Error::custom(format!("invalid deal state: {}", v)))
    }
}

/// Payment section of a deal proposal: the on-chain channel funding the deal
/// and the voucher schedule drawn against it.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PaymentInfo {
    /// Account that created the channel and signs the vouchers.
    pub payer: Address,
    /// The channel within the payment broker's state.
    pub channel: ChannelId,
    /// Cid of the on-chain message that created the channel.
    pub channel_msg_cid: Cid,
    /// Vouchers ordered by `valid_at`.
    pub vouchers: Vec<PaymentVoucher>,
}

/// A client's offer to store a piece for a duration in exchange for the
/// attached voucher schedule.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    /// Content address of the piece data.
    pub piece_ref: Cid,
    /// Size of the piece in bytes.
    pub size: Option<u64>,
    /// Total price for storing the piece over the full duration.
    pub total_price: TokenAmount,
    /// Number of blocks the piece is to be stored for.
    pub duration: u64,
    pub payment: PaymentInfo,
}

impl DealProposal {
    /// Content address of the proposal's deterministic encoding; deals are
    /// indexed by it on both sides of the protocol.
    pub fn cid(&self) -> Result<Cid, Error> {
        let data = to_vec(self)?;
        Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&data)))
    }
}

/// Commitments for the sector a deal's piece was sealed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ProofInfo {
    pub sector_id: SectorNumber,
    #[serde(with = "serde_bytes")]
    pub comm_r: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub comm_d: Vec<u8>,
}

/// The miner's answer to a proposal, and the record returned for queries.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealResponse {
    pub state: DealState,
    /// Reason for a `Rejected` or `Failed` state; empty otherwise.
    pub message: String,
    /// Content address of the proposal this responds to.
    pub proposal_cid: Cid,
    /// Filled once the containing sector is sealed and committed.
    pub proof_info: Option<ProofInfo>,
    /// Miner signature over the response.
    pub signature: Option<Signature>,
}

impl Default for DealResponse {
    fn default() -> Self {
        DealResponse {
            state: DealState::Unknown,
            message: String::new(),
            proposal_cid: Cid::default(),
            proof_info: None,
            signature: None,
        }
    }
}

/// Request on the query protocol: the proposal cid returned when the deal
/// was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct QueryRequest {
    pub cid: Cid,
}

/// The unit of deal durability: the client's proposal together with the
/// miner's latest response to it.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct StorageDeal {
    pub proposal: DealProposal,
    pub response: DealResponse,
}
