// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::sector::SectorNumber;
use serde::{Deserialize, Serialize};

use crate::commitments::{CommD, CommR, CommRStar, PoStChallengeSeed};
use crate::error::Error;

/// A piece of client data handed to the sealing pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceInfo {
    /// Content address of the piece data in the local block store.
    pub piece_ref: Cid,
    /// Size of the piece in bytes.
    pub size: u64,
}

/// Metadata for a sealed sector, as reported by the sealing layer once the
/// sector's commitment message lands on chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedSectorMetadata {
    pub sector_id: SectorNumber,
    pub comm_r: CommR,
    pub comm_d: CommD,
    pub comm_r_star: CommRStar,
    pub proof: Vec<u8>,
}

/// Request to generate a proof-of-spacetime over the given replica
/// commitments.
#[derive(Debug, Clone)]
pub struct GeneratePoStRequest {
    pub comm_rs: Vec<CommR>,
    pub challenge_seed: PoStChallengeSeed,
}

#[derive(Debug, Clone, Default)]
pub struct GeneratePoStResponse {
    pub proof: Vec<u8>,
    /// Sector ids the prover could not read back. Reported, not yet acted
    /// on.
    pub faults: Vec<u64>,
}

/// The sealing pipeline the deal engine drives. Implemented by the sector
/// builder subsystem; the engine only ever holds it behind this trait.
#[async_trait]
pub trait SectorBuilder: Send + Sync {
    /// Write a piece into an unsealed sector and return the id of the sector
    /// the piece was assigned to. Sealing of that sector proceeds
    /// concurrently with the caller.
    async fn add_piece(&self, piece: PieceInfo) -> Result<SectorNumber, Error>;

    /// Generate a proof-of-spacetime for the given replica commitments.
    async fn generate_post(&self, req: GeneratePoStRequest)
        -> Result<GeneratePoStResponse, Error>;
}
