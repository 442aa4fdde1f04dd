// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::tuple::*;

/// Data commitment produced when sealing a sector.
pub type CommD = [u8; 32];
/// Replica commitment produced when sealing a sector.
pub type CommR = [u8; 32];
/// Aggregate commitment over the replica column commitments.
pub type CommRStar = [u8; 32];
/// Seed used to derive proof-of-spacetime challenges for a proving period.
pub type PoStChallengeSeed = [u8; 32];

/// The replica and data commitments produced when sealing a sector, as held
/// in the miner actor's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct Commitments {
    pub comm_d: CommD,
    pub comm_r: CommR,
    pub comm_r_star: CommRStar,
}
