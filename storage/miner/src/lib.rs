// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Miner side of the storage deal protocol.
//!
//! Listens on two protocols: `make-deal`, where clients propose deals backed
//! by a payment-channel voucher schedule, and `query-deal`, where they poll a
//! deal's state. Accepted pieces are handed to the sector builder for
//! sealing, the deal moving Accepted -> Staged -> Posted (or Failed) as the
//! data lands, is staged into a sector, and that sector's commitment appears
//! on chain. Independently, every chain head change gives the proving
//! scheduler a chance to generate and submit the proof-of-spacetime for the
//! current proving period.

mod commitments;
mod deal_store;
mod deals_awaiting_seal;
mod error;
mod miner;
mod payment;
pub mod paymentbroker;
mod porcelain;
mod post;
mod protocol;
mod sectorbuilder;
#[cfg(test)]
pub(crate) mod testing;

pub use commitments::*;
pub use deal_store::DealStore;
pub use deals_awaiting_seal::{DealsAwaitingSeal, OnSealFail, OnSealSuccess};
pub use error::Error;
pub use miner::Miner;
pub use porcelain::{DagService, MinerPorcelain};
pub use post::{HeadChange, PROVING_PERIOD_BLOCKS};
pub use protocol::*;
pub use sectorbuilder::*;
