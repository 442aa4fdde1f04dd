// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use thiserror::Error;

/// Storage miner error
#[derive(Debug, Error)]
pub enum Error {
    /// A proposal failed validation; the reason goes back to the client on
    /// a `Rejected` response and is not an infrastructure error.
    #[error("{0}")]
    ProposalRejected(String),
    #[error(transparent)]
    Store(#[from] db::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("no deal found for proposal {0}")]
    DealNotFound(Cid),
    #[error("Mining disabled, can not process proposal")]
    MiningDisabled,
    #[error("{0}")]
    Other(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
