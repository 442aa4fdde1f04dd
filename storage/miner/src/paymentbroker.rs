// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Client-visible surface of the on-chain payment broker actor: the channel
//! state returned by its `ls` method and the signed vouchers drawn against a
//! channel. The actor itself runs on chain; only its wire types and the
//! voucher signature scheme live here.

use std::fmt;

use blake2b_simd::Params;
use fvm_ipld_encoding::to_vec;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::{Signature, SignatureType};
use fvm_shared::econ::TokenAmount;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Address of the payment broker singleton actor.
pub const PAYMENT_BROKER_ACTOR_ADDR: Address = Address::new_id(6);

/// Maximum epochs between the current head and the first voucher, and
/// between consecutive vouchers. Shared with storage clients.
pub const VOUCHER_INTERVAL: ChainEpoch = 150;

/// Epochs a payment channel must remain open past its final voucher.
pub const CHANNEL_EXPIRY_INTERVAL: ChainEpoch = 2880;

/// Identifier of a payment channel within the broker actor's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Key under which the broker's `ls` return indexes this channel.
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A payment channel as reported by the broker actor's `ls` method.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PaymentChannel {
    /// Account the channel pays out to.
    pub target: Address,
    /// Funds committed to the channel on chain.
    pub amount: TokenAmount,
    /// Funds already redeemed from the channel.
    pub amount_redeemed: TokenAmount,
    /// Epoch at which the channel closes and unredeemed funds return to the
    /// payer.
    pub eol: ChainEpoch,
}

/// Authorization, signed by the payer, to draw `amount` from a channel at or
/// after `valid_at`.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PaymentVoucher {
    pub amount: TokenAmount,
    pub valid_at: ChainEpoch,
    pub signature: Signature,
}

/// The payload a voucher signature covers. Both signer and verifier must
/// produce identical bytes for identical inputs.
fn voucher_payload(
    payer: &Address,
    channel: ChannelId,
    amount: &TokenAmount,
    valid_at: ChainEpoch,
) -> Result<Vec<u8>, Error> {
    Ok(to_vec(&(payer, channel, amount, valid_at))?)
}

/// Sign the voucher payload with the payer's secp256k1 key.
pub fn sign_voucher(
    payer: &Address,
    channel: ChannelId,
    amount: &TokenAmount,
    valid_at: ChainEpoch,
    key: &libsecp256k1::SecretKey,
) -> Result<Signature, Error> {
    let payload = voucher_payload(payer, channel, amount, valid_at)?;
    let message = libsecp256k1::Message::parse(&blake2b_256(&payload));
    let (sig, recovery_id) = libsecp256k1::sign(&message, key);

    let mut bytes = [0u8; 65];
    bytes[..64].copy_from_slice(&sig.serialize());
    bytes[64] = recovery_id.serialize();
    Ok(Signature::new_secp256k1(bytes.to_vec()))
}

/// Check a voucher signature by recovering the signing key and comparing the
/// address it hashes to against the payer.
pub fn verify_voucher_signature(
    payer: &Address,
    channel: ChannelId,
    amount: &TokenAmount,
    valid_at: ChainEpoch,
    signature: &Signature,
) -> bool {
    if signature.signature_type() != SignatureType::Secp256k1 || signature.bytes.len() != 65 {
        return false;
    }
    let payload = match voucher_payload(payer, channel, amount, valid_at) {
        Ok(payload) => payload,
        Err(_) => return false,
    };
    let message = libsecp256k1::Message::parse(&blake2b_256(&payload));

    let sig = match libsecp256k1::Signature::parse_standard_slice(&signature.bytes[..64]) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let recovery_id = match libsecp256k1::RecoveryId::parse(signature.bytes[64]) {
        Ok(id) => id,
        Err(_) => return false,
    };
    let public_key = match libsecp256k1::recover(&message, &sig, &recovery_id) {
        Ok(key) => key,
        Err(_) => return false,
    };

    match Address::new_secp256k1(&public_key.serialize()) {
        Ok(signer) => signer == *payer,
        Err(_) => false,
    }
}

fn blake2b_256(ingest: &[u8]) -> [u8; 32] {
    let digest = Params::new()
        .hash_length(32)
        .to_state()
        .update(ingest)
        .finalize();

    let mut ret = [0u8; 32];
    ret.clone_from_slice(digest.as_bytes());
    ret
}
