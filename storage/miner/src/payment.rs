// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::time::Duration;

use fvm_ipld_encoding::RawBytes;

use crate::error::Error;
use crate::paymentbroker::{
    verify_voucher_signature, PaymentChannel, CHANNEL_EXPIRY_INTERVAL, PAYMENT_BROKER_ACTOR_ADDR,
    VOUCHER_INTERVAL,
};
use crate::porcelain::MinerPorcelain;
use crate::protocol::DealProposal;
use fvm_shared::address::Address;

const WAIT_FOR_PAYMENT_CHANNEL_DURATION: Duration = Duration::from_secs(2 * 60);

/// Check a proposal's pricing and voucher schedule against current chain
/// state. Any error is a rejection reason surfaced verbatim to the client.
pub(crate) async fn validate_deal_payment<P>(
    api: &P,
    miner_owner_addr: &Address,
    proposal: &DealProposal,
) -> Result<(), Error>
where
    P: MinerPorcelain + ?Sized,
{
    // Expected total price for the deal: storage price * duration * bytes.
    let price = api.config_storage_price()?;
    let size = proposal
        .size
        .ok_or_else(|| Error::ProposalRejected("proposed deal has no size".to_string()))?;
    let duration_price = &price * proposal.duration;
    let expected_price = &duration_price * size;
    if proposal.total_price < expected_price {
        return Err(Error::ProposalRejected(format!(
            "proposed price ({}) is less than expected ({}) given asking price of {}",
            proposal.total_price, expected_price, price
        )));
    }

    let channel = get_payment_channel(api, proposal).await?;

    if channel.target != *miner_owner_addr {
        return Err(Error::ProposalRejected(format!(
            "miner account ({}) is not target of payment channel ({})",
            miner_owner_addr, channel.target
        )));
    }

    if channel.amount < expected_price {
        return Err(Error::ProposalRejected(format!(
            "payment channel does not contain enough funds ({} < {})",
            channel.amount, expected_price
        )));
    }

    let block_height = api
        .chain_block_height()
        .await
        .map_err(|_| Error::ProposalRejected("could not get current block height".to_string()))?;

    let vouchers = &proposal.payment.vouchers;
    let (first_voucher, last_voucher) = match (vouchers.first(), vouchers.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(Error::ProposalRejected(
                "deal proposal contains no payment vouchers".to_string(),
            ))
        }
    };

    let expected_first_payment = block_height + VOUCHER_INTERVAL;
    if first_voucher.valid_at > expected_first_payment {
        return Err(Error::ProposalRejected(
            "payments start after deal start interval".to_string(),
        ));
    }

    let mut last_valid_at = expected_first_payment;
    for voucher in vouchers {
        if !verify_voucher_signature(
            &proposal.payment.payer,
            proposal.payment.channel,
            &voucher.amount,
            voucher.valid_at,
            &voucher.signature,
        ) {
            return Err(Error::ProposalRejected("invalid signature in voucher".to_string()));
        }

        let expected_valid_at = last_valid_at + VOUCHER_INTERVAL;
        if voucher.valid_at > expected_valid_at {
            return Err(Error::ProposalRejected(format!(
                "interval between vouchers too high ({} - {} > {})",
                voucher.valid_at, last_valid_at, VOUCHER_INTERVAL
            )));
        }

        // Voucher amounts must accrue at least linearly toward the total:
        // amount / (valid_at - start) >= total / duration, cross-multiplied
        // to stay in integers.
        let lhs = &voucher.amount * proposal.duration;
        let rhs = &proposal.total_price * (voucher.valid_at - block_height);
        if lhs < rhs {
            return Err(Error::ProposalRejected(format!(
                "voucher amount ({}) less than expected for voucher valid at ({})",
                voucher.amount, voucher.valid_at
            )));
        }

        last_valid_at = voucher.valid_at;
    }

    if last_voucher.amount < proposal.total_price {
        return Err(Error::ProposalRejected(format!(
            "last payment ({}) does not cover total price ({})",
            last_voucher.amount, proposal.total_price
        )));
    }

    let expected_eol = last_voucher.valid_at + CHANNEL_EXPIRY_INTERVAL;
    if channel.eol < expected_eol {
        return Err(Error::ProposalRejected(format!(
            "payment channel eol ({}) less than required eol ({})",
            channel.eol, expected_eol
        )));
    }

    Ok(())
}

/// Wait for the channel-creation message to land, then look the channel up
/// through the payment broker's `ls` method.
async fn get_payment_channel<P>(api: &P, proposal: &DealProposal) -> Result<PaymentChannel, Error>
where
    P: MinerPorcelain + ?Sized,
{
    let wait = api.message_wait(&proposal.payment.channel_msg_cid);
    match tokio::time::timeout(WAIT_FOR_PAYMENT_CHANNEL_DURATION, wait).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::ProposalRejected(
                "Timeout waiting for payment channel".to_string(),
            ))
        }
    }

    let payer = proposal.payment.payer;
    let ret = api
        .message_query(
            None,
            PAYMENT_BROKER_ACTOR_ADDR,
            "ls",
            RawBytes::serialize(payer)?,
        )
        .await
        .map_err(|e| Error::ProposalRejected(format!("Error getting payment channel for payer: {}", e)))?;

    let mut channels: HashMap<String, PaymentChannel> = match ret.first() {
        Some(bytes) => bytes.deserialize().map_err(|e| {
            Error::ProposalRejected(format!("Could not decode payment channels for payer: {}", e))
        })?,
        None => {
            return Err(Error::ProposalRejected(
                "Could not decode payment channels for payer".to_string(),
            ))
        }
    };

    channels
        .remove(&proposal.payment.channel.key())
        .ok_or_else(|| {
            Error::ProposalRejected(format!(
                "could not find payment channel for payer {} and id {}",
                payer, proposal.payment.channel
            ))
        })
}
