// LN Channel Core Library implementing Lightning-style payment channels
// Written in 2022-2024 by
//     LN Channel Core contributors
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Commitment chains: the (at most two) live commitment states of each
//! side, and the persisted commitment diff enabling retransmission.

use std::collections::VecDeque;
use std::io;

use bitcoin::Transaction;
use bitcoin_scripts::hlc::HashLock;
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use strict_encoding::{StrictDecode, StrictEncode};

use crate::wire::{ChannelMessage, CommitSig, UpdateFee};

/// Snapshot of an HTLC included in a specific commitment transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct CommittedHtlc {
    /// Direction from the commitment owner's point of view
    pub incoming: bool,
    pub amount_msat: u64,
    pub payment_hash: HashLock,
    pub cltv_expiry: u32,
    /// HTLC counter within the sender's log
    pub htlc_index: u64,
    /// Log index within the sender's log
    pub log_index: u64,
    /// Output index on this commitment transaction; −1 signals dust
    pub output_index: i32,
}

/// One commitment state of a chain.
///
/// Balances are given from the point of view of the chain owner; the
/// initiator's balance already carries the full commitment fee.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Commitment {
    /// Height within the owning chain; strictly increasing
    pub height: u64,

    /// Bound (exclusive) of our log entries included in this state
    pub our_message_index: u64,

    /// Bound (exclusive) of their log entries included in this state
    pub their_message_index: u64,

    /// Bound (exclusive) of our HTLC counter at this state
    pub our_htlc_index: u64,

    /// Bound (exclusive) of their HTLC counter at this state
    pub their_htlc_index: u64,

    /// Balance of the commitment owner, msat
    pub our_balance_msat: u64,

    /// Balance of the other party, msat
    pub their_balance_msat: u64,

    /// Fee rate this commitment was built with
    pub fee_per_kw: u32,

    /// Total commitment fee, borne by the channel initiator
    pub fee_sat: u64,

    /// Dust limit of the chain this commitment lives on
    pub dust_limit_sat: u64,

    /// The unsigned commitment transaction
    pub tx: Transaction,

    /// Counterparty signature, present once received
    pub their_signature: Option<Signature>,

    /// Counterparty HTLC signatures in output order (local chain only)
    pub htlc_signatures: Vec<Signature>,

    /// Commitment point which authenticated this state
    pub per_commitment_point: PublicKey,

    /// HTLCs included in this commitment, in BIP-69 output order (dust
    /// entries follow the untrimmed ones)
    pub htlcs: Vec<CommittedHtlc>,
}

impl StrictEncode for Commitment {
    fn strict_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, strict_encoding::Error> {
        let mut len = 0usize;
        len += self.height.strict_encode(&mut e)?;
        len += self.our_message_index.strict_encode(&mut e)?;
        len += self.their_message_index.strict_encode(&mut e)?;
        len += self.our_htlc_index.strict_encode(&mut e)?;
        len += self.their_htlc_index.strict_encode(&mut e)?;
        len += self.our_balance_msat.strict_encode(&mut e)?;
        len += self.their_balance_msat.strict_encode(&mut e)?;
        len += self.fee_per_kw.strict_encode(&mut e)?;
        len += self.fee_sat.strict_encode(&mut e)?;
        len += self.dust_limit_sat.strict_encode(&mut e)?;
        // The transaction is persisted in consensus encoding so that the
        // round trip is bitwise
        len += bitcoin::consensus::serialize(&self.tx).strict_encode(&mut e)?;
        len += self.their_signature.strict_encode(&mut e)?;
        len += self.htlc_signatures.strict_encode(&mut e)?;
        len += self.per_commitment_point.strict_encode(&mut e)?;
        len += self.htlcs.strict_encode(&mut e)?;
        Ok(len)
    }
}

impl StrictDecode for Commitment {
    fn strict_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, strict_encoding::Error> {
        let height = u64::strict_decode(&mut d)?;
        let our_message_index = u64::strict_decode(&mut d)?;
        let their_message_index = u64::strict_decode(&mut d)?;
        let our_htlc_index = u64::strict_decode(&mut d)?;
        let their_htlc_index = u64::strict_decode(&mut d)?;
        let our_balance_msat = u64::strict_decode(&mut d)?;
        let their_balance_msat = u64::strict_decode(&mut d)?;
        let fee_per_kw = u32::strict_decode(&mut d)?;
        let fee_sat = u64::strict_decode(&mut d)?;
        let dust_limit_sat = u64::strict_decode(&mut d)?;
        let tx_bytes = Vec::<u8>::strict_decode(&mut d)?;
        let tx = bitcoin::consensus::deserialize(&tx_bytes).map_err(|err| {
            strict_encoding::Error::DataIntegrityError(format!(
                "invalid commitment transaction encoding: {}",
                err
            ))
        })?;
        Ok(Commitment {
            height,
            our_message_index,
            their_message_index,
            our_htlc_index,
            their_htlc_index,
            our_balance_msat,
            their_balance_msat,
            fee_per_kw,
            fee_sat,
            dust_limit_sat,
            tx,
            their_signature: Option::<Signature>::strict_decode(&mut d)?,
            htlc_signatures: Vec::<Signature>::strict_decode(&mut d)?,
            per_commitment_point: PublicKey::strict_decode(&mut d)?,
            htlcs: Vec::<CommittedHtlc>::strict_decode(&mut d)?,
        })
    }
}

/// Chain of unrevoked commitments of one side.
///
/// The tail is the last acknowledged state; an optional second entry is the
/// proposed-but-unrevoked tip. The chain never holds more than two entries.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct CommitmentChain {
    commitments: VecDeque<Commitment>,
}

impl CommitmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last acknowledged commitment.
    #[inline]
    pub fn tail(&self) -> Option<&Commitment> {
        self.commitments.front()
    }

    /// Most recent commitment (the unacknowledged tip when two entries are
    /// live).
    #[inline]
    pub fn tip(&self) -> Option<&Commitment> {
        self.commitments.back()
    }

    #[inline]
    pub fn tip_mut(&mut self) -> Option<&mut Commitment> {
        self.commitments.back_mut()
    }

    /// Height of the tail commitment; zero for a fresh chain.
    #[inline]
    pub fn tail_height(&self) -> u64 {
        self.tail().map(|commitment| commitment.height).unwrap_or(0)
    }

    /// Height of the tip commitment; zero for a fresh chain.
    #[inline]
    pub fn tip_height(&self) -> u64 {
        self.tip().map(|commitment| commitment.height).unwrap_or(0)
    }

    /// Whether the chain carries a proposed-but-unrevoked tip.
    #[inline]
    pub fn has_unacked_commitment(&self) -> bool {
        self.commitments.len() == 2
    }

    /// Appends a newly proposed commitment to the chain head.
    ///
    /// Heights must be strictly increasing and the chain must have a free
    /// slot within its revocation window of one.
    pub fn add(&mut self, commitment: Commitment) {
        debug_assert!(
            self.commitments.len() < 2,
            "commitment chain may hold at most two live entries"
        );
        debug_assert!(
            self.tip().map(|tip| tip.height < commitment.height)
                .unwrap_or(true),
            "commitment heights must be strictly increasing"
        );
        self.commitments.push_back(commitment);
    }

    /// Advances the tail after a revocation, dropping the superseded state.
    /// Returns the new tail.
    pub fn advance_tail(&mut self) -> Option<&Commitment> {
        if self.commitments.len() == 2 {
            self.commitments.pop_front();
        }
        self.tail()
    }

    /// Resets the chain to a single (restored) commitment.
    pub fn reset(&mut self, commitment: Commitment) {
        self.commitments.clear();
        self.commitments.push_back(commitment);
    }
}

/// Update of one log entry expressed as the wire message that produced it;
/// persisted within a [`CommitDiff`] for retransmission.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct LogUpdate {
    pub log_index: u64,
    pub message: ChannelMessage,
}

/// Everything needed to retransmit a signed-but-unacknowledged remote
/// commitment after a reconnect: the proposed commitment, the exact
/// `commitment_signed` message, and every log update that first became part
/// of this state.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct CommitDiff {
    pub commitment: Commitment,
    pub commit_sig: CommitSig,
    pub log_updates: Vec<LogUpdate>,
    /// Fee update first committed by this state, if any
    pub fee_update: Option<UpdateFee>,
}

#[cfg(test)]
mod test {
    use strict_encoding::{strict_deserialize, strict_serialize};

    use super::*;

    fn commitment(height: u64) -> Commitment {
        Commitment {
            height,
            our_message_index: 0,
            their_message_index: 0,
            our_htlc_index: 0,
            their_htlc_index: 0,
            our_balance_msat: 5_000_000_000,
            their_balance_msat: 5_000_000_000,
            fee_per_kw: 253,
            fee_sat: 183,
            dust_limit_sat: 354,
            tx: Transaction {
                version: 2,
                lock_time: bitcoin::PackedLockTime(height as u32),
                input: vec![],
                output: vec![],
            },
            their_signature: None,
            htlc_signatures: vec![],
            per_commitment_point: dumb_pubkey!(),
            htlcs: vec![],
        }
    }

    #[test]
    fn chain_window_of_one() {
        let mut chain = CommitmentChain::new();
        chain.add(commitment(1));
        assert!(!chain.has_unacked_commitment());
        chain.add(commitment(2));
        assert!(chain.has_unacked_commitment());
        assert_eq!(chain.tail_height(), 1);
        assert_eq!(chain.tip_height(), 2);

        chain.advance_tail();
        assert!(!chain.has_unacked_commitment());
        assert_eq!(chain.tail_height(), 2);
        assert_eq!(chain.tip_height(), 2);
    }

    #[test]
    fn commitment_roundtrip_is_bitwise_for_tx() {
        let original = commitment(7);
        let serialized = strict_serialize(&original).unwrap();
        let restored: Commitment = strict_deserialize(&serialized).unwrap();
        assert_eq!(restored, original);
        assert_eq!(
            bitcoin::consensus::serialize(&restored.tx),
            bitcoin::consensus::serialize(&original.tx)
        );
    }
}
