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

//! The commitment state machine: dual commitment chains, the update log
//! protocol, the revoke-and-ack dance, and peer-reconnect resynchronization.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use amplify::{Slice32, Wrapper};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use bitcoin_scripts::{PubkeyScript, WitnessScript};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use super::chain::{
    CommitDiff, Commitment, CommitmentChain, CommittedHtlc, LogUpdate,
};
use super::keyset::CommitmentKeys;
use super::log::{PaymentDescriptor, UpdateKind, UpdateLog, DUST_OUTPUT_INDEX};
use super::policy::{
    self, commit_tx_fee, htlc_is_dust, htlc_success_fee, htlc_timeout_fee,
    ChannelConfig, Policy, MAX_COMMITMENT_WEIGHT,
};
use super::{ChainSide, ChannelStatus, Error};
use crate::scripts::{
    self, bip69_sort, keys, ScriptGenerators, StateHintObfuscator,
    TxGenerators,
};
use crate::shachain::{RevocationProducer, RevocationStore};
use crate::signer::{SigPool, SignDescriptor, SignJob, Signer, VerifyJob};
use crate::store::{ChannelRecord, ChannelStore};
use crate::wire::{
    ChannelId, ChannelMessage, ChannelReestablish, CommitSig, OnionBlob,
    RevokeAndAck, ShortChannelId, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFailMalformedHtlc, UpdateFee, UpdateFulfillHtlc,
};

/// Parameters required to bring up a fresh channel machine once the funding
/// transaction is known.
#[derive(Clone, Debug)]
pub struct ChannelParams {
    pub chain_hash: Slice32,
    pub funding_txid: Txid,
    pub funding_output_index: u16,
    pub capacity_sat: u64,
    /// Whether the local node funded the channel and thus pays commitment
    /// fees
    pub is_initiator: bool,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub fee_per_kw: u32,
    pub local_config: ChannelConfig,
    pub remote_config: ChannelConfig,
    /// Long-term identity of the remote node
    pub remote_node: PublicKey,
    /// Seed of the local revocation pre-image chain
    pub revocation_seed: Slice32,
    /// Remote commitment point for their initial commitment
    pub remote_first_point: PublicKey,
    /// Remote commitment point for their next commitment, once known
    pub remote_next_point: Option<PublicKey>,
}

/// Read-only summary of the channel state.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChannelSnapshot {
    pub channel_id: ChannelId,
    pub short_channel_id: Option<ShortChannelId>,
    pub capacity_sat: u64,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub commit_fee_sat: u64,
    pub local_height: u64,
    pub remote_height: u64,
    pub total_msat_sent: u64,
    pub total_msat_received: u64,
    pub active_htlcs: usize,
    pub status: ChannelStatus,
}

/// Reference to a log entry by owning log and position.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct LogRef {
    in_local_log: bool,
    log_index: u64,
}

/// An active HTLC as seen by one evaluated commitment view.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ViewHtlc {
    /// Direction from the local node's point of view
    incoming: bool,
    log_index: u64,
    htlc_index: u64,
    amount_msat: u64,
    payment_hash: HashLock,
    cltv_expiry: u32,
}

/// Result of evaluating both update logs against a commitment chain: the
/// balances before fee application, the surviving Adds, and the entries
/// whose inclusion heights must be recorded if this view is committed.
#[derive(Clone, Debug)]
struct CommitmentView {
    next_height: u64,
    our_bound: u64,
    their_bound: u64,
    our_balance_msat: u64,
    their_balance_msat: u64,
    fee_per_kw: u32,
    adds: Vec<ViewHtlc>,
    newly_added: Vec<LogRef>,
    newly_removed: Vec<LogRef>,
}

/// The per-channel commitment state machine.
///
/// All operations require exclusive access; wrap the machine into
/// [`Channel`] for the shared/exclusive gating described by the
/// concurrency model.
pub struct ChannelMachine {
    pub(super) channel_id: ChannelId,
    pub(super) short_channel_id: Option<ShortChannelId>,
    pub(super) chain_hash: Slice32,
    pub(super) funding_txid: Txid,
    pub(super) funding_output_index: u16,
    pub(super) capacity_sat: u64,
    pub(super) is_initiator: bool,
    pub(super) local_config: ChannelConfig,
    pub(super) remote_config: ChannelConfig,
    pub(super) remote_node: PublicKey,
    pub(super) obfuscator: StateHintObfuscator,
    pub(super) status: ChannelStatus,

    pub(super) local_log: UpdateLog,
    pub(super) remote_log: UpdateLog,
    pub(super) local_chain: CommitmentChain,
    pub(super) remote_chain: CommitmentChain,

    pub(super) revocation_producer: RevocationProducer,
    pub(super) revocation_store: RevocationStore,
    /// Commitment point of the remote chain tail
    pub(super) current_remote_point: PublicKey,
    /// Commitment point for the next remote commitment to sign
    pub(super) next_remote_point: Option<PublicKey>,

    pub(super) pending_fee_update: Option<u32>,
    pub(super) pending_ack_fee_update: Option<u32>,

    pub(super) total_msat_sent: u64,
    pub(super) total_msat_received: u64,

    pub(super) store: Arc<ChannelStore>,
    pub(super) signer: Arc<dyn Signer>,
    pub(super) sigpool: Arc<SigPool>,
}

impl ChannelMachine {
    /// Brings up a fresh channel, validating the counterparty parameters
    /// against the local policy and constructing + persisting the initial
    /// commitments of both chains.
    pub fn new(
        params: ChannelParams,
        policy: &Policy,
        store: Arc<ChannelStore>,
        signer: Arc<dyn Signer>,
        sigpool: Arc<SigPool>,
    ) -> Result<ChannelMachine, Error> {
        policy.validate_config(&params.remote_config)?;
        policy.validate_fee_rate(params.fee_per_kw)?;
        debug_assert_eq!(
            params.local_balance_msat + params.remote_balance_msat,
            params.capacity_sat * 1000,
            "initial balances must sum up to the channel capacity"
        );

        let funding_outpoint = OutPoint::new(
            params.funding_txid,
            params.funding_output_index as u32,
        );
        let (initiator_payment, responder_payment) = if params.is_initiator {
            (
                params.local_config.keys.payment_basepoint,
                params.remote_config.keys.payment_basepoint,
            )
        } else {
            (
                params.remote_config.keys.payment_basepoint,
                params.local_config.keys.payment_basepoint,
            )
        };

        let mut machine = ChannelMachine {
            channel_id: ChannelId::with(funding_outpoint),
            short_channel_id: None,
            chain_hash: params.chain_hash,
            funding_txid: params.funding_txid,
            funding_output_index: params.funding_output_index,
            capacity_sat: params.capacity_sat,
            is_initiator: params.is_initiator,
            local_config: params.local_config,
            remote_config: params.remote_config,
            remote_node: params.remote_node,
            obfuscator: StateHintObfuscator::with(
                initiator_payment,
                responder_payment,
            ),
            status: ChannelStatus::Active,
            local_log: UpdateLog::new(),
            remote_log: UpdateLog::new(),
            local_chain: CommitmentChain::new(),
            remote_chain: CommitmentChain::new(),
            revocation_producer: RevocationProducer::new(
                params.revocation_seed,
            ),
            revocation_store: RevocationStore::new(),
            current_remote_point: params.remote_first_point,
            next_remote_point: params.remote_next_point,
            pending_fee_update: None,
            pending_ack_fee_update: None,
            total_msat_sent: 0,
            total_msat_received: 0,
            store,
            signer,
            sigpool,
        };

        let initial_view = |next_height| CommitmentView {
            next_height,
            our_bound: 0,
            their_bound: 0,
            our_balance_msat: params.local_balance_msat,
            their_balance_msat: params.remote_balance_msat,
            fee_per_kw: params.fee_per_kw,
            adds: vec![],
            newly_added: vec![],
            newly_removed: vec![],
        };

        let local_initial = machine.build_commitment(
            ChainSide::Local,
            &initial_view(0),
            machine.local_commitment_point(0),
        )?;
        machine.local_chain.add(local_initial);
        let remote_initial = machine.build_commitment(
            ChainSide::Remote,
            &initial_view(0),
            params.remote_first_point,
        )?;
        machine.remote_chain.add(remote_initial);

        machine.store.create_channel(&machine.record())?;
        debug!(
            "channel {} initialized as {}",
            machine.channel_id,
            if machine.is_initiator {
                "initiator"
            } else {
                "responder"
            }
        );
        Ok(machine)
    }

    /// Restores a channel machine from its persisted record.
    pub fn restore(
        record: ChannelRecord,
        store: Arc<ChannelStore>,
        signer: Arc<dyn Signer>,
        sigpool: Arc<SigPool>,
    ) -> ChannelMachine {
        let funding_outpoint = OutPoint::new(
            record.funding_txid,
            record.funding_output_index as u32,
        );
        let (initiator_payment, responder_payment) = if record.is_initiator {
            (
                record.local_config.keys.payment_basepoint,
                record.remote_config.keys.payment_basepoint,
            )
        } else {
            (
                record.remote_config.keys.payment_basepoint,
                record.local_config.keys.payment_basepoint,
            )
        };

        let mut local_log = UpdateLog::new();
        for entry in record.local_log {
            local_log.restore(entry);
        }
        let mut remote_log = UpdateLog::new();
        for entry in record.remote_log {
            remote_log.restore(entry);
        }
        let mut local_chain = CommitmentChain::new();
        local_chain.reset(record.local_commitment);
        let mut remote_chain = CommitmentChain::new();
        remote_chain.reset(record.remote_commitment);

        ChannelMachine {
            channel_id: ChannelId::with(funding_outpoint),
            short_channel_id: record.short_channel_id,
            chain_hash: record.chain_hash,
            funding_txid: record.funding_txid,
            funding_output_index: record.funding_output_index,
            capacity_sat: record.capacity_sat,
            is_initiator: record.is_initiator,
            local_config: record.local_config,
            remote_config: record.remote_config,
            remote_node: record.remote_node,
            obfuscator: StateHintObfuscator::with(
                initiator_payment,
                responder_payment,
            ),
            status: record.status,
            local_log,
            remote_log,
            local_chain,
            remote_chain,
            revocation_producer: RevocationProducer::new(
                record.revocation_seed,
            ),
            revocation_store: record.revocation_store,
            current_remote_point: record.current_remote_point,
            next_remote_point: record.next_remote_point,
            pending_fee_update: record.pending_fee_update,
            pending_ack_fee_update: record.pending_ack_fee_update,
            total_msat_sent: record.total_msat_sent,
            total_msat_received: record.total_msat_received,
            store,
            signer,
            sigpool,
        }
    }

    /// Produces the persisted form of the current channel state.
    pub fn record(&self) -> ChannelRecord {
        ChannelRecord {
            chain_hash: self.chain_hash,
            funding_txid: self.funding_txid,
            funding_output_index: self.funding_output_index,
            capacity_sat: self.capacity_sat,
            is_initiator: self.is_initiator,
            local_config: self.local_config,
            remote_config: self.remote_config,
            remote_node: self.remote_node,
            short_channel_id: self.short_channel_id,
            status: self.status,
            revocation_seed: self.revocation_producer.seed(),
            revocation_store: self.revocation_store.clone(),
            current_remote_point: self.current_remote_point,
            next_remote_point: self.next_remote_point,
            pending_fee_update: self.pending_fee_update,
            pending_ack_fee_update: self.pending_ack_fee_update,
            total_msat_sent: self.total_msat_sent,
            total_msat_received: self.total_msat_received,
            local_commitment: self
                .local_chain
                .tail()
                .expect("chain always has a tail")
                .clone(),
            remote_commitment: self
                .remote_chain
                .tail()
                .expect("chain always has a tail")
                .clone(),
            local_log: self.local_log.iter().cloned().collect(),
            remote_log: self.remote_log.iter().cloned().collect(),
        }
    }

    // Observers
    // =========

    /// Channel id derived from the funding outpoint.
    #[inline]
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// The funding outpoint anchoring the channel.
    #[inline]
    pub fn channel_point(&self) -> OutPoint {
        OutPoint::new(self.funding_txid, self.funding_output_index as u32)
    }

    /// Short channel id, once the funding transaction is confirmed.
    #[inline]
    pub fn short_chan_id(&self) -> Option<ShortChannelId> {
        self.short_channel_id
    }

    /// Sets the short channel id upon funding confirmation and marks the
    /// channel as open in the store. Idempotent.
    pub fn mark_open(
        &mut self,
        short_channel_id: ShortChannelId,
    ) -> Result<(), Error> {
        self.short_channel_id = Some(short_channel_id);
        self.store
            .mark_channel_open(&self.remote_node, self.channel_id, short_channel_id)?;
        Ok(())
    }

    #[inline]
    pub fn is_borked(&self) -> bool {
        self.status == ChannelStatus::Borked
    }

    #[inline]
    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// 2-of-2 witness script of the funding output.
    pub fn funding_script(&self) -> WitnessScript {
        WitnessScript::ln_funding(
            self.local_config.keys.funding_pubkey,
            self.remote_config.keys.funding_pubkey,
        )
    }

    /// Pay-to-witness-script-hash form of the funding script; this is the
    /// script a chain watcher must observe for spends.
    pub fn funding_script_pubkey(&self) -> PubkeyScript {
        PubkeyScript::ln_funding(
            self.local_config.keys.funding_pubkey,
            self.remote_config.keys.funding_pubkey,
        )
    }

    /// Summary of the current channel state.
    pub fn snapshot(&self) -> ChannelSnapshot {
        let local_tail =
            self.local_chain.tail().expect("chain always has a tail");
        ChannelSnapshot {
            channel_id: self.channel_id,
            short_channel_id: self.short_channel_id,
            capacity_sat: self.capacity_sat,
            local_balance_msat: local_tail.our_balance_msat,
            remote_balance_msat: local_tail.their_balance_msat,
            commit_fee_sat: local_tail.fee_sat,
            local_height: self.local_chain.tail_height(),
            remote_height: self.remote_chain.tail_height(),
            total_msat_sent: self.total_msat_sent,
            total_msat_received: self.total_msat_received,
            active_htlcs: local_tail
                .htlcs
                .len(),
            status: self.status,
        }
    }

    /// Balance available for a new outgoing HTLC: the prospective local
    /// balance on the remote chain after the commitment fee and above the
    /// local reserve.
    pub fn available_balance(&self) -> u64 {
        let view = self.evaluate_view(
            ChainSide::Remote,
            self.local_log.log_counter(),
            self.remote_log.log_counter(),
        );
        let untrimmed = self.count_untrimmed(ChainSide::Remote, &view);
        let mut balance = view.our_balance_msat;
        if self.is_initiator {
            balance = balance
                .saturating_sub(commit_tx_fee(view.fee_per_kw, untrimmed) * 1000);
        }
        balance.saturating_sub(self.local_config.channel_reserve_sat * 1000)
    }

    // Log-mutating operations
    // =======================

    /// Queues a new outgoing HTLC, returning its HTLC index.
    pub fn add_htlc(
        &mut self,
        amount_msat: u64,
        payment_hash: HashLock,
        cltv_expiry: u32,
        onion_blob: OnionBlob,
    ) -> Result<u64, Error> {
        self.ensure_active()?;
        self.validate_new_htlc(amount_msat, true)?;
        let htlc_index = self.local_log.append_add(
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion_blob,
        );
        trace!(
            "channel {}: queued outgoing HTLC #{} of {} msat",
            self.channel_id,
            htlc_index,
            amount_msat
        );
        Ok(htlc_index)
    }

    /// Queues an HTLC received from the remote peer, returning its HTLC
    /// index.
    pub fn receive_htlc(
        &mut self,
        add: &UpdateAddHtlc,
    ) -> Result<u64, Error> {
        self.ensure_active()?;
        self.validate_new_htlc(add.amount_msat, false)?;
        let htlc_index = self.remote_log.append_add(
            add.amount_msat,
            add.payment_hash,
            add.cltv_expiry,
            add.onion_blob.clone(),
        );
        Ok(htlc_index)
    }

    /// Settles an incoming HTLC with its payment pre-image. The HTLC must
    /// be locked in on both chains.
    pub fn settle_htlc(
        &mut self,
        preimage: HashPreimage,
        htlc_index: u64,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        let entry = self
            .remote_log
            .htlc(htlc_index)
            .ok_or(Error::UnknownHtlcIndex(htlc_index))?;
        ensure_locked_in(entry)?;
        if self.local_log.has_removal_for(htlc_index) {
            return Err(Error::UnknownHtlcIndex(htlc_index));
        }
        let payment_hash =
            entry.payment_hash().ok_or(Error::UnknownHtlcIndex(htlc_index))?;
        if HashLock::from(preimage) != payment_hash {
            return Err(Error::InvalidPreimage { htlc_index });
        }
        let amount_msat = entry.amount_msat;
        self.local_log.append_removal(
            htlc_index,
            amount_msat,
            UpdateKind::Settle { preimage },
        );
        Ok(())
    }

    /// Processes the settlement of one of our outgoing HTLCs by the remote
    /// peer.
    pub fn receive_htlc_settle(
        &mut self,
        preimage: HashPreimage,
        htlc_index: u64,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        let entry = self
            .local_log
            .htlc(htlc_index)
            .ok_or(Error::UnknownHtlcIndex(htlc_index))?;
        ensure_locked_in(entry)?;
        if self.remote_log.has_removal_for(htlc_index) {
            return Err(Error::UnknownHtlcIndex(htlc_index));
        }
        let payment_hash =
            entry.payment_hash().ok_or(Error::UnknownHtlcIndex(htlc_index))?;
        if HashLock::from(preimage) != payment_hash {
            return Err(Error::InvalidPreimage { htlc_index });
        }
        let amount_msat = entry.amount_msat;
        self.remote_log.append_removal(
            htlc_index,
            amount_msat,
            UpdateKind::Settle { preimage },
        );
        Ok(())
    }

    /// Fails an incoming HTLC back to its sender.
    pub fn fail_htlc(
        &mut self,
        htlc_index: u64,
        reason: Vec<u8>,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        self.queue_removal(htlc_index, true, UpdateKind::Fail { reason })
    }

    /// Processes the failure of one of our outgoing HTLCs.
    pub fn receive_fail_htlc(
        &mut self,
        htlc_index: u64,
        reason: Vec<u8>,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        self.queue_removal(htlc_index, false, UpdateKind::Fail { reason })
    }

    /// Fails an incoming HTLC whose onion could not be parsed.
    pub fn malformed_fail_htlc(
        &mut self,
        htlc_index: u64,
        failure_code: u16,
        sha_onion_blob: bitcoin::hashes::sha256::Hash,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        self.queue_removal(htlc_index, true, UpdateKind::MalformedFail {
            failure_code,
            sha_onion_blob,
        })
    }

    /// Processes a malformed-onion failure of one of our outgoing HTLCs.
    pub fn receive_malformed_fail_htlc(
        &mut self,
        htlc_index: u64,
        failure_code: u16,
        sha_onion_blob: bitcoin::hashes::sha256::Hash,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        self.queue_removal(htlc_index, false, UpdateKind::MalformedFail {
            failure_code,
            sha_onion_blob,
        })
    }

    /// Queues a commitment fee change. Only the channel initiator may send
    /// fee updates.
    pub fn update_fee(&mut self, fee_per_kw: u32) -> Result<(), Error> {
        self.ensure_active()?;
        if !self.is_initiator {
            return Err(Error::FeeUpdateMismatch);
        }
        self.validate_fee_update(fee_per_kw)?;
        self.pending_fee_update = Some(fee_per_kw);
        Ok(())
    }

    /// Processes a commitment fee change sent by the initiator. Only the
    /// non-initiator may receive fee updates.
    pub fn receive_update_fee(&mut self, fee_per_kw: u32) -> Result<(), Error> {
        self.ensure_active()?;
        if self.is_initiator {
            return Err(Error::FeeUpdateMismatch);
        }
        self.validate_fee_update(fee_per_kw)?;
        self.pending_fee_update = Some(fee_per_kw);
        Ok(())
    }

    // State-advancing operations
    // ==========================

    /// Signs the next commitment of the remote chain, covering all local
    /// updates and every remote update we have irrevocably acknowledged.
    ///
    /// The commitment diff is persisted before this method returns, so a
    /// crash after the wire send is recoverable by replay.
    pub fn sign_next_commitment(
        &mut self,
    ) -> Result<(Signature, Vec<Signature>), Error> {
        self.ensure_active()?;
        let commitment_point =
            self.next_remote_point.ok_or(Error::NoWindow)?;
        if self.remote_chain.has_unacked_commitment() {
            return Err(Error::NoWindow);
        }

        let our_bound = self.local_log.log_counter();
        let their_bound = self
            .local_chain
            .tail()
            .expect("chain always has a tail")
            .their_message_index;
        let view =
            self.evaluate_view(ChainSide::Remote, our_bound, their_bound);
        let commitment =
            self.build_commitment(ChainSide::Remote, &view, commitment_point)?;

        let commit_sig = self.sign_commitment(&commitment)?;
        let htlc_sigs =
            self.sign_second_level_htlcs(ChainSide::Remote, &commitment)?;

        self.apply_commitment_view(ChainSide::Remote, &view, &commitment);
        let next_height = commitment.height;
        self.remote_chain.add(commitment.clone());

        // A pending fee update signed towards the remote party awaits their
        // acknowledgement now
        let fee_update = if self.is_initiator {
            let promoted = self.pending_fee_update.take();
            if promoted.is_some() {
                self.pending_ack_fee_update = promoted;
            }
            promoted.map(|fee_per_kw| UpdateFee {
                channel_id: self.channel_id,
                feerate_per_kw: fee_per_kw,
            })
        } else {
            None
        };

        let commit_sig_msg = CommitSig {
            channel_id: self.channel_id,
            signature: commit_sig,
            htlc_signatures: htlc_sigs.clone(),
        };
        let diff = CommitDiff {
            commitment,
            commit_sig: commit_sig_msg,
            log_updates: self.log_updates_at(ChainSide::Remote, next_height),
            fee_update,
        };
        self.store.put_commit_diff(self.channel_id, &diff)?;
        self.store.update_channel(&self.record())?;
        debug!(
            "channel {}: signed remote commitment at height {}",
            self.channel_id, next_height
        );

        Ok((commit_sig, htlc_sigs))
    }

    /// Validates and accepts a new commitment for the local chain signed by
    /// the remote party. On any failure nothing is mutated.
    pub fn receive_new_commitment(
        &mut self,
        commit_sig: Signature,
        htlc_sigs: Vec<Signature>,
    ) -> Result<(), Error> {
        self.ensure_active()?;

        let our_bound = self
            .remote_chain
            .tail()
            .expect("chain always has a tail")
            .our_message_index;
        let their_bound = self.remote_log.log_counter();
        let view =
            self.evaluate_view(ChainSide::Local, our_bound, their_bound);
        let next_height = view.next_height;
        let commitment_point = self.local_commitment_point(next_height);
        let mut commitment =
            self.build_commitment(ChainSide::Local, &view, commitment_point)?;

        // Sanity: active HTLC ceilings on either side
        let incoming =
            view.adds.iter().filter(|htlc| htlc.incoming).count();
        let outgoing = view.adds.len() - incoming;
        if incoming > self.local_config.max_accepted_htlcs as usize {
            return Err(Error::MaxHtlcsExceeded {
                limit: self.local_config.max_accepted_htlcs,
            });
        }
        if outgoing > self.remote_config.max_accepted_htlcs as usize {
            return Err(Error::MaxHtlcsExceeded {
                limit: self.remote_config.max_accepted_htlcs,
            });
        }

        // The commitment signature is checked under the remote funding key
        let funding_script = self.funding_script();
        let sighash = scripts::segwit_sighash(
            &commitment.tx,
            0,
            funding_script.as_inner(),
            self.capacity_sat,
        );
        if SECP256K1
            .verify_ecdsa(
                &sighash,
                &commit_sig,
                &self.remote_config.keys.funding_pubkey,
            )
            .is_err()
        {
            return Err(Error::InvalidCommitSig {
                height: next_height,
                commit_sig: Box::new(commit_sig),
                sig_hash: sighash.as_ref().to_vec(),
                commit_tx: bitcoin::consensus::serialize(&commitment.tx),
            });
        }

        // Each HTLC signature is checked against its reconstructed
        // second-level transaction, in parallel
        let second_levels =
            self.second_level_transactions(ChainSide::Local, &commitment);
        if second_levels.len() != htlc_sigs.len() {
            return Err(Error::HtlcSigCountMismatch {
                expected: second_levels.len(),
                provided: htlc_sigs.len(),
            });
        }
        let commitment_keys = CommitmentKeys::derive(
            SECP256K1,
            &self.local_config.keys,
            &self.remote_config.keys,
            commitment_point,
        );
        let verify_jobs = second_levels
            .iter()
            .zip(&htlc_sigs)
            .map(|((tx, first_level_script, amount_sat), sig)| VerifyJob {
                message: scripts::segwit_sighash(
                    tx,
                    0,
                    first_level_script.as_inner(),
                    *amount_sat,
                ),
                signature: *sig,
                pubkey: commitment_keys.countersignatory_htlc_pubkey,
            })
            .collect();
        self.sigpool.verify_batch(verify_jobs).map_err(|err| match err {
            crate::signer::Error::InvalidSignature { index } => {
                Error::InvalidHtlcSig {
                    output_index: index,
                }
            }
            other => Error::Signer(other),
        })?;

        self.apply_commitment_view(ChainSide::Local, &view, &commitment);
        commitment.their_signature = Some(commit_sig);
        commitment.htlc_signatures = htlc_sigs;
        self.local_chain.add(commitment);

        // A fee update signed over to us is awaiting our revocation
        if !self.is_initiator {
            if let Some(fee_per_kw) = self.pending_fee_update.take() {
                self.pending_ack_fee_update = Some(fee_per_kw);
            }
        }
        debug!(
            "channel {}: accepted local commitment at height {}",
            self.channel_id, next_height
        );
        Ok(())
    }

    /// Revokes the superseded local commitment, advancing the local chain
    /// tail and persisting the newly committed state.
    pub fn revoke_current_commitment(&mut self) -> Result<RevokeAndAck, Error> {
        self.ensure_active()?;
        if !self.local_chain.has_unacked_commitment() {
            return Err(Error::NoPendingCommitment);
        }
        let revoked_height = self.local_chain.tail_height();
        self.local_chain.advance_tail();

        // An initiator fee update is fully locked in once our own local
        // commitment carrying it is revoked over
        if self.is_initiator {
            self.pending_ack_fee_update = None;
        }

        self.store.update_channel(&self.record())?;
        debug!(
            "channel {}: revoked local commitment at height {}",
            self.channel_id, revoked_height
        );
        Ok(self.revocation_message(revoked_height))
    }

    /// Processes the remote revocation of their superseded commitment.
    ///
    /// Returns every remote Add that has just become fully locked in on
    /// both chains and was not surfaced for forwarding before.
    pub fn receive_revocation(
        &mut self,
        msg: &RevokeAndAck,
    ) -> Result<Vec<PaymentDescriptor>, Error> {
        self.ensure_active()?;
        if !self.remote_chain.has_unacked_commitment() {
            return Err(Error::NoPendingCommitment);
        }
        let revoked_height = self.remote_chain.tail_height();

        let secret = msg.per_commitment_secret;
        let secret_key = SecretKey::from_slice(secret.as_inner())
            .map_err(|_| Error::InvalidRevocation)?;
        if PublicKey::from_secret_key(SECP256K1, &secret_key)
            != self.current_remote_point
        {
            return Err(Error::InvalidRevocation);
        }
        self.revocation_store
            .add_next(revoked_height, secret)
            .map_err(|_| Error::InvalidRevocation)?;

        // The revoked state is archived for breach reconstruction before the
        // tail advances over it
        let revoked_commitment = self
            .remote_chain
            .tail()
            .expect("chain always has a tail")
            .clone();
        self.store.append_revocation_log(
            self.channel_id,
            &revoked_commitment,
        )?;

        self.current_remote_point = self
            .next_remote_point
            .expect("a signed commitment implies a known next point");
        self.next_remote_point = Some(msg.next_per_commitment_point);
        self.remote_chain.advance_tail();

        // A received fee update is fully locked in once the initiator
        // revoked the state preceding it
        if !self.is_initiator {
            self.pending_ack_fee_update = None;
        }

        let forwardable = self.collect_forwardable();
        self.compact_logs();

        self.store.delete_commit_diff(self.channel_id)?;
        self.store.update_channel(&self.record())?;
        debug!(
            "channel {}: remote revoked height {}, {} HTLC(s) forwardable",
            self.channel_id,
            revoked_height,
            forwardable.len()
        );
        Ok(forwardable)
    }

    // Reconnection
    // ============

    /// Composes the `channel_reestablish` message describing our view of
    /// both chains.
    pub fn compose_chan_sync(&self) -> ChannelReestablish {
        let remote_tail = self.remote_chain.tail_height();
        let last_secret = if remote_tail == 0 {
            Slice32::default()
        } else {
            self.revocation_store
                .secret_at(remote_tail - 1)
                .unwrap_or_default()
        };
        ChannelReestablish {
            channel_id: self.channel_id,
            next_commitment_number: self.local_chain.tip_height() + 1,
            next_revocation_number: self.remote_chain.tail_height(),
            your_last_per_commitment_secret: last_secret,
            my_current_per_commitment_point: self
                .local_commitment_point(self.local_chain.tail_height()),
        }
    }

    /// Processes the peer's `channel_reestablish`, returning the messages
    /// which must be retransmitted to resynchronize the channel.
    pub fn process_chan_sync(
        &mut self,
        msg: &ChannelReestablish,
    ) -> Result<Vec<ChannelMessage>, Error> {
        if self.status == ChannelStatus::Borked {
            return Err(Error::ChannelBorked);
        }

        let local_tail = self.local_chain.tail_height();
        let remote_tip = self.remote_chain.tip_height();

        // Their claim about how many of our states they saw revoked, backed
        // by the last secret we supposedly revealed
        let their_view_of_our_tail = msg.next_revocation_number;
        if their_view_of_our_tail > 0 {
            let claimed_height = their_view_of_our_tail - 1;
            let expected =
                self.revocation_producer.at_height(claimed_height);
            if msg.your_last_per_commitment_secret != expected {
                self.mark_borked();
                return Err(Error::InvalidLastCommitSecret);
            }
        }
        if their_view_of_our_tail > local_tail {
            // The secret checks out, so the remote truly is ahead of us
            self.mark_borked();
            return Err(Error::CommitSyncDataLoss);
        }

        let mut replay = vec![];

        if their_view_of_our_tail + 1 == local_tail {
            // They never received our last revocation
            replay.push(ChannelMessage::RevokeAndAck(
                self.revocation_message(local_tail - 1),
            ));
            if self.local_chain.tip_height() > self.remote_chain.tip_height()
            {
                // We also never managed to extend their chain; re-sign,
                // tolerating an exhausted window
                match self.sign_next_commitment() {
                    Ok(_) => {
                        let diff = self
                            .store
                            .fetch_commit_diff(self.channel_id)?
                            .expect("diff persisted by signing");
                        replay.extend(Self::diff_messages(diff));
                    }
                    Err(Error::NoWindow) => {}
                    Err(err) => return Err(err),
                }
            }
        } else if their_view_of_our_tail != local_tail {
            self.mark_borked();
            return Err(Error::CannotSyncCommitChains);
        }

        if msg.next_commitment_number == remote_tip
            && self.remote_chain.has_unacked_commitment()
        {
            // They never received our last commitment: replay the persisted
            // diff verbatim
            let diff = self
                .store
                .fetch_commit_diff(self.channel_id)?
                .ok_or_else(|| {
                    self.mark_borked();
                    Error::CannotSyncCommitChains
                })?;
            replay.extend(Self::diff_messages(diff));
        } else if msg.next_commitment_number != remote_tip + 1 {
            self.mark_borked();
            return Err(Error::CannotSyncCommitChains);
        }

        info!(
            "channel {}: reconnect sync complete, {} message(s) to replay",
            self.channel_id,
            replay.len()
        );
        Ok(replay)
    }

    // Internals
    // =========

    fn ensure_active(&self) -> Result<(), Error> {
        match self.status {
            ChannelStatus::Active => Ok(()),
            ChannelStatus::Borked => Err(Error::ChannelBorked),
            _ => Err(Error::ChannelClosing),
        }
    }

    pub(super) fn mark_borked(&mut self) {
        self.status = ChannelStatus::Borked;
        if let Err(err) = self.store.update_channel(&self.record()) {
            error!(
                "channel {}: failed to persist borked status: {}",
                self.channel_id, err
            );
        }
        warn!("channel {} is marked borked", self.channel_id);
    }

    /// Local commitment point for a given local chain height.
    pub(super) fn local_commitment_point(&self, height: u64) -> PublicKey {
        keys::commitment_point(
            SECP256K1,
            self.revocation_producer.at_height(height),
        )
    }

    fn revocation_message(&self, revoked_height: u64) -> RevokeAndAck {
        RevokeAndAck {
            channel_id: self.channel_id,
            per_commitment_secret: self
                .revocation_producer
                .at_height(revoked_height),
            next_per_commitment_point: self
                .local_commitment_point(revoked_height + 2),
        }
    }

    fn diff_messages(diff: CommitDiff) -> Vec<ChannelMessage> {
        let mut messages: Vec<ChannelMessage> = diff
            .log_updates
            .into_iter()
            .map(|update| update.message)
            .collect();
        if let Some(fee_update) = diff.fee_update {
            messages.push(ChannelMessage::UpdateFee(fee_update));
        }
        messages.push(ChannelMessage::CommitSig(diff.commit_sig));
        messages
    }

    fn queue_removal(
        &mut self,
        htlc_index: u64,
        incoming: bool,
        kind: UpdateKind,
    ) -> Result<(), Error> {
        let (parent_log, removal_log) = if incoming {
            (&self.remote_log, &mut self.local_log)
        } else {
            (&self.local_log, &mut self.remote_log)
        };
        let entry = parent_log
            .htlc(htlc_index)
            .ok_or(Error::UnknownHtlcIndex(htlc_index))?;
        ensure_locked_in(entry)?;
        if removal_log.has_removal_for(htlc_index) {
            return Err(Error::UnknownHtlcIndex(htlc_index));
        }
        let amount_msat = entry.amount_msat;
        removal_log.append_removal(htlc_index, amount_msat, kind);
        Ok(())
    }

    fn validate_new_htlc(
        &self,
        amount_msat: u64,
        outgoing: bool,
    ) -> Result<(), Error> {
        // The receiving side's limits apply
        let receiver_config = if outgoing {
            &self.remote_config
        } else {
            &self.local_config
        };
        if amount_msat < receiver_config.htlc_minimum_msat {
            return Err(Error::AmountBelowMinimum {
                amount_msat,
                minimum_msat: receiver_config.htlc_minimum_msat,
            });
        }

        let view = self.evaluate_view(
            ChainSide::Remote,
            self.local_log.log_counter(),
            self.remote_log.log_counter(),
        );
        let in_direction = |incoming: bool| {
            view.adds.iter().filter(move |htlc| htlc.incoming == incoming)
        };
        let active = in_direction(!outgoing).count();
        if active + 1 > receiver_config.max_accepted_htlcs as usize {
            return Err(Error::MaxHtlcsExceeded {
                limit: receiver_config.max_accepted_htlcs,
            });
        }
        let in_flight: u64 = in_direction(!outgoing)
            .map(|htlc| htlc.amount_msat)
            .sum::<u64>()
            + amount_msat;
        if in_flight > receiver_config.max_htlc_value_in_flight_msat {
            return Err(Error::MaxInFlightExceeded {
                limit_msat: receiver_config.max_htlc_value_in_flight_msat,
            });
        }

        // Sender must keep its balance above the reserve after paying the
        // HTLC and, for the initiator, the fee increment of a new non-dust
        // output
        let untrimmed = self.count_untrimmed(ChainSide::Remote, &view);
        let new_is_dust = htlc_is_dust(
            !outgoing,
            amount_msat,
            view.fee_per_kw,
            self.remote_config.dust_limit_sat,
        );
        let prospective_untrimmed =
            untrimmed + if new_is_dust { 0 } else { 1 };
        let fee_msat =
            commit_tx_fee(view.fee_per_kw, prospective_untrimmed) * 1000;

        let (sender_balance, sender_is_initiator, sender_reserve) = if outgoing
        {
            (
                view.our_balance_msat,
                self.is_initiator,
                self.local_config.channel_reserve_sat,
            )
        } else {
            (
                view.their_balance_msat,
                !self.is_initiator,
                self.remote_config.channel_reserve_sat,
            )
        };
        let mut available = sender_balance;
        if sender_is_initiator {
            available = available.saturating_sub(fee_msat);
        }
        available = available.saturating_sub(sender_reserve * 1000);
        if available < amount_msat {
            return Err(Error::InsufficientBalance {
                available_msat: available,
                required_msat: amount_msat,
            });
        }
        Ok(())
    }

    fn validate_fee_update(&self, fee_per_kw: u32) -> Result<(), Error> {
        // The initiator's balance must survive the new fee above its reserve
        let view = self.evaluate_view(
            ChainSide::Remote,
            self.local_log.log_counter(),
            self.remote_log.log_counter(),
        );
        let untrimmed = self.count_untrimmed(ChainSide::Remote, &view);
        let fee_msat = commit_tx_fee(fee_per_kw, untrimmed) * 1000;
        let (initiator_balance, initiator_reserve) = if self.is_initiator {
            (
                view.our_balance_msat,
                self.local_config.channel_reserve_sat,
            )
        } else {
            (
                view.their_balance_msat,
                self.remote_config.channel_reserve_sat,
            )
        };
        let remaining = initiator_balance.saturating_sub(fee_msat);
        if remaining < initiator_reserve * 1000 {
            return Err(Error::InsufficientBalance {
                available_msat: remaining,
                required_msat: initiator_reserve * 1000,
            });
        }
        Ok(())
    }

    /// Fee rate a new view of the given chain must use, taking the pending
    /// fee update slots into account.
    fn view_fee_rate(&self, side: ChainSide) -> u32 {
        let tip_fee = self
            .chain(side)
            .tip()
            .expect("chain always has a tail")
            .fee_per_kw;
        if self.is_initiator {
            match side {
                ChainSide::Remote if self.pending_fee_update.is_some() => {
                    self.pending_fee_update.unwrap_or(tip_fee)
                }
                ChainSide::Local
                    if self.pending_ack_fee_update.is_some() =>
                {
                    self.pending_ack_fee_update.unwrap_or(tip_fee)
                }
                _ => tip_fee,
            }
        } else {
            match side {
                ChainSide::Local if self.pending_fee_update.is_some() => {
                    self.pending_fee_update.unwrap_or(tip_fee)
                }
                ChainSide::Remote
                    if self.pending_ack_fee_update.is_some() =>
                {
                    self.pending_ack_fee_update.unwrap_or(tip_fee)
                }
                _ => tip_fee,
            }
        }
    }

    #[inline]
    fn chain(&self, side: ChainSide) -> &CommitmentChain {
        match side {
            ChainSide::Local => &self.local_chain,
            ChainSide::Remote => &self.remote_chain,
        }
    }

    /// Turns the two update logs into the balances and active HTLC set of
    /// the next commitment of the given chain. Pure: the recorded height
    /// mutations are applied separately by [`Self::apply_commitment_view`].
    fn evaluate_view(
        &self,
        side: ChainSide,
        our_bound: u64,
        their_bound: u64,
    ) -> CommitmentView {
        let tip = self.chain(side).tip().expect("chain always has a tail");
        let next_height = tip.height + 1;

        let mut our_balance = tip.our_balance_msat;
        let mut their_balance = tip.their_balance_msat;
        // The previous fee is reclaimed before the new one is applied
        if self.is_initiator {
            our_balance += tip.fee_sat * 1000;
        } else {
            their_balance += tip.fee_sat * 1000;
        }

        let mut newly_added = vec![];
        let mut newly_removed = vec![];
        let mut skip_ours = BTreeSet::new();
        let mut skip_theirs = BTreeSet::new();

        // Resolution pass: removals adjust balances once per chain and veto
        // their parent Adds
        for entry in self
            .local_log
            .iter()
            .filter(|entry| entry.log_index < our_bound && entry.is_removal())
        {
            skip_theirs.insert(entry.parent_index);
            if entry.remove_height(side) != 0 {
                continue;
            }
            match entry.kind {
                UpdateKind::Settle { .. } => our_balance += entry.amount_msat,
                _ => their_balance += entry.amount_msat,
            }
            newly_removed.push(LogRef {
                in_local_log: true,
                log_index: entry.log_index,
            });
        }
        for entry in self.remote_log.iter().filter(|entry| {
            entry.log_index < their_bound && entry.is_removal()
        }) {
            skip_ours.insert(entry.parent_index);
            if entry.remove_height(side) != 0 {
                continue;
            }
            match entry.kind {
                UpdateKind::Settle { .. } => {
                    their_balance += entry.amount_msat
                }
                _ => our_balance += entry.amount_msat,
            }
            newly_removed.push(LogRef {
                in_local_log: false,
                log_index: entry.log_index,
            });
        }

        // Addition pass: surviving Adds debit their sender exactly once per
        // chain
        let mut adds = vec![];
        for entry in self
            .local_log
            .iter()
            .filter(|entry| entry.log_index < our_bound && entry.kind.is_add())
        {
            if skip_ours.contains(&entry.htlc_index) {
                continue;
            }
            if entry.add_height(side) == 0 {
                our_balance = our_balance.saturating_sub(entry.amount_msat);
                newly_added.push(LogRef {
                    in_local_log: true,
                    log_index: entry.log_index,
                });
            }
            adds.push(ViewHtlc {
                incoming: false,
                log_index: entry.log_index,
                htlc_index: entry.htlc_index,
                amount_msat: entry.amount_msat,
                payment_hash: entry
                    .payment_hash()
                    .expect("Add entries always carry a payment hash"),
                cltv_expiry: entry
                    .cltv_expiry()
                    .expect("Add entries always carry an expiry"),
            });
        }
        for entry in self.remote_log.iter().filter(|entry| {
            entry.log_index < their_bound && entry.kind.is_add()
        }) {
            if skip_theirs.contains(&entry.htlc_index) {
                continue;
            }
            if entry.add_height(side) == 0 {
                their_balance =
                    their_balance.saturating_sub(entry.amount_msat);
                newly_added.push(LogRef {
                    in_local_log: false,
                    log_index: entry.log_index,
                });
            }
            adds.push(ViewHtlc {
                incoming: true,
                log_index: entry.log_index,
                htlc_index: entry.htlc_index,
                amount_msat: entry.amount_msat,
                payment_hash: entry
                    .payment_hash()
                    .expect("Add entries always carry a payment hash"),
                cltv_expiry: entry
                    .cltv_expiry()
                    .expect("Add entries always carry an expiry"),
            });
        }

        CommitmentView {
            next_height,
            our_bound,
            their_bound,
            our_balance_msat: our_balance,
            their_balance_msat: their_balance,
            fee_per_kw: self.view_fee_rate(side),
            adds,
            newly_added,
            newly_removed,
        }
    }

    fn count_untrimmed(&self, side: ChainSide, view: &CommitmentView) -> usize {
        let owner_dust = self.owner_config(side).dust_limit_sat;
        view.adds
            .iter()
            .filter(|htlc| {
                !htlc_is_dust(
                    self.incoming_to_owner(side, htlc.incoming),
                    htlc.amount_msat,
                    view.fee_per_kw,
                    owner_dust,
                )
            })
            .count()
    }

    #[inline]
    fn owner_config(&self, side: ChainSide) -> &ChannelConfig {
        match side {
            ChainSide::Local => &self.local_config,
            ChainSide::Remote => &self.remote_config,
        }
    }

    /// Translates the local-PoV direction of an HTLC into the direction
    /// relative to the owner of the given chain.
    #[inline]
    fn incoming_to_owner(&self, side: ChainSide, incoming: bool) -> bool {
        match side {
            ChainSide::Local => incoming,
            ChainSide::Remote => !incoming,
        }
    }

    /// Assembles the commitment transaction of a view: fee application,
    /// dust trimming, script construction, BIP-69 ordering and the state
    /// hint. Pure; mutations are deferred to
    /// [`Self::apply_commitment_view`].
    fn build_commitment(
        &self,
        side: ChainSide,
        view: &CommitmentView,
        commitment_point: PublicKey,
    ) -> Result<Commitment, Error> {
        let owner_config = self.owner_config(side);
        let owner_dust = owner_config.dust_limit_sat;
        let untrimmed = self.count_untrimmed(side, view);
        let weight = policy::COMMITMENT_TX_BASE_WEIGHT
            + policy::HTLC_OUTPUT_WEIGHT * untrimmed as u64;
        if weight > MAX_COMMITMENT_WEIGHT {
            return Err(Error::MaxWeightExceeded {
                weight,
                limit: MAX_COMMITMENT_WEIGHT,
            });
        }
        let fee_sat = commit_tx_fee(view.fee_per_kw, untrimmed);

        let mut our_balance = view.our_balance_msat;
        let mut their_balance = view.their_balance_msat;
        if self.is_initiator {
            our_balance = our_balance.saturating_sub(fee_sat * 1000);
        } else {
            their_balance = their_balance.saturating_sub(fee_sat * 1000);
        }
        let (owner_balance, countersig_balance) = match side {
            ChainSide::Local => (our_balance, their_balance),
            ChainSide::Remote => (their_balance, our_balance),
        };

        let (broadcaster, countersignatory) = match side {
            ChainSide::Local => {
                (&self.local_config.keys, &self.remote_config.keys)
            }
            ChainSide::Remote => {
                (&self.remote_config.keys, &self.local_config.keys)
            }
        };
        let commitment_keys = CommitmentKeys::derive(
            SECP256K1,
            broadcaster,
            countersignatory,
            commitment_point,
        );

        // Outputs travel together with the index of their HTLC within the
        // view so the final position survives the BIP-69 sort
        let mut outputs: Vec<(TxOut, Option<usize>)> = vec![];
        for (view_index, htlc) in view.adds.iter().enumerate() {
            let incoming_to_owner =
                self.incoming_to_owner(side, htlc.incoming);
            if htlc_is_dust(
                incoming_to_owner,
                htlc.amount_msat,
                view.fee_per_kw,
                owner_dust,
            ) {
                continue;
            }
            let script_pubkey: PubkeyScript = if incoming_to_owner {
                PubkeyScript::ln_received_htlc(
                    commitment_keys.revocation_pubkey,
                    commitment_keys.broadcaster_htlc_pubkey,
                    commitment_keys.countersignatory_htlc_pubkey,
                    htlc.cltv_expiry,
                    htlc.payment_hash,
                )
            } else {
                PubkeyScript::ln_offered_htlc(
                    commitment_keys.revocation_pubkey,
                    commitment_keys.broadcaster_htlc_pubkey,
                    commitment_keys.countersignatory_htlc_pubkey,
                    htlc.payment_hash,
                )
            };
            outputs.push((
                TxOut {
                    value: htlc.amount_msat / 1000,
                    script_pubkey: script_pubkey.into_inner(),
                },
                Some(view_index),
            ));
        }

        if owner_balance / 1000 >= owner_dust {
            let script_pubkey: PubkeyScript = PubkeyScript::ln_to_local(
                commitment_keys.revocation_pubkey,
                commitment_keys.broadcaster_delayed_pubkey,
                owner_config.to_self_delay,
            );
            outputs.push((
                TxOut {
                    value: owner_balance / 1000,
                    script_pubkey: script_pubkey.into_inner(),
                },
                None,
            ));
        }
        if countersig_balance / 1000 >= owner_dust {
            outputs.push((
                scripts::to_remote_output(
                    countersig_balance / 1000,
                    commitment_keys.countersignatory_payment_pubkey,
                ),
                None,
            ));
        }

        bip69_sort(&mut outputs);

        let mut htlcs: Vec<CommittedHtlc> = vec![];
        for (position, (_, view_index)) in outputs.iter().enumerate() {
            if let Some(view_index) = view_index {
                let htlc = &view.adds[*view_index];
                htlcs.push(CommittedHtlc {
                    incoming: htlc.incoming,
                    amount_msat: htlc.amount_msat,
                    payment_hash: htlc.payment_hash,
                    cltv_expiry: htlc.cltv_expiry,
                    htlc_index: htlc.htlc_index,
                    log_index: htlc.log_index,
                    output_index: position as i32,
                });
            }
        }
        for htlc in view.adds.iter() {
            let incoming_to_owner =
                self.incoming_to_owner(side, htlc.incoming);
            if htlc_is_dust(
                incoming_to_owner,
                htlc.amount_msat,
                view.fee_per_kw,
                owner_dust,
            ) {
                htlcs.push(CommittedHtlc {
                    incoming: htlc.incoming,
                    amount_msat: htlc.amount_msat,
                    payment_hash: htlc.payment_hash,
                    cltv_expiry: htlc.cltv_expiry,
                    htlc_index: htlc.htlc_index,
                    log_index: htlc.log_index,
                    output_index: DUST_OUTPUT_INDEX,
                });
            }
        }

        let tx = scripts::commitment_tx(
            self.channel_point(),
            self.obfuscator,
            view.next_height,
            outputs.into_iter().map(|(txout, _)| txout).collect(),
        );

        Ok(Commitment {
            height: view.next_height,
            our_message_index: view.our_bound,
            their_message_index: view.their_bound,
            our_htlc_index: self.local_log.htlc_counter_at(view.our_bound),
            their_htlc_index: self
                .remote_log
                .htlc_counter_at(view.their_bound),
            our_balance_msat: our_balance,
            their_balance_msat: their_balance,
            fee_per_kw: view.fee_per_kw,
            fee_sat,
            dust_limit_sat: owner_dust,
            tx,
            their_signature: None,
            htlc_signatures: vec![],
            per_commitment_point: commitment_point,
            htlcs,
        })
    }

    /// Records the side effects of committing a view: first-inclusion
    /// heights and cached output indices.
    fn apply_commitment_view(
        &mut self,
        side: ChainSide,
        view: &CommitmentView,
        commitment: &Commitment,
    ) {
        for log_ref in &view.newly_removed {
            if let Some(entry) = self.entry_mut(*log_ref) {
                entry.set_remove_height(side, view.next_height);
            }
        }
        for log_ref in &view.newly_added {
            if let Some(entry) = self.entry_mut(*log_ref) {
                entry.set_add_height(side, view.next_height);
            }
        }
        for htlc in &commitment.htlcs {
            let log = if htlc.incoming {
                &mut self.remote_log
            } else {
                &mut self.local_log
            };
            if let Some(entry) = log.htlc_mut(htlc.htlc_index) {
                entry.set_output_index(side, htlc.output_index);
            }
        }
    }

    fn entry_mut(
        &mut self,
        log_ref: LogRef,
    ) -> Option<&mut PaymentDescriptor> {
        let log = if log_ref.in_local_log {
            &mut self.local_log
        } else {
            &mut self.remote_log
        };
        log.iter_mut().find(|entry| entry.log_index == log_ref.log_index)
    }

    fn sign_commitment(
        &self,
        commitment: &Commitment,
    ) -> Result<Signature, Error> {
        let descriptor = SignDescriptor {
            pubkey: self.local_config.keys.funding_pubkey,
            single_tweak: None,
            double_tweak: None,
            witness_script: self.funding_script(),
            value: self.capacity_sat,
            sighash_type: bitcoin::EcdsaSighashType::All,
            input_index: 0,
        };
        Ok(self.signer.sign_output_raw(&commitment.tx, &descriptor)?)
    }

    /// Reconstructs, for every non-dust HTLC of a commitment in output
    /// order, the second-level transaction together with the first-level
    /// witness script and value its signature commits to.
    pub(super) fn second_level_transactions(
        &self,
        side: ChainSide,
        commitment: &Commitment,
    ) -> Vec<(Transaction, WitnessScript, u64)> {
        let owner_config = self.owner_config(side);
        let (broadcaster, countersignatory) = match side {
            ChainSide::Local => {
                (&self.local_config.keys, &self.remote_config.keys)
            }
            ChainSide::Remote => {
                (&self.remote_config.keys, &self.local_config.keys)
            }
        };
        let commitment_keys = CommitmentKeys::derive(
            SECP256K1,
            broadcaster,
            countersignatory,
            commitment.per_commitment_point,
        );
        let commit_txid = commitment.tx.txid();

        commitment
            .htlcs
            .iter()
            .filter(|htlc| htlc.output_index >= 0)
            .map(|htlc| {
                let incoming_to_owner =
                    self.incoming_to_owner(side, htlc.incoming);
                let amount_sat = htlc.amount_msat / 1000;
                let outpoint =
                    OutPoint::new(commit_txid, htlc.output_index as u32);
                let (second_level, first_level_script) = if incoming_to_owner
                {
                    (
                        Transaction::ln_htlc_success(
                            amount_sat
                                - htlc_success_fee(commitment.fee_per_kw),
                            outpoint,
                            commitment_keys.revocation_pubkey,
                            commitment_keys.broadcaster_delayed_pubkey,
                            owner_config.to_self_delay,
                        ),
                        WitnessScript::ln_received_htlc(
                            commitment_keys.revocation_pubkey,
                            commitment_keys.broadcaster_htlc_pubkey,
                            commitment_keys.countersignatory_htlc_pubkey,
                            htlc.cltv_expiry,
                            htlc.payment_hash,
                        ),
                    )
                } else {
                    (
                        Transaction::ln_htlc_timeout(
                            amount_sat
                                - htlc_timeout_fee(commitment.fee_per_kw),
                            outpoint,
                            htlc.cltv_expiry,
                            commitment_keys.revocation_pubkey,
                            commitment_keys.broadcaster_delayed_pubkey,
                            owner_config.to_self_delay,
                        ),
                        WitnessScript::ln_offered_htlc(
                            commitment_keys.revocation_pubkey,
                            commitment_keys.broadcaster_htlc_pubkey,
                            commitment_keys.countersignatory_htlc_pubkey,
                            htlc.payment_hash,
                        ),
                    )
                };
                (second_level, first_level_script, amount_sat)
            })
            .collect()
    }

    fn sign_second_level_htlcs(
        &self,
        side: ChainSide,
        commitment: &Commitment,
    ) -> Result<Vec<Signature>, Error> {
        let jobs: Vec<SignJob> = self
            .second_level_transactions(side, commitment)
            .into_iter()
            .map(|(tx, first_level_script, amount_sat)| SignJob {
                tx,
                descriptor: SignDescriptor {
                    pubkey: keys::derive_pubkey(
                        SECP256K1,
                        self.local_config.keys.htlc_basepoint,
                        commitment.per_commitment_point,
                    ),
                    single_tweak: Some(
                        keys::single_tweak(
                            self.local_config.keys.htlc_basepoint,
                            commitment.per_commitment_point,
                        )
                        .to_vec(),
                    ),
                    double_tweak: None,
                    witness_script: first_level_script,
                    value: amount_sat,
                    sighash_type: bitcoin::EcdsaSighashType::All,
                    input_index: 0,
                },
            })
            .collect();
        Ok(self.sigpool.sign_batch(&self.signer, jobs)?)
    }

    /// Wire messages of the log updates first committed at the given height
    /// of the remote chain.
    fn log_updates_at(
        &self,
        side: ChainSide,
        height: u64,
    ) -> Vec<LogUpdate> {
        self.local_log
            .iter()
            .filter(|entry| {
                if entry.kind.is_add() {
                    entry.add_height(side) == height
                } else {
                    entry.remove_height(side) == height
                }
            })
            .map(|entry| LogUpdate {
                log_index: entry.log_index,
                message: self.entry_to_message(entry),
            })
            .collect()
    }

    fn entry_to_message(&self, entry: &PaymentDescriptor) -> ChannelMessage {
        match &entry.kind {
            UpdateKind::Add {
                payment_hash,
                cltv_expiry,
                onion_blob,
            } => ChannelMessage::UpdateAddHtlc(UpdateAddHtlc {
                channel_id: self.channel_id,
                htlc_id: entry.htlc_index,
                amount_msat: entry.amount_msat,
                payment_hash: *payment_hash,
                cltv_expiry: *cltv_expiry,
                onion_blob: onion_blob.clone(),
            }),
            UpdateKind::Settle { preimage } => {
                ChannelMessage::UpdateFulfillHtlc(UpdateFulfillHtlc {
                    channel_id: self.channel_id,
                    htlc_id: entry.parent_index,
                    payment_preimage: *preimage,
                })
            }
            UpdateKind::Fail { reason } => {
                ChannelMessage::UpdateFailHtlc(UpdateFailHtlc {
                    channel_id: self.channel_id,
                    htlc_id: entry.parent_index,
                    reason: reason.clone(),
                })
            }
            UpdateKind::MalformedFail {
                failure_code,
                sha_onion_blob,
            } => ChannelMessage::UpdateFailMalformedHtlc(
                UpdateFailMalformedHtlc {
                    channel_id: self.channel_id,
                    htlc_id: entry.parent_index,
                    sha256_of_onion: *sha_onion_blob,
                    failure_code: *failure_code,
                },
            ),
        }
    }

    /// Remote Adds which became fully locked in on both chains with this
    /// revocation and were not surfaced before. Marks them forwarded.
    fn collect_forwardable(&mut self) -> Vec<PaymentDescriptor> {
        let local_tail = self.local_chain.tail_height();
        let remote_tail = self.remote_chain.tail_height();
        let mut forwardable = vec![];
        for entry in self.remote_log.iter_mut() {
            if !entry.kind.is_add() || entry.is_forwarded {
                continue;
            }
            let locked_local = entry.add_commit_height_local != 0
                && entry.add_commit_height_local <= local_tail;
            let locked_remote = entry.add_commit_height_remote != 0
                && entry.add_commit_height_remote <= remote_tail;
            if locked_local && locked_remote {
                entry.is_forwarded = true;
                forwardable.push(entry.clone());
            }
        }
        forwardable
    }

    /// Removes every fully settled or failed HTLC pair from both logs once
    /// both chain tails advanced past the removal.
    fn compact_logs(&mut self) {
        let local_tail = self.local_chain.tail_height();
        let remote_tail = self.remote_chain.tail_height();

        let compactable = |entry: &PaymentDescriptor| {
            entry.is_removal()
                && entry.remove_commit_height_local != 0
                && entry.remove_commit_height_remote != 0
                && entry.remove_commit_height_local <= local_tail
                && entry.remove_commit_height_remote <= remote_tail
        };

        let ours: Vec<(u64, u64, u64, bool)> = self
            .local_log
            .iter()
            .filter(|entry| compactable(entry))
            .map(|entry| {
                (
                    entry.log_index,
                    entry.parent_index,
                    entry.amount_msat,
                    matches!(entry.kind, UpdateKind::Settle { .. }),
                )
            })
            .collect();
        for (log_index, parent, amount_msat, is_settle) in ours {
            // We removed an incoming HTLC; on settle it was received value
            if is_settle {
                self.total_msat_received += amount_msat;
            }
            self.local_log.remove_entry(log_index);
            self.remote_log.remove_htlc(parent);
        }

        let theirs: Vec<(u64, u64, u64, bool)> = self
            .remote_log
            .iter()
            .filter(|entry| compactable(entry))
            .map(|entry| {
                (
                    entry.log_index,
                    entry.parent_index,
                    entry.amount_msat,
                    matches!(entry.kind, UpdateKind::Settle { .. }),
                )
            })
            .collect();
        for (log_index, parent, amount_msat, is_settle) in theirs {
            if is_settle {
                self.total_msat_sent += amount_msat;
            }
            self.remote_log.remove_entry(log_index);
            self.local_log.remove_htlc(parent);
        }
    }
}

// A removal may only reference an Add committed on both chains; resolving
// an uncommitted Add would credit value its addition never debited.
fn ensure_locked_in(entry: &PaymentDescriptor) -> Result<(), Error> {
    if entry.add_commit_height_local == 0
        || entry.add_commit_height_remote == 0
    {
        return Err(Error::UnknownHtlcIndex(entry.htlc_index));
    }
    Ok(())
}

/// Thread-safe wrapper gating the state machine with the reader/writer
/// discipline of the concurrency model: state-advancing and log-mutating
/// operations take the exclusive lock, pure observers the shared one.
pub struct Channel {
    machine: RwLock<ChannelMachine>,
}

impl Channel {
    pub fn new(machine: ChannelMachine) -> Arc<Channel> {
        Arc::new(Channel {
            machine: RwLock::new(machine),
        })
    }

    /// Runs a pure observer under the shared lock.
    pub fn observe<R>(&self, f: impl FnOnce(&ChannelMachine) -> R) -> R {
        f(&self.machine.read().expect("channel lock poisoned"))
    }

    /// Runs a mutating operation under the exclusive lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut ChannelMachine) -> R) -> R {
        f(&mut self.machine.write().expect("channel lock poisoned"))
    }

    #[inline]
    pub fn available_balance(&self) -> u64 {
        self.observe(ChannelMachine::available_balance)
    }

    #[inline]
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.observe(ChannelMachine::snapshot)
    }

    #[inline]
    pub fn channel_point(&self) -> OutPoint {
        self.observe(ChannelMachine::channel_point)
    }

    #[inline]
    pub fn short_chan_id(&self) -> Option<ShortChannelId> {
        self.observe(ChannelMachine::short_chan_id)
    }
}

#[cfg(test)]
pub(super) mod harness {
    use std::str::FromStr;

    use bitcoin::hashes::{sha256, Hash};

    use super::super::Keyset;
    use super::*;
    use crate::signer::MemorySigner;

    pub const CAPACITY_SAT: u64 = 10_000_000;
    pub const ALICE_MSAT: u64 = 6_000_000_000;
    pub const BOB_MSAT: u64 = 4_000_000_000;
    pub const FEE_PER_KW: u32 = 6_000;

    pub fn secret(tag: u8) -> SecretKey {
        SecretKey::from_slice(&[tag; 32]).expect("non-zero test scalar")
    }

    pub fn pubkey(tag: u8) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &secret(tag))
    }

    fn keyset(base: u8) -> Keyset {
        Keyset {
            funding_pubkey: pubkey(base),
            revocation_basepoint: pubkey(base + 1),
            payment_basepoint: pubkey(base + 2),
            delayed_payment_basepoint: pubkey(base + 3),
            htlc_basepoint: pubkey(base + 4),
        }
    }

    fn config(base: u8) -> ChannelConfig {
        ChannelConfig {
            dust_limit_sat: 546,
            max_htlc_value_in_flight_msat: CAPACITY_SAT * 1000,
            channel_reserve_sat: 10_000,
            htlc_minimum_msat: 0,
            to_self_delay: 144,
            max_accepted_htlcs: 483,
            keys: keyset(base),
        }
    }

    pub fn funding_txid() -> Txid {
        Txid::from_str(
            "fd2105607605d2302994ffea703b09f66b6351816ee737a93e42a841ea20bbad",
        )
        .unwrap()
    }

    pub fn preimage(tag: u8) -> HashPreimage {
        HashPreimage::from_inner(Slice32::from_inner([tag; 32]))
    }

    pub fn hash_of(preimage: HashPreimage) -> HashLock {
        HashLock::from_inner(Slice32::from_inner(
            sha256::Hash::hash(preimage.as_ref()).into_inner(),
        ))
    }

    fn machine(
        is_initiator: bool,
        local_base: u8,
        remote_base: u8,
        seed: u8,
        remote_seed: u8,
        fee_per_kw: u32,
    ) -> ChannelMachine {
        let remote_producer =
            RevocationProducer::new(Slice32::from_inner([remote_seed; 32]));
        let (local_msat, remote_msat) = if is_initiator {
            (ALICE_MSAT, BOB_MSAT)
        } else {
            (BOB_MSAT, ALICE_MSAT)
        };
        let local_config = config(local_base);
        let signer = MemorySigner::new([
            secret(local_base),
            secret(local_base + 2),
            secret(local_base + 3),
            secret(local_base + 4),
        ]);
        let params = ChannelParams {
            chain_hash: Slice32::from_inner([7u8; 32]),
            funding_txid: funding_txid(),
            funding_output_index: 0,
            capacity_sat: CAPACITY_SAT,
            is_initiator,
            local_balance_msat: local_msat,
            remote_balance_msat: remote_msat,
            fee_per_kw,
            local_config,
            remote_config: config(remote_base),
            remote_node: pubkey(remote_base + 5),
            revocation_seed: Slice32::from_inner([seed; 32]),
            remote_first_point: keys::commitment_point(
                SECP256K1,
                remote_producer.at_height(0),
            ),
            remote_next_point: Some(keys::commitment_point(
                SECP256K1,
                remote_producer.at_height(1),
            )),
        };
        ChannelMachine::new(
            params,
            &Policy::default(),
            Arc::new(ChannelStore::open_temporary().unwrap()),
            Arc::new(signer),
            SigPool::with(2),
        )
        .unwrap()
    }

    /// Alice (the initiator) and Bob, sharing a consistent channel setup.
    pub fn channel_pair() -> (ChannelMachine, ChannelMachine) {
        channel_pair_with_fee(FEE_PER_KW)
    }

    pub fn channel_pair_with_fee(
        fee_per_kw: u32,
    ) -> (ChannelMachine, ChannelMachine) {
        let alice = machine(true, 0x10, 0x40, 0xAA, 0xBB, fee_per_kw);
        let bob = machine(false, 0x40, 0x10, 0xBB, 0xAA, fee_per_kw);
        (alice, bob)
    }

    /// Queues an outgoing HTLC on the sender and delivers the resulting
    /// wire message to the receiver.
    pub fn send_add(
        sender: &mut ChannelMachine,
        receiver: &mut ChannelMachine,
        amount_msat: u64,
        payment_hash: HashLock,
        cltv_expiry: u32,
    ) -> u64 {
        let htlc_index = sender
            .add_htlc(
                amount_msat,
                payment_hash,
                cltv_expiry,
                OnionBlob::default(),
            )
            .unwrap();
        receiver
            .receive_htlc(&UpdateAddHtlc {
                channel_id: sender.channel_id(),
                htlc_id: htlc_index,
                amount_msat,
                payment_hash,
                cltv_expiry,
                onion_blob: OnionBlob::default(),
            })
            .unwrap();
        htlc_index
    }

    /// Settles an incoming HTLC on one side and delivers the settlement to
    /// the peer.
    pub fn send_settle(
        settler: &mut ChannelMachine,
        peer: &mut ChannelMachine,
        payment_preimage: HashPreimage,
        htlc_index: u64,
    ) {
        settler.settle_htlc(payment_preimage, htlc_index).unwrap();
        peer.receive_htlc_settle(payment_preimage, htlc_index)
            .unwrap();
    }

    /// One commitment round in one direction: sender signs, receiver
    /// accepts and revokes, sender processes the revocation. Returns the
    /// Adds the receiver may now forward.
    pub fn round(
        sender: &mut ChannelMachine,
        receiver: &mut ChannelMachine,
    ) -> Vec<PaymentDescriptor> {
        let (sig, htlc_sigs) = sender.sign_next_commitment().unwrap();
        receiver.receive_new_commitment(sig, htlc_sigs).unwrap();
        let revocation = receiver.revoke_current_commitment().unwrap();
        sender.receive_revocation(&revocation).unwrap()
    }

    /// A full round trip in both directions.
    pub fn full_round(
        alice: &mut ChannelMachine,
        bob: &mut ChannelMachine,
    ) {
        round(alice, bob);
        round(bob, alice);
    }

    /// Sum of both balances plus the commitment fee must always equal the
    /// channel capacity.
    pub fn assert_capacity_invariant(machine: &ChannelMachine) {
        for chain in [&machine.local_chain, &machine.remote_chain] {
            let tail = chain.tail().unwrap();
            assert_eq!(
                tail.our_balance_msat
                    + tail.their_balance_msat
                    + tail.fee_sat * 1000
                    + tail
                        .htlcs
                        .iter()
                        .map(|htlc| htlc.amount_msat)
                        .sum::<u64>(),
                machine.capacity_sat * 1000,
                "capacity invariant violated at height {}",
                tail.height
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::harness::*;
    use super::*;
    use crate::channel::ChannelStatus;

    #[test]
    fn initial_commitments_are_consistent() {
        let (alice, bob) = channel_pair();
        assert_capacity_invariant(&alice);
        assert_capacity_invariant(&bob);

        // Both parties construct bitwise identical initial commitments
        let alice_remote = alice.remote_chain.tail().unwrap();
        let bob_local = bob.local_chain.tail().unwrap();
        assert_eq!(
            bitcoin::consensus::serialize(&alice_remote.tx),
            bitcoin::consensus::serialize(&bob_local.tx)
        );
        assert_eq!(alice.channel_id, bob.channel_id);
        assert_eq!(
            alice.available_balance(),
            ALICE_MSAT
                - commit_tx_fee(FEE_PER_KW, 0) * 1000
                - 10_000 * 1000
        );
    }

    #[test]
    fn happy_add_settle_flow() {
        let (mut alice, mut bob) = channel_pair();
        let payment_preimage = preimage(0x01);
        let payment_hash = hash_of(payment_preimage);

        let htlc_index =
            send_add(&mut alice, &mut bob, 10_000_000, payment_hash, 500);
        assert_eq!(htlc_index, 0);

        // First half: Alice commits the Add towards Bob
        let forwarded = round(&mut alice, &mut bob);
        assert!(forwarded.is_empty());
        assert_capacity_invariant(&alice);
        assert_capacity_invariant(&bob);

        // Second half: Bob commits back; the Add is now locked in on both
        // chains and surfaces for forwarding exactly once
        let (sig, htlc_sigs) = bob.sign_next_commitment().unwrap();
        assert_eq!(htlc_sigs.len(), 1);
        alice.receive_new_commitment(sig, htlc_sigs).unwrap();
        let revocation = alice.revoke_current_commitment().unwrap();
        let forwarded = bob.receive_revocation(&revocation).unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].htlc_index, 0);
        assert_eq!(forwarded[0].amount_msat, 10_000_000);

        // The HTLC output is present on both commitment transactions and
        // the signature order matches the BIP-69 output order
        let bob_tail = bob.local_chain.tail().unwrap();
        assert_eq!(
            bob_tail.htlcs.iter().filter(|h| h.output_index >= 0).count(),
            1
        );
        assert_eq!(bob_tail.htlc_signatures.len(), 1);

        // Settlement flows back
        send_settle(&mut bob, &mut alice, payment_preimage, htlc_index);
        round(&mut bob, &mut alice);
        round(&mut alice, &mut bob);

        let alice_tail = alice.local_chain.tail().unwrap();
        assert_eq!(
            alice_tail.our_balance_msat,
            ALICE_MSAT - 10_000_000 - commit_tx_fee(FEE_PER_KW, 0) * 1000
        );
        assert_eq!(alice_tail.their_balance_msat, BOB_MSAT + 10_000_000);
        assert_capacity_invariant(&alice);
        assert_capacity_invariant(&bob);

        // Alice compacted her logs with the final revocation
        assert!(alice.local_log.is_empty());
        assert!(alice.remote_log.is_empty());
        assert_eq!(alice.total_msat_sent, 10_000_000);

        // Bob compacts with the next revocation he processes
        round(&mut bob, &mut alice);
        round(&mut alice, &mut bob);
        assert!(bob.local_log.is_empty());
        assert!(bob.remote_log.is_empty());
        assert_eq!(bob.total_msat_received, 10_000_000);

        // No Add is ever surfaced twice
        bob.settle_htlc(payment_preimage, htlc_index).unwrap_err();
    }

    #[test]
    fn dust_htlc_stays_off_chain() {
        let (mut alice, mut bob) = channel_pair_with_fee(20_000);
        let payment_preimage = preimage(0x02);
        let payment_hash = hash_of(payment_preimage);

        let htlc_index =
            send_add(&mut alice, &mut bob, 1_000, payment_hash, 500);
        let (sig, htlc_sigs) = alice.sign_next_commitment().unwrap();
        // Dust on both chains: no second-level signature is produced
        assert!(htlc_sigs.is_empty());
        bob.receive_new_commitment(sig, htlc_sigs).unwrap();
        let revocation = bob.revoke_current_commitment().unwrap();
        alice.receive_revocation(&revocation).unwrap();
        round(&mut bob, &mut alice);

        let bob_tail = bob.local_chain.tail().unwrap();
        // The commitment transaction carries no HTLC output
        assert_eq!(bob_tail.tx.output.len(), 2);
        assert_eq!(
            bob_tail.htlcs.iter().filter(|h| h.output_index >= 0).count(),
            0
        );
        assert_eq!(bob_tail.htlcs[0].output_index, DUST_OUTPUT_INDEX);
        assert_capacity_invariant(&bob);

        // Balances still update on settlement
        send_settle(&mut bob, &mut alice, payment_preimage, htlc_index);
        round(&mut bob, &mut alice);
        round(&mut alice, &mut bob);
        let alice_tail = alice.local_chain.tail().unwrap();
        assert_eq!(
            alice_tail.their_balance_msat,
            harness::BOB_MSAT + 1_000
        );
    }

    #[test]
    fn no_window_without_revocation() {
        let (mut alice, mut bob) = channel_pair();
        let (sig, htlc_sigs) = alice.sign_next_commitment().unwrap();
        // The remote chain already carries an unacknowledged tip
        assert_eq!(alice.sign_next_commitment(), Err(Error::NoWindow));

        bob.receive_new_commitment(sig, htlc_sigs).unwrap();
        let revocation = bob.revoke_current_commitment().unwrap();
        alice.receive_revocation(&revocation).unwrap();
        // The window is open again
        alice.sign_next_commitment().unwrap();
    }

    #[test]
    fn invalid_commit_sig_leaves_state_untouched() {
        let (mut alice, mut bob) = channel_pair();
        let (_, htlc_sigs) = alice.sign_next_commitment().unwrap();
        // A signature over garbage must be rejected
        let garbage = secp256k1::Message::from_slice(&[0x55; 32]).unwrap();
        let wrong_sig = SECP256K1.sign_ecdsa(&garbage, &secret(0x10));

        match bob.receive_new_commitment(wrong_sig, htlc_sigs.clone()) {
            Err(Error::InvalidCommitSig {
                height,
                commit_tx,
                ..
            }) => {
                assert_eq!(height, 1);
                assert!(!commit_tx.is_empty());
            }
            other => panic!("expected InvalidCommitSig, got {:?}", other),
        }
        // Nothing was mutated: the chain still awaits the valid commitment
        assert_eq!(bob.local_chain.tip_height(), 0);
        assert_eq!(bob.revoke_current_commitment(), Err(Error::NoPendingCommitment));
    }

    #[test]
    fn preimage_and_htlc_index_are_validated() {
        let (mut alice, mut bob) = channel_pair();
        let payment_hash = hash_of(preimage(0x03));
        let htlc_index =
            send_add(&mut alice, &mut bob, 5_000_000, payment_hash, 500);
        full_round(&mut alice, &mut bob);

        assert_eq!(
            bob.settle_htlc(preimage(0x04), htlc_index),
            Err(Error::InvalidPreimage { htlc_index })
        );
        assert_eq!(
            bob.settle_htlc(preimage(0x03), 17),
            Err(Error::UnknownHtlcIndex(17))
        );
        bob.settle_htlc(preimage(0x03), htlc_index).unwrap();
    }

    #[test]
    fn balance_and_reserve_are_enforced() {
        let (mut alice, _) = channel_pair();
        let payment_hash = hash_of(preimage(0x05));
        // More than the whole channel
        match alice.add_htlc(
            CAPACITY_SAT * 1000,
            payment_hash,
            500,
            OnionBlob::default(),
        ) {
            Err(Error::InsufficientBalance { .. }) => {}
            other => panic!("expected InsufficientBalance, got {:?}", other),
        }
        // Exactly the available balance passes
        let available = alice.available_balance();
        alice
            .add_htlc(
                available
                    - (commit_tx_fee(FEE_PER_KW, 1)
                        - commit_tx_fee(FEE_PER_KW, 0))
                        * 1000,
                payment_hash,
                500,
                OnionBlob::default(),
            )
            .unwrap();
    }

    #[test]
    fn fee_update_flow() {
        let (mut alice, mut bob) = channel_pair();
        assert_eq!(bob.update_fee(9_000), Err(Error::FeeUpdateMismatch));
        assert_eq!(
            alice.receive_update_fee(9_000),
            Err(Error::FeeUpdateMismatch)
        );

        alice.update_fee(9_000).unwrap();
        bob.receive_update_fee(9_000).unwrap();
        full_round(&mut alice, &mut bob);

        assert_eq!(alice.local_chain.tail().unwrap().fee_per_kw, 9_000);
        assert_eq!(alice.remote_chain.tail().unwrap().fee_per_kw, 9_000);
        assert_eq!(bob.local_chain.tail().unwrap().fee_per_kw, 9_000);
        assert_eq!(
            alice.local_chain.tail().unwrap().fee_sat,
            commit_tx_fee(9_000, 0)
        );
        assert_capacity_invariant(&alice);
        assert_capacity_invariant(&bob);
        assert!(alice.pending_fee_update.is_none());
        assert!(alice.pending_ack_fee_update.is_none());
        assert!(bob.pending_ack_fee_update.is_none());
    }

    #[test]
    fn add_heights_are_write_once_and_monotone() {
        let (mut alice, mut bob) = channel_pair();
        let payment_hash = hash_of(preimage(0x06));
        send_add(&mut alice, &mut bob, 5_000_000, payment_hash, 500);
        full_round(&mut alice, &mut bob);
        let heights = |machine: &ChannelMachine| {
            let entry = machine.local_log.htlc(0).unwrap();
            (
                entry.add_commit_height_local,
                entry.add_commit_height_remote,
            )
        };
        let first = heights(&alice);
        assert!(first.0 > 0 && first.1 > 0);

        // Further rounds never rewrite the recorded heights
        full_round(&mut alice, &mut bob);
        assert_eq!(heights(&alice), first);
    }

    #[test]
    fn reconnect_with_owed_revocation() {
        let (mut alice, mut bob) = channel_pair();
        full_round(&mut alice, &mut bob);
        // Alice has already extended Bob's chain for this round
        round(&mut alice, &mut bob);

        // Bob extends Alice's chain; Alice revokes but the message is lost
        let (sig, htlc_sigs) = bob.sign_next_commitment().unwrap();
        alice.receive_new_commitment(sig, htlc_sigs).unwrap();
        let lost_revocation = alice.revoke_current_commitment().unwrap();

        let bob_view = bob.compose_chan_sync();
        assert_eq!(bob_view.next_revocation_number + 1, alice.local_chain.tail_height());

        let replay = alice.process_chan_sync(&bob_view).unwrap();
        assert_eq!(replay.len(), 1);
        match &replay[0] {
            ChannelMessage::RevokeAndAck(msg) => {
                assert_eq!(*msg, lost_revocation);
            }
            other => panic!("expected revoke_and_ack, got {}", other),
        }

        // Bob can process the replayed revocation as if never lost
        bob.receive_revocation(&lost_revocation).unwrap();
    }

    #[test]
    fn reconnect_detects_data_loss_and_stale_peers() {
        let (mut alice, mut bob) = channel_pair();
        full_round(&mut alice, &mut bob);
        full_round(&mut alice, &mut bob);

        // A peer claiming more revocations than happened, with a valid
        // secret for the claimed height, proves our data loss
        let mut msg = bob.compose_chan_sync();
        msg.next_revocation_number = 7;
        msg.your_last_per_commitment_secret =
            alice.revocation_producer.at_height(6);
        assert_eq!(
            alice.process_chan_sync(&msg),
            Err(Error::CommitSyncDataLoss)
        );
        assert!(alice.is_borked());

        // A wrong secret is remote misbehaviour
        let (mut alice, bob) = channel_pair();
        let mut msg = bob.compose_chan_sync();
        msg.next_revocation_number = 1;
        msg.your_last_per_commitment_secret = Slice32::from_inner([9; 32]);
        assert_eq!(
            alice.process_chan_sync(&msg),
            Err(Error::InvalidLastCommitSecret)
        );
        assert!(alice.is_borked());

        // Consistent heights with no pending retransmissions replay nothing
        let (mut alice, bob) = channel_pair();
        let msg = bob.compose_chan_sync();
        assert_eq!(alice.process_chan_sync(&msg).unwrap(), vec![]);
        assert_eq!(alice.status(), ChannelStatus::Active);
    }

    #[test]
    fn reconnect_replays_lost_commitment() {
        let (mut alice, mut bob) = channel_pair();
        let payment_hash = hash_of(preimage(0x07));
        alice
            .add_htlc(5_000_000, payment_hash, 500, OnionBlob::default())
            .unwrap();
        // Alice signs but the commitment never reaches Bob
        let _ = alice.sign_next_commitment().unwrap();

        let bob_view = bob.compose_chan_sync();
        let replay = alice.process_chan_sync(&bob_view).unwrap();
        // The Add and the commitment signature are replayed verbatim
        assert_eq!(replay.len(), 2);
        match (&replay[0], &replay[1]) {
            (
                ChannelMessage::UpdateAddHtlc(add),
                ChannelMessage::CommitSig(commit_sig),
            ) => {
                assert_eq!(add.amount_msat, 5_000_000);
                assert_eq!(add.payment_hash, payment_hash);
                assert_eq!(commit_sig.htlc_signatures.len(), 1);

                bob.receive_htlc(add).unwrap();
                bob.receive_new_commitment(
                    commit_sig.signature,
                    commit_sig.htlc_signatures.clone(),
                )
                .unwrap();
            }
            other => panic!("unexpected replay sequence: {:?}", other),
        }
    }

    #[test]
    fn restore_from_record_preserves_state() {
        let (mut alice, mut bob) = channel_pair();
        let payment_hash = hash_of(preimage(0x08));
        send_add(&mut alice, &mut bob, 5_000_000, payment_hash, 500);
        full_round(&mut alice, &mut bob);

        let record = alice.record();
        let restored = ChannelMachine::restore(
            record,
            Arc::clone(&alice.store),
            Arc::clone(&alice.signer),
            Arc::clone(&alice.sigpool),
        );
        assert_eq!(restored.snapshot(), alice.snapshot());
        assert_eq!(
            restored.local_chain.tail_height(),
            alice.local_chain.tail_height()
        );
        assert_eq!(restored.local_log.len(), alice.local_log.len());
        assert_eq!(
            restored.available_balance(),
            alice.available_balance()
        );
    }

    #[test]
    fn serialized_channel_record_roundtrips() {
        let (mut alice, mut bob) = channel_pair();
        send_add(
            &mut alice,
            &mut bob,
            5_000_000,
            hash_of(preimage(0x09)),
            500,
        );
        full_round(&mut alice, &mut bob);

        let record = alice.record();
        let serialized = strict_encoding::strict_serialize(&record).unwrap();
        let restored: ChannelRecord =
            strict_encoding::strict_deserialize(&serialized).unwrap();
        assert_eq!(restored, record);
        assert_eq!(
            bitcoin::consensus::serialize(&restored.local_commitment.tx),
            bitcoin::consensus::serialize(&record.local_commitment.tx)
        );
    }
}
