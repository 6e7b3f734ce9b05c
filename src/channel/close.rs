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

//! Channel closing: the cooperative close dance, unilateral force close
//! with pre-signed HTLC resolutions, and breach detection with penalty
//! descriptors for revoked commitments.

use std::sync::Arc;

use amplify::Wrapper;
use bitcoin::{EcdsaSighashType, OutPoint, Transaction, TxOut, Txid};
use bitcoin_scripts::{PubkeyScript, WitnessScript};
use crossbeam_channel::{bounded, Receiver, Sender};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use super::keyset::CommitmentKeys;
use super::machine::{Channel, ChannelMachine};
use super::{ChainSide, ChannelStatus, Error};
use crate::scripts::{
    self, bip69_sort, keys, witness, ScriptGenerators, TxGenerators,
};
use crate::signer::{ChainNotifier, SignDescriptor, SpendDetail};
use crate::store::{ClosedChannelSummary, ClosureKind};
use crate::wire::ChannelId;

/// Everything needed to eventually claim one outgoing HTLC after a force
/// close: the pre-signed second-level timeout transaction and the
/// descriptor for sweeping its CSV-encumbered output.
#[derive(Clone, Debug)]
pub struct HtlcResolution {
    /// HTLC index within the sender's update log
    pub htlc_index: u64,

    /// Output index on the broadcast commitment transaction
    pub output_index: u32,

    /// Absolute timeout of the HTLC; equals the `lock_time` of the signed
    /// timeout transaction
    pub cltv_expiry: u32,

    /// Fully signed second-level timeout transaction, broadcastable once
    /// the CLTV expires
    pub signed_timeout_tx: Transaction,

    /// Descriptor for sweeping the second-level output once its CSV delay
    /// matures; keyed by the delay basepoint
    pub claim_descriptor: SignDescriptor,

    /// CSV delay of the second-level output
    pub maturity_delay: u16,
}

/// Result of force-closing the channel with the latest signed local
/// commitment.
#[derive(Clone, Debug)]
pub struct ForceCloseSummary {
    pub channel_id: ChannelId,

    /// The fully signed local commitment transaction
    pub close_tx: Transaction,

    /// Descriptor for sweeping the delayed self-output after the CSV delay;
    /// absent when the output is trimmed
    pub self_output: Option<(OutPoint, SignDescriptor)>,

    /// CSV delay of the self output
    pub self_output_maturity: u16,

    /// Resolutions for every outgoing non-dust HTLC
    pub htlc_resolutions: Vec<HtlcResolution>,
}

/// Result of the remote party broadcasting its current (or just-signed)
/// commitment.
#[derive(Clone, Debug)]
pub struct UnilateralCloseSummary {
    pub channel_id: ChannelId,

    /// Height of the broadcast remote state
    pub state_number: u64,

    pub spending_txid: Txid,

    /// Descriptor for sweeping our non-delayed output, if not trimmed
    pub settled_output: Option<(OutPoint, SignDescriptor)>,

    /// Amount settled to us directly
    pub settled_balance_sat: u64,

    /// Claim descriptors for the HTLC outputs we can eventually resolve
    pub htlc_claims: Vec<(OutPoint, SignDescriptor)>,
}

/// One output of a revoked commitment transaction, claimable with the
/// revocation key reconstructed from the revealed per-commitment secret.
#[derive(Clone, Debug)]
pub struct BreachedOutput {
    pub outpoint: OutPoint,
    pub amount_sat: u64,
    /// Descriptor carrying the double-tweak of the revocation basepoint by
    /// the revealed secret
    pub sign_descriptor: SignDescriptor,
}

/// Everything needed to punish the remote party for broadcasting a revoked
/// commitment.
#[derive(Clone, Debug)]
pub struct BreachRetribution {
    pub channel_id: ChannelId,

    /// Height of the revoked state the remote party broadcast
    pub breach_height: u64,

    pub breach_txid: Txid,

    /// The penalty-claimable outputs: the remote delayed output and every
    /// HTLC output of the revoked commitment
    pub breached_outputs: Vec<BreachedOutput>,

    /// Descriptor for our own non-delayed output on the breach transaction
    pub settled_output: Option<(OutPoint, SignDescriptor)>,
}

/// Verdict of the close observer about a funding-output spend.
#[derive(Clone, Debug)]
pub enum CloseOutcome {
    /// The spend carries no commitment state hint: a close transaction we
    /// negotiated cooperatively
    Cooperative,

    /// The remote party broadcast its latest state
    Unilateral(UnilateralCloseSummary),

    /// The remote party broadcast a revoked state
    Breach(BreachRetribution),
}

impl ChannelMachine {
    /// First step of the cooperative close dance: constructs the close
    /// transaction and produces our signature over it. The initiator bears
    /// the close fee.
    pub fn create_close_proposal(
        &mut self,
        proposed_fee_sat: u64,
        local_script: PubkeyScript,
        remote_script: PubkeyScript,
    ) -> Result<Signature, Error> {
        if self.status == ChannelStatus::Closed {
            return Err(Error::ChannelClosing);
        }
        if self.status == ChannelStatus::Borked {
            return Err(Error::ChannelBorked);
        }
        if !self.local_log.is_empty() || !self.remote_log.is_empty() {
            return Err(Error::HtlcsPending);
        }

        let close_tx = self.close_tx(
            proposed_fee_sat,
            local_script,
            remote_script,
        );
        let descriptor = SignDescriptor {
            pubkey: self.local_config.keys.funding_pubkey,
            single_tweak: None,
            double_tweak: None,
            witness_script: self.funding_script(),
            value: self.capacity_sat,
            sighash_type: EcdsaSighashType::All,
            input_index: 0,
        };
        let sig = self.signer.sign_output_raw(&close_tx, &descriptor)?;
        self.status = ChannelStatus::Shutdown;
        self.store.update_channel(&self.record())?;
        Ok(sig)
    }

    /// Final step of the cooperative close dance: assembles and returns the
    /// fully signed close transaction and the balance settled to us.
    pub fn complete_cooperative_close(
        &mut self,
        local_sig: Signature,
        remote_sig: Signature,
        proposed_fee_sat: u64,
        local_script: PubkeyScript,
        remote_script: PubkeyScript,
    ) -> Result<(Transaction, u64), Error> {
        if self.status == ChannelStatus::Closed {
            return Err(Error::ChannelClosing);
        }
        if !self.local_log.is_empty() || !self.remote_log.is_empty() {
            return Err(Error::HtlcsPending);
        }

        let mut close_tx = self.close_tx(
            proposed_fee_sat,
            local_script.clone(),
            remote_script,
        );
        let funding_script = self.funding_script();
        let sighash = scripts::segwit_sighash(
            &close_tx,
            0,
            funding_script.as_inner(),
            self.capacity_sat,
        );
        if SECP256K1
            .verify_ecdsa(
                &sighash,
                &remote_sig,
                &self.remote_config.keys.funding_pubkey,
            )
            .is_err()
        {
            return Err(Error::InvalidCommitSig {
                height: self.local_chain.tail_height(),
                commit_sig: Box::new(remote_sig),
                sig_hash: sighash.as_ref().to_vec(),
                commit_tx: bitcoin::consensus::serialize(&close_tx),
            });
        }

        close_tx.input[0].witness = witness::funding_spend(
            self.local_config.keys.funding_pubkey,
            self.remote_config.keys.funding_pubkey,
            &local_sig,
            &remote_sig,
            &funding_script,
        );

        let settled_balance_sat = close_tx
            .output
            .iter()
            .find(|txout| txout.script_pubkey == *local_script.as_inner())
            .map(|txout| txout.value)
            .unwrap_or(0);

        self.status = ChannelStatus::Closed;
        self.store.update_channel(&self.record())?;
        self.store.mark_channel_closed(&ClosedChannelSummary {
            channel_id: self.channel_id,
            remote_node: self.remote_node,
            close_txid: close_tx.txid(),
            close_height: 0,
            settled_balance_sat,
            closure_kind: ClosureKind::Cooperative,
            is_fully_closed: true,
        })?;
        info!(
            "channel {}: cooperative close completed, {} sat settled",
            self.channel_id, settled_balance_sat
        );
        Ok((close_tx, settled_balance_sat))
    }

    fn close_tx(
        &self,
        close_fee_sat: u64,
        local_script: PubkeyScript,
        remote_script: PubkeyScript,
    ) -> Transaction {
        let tail = self.local_chain.tail().expect("chain always has a tail");
        // The commitment fee is reclaimed before the close fee is applied
        let mut our_balance = tail.our_balance_msat / 1000;
        let mut their_balance = tail.their_balance_msat / 1000;
        if self.is_initiator {
            our_balance += tail.fee_sat;
            our_balance = our_balance.saturating_sub(close_fee_sat);
        } else {
            their_balance += tail.fee_sat;
            their_balance = their_balance.saturating_sub(close_fee_sat);
        }

        let mut outputs: Vec<(TxOut, ())> = vec![];
        if our_balance >= self.local_config.dust_limit_sat {
            outputs.push((
                TxOut {
                    value: our_balance,
                    script_pubkey: local_script.into_inner(),
                },
                (),
            ));
        }
        if their_balance >= self.local_config.dust_limit_sat {
            outputs.push((
                TxOut {
                    value: their_balance,
                    script_pubkey: remote_script.into_inner(),
                },
                (),
            ));
        }
        bip69_sort(&mut outputs);
        Transaction::ln_closing(
            self.channel_point(),
            outputs.into_iter().map(|(txout, _)| txout).collect(),
        )
    }

    /// Force-closes the channel by finalizing the latest signed local
    /// commitment. Produces the signed commitment transaction, a sweep
    /// descriptor for the delayed self output, and a resolution for every
    /// outgoing non-dust HTLC.
    pub fn force_close(&mut self) -> Result<ForceCloseSummary, Error> {
        if self.status == ChannelStatus::Closed {
            return Err(Error::ChannelClosing);
        }
        let commitment =
            self.local_chain.tail().expect("chain always has a tail").clone();
        let remote_sig =
            commitment.their_signature.ok_or(Error::MissingCommitSig)?;

        let funding_script = self.funding_script();
        let local_sig = {
            let descriptor = SignDescriptor {
                pubkey: self.local_config.keys.funding_pubkey,
                single_tweak: None,
                double_tweak: None,
                witness_script: funding_script.clone(),
                value: self.capacity_sat,
                sighash_type: EcdsaSighashType::All,
                input_index: 0,
            };
            self.signer.sign_output_raw(&commitment.tx, &descriptor)?
        };
        let mut close_tx = commitment.tx.clone();
        close_tx.input[0].witness = witness::funding_spend(
            self.local_config.keys.funding_pubkey,
            self.remote_config.keys.funding_pubkey,
            &local_sig,
            &remote_sig,
            &funding_script,
        );
        let close_txid = close_tx.txid();

        let commitment_keys = CommitmentKeys::derive(
            SECP256K1,
            &self.local_config.keys,
            &self.remote_config.keys,
            commitment.per_commitment_point,
        );
        let to_self_delay = self.local_config.to_self_delay;

        // The delayed self output, when not trimmed
        let to_local_script = WitnessScript::ln_to_local(
            commitment_keys.revocation_pubkey,
            commitment_keys.broadcaster_delayed_pubkey,
            to_self_delay,
        );
        let self_output = locate_output(
            &close_tx,
            &to_local_script.to_p2wsh(),
        )
        .map(|(vout, value)| {
            (
                OutPoint::new(close_txid, vout),
                SignDescriptor {
                    pubkey: commitment_keys.broadcaster_delayed_pubkey,
                    single_tweak: Some(
                        keys::single_tweak(
                            self.local_config.keys.delayed_payment_basepoint,
                            commitment.per_commitment_point,
                        )
                        .to_vec(),
                    ),
                    double_tweak: None,
                    witness_script: to_local_script.clone(),
                    value,
                    sighash_type: EcdsaSighashType::All,
                    input_index: 0,
                },
            )
        });

        // Pre-signed timeout transactions for outgoing HTLCs. The stored
        // counterparty HTLC signatures are in output order, matching the
        // reconstructed second-level transactions.
        let second_levels =
            self.second_level_transactions(ChainSide::Local, &commitment);
        let mut htlc_resolutions = vec![];
        let non_dust: Vec<_> = commitment
            .htlcs
            .iter()
            .filter(|htlc| htlc.output_index >= 0)
            .collect();
        for ((htlc, (mut second_level, first_level_script, amount_sat)), their_htlc_sig) in
            non_dust
                .iter()
                .zip(second_levels)
                .zip(&commitment.htlc_signatures)
        {
            if htlc.incoming {
                continue;
            }
            let our_htlc_sig = {
                let descriptor = SignDescriptor {
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
                    witness_script: first_level_script.clone(),
                    value: amount_sat,
                    sighash_type: EcdsaSighashType::All,
                    input_index: 0,
                };
                self.signer.sign_output_raw(&second_level, &descriptor)?
            };
            second_level.input[0].witness = witness::htlc_timeout(
                their_htlc_sig,
                &our_htlc_sig,
                &first_level_script,
            );

            let second_level_script = WitnessScript::ln_second_level(
                commitment_keys.revocation_pubkey,
                commitment_keys.broadcaster_delayed_pubkey,
                to_self_delay,
            );
            let claim_descriptor = SignDescriptor {
                pubkey: commitment_keys.broadcaster_delayed_pubkey,
                single_tweak: Some(
                    keys::single_tweak(
                        self.local_config.keys.delayed_payment_basepoint,
                        commitment.per_commitment_point,
                    )
                    .to_vec(),
                ),
                double_tweak: None,
                witness_script: second_level_script,
                value: second_level.output[0].value,
                sighash_type: EcdsaSighashType::All,
                input_index: 0,
            };
            htlc_resolutions.push(HtlcResolution {
                htlc_index: htlc.htlc_index,
                output_index: htlc.output_index as u32,
                cltv_expiry: htlc.cltv_expiry,
                signed_timeout_tx: second_level,
                claim_descriptor,
                maturity_delay: to_self_delay,
            });
        }

        self.status = ChannelStatus::PendingClose;
        self.store.update_channel(&self.record())?;
        warn!(
            "channel {}: force closing at local height {} with {} HTLC \
             resolution(s)",
            self.channel_id,
            commitment.height,
            htlc_resolutions.len()
        );
        Ok(ForceCloseSummary {
            channel_id: self.channel_id,
            close_tx,
            self_output,
            self_output_maturity: to_self_delay,
            htlc_resolutions,
        })
    }

    /// Classifies a spend of the funding output and produces the matching
    /// close artifact.
    pub fn spend_outcome(
        &self,
        spend: &SpendDetail,
    ) -> Result<CloseOutcome, Error> {
        let state_number =
            match self.obfuscator.recover(&spend.spending_tx) {
                None => return Ok(CloseOutcome::Cooperative),
                Some(state_number) => state_number,
            };
        let remote_tail = self.remote_chain.tail_height();
        if state_number < remote_tail {
            Ok(CloseOutcome::Breach(
                self.breach_retribution(spend, state_number)?,
            ))
        } else {
            Ok(CloseOutcome::Unilateral(
                self.unilateral_close_summary(spend, state_number),
            ))
        }
    }

    /// Builds the summary of a remote unilateral close: sweep descriptor
    /// for our direct output plus claim descriptors for the HTLC outputs.
    fn unilateral_close_summary(
        &self,
        spend: &SpendDetail,
        state_number: u64,
    ) -> UnilateralCloseSummary {
        // The broadcast commitment is the remote tail or its unrevoked tip
        let commitment = [self.remote_chain.tip(), self.remote_chain.tail()]
            .into_iter()
            .flatten()
            .find(|commitment| commitment.height == state_number)
            .cloned();

        let commitment_point = commitment
            .as_ref()
            .map(|commitment| commitment.per_commitment_point)
            .unwrap_or(self.current_remote_point);
        let commitment_keys = CommitmentKeys::derive(
            SECP256K1,
            &self.remote_config.keys,
            &self.local_config.keys,
            commitment_point,
        );

        // Our non-delayed output pays to the tweaked payment key
        let payment_pubkey = commitment_keys.countersignatory_payment_pubkey;
        let to_remote_script =
            scripts::to_remote_output(0, payment_pubkey).script_pubkey;
        let settled_output = spend
            .spending_tx
            .output
            .iter()
            .enumerate()
            .find(|(_, txout)| txout.script_pubkey == to_remote_script)
            .map(|(vout, txout)| {
                (
                    OutPoint::new(spend.spending_tx_hash, vout as u32),
                    SignDescriptor {
                        pubkey: payment_pubkey,
                        single_tweak: Some(
                            keys::single_tweak(
                                self.local_config.keys.payment_basepoint,
                                commitment_point,
                            )
                            .to_vec(),
                        ),
                        double_tweak: None,
                        witness_script: WitnessScript::from_inner(bitcoin::Script::new()),
                        value: txout.value,
                        sighash_type: EcdsaSighashType::All,
                        input_index: 0,
                    },
                )
            });
        let settled_balance_sat = settled_output
            .as_ref()
            .map(|(outpoint, _)| {
                spend.spending_tx.output[outpoint.vout as usize].value
            })
            .unwrap_or(0);

        // HTLC outputs we may resolve with our tweaked HTLC key
        let mut htlc_claims = vec![];
        if let Some(commitment) = &commitment {
            for htlc in
                commitment.htlcs.iter().filter(|htlc| htlc.output_index >= 0)
            {
                // Output indices of the remote commitment are cached on its
                // own chain
                let vout = htlc.output_index as u32;
                let first_level_script = if htlc.incoming {
                    // Incoming to us means offered by the remote owner
                    WitnessScript::ln_offered_htlc(
                        commitment_keys.revocation_pubkey,
                        commitment_keys.broadcaster_htlc_pubkey,
                        commitment_keys.countersignatory_htlc_pubkey,
                        htlc.payment_hash,
                    )
                } else {
                    WitnessScript::ln_received_htlc(
                        commitment_keys.revocation_pubkey,
                        commitment_keys.broadcaster_htlc_pubkey,
                        commitment_keys.countersignatory_htlc_pubkey,
                        htlc.cltv_expiry,
                        htlc.payment_hash,
                    )
                };
                htlc_claims.push((
                    OutPoint::new(spend.spending_tx_hash, vout),
                    SignDescriptor {
                        pubkey: commitment_keys.countersignatory_htlc_pubkey,
                        single_tweak: Some(
                            keys::single_tweak(
                                self.local_config.keys.htlc_basepoint,
                                commitment_point,
                            )
                            .to_vec(),
                        ),
                        double_tweak: None,
                        witness_script: first_level_script,
                        value: htlc.amount_msat / 1000,
                        sighash_type: EcdsaSighashType::All,
                        input_index: 0,
                    },
                ));
            }
        }

        UnilateralCloseSummary {
            channel_id: self.channel_id,
            state_number,
            spending_txid: spend.spending_tx_hash,
            settled_output,
            settled_balance_sat,
            htlc_claims,
        }
    }

    /// Rebuilds the full commitment scene of a revoked remote state and
    /// produces penalty descriptors for each of its outputs, using the
    /// double-tweak of the revocation basepoint by the revealed secret.
    fn breach_retribution(
        &self,
        spend: &SpendDetail,
        breach_height: u64,
    ) -> Result<BreachRetribution, Error> {
        let secret = self
            .revocation_store
            .secret_at(breach_height)
            .map_err(|_| Error::UnknownRevokedState(breach_height))?;
        let commitment_secret = SecretKey::from_slice(secret.as_inner())
            .expect("stored secrets are valid scalars");
        let commitment_point =
            PublicKey::from_secret_key(SECP256K1, &commitment_secret);

        let commitment = self
            .store
            .fetch_revocation_log(self.channel_id, breach_height)?;

        let commitment_keys = CommitmentKeys::derive(
            SECP256K1,
            &self.remote_config.keys,
            &self.local_config.keys,
            commitment_point,
        );
        let breach_txid = spend.spending_tx_hash;
        let mut breached_outputs = vec![];

        // The remote delayed output is claimable with the revocation key
        let to_local_script = WitnessScript::ln_to_local(
            commitment_keys.revocation_pubkey,
            commitment_keys.broadcaster_delayed_pubkey,
            self.remote_config.to_self_delay,
        );
        if let Some((vout, value)) =
            locate_output(&spend.spending_tx, &to_local_script.to_p2wsh())
        {
            breached_outputs.push(BreachedOutput {
                outpoint: OutPoint::new(breach_txid, vout),
                amount_sat: value,
                sign_descriptor: SignDescriptor {
                    pubkey: commitment_keys.revocation_pubkey,
                    single_tweak: None,
                    double_tweak: Some(commitment_secret),
                    witness_script: to_local_script,
                    value,
                    sighash_type: EcdsaSighashType::All,
                    input_index: 0,
                },
            });
        }

        // Every HTLC output of the revoked state is penalty-claimable
        for htlc in
            commitment.htlcs.iter().filter(|htlc| htlc.output_index >= 0)
        {
            let first_level_script = if htlc.incoming {
                WitnessScript::ln_offered_htlc(
                    commitment_keys.revocation_pubkey,
                    commitment_keys.broadcaster_htlc_pubkey,
                    commitment_keys.countersignatory_htlc_pubkey,
                    htlc.payment_hash,
                )
            } else {
                WitnessScript::ln_received_htlc(
                    commitment_keys.revocation_pubkey,
                    commitment_keys.broadcaster_htlc_pubkey,
                    commitment_keys.countersignatory_htlc_pubkey,
                    htlc.cltv_expiry,
                    htlc.payment_hash,
                )
            };
            if let Some((vout, value)) =
                locate_output(&spend.spending_tx, &first_level_script.to_p2wsh())
            {
                breached_outputs.push(BreachedOutput {
                    outpoint: OutPoint::new(breach_txid, vout),
                    amount_sat: value,
                    sign_descriptor: SignDescriptor {
                        pubkey: commitment_keys.revocation_pubkey,
                        single_tweak: None,
                        double_tweak: Some(commitment_secret),
                        witness_script: first_level_script,
                        value,
                        sighash_type: EcdsaSighashType::All,
                        input_index: 0,
                    },
                });
            }
        }

        // Our own direct output is swept with the ordinary payment tweak
        let payment_pubkey = commitment_keys.countersignatory_payment_pubkey;
        let to_remote_script =
            scripts::to_remote_output(0, payment_pubkey).script_pubkey;
        let settled_output = spend
            .spending_tx
            .output
            .iter()
            .enumerate()
            .find(|(_, txout)| txout.script_pubkey == to_remote_script)
            .map(|(vout, txout)| {
                (
                    OutPoint::new(breach_txid, vout as u32),
                    SignDescriptor {
                        pubkey: payment_pubkey,
                        single_tweak: Some(
                            keys::single_tweak(
                                self.local_config.keys.payment_basepoint,
                                commitment_point,
                            )
                            .to_vec(),
                        ),
                        double_tweak: None,
                        witness_script: WitnessScript::from_inner(bitcoin::Script::new()),
                        value: txout.value,
                        sighash_type: EcdsaSighashType::All,
                        input_index: 0,
                    },
                )
            });

        Ok(BreachRetribution {
            channel_id: self.channel_id,
            breach_height,
            breach_txid,
            breached_outputs,
            settled_output,
        })
    }
}

fn locate_output(
    tx: &Transaction,
    script_pubkey: &PubkeyScript,
) -> Option<(u32, u64)> {
    tx.output
        .iter()
        .enumerate()
        .find(|(_, txout)| txout.script_pubkey == *script_pubkey.as_inner())
        .map(|(vout, txout)| (vout as u32, txout.value))
}

/// Watches the funding outpoint for spends through the chain notifier and
/// classifies whatever appears on chain.
///
/// Breach outcomes are handed off over the outcome channel; once the
/// recipient acknowledges, the channel transitions into the pending-close
/// state. The observer owns its subscription and cancels it on quit.
pub struct CloseObserver {
    channel: Arc<Channel>,
    outcomes: Sender<CloseOutcome>,
    acks: Receiver<()>,
    quit: Receiver<()>,
}

impl CloseObserver {
    /// Creates an observer together with its quit handle; dropping the
    /// handle (or sending on it) terminates [`CloseObserver::run`].
    pub fn with(
        channel: Arc<Channel>,
        outcomes: Sender<CloseOutcome>,
        acks: Receiver<()>,
    ) -> (CloseObserver, Sender<()>) {
        let (quit_handle, quit) = bounded(1);
        (
            CloseObserver {
                channel,
                outcomes,
                acks,
                quit,
            },
            quit_handle,
        )
    }

    /// Blocks watching for a spend of the funding outpoint, dispatching its
    /// classification and driving the channel status transition. Returns
    /// once a spend has been fully processed or the quit handle fires.
    pub fn run(self, notifier: &dyn ChainNotifier) {
        let (outpoint, height_hint) = self.channel.observe(|machine| {
            (machine.channel_point(), 0u32)
        });
        let subscription =
            notifier.register_spend_notification(outpoint, height_hint);

        let spend = crossbeam_channel::select! {
            recv(subscription.spends()) -> spend => match spend {
                Ok(spend) => spend,
                Err(_) => return,
            },
            recv(self.quit) -> _ => {
                subscription.cancel();
                return;
            }
        };

        let outcome =
            self.channel.observe(|machine| machine.spend_outcome(&spend));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("close observation failed: {}", err);
                return;
            }
        };

        let is_breach = matches!(outcome, CloseOutcome::Breach(_));
        if self.outcomes.send(outcome).is_err() {
            return;
        }
        if is_breach {
            // The retribution hand-off must be acknowledged before the
            // channel is marked pending-force-closed
            crossbeam_channel::select! {
                recv(self.acks) -> ack => {
                    if ack.is_err() {
                        return;
                    }
                }
                recv(self.quit) -> _ => return,
            }
        }
        self.channel.update(|machine| {
            machine.set_status_pending_close();
        });
    }
}

impl ChannelMachine {
    pub(super) fn set_status_pending_close(&mut self) {
        self.status = ChannelStatus::PendingClose;
        if let Err(err) = self.store.update_channel(&self.record()) {
            error!(
                "channel {}: failed to persist pending-close status: {}",
                self.channel_id, err
            );
        }
    }
}
