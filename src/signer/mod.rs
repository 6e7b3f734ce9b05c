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

//! External collaborator contracts: the signing oracle, the chain notifier
//! and the fee oracle. The channel machine knows these only through the
//! traits defined here.

pub mod sigpool;

use amplify::Wrapper;
use bitcoin::{EcdsaSighashType, OutPoint, Transaction, Txid, Witness};
use bitcoin_scripts::WitnessScript;
use crossbeam_channel::{Receiver, Sender};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use crate::scripts::{self, keys};

pub use sigpool::{SigPool, SignJob, VerifyJob};

/// Errors returned by signer back-ends.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// signer does not control the private key matching public key {0}
    KeyNotFound(PublicKey),

    /// signature batch was cancelled after a previous failure
    Cancelled,

    /// signature #{index} does not verify for its transaction
    InvalidSignature { index: usize },

    /// signer back-end failure: {0}
    Backend(String),
}

/// Fully self-contained description of an input the signer must produce a
/// signature for.
///
/// All key-tweaking material travels as plain bytes so the descriptor can be
/// persisted or handed across process boundaries without access to private
/// keys.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignDescriptor {
    /// Public key the signature must verify under (already tweaked if any
    /// tweak is present).
    pub pubkey: PublicKey,

    /// Tweak bytes `SHA256(per_commitment_point ‖ basepoint)` for additive
    /// derivation of payment, delay and HTLC keys.
    pub single_tweak: Option<Vec<u8>>,

    /// Revealed per-commitment secret for reconstructing a revocation
    /// private key (breach retribution path).
    pub double_tweak: Option<SecretKey>,

    /// Witness script committed to by the output being spent.
    pub witness_script: WitnessScript,

    /// Value of the output being spent.
    pub value: u64,

    /// Sighash flag to commit to.
    pub sighash_type: EcdsaSighashType,

    /// Index of the transaction input being signed.
    pub input_index: usize,
}

/// Raw-signature oracle: derives the correct private key by matching the
/// (tweaked) public key of the descriptor against its internal key store.
pub trait Signer: Send + Sync {
    /// Produces a raw signature for the described input of the transaction.
    fn sign_output_raw(
        &self,
        tx: &Transaction,
        descriptor: &SignDescriptor,
    ) -> Result<Signature, Error>;

    /// Produces a complete input witness where the signer controls the full
    /// spending path (plain P2WPKH sweep outputs).
    fn compute_input_script(
        &self,
        tx: &Transaction,
        descriptor: &SignDescriptor,
    ) -> Result<Witness, Error>;
}

/// Single spend event delivered by the chain notifier.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SpendDetail {
    pub spending_tx_hash: Txid,
    pub spending_tx: Transaction,
    pub spending_height: u32,
    pub spent_outpoint: OutPoint,
}

/// Subscription for a single spend notification.
///
/// The stream delivers at most one event; dropping the subscription (or
/// calling [`SpendSubscription::cancel`]) releases the registration.
pub struct SpendSubscription {
    spends: Receiver<SpendDetail>,
    // Dropping this sender is the cancellation signal for the notifier
    cancel: Sender<()>,
}

impl SpendSubscription {
    pub fn with(spends: Receiver<SpendDetail>, cancel: Sender<()>) -> Self {
        SpendSubscription { spends, cancel }
    }

    /// Stream of spend events (at most one will ever be delivered).
    #[inline]
    pub fn spends(&self) -> &Receiver<SpendDetail> {
        &self.spends
    }

    /// Cancels the subscription.
    #[inline]
    pub fn cancel(self) {
        drop(self.cancel);
    }
}

/// Blockchain watcher contract: delivers the transaction spending a watched
/// outpoint together with its confirmation height.
pub trait ChainNotifier: Send + Sync {
    fn register_spend_notification(
        &self,
        outpoint: OutPoint,
        height_hint: u32,
    ) -> SpendSubscription;
}

/// On-chain fee estimator contract. Pure observation, no state.
pub trait FeeOracle: Send + Sync {
    /// Fee rate, in satoshi per 1000 weight units, expected to confirm
    /// within `conf_target` blocks.
    fn estimate_fee_per_kw(&self, conf_target: u32) -> u64;
}

/// Reference signer holding raw private keys in memory.
///
/// Matches descriptors against its keys by re-deriving the tweaked public
/// key; the derivation algebra mirrors [`crate::scripts::keys`].
#[derive(Clone, Debug, Default)]
pub struct MemorySigner {
    keys: Vec<SecretKey>,
}

impl MemorySigner {
    pub fn new(keys: impl IntoIterator<Item = SecretKey>) -> Self {
        MemorySigner {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn add_key(&mut self, key: SecretKey) {
        self.keys.push(key);
    }

    fn derive_matching_key(
        &self,
        descriptor: &SignDescriptor,
    ) -> Result<SecretKey, Error> {
        for base in &self.keys {
            let candidate = match (
                &descriptor.single_tweak,
                &descriptor.double_tweak,
            ) {
                (None, None) => *base,
                (Some(tweak), None) => {
                    let scalar = secp256k1::Scalar::from_be_bytes(
                        <[u8; 32]>::try_from(tweak.as_slice()).map_err(
                            |_| {
                                Error::Backend(s!(
                                    "single tweak must be 32 bytes"
                                ))
                            },
                        )?,
                    )
                    .map_err(|_| {
                        Error::Backend(s!("single tweak out of field range"))
                    })?;
                    base.add_tweak(&scalar)
                        .expect("negligible probability")
                }
                (_, Some(commitment_secret)) => {
                    keys::derive_revocation_privkey(
                        SECP256K1,
                        *base,
                        *commitment_secret,
                    )
                }
            };
            if PublicKey::from_secret_key(SECP256K1, &candidate)
                == descriptor.pubkey
            {
                return Ok(candidate);
            }
        }
        Err(Error::KeyNotFound(descriptor.pubkey))
    }
}

impl Signer for MemorySigner {
    fn sign_output_raw(
        &self,
        tx: &Transaction,
        descriptor: &SignDescriptor,
    ) -> Result<Signature, Error> {
        let seckey = self.derive_matching_key(descriptor)?;
        let message = scripts::segwit_sighash(
            tx,
            descriptor.input_index,
            descriptor.witness_script.as_inner(),
            descriptor.value,
        );
        Ok(SECP256K1.sign_ecdsa(&message, &seckey))
    }

    fn compute_input_script(
        &self,
        tx: &Transaction,
        descriptor: &SignDescriptor,
    ) -> Result<Witness, Error> {
        let seckey = self.derive_matching_key(descriptor)?;
        let pubkey = PublicKey::from_secret_key(SECP256K1, &seckey);
        // P2WPKH sighash commits to the canonical p2pkh script code
        let script_code = bitcoin::Script::new_p2pkh(
            &bitcoin::PublicKey::new(pubkey).pubkey_hash(),
        );
        let message = scripts::segwit_sighash(
            tx,
            descriptor.input_index,
            &script_code,
            descriptor.value,
        );
        let sig = SECP256K1.sign_ecdsa(&message, &seckey);
        Ok(Witness::from_vec(vec![
            scripts::serialize_sig(&sig),
            pubkey.serialize().to_vec(),
        ]))
    }
}

#[cfg(test)]
mod test {
    use amplify::Wrapper;
    use bitcoin::{PackedLockTime, Sequence, TxIn, TxOut};

    use super::*;
    use crate::scripts::ScriptGenerators;

    fn test_tx(value: u64, script: &WitnessScript) -> Transaction {
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: none!(),
                sequence: Sequence(0),
                witness: empty!(),
            }],
            output: vec![TxOut {
                value,
                script_pubkey: script.to_p2wsh().into_inner(),
            }],
        }
    }

    #[test]
    fn memory_signer_plain_key() {
        let seckey = SecretKey::from_slice(&[0x21u8; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(SECP256K1, &seckey);
        let signer = MemorySigner::new([seckey]);

        let witness_script =
            WitnessScript::ln_funding(pubkey, dumb_pubkey!());
        let tx = test_tx(100_000, &witness_script);
        let descriptor = SignDescriptor {
            pubkey,
            single_tweak: None,
            double_tweak: None,
            witness_script: witness_script.clone(),
            value: 100_000,
            sighash_type: EcdsaSighashType::All,
            input_index: 0,
        };
        let sig = signer.sign_output_raw(&tx, &descriptor).unwrap();
        let message = scripts::segwit_sighash(
            &tx,
            0,
            witness_script.as_inner(),
            100_000,
        );
        assert!(SECP256K1.verify_ecdsa(&message, &sig, &pubkey).is_ok());
    }

    #[test]
    fn memory_signer_single_tweak() {
        let base_secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let commitment_secret = SecretKey::from_slice(&[0x17u8; 32]).unwrap();
        let basepoint = PublicKey::from_secret_key(SECP256K1, &base_secret);
        let point =
            PublicKey::from_secret_key(SECP256K1, &commitment_secret);
        let signer = MemorySigner::new([base_secret]);

        let tweaked = keys::derive_pubkey(SECP256K1, basepoint, point);
        let witness_script: WitnessScript = WitnessScript::ln_to_local(
            dumb_pubkey!(),
            tweaked,
            144,
        );
        let tx = test_tx(50_000, &witness_script);
        let descriptor = SignDescriptor {
            pubkey: tweaked,
            single_tweak: Some(
                keys::single_tweak(basepoint, point).to_vec(),
            ),
            double_tweak: None,
            witness_script: witness_script.clone(),
            value: 50_000,
            sighash_type: EcdsaSighashType::All,
            input_index: 0,
        };
        let sig = signer.sign_output_raw(&tx, &descriptor).unwrap();
        let message =
            scripts::segwit_sighash(&tx, 0, witness_script.as_inner(), 50_000);
        assert!(SECP256K1.verify_ecdsa(&message, &sig, &tweaked).is_ok());
    }

    #[test]
    fn memory_signer_double_tweak() {
        let base_secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let commitment_secret = SecretKey::from_slice(&[0x17u8; 32]).unwrap();
        let basepoint = PublicKey::from_secret_key(SECP256K1, &base_secret);
        let point =
            PublicKey::from_secret_key(SECP256K1, &commitment_secret);
        let signer = MemorySigner::new([base_secret]);

        let revocation_pubkey =
            keys::derive_revocation_pubkey(SECP256K1, basepoint, point);
        let witness_script: WitnessScript = WitnessScript::ln_to_local(
            revocation_pubkey,
            dumb_pubkey!(),
            144,
        );
        let tx = test_tx(25_000, &witness_script);
        let descriptor = SignDescriptor {
            pubkey: revocation_pubkey,
            single_tweak: None,
            double_tweak: Some(commitment_secret),
            witness_script: witness_script.clone(),
            value: 25_000,
            sighash_type: EcdsaSighashType::All,
            input_index: 0,
        };
        let sig = signer.sign_output_raw(&tx, &descriptor).unwrap();
        let message =
            scripts::segwit_sighash(&tx, 0, witness_script.as_inner(), 25_000);
        assert!(SECP256K1
            .verify_ecdsa(&message, &sig, &revocation_pubkey)
            .is_ok());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let signer =
            MemorySigner::new([SecretKey::from_slice(&[0x21u8; 32]).unwrap()]);
        let witness_script: WitnessScript =
            WitnessScript::ln_to_local(dumb_pubkey!(), dumb_pubkey!(), 1);
        let tx = test_tx(1_000, &witness_script);
        let stranger = PublicKey::from_secret_key(
            SECP256K1,
            &SecretKey::from_slice(&[0x99u8; 32]).unwrap(),
        );
        let descriptor = SignDescriptor {
            pubkey: stranger,
            single_tweak: None,
            double_tweak: None,
            witness_script,
            value: 1_000,
            sighash_type: EcdsaSighashType::All,
            input_index: 0,
        };
        assert_eq!(
            signer.sign_output_raw(&tx, &descriptor),
            Err(Error::KeyNotFound(stranger))
        );
    }
}
