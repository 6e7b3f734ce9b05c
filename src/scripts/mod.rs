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

//! Deterministic construction of all channel scripts, witness stacks and
//! transaction skeletons. The commitment machine never assembles a script
//! on its own: everything enforceable on-chain originates here.

pub mod hint;
pub mod keys;

use amplify::Wrapper;
use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script;
use bitcoin::hashes::{ripemd160, Hash};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    EcdsaSighashType, OutPoint, PackedLockTime, Script, Sequence, Transaction,
    TxIn, TxOut, Witness,
};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use bitcoin_scripts::{LockScript, PubkeyScript, WitnessScript};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

pub use hint::StateHintObfuscator;

/// Sorts two public keys lexicographically by their compressed
/// serialization, as required for the funding multisig.
pub fn lex_ordered(
    a: PublicKey,
    b: PublicKey,
) -> (PublicKey, PublicKey) {
    if a.serialize() <= b.serialize() {
        (a, b)
    } else {
        (b, a)
    }
}

/// BIP-69 deterministic output ordering: amount ascending, then pk-script
/// lexicographic ascending. The attached payload travels with its output so
/// HTLC entries can learn their final output indices.
pub fn bip69_sort<T>(outputs: &mut Vec<(TxOut, T)>) {
    outputs.sort_by(|(a, _), (b, _)| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });
}

/// Generators for the five witness-script families of the channel protocol.
pub trait ScriptGenerators {
    /// 2-of-2 multisig locking the funding output; keys sorted
    /// lexicographically.
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self;

    /// Output paying to the broadcasting party: spendable by the owner after
    /// the CSV delay, or by the counterparty with the revocation key
    /// immediately.
    ///
    /// NB: the "local" keys here belong to whoever owns the commitment
    /// transaction being built, which is the remote node when we sign their
    /// commitment.
    fn ln_to_local(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;

    /// HTLC offered by the owner of the commitment transaction: claimable by
    /// the receiver with the payment pre-image (through the second-level
    /// success transaction), refundable by the sender after the CLTV timeout
    /// (through the second-level timeout transaction), and sweepable by the
    /// revocation key holder.
    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self;

    /// HTLC received by the owner of the commitment transaction; symmetric
    /// to the offered script with the CLTV check inside the refund branch.
    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self;

    /// Output of a second-level HTLC transaction: pure CSV-or-revoke.
    fn ln_second_level(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;
}

impl ScriptGenerators for LockScript {
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self {
        let (first, second) = lex_ordered(local_pubkey, remote_pubkey);
        script::Builder::new()
            .push_int(2)
            .push_key(&bitcoin::PublicKey::new(first))
            .push_key(&bitcoin::PublicKey::new(second))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
            .into()
    }

    fn ln_to_local(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_IF)
            .push_key(&bitcoin::PublicKey::new(revocationpubkey))
            .push_opcode(OP_ELSE)
            .push_int(to_self_delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_key(&bitcoin::PublicKey::new(local_delayedpubkey))
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
            .into()
    }

    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self {
        let payment_hash160 = ripemd160::Hash::hash(payment_hash.as_ref());
        script::Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(
                &bitcoin::PublicKey::new(revocationpubkey).pubkey_hash()[..],
            )
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&bitcoin::PublicKey::new(remote_htlcpubkey))
            .push_opcode(OP_SWAP)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_NOTIF)
            .push_opcode(OP_DROP)
            .push_int(2)
            .push_opcode(OP_SWAP)
            .push_key(&bitcoin::PublicKey::new(local_htlcpubkey))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_HASH160)
            .push_slice(&payment_hash160[..])
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script()
            .into()
    }

    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self {
        let payment_hash160 = ripemd160::Hash::hash(payment_hash.as_ref());
        script::Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(
                &bitcoin::PublicKey::new(revocationpubkey).pubkey_hash()[..],
            )
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&bitcoin::PublicKey::new(remote_htlcpubkey))
            .push_opcode(OP_SWAP)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_HASH160)
            .push_slice(&payment_hash160[..])
            .push_opcode(OP_EQUALVERIFY)
            .push_int(2)
            .push_opcode(OP_SWAP)
            .push_key(&bitcoin::PublicKey::new(local_htlcpubkey))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(cltv_expiry as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script()
            .into()
    }

    fn ln_second_level(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        // Same shape as `ln_to_local`: the second-level output is a pure
        // CSV-or-revoke contract.
        Self::ln_to_local(
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
    }
}

impl ScriptGenerators for WitnessScript {
    #[inline]
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self {
        LockScript::ln_funding(local_pubkey, remote_pubkey).into()
    }

    #[inline]
    fn ln_to_local(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        LockScript::ln_to_local(
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .into()
    }

    #[inline]
    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self {
        LockScript::ln_offered_htlc(
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
        )
        .into()
    }

    #[inline]
    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self {
        LockScript::ln_received_htlc(
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            cltv_expiry,
            payment_hash,
        )
        .into()
    }

    #[inline]
    fn ln_second_level(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        LockScript::ln_second_level(
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .into()
    }
}

impl ScriptGenerators for PubkeyScript {
    #[inline]
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self {
        WitnessScript::ln_funding(local_pubkey, remote_pubkey).to_p2wsh()
    }

    #[inline]
    fn ln_to_local(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        WitnessScript::ln_to_local(
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .to_p2wsh()
    }

    #[inline]
    fn ln_offered_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self {
        WitnessScript::ln_offered_htlc(
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
        )
        .to_p2wsh()
    }

    #[inline]
    fn ln_received_htlc(
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self {
        WitnessScript::ln_received_htlc(
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            cltv_expiry,
            payment_hash,
        )
        .to_p2wsh()
    }

    #[inline]
    fn ln_second_level(
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        WitnessScript::ln_second_level(
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .to_p2wsh()
    }
}

/// P2WPKH output paying the counterparty's non-delayed payment key.
pub fn to_remote_output(amount: u64, remote_paymentpubkey: PublicKey) -> TxOut {
    let script_pubkey: PubkeyScript = bitcoin::PublicKey::new(
        remote_paymentpubkey,
    )
    .wpubkey_hash()
    .expect("compressed key")
    .into();
    TxOut {
        value: amount,
        script_pubkey: script_pubkey.into(),
    }
}

/// Skeleton of a commitment transaction: single input spending the funding
/// outpoint, state hint embedded in the lock time and sequence. Outputs must
/// already be BIP-69 sorted.
pub fn commitment_tx(
    funding_outpoint: OutPoint,
    obfuscator: StateHintObfuscator,
    commitment_number: u64,
    outputs: Vec<TxOut>,
) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime(obfuscator.lock_time(commitment_number)),
        input: vec![TxIn {
            previous_output: funding_outpoint,
            script_sig: none!(),
            sequence: Sequence(obfuscator.sequence(commitment_number)),
            witness: empty!(),
        }],
        output: outputs,
    }
}

/// Generators for the channel transactions built on top of a commitment.
pub trait TxGenerators {
    /// Second-level HTLC timeout transaction: spends an offered HTLC output
    /// after its CLTV expiry into a CSV-or-revoke output.
    ///
    /// `amount` must already have the timeout fee subtracted.
    fn ln_htlc_timeout(
        amount: u64,
        outpoint: OutPoint,
        cltv_expiry: u32,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;

    /// Second-level HTLC success transaction: spends a received HTLC output
    /// with the pre-image into a CSV-or-revoke output.
    ///
    /// `amount` must already have the success fee subtracted.
    fn ln_htlc_success(
        amount: u64,
        outpoint: OutPoint,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;

    /// Cooperative close transaction spending the funding outpoint into the
    /// two negotiated scripts. Zero outputs are trimmed by the caller.
    fn ln_closing(funding_outpoint: OutPoint, outputs: Vec<TxOut>) -> Self;
}

impl TxGenerators for Transaction {
    fn ln_htlc_timeout(
        amount: u64,
        outpoint: OutPoint,
        cltv_expiry: u32,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        let script_pubkey: PubkeyScript = PubkeyScript::ln_second_level(
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        );
        Transaction {
            version: 2,
            lock_time: PackedLockTime(cltv_expiry),
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: none!(),
                sequence: Sequence(0),
                witness: empty!(),
            }],
            output: vec![TxOut {
                value: amount,
                script_pubkey: script_pubkey.into(),
            }],
        }
    }

    fn ln_htlc_success(
        amount: u64,
        outpoint: OutPoint,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        let mut tx = Transaction::ln_htlc_timeout(
            amount,
            outpoint,
            0,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        );
        tx.lock_time = PackedLockTime(0);
        tx
    }

    fn ln_closing(funding_outpoint: OutPoint, outputs: Vec<TxOut>) -> Self {
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: funding_outpoint,
                script_sig: none!(),
                sequence: Sequence(0xFFFF_FFFF),
                witness: empty!(),
            }],
            output: outputs,
        }
    }
}

/// Computes the segwit v0 signature hash of a transaction input, returned as
/// a message ready for signing or verification.
pub fn segwit_sighash(
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    value: u64,
) -> secp256k1::Message {
    let sighash = SighashCache::new(tx)
        .segwit_signature_hash(
            input_index,
            witness_script,
            value,
            EcdsaSighashType::All,
        )
        .expect("input index within transaction bounds");
    secp256k1::Message::from_slice(&sighash[..])
        .expect("sighash is always 32 bytes")
}

/// DER-serializes a signature and appends the `SIGHASH_ALL` byte.
pub fn serialize_sig(sig: &Signature) -> Vec<u8> {
    let mut serialized = sig.serialize_der().to_vec();
    serialized.push(EcdsaSighashType::All.to_u32() as u8);
    serialized
}

/// Witness stacks for each spending path of the channel scripts.
pub mod witness {
    use super::*;

    /// Spends the funding output: the empty element consumed by
    /// `OP_CHECKMULTISIG`, then both signatures in the lexicographic order
    /// of their public keys.
    pub fn funding_spend(
        local_pubkey: PublicKey,
        remote_pubkey: PublicKey,
        local_sig: &Signature,
        remote_sig: &Signature,
        witness_script: &WitnessScript,
    ) -> Witness {
        let (first, _) = lex_ordered(local_pubkey, remote_pubkey);
        let (first_sig, second_sig) = if first == local_pubkey {
            (local_sig, remote_sig)
        } else {
            (remote_sig, local_sig)
        };
        Witness::from_vec(vec![
            vec![],
            serialize_sig(first_sig),
            serialize_sig(second_sig),
            witness_script.as_inner().to_bytes(),
        ])
    }

    /// Penalty spend of a CSV-or-revoke output (`to_local` or second-level)
    /// with the revocation key.
    pub fn revocation_penalty(
        sig: &Signature,
        witness_script: &WitnessScript,
    ) -> Witness {
        Witness::from_vec(vec![
            serialize_sig(sig),
            vec![1],
            witness_script.as_inner().to_bytes(),
        ])
    }

    /// Owner spend of a CSV-or-revoke output after the delay elapsed.
    pub fn csv_delayed_spend(
        sig: &Signature,
        witness_script: &WitnessScript,
    ) -> Witness {
        Witness::from_vec(vec![
            serialize_sig(sig),
            vec![],
            witness_script.as_inner().to_bytes(),
        ])
    }

    /// Spends a received HTLC output through the second-level success
    /// transaction: both 2-of-2 signatures plus the payment pre-image.
    pub fn htlc_success(
        remote_sig: &Signature,
        local_sig: &Signature,
        preimage: HashPreimage,
        witness_script: &WitnessScript,
    ) -> Witness {
        Witness::from_vec(vec![
            vec![],
            serialize_sig(remote_sig),
            serialize_sig(local_sig),
            AsRef::<[u8]>::as_ref(&preimage).to_vec(),
            witness_script.as_inner().to_bytes(),
        ])
    }

    /// Spends an offered HTLC output through the second-level timeout
    /// transaction: both 2-of-2 signatures with an empty payload selecting
    /// the timeout branch.
    pub fn htlc_timeout(
        remote_sig: &Signature,
        local_sig: &Signature,
        witness_script: &WitnessScript,
    ) -> Witness {
        Witness::from_vec(vec![
            vec![],
            serialize_sig(remote_sig),
            serialize_sig(local_sig),
            vec![],
            witness_script.as_inner().to_bytes(),
        ])
    }

    /// Penalty spend of a revoked HTLC output with the revocation key.
    pub fn htlc_penalty(
        sig: &Signature,
        revocationpubkey: PublicKey,
        witness_script: &WitnessScript,
    ) -> Witness {
        Witness::from_vec(vec![
            serialize_sig(sig),
            revocationpubkey.serialize().to_vec(),
            witness_script.as_inner().to_bytes(),
        ])
    }

    /// Direct pre-image claim of an offered HTLC output on the remote
    /// commitment transaction.
    pub fn htlc_preimage_spend(
        sig: &Signature,
        preimage: HashPreimage,
        witness_script: &WitnessScript,
    ) -> Witness {
        Witness::from_vec(vec![
            serialize_sig(sig),
            AsRef::<[u8]>::as_ref(&preimage).to_vec(),
            witness_script.as_inner().to_bytes(),
        ])
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use amplify::hex::ToHex;
    use amplify::Wrapper;

    use super::*;

    macro_rules! pk {
        ($hex:expr) => {
            PublicKey::from_str($hex).unwrap()
        };
    }

    #[test]
    fn bolt3_funding_witness_script() {
        let local_funding_pubkey = pk!("023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f54eb");
        let remote_funding_pubkey = pk!("030e9f7b623d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa711c1");
        let witness_script = WitnessScript::ln_funding(
            local_funding_pubkey,
            remote_funding_pubkey,
        );
        assert_eq!(
            witness_script.to_hex(),
            "5221023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f\
            54eb21030e9f7b623d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa\
            711c152ae"
        );
        // Key order must not depend on which side is "local"
        assert_eq!(
            witness_script,
            WitnessScript::ln_funding(
                remote_funding_pubkey,
                local_funding_pubkey
            )
        );
    }

    #[test]
    fn bip69_ordering() {
        let script_a = Script::from_str("0014aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let script_b = Script::from_str("0014bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap();
        let mut outputs = vec![
            (
                TxOut {
                    value: 2000,
                    script_pubkey: script_a.clone(),
                },
                "a2000",
            ),
            (
                TxOut {
                    value: 1000,
                    script_pubkey: script_b.clone(),
                },
                "b1000",
            ),
            (
                TxOut {
                    value: 1000,
                    script_pubkey: script_a,
                },
                "a1000",
            ),
        ];
        bip69_sort(&mut outputs);
        let order = outputs.iter().map(|(_, tag)| *tag).collect::<Vec<_>>();
        assert_eq!(order, vec!["a1000", "b1000", "a2000"]);
    }

    #[test]
    fn second_level_is_csv_or_revoke() {
        let revocation = pk!("0212a140cd0c6539d07cd08dfe09984dec3251ea808b892efeac3ede9402bf2b19");
        let delayed = pk!("03fd5960528dc152014952efdb702a88f71e3c1653b2314431701ec77e57fde83c");
        assert_eq!(
            LockScript::ln_second_level(revocation, delayed, 144),
            LockScript::ln_to_local(revocation, delayed, 144)
        );
    }

    #[test]
    fn htlc_scripts_differ_per_direction() {
        let revocation = pk!("0212a140cd0c6539d07cd08dfe09984dec3251ea808b892efeac3ede9402bf2b19");
        let local = pk!("030d417a46946384f88d5f3337267c5e579765875dc4daca813e21734b140639e7");
        let remote = pk!("0394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b");
        let hash = HashLock::from_inner(amplify::Slice32::from_inner([7u8; 32]));
        let offered =
            LockScript::ln_offered_htlc(revocation, local, remote, hash);
        let received = LockScript::ln_received_htlc(
            revocation, local, remote, 500_000, hash,
        );
        assert_ne!(offered, received);
    }

    #[test]
    fn htlc_timeout_tx_locktime() {
        let revocation = pk!("0212a140cd0c6539d07cd08dfe09984dec3251ea808b892efeac3ede9402bf2b19");
        let delayed = pk!("03fd5960528dc152014952efdb702a88f71e3c1653b2314431701ec77e57fde83c");
        let tx = Transaction::ln_htlc_timeout(
            9_000,
            OutPoint::default(),
            500,
            revocation,
            delayed,
            144,
        );
        assert_eq!(tx.lock_time.0, 500);
        assert_eq!(tx.input[0].sequence, Sequence(0));
        assert_eq!(tx.output[0].value, 9_000);

        let success = Transaction::ln_htlc_success(
            9_000,
            OutPoint::default(),
            revocation,
            delayed,
            144,
        );
        assert_eq!(success.lock_time.0, 0);
        assert_eq!(success.output, tx.output);
    }
}
