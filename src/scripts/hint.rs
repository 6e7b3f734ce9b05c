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

//! Obfuscated 48-bit state hints.
//!
//! Every commitment transaction encodes its state number in the low 24 bits
//! of `lock_time` and the low 24 bits of the funding input `sequence`,
//! XOR-obfuscated with a per-channel factor derived from both payment
//! basepoints. This allows log-less recovery of the state number from any
//! broadcast commitment.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::Transaction;
use secp256k1::PublicKey;

const LOWER_24_BITS: u32 = 0x00FF_FFFF;
const LOWER_48_BITS: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Per-channel obfuscation factor for commitment state numbers.
///
/// Both parties compute the same factor: the initiator's payment basepoint
/// is always hashed first.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Default,
    StrictEncode,
    StrictDecode,
)]
pub struct StateHintObfuscator(u64);

impl StateHintObfuscator {
    pub fn with(
        initiator_payment_basepoint: PublicKey,
        responder_payment_basepoint: PublicKey,
    ) -> Self {
        let mut engine = sha256::Hash::engine();
        engine.input(&initiator_payment_basepoint.serialize());
        engine.input(&responder_payment_basepoint.serialize());
        let obscuring_hash = sha256::Hash::from_engine(engine);

        let mut buf = [0u8; 8];
        buf.copy_from_slice(&obscuring_hash[24..]);
        StateHintObfuscator(u64::from_be_bytes(buf) & LOWER_48_BITS)
    }

    /// Obscures a commitment number for embedding into a transaction.
    #[inline]
    pub fn obscure(self, commitment_number: u64) -> u64 {
        (commitment_number & LOWER_48_BITS) ^ self.0
    }

    /// `lock_time` value carrying the low 24 bits of the obscured number.
    #[inline]
    pub fn lock_time(self, commitment_number: u64) -> u32 {
        let obscured = self.obscure(commitment_number);
        (0x20u32 << 24) | (obscured as u32 & LOWER_24_BITS)
    }

    /// Funding input `sequence` carrying the high 24 bits of the obscured
    /// number.
    #[inline]
    pub fn sequence(self, commitment_number: u64) -> u32 {
        let obscured = self.obscure(commitment_number);
        (0x80u32 << 24) | ((obscured >> 24) as u32 & LOWER_24_BITS)
    }

    /// Recovers the state number from a broadcast commitment transaction.
    ///
    /// Returns `None` if the transaction does not carry a state hint (not a
    /// commitment transaction of this channel protocol).
    pub fn recover(self, tx: &Transaction) -> Option<u64> {
        let input = tx.input.first()?;
        let lock_time = tx.lock_time.0;
        let sequence = input.sequence.to_consensus_u32();
        if lock_time >> 24 != 0x20 || sequence >> 24 != 0x80 {
            return None;
        }
        let obscured = ((sequence as u64 & LOWER_24_BITS as u64) << 24)
            | (lock_time as u64 & LOWER_24_BITS as u64);
        Some(obscured ^ self.0)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::{OutPoint, PackedLockTime, Sequence, TxIn};

    use super::*;

    macro_rules! pk {
        ($hex:expr) => {
            PublicKey::from_str($hex).unwrap()
        };
    }

    fn obfuscator_for_tests() -> StateHintObfuscator {
        // BOLT-3 appendix C basepoints: initiator (local) first
        StateHintObfuscator::with(
            pk!("034f355bdcb7cc0af728ef3cceb9615d90684bb5b2ca5f859ab0f0b704075871aa"),
            pk!("032c0b7cf95324a07d05398b240174dc0c2be444d96b159aa6c7f7b1e668680991"),
        )
    }

    #[test]
    fn bolt3_obscuring_factor() {
        let obfuscator = obfuscator_for_tests();
        assert_eq!(obfuscator.obscure(42), 0x2bb038521914 ^ 42);
    }

    #[test]
    fn hint_roundtrip() {
        let obfuscator = obfuscator_for_tests();
        for commitment_number in [0u64, 1, 42, 5_000, LOWER_48_BITS] {
            let tx = Transaction {
                version: 2,
                lock_time: PackedLockTime(
                    obfuscator.lock_time(commitment_number),
                ),
                input: vec![TxIn {
                    previous_output: OutPoint::default(),
                    script_sig: none!(),
                    sequence: Sequence(obfuscator.sequence(commitment_number)),
                    witness: empty!(),
                }],
                output: vec![],
            };
            assert_eq!(obfuscator.recover(&tx), Some(commitment_number));
        }
    }

    #[test]
    fn non_commitment_tx_rejected() {
        let obfuscator = obfuscator_for_tests();
        let tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: none!(),
                sequence: Sequence(0xFFFF_FFFF),
                witness: empty!(),
            }],
            output: vec![],
        };
        assert_eq!(obfuscator.recover(&tx), None);
    }
}
