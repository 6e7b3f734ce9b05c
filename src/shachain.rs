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

//! Hash-tree revocation secrets ("shachain").
//!
//! The producer side derives one 32-byte secret per commitment height
//! deterministically from a seed. The store side remembers the secrets a
//! peer has revealed in at most 49 buckets and can re-derive every older
//! secret from them, rejecting any secret inconsistent with what was
//! revealed before.

use amplify::{Slice32, Wrapper};
use bitcoin::hashes::{sha256, Hash};

/// Number of index bits of the derivation tree.
pub const CHAIN_BITS: u8 = 48;

/// Root index the producer starts from; per-height indexes count down.
pub const START_INDEX: u64 = (1u64 << CHAIN_BITS) - 1;

/// Maximum number of buckets the receiver-side store needs: one per
/// possible number of trailing one-bits plus the seed-level node.
pub const MAX_STORE_ENTRIES: usize = CHAIN_BITS as usize + 1;

/// Error indicating that a revealed secret does not belong to the chain of
/// the previously revealed ones.
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error,
)]
#[display(doc_comments)]
pub enum Error {
    /// the provided per-commitment secret for height {height} can't
    /// reproduce previously revealed secrets; the peer is misbehaving
    InvalidSecret { height: u64 },

    /// no secret for height {height} was revealed yet
    UnknownHeight { height: u64 },
}

fn derive(mut secret: [u8; 32], bits: u8, index: u64) -> [u8; 32] {
    for bit in (0..bits).rev() {
        if index & (1 << bit) != 0 {
            secret[(bit / 8) as usize] ^= 1 << (bit & 7);
            secret = sha256::Hash::hash(&secret).into_inner();
        }
    }
    secret
}

#[inline]
fn height_to_index(height: u64) -> u64 {
    START_INDEX - (height & START_INDEX)
}

// The bucket a secret lands in is the number of trailing zero bits of its
// index: that secret can re-derive exactly the secrets of all indexes
// sharing its prefix.
fn bucket(index: u64) -> u8 {
    for bit in 0..CHAIN_BITS {
        if index & (1 << bit) != 0 {
            return bit;
        }
    }
    CHAIN_BITS
}

/// Producer side of the revocation chain: derives the per-commitment secret
/// for any height from a channel-unique seed.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct RevocationProducer {
    seed: Slice32,
}

impl RevocationProducer {
    #[inline]
    pub fn new(seed: Slice32) -> Self {
        RevocationProducer { seed }
    }

    /// The seed the chain is derived from.
    #[inline]
    pub fn seed(&self) -> Slice32 {
        self.seed
    }

    /// Per-commitment secret for the given commitment height.
    pub fn at_height(&self, height: u64) -> Slice32 {
        let index = height_to_index(height);
        Slice32::from_inner(derive(
            self.seed.into_inner(),
            CHAIN_BITS,
            index,
        ))
    }
}

/// Receiver side of the revocation chain: compact storage of all secrets the
/// remote node has revealed so far.
#[derive(Clone, PartialEq, Eq, Debug, Default, StrictEncode, StrictDecode)]
pub struct RevocationStore {
    /// `(secret, index)` per occupied bucket
    entries: Vec<(Slice32, u64)>,

    /// Height of the latest accepted secret, if any
    tip_height: Option<u64>,
}

impl RevocationStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Height of the most recently revealed secret.
    #[inline]
    pub fn tip_height(&self) -> Option<u64> {
        self.tip_height
    }

    /// Accepts the secret revealed for the given height.
    ///
    /// Secrets must be added in increasing height order. Each new secret is
    /// checked to re-derive every older secret it supersedes; on mismatch
    /// nothing is stored and [`Error::InvalidSecret`] is returned.
    pub fn add_next(
        &mut self,
        height: u64,
        secret: Slice32,
    ) -> Result<(), Error> {
        let index = height_to_index(height);
        let pos = bucket(index);

        for entry in &self.entries {
            let (old_secret, old_index) = *entry;
            if bucket(old_index) >= pos {
                continue;
            }
            let rederived =
                derive(secret.into_inner(), pos, old_index & ((1 << pos) - 1));
            if rederived != old_secret.into_inner() {
                return Err(Error::InvalidSecret { height });
            }
        }

        // The new secret supersedes every bucket below its own
        self.entries.retain(|(_, idx)| bucket(*idx) > pos);
        self.entries.push((secret, index));
        self.entries.sort_by_key(|(_, idx)| bucket(*idx));
        self.tip_height = Some(height);
        Ok(())
    }

    /// Looks up (re-deriving if necessary) the secret revealed for a past
    /// height.
    pub fn secret_at(&self, height: u64) -> Result<Slice32, Error> {
        let index = height_to_index(height);
        for (secret, stored_index) in &self.entries {
            let pos = bucket(*stored_index);
            let prefix_mask = !((1u64 << pos) - 1) & START_INDEX;
            if index & prefix_mask == *stored_index & prefix_mask
                && index >= *stored_index
            {
                return Ok(Slice32::from_inner(derive(
                    secret.into_inner(),
                    pos,
                    index & ((1 << pos) - 1),
                )));
            }
        }
        Err(Error::UnknownHeight { height })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn producer() -> RevocationProducer {
        RevocationProducer::new(Slice32::from_inner([0x33u8; 32]))
    }

    #[test]
    fn producer_is_deterministic() {
        let a = producer();
        let b = producer();
        for height in 0..16 {
            assert_eq!(a.at_height(height), b.at_height(height));
        }
        assert_ne!(a.at_height(0), a.at_height(1));
    }

    #[test]
    fn store_accepts_chain_in_order() {
        let producer = producer();
        let mut store = RevocationStore::new();
        for height in 0..=64 {
            store
                .add_next(height, producer.at_height(height))
                .expect("valid chain secret");
            assert!(store.entries.len() <= MAX_STORE_ENTRIES);
        }
        assert_eq!(store.tip_height(), Some(64));
        // Every past secret remains recoverable
        for height in 0..=64 {
            assert_eq!(
                store.secret_at(height).unwrap(),
                producer.at_height(height)
            );
        }
    }

    #[test]
    fn store_rejects_corrupted_secret() {
        let producer = producer();
        let mut store = RevocationStore::new();
        for height in 0..=8 {
            store
                .add_next(height, producer.at_height(height))
                .expect("valid chain secret");
        }
        // Height 9 must re-derive the height-8 secret, so corruption there
        // is detectable
        let mut wrong = producer.at_height(9).into_inner();
        wrong[0] ^= 0x01;
        assert_eq!(
            store.add_next(9, Slice32::from_inner(wrong)),
            Err(Error::InvalidSecret { height: 9 })
        );
        // Store state is untouched by the failed insert
        assert_eq!(store.tip_height(), Some(8));
        assert_eq!(store.secret_at(8).unwrap(), producer.at_height(8));
    }

    #[test]
    fn unknown_height_lookup_fails() {
        let producer = producer();
        let mut store = RevocationStore::new();
        store.add_next(0, producer.at_height(0)).unwrap();
        assert_eq!(
            store.secret_at(5),
            Err(Error::UnknownHeight { height: 5 })
        );
    }

    #[test]
    fn store_stays_compact() {
        let producer = producer();
        let mut store = RevocationStore::new();
        for height in 0..5_000u64 {
            store
                .add_next(height, producer.at_height(height))
                .expect("valid chain secret");
        }
        assert!(store.entries.len() <= MAX_STORE_ENTRIES);
    }
}
