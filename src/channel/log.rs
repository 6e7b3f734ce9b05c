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

//! The HTLC update log: an append-only sequence of payment descriptors with
//! sparse indexes by log position and by HTLC counter.

use std::collections::BTreeMap;

use bitcoin::hashes::sha256;
use bitcoin_scripts::hlc::{HashLock, HashPreimage};

use super::ChainSide;
use crate::wire::OnionBlob;

/// Output index value signalling that an HTLC is trimmed to dust on the
/// respective commitment transaction.
pub const DUST_OUTPUT_INDEX: i32 = -1;

/// Kind and kind-specific payload of an update log entry.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub enum UpdateKind {
    /// Offer of a new HTLC
    Add {
        payment_hash: HashLock,
        cltv_expiry: u32,
        onion_blob: OnionBlob,
    },

    /// Settlement of the parent HTLC by pre-image
    Settle { preimage: HashPreimage },

    /// Removal of the parent HTLC with an opaque failure reason
    Fail { reason: Vec<u8> },

    /// Removal of the parent HTLC whose onion could not be parsed
    MalformedFail {
        failure_code: u16,
        sha_onion_blob: sha256::Hash,
    },
}

impl UpdateKind {
    #[inline]
    pub fn is_add(&self) -> bool {
        matches!(self, UpdateKind::Add { .. })
    }
}

/// Entry of the HTLC update log.
///
/// The four `*_commit_height_*` fields track on which commitment of each
/// chain the event was first included; zero means "not committed there
/// yet", and a non-zero value is never rewritten.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct PaymentDescriptor {
    /// Position in the owning log; monotone over all entries
    pub log_index: u64,

    /// HTLC counter; monotone over Add entries of the owning log only
    pub htlc_index: u64,

    /// For Settle/Fail/MalformedFail: the HTLC index of the parent Add in
    /// the opposite log
    pub parent_index: u64,

    /// HTLC amount; copied from the parent Add for removal entries so
    /// balance deltas need no second lookup
    pub amount_msat: u64,

    pub kind: UpdateKind,

    pub add_commit_height_local: u64,
    pub add_commit_height_remote: u64,
    pub remove_commit_height_local: u64,
    pub remove_commit_height_remote: u64,

    /// Cached output index on the local commitment tx; −1 signals dust
    pub output_index_local: i32,

    /// Cached output index on the remote commitment tx; −1 signals dust
    pub output_index_remote: i32,

    /// Whether this Add has already been surfaced for upstream forwarding
    pub is_forwarded: bool,
}

impl PaymentDescriptor {
    /// Payment hash of an Add entry.
    pub fn payment_hash(&self) -> Option<HashLock> {
        match self.kind {
            UpdateKind::Add { payment_hash, .. } => Some(payment_hash),
            _ => None,
        }
    }

    /// CLTV expiry of an Add entry.
    pub fn cltv_expiry(&self) -> Option<u32> {
        match self.kind {
            UpdateKind::Add { cltv_expiry, .. } => Some(cltv_expiry),
            _ => None,
        }
    }

    /// Whether the entry removes a parent Add.
    #[inline]
    pub fn is_removal(&self) -> bool {
        !self.kind.is_add()
    }

    /// Height at which the Add was first committed on the given chain.
    #[inline]
    pub fn add_height(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::Local => self.add_commit_height_local,
            ChainSide::Remote => self.add_commit_height_remote,
        }
    }

    /// Height at which the removal was first committed on the given chain.
    #[inline]
    pub fn remove_height(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::Local => self.remove_commit_height_local,
            ChainSide::Remote => self.remove_commit_height_remote,
        }
    }

    /// Records the Add inclusion height; a non-zero height is never
    /// rewritten.
    pub fn set_add_height(&mut self, side: ChainSide, height: u64) {
        let slot = match side {
            ChainSide::Local => &mut self.add_commit_height_local,
            ChainSide::Remote => &mut self.add_commit_height_remote,
        };
        if *slot == 0 {
            *slot = height;
        }
    }

    /// Records the removal inclusion height; a non-zero height is never
    /// rewritten.
    pub fn set_remove_height(&mut self, side: ChainSide, height: u64) {
        let slot = match side {
            ChainSide::Local => &mut self.remove_commit_height_local,
            ChainSide::Remote => &mut self.remove_commit_height_remote,
        };
        if *slot == 0 {
            *slot = height;
        }
    }

    /// Records the cached output index on the given chain's commitment.
    pub fn set_output_index(&mut self, side: ChainSide, index: i32) {
        match side {
            ChainSide::Local => self.output_index_local = index,
            ChainSide::Remote => self.output_index_remote = index,
        }
    }
}

/// Append-only ordered update log with sparse lookup indexes.
#[derive(Clone, PartialEq, Eq, Debug, Default, StrictEncode, StrictDecode)]
pub struct UpdateLog {
    /// Next log index to assign
    log_counter: u64,

    /// Next HTLC index to assign (Adds only)
    htlc_counter: u64,

    /// `log_index → entry`
    entries: BTreeMap<u64, PaymentDescriptor>,

    /// `htlc_index → log_index`, Add entries only
    htlc_index: BTreeMap<u64, u64>,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next log index to be assigned.
    #[inline]
    pub fn log_counter(&self) -> u64 {
        self.log_counter
    }

    /// Next HTLC index to be assigned.
    #[inline]
    pub fn htlc_counter(&self) -> u64 {
        self.htlc_counter
    }

    /// Appends an Add entry, assigning it both a log index and an HTLC
    /// index. Returns the assigned HTLC index.
    pub fn append_add(
        &mut self,
        amount_msat: u64,
        payment_hash: HashLock,
        cltv_expiry: u32,
        onion_blob: OnionBlob,
    ) -> u64 {
        let log_index = self.log_counter;
        let htlc_index = self.htlc_counter;
        self.log_counter += 1;
        self.htlc_counter += 1;
        self.entries.insert(log_index, PaymentDescriptor {
            log_index,
            htlc_index,
            parent_index: 0,
            amount_msat,
            kind: UpdateKind::Add {
                payment_hash,
                cltv_expiry,
                onion_blob,
            },
            add_commit_height_local: 0,
            add_commit_height_remote: 0,
            remove_commit_height_local: 0,
            remove_commit_height_remote: 0,
            output_index_local: DUST_OUTPUT_INDEX,
            output_index_remote: DUST_OUTPUT_INDEX,
            is_forwarded: false,
        });
        self.htlc_index.insert(htlc_index, log_index);
        htlc_index
    }

    /// Appends a removal entry (Settle, Fail or MalformedFail) referencing
    /// a parent Add living in the *opposite* log. Returns the assigned log
    /// index.
    pub fn append_removal(
        &mut self,
        parent_index: u64,
        amount_msat: u64,
        kind: UpdateKind,
    ) -> u64 {
        debug_assert!(!kind.is_add(), "removal entry must not be an Add");
        let log_index = self.log_counter;
        self.log_counter += 1;
        self.entries.insert(log_index, PaymentDescriptor {
            log_index,
            htlc_index: 0,
            parent_index,
            amount_msat,
            kind,
            add_commit_height_local: 0,
            add_commit_height_remote: 0,
            remove_commit_height_local: 0,
            remove_commit_height_remote: 0,
            output_index_local: DUST_OUTPUT_INDEX,
            output_index_remote: DUST_OUTPUT_INDEX,
            is_forwarded: false,
        });
        log_index
    }

    /// Restores a persisted entry, bumping the counters past it.
    pub fn restore(&mut self, entry: PaymentDescriptor) {
        self.log_counter = self.log_counter.max(entry.log_index + 1);
        if entry.kind.is_add() {
            self.htlc_counter = self.htlc_counter.max(entry.htlc_index + 1);
            self.htlc_index.insert(entry.htlc_index, entry.log_index);
        }
        self.entries.insert(entry.log_index, entry);
    }

    /// Looks up an Add entry by its HTLC index.
    pub fn htlc(&self, htlc_index: u64) -> Option<&PaymentDescriptor> {
        self.htlc_index
            .get(&htlc_index)
            .and_then(|log_index| self.entries.get(log_index))
    }

    /// Mutable access to an Add entry by its HTLC index.
    pub fn htlc_mut(
        &mut self,
        htlc_index: u64,
    ) -> Option<&mut PaymentDescriptor> {
        let log_index = *self.htlc_index.get(&htlc_index)?;
        self.entries.get_mut(&log_index)
    }

    /// HTLC counter value as of a log index bound: one past the highest
    /// HTLC index of the Adds below the bound.
    pub fn htlc_counter_at(&self, log_bound: u64) -> u64 {
        self.entries
            .range(..log_bound)
            .filter(|(_, entry)| entry.kind.is_add())
            .map(|(_, entry)| entry.htlc_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Whether a removal entry (committed or not) already references the
    /// given HTLC index.
    pub fn has_removal_for(&self, htlc_index: u64) -> bool {
        self.entries
            .values()
            .any(|entry| entry.is_removal() && entry.parent_index == htlc_index)
    }

    /// Iterates entries in log order.
    pub fn iter(&self) -> impl Iterator<Item = &PaymentDescriptor> {
        self.entries.values()
    }

    /// Iterates entries in log order, mutably.
    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut PaymentDescriptor> {
        self.entries.values_mut()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes a removal entry after compaction.
    pub fn remove_entry(&mut self, log_index: u64) {
        self.entries.remove(&log_index);
    }

    /// Removes an Add entry together with its HTLC index mapping after
    /// compaction.
    pub fn remove_htlc(&mut self, htlc_index: u64) {
        if let Some(log_index) = self.htlc_index.remove(&htlc_index) {
            self.entries.remove(&log_index);
        }
    }
}

#[cfg(test)]
mod test {
    use amplify::{Slice32, Wrapper};

    use super::*;

    fn hash(tag: u8) -> HashLock {
        HashLock::from_inner(Slice32::from_inner([tag; 32]))
    }

    #[test]
    fn counters_are_monotone() {
        let mut log = UpdateLog::new();
        let h0 = log.append_add(1_000, hash(1), 100, OnionBlob::default());
        let h1 = log.append_add(2_000, hash(2), 100, OnionBlob::default());
        assert_eq!((h0, h1), (0, 1));
        assert_eq!(log.log_counter(), 2);

        // Removals advance the log counter but not the HTLC counter
        let removal = log.append_removal(h0, 1_000, UpdateKind::Fail {
            reason: vec![],
        });
        assert_eq!(removal, 2);
        assert_eq!(log.htlc_counter(), 2);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn htlc_lookup() {
        let mut log = UpdateLog::new();
        let index = log.append_add(5_000, hash(7), 200, OnionBlob::default());
        assert_eq!(log.htlc(index).unwrap().amount_msat, 5_000);
        assert_eq!(log.htlc(index).unwrap().payment_hash(), Some(hash(7)));
        assert!(log.htlc(index + 1).is_none());
    }

    #[test]
    fn compaction_removes_pairs() {
        let mut log = UpdateLog::new();
        let htlc = log.append_add(5_000, hash(7), 200, OnionBlob::default());
        let mut other = UpdateLog::new();
        let removal = other.append_removal(htlc, 5_000, UpdateKind::Settle {
            preimage: HashPreimage::from_inner(Slice32::from_inner([7; 32])),
        });
        other.remove_entry(removal);
        log.remove_htlc(htlc);
        assert!(log.is_empty());
        assert!(other.is_empty());
        // Counters never rewind
        assert_eq!(log.log_counter(), 1);
        assert_eq!(log.htlc_counter(), 1);
    }

    #[test]
    fn restore_bumps_counters() {
        let mut log = UpdateLog::new();
        let mut entry_log = UpdateLog::new();
        let htlc =
            entry_log.append_add(9_000, hash(3), 150, OnionBlob::default());
        let entry = entry_log.htlc(htlc).unwrap().clone();
        log.restore(entry);
        assert_eq!(log.log_counter(), 1);
        assert_eq!(log.htlc_counter(), 1);
        assert!(log.htlc(0).is_some());
    }
}
