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

//! Persistent channel state over a single transactional key-value database.
//!
//! Top-level buckets are sled trees; per-channel data lives under tagged
//! key prefixes inside the `open-channels` tree. Every mutation is one
//! all-or-nothing write transaction; integers becoming keys are encoded
//! big-endian to preserve ordering.

pub mod migrations;

use std::path::Path;

use amplify::{Slice32, Wrapper};
use secp256k1::PublicKey;
use sled::Transactional;
use strict_encoding::{
    strict_deserialize, strict_serialize, StrictDecode, StrictEncode,
};

use crate::channel::{
    ChannelConfig, ChannelStatus, Commitment, CommitDiff, PaymentDescriptor,
};
use crate::shachain::RevocationStore;
use crate::wire::{ChannelId, ShortChannelId};

pub(crate) const TREE_OPEN_CHANNELS: &str = "open-channels";
pub(crate) const TREE_CLOSED_CHANNELS: &str = "closed-channels";
pub(crate) const TREE_INVOICES: &str = "invoices";
pub(crate) const TREE_NODE_INFO: &str = "node-info";
pub(crate) const TREE_GRAPH_NODE: &str = "graph-node";
pub(crate) const TREE_GRAPH_EDGE: &str = "graph-edge";
pub(crate) const TREE_GRAPH_META: &str = "graph-meta";
pub(crate) const TREE_META: &str = "meta";

// Key prefixes within the open-channels tree
const PREFIX_CHAN_DATA: u8 = 0x01;
const PREFIX_IS_PENDING: u8 = 0x02;
const PREFIX_CONF_INFO: u8 = 0x03;
const PREFIX_COMMIT_DIFF: u8 = 0x04;
const PREFIX_REVOCATION_LOG: u8 = 0x05;
const PREFIX_CHAN_INDEX: u8 = 0x06;

/// Errors of the persistence layer. Propagated without interpretation by
/// everything above it.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// database failure: {0}
    Io(String),

    /// channel {0} is not present in the store
    ChannelNotFound(ChannelId),

    /// no revocation log entry for channel {channel_id} at height {height}
    RevocationLogNotFound {
        channel_id: ChannelId,
        height: u64,
    },

    /// store metadata is missing; the database was not initialized
    MetaNotFound,

    /// database schema version {found} is newer than the supported
    /// version {supported}
    VersionTooNew { found: u16, supported: u16 },

    /// failure decoding persisted data: {0}
    Encoding(String),
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<()>> for Error {
    fn from(err: sled::transaction::TransactionError<()>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(()) => {
                Error::Io("transaction aborted".to_string())
            }
            sled::transaction::TransactionError::Storage(e) => Error::Io(e.to_string()),
        }
    }
}

impl From<strict_encoding::Error> for Error {
    fn from(err: strict_encoding::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

/// Kind of an on-chain channel closure.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display,
    StrictEncode, StrictDecode,
)]
#[repr(u8)]
pub enum ClosureKind {
    /// Negotiated cooperative close
    #[display("cooperative")]
    Cooperative = 0,

    /// We broadcast our commitment
    #[display("local-force")]
    LocalForce = 1,

    /// The remote party broadcast its commitment
    #[display("remote-force")]
    RemoteForce = 2,

    /// The remote party broadcast a revoked commitment
    #[display("breach")]
    Breach = 3,
}

/// Summary of a closed channel kept in the `closed-channels` bucket.
///
/// Full closure is an explicit flag field rewritten by whole-value puts.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ClosedChannelSummary {
    pub channel_id: ChannelId,
    pub remote_node: PublicKey,
    pub close_txid: bitcoin::Txid,
    pub close_height: u32,
    pub settled_balance_sat: u64,
    pub closure_kind: ClosureKind,
    pub is_fully_closed: bool,
}

/// Full persisted state of one channel: everything needed to restore the
/// commitment machine after a restart.
#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelRecord {
    pub chain_hash: Slice32,
    pub funding_txid: bitcoin::Txid,
    pub funding_output_index: u16,
    pub capacity_sat: u64,
    pub is_initiator: bool,
    pub local_config: ChannelConfig,
    pub remote_config: ChannelConfig,
    pub remote_node: PublicKey,
    pub short_channel_id: Option<ShortChannelId>,
    pub status: ChannelStatus,
    pub revocation_seed: Slice32,
    pub revocation_store: RevocationStore,
    pub current_remote_point: PublicKey,
    pub next_remote_point: Option<PublicKey>,
    pub pending_fee_update: Option<u32>,
    pub pending_ack_fee_update: Option<u32>,
    pub total_msat_sent: u64,
    pub total_msat_received: u64,
    pub local_commitment: Commitment,
    pub remote_commitment: Commitment,
    pub local_log: Vec<PaymentDescriptor>,
    pub remote_log: Vec<PaymentDescriptor>,
}

impl ChannelRecord {
    /// Channel id derived from the funding outpoint.
    pub fn channel_id(&self) -> ChannelId {
        ChannelId::with(bitcoin::OutPoint::new(
            self.funding_txid,
            self.funding_output_index as u32,
        ))
    }
}

/// The transactional channel database.
pub struct ChannelStore {
    db: sled::Db,
    open_channels: sled::Tree,
    closed_channels: sled::Tree,
    meta: sled::Tree,
}

impl ChannelStore {
    /// Opens (creating if needed) the database at the given path and runs
    /// any outstanding schema migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<ChannelStore, Error> {
        let db = sled::open(path)?;
        Self::with(db)
    }

    /// Opens an ephemeral database backed by a temporary file; used in
    /// tests and for dry runs.
    pub fn open_temporary() -> Result<ChannelStore, Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with(db)
    }

    fn with(db: sled::Db) -> Result<ChannelStore, Error> {
        migrations::run_migrations(&db)?;
        let open_channels = db.open_tree(TREE_OPEN_CHANNELS)?;
        let closed_channels = db.open_tree(TREE_CLOSED_CHANNELS)?;
        let meta = db.open_tree(TREE_META)?;
        Ok(ChannelStore {
            db,
            open_channels,
            closed_channels,
            meta,
        })
    }

    /// Schema version of the opened database.
    pub fn schema_version(&self) -> Result<u16, Error> {
        let raw = self
            .meta
            .get(migrations::META_VERSION_KEY)?
            .ok_or(Error::MetaNotFound)?;
        let mut buf = [0u8; 2];
        buf.copy_from_slice(&raw);
        Ok(u16::from_be_bytes(buf))
    }

    pub(crate) fn tree(&self, name: &str) -> Result<sled::Tree, Error> {
        Ok(self.db.open_tree(name)?)
    }

    // Open-channel records
    // ====================

    /// Persists a newly created channel as pending.
    pub fn create_channel(&self, record: &ChannelRecord) -> Result<(), Error> {
        let channel_id = record.channel_id();
        let data_key = node_scoped_key(
            PREFIX_CHAN_DATA,
            &record.remote_node,
            channel_id,
        );
        let pending_key = node_scoped_key(
            PREFIX_IS_PENDING,
            &record.remote_node,
            channel_id,
        );
        let index_key = chan_scoped_key(PREFIX_CHAN_INDEX, channel_id);
        let value = strict_serialize(record)?;
        let node_bytes = record.remote_node.serialize().to_vec();
        self.open_channels.transaction(move |tx| {
            tx.insert(data_key.as_slice(), value.clone())?;
            tx.insert(pending_key.as_slice(), &[][..])?;
            tx.insert(index_key.as_slice(), node_bytes.clone())?;
            Ok(())
        })?;
        trace!("created channel {} in the store", channel_id);
        Ok(())
    }

    /// Overwrites the persisted state of a channel.
    pub fn update_channel(&self, record: &ChannelRecord) -> Result<(), Error> {
        let channel_id = record.channel_id();
        let data_key = node_scoped_key(
            PREFIX_CHAN_DATA,
            &record.remote_node,
            channel_id,
        );
        self.open_channels
            .insert(data_key, strict_serialize(record)?)?;
        Ok(())
    }

    /// Loads the persisted state of a channel.
    pub fn fetch_channel(
        &self,
        remote_node: &PublicKey,
        channel_id: ChannelId,
    ) -> Result<ChannelRecord, Error> {
        let data_key =
            node_scoped_key(PREFIX_CHAN_DATA, remote_node, channel_id);
        let raw = self
            .open_channels
            .get(data_key)?
            .ok_or(Error::ChannelNotFound(channel_id))?;
        Ok(strict_deserialize(&raw)?)
    }

    /// All channels opened towards a given node.
    pub fn channels_for_node(
        &self,
        remote_node: &PublicKey,
    ) -> Result<Vec<ChannelRecord>, Error> {
        let mut prefix = vec![PREFIX_CHAN_DATA];
        prefix.extend_from_slice(&remote_node.serialize());
        let mut records = vec![];
        for item in self.open_channels.scan_prefix(prefix) {
            let (_, raw) = item?;
            records.push(strict_deserialize(&raw)?);
        }
        Ok(records)
    }

    /// Walks all open channel records; the callback may terminate the walk
    /// by returning `false`.
    pub fn for_each_channel(
        &self,
        mut callback: impl FnMut(&ChannelRecord) -> bool,
    ) -> Result<(), Error> {
        for item in self.open_channels.scan_prefix([PREFIX_CHAN_DATA]) {
            let (_, raw) = item?;
            let record: ChannelRecord = strict_deserialize(&raw)?;
            if !callback(&record) {
                break;
            }
        }
        Ok(())
    }

    /// Whether the channel still awaits funding confirmation.
    pub fn is_channel_pending(
        &self,
        remote_node: &PublicKey,
        channel_id: ChannelId,
    ) -> Result<bool, Error> {
        let pending_key =
            node_scoped_key(PREFIX_IS_PENDING, remote_node, channel_id);
        Ok(self.open_channels.contains_key(pending_key)?)
    }

    /// Marks the channel as confirmed and records its short channel id.
    /// Idempotent.
    pub fn mark_channel_open(
        &self,
        remote_node: &PublicKey,
        channel_id: ChannelId,
        short_channel_id: ShortChannelId,
    ) -> Result<(), Error> {
        let pending_key =
            node_scoped_key(PREFIX_IS_PENDING, remote_node, channel_id);
        let conf_key =
            node_scoped_key(PREFIX_CONF_INFO, remote_node, channel_id);
        let scid = short_channel_id.to_u64().to_be_bytes().to_vec();
        self.open_channels.transaction(move |tx| {
            tx.remove(pending_key.as_slice())?;
            tx.insert(conf_key.as_slice(), scid.clone())?;
            Ok(())
        })?;
        Ok(())
    }

    /// Short channel id recorded at funding confirmation, if any.
    pub fn fetch_short_channel_id(
        &self,
        remote_node: &PublicKey,
        channel_id: ChannelId,
    ) -> Result<Option<ShortChannelId>, Error> {
        let conf_key =
            node_scoped_key(PREFIX_CONF_INFO, remote_node, channel_id);
        Ok(self.open_channels.get(conf_key)?.map(|raw| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw);
            ShortChannelId::from_u64(u64::from_be_bytes(buf))
        }))
    }

    // Commitment diffs and the revocation log
    // =======================================

    /// Persists the diff of a signed-but-unacknowledged remote commitment.
    pub fn put_commit_diff(
        &self,
        channel_id: ChannelId,
        diff: &CommitDiff,
    ) -> Result<(), Error> {
        let key = chan_scoped_key(PREFIX_COMMIT_DIFF, channel_id);
        self.open_channels.insert(key, strict_serialize(diff)?)?;
        Ok(())
    }

    /// Loads the pending commitment diff, if one exists.
    pub fn fetch_commit_diff(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<CommitDiff>, Error> {
        let key = chan_scoped_key(PREFIX_COMMIT_DIFF, channel_id);
        self.open_channels
            .get(key)?
            .map(|raw| strict_deserialize(&raw).map_err(Error::from))
            .transpose()
    }

    /// Removes the pending commitment diff after its acknowledgement.
    pub fn delete_commit_diff(
        &self,
        channel_id: ChannelId,
    ) -> Result<(), Error> {
        let key = chan_scoped_key(PREFIX_COMMIT_DIFF, channel_id);
        self.open_channels.remove(key)?;
        Ok(())
    }

    /// Archives a revoked remote commitment, keyed by its height in
    /// big-endian so the log stays height-ordered.
    pub fn append_revocation_log(
        &self,
        channel_id: ChannelId,
        commitment: &Commitment,
    ) -> Result<(), Error> {
        let mut key = chan_scoped_key(PREFIX_REVOCATION_LOG, channel_id);
        key.extend_from_slice(&commitment.height.to_be_bytes());
        self.open_channels
            .insert(key, strict_serialize(commitment)?)?;
        Ok(())
    }

    /// Loads the archived revoked commitment of a given height.
    pub fn fetch_revocation_log(
        &self,
        channel_id: ChannelId,
        height: u64,
    ) -> Result<Commitment, Error> {
        let mut key = chan_scoped_key(PREFIX_REVOCATION_LOG, channel_id);
        key.extend_from_slice(&height.to_be_bytes());
        let raw = self.open_channels.get(key)?.ok_or(
            Error::RevocationLogNotFound {
                channel_id,
                height,
            },
        )?;
        Ok(strict_deserialize(&raw)?)
    }

    // Closed channels
    // ===============

    /// Moves a channel into the closed bucket, dropping its open-channel
    /// entries in the same transaction.
    pub fn mark_channel_closed(
        &self,
        summary: &ClosedChannelSummary,
    ) -> Result<(), Error> {
        let channel_id = summary.channel_id;
        let data_key = node_scoped_key(
            PREFIX_CHAN_DATA,
            &summary.remote_node,
            channel_id,
        );
        let pending_key = node_scoped_key(
            PREFIX_IS_PENDING,
            &summary.remote_node,
            channel_id,
        );
        let conf_key = node_scoped_key(
            PREFIX_CONF_INFO,
            &summary.remote_node,
            channel_id,
        );
        let diff_key = chan_scoped_key(PREFIX_COMMIT_DIFF, channel_id);
        let index_key = chan_scoped_key(PREFIX_CHAN_INDEX, channel_id);
        let value = strict_serialize(summary)?;

        (&self.open_channels, &self.closed_channels).transaction(
            move |(open, closed)| {
                open.remove(data_key.as_slice())?;
                open.remove(pending_key.as_slice())?;
                open.remove(conf_key.as_slice())?;
                open.remove(diff_key.as_slice())?;
                open.remove(index_key.as_slice())?;
                closed.insert(
                    channel_id.as_inner().as_inner().to_vec(),
                    value.clone(),
                )?;
                Ok(())
            },
        )?;
        info!("channel {} moved to the closed bucket", channel_id);
        Ok(())
    }

    /// Loads the summary of a closed channel.
    pub fn fetch_closed_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<ClosedChannelSummary, Error> {
        let raw = self
            .closed_channels
            .get(channel_id.as_inner().as_inner())?
            .ok_or(Error::ChannelNotFound(channel_id))?;
        Ok(strict_deserialize(&raw)?)
    }

    /// Marks a closed channel as fully resolved on chain by rewriting the
    /// whole summary value with the flag set.
    pub fn mark_fully_closed(
        &self,
        channel_id: ChannelId,
    ) -> Result<(), Error> {
        let mut summary = self.fetch_closed_channel(channel_id)?;
        summary.is_fully_closed = true;
        self.closed_channels.insert(
            channel_id.as_inner().as_inner(),
            strict_serialize(&summary)?,
        )?;
        Ok(())
    }
}

fn node_scoped_key(
    prefix: u8,
    node: &PublicKey,
    channel_id: ChannelId,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 33 + 32);
    key.push(prefix);
    key.extend_from_slice(&node.serialize());
    key.extend_from_slice(channel_id.as_inner().as_inner());
    key
}

fn chan_scoped_key(prefix: u8, channel_id: ChannelId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32);
    key.push(prefix);
    key.extend_from_slice(channel_id.as_inner().as_inner());
    key
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use amplify::DumbDefault;
    use bitcoin::Txid;

    use super::*;

    fn test_record(vout: u16) -> ChannelRecord {
        let commitment = Commitment {
            height: 0,
            our_message_index: 0,
            their_message_index: 0,
            our_htlc_index: 0,
            their_htlc_index: 0,
            our_balance_msat: 4_000_000_000,
            their_balance_msat: 6_000_000_000,
            fee_per_kw: 253,
            fee_sat: 183,
            dust_limit_sat: 354,
            tx: bitcoin::Transaction {
                version: 2,
                lock_time: bitcoin::PackedLockTime(0),
                input: vec![],
                output: vec![],
            },
            their_signature: None,
            htlc_signatures: vec![],
            per_commitment_point: dumb_pubkey!(),
            htlcs: vec![],
        };
        ChannelRecord {
            chain_hash: Slice32::from_inner([7u8; 32]),
            funding_txid: Txid::from_str(
                "fd2105607605d2302994ffea703b09f66b6351816ee737a93e42a841ea20bbad",
            )
            .unwrap(),
            funding_output_index: vout,
            capacity_sat: 10_000_000,
            is_initiator: true,
            local_config: ChannelConfig::dumb_default(),
            remote_config: ChannelConfig::dumb_default(),
            remote_node: dumb_pubkey!(),
            short_channel_id: None,
            status: ChannelStatus::Active,
            revocation_seed: Slice32::from_inner([3u8; 32]),
            revocation_store: RevocationStore::new(),
            current_remote_point: dumb_pubkey!(),
            next_remote_point: None,
            pending_fee_update: None,
            pending_ack_fee_update: None,
            total_msat_sent: 0,
            total_msat_received: 0,
            local_commitment: commitment.clone(),
            remote_commitment: commitment,
            local_log: vec![],
            remote_log: vec![],
        }
    }

    #[test]
    fn channel_record_roundtrip() {
        let store = ChannelStore::open_temporary().unwrap();
        let record = test_record(0);
        store.create_channel(&record).unwrap();
        let restored = store
            .fetch_channel(&record.remote_node, record.channel_id())
            .unwrap();
        assert_eq!(restored, record);
        assert!(store
            .is_channel_pending(&record.remote_node, record.channel_id())
            .unwrap());
    }

    #[test]
    fn mark_channel_open_is_idempotent() {
        let store = ChannelStore::open_temporary().unwrap();
        let record = test_record(0);
        store.create_channel(&record).unwrap();
        let scid = ShortChannelId::new(500_000, 42, 1).unwrap();
        store
            .mark_channel_open(&record.remote_node, record.channel_id(), scid)
            .unwrap();
        store
            .mark_channel_open(&record.remote_node, record.channel_id(), scid)
            .unwrap();
        assert!(!store
            .is_channel_pending(&record.remote_node, record.channel_id())
            .unwrap());
        assert_eq!(
            store
                .fetch_short_channel_id(
                    &record.remote_node,
                    record.channel_id()
                )
                .unwrap(),
            Some(scid)
        );
    }

    #[test]
    fn closed_channel_lifecycle() {
        let store = ChannelStore::open_temporary().unwrap();
        let record = test_record(1);
        store.create_channel(&record).unwrap();
        let summary = ClosedChannelSummary {
            channel_id: record.channel_id(),
            remote_node: record.remote_node,
            close_txid: record.funding_txid,
            close_height: 120,
            settled_balance_sat: 4_000_000,
            closure_kind: ClosureKind::Cooperative,
            is_fully_closed: false,
        };
        store.mark_channel_closed(&summary).unwrap();
        assert_eq!(
            store.fetch_channel(&record.remote_node, record.channel_id()),
            Err(Error::ChannelNotFound(record.channel_id()))
        );
        assert!(!store
            .fetch_closed_channel(record.channel_id())
            .unwrap()
            .is_fully_closed);

        store.mark_fully_closed(record.channel_id()).unwrap();
        assert!(store
            .fetch_closed_channel(record.channel_id())
            .unwrap()
            .is_fully_closed);
    }

    #[test]
    fn schema_version_is_recorded() {
        let store = ChannelStore::open_temporary().unwrap();
        assert_eq!(store.schema_version().unwrap(), migrations::DB_VERSION);
    }
}
