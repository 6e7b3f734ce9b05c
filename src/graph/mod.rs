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

//! Versioned directed channel graph used for routing-layer lookups.
//!
//! Nodes are 33-byte identity keys; channels carry immutable
//! [`ChannelEdgeInfo`] plus up to two directional [`ChannelEdgePolicy`]
//! records attached later from authenticated gossip. A prune step deletes
//! edges whose funding outpoint was spent and advances the prune tip.

use amplify::Slice32;
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use strict_encoding::{strict_deserialize, strict_serialize};

use crate::store::{self, ChannelStore};
use crate::wire::ShortChannelId;

// Key prefixes within the graph-edge tree
const PREFIX_EDGE_INDEX: u8 = 0x01;
const PREFIX_CHAN_INDEX: u8 = 0x02;
const PREFIX_POLICY: u8 = 0x03;

const PRUNE_TIP_KEY: &[u8] = b"prune-tip";

/// Errors of graph operations.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// channel edge {0} is not present in the graph
    EdgeNotFound(ShortChannelId),

    /// channel edge {0} already exists in the graph
    EdgeAlreadyExists(ShortChannelId),

    /// node {0} is not present in the graph
    NodeNotFound(PublicKey),

    /// the graph has never been pruned and has no prune tip
    GraphNotFound,

    /// store failure: {0}
    #[from]
    Store(store::Error),
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Store(store::Error::Io(err.to_string()))
    }
}

impl From<sled::transaction::TransactionError<()>> for Error {
    fn from(err: sled::transaction::TransactionError<()>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(()) => {
                Error::Store(store::Error::Io("transaction aborted".to_string()))
            }
            sled::transaction::TransactionError::Storage(e) => {
                Error::Store(store::Error::Io(e.to_string()))
            }
        }
    }
}

impl From<strict_encoding::Error> for Error {
    fn from(err: strict_encoding::Error) -> Self {
        Error::Store(store::Error::Encoding(err.to_string()))
    }
}

/// Announcement-level information about a graph node.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct NodeInfo {
    /// Compressed identity key
    pub node_id: PublicKey,

    /// Timestamp of the latest processed announcement
    pub last_update: u32,

    /// Node alias bytes
    pub alias: Slice32,

    /// Raw feature bits
    pub features: Vec<u8>,

    /// Signature over the announcement, absent for locally-inferred nodes
    pub auth_signature: Option<Signature>,
}

/// The four signatures authenticating a channel announcement.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelAuthProof {
    pub node_signature_1: Signature,
    pub node_signature_2: Signature,
    pub bitcoin_signature_1: Signature,
    pub bitcoin_signature_2: Signature,
}

/// Static, authenticated information about one channel edge. Node identity
/// keys and funding keys are stored in lexicographic order, matching the
/// announcement.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelEdgeInfo {
    pub short_channel_id: ShortChannelId,
    pub chain_hash: Slice32,
    pub node_1: PublicKey,
    pub node_2: PublicKey,
    pub bitcoin_key_1: PublicKey,
    pub bitcoin_key_2: PublicKey,
    pub features: Vec<u8>,
    pub auth_proof: Option<ChannelAuthProof>,
    pub funding_txid: Txid,
    pub funding_output_index: u16,
    pub capacity_sat: u64,
}

impl ChannelEdgeInfo {
    /// The funding outpoint a chain watcher must observe for spends.
    #[inline]
    pub fn funding_outpoint(&self) -> OutPoint {
        OutPoint::new(self.funding_txid, self.funding_output_index as u32)
    }
}

/// Routing policy of one direction of a channel edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelEdgePolicy {
    pub short_channel_id: ShortChannelId,

    /// Timestamp of the update; later updates win
    pub last_update: u32,

    /// `false` for the direction from `node_1`, `true` for the direction
    /// from `node_2`
    pub direction: bool,

    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub signature: Option<Signature>,
}

/// The graph prune tip: the block up to which the graph is synchronized
/// with the chain's UTXO set.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode,
)]
pub struct PruneTip {
    pub block_hash: Slice32,
    pub block_height: u32,
}

/// sled-backed directed channel graph.
pub struct ChannelGraph {
    nodes: sled::Tree,
    edges: sled::Tree,
    meta: sled::Tree,
}

impl ChannelGraph {
    /// Opens the graph buckets of a channel store.
    pub fn with(store: &ChannelStore) -> Result<ChannelGraph, Error> {
        Ok(ChannelGraph {
            nodes: store.tree(store::TREE_GRAPH_NODE)?,
            edges: store.tree(store::TREE_GRAPH_EDGE)?,
            meta: store.tree(store::TREE_GRAPH_META)?,
        })
    }

    // Nodes
    // =====

    /// Inserts or refreshes a node record; stale announcements (by
    /// `last_update`) are ignored so replays converge.
    pub fn add_node(&self, node: &NodeInfo) -> Result<(), Error> {
        if let Some(existing) = self.fetch_node_opt(&node.node_id)? {
            if existing.last_update >= node.last_update {
                return Ok(());
            }
        }
        self.nodes
            .insert(node.node_id.serialize(), strict_serialize(node)?)?;
        Ok(())
    }

    /// Removes a node record.
    pub fn delete_node(&self, node_id: &PublicKey) -> Result<(), Error> {
        self.nodes
            .remove(node_id.serialize())?
            .ok_or(Error::NodeNotFound(*node_id))?;
        Ok(())
    }

    /// Loads a node record.
    pub fn fetch_node(&self, node_id: &PublicKey) -> Result<NodeInfo, Error> {
        self.fetch_node_opt(node_id)?
            .ok_or(Error::NodeNotFound(*node_id))
    }

    fn fetch_node_opt(
        &self,
        node_id: &PublicKey,
    ) -> Result<Option<NodeInfo>, Error> {
        self.nodes
            .get(node_id.serialize())?
            .map(|raw| strict_deserialize(&raw).map_err(Error::from))
            .transpose()
    }

    /// Walks all node records; the callback may terminate the walk by
    /// returning `false`.
    pub fn for_each_node(
        &self,
        mut callback: impl FnMut(&NodeInfo) -> bool,
    ) -> Result<(), Error> {
        for item in self.nodes.iter() {
            let (_, raw) = item?;
            let node: NodeInfo = strict_deserialize(&raw)?;
            if !callback(&node) {
                break;
            }
        }
        Ok(())
    }

    // Edges
    // =====

    /// Inserts the static info of a new channel edge, without any policies
    /// attached yet.
    pub fn add_channel_edge(
        &self,
        edge: &ChannelEdgeInfo,
    ) -> Result<(), Error> {
        let edge_key = edge_index_key(edge.short_channel_id);
        if self.edges.contains_key(&edge_key)? {
            return Err(Error::EdgeAlreadyExists(edge.short_channel_id));
        }
        let chan_key = chan_index_key(edge.funding_outpoint());
        let scid = edge.short_channel_id.to_u64().to_be_bytes().to_vec();
        let value = strict_serialize(edge)?;
        self.edges.transaction(move |tx| {
            tx.insert(edge_key.as_slice(), value.clone())?;
            tx.insert(chan_key.as_slice(), scid.clone())?;
            Ok(())
        })?;
        trace!("added channel edge {}", edge.short_channel_id);
        Ok(())
    }

    /// Attaches or refreshes one directional policy of an edge. Later
    /// `last_update` wins, so gossip replays in any order converge.
    pub fn update_edge_policy(
        &self,
        policy: &ChannelEdgePolicy,
    ) -> Result<(), Error> {
        let edge = self.edge_info(policy.short_channel_id)?;
        let announcing_node = if policy.direction {
            edge.node_2
        } else {
            edge.node_1
        };
        let key = policy_key(&announcing_node, policy.short_channel_id);
        if let Some(raw) = self.edges.get(&key)? {
            let existing: ChannelEdgePolicy = strict_deserialize(&raw)?;
            if existing.last_update >= policy.last_update {
                return Ok(());
            }
        }
        self.edges.insert(key, strict_serialize(policy)?)?;
        Ok(())
    }

    /// Static edge info by short channel id.
    pub fn edge_info(
        &self,
        short_channel_id: ShortChannelId,
    ) -> Result<ChannelEdgeInfo, Error> {
        let raw = self
            .edges
            .get(edge_index_key(short_channel_id))?
            .ok_or(Error::EdgeNotFound(short_channel_id))?;
        Ok(strict_deserialize(&raw)?)
    }

    /// Full channel data by short channel id: the static info plus both
    /// directional policies where present.
    pub fn fetch_channel_by_scid(
        &self,
        short_channel_id: ShortChannelId,
    ) -> Result<
        (
            ChannelEdgeInfo,
            Option<ChannelEdgePolicy>,
            Option<ChannelEdgePolicy>,
        ),
        Error,
    > {
        let edge = self.edge_info(short_channel_id)?;
        let policy_1 = self.policy(&edge.node_1, short_channel_id)?;
        let policy_2 = self.policy(&edge.node_2, short_channel_id)?;
        Ok((edge, policy_1, policy_2))
    }

    /// Full channel data by funding outpoint.
    pub fn fetch_channel_by_outpoint(
        &self,
        outpoint: OutPoint,
    ) -> Result<
        (
            ChannelEdgeInfo,
            Option<ChannelEdgePolicy>,
            Option<ChannelEdgePolicy>,
        ),
        Error,
    > {
        let scid = self
            .edges
            .get(chan_index_key(outpoint))?
            .ok_or(Error::GraphNotFound)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&scid);
        self.fetch_channel_by_scid(ShortChannelId::from_u64(
            u64::from_be_bytes(buf),
        ))
    }

    /// Whether an edge is known, together with the two direction update
    /// timestamps (zero when the policy is absent).
    pub fn has_channel_edge(
        &self,
        short_channel_id: ShortChannelId,
    ) -> Result<(bool, u32, u32), Error> {
        match self.edge_info(short_channel_id) {
            Err(Error::EdgeNotFound(_)) => Ok((false, 0, 0)),
            Err(err) => Err(err),
            Ok(edge) => {
                let t1 = self
                    .policy(&edge.node_1, short_channel_id)?
                    .map(|policy| policy.last_update)
                    .unwrap_or(0);
                let t2 = self
                    .policy(&edge.node_2, short_channel_id)?
                    .map(|policy| policy.last_update)
                    .unwrap_or(0);
                Ok((true, t1, t2))
            }
        }
    }

    fn policy(
        &self,
        node: &PublicKey,
        short_channel_id: ShortChannelId,
    ) -> Result<Option<ChannelEdgePolicy>, Error> {
        self.edges
            .get(policy_key(node, short_channel_id))?
            .map(|raw| strict_deserialize(&raw).map_err(Error::from))
            .transpose()
    }

    /// All outgoing policies of one node, through a single prefix scan of
    /// the `nodePubKey ‖ shortChannelId` key space.
    pub fn node_policies(
        &self,
        node: &PublicKey,
    ) -> Result<Vec<ChannelEdgePolicy>, Error> {
        let mut prefix = Vec::with_capacity(34);
        prefix.push(PREFIX_POLICY);
        prefix.extend_from_slice(&node.serialize());
        let mut policies = vec![];
        for item in self.edges.scan_prefix(prefix) {
            let (_, raw) = item?;
            policies.push(strict_deserialize(&raw)?);
        }
        Ok(policies)
    }

    /// Walks all channels presenting `(info, policy1, policy2)` with
    /// missing policies absent; the callback may terminate the walk by
    /// returning `false`.
    pub fn for_each_channel(
        &self,
        mut callback: impl FnMut(
            &ChannelEdgeInfo,
            Option<&ChannelEdgePolicy>,
            Option<&ChannelEdgePolicy>,
        ) -> bool,
    ) -> Result<(), Error> {
        for item in self.edges.scan_prefix([PREFIX_EDGE_INDEX]) {
            let (_, raw) = item?;
            let edge: ChannelEdgeInfo = strict_deserialize(&raw)?;
            let policy_1 = self.policy(&edge.node_1, edge.short_channel_id)?;
            let policy_2 = self.policy(&edge.node_2, edge.short_channel_id)?;
            if !callback(&edge, policy_1.as_ref(), policy_2.as_ref()) {
                break;
            }
        }
        Ok(())
    }

    /// The set of funding outpoints currently tracked by the graph: what a
    /// chain watcher must observe for spends.
    pub fn channel_view(&self) -> Result<Vec<OutPoint>, Error> {
        let mut outpoints = vec![];
        for item in self.edges.scan_prefix([PREFIX_EDGE_INDEX]) {
            let (_, raw) = item?;
            let edge: ChannelEdgeInfo = strict_deserialize(&raw)?;
            outpoints.push(edge.funding_outpoint());
        }
        Ok(outpoints)
    }

    /// Deletes every edge whose funding outpoint was spent within a block
    /// and records the new prune tip. Returns the removed edges.
    pub fn prune_graph(
        &self,
        spent_outpoints: &[OutPoint],
        block_hash: Slice32,
        block_height: u32,
    ) -> Result<Vec<ChannelEdgeInfo>, Error> {
        let mut pruned = vec![];
        for outpoint in spent_outpoints {
            let chan_key = chan_index_key(*outpoint);
            let scid_raw = match self.edges.get(&chan_key)? {
                None => continue,
                Some(raw) => raw,
            };
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&scid_raw);
            let short_channel_id =
                ShortChannelId::from_u64(u64::from_be_bytes(buf));
            let edge = self.edge_info(short_channel_id)?;

            let edge_key = edge_index_key(short_channel_id);
            let policy_key_1 = policy_key(&edge.node_1, short_channel_id);
            let policy_key_2 = policy_key(&edge.node_2, short_channel_id);
            self.edges.transaction(move |tx| {
                tx.remove(edge_key.as_slice())?;
                tx.remove(chan_key.as_slice())?;
                tx.remove(policy_key_1.as_slice())?;
                tx.remove(policy_key_2.as_slice())?;
                Ok(())
            })?;
            pruned.push(edge);
        }

        self.meta.insert(
            PRUNE_TIP_KEY,
            strict_serialize(&PruneTip {
                block_hash,
                block_height,
            })?,
        )?;
        debug!(
            "graph pruned at height {}: {} edge(s) removed",
            block_height,
            pruned.len()
        );
        Ok(pruned)
    }

    /// The block up to which the graph is synchronized with the chain.
    pub fn prune_tip(&self) -> Result<PruneTip, Error> {
        let raw =
            self.meta.get(PRUNE_TIP_KEY)?.ok_or(Error::GraphNotFound)?;
        Ok(strict_deserialize(&raw)?)
    }
}

fn edge_index_key(short_channel_id: ShortChannelId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(PREFIX_EDGE_INDEX);
    key.extend_from_slice(&short_channel_id.to_u64().to_be_bytes());
    key
}

fn chan_index_key(outpoint: OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32 + 4);
    key.push(PREFIX_CHAN_INDEX);
    key.extend_from_slice(&outpoint.txid.into_inner());
    key.extend_from_slice(&outpoint.vout.to_be_bytes());
    key
}

/// Edge policies are keyed `nodePubKey ‖ shortChannelId` (big-endian) so a
/// prefix scan from `nodePubKey ‖ 00…0` walks all outgoing edges of a node.
fn policy_key(node: &PublicKey, short_channel_id: ShortChannelId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 33 + 8);
    key.push(PREFIX_POLICY);
    key.extend_from_slice(&node.serialize());
    key.extend_from_slice(&short_channel_id.to_u64().to_be_bytes());
    key
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use amplify::Wrapper;
    use secp256k1::{SecretKey, SECP256K1};

    use super::*;

    fn node_key(tag: u8) -> PublicKey {
        PublicKey::from_secret_key(
            SECP256K1,
            &SecretKey::from_slice(&[tag; 32]).unwrap(),
        )
    }

    fn test_edge(index: u16, node_a: PublicKey, node_b: PublicKey) -> ChannelEdgeInfo {
        let (node_1, node_2) = if node_a.serialize() <= node_b.serialize() {
            (node_a, node_b)
        } else {
            (node_b, node_a)
        };
        ChannelEdgeInfo {
            short_channel_id: ShortChannelId::new(100, index as u32, 0)
                .unwrap(),
            chain_hash: Slice32::from_inner([9u8; 32]),
            node_1,
            node_2,
            bitcoin_key_1: node_1,
            bitcoin_key_2: node_2,
            features: vec![],
            auth_proof: None,
            funding_txid: Txid::from_str(
                "fd2105607605d2302994ffea703b09f66b6351816ee737a93e42a841ea20bbad",
            )
            .unwrap(),
            funding_output_index: index,
            capacity_sat: 1_000_000,
        }
    }

    fn graph() -> ChannelGraph {
        let store = ChannelStore::open_temporary().unwrap();
        ChannelGraph::with(&store).unwrap()
    }

    fn policy(
        scid: ShortChannelId,
        direction: bool,
        last_update: u32,
        fee_base_msat: u32,
    ) -> ChannelEdgePolicy {
        ChannelEdgePolicy {
            short_channel_id: scid,
            last_update,
            direction,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 1_000,
            fee_base_msat,
            fee_proportional_millionths: 100,
            signature: None,
        }
    }

    #[test]
    fn edge_lifecycle() {
        let graph = graph();
        let edge = test_edge(0, node_key(1), node_key(2));
        graph.add_channel_edge(&edge).unwrap();
        assert_eq!(
            graph.add_channel_edge(&edge),
            Err(Error::EdgeAlreadyExists(edge.short_channel_id))
        );

        let (restored, p1, p2) =
            graph.fetch_channel_by_scid(edge.short_channel_id).unwrap();
        assert_eq!(restored, edge);
        assert!(p1.is_none() && p2.is_none());

        let (found, t1, t2) =
            graph.has_channel_edge(edge.short_channel_id).unwrap();
        assert_eq!((found, t1, t2), (true, 0, 0));

        let by_outpoint = graph
            .fetch_channel_by_outpoint(edge.funding_outpoint())
            .unwrap();
        assert_eq!(by_outpoint.0, edge);
    }

    #[test]
    fn policy_updates_converge_in_any_order() {
        let scid = ShortChannelId::new(100, 0, 0).unwrap();
        let older = policy(scid, false, 1_000, 10);
        let newer = policy(scid, false, 2_000, 20);

        let forward = graph();
        let edge = test_edge(0, node_key(1), node_key(2));
        forward.add_channel_edge(&edge).unwrap();
        forward.update_edge_policy(&older).unwrap();
        forward.update_edge_policy(&newer).unwrap();

        let reverse = graph();
        reverse.add_channel_edge(&edge).unwrap();
        reverse.update_edge_policy(&newer).unwrap();
        reverse.update_edge_policy(&older).unwrap();

        let (_, forward_policy, _) =
            forward.fetch_channel_by_scid(scid).unwrap();
        let (_, reverse_policy, _) =
            reverse.fetch_channel_by_scid(scid).unwrap();
        assert_eq!(forward_policy, reverse_policy);
        assert_eq!(forward_policy.unwrap().fee_base_msat, 20);
    }

    #[test]
    fn directional_policies_are_independent() {
        let graph = graph();
        let edge = test_edge(0, node_key(1), node_key(2));
        graph.add_channel_edge(&edge).unwrap();
        let scid = edge.short_channel_id;
        graph.update_edge_policy(&policy(scid, false, 500, 11)).unwrap();
        graph.update_edge_policy(&policy(scid, true, 700, 22)).unwrap();

        let (_, p1, p2) = graph.fetch_channel_by_scid(scid).unwrap();
        assert_eq!(p1.unwrap().fee_base_msat, 11);
        assert_eq!(p2.unwrap().fee_base_msat, 22);

        let (_, t1, t2) = graph.has_channel_edge(scid).unwrap();
        assert_eq!((t1, t2), (500, 700));

        // The prefix scan walks exactly the node's own policies
        assert_eq!(graph.node_policies(&edge.node_1).unwrap().len(), 1);
        assert_eq!(graph.node_policies(&edge.node_2).unwrap().len(), 1);
    }

    #[test]
    fn prune_removes_spent_channels() {
        let graph = graph();
        // Five channels on a line of five nodes
        let nodes: Vec<_> = (1..=5).map(node_key).collect();
        let mut edges = vec![];
        for index in 0..5u16 {
            let edge = test_edge(
                index,
                nodes[index as usize % 5],
                nodes[(index as usize + 1) % 5],
            );
            graph.add_channel_edge(&edge).unwrap();
            edges.push(edge);
        }
        assert_eq!(graph.channel_view().unwrap().len(), 5);
        assert_eq!(graph.prune_tip(), Err(Error::GraphNotFound));

        // A block spending channels 1 and 2
        let spent = vec![
            edges[0].funding_outpoint(),
            edges[1].funding_outpoint(),
        ];
        let pruned = graph
            .prune_graph(&spent, Slice32::from_inner([1u8; 32]), 1)
            .unwrap();
        assert_eq!(pruned.len(), 2);
        assert!(pruned.contains(&edges[0]));
        assert!(pruned.contains(&edges[1]));
        assert_eq!(graph.channel_view().unwrap().len(), 3);
        let tip = graph.prune_tip().unwrap();
        assert_eq!(
            (tip.block_hash, tip.block_height),
            (Slice32::from_inner([1u8; 32]), 1)
        );

        // A block spending only unrelated outpoints bumps the tip alone
        let unrelated = OutPoint::new(
            Txid::from_str(
                "8984484a580b825b9972d7adb15050b3ab624ccd731946b3eeddb92f4e7ef6be",
            )
            .unwrap(),
            0,
        );
        let pruned = graph
            .prune_graph(&[unrelated], Slice32::from_inner([2u8; 32]), 2)
            .unwrap();
        assert!(pruned.is_empty());
        assert_eq!(graph.channel_view().unwrap().len(), 3);
        assert_eq!(graph.prune_tip().unwrap().block_height, 2);
    }

    #[test]
    fn node_records() {
        let graph = graph();
        let node = NodeInfo {
            node_id: node_key(7),
            last_update: 100,
            alias: Slice32::from_inner([0x61; 32]),
            features: vec![0x02],
            auth_signature: None,
        };
        graph.add_node(&node).unwrap();

        // Stale refresh is ignored
        let mut stale = node.clone();
        stale.last_update = 50;
        stale.features = vec![];
        graph.add_node(&stale).unwrap();
        assert_eq!(graph.fetch_node(&node.node_id).unwrap(), node);

        let mut count = 0;
        graph
            .for_each_node(|_| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 1);

        graph.delete_node(&node.node_id).unwrap();
        assert_eq!(
            graph.fetch_node(&node.node_id),
            Err(Error::NodeNotFound(node.node_id))
        );
    }
}
