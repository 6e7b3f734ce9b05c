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

//! The bidirectional commitment-update state machine and its supporting
//! data structures.

mod chain;
mod close;
mod keyset;
mod log;
mod machine;
mod policy;

pub use chain::{
    CommitDiff, Commitment, CommitmentChain, CommittedHtlc, LogUpdate,
};
pub use close::{
    BreachRetribution, BreachedOutput, CloseObserver, CloseOutcome,
    ForceCloseSummary, HtlcResolution, UnilateralCloseSummary,
};
pub use keyset::{CommitmentKeys, Keyset};
pub use log::{
    PaymentDescriptor, UpdateKind, UpdateLog, DUST_OUTPUT_INDEX,
};
pub use machine::{Channel, ChannelMachine, ChannelParams, ChannelSnapshot};
pub use policy::{
    commit_tx_fee, htlc_is_dust, htlc_success_fee, htlc_timeout_fee,
    ChannelConfig, Policy, PolicyError, COMMITMENT_TX_BASE_WEIGHT,
    HTLC_OUTPUT_WEIGHT, HTLC_SUCCESS_WEIGHT, HTLC_TIMEOUT_WEIGHT,
    MAX_ACCEPTED_HTLC_LIMIT, MAX_COMMITMENT_WEIGHT, MIN_DUST_LIMIT,
};

use crate::{shachain, signer, store};

/// Selector of one of the two commitment chains.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display,
)]
pub enum ChainSide {
    /// Our own commitment chain
    #[display("local")]
    Local,

    /// The counterparty's commitment chain
    #[display("remote")]
    Remote,
}

/// Operational status of a channel.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display,
    StrictEncode, StrictDecode,
)]
#[repr(u8)]
pub enum ChannelStatus {
    /// Channel is operating normally
    #[display("ACTIVE")]
    Active = 0,

    /// A fatal synchronization or protocol failure occurred; no further
    /// updates are accepted
    #[display("BORKED")]
    Borked = 1,

    /// A cooperative close proposal is in flight
    #[display("SHUTDOWN")]
    Shutdown = 2,

    /// A breach or force close is being resolved on chain
    #[display("PENDING-CLOSE")]
    PendingClose = 3,

    /// Channel is fully closed
    #[display("CLOSED")]
    Closed = 4,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        ChannelStatus::Active
    }
}

/// Errors produced by the channel state machine.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// cannot sign a new remote commitment: either the remote revocation
    /// window is exhausted or the next remote commitment point is not yet
    /// known
    NoWindow,

    /// number of active HTLCs exceeds the negotiated maximum of {limit}
    MaxHtlcsExceeded { limit: u16 },

    /// balance of {available_msat} msat available above the reserve is
    /// insufficient to cover {required_msat} msat
    InsufficientBalance {
        available_msat: u64,
        required_msat: u64,
    },

    /// HTLC amount of {amount_msat} msat is below the remote minimum of
    /// {minimum_msat} msat
    AmountBelowMinimum {
        amount_msat: u64,
        minimum_msat: u64,
    },

    /// total HTLC value in flight would exceed the negotiated limit of
    /// {limit_msat} msat
    MaxInFlightExceeded { limit_msat: u64 },

    /// commitment transaction weight {weight} exceeds the limit of {limit}
    MaxWeightExceeded { weight: u64, limit: u64 },

    /// commitment chains can not be synchronized with the remote peer;
    /// the channel is marked borked
    CannotSyncCommitChains,

    /// the last commitment secret provided by the remote peer does not
    /// match the secret we produced for that state
    InvalidLastCommitSecret,

    /// the remote peer proves a channel state newer than our records; local
    /// state was lost and recovery requires counterparty cooperation
    CommitSyncDataLoss,

    /// operation is not permitted: the channel is closing or already closed
    ChannelClosing,

    /// the channel is borked after a fatal failure and accepts no further
    /// updates
    ChannelBorked,

    /// the commitment lacks a counterparty signature and cannot be
    /// broadcast
    MissingCommitSig,

    /// cooperative close requires all HTLCs to be settled or failed first
    HtlcsPending,

    /// no revoked commitment is known for height {0}
    UnknownRevokedState(u64),

    /// commitment signature verification failed for commitment height
    /// {height}
    InvalidCommitSig {
        height: u64,
        commit_sig: Box<secp256k1::ecdsa::Signature>,
        sig_hash: Vec<u8>,
        commit_tx: Vec<u8>,
    },

    /// signature for HTLC output #{output_index} of the new commitment does
    /// not verify
    InvalidHtlcSig { output_index: usize },

    /// number of HTLC signatures ({provided}) does not match the number of
    /// non-dust HTLC outputs ({expected})
    HtlcSigCountMismatch { expected: usize, provided: usize },

    /// the provided pre-image does not match the payment hash of HTLC
    /// #{htlc_index}
    InvalidPreimage { htlc_index: u64 },

    /// the revocation secret does not match the tracked remote commitment
    /// point
    InvalidRevocation,

    /// unknown HTLC index {0}
    UnknownHtlcIndex(u64),

    /// no commitment is awaiting a revocation
    NoPendingCommitment,

    /// only the channel initiator may send fee updates, and only the
    /// non-initiator may receive them
    FeeUpdateMismatch,

    /// channel parameter policy violation: {0}
    #[from]
    Policy(PolicyError),

    /// revocation chain failure: {0}
    #[from]
    Revocation(shachain::Error),

    /// signer failure: {0}
    #[from]
    Signer(signer::Error),

    /// channel store failure: {0}
    #[from]
    Store(store::Error),
}

impl Error {
    /// Whether the error is fatal and must transition the channel into the
    /// borked state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CannotSyncCommitChains
                | Error::InvalidLastCommitSecret
                | Error::CommitSyncDataLoss
        )
    }
}
