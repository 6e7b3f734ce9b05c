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

use amplify::DumbDefault;
use secp256k1::{PublicKey, Secp256k1, Verification};

use crate::scripts::keys;

/// Set of basepoints one side contributes to the channel. Immutable for the
/// channel lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Keyset {
    /// Public key used in the funding outpoint multisig
    pub funding_pubkey: PublicKey,
    /// Base point for deriving keys used for penalty spending paths
    pub revocation_basepoint: PublicKey,
    /// Base point for deriving keys in `to_remote`
    pub payment_basepoint: PublicKey,
    /// Base point for deriving keys in `to_local` time-locked spending paths
    pub delayed_payment_basepoint: PublicKey,
    /// Base point for deriving HTLC-related keys
    pub htlc_basepoint: PublicKey,
}

impl DumbDefault for Keyset {
    fn dumb_default() -> Self {
        Keyset {
            funding_pubkey: dumb_pubkey!(),
            revocation_basepoint: dumb_pubkey!(),
            payment_basepoint: dumb_pubkey!(),
            delayed_payment_basepoint: dumb_pubkey!(),
            htlc_basepoint: dumb_pubkey!(),
        }
    }
}

/// Full ring of per-state keys for one commitment transaction, derived from
/// the commitment point and both parties' basepoints.
///
/// "Broadcaster" is whoever owns the commitment transaction being built;
/// when we sign the remote party's commitment, the remote node is the
/// broadcaster.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommitmentKeys {
    /// The commitment point authenticating this state
    pub per_commitment_point: PublicKey,

    /// Revocation key derived from the *countersignatory's* revocation
    /// basepoint; lets them punish the broadcaster once the state is revoked
    pub revocation_pubkey: PublicKey,

    /// Broadcaster's delayed key locking `to_local` and second-level outputs
    pub broadcaster_delayed_pubkey: PublicKey,

    /// Countersignatory's payment key receiving the `to_remote` output
    pub countersignatory_payment_pubkey: PublicKey,

    /// Broadcaster's HTLC key
    pub broadcaster_htlc_pubkey: PublicKey,

    /// Countersignatory's HTLC key
    pub countersignatory_htlc_pubkey: PublicKey,
}

impl CommitmentKeys {
    pub fn derive<C: Verification>(
        secp: &Secp256k1<C>,
        broadcaster: &Keyset,
        countersignatory: &Keyset,
        per_commitment_point: PublicKey,
    ) -> Self {
        CommitmentKeys {
            per_commitment_point,
            revocation_pubkey: keys::derive_revocation_pubkey(
                secp,
                countersignatory.revocation_basepoint,
                per_commitment_point,
            ),
            broadcaster_delayed_pubkey: keys::derive_pubkey(
                secp,
                broadcaster.delayed_payment_basepoint,
                per_commitment_point,
            ),
            countersignatory_payment_pubkey: keys::derive_pubkey(
                secp,
                countersignatory.payment_basepoint,
                per_commitment_point,
            ),
            broadcaster_htlc_pubkey: keys::derive_pubkey(
                secp,
                broadcaster.htlc_basepoint,
                per_commitment_point,
            ),
            countersignatory_htlc_pubkey: keys::derive_pubkey(
                secp,
                countersignatory.htlc_basepoint,
                per_commitment_point,
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use secp256k1::{SecretKey, SECP256K1};

    use super::*;

    fn keyset(tag: u8) -> Keyset {
        let pk = |index: u8| {
            PublicKey::from_secret_key(
                SECP256K1,
                &SecretKey::from_slice(&[tag + index; 32]).unwrap(),
            )
        };
        Keyset {
            funding_pubkey: pk(0),
            revocation_basepoint: pk(1),
            payment_basepoint: pk(2),
            delayed_payment_basepoint: pk(3),
            htlc_basepoint: pk(4),
        }
    }

    #[test]
    fn commitment_keys_are_side_symmetric() {
        let local = keyset(0x10);
        let remote = keyset(0x40);
        let point = PublicKey::from_secret_key(
            SECP256K1,
            &SecretKey::from_slice(&[0x05; 32]).unwrap(),
        );

        // Both parties derive the same key ring for a given broadcaster
        let ours = CommitmentKeys::derive(SECP256K1, &local, &remote, point);
        let theirs = CommitmentKeys::derive(SECP256K1, &local, &remote, point);
        assert_eq!(ours, theirs);

        // Swapping the sides changes every key except the point itself
        let swapped =
            CommitmentKeys::derive(SECP256K1, &remote, &local, point);
        assert_eq!(swapped.per_commitment_point, point);
        assert_ne!(ours.revocation_pubkey, swapped.revocation_pubkey);
        assert_ne!(
            ours.broadcaster_delayed_pubkey,
            swapped.broadcaster_delayed_pubkey
        );
    }
}
