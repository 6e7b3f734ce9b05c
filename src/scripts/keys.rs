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

//! Per-commitment key derivation.
//!
//! Every channel state `h` is authenticated by a commitment point
//! `C = secret_h * G`. Payment, delay and HTLC keys are the corresponding
//! basepoints tweaked additively with `SHA256(C ‖ basepoint)`; the
//! revocation key is a two-term combination which can later be
//! reconstructed by the holder of *either* the revocation base secret or
//! the revealed per-commitment secret.

use amplify::{Slice32, Wrapper};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing, Verification};

/// Computes the commitment point for a per-commitment secret.
pub fn commitment_point<C: Signing>(
    secp: &Secp256k1<C>,
    secret: Slice32,
) -> PublicKey {
    let secret_key = SecretKey::from_slice(secret.as_inner())
        .expect("negligible probability");
    PublicKey::from_secret_key(secp, &secret_key)
}

/// Tweak bytes `SHA256(per_commitment_point ‖ basepoint)` used for single
/// (additive) key derivation.
///
/// Exposed as raw bytes so sign descriptors can convey the tweak to a signer
/// without leaking any private material.
pub fn single_tweak(
    basepoint: PublicKey,
    per_commitment_point: PublicKey,
) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(&per_commitment_point.serialize());
    engine.input(&basepoint.serialize());
    sha256::Hash::from_engine(engine).into_inner()
}

/// Derives a payment, delay or HTLC public key for a given state:
/// `basepoint + SHA256(per_commitment_point ‖ basepoint) * G`.
pub fn derive_pubkey<C: Verification>(
    secp: &Secp256k1<C>,
    basepoint: PublicKey,
    per_commitment_point: PublicKey,
) -> PublicKey {
    let tweak = Scalar::from_be_bytes(single_tweak(
        basepoint,
        per_commitment_point,
    ))
    .expect("negligible probability");
    basepoint
        .add_exp_tweak(secp, &tweak)
        .expect("negligible probability")
}

/// Private-key counterpart of [`derive_pubkey`].
pub fn derive_privkey<C: Signing>(
    secp: &Secp256k1<C>,
    base_secret: SecretKey,
    per_commitment_point: PublicKey,
) -> SecretKey {
    let basepoint = PublicKey::from_secret_key(secp, &base_secret);
    let tweak = Scalar::from_be_bytes(single_tweak(
        basepoint,
        per_commitment_point,
    ))
    .expect("negligible probability");
    base_secret
        .add_tweak(&tweak)
        .expect("negligible probability")
}

/// Derives the revocation public key for a given state:
///
/// ```text
/// revocation_basepoint * SHA256(revocation_basepoint ‖ per_commitment_point)
///   + per_commitment_point * SHA256(per_commitment_point ‖ revocation_basepoint)
/// ```
pub fn derive_revocation_pubkey<C: Verification>(
    secp: &Secp256k1<C>,
    revocation_basepoint: PublicKey,
    per_commitment_point: PublicKey,
) -> PublicKey {
    let mut engine = sha256::Hash::engine();
    engine.input(&revocation_basepoint.serialize());
    engine.input(&per_commitment_point.serialize());
    let revocation_tweak =
        Scalar::from_be_bytes(sha256::Hash::from_engine(engine).into_inner())
            .expect("negligible probability");
    let tweaked_basepoint = revocation_basepoint
        .mul_tweak(secp, &revocation_tweak)
        .expect("negligible probability");

    let mut engine = sha256::Hash::engine();
    engine.input(&per_commitment_point.serialize());
    engine.input(&revocation_basepoint.serialize());
    let commitment_tweak =
        Scalar::from_be_bytes(sha256::Hash::from_engine(engine).into_inner())
            .expect("negligible probability");
    let tweaked_point = per_commitment_point
        .mul_tweak(secp, &commitment_tweak)
        .expect("negligible probability");

    tweaked_basepoint
        .combine(&tweaked_point)
        .expect("negligible probability")
}

/// Reconstructs the revocation private key once the per-commitment secret
/// has been revealed. Field-additive counterpart of
/// [`derive_revocation_pubkey`].
pub fn derive_revocation_privkey<C: Signing>(
    secp: &Secp256k1<C>,
    revocation_base_secret: SecretKey,
    per_commitment_secret: SecretKey,
) -> SecretKey {
    let revocation_basepoint =
        PublicKey::from_secret_key(secp, &revocation_base_secret);
    let per_commitment_point =
        PublicKey::from_secret_key(secp, &per_commitment_secret);

    let mut engine = sha256::Hash::engine();
    engine.input(&revocation_basepoint.serialize());
    engine.input(&per_commitment_point.serialize());
    let revocation_tweak =
        Scalar::from_be_bytes(sha256::Hash::from_engine(engine).into_inner())
            .expect("negligible probability");
    let tweaked_base = revocation_base_secret
        .mul_tweak(&revocation_tweak)
        .expect("negligible probability");

    let mut engine = sha256::Hash::engine();
    engine.input(&per_commitment_point.serialize());
    engine.input(&revocation_basepoint.serialize());
    let commitment_tweak =
        Scalar::from_be_bytes(sha256::Hash::from_engine(engine).into_inner())
            .expect("negligible probability");
    let tweaked_secret = per_commitment_secret
        .mul_tweak(&commitment_tweak)
        .expect("negligible probability");

    tweaked_base
        .add_tweak(&Scalar::from_be_bytes(tweaked_secret.secret_bytes())
            .expect("negligible probability"))
        .expect("negligible probability")
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    macro_rules! pk {
        ($hex:expr) => {
            PublicKey::from_str($hex).unwrap()
        };
    }

    // BOLT-3 appendix E derivation vectors
    const BASE_POINT: &str =
        "036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2";
    const PER_COMMITMENT_POINT: &str =
        "025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486";

    #[test]
    fn bolt3_pubkey_derivation() {
        let secp = Secp256k1::new();
        assert_eq!(
            derive_pubkey(
                &secp,
                pk!(BASE_POINT),
                pk!(PER_COMMITMENT_POINT)
            ),
            pk!("0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5")
        );
    }

    #[test]
    fn bolt3_revocation_pubkey_derivation() {
        let secp = Secp256k1::new();
        assert_eq!(
            derive_revocation_pubkey(
                &secp,
                pk!(BASE_POINT),
                pk!(PER_COMMITMENT_POINT)
            ),
            pk!("02916e326636d19c33f13e8c0c3a03dd157f332f3e99c317c141dd865eb01f8ff0")
        );
    }

    #[test]
    fn private_derivation_matches_public() {
        let secp = Secp256k1::new();
        let base_secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let commitment_secret = SecretKey::from_slice(&[0x17u8; 32]).unwrap();
        let basepoint = PublicKey::from_secret_key(&secp, &base_secret);
        let point = PublicKey::from_secret_key(&secp, &commitment_secret);

        let derived = derive_privkey(&secp, base_secret, point);
        assert_eq!(
            PublicKey::from_secret_key(&secp, &derived),
            derive_pubkey(&secp, basepoint, point)
        );

        let revocation =
            derive_revocation_privkey(&secp, base_secret, commitment_secret);
        assert_eq!(
            PublicKey::from_secret_key(&secp, &revocation),
            derive_revocation_pubkey(&secp, basepoint, point)
        );
    }
}
