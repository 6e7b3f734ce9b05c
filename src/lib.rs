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

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate strict_encoding;
extern crate lightning_encoding;
#[macro_use]
extern crate log;

#[cfg(feature = "serde")]
extern crate serde_crate as serde;
#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_with;

macro_rules! dumb_pubkey {
    () => {
        secp256k1::PublicKey::from_secret_key(
            secp256k1::SECP256K1,
            &secp256k1::ONE_KEY,
        )
    };
}

pub mod channel;
pub mod graph;
pub mod scripts;
pub mod shachain;
pub mod signer;
pub mod store;
pub mod wire;

pub use channel::{Channel, ChannelMachine};
pub use graph::ChannelGraph;
pub use shachain::{RevocationProducer, RevocationStore};
pub use signer::{ChainNotifier, FeeOracle, SignDescriptor, Signer};
pub use store::ChannelStore;
pub use wire::{ChannelId, ChannelMessage, ShortChannelId};
