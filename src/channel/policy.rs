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

use std::ops::Range;

use amplify::DumbDefault;

use super::Keyset;

/// Limit for the maximum number of the accepted HTLCs towards some node
pub const MAX_ACCEPTED_HTLC_LIMIT: u16 = 483;

/// Protocol-minimum dust limit
pub const MIN_DUST_LIMIT: u64 = 354;

/// Weight of a commitment transaction without any HTLC outputs
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;

/// Weight added to a commitment transaction per untrimmed HTLC output
pub const HTLC_OUTPUT_WEIGHT: u64 = 172;

/// Weight of a second-level HTLC timeout transaction
pub const HTLC_TIMEOUT_WEIGHT: u64 = 663;

/// Weight of a second-level HTLC success transaction
pub const HTLC_SUCCESS_WEIGHT: u64 = 703;

/// Upper bound on the weight of a commitment transaction with all its HTLC
/// outputs; a standardness ceiling, not a consensus rule
pub const MAX_COMMITMENT_WEIGHT: u64 = 400_000;

/// Commitment transaction fee for the given rate and number of untrimmed
/// HTLC outputs.
#[inline]
pub fn commit_tx_fee(fee_per_kw: u32, num_htlcs: usize) -> u64 {
    let weight =
        COMMITMENT_TX_BASE_WEIGHT + HTLC_OUTPUT_WEIGHT * num_htlcs as u64;
    fee_per_kw as u64 * weight / 1000
}

/// Fee of the second-level transaction claiming an offered (outgoing) HTLC
/// after its timeout.
#[inline]
pub fn htlc_timeout_fee(fee_per_kw: u32) -> u64 {
    fee_per_kw as u64 * HTLC_TIMEOUT_WEIGHT / 1000
}

/// Fee of the second-level transaction claiming a received (incoming) HTLC
/// with its pre-image.
#[inline]
pub fn htlc_success_fee(fee_per_kw: u32) -> u64 {
    fee_per_kw as u64 * HTLC_SUCCESS_WEIGHT / 1000
}

/// Dust test for an HTLC on a commitment transaction owned by a given side.
///
/// An HTLC incoming to the owner is claimed through the success transaction,
/// an outgoing one through the timeout transaction; the HTLC is dust when
/// its amount can't pay the respective second-level fee on top of the
/// chain's dust limit.
pub fn htlc_is_dust(
    incoming_to_owner: bool,
    amount_msat: u64,
    fee_per_kw: u32,
    dust_limit_sat: u64,
) -> bool {
    let second_level_fee = if incoming_to_owner {
        htlc_success_fee(fee_per_kw)
    } else {
        htlc_timeout_fee(fee_per_kw)
    };
    amount_msat / 1000 < dust_limit_sat + second_level_fee
}

/// Configuration of one channel side. Settled during channel negotiation,
/// immutable for the channel lifetime.
///
/// All fields describe the side owning the config: its commitment dust
/// limit, the delay and reserve imposed *on* it, and the limits on HTLCs
/// incoming *to* it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct ChannelConfig {
    /// The threshold below which outputs on this side's commitment
    /// transaction are omitted
    pub dust_limit_sat: u64,

    /// The maximum inbound HTLC value in flight towards this side, in
    /// milli-satoshi
    pub max_htlc_value_in_flight_msat: u64,

    /// The minimum value unencumbered by HTLCs this side must keep in the
    /// channel, as demanded by the other side
    pub channel_reserve_sat: u64,

    /// The minimum HTLC size incoming to this side, in milli-satoshi
    pub htlc_minimum_msat: u64,

    /// The number of blocks this side must wait to claim its own funds when
    /// it broadcasts its commitment transaction
    pub to_self_delay: u16,

    /// The maximum number of inbound HTLCs towards this side
    pub max_accepted_htlcs: u16,

    /// Basepoints this side contributes to the channel scripts
    pub keys: Keyset,
}

impl DumbDefault for ChannelConfig {
    fn dumb_default() -> Self {
        ChannelConfig {
            dust_limit_sat: MIN_DUST_LIMIT,
            max_htlc_value_in_flight_msat: u64::MAX,
            channel_reserve_sat: 0,
            htlc_minimum_msat: 0,
            to_self_delay: 144,
            max_accepted_htlcs: MAX_ACCEPTED_HTLC_LIMIT,
            keys: Keyset::dumb_default(),
        }
    }
}

/// Errors from policy validation of channel parameters proposed by the
/// remote peer.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error, StrictEncode,
    StrictDecode,
)]
#[display(doc_comments)]
pub enum PolicyError {
    /// proposed `to_self_delay` value {proposed} is unreasonably large and
    /// exceeds node policy limit of {allowed_maximum}; rejecting the channel
    ToSelfDelayUnreasonablyLarge { proposed: u16, allowed_maximum: u16 },

    /// proposed limit for maximum accepted number of HTLCs {0} exceeds the
    /// protocol requirement to be below 483; rejecting the channel
    MaxAcceptedHtlcLimitExceeded(u16),

    /// proposed fee rate {proposed} sat/kw is outside of the fee rate policy
    /// of the local node ({lowest_accepted}..{highest_accepted} sat/kw);
    /// rejecting the channel
    FeeRateUnreasonable {
        proposed: u32,
        lowest_accepted: u32,
        highest_accepted: u32,
    },

    /// proposed channel reserve limit {reserve} sat is less than dust limit
    /// {dust_limit} sat; rejecting the channel
    ChannelReserveLessDust { reserve: u64, dust_limit: u64 },

    /// dust limit {0} sat is less than protocol minimum requirement of 354
    /// sat; rejecting the channel
    DustLimitTooSmall(u64),

    /// dust limit {proposed} sats exceeds node policy requirement of
    /// {allowed_maximum}; rejecting the channel
    DustLimitTooLarge { proposed: u64, allowed_maximum: u64 },

    /// HTLC minimum {proposed} is too large and exceeds node policy
    /// requirements ({allowed_maximum}); rejecting the channel
    HtlcMinimumTooLarge { proposed: u64, allowed_maximum: u64 },

    /// maximum number of HTLCs {proposed} that can be accepted by the remote
    /// node is too small and does not match node policy requirement of
    /// {required_minimum}; rejecting the channel
    MaxAcceptedHtlcsTooSmall {
        proposed: u16,
        required_minimum: u16,
    },
}

/// Policy to validate channel parameters proposed by a remote peer.
#[derive(Clone, PartialEq, Eq, Hash, Debug, StrictEncode, StrictDecode)]
pub struct Policy {
    /// Reasonable limit to check value of `to_self_delay` required by a
    /// remote node, in blocks.
    pub to_self_delay_max: u16,

    /// Range of acceptable commitment fee rates.
    pub feerate_per_kw_range: Range<u32>,

    /// The maximum acceptable limit on the value stored in a single HTLC.
    pub htlc_minimum_msat_max: Option<u64>,

    /// Minimum boundary to the limit of HTLCs offered to a remote peer.
    pub max_accepted_htlcs_min: Option<u16>,

    /// Maximum value for the dust limit required by a remote node.
    pub dust_limit_sat_max: Option<u64>,
}

impl Default for Policy {
    /// Sets reasonable values for the local node policies
    fn default() -> Policy {
        Policy {
            to_self_delay_max: 14 * 24 * 6,
            feerate_per_kw_range: 253..100_000,
            htlc_minimum_msat_max: None,
            max_accepted_htlcs_min: Some(10),
            dust_limit_sat_max: Some(1000),
        }
    }
}

impl Policy {
    /// Validates channel parameters proposed by the remote peer against the
    /// policy.
    pub fn validate_config(
        &self,
        config: &ChannelConfig,
    ) -> Result<(), PolicyError> {
        if config.to_self_delay > self.to_self_delay_max {
            return Err(PolicyError::ToSelfDelayUnreasonablyLarge {
                proposed: config.to_self_delay,
                allowed_maximum: self.to_self_delay_max,
            });
        }

        if config.max_accepted_htlcs > MAX_ACCEPTED_HTLC_LIMIT {
            return Err(PolicyError::MaxAcceptedHtlcLimitExceeded(
                config.max_accepted_htlcs,
            ));
        }

        if config.dust_limit_sat > config.channel_reserve_sat {
            return Err(PolicyError::ChannelReserveLessDust {
                reserve: config.channel_reserve_sat,
                dust_limit: config.dust_limit_sat,
            });
        }

        if config.dust_limit_sat < MIN_DUST_LIMIT {
            return Err(PolicyError::DustLimitTooSmall(config.dust_limit_sat));
        }

        if let Some(limit) = self.htlc_minimum_msat_max {
            if config.htlc_minimum_msat > limit {
                return Err(PolicyError::HtlcMinimumTooLarge {
                    proposed: config.htlc_minimum_msat,
                    allowed_maximum: limit,
                });
            }
        }

        if let Some(limit) = self.max_accepted_htlcs_min {
            if config.max_accepted_htlcs < limit {
                return Err(PolicyError::MaxAcceptedHtlcsTooSmall {
                    proposed: config.max_accepted_htlcs,
                    required_minimum: limit,
                });
            }
        }

        if let Some(limit) = self.dust_limit_sat_max {
            if config.dust_limit_sat > limit {
                return Err(PolicyError::DustLimitTooLarge {
                    proposed: config.dust_limit_sat,
                    allowed_maximum: limit,
                });
            }
        }

        Ok(())
    }

    /// Validates a commitment fee rate proposed via `update_fee`.
    pub fn validate_fee_rate(&self, fee_per_kw: u32) -> Result<(), PolicyError> {
        if !self.feerate_per_kw_range.contains(&fee_per_kw) {
            return Err(PolicyError::FeeRateUnreasonable {
                proposed: fee_per_kw,
                lowest_accepted: self.feerate_per_kw_range.start,
                highest_accepted: self.feerate_per_kw_range.end,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fee_table() {
        // 724 weight at 15000 sat/kw
        assert_eq!(commit_tx_fee(15_000, 0), 10_860);
        // one untrimmed HTLC adds 172 weight
        assert_eq!(commit_tx_fee(15_000, 1), 13_440);
        assert_eq!(htlc_timeout_fee(20_000), 13_260);
        assert_eq!(htlc_success_fee(20_000), 14_060);
    }

    #[test]
    fn dust_rule() {
        // 1000 msat at 20000 sat/kw: second-level fee alone dwarfs the
        // amount, dust on both directions
        assert!(htlc_is_dust(true, 1_000, 20_000, 354));
        assert!(htlc_is_dust(false, 1_000, 20_000, 354));

        // 10 million msat (10k sat) clears a low-fee dust check
        assert!(!htlc_is_dust(true, 10_000_000, 253, 354));
        // An HTLC just above the dust limit fails once the second-level fee
        // is accounted for
        assert!(htlc_is_dust(false, 400_000, 1_000, 354));
    }

    #[test]
    fn policy_rejects_bad_configs() {
        let policy = Policy::default();
        let mut config = ChannelConfig::dumb_default();
        config.channel_reserve_sat = 10_000;
        config.dust_limit_sat = 546;
        config.max_accepted_htlcs = 30;
        assert_eq!(policy.validate_config(&config), Ok(()));

        let mut bad = config;
        bad.dust_limit_sat = 100;
        assert_eq!(
            policy.validate_config(&bad),
            Err(PolicyError::DustLimitTooSmall(100))
        );

        let mut bad = config;
        bad.to_self_delay = 5_000;
        assert_eq!(
            policy.validate_config(&bad),
            Err(PolicyError::ToSelfDelayUnreasonablyLarge {
                proposed: 5_000,
                allowed_maximum: policy.to_self_delay_max,
            })
        );

        assert_eq!(
            policy.validate_fee_rate(1),
            Err(PolicyError::FeeRateUnreasonable {
                proposed: 1,
                lowest_accepted: 253,
                highest_accepted: 100_000,
            })
        );
    }
}
