// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Node-wide channel policy which the state machine applies for you.

use bitcoin::constants::genesis_block;
use bitcoin::{BlockHash, Network};

use crate::ln::features::InitFeatures;

/// Node-wide configuration applied to every channel this node participates in.
///
/// Immutable for the lifetime of a channel: a [`crate::ln::channel::Channel`] captures the
/// values it was created with.
///
/// `Default::default()` provides sane defaults on Bitcoin regtest.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeParams {
	/// The genesis hash of the chain all our channels must be on.
	pub chain_hash: BlockHash,
	/// Confirmations we require before considering a funding transaction locked in, for
	/// channels up to [`crate::ln::helpers::MAX_FUNDING_SATOSHIS`]. Larger channels scale this
	/// up, see [`crate::ln::helpers::min_depth_for_funding`].
	pub min_depth_blocks: u32,
	/// The highest `to_self_delay` we accept from a peer, ie the longest our own funds may be
	/// frozen after a unilateral close. Peers asking for more are rejected at open.
	pub max_to_local_delay_blocks: u16,
	/// The largest fraction of the channel value we accept as the reserve imposed on us.
	pub max_reserve_to_funding_ratio: f64,
	/// How far the channel feerate may diverge from our reference feerate before we consider
	/// the channel unusable, as a ratio computed by
	/// [`crate::ln::helpers::fee_rate_mismatch`].
	pub max_feerate_mismatch_ratio: f64,
	/// The feature bits we announce in `init` and apply to new channels.
	pub features: InitFeatures,
}

impl Default for NodeParams {
	fn default() -> NodeParams {
		NodeParams {
			chain_hash: genesis_block(Network::Regtest).block_hash(),
			min_depth_blocks: 3,
			max_to_local_delay_blocks: 2016,
			max_reserve_to_funding_ratio: 0.05,
			max_feerate_mismatch_ratio: 1.5,
			features: InitFeatures::empty(),
		}
	}
}

impl NodeParams {
	/// Whether `chain_hash` is the Bitcoin mainnet genesis hash. Some parameter checks only
	/// make sense with real funds at stake.
	pub fn is_mainnet(&self) -> bool {
		self.chain_hash == genesis_block(Network::Bitcoin).block_hash()
	}
}
