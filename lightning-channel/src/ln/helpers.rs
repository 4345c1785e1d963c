// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Stateless helpers of the open and operate phases: parameter validation on both sides of
//! the handshake, confirmation-depth policy, feerate divergence, and construction of the
//! index-zero commitments.

use bitcoin::secp256k1::PublicKey;
use bitcoin::ScriptBuf;

use crate::ln::channel::{
	MAX_ACCEPTED_HTLCS, MAX_DUST_LIMIT_SATOSHIS, MAX_TO_SELF_DELAY, MIN_DUST_LIMIT_SATOSHIS,
	MIN_FUNDING_SATOSHIS,
};
use crate::ln::chan_utils::{CommitmentTxInfo, InputInfo};
use crate::ln::channel_version::ChannelVersion;
use crate::ln::commitment_spec::CommitmentSpec;
use crate::ln::commitments::{Commitments, LocalParams, RemoteParams};
use crate::ln::msgs::{AcceptChannel, OpenChannel};
use crate::sign::{ChannelSigner, CommitmentTxParams, TxBuilder};
use crate::util::config::NodeParams;
use crate::util::errors::ChannelError;

use core::cmp;

/// The largest channel we open or accept, in satoshis (10 BTC).
pub const MAX_FUNDING_SATOSHIS: u64 = 10 * 100_000_000;

/// How many confirmations we require on a funding transaction before the channel operates.
///
/// Small channels use the node's flat policy. Past [`MAX_FUNDING_SATOSHIS`]-scale values the
/// requirement grows with the amount, so that the cumulative block reward behind the funding
/// exceeds a multiple of what an attacker would gain by reorging it out.
pub fn min_depth_for_funding(node_params: &NodeParams, funding_satoshis: u64) -> u32 {
	if funding_satoshis <= MAX_FUNDING_SATOSHIS {
		node_params.min_depth_blocks
	} else {
		let funding_btc = funding_satoshis as f64 / 100_000_000.0;
		let scaled = ((15.0 * funding_btc) / 6.25).ceil() as u32 + 1;
		cmp::max(node_params.min_depth_blocks, scaled)
	}
}

/// The relative divergence between two feerates: `|2 * (a - b)| / (a + b)`.
pub fn fee_rate_mismatch(reference_per_kw: u32, current_per_kw: u32) -> f64 {
	if reference_per_kw == 0 && current_per_kw == 0 {
		return 0.0;
	}
	let reference = reference_per_kw as f64;
	let current = current_per_kw as f64;
	((2.0 * (reference - current)) / (reference + current)).abs()
}

/// Whether two feerates diverge more than the configured tolerance.
pub fn is_fee_diff_too_high(
	reference_per_kw: u32, current_per_kw: u32, max_ratio: f64,
) -> bool {
	fee_rate_mismatch(reference_per_kw, current_per_kw) > max_ratio
}

/// Whether our balance on the peer's commitment clears the reserve imposed on us. Until it
/// does, the peer carries all the risk and some operations stay restricted.
pub fn above_reserve(commitments: &Commitments) -> bool {
	let to_remote_satoshis = commitments.latest_remote_spec().to_remote_msat / 1000;
	// This check is only relevant when the peer demanded a reserve in the first place.
	to_remote_satoshis > commitments.remote_params.channel_reserve_satoshis
		|| commitments.channel_version.is_zero_reserve()
}

/// Whether a shutdown script is one of the standard final forms we accept: P2PKH, P2SH,
/// P2WPKH or P2WSH.
pub fn is_valid_final_script_pubkey(script_pubkey: &ScriptBuf) -> bool {
	script_pubkey.is_p2pkh()
		|| script_pubkey.is_p2sh()
		|| script_pubkey.is_p2wpkh()
		|| script_pubkey.is_p2wsh()
}

/// Validates the fundee's `accept_channel` against our `open_channel` and node policy.
pub fn validate_params_funder(
	node_params: &NodeParams, open: &OpenChannel, accept: &AcceptChannel,
) -> Result<(), ChannelError> {
	if accept.max_accepted_htlcs > MAX_ACCEPTED_HTLCS {
		return Err(ChannelError::InvalidMaxAcceptedHtlcs {
			max_accepted_htlcs: accept.max_accepted_htlcs,
		});
	}
	if node_params.is_mainnet() && accept.dust_limit_satoshis < MIN_DUST_LIMIT_SATOSHIS {
		return Err(ChannelError::DustLimitTooSmall {
			dust_limit_satoshis: accept.dust_limit_satoshis,
		});
	}
	if accept.dust_limit_satoshis > MAX_DUST_LIMIT_SATOSHIS {
		return Err(ChannelError::DustLimitTooLarge {
			dust_limit_satoshis: accept.dust_limit_satoshis,
		});
	}
	let max_delay = cmp::min(MAX_TO_SELF_DELAY, node_params.max_to_local_delay_blocks);
	if accept.to_self_delay > max_delay {
		return Err(ChannelError::ToSelfDelayTooHigh {
			to_self_delay: accept.to_self_delay,
			max: max_delay,
		});
	}
	let zero_reserve =
		open.channel_version.map_or(false, |version| version.is_zero_reserve());
	if !zero_reserve {
		if accept.dust_limit_satoshis > open.channel_reserve_satoshis {
			return Err(ChannelError::DustLimitAboveOurChannelReserve {
				dust_limit_satoshis: accept.dust_limit_satoshis,
				channel_reserve_satoshis: open.channel_reserve_satoshis,
			});
		}
		if accept.channel_reserve_satoshis < open.dust_limit_satoshis {
			return Err(ChannelError::ChannelReserveBelowOurDustLimit {
				channel_reserve_satoshis: accept.channel_reserve_satoshis,
				dust_limit_satoshis: open.dust_limit_satoshis,
			});
		}
	}
	if accept.channel_reserve_satoshis as f64
		> open.funding_satoshis as f64 * node_params.max_reserve_to_funding_ratio
	{
		return Err(ChannelError::ChannelReserveTooHigh {
			channel_reserve_satoshis: accept.channel_reserve_satoshis,
			funding_satoshis: open.funding_satoshis,
		});
	}
	Ok(())
}

/// Validates the funder's `open_channel` against our node policy.
pub fn validate_params_fundee(
	node_params: &NodeParams, open: &OpenChannel, channel_version: ChannelVersion,
	current_chain_feerate_per_kw: u32,
) -> Result<(), ChannelError> {
	if open.chain_hash != node_params.chain_hash {
		return Err(ChannelError::InvalidChainHash {
			ours: node_params.chain_hash,
			theirs: open.chain_hash,
		});
	}
	if open.funding_satoshis < MIN_FUNDING_SATOSHIS
		|| open.funding_satoshis > MAX_FUNDING_SATOSHIS
	{
		return Err(ChannelError::InvalidFundingAmount {
			funding_satoshis: open.funding_satoshis,
		});
	}
	if open.push_msat > open.funding_satoshis * 1000 {
		return Err(ChannelError::InvalidPushAmount {
			push_msat: open.push_msat,
			max_msat: open.funding_satoshis * 1000,
		});
	}
	if open.max_accepted_htlcs > MAX_ACCEPTED_HTLCS {
		return Err(ChannelError::InvalidMaxAcceptedHtlcs {
			max_accepted_htlcs: open.max_accepted_htlcs,
		});
	}
	if node_params.is_mainnet() && open.dust_limit_satoshis < MIN_DUST_LIMIT_SATOSHIS {
		return Err(ChannelError::DustLimitTooSmall {
			dust_limit_satoshis: open.dust_limit_satoshis,
		});
	}
	if open.dust_limit_satoshis > MAX_DUST_LIMIT_SATOSHIS {
		return Err(ChannelError::DustLimitTooLarge {
			dust_limit_satoshis: open.dust_limit_satoshis,
		});
	}
	let max_delay = cmp::min(MAX_TO_SELF_DELAY, node_params.max_to_local_delay_blocks);
	if open.to_self_delay > max_delay {
		return Err(ChannelError::ToSelfDelayTooHigh {
			to_self_delay: open.to_self_delay,
			max: max_delay,
		});
	}
	if !channel_version.is_zero_reserve() {
		if open.dust_limit_satoshis > open.channel_reserve_satoshis {
			return Err(ChannelError::DustLimitAboveOurChannelReserve {
				dust_limit_satoshis: open.dust_limit_satoshis,
				channel_reserve_satoshis: open.channel_reserve_satoshis,
			});
		}
	}
	if open.channel_reserve_satoshis as f64
		> open.funding_satoshis as f64 * node_params.max_reserve_to_funding_ratio
	{
		return Err(ChannelError::ChannelReserveTooHigh {
			channel_reserve_satoshis: open.channel_reserve_satoshis,
			funding_satoshis: open.funding_satoshis,
		});
	}
	if is_fee_diff_too_high(
		open.feerate_per_kw, current_chain_feerate_per_kw, node_params.max_feerate_mismatch_ratio,
	) {
		return Err(ChannelError::FeerateTooDifferent {
			proposed_feerate_per_kw: open.feerate_per_kw,
			reference_feerate_per_kw: current_chain_feerate_per_kw,
		});
	}
	Ok(())
}

/// Both sides' index-zero commitments.
#[derive(Clone, Debug, PartialEq)]
pub struct FirstCommitTxs {
	/// Our first commitment's content, in our frame.
	pub local_spec: CommitmentSpec,
	/// Our first commitment transaction, unsigned.
	pub local_commit_tx: CommitmentTxInfo,
	/// The peer's first commitment's content, in the peer's frame.
	pub remote_spec: CommitmentSpec,
	/// The peer's first commitment transaction, unsigned.
	pub remote_commit_tx: CommitmentTxInfo,
}

/// Builds both sides' commitment transactions at index 0.
///
/// As fundee we additionally verify here that the funder can pay the commitment fee on top
/// of the reserve: its very first commitment must already be enforceable.
#[allow(clippy::too_many_arguments)]
pub fn make_first_commit_txs<S: ChannelSigner, B: TxBuilder>(
	signer: &S, tx_builder: &B, channel_version: ChannelVersion, local_params: &LocalParams,
	remote_params: &RemoteParams, funding_satoshis: u64, push_msat: u64,
	initial_feerate_per_kw: u32, commit_input: &InputInfo,
	remote_first_per_commitment_point: &PublicKey,
) -> Result<FirstCommitTxs, ChannelError> {
	let funding_msat = funding_satoshis * 1000;
	let (to_funder_msat, to_other_msat) = (funding_msat - push_msat, push_msat);
	let (local_balance_msat, remote_balance_msat) = if local_params.is_funder {
		(to_funder_msat, to_other_msat)
	} else {
		(to_other_msat, to_funder_msat)
	};

	let local_spec = CommitmentSpec {
		htlcs: Vec::new(),
		feerate_per_kw: initial_feerate_per_kw,
		to_local_msat: local_balance_msat,
		to_remote_msat: remote_balance_msat,
	};
	let remote_spec = CommitmentSpec {
		htlcs: Vec::new(),
		feerate_per_kw: initial_feerate_per_kw,
		to_local_msat: remote_balance_msat,
		to_remote_msat: local_balance_msat,
	};

	if !local_params.is_funder {
		// The funder pays the fee out of its own balance; make sure the channel is viable
		// before we sign anything.
		let reserve_satoshis = if channel_version.is_zero_reserve() {
			0
		} else {
			local_params.channel_reserve_satoshis
		};
		let fee_satoshis = remote_spec.commit_tx_fee_sat(remote_params.dust_limit_satoshis);
		let missing = (remote_spec.to_local_msat / 1000) as i64
			- reserve_satoshis as i64 - fee_satoshis as i64;
		if missing < 0 {
			return Err(ChannelError::CannotAffordFees { missing_satoshis: -missing as u64 });
		}
	}

	let local_pubkeys = signer.pubkeys().clone();
	let local_params_tx = CommitmentTxParams {
		channel_version,
		commit_input,
		commitment_number: 0,
		broadcaster_is_funder: local_params.is_funder,
		broadcaster_dust_limit_satoshis: local_params.dust_limit_satoshis,
		broadcaster_to_self_delay: remote_params.to_self_delay,
		broadcaster_pubkeys: &local_pubkeys,
		countersignatory_pubkeys: &remote_params.pubkeys,
		per_commitment_point: signer.get_per_commitment_point(0),
	};
	let local_commit_tx = tx_builder.build_commitment_tx(&local_params_tx, &local_spec);

	let remote_params_tx = CommitmentTxParams {
		channel_version,
		commit_input,
		commitment_number: 0,
		broadcaster_is_funder: !local_params.is_funder,
		broadcaster_dust_limit_satoshis: remote_params.dust_limit_satoshis,
		broadcaster_to_self_delay: local_params.to_self_delay,
		broadcaster_pubkeys: &remote_params.pubkeys,
		countersignatory_pubkeys: &local_pubkeys,
		per_commitment_point: *remote_first_per_commitment_point,
	};
	let remote_commit_tx = tx_builder.build_commitment_tx(&remote_params_tx, &remote_spec);

	Ok(FirstCommitTxs { local_spec, local_commit_tx, remote_spec, remote_commit_tx })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn min_depth_scales_with_funding() {
		let node_params = NodeParams::default();
		assert_eq!(min_depth_for_funding(&node_params, 1_000_000), 3);
		assert_eq!(min_depth_for_funding(&node_params, MAX_FUNDING_SATOSHIS), 3);
		// 20 BTC: ceil(15 * 20 / 6.25) + 1 = 49.
		assert_eq!(min_depth_for_funding(&node_params, 2_000_000_000), 49);
	}

	#[test]
	fn fee_mismatch_is_symmetric_and_relative() {
		assert_eq!(fee_rate_mismatch(2500, 2500), 0.0);
		assert_eq!(fee_rate_mismatch(0, 0), 0.0);
		let diverging = fee_rate_mismatch(2500, 10000);
		assert_eq!(diverging, fee_rate_mismatch(10000, 2500));
		assert!(diverging > 1.0 && diverging < 1.5);
		assert!(is_fee_diff_too_high(253, 10000, 1.5));
		assert!(!is_fee_diff_too_high(2500, 3000, 1.5));
	}

	#[test]
	fn params_validation_rejects_each_kind() {
		use crate::ln::msgs::{AcceptChannel, OpenChannel};
		use bitcoin::constants::genesis_block;
		use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
		use bitcoin::Network;

		let secp_ctx = Secp256k1::new();
		let pubkey =
			PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[3; 32]).unwrap());
		let node_params = NodeParams::default();
		let open = OpenChannel {
			chain_hash: node_params.chain_hash,
			temporary_channel_id: [42; 32],
			funding_satoshis: 1_000_000,
			push_msat: 0,
			dust_limit_satoshis: 546,
			max_htlc_value_in_flight_msat: 800_000_000,
			channel_reserve_satoshis: 10_000,
			htlc_minimum_msat: 1_000,
			feerate_per_kw: 2500,
			to_self_delay: 144,
			max_accepted_htlcs: 30,
			funding_pubkey: pubkey,
			revocation_basepoint: pubkey,
			payment_basepoint: pubkey,
			delayed_payment_basepoint: pubkey,
			htlc_basepoint: pubkey,
			first_per_commitment_point: pubkey,
			channel_flags: 0,
			shutdown_scriptpubkey: None,
			channel_version: None,
		};
		let accept = AcceptChannel {
			temporary_channel_id: [42; 32],
			dust_limit_satoshis: 546,
			max_htlc_value_in_flight_msat: 800_000_000,
			channel_reserve_satoshis: 10_000,
			htlc_minimum_msat: 1_000,
			minimum_depth: 3,
			to_self_delay: 144,
			max_accepted_htlcs: 30,
			funding_pubkey: pubkey,
			revocation_basepoint: pubkey,
			payment_basepoint: pubkey,
			delayed_payment_basepoint: pubkey,
			htlc_basepoint: pubkey,
			first_per_commitment_point: pubkey,
			shutdown_scriptpubkey: None,
		};
		assert_eq!(validate_params_funder(&node_params, &open, &accept), Ok(()));
		assert_eq!(
			validate_params_fundee(&node_params, &open, ChannelVersion::STANDARD, 2500),
			Ok(())
		);

		let bad = AcceptChannel { max_accepted_htlcs: 500, ..accept.clone() };
		assert!(matches!(
			validate_params_funder(&node_params, &open, &bad),
			Err(ChannelError::InvalidMaxAcceptedHtlcs { max_accepted_htlcs: 500 })
		));
		let bad = AcceptChannel { dust_limit_satoshis: 200_000, ..accept.clone() };
		assert!(matches!(
			validate_params_funder(&node_params, &open, &bad),
			Err(ChannelError::DustLimitTooLarge { .. })
		));
		let bad = AcceptChannel { to_self_delay: 3000, ..accept.clone() };
		assert!(matches!(
			validate_params_funder(&node_params, &open, &bad),
			Err(ChannelError::ToSelfDelayTooHigh { .. })
		));
		let bad = AcceptChannel { dust_limit_satoshis: 20_000, ..accept.clone() };
		assert!(matches!(
			validate_params_funder(&node_params, &open, &bad),
			Err(ChannelError::DustLimitAboveOurChannelReserve { .. })
		));
		let bad = AcceptChannel { channel_reserve_satoshis: 500, ..accept.clone() };
		assert!(matches!(
			validate_params_funder(&node_params, &open, &bad),
			Err(ChannelError::ChannelReserveBelowOurDustLimit { .. })
		));
		let bad = AcceptChannel { channel_reserve_satoshis: 100_000, ..accept.clone() };
		assert!(matches!(
			validate_params_funder(&node_params, &open, &bad),
			Err(ChannelError::ChannelReserveTooHigh { .. })
		));
		// On mainnet a sub-546 dust limit is refused too.
		let mainnet = NodeParams {
			chain_hash: genesis_block(Network::Bitcoin).block_hash(),
			..NodeParams::default()
		};
		let bad = AcceptChannel { dust_limit_satoshis: 100, ..accept.clone() };
		assert!(matches!(
			validate_params_funder(&mainnet, &open, &bad),
			Err(ChannelError::DustLimitTooSmall { .. })
		));

		let bad = OpenChannel {
			chain_hash: genesis_block(Network::Bitcoin).block_hash(),
			..open.clone()
		};
		assert!(matches!(
			validate_params_fundee(&node_params, &bad, ChannelVersion::STANDARD, 2500),
			Err(ChannelError::InvalidChainHash { .. })
		));
		let bad = OpenChannel { funding_satoshis: MAX_FUNDING_SATOSHIS + 1, ..open.clone() };
		assert!(matches!(
			validate_params_fundee(&node_params, &bad, ChannelVersion::STANDARD, 2500),
			Err(ChannelError::InvalidFundingAmount { .. })
		));
		let bad = OpenChannel { push_msat: 2_000_000_000_000, ..open.clone() };
		assert!(matches!(
			validate_params_fundee(&node_params, &bad, ChannelVersion::STANDARD, 2500),
			Err(ChannelError::InvalidPushAmount { .. })
		));
		assert!(matches!(
			validate_params_fundee(&node_params, &open, ChannelVersion::STANDARD, 50_000),
			Err(ChannelError::FeerateTooDifferent { .. })
		));
		// Zero-reserve channels skip the reserve-vs-dust pairing.
		let zero_reserve = OpenChannel { channel_reserve_satoshis: 0, dust_limit_satoshis: 546, ..open.clone() };
		assert!(matches!(
			validate_params_fundee(&node_params, &zero_reserve, ChannelVersion::ZERO_RESERVE, 2500),
			Ok(())
		));
	}

	#[test]
	fn final_script_whitelist() {
		use bitcoin::{PubkeyHash, ScriptHash, WPubkeyHash, WScriptHash};
		use bitcoin::hashes::Hash;

		assert!(is_valid_final_script_pubkey(&ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([1; 20]))));
		assert!(is_valid_final_script_pubkey(&ScriptBuf::new_p2sh(&ScriptHash::from_byte_array([1; 20]))));
		assert!(is_valid_final_script_pubkey(&ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([1; 20]))));
		assert!(is_valid_final_script_pubkey(&ScriptBuf::new_p2wsh(&WScriptHash::from_byte_array([1; 32]))));
		assert!(!is_valid_final_script_pubkey(&ScriptBuf::new()));
	}
}
