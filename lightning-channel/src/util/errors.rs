// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Error types live here.
//!
//! Every protocol failure in this library is a value of [`ChannelError`]. The state machine
//! never unwinds: handlers return `Err(ChannelError)` and the dispatcher decides whether that
//! means aborting an unfunded channel, force-closing a funded one, or merely failing the
//! command that triggered it.

use bitcoin::BlockHash;

use core::fmt;

/// Indicates an error on the channel's protocol or parameters.
///
/// The `Display` form of each variant is what ends up in the `error` message we send the peer,
/// so it names the failed check and the offending values.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelError {
	/// The peer is on a different chain than us.
	InvalidChainHash {
		/// The chain we are on.
		ours: BlockHash,
		/// The chain they claim to be on.
		theirs: BlockHash,
	},
	/// The proposed funding amount is out of our accepted range.
	InvalidFundingAmount {
		/// The amount the funder proposed.
		funding_satoshis: u64,
	},
	/// The funder tried to push more than they are putting into the channel.
	InvalidPushAmount {
		/// The amount pushed to us.
		push_msat: u64,
		/// The maximum that could be pushed.
		max_msat: u64,
	},
	/// The peer wants to allow more concurrent HTLCs than the protocol permits.
	InvalidMaxAcceptedHtlcs {
		/// Their `max_accepted_htlcs`.
		max_accepted_htlcs: u16,
	},
	/// The peer's dust limit is below the network dust limit for standard outputs.
	DustLimitTooSmall {
		/// Their `dust_limit_satoshis`.
		dust_limit_satoshis: u64,
	},
	/// The peer's dust limit is unreasonably large.
	DustLimitTooLarge {
		/// Their `dust_limit_satoshis`.
		dust_limit_satoshis: u64,
	},
	/// The peer's dust limit exceeds the reserve we asked them to hold.
	DustLimitAboveOurChannelReserve {
		/// Their `dust_limit_satoshis`.
		dust_limit_satoshis: u64,
		/// The reserve we imposed on them.
		channel_reserve_satoshis: u64,
	},
	/// The reserve the peer imposed on us is below our own dust limit.
	ChannelReserveBelowOurDustLimit {
		/// The reserve they imposed on us.
		channel_reserve_satoshis: u64,
		/// Our `dust_limit_satoshis`.
		dust_limit_satoshis: u64,
	},
	/// The reserve the peer imposed on us is too large a fraction of the channel.
	ChannelReserveTooHigh {
		/// The reserve they imposed on us.
		channel_reserve_satoshis: u64,
		/// The total channel value.
		funding_satoshis: u64,
	},
	/// The peer wants us to be punishable for longer than we accept.
	ToSelfDelayTooHigh {
		/// Their `to_self_delay`.
		to_self_delay: u16,
		/// The highest delay we accept.
		max: u16,
	},
	/// The funder cannot pay the commitment transaction fee from its balance.
	CannotAffordFees {
		/// How much is missing, in satoshis.
		missing_satoshis: u64,
	},
	/// The channel feerate diverges too much from our view of the chain feerate.
	FeerateTooDifferent {
		/// The feerate proposed on the channel.
		proposed_feerate_per_kw: u32,
		/// The reference feerate.
		reference_feerate_per_kw: u32,
	},
	/// A `commit_sig` carried an invalid commitment or HTLC signature.
	InvalidCommitmentSignature,
	/// A `commit_sig` carried the wrong number of HTLC signatures.
	HtlcSigCountMismatch {
		/// How many signatures the commitment requires.
		expected: usize,
		/// How many the message carried.
		got: usize,
	},
	/// A `closing_signed` carried an invalid signature.
	InvalidCloseSignature,
	/// An HTLC expires too soon to be safely relayed.
	ExpiryTooSmall {
		/// The proposed expiry.
		expiry: u32,
		/// The earliest acceptable expiry.
		minimum: u32,
	},
	/// An HTLC expires too far in the future.
	ExpiryTooBig {
		/// The proposed expiry.
		expiry: u32,
		/// The latest acceptable expiry.
		maximum: u32,
	},
	/// An HTLC is below the counterparty's advertised minimum.
	HtlcValueTooSmall {
		/// The proposed amount.
		amount_msat: u64,
		/// The advertised minimum.
		minimum_msat: u64,
	},
	/// Adding this HTLC would exceed the maximum value allowed in flight.
	HtlcValueTooHighInFlight {
		/// The in-flight total with this HTLC.
		in_flight_msat: u64,
		/// The negotiated maximum.
		maximum_msat: u64,
	},
	/// Adding this HTLC would exceed the maximum number of accepted HTLCs.
	TooManyAcceptedHtlcs {
		/// The negotiated maximum.
		maximum: u16,
	},
	/// The sender cannot afford this HTLC while maintaining its reserve.
	InsufficientFunds {
		/// How much is missing, in satoshis.
		missing_satoshis: u64,
	},
	/// A settlement referenced an HTLC id we do not have cross-signed.
	UnknownHtlcId {
		/// The offending HTLC id.
		id: u64,
	},
	/// An `update_fulfill_htlc` carried a preimage which does not match the payment hash.
	InvalidHtlcPreimage {
		/// The offending HTLC id.
		id: u64,
	},
	/// We tried to sign a new commitment while the previous one is still unrevoked.
	CannotSignBeforeRevocation,
	/// We tried to sign while there are no changes to commit to.
	CannotSignWithoutChanges,
	/// The peer sent a revocation we were not expecting.
	UnexpectedRevocation,
	/// The revealed per-commitment secret does not match the point we hold.
	InvalidRevocation,
	/// The peer is only allowed to send `update_fee` if it funded the channel.
	FundeeCannotSendUpdateFee,
	/// The peer's `channel_reestablish` is inconsistent with any state we could be in.
	RevocationSyncError,
	/// A close is already in progress on this channel.
	ClosingAlreadyInProgress,
	/// We cannot start a mutual close while we have HTLCs the peer has not signed for.
	CannotCloseWithUnsignedOutgoingHtlcs,
	/// A shutdown script is not one of the allowed final script forms.
	InvalidFinalScript,
	/// No new HTLCs are accepted once shutdown has been initiated.
	NoMoreHtlcsClosingInProgress,
	/// The channel cannot execute commands while disconnected or syncing.
	ChannelUnavailable,
	/// The funding transaction did not confirm in time.
	FundingTxTimedOut,
	/// The funding output was spent by a transaction we cannot attribute to either party.
	UnrecognizedFundingSpend,
	/// The channel was closed by a force-close command.
	ForcedLocalCommit,
	/// The peer closed the channel with an `error` message.
	PeerError {
		/// The peer's stated reason.
		data: String,
	},
}

impl fmt::Display for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ChannelError::InvalidChainHash { ours, theirs } =>
				write!(f, "InvalidChainHash: ours {}, theirs {}", ours, theirs),
			ChannelError::InvalidFundingAmount { funding_satoshis } =>
				write!(f, "InvalidFundingAmount: {} sat", funding_satoshis),
			ChannelError::InvalidPushAmount { push_msat, max_msat } =>
				write!(f, "InvalidPushAmount: {} > {}", push_msat, max_msat),
			ChannelError::InvalidMaxAcceptedHtlcs { max_accepted_htlcs } =>
				write!(f, "InvalidMaxAcceptedHtlcs: {} > {}", max_accepted_htlcs, crate::ln::channel::MAX_ACCEPTED_HTLCS),
			ChannelError::DustLimitTooSmall { dust_limit_satoshis } =>
				write!(f, "DustLimitTooSmall: {} < {}", dust_limit_satoshis, crate::ln::channel::MIN_DUST_LIMIT_SATOSHIS),
			ChannelError::DustLimitTooLarge { dust_limit_satoshis } =>
				write!(f, "DustLimitTooLarge: {} > {}", dust_limit_satoshis, crate::ln::channel::MAX_DUST_LIMIT_SATOSHIS),
			ChannelError::DustLimitAboveOurChannelReserve { dust_limit_satoshis, channel_reserve_satoshis } =>
				write!(f, "DustLimitAboveOurChannelReserve: {} > {}", dust_limit_satoshis, channel_reserve_satoshis),
			ChannelError::ChannelReserveBelowOurDustLimit { channel_reserve_satoshis, dust_limit_satoshis } =>
				write!(f, "ChannelReserveBelowOurDustLimit: {} < {}", channel_reserve_satoshis, dust_limit_satoshis),
			ChannelError::ChannelReserveTooHigh { channel_reserve_satoshis, funding_satoshis } =>
				write!(f, "ChannelReserveTooHigh: {} of {} sat funding", channel_reserve_satoshis, funding_satoshis),
			ChannelError::ToSelfDelayTooHigh { to_self_delay, max } =>
				write!(f, "ToSelfDelayTooHigh: {} > {}", to_self_delay, max),
			ChannelError::CannotAffordFees { missing_satoshis } =>
				write!(f, "CannotAffordFees: missing {} sat", missing_satoshis),
			ChannelError::FeerateTooDifferent { proposed_feerate_per_kw, reference_feerate_per_kw } =>
				write!(f, "FeerateTooDifferent: proposed {}, reference {}", proposed_feerate_per_kw, reference_feerate_per_kw),
			ChannelError::InvalidCommitmentSignature => write!(f, "InvalidCommitmentSignature"),
			ChannelError::HtlcSigCountMismatch { expected, got } =>
				write!(f, "HtlcSigCountMismatch: expected {}, got {}", expected, got),
			ChannelError::InvalidCloseSignature => write!(f, "InvalidCloseSignature"),
			ChannelError::ExpiryTooSmall { expiry, minimum } =>
				write!(f, "ExpiryTooSmall: {} < {}", expiry, minimum),
			ChannelError::ExpiryTooBig { expiry, maximum } =>
				write!(f, "ExpiryTooBig: {} > {}", expiry, maximum),
			ChannelError::HtlcValueTooSmall { amount_msat, minimum_msat } =>
				write!(f, "HtlcValueTooSmall: {} < {}", amount_msat, minimum_msat),
			ChannelError::HtlcValueTooHighInFlight { in_flight_msat, maximum_msat } =>
				write!(f, "HtlcValueTooHighInFlight: {} > {}", in_flight_msat, maximum_msat),
			ChannelError::TooManyAcceptedHtlcs { maximum } =>
				write!(f, "TooManyAcceptedHtlcs: {} accepted", maximum),
			ChannelError::InsufficientFunds { missing_satoshis } =>
				write!(f, "InsufficientFunds: missing {} sat", missing_satoshis),
			ChannelError::UnknownHtlcId { id } => write!(f, "UnknownHtlcId: {}", id),
			ChannelError::InvalidHtlcPreimage { id } => write!(f, "InvalidHtlcPreimage: {}", id),
			ChannelError::CannotSignBeforeRevocation => write!(f, "CannotSignBeforeRevocation"),
			ChannelError::CannotSignWithoutChanges => write!(f, "CannotSignWithoutChanges"),
			ChannelError::UnexpectedRevocation => write!(f, "UnexpectedRevocation"),
			ChannelError::InvalidRevocation => write!(f, "InvalidRevocation"),
			ChannelError::FundeeCannotSendUpdateFee => write!(f, "FundeeCannotSendUpdateFee"),
			ChannelError::RevocationSyncError => write!(f, "RevocationSyncError"),
			ChannelError::ClosingAlreadyInProgress => write!(f, "ClosingAlreadyInProgress"),
			ChannelError::CannotCloseWithUnsignedOutgoingHtlcs =>
				write!(f, "CannotCloseWithUnsignedOutgoingHtlcs"),
			ChannelError::InvalidFinalScript => write!(f, "InvalidFinalScript"),
			ChannelError::NoMoreHtlcsClosingInProgress => write!(f, "NoMoreHtlcsClosingInProgress"),
			ChannelError::ChannelUnavailable => write!(f, "ChannelUnavailable"),
			ChannelError::FundingTxTimedOut => write!(f, "FundingTxTimedOut"),
			ChannelError::UnrecognizedFundingSpend => write!(f, "UnrecognizedFundingSpend"),
			ChannelError::ForcedLocalCommit => write!(f, "ForcedLocalCommit"),
			ChannelError::PeerError { data } => write!(f, "PeerError: {}", data),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::ChannelError;

	#[test]
	fn error_display_names_the_check_and_values() {
		assert_eq!(
			ChannelError::InvalidMaxAcceptedHtlcs { max_accepted_htlcs: 500 }.to_string(),
			"InvalidMaxAcceptedHtlcs: 500 > 483"
		);
		assert_eq!(
			ChannelError::InsufficientFunds { missing_satoshis: 42 }.to_string(),
			"InsufficientFunds: missing 42 sat"
		);
		assert_eq!(
			ChannelError::UnknownHtlcId { id: 7 }.to_string(),
			"UnknownHtlcId: 7"
		);
	}
}
