// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-channel version bit set.
//!
//! Fixed at open and never renegotiated, the version selects key-derivation and policy
//! behavior for the lifetime of the channel.

use core::fmt;

/// A set of bits describing which optional channel semantics are in force.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ChannelVersion(u16);

impl ChannelVersion {
	/// The remote's main output on our commitment pays to a static key, removing the need to
	/// derive a fresh payment key per commitment.
	pub const STATIC_REMOTEKEY: ChannelVersion = ChannelVersion(1 << 0);
	/// Neither side is required to maintain a channel reserve.
	pub const ZERO_RESERVE: ChannelVersion = ChannelVersion(1 << 1);
	/// Our main output on the remote's commitment pays straight into the on-chain wallet, so
	/// no claim transaction is needed for it after a remote close.
	pub const PAYS_DIRECTLY_TO_WALLET: ChannelVersion = ChannelVersion(1 << 2);

	/// The plain channel version with no optional semantics.
	pub const STANDARD: ChannelVersion = ChannelVersion(0);

	/// Builds a version from its raw bits, as carried in `open_channel`.
	pub fn from_bits(bits: u16) -> ChannelVersion {
		ChannelVersion(bits)
	}

	/// The raw bits, as carried in `open_channel`.
	pub fn bits(&self) -> u16 {
		self.0
	}

	/// Returns the union of `self` and `other`.
	pub fn or(&self, other: ChannelVersion) -> ChannelVersion {
		ChannelVersion(self.0 | other.0)
	}

	fn is_set(&self, bit: ChannelVersion) -> bool {
		self.0 & bit.0 != 0
	}

	/// Whether the remote's main output uses a static key.
	pub fn has_static_remotekey(&self) -> bool {
		self.is_set(ChannelVersion::STATIC_REMOTEKEY)
	}

	/// Whether the channel operates without reserves. A channel is zero-reserve iff this bit
	/// is set.
	pub fn is_zero_reserve(&self) -> bool {
		self.is_set(ChannelVersion::ZERO_RESERVE)
	}

	/// Whether our main output after a remote close lands in the wallet without a claim.
	pub fn pays_directly_to_wallet(&self) -> bool {
		self.is_set(ChannelVersion::PAYS_DIRECTLY_TO_WALLET)
	}
}

impl fmt::Debug for ChannelVersion {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ChannelVersion({:#06b})", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::ChannelVersion;

	#[test]
	fn version_bits() {
		let v = ChannelVersion::STANDARD;
		assert!(!v.has_static_remotekey() && !v.is_zero_reserve() && !v.pays_directly_to_wallet());

		let v = ChannelVersion::STATIC_REMOTEKEY.or(ChannelVersion::ZERO_RESERVE);
		assert!(v.has_static_remotekey());
		assert!(v.is_zero_reserve());
		assert!(!v.pays_directly_to_wallet());
		assert_eq!(ChannelVersion::from_bits(v.bits()), v);
	}
}
