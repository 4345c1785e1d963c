// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Implementations of the channel half of the lightning protocol and the on-channel payments.
//!
//! [`channel::Channel`] is the entry point; the other modules are its parts: the wire message
//! structs in [`msgs`], the per-channel ledger in [`commitments`], the close machinery in
//! [`closing`], and the transaction-level helpers in [`chan_utils`].

pub mod chan_utils;
pub mod channel;
pub mod channel_version;
pub mod closing;
pub mod commitment_spec;
pub mod commitments;
pub mod features;
pub mod helpers;
pub mod msgs;

#[cfg(test)]
mod functional_tests;

use core::fmt;

/// A 32-byte identifier for a channel. Starts out as a random temporary id chosen by the
/// funder and switches exactly once to the id derived from the funding outpoint, see
/// [`crate::chain::transaction::OutPoint::to_channel_id`].
pub type ChannelId = [u8; 32];

/// payment_hash type, use to cross-lock hop
#[derive(Hash, Copy, Clone, PartialEq, Eq)]
pub struct PaymentHash(pub [u8; 32]);
/// payment_preimage type, use to route payment between hop
#[derive(Hash, Copy, Clone, PartialEq, Eq)]
pub struct PaymentPreimage(pub [u8; 32]);

/// A user-provided identifier used to tie an outgoing HTLC back to the payment that created
/// it, so settlements can be attributed upstream.
#[derive(Hash, Copy, Clone, PartialEq, Eq)]
pub struct PaymentId(pub [u8; 32]);

impl fmt::Debug for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "PaymentHash({})", crate::util::logger::DebugBytes(&self.0))
	}
}
impl fmt::Debug for PaymentPreimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "PaymentPreimage({})", crate::util::logger::DebugBytes(&self.0))
	}
}
impl fmt::Debug for PaymentId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "PaymentId({})", crate::util::logger::DebugBytes(&self.0))
	}
}
