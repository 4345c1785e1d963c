// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The abstract content of a commitment transaction: who holds what, at which feerate, with
//! which HTLCs in flight. Specs are reduced forward by applying update messages; the
//! transaction builders materialize them into actual commitment transactions.

use crate::ln::chan_utils::{commit_tx_fee_sat, htlc_success_fee_sat, htlc_timeout_fee_sat};
use crate::ln::msgs::{UpdateAddHTLC, UpdateMessage};
use crate::util::errors::ChannelError;

/// An HTLC together with its direction relative to the owner of the spec holding it.
#[derive(Clone, Debug, PartialEq)]
pub enum DirectedHtlc {
	/// An HTLC offered to the spec owner by its counterparty.
	Incoming(UpdateAddHTLC),
	/// An HTLC offered by the spec owner.
	Outgoing(UpdateAddHTLC),
}

impl DirectedHtlc {
	/// The underlying `update_add_htlc`.
	pub fn add(&self) -> &UpdateAddHTLC {
		match self {
			DirectedHtlc::Incoming(add) => add,
			DirectedHtlc::Outgoing(add) => add,
		}
	}

	/// Whether the HTLC was offered to the spec owner.
	pub fn is_incoming(&self) -> bool {
		matches!(self, DirectedHtlc::Incoming(_))
	}
}

/// The amounts, feerate and pending HTLC set of one commitment, expressed in its owner's
/// frame: `to_local_msat` is the owner's balance and `Outgoing` HTLCs are offered by the
/// owner.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentSpec {
	/// All HTLCs pending in this commitment, dust included.
	pub htlcs: Vec<DirectedHtlc>,
	/// The feerate this commitment pays, per 1000 weight.
	pub feerate_per_kw: u32,
	/// The owner's balance, before fees.
	pub to_local_msat: u64,
	/// The counterparty's balance, before fees.
	pub to_remote_msat: u64,
}

impl CommitmentSpec {
	/// Finds a pending incoming HTLC by the id its sender assigned.
	pub fn find_incoming(&self, htlc_id: u64) -> Option<&UpdateAddHTLC> {
		self.htlcs.iter().find_map(|htlc| match htlc {
			DirectedHtlc::Incoming(add) if add.htlc_id == htlc_id => Some(add),
			_ => None,
		})
	}

	/// Finds a pending outgoing HTLC by the id its sender assigned.
	pub fn find_outgoing(&self, htlc_id: u64) -> Option<&UpdateAddHTLC> {
		self.htlcs.iter().find_map(|htlc| match htlc {
			DirectedHtlc::Outgoing(add) if add.htlc_id == htlc_id => Some(add),
			_ => None,
		})
	}

	/// The total value of pending HTLCs in the given direction.
	pub fn htlc_value_in_flight_msat(&self, incoming: bool) -> u64 {
		self.htlcs
			.iter()
			.filter(|htlc| htlc.is_incoming() == incoming)
			.map(|htlc| htlc.add().amount_msat)
			.sum()
	}

	/// The number of pending HTLCs in the given direction.
	pub fn htlc_count(&self, incoming: bool) -> usize {
		self.htlcs.iter().filter(|htlc| htlc.is_incoming() == incoming).count()
	}

	fn remove_incoming(&mut self, htlc_id: u64) -> Result<UpdateAddHTLC, ChannelError> {
		let pos = self
			.htlcs
			.iter()
			.position(|htlc| htlc.is_incoming() && htlc.add().htlc_id == htlc_id)
			.ok_or(ChannelError::UnknownHtlcId { id: htlc_id })?;
		Ok(self.htlcs.remove(pos).add().clone())
	}

	fn remove_outgoing(&mut self, htlc_id: u64) -> Result<UpdateAddHTLC, ChannelError> {
		let pos = self
			.htlcs
			.iter()
			.position(|htlc| !htlc.is_incoming() && htlc.add().htlc_id == htlc_id)
			.ok_or(ChannelError::UnknownHtlcId { id: htlc_id })?;
		Ok(self.htlcs.remove(pos).add().clone())
	}

	/// Applies pending changes from both sides and returns the resulting spec.
	///
	/// `local_changes` are updates proposed by the spec owner, `remote_changes` by its
	/// counterparty. Additions are applied before settlements, so a change set may settle an
	/// HTLC it also adds.
	pub fn reduce(
		&self, local_changes: &[UpdateMessage], remote_changes: &[UpdateMessage],
	) -> Result<CommitmentSpec, ChannelError> {
		let mut spec = self.clone();
		for change in local_changes.iter() {
			if let UpdateMessage::AddHtlc(add) = change {
				spec.to_local_msat = spec
					.to_local_msat
					.checked_sub(add.amount_msat)
					.ok_or(ChannelError::InsufficientFunds {
						missing_satoshis: (add.amount_msat - spec.to_local_msat) / 1000,
					})?;
				spec.htlcs.push(DirectedHtlc::Outgoing(add.clone()));
			}
		}
		for change in remote_changes.iter() {
			if let UpdateMessage::AddHtlc(add) = change {
				spec.to_remote_msat = spec
					.to_remote_msat
					.checked_sub(add.amount_msat)
					.ok_or(ChannelError::InsufficientFunds {
						missing_satoshis: (add.amount_msat - spec.to_remote_msat) / 1000,
					})?;
				spec.htlcs.push(DirectedHtlc::Incoming(add.clone()));
			}
		}
		for change in local_changes.iter() {
			match change {
				UpdateMessage::AddHtlc(_) => {},
				UpdateMessage::FulfillHtlc(fulfill) => {
					let add = spec.remove_incoming(fulfill.htlc_id)?;
					spec.to_local_msat += add.amount_msat;
				},
				UpdateMessage::FailHtlc(fail) => {
					let add = spec.remove_incoming(fail.htlc_id)?;
					spec.to_remote_msat += add.amount_msat;
				},
				UpdateMessage::FailMalformedHtlc(fail) => {
					let add = spec.remove_incoming(fail.htlc_id)?;
					spec.to_remote_msat += add.amount_msat;
				},
				UpdateMessage::Fee(fee) => spec.feerate_per_kw = fee.feerate_per_kw,
			}
		}
		for change in remote_changes.iter() {
			match change {
				UpdateMessage::AddHtlc(_) => {},
				UpdateMessage::FulfillHtlc(fulfill) => {
					let add = spec.remove_outgoing(fulfill.htlc_id)?;
					spec.to_remote_msat += add.amount_msat;
				},
				UpdateMessage::FailHtlc(fail) => {
					let add = spec.remove_outgoing(fail.htlc_id)?;
					spec.to_local_msat += add.amount_msat;
				},
				UpdateMessage::FailMalformedHtlc(fail) => {
					let add = spec.remove_outgoing(fail.htlc_id)?;
					spec.to_local_msat += add.amount_msat;
				},
				UpdateMessage::Fee(fee) => spec.feerate_per_kw = fee.feerate_per_kw,
			}
		}
		Ok(spec)
	}

	/// Whether an HTLC is worth an output on a commitment with the given dust limit: trimmed
	/// HTLCs also have to pay for the second-stage transaction claiming them.
	pub fn is_untrimmed(&self, htlc: &DirectedHtlc, dust_limit_satoshis: u64) -> bool {
		let second_stage_fee = if htlc.is_incoming() {
			htlc_success_fee_sat(self.feerate_per_kw)
		} else {
			htlc_timeout_fee_sat(self.feerate_per_kw)
		};
		htlc.add().amount_msat / 1000 >= dust_limit_satoshis + second_stage_fee
	}

	/// The HTLCs which materialize as outputs on a commitment with the given dust limit.
	pub fn untrimmed_htlcs(&self, dust_limit_satoshis: u64) -> Vec<&DirectedHtlc> {
		self.htlcs.iter().filter(|htlc| self.is_untrimmed(htlc, dust_limit_satoshis)).collect()
	}

	/// The fee the commitment materializing this spec pays, given its owner's dust limit.
	pub fn commit_tx_fee_sat(&self, dust_limit_satoshis: u64) -> u64 {
		commit_tx_fee_sat(self.feerate_per_kw, self.untrimmed_htlcs(dust_limit_satoshis).len())
	}
}

#[cfg(test)]
mod tests {
	use super::{CommitmentSpec, DirectedHtlc};
	use crate::ln::msgs::{
		OnionErrorPacket, OnionRoutingPacket, UpdateAddHTLC, UpdateFailHTLC, UpdateFulfillHTLC,
		UpdateMessage,
	};
	use crate::ln::{PaymentHash, PaymentPreimage};
	use crate::util::errors::ChannelError;

	use bitcoin::hashes::sha256::Hash as Sha256;
	use bitcoin::hashes::Hash;

	fn add(htlc_id: u64, amount_msat: u64) -> UpdateAddHTLC {
		let preimage = PaymentPreimage([htlc_id as u8; 32]);
		UpdateAddHTLC {
			channel_id: [0; 32],
			htlc_id,
			amount_msat,
			payment_hash: PaymentHash(Sha256::hash(&preimage.0).to_byte_array()),
			cltv_expiry: 144,
			onion_routing_packet: OnionRoutingPacket { data: Vec::new() },
		}
	}

	fn spec() -> CommitmentSpec {
		CommitmentSpec {
			htlcs: Vec::new(),
			feerate_per_kw: 1000,
			to_local_msat: 700_000_000,
			to_remote_msat: 300_000_000,
		}
	}

	#[test]
	fn reduce_moves_value_into_and_out_of_htlcs() {
		let add0 = add(0, 50_000_000);
		let reduced = spec()
			.reduce(&[UpdateMessage::AddHtlc(add0.clone())], &[])
			.unwrap();
		assert_eq!(reduced.to_local_msat, 650_000_000);
		assert_eq!(reduced.to_remote_msat, 300_000_000);
		assert_eq!(reduced.htlcs, vec![DirectedHtlc::Outgoing(add0.clone())]);

		// The counterparty fulfills our HTLC: the value lands on their side.
		let fulfill = UpdateFulfillHTLC {
			channel_id: [0; 32],
			htlc_id: 0,
			payment_preimage: PaymentPreimage([0; 32]),
		};
		let settled = reduced.reduce(&[], &[UpdateMessage::FulfillHtlc(fulfill)]).unwrap();
		assert_eq!(settled.to_local_msat, 650_000_000);
		assert_eq!(settled.to_remote_msat, 350_000_000);
		assert!(settled.htlcs.is_empty());
	}

	#[test]
	fn reduce_refunds_failed_htlcs() {
		let add0 = add(0, 50_000_000);
		let fail = UpdateFailHTLC {
			channel_id: [0; 32],
			htlc_id: 0,
			reason: OnionErrorPacket { data: Vec::new() },
		};
		let settled = spec()
			.reduce(
				&[UpdateMessage::AddHtlc(add0)],
				&[UpdateMessage::FailHtlc(fail)],
			)
			.unwrap();
		assert_eq!(settled.to_local_msat, 700_000_000);
		assert_eq!(settled.to_remote_msat, 300_000_000);
	}

	#[test]
	fn reduce_rejects_unknown_settlements() {
		let fulfill = UpdateFulfillHTLC {
			channel_id: [0; 32],
			htlc_id: 42,
			payment_preimage: PaymentPreimage([0; 32]),
		};
		assert_eq!(
			spec().reduce(&[UpdateMessage::FulfillHtlc(fulfill)], &[]),
			Err(ChannelError::UnknownHtlcId { id: 42 })
		);
	}

	#[test]
	fn trimming_depends_on_direction_and_feerate() {
		let mut spec = spec();
		spec.htlcs.push(DirectedHtlc::Outgoing(add(0, 1_000_000)));
		// 1000 sat: above the dust limit alone, but not once it has to pay for a
		// second-stage transaction at 1000 per kw.
		assert_eq!(spec.untrimmed_htlcs(546).len(), 0);
		spec.htlcs.push(DirectedHtlc::Outgoing(add(1, 2_000_000)));
		assert_eq!(spec.untrimmed_htlcs(546).len(), 1);
	}
}
