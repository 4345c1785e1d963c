// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-channel ledger: both commitment transactions, the changes pending between them,
//! and the sign/revoke/ack protocol which moves value while keeping every prior state
//! revoked.
//!
//! All operations take the ledger by reference and return an updated copy, so a failed
//! operation can never leave a half-applied ledger behind.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{ScriptBuf, Transaction, Txid};

use crate::events::ChannelAction;
use crate::ln::chan_utils::{
	ChannelPublicKeys, CounterpartyCommitmentSecrets, HTLCTx, InputInfo,
	INITIAL_COMMITMENT_NUMBER,
};
use crate::ln::channel::{MAX_CLTV_EXPIRY_DELTA, MIN_CLTV_EXPIRY_DELTA};
use crate::ln::channel_version::ChannelVersion;
use crate::ln::commitment_spec::CommitmentSpec;
use crate::ln::features::InitFeatures;
use crate::ln::msgs::{
	ChannelMessage, ChannelReestablish, CommitmentSigned, EncryptedChannelData,
	OnionErrorPacket, OnionRoutingPacket, RevokeAndACK, UpdateAddHTLC, UpdateFailHTLC,
	UpdateFailMalformedHTLC, UpdateFee, UpdateFulfillHTLC, UpdateMessage,
};
use crate::ln::{ChannelId, PaymentHash, PaymentId, PaymentPreimage};
use crate::sign::{ChannelSigner, CommitmentTxParams, TxBuilder};
use crate::util::errors::ChannelError;

use bitcoin::secp256k1::ecdsa::Signature;
use std::collections::HashMap;

/// Our own channel parameters, fixed at open.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalParams {
	/// Outputs below this are trimmed from our commitment.
	pub dust_limit_satoshis: u64,
	/// The maximum total HTLC value we accept inbound.
	pub max_htlc_value_in_flight_msat: u64,
	/// The reserve we impose on the peer.
	pub channel_reserve_satoshis: u64,
	/// The smallest HTLC we accept.
	pub htlc_minimum_msat: u64,
	/// The delay we impose on the peer's outputs after it broadcasts a commitment.
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs we accept.
	pub max_accepted_htlcs: u16,
	/// Whether we fund the channel (and therefore pay commitment fees).
	pub is_funder: bool,
	/// The script we close to unless a command overrides it.
	pub default_final_script_pubkey: ScriptBuf,
	/// The features we had announced when the channel opened.
	pub features: InitFeatures,
	/// Identifies our key material for this channel, see
	/// [`crate::sign::KeysInterface::derive_channel_signer`].
	pub channel_keys_id: [u8; 32],
}

/// The peer's channel parameters, as announced in its `open_channel` or `accept_channel`.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteParams {
	/// Outputs below this are trimmed from the peer's commitment.
	pub dust_limit_satoshis: u64,
	/// The maximum total HTLC value the peer accepts inbound.
	pub max_htlc_value_in_flight_msat: u64,
	/// The reserve the peer imposes on us.
	pub channel_reserve_satoshis: u64,
	/// The smallest HTLC the peer accepts.
	pub htlc_minimum_msat: u64,
	/// The delay the peer imposes on our outputs after we broadcast a commitment.
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs the peer accepts.
	pub max_accepted_htlcs: u16,
	/// The peer's funding key and basepoints.
	pub pubkeys: ChannelPublicKeys,
	/// The features the peer announced in `init`.
	pub features: InitFeatures,
	/// The script the peer committed to close to, if it used the upfront option.
	pub shutdown_scriptpubkey: Option<ScriptBuf>,
}

/// Changes we initiated, bucketed by how far they have traveled.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct LocalChanges {
	/// Sent to the peer, not yet covered by any signature.
	pub proposed: Vec<UpdateMessage>,
	/// Covered by a `commit_sig` we sent and not yet revoked by the peer.
	pub signed: Vec<UpdateMessage>,
	/// In the peer's commitment, not yet in ours.
	pub acked: Vec<UpdateMessage>,
}

/// Changes the peer initiated, bucketed by how far they have traveled. Note the order of the
/// buckets: the peer's changes enter our commitment first (`acked`, via its `commit_sig` and
/// our revocation) and its own commitment second (`signed`, via our `commit_sig` and its
/// revocation).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RemoteChanges {
	/// Received from the peer, not yet covered by any signature.
	pub proposed: Vec<UpdateMessage>,
	/// In our commitment (we acked them by revoking), not yet in the peer's.
	pub acked: Vec<UpdateMessage>,
	/// Covered by a `commit_sig` we sent and not yet revoked by the peer.
	pub signed: Vec<UpdateMessage>,
}

fn count_adds(changes: &[UpdateMessage]) -> u64 {
	changes.iter().filter(|change| matches!(change, UpdateMessage::AddHtlc(_))).count() as u64
}

fn has_add(changes: &[UpdateMessage]) -> bool {
	changes.iter().any(|change| matches!(change, UpdateMessage::AddHtlc(_)))
}

fn settles(change: &UpdateMessage, htlc_id: u64) -> bool {
	match change {
		UpdateMessage::FulfillHtlc(fulfill) => fulfill.htlc_id == htlc_id,
		UpdateMessage::FailHtlc(fail) => fail.htlc_id == htlc_id,
		UpdateMessage::FailMalformedHtlc(fail) => fail.htlc_id == htlc_id,
		_ => false,
	}
}

/// One record per non-dust HTLC on a remote commitment we signed. Persisted before the
/// signature leaves the process, so penalty transactions can be rebuilt for any revoked
/// commitment even across restarts.
#[derive(Clone, Debug, PartialEq)]
pub struct HtlcInfo {
	/// The channel.
	pub channel_id: ChannelId,
	/// The remote commitment number the HTLC appears in.
	pub commitment_number: u64,
	/// The HTLC's payment hash, needed to rebuild its script.
	pub payment_hash: PaymentHash,
	/// The HTLC's expiry, needed to rebuild its script.
	pub cltv_expiry: u32,
}

/// A second-stage HTLC transaction of our own commitment, with both signatures needed to
/// publish it.
#[derive(Clone, Debug, PartialEq)]
pub struct HTLCTxAndSigs {
	/// The transaction and which HTLC it resolves.
	pub txinfo: HTLCTx,
	/// Our signature.
	pub local_sig: Signature,
	/// The peer's signature, received in `commit_sig`.
	pub remote_sig: Signature,
}

/// Our commitment transaction and its dependents, ready to broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishableTxs {
	/// The fully signed commitment transaction.
	pub commit_tx: Transaction,
	/// Its second-stage HTLC transactions, with both signatures.
	pub htlc_txs_and_sigs: Vec<HTLCTxAndSigs>,
}

/// Our current commitment.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalCommit {
	/// Ascending commitment number, advancing with every `commit_sig` we receive.
	pub index: u64,
	/// What the commitment contains, in our frame.
	pub spec: CommitmentSpec,
	/// The broadcastable transactions realizing it.
	pub publishable_txs: PublishableTxs,
}

/// The peer's current (or pending next) commitment. We never hold the peer's full signed
/// transaction, only enough to recognize and claim it if it hits the chain.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteCommit {
	/// Ascending commitment number, advancing with every revocation we receive.
	pub index: u64,
	/// What the commitment contains, in the *peer's* frame.
	pub spec: CommitmentSpec,
	/// The txid of the peer's commitment transaction.
	pub txid: Txid,
	/// The per-commitment point the peer used for this commitment.
	pub remote_per_commitment_point: PublicKey,
}

/// Bookkeeping for a `commit_sig` we sent and whose revocation has not come back yet.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitingForRevocation {
	/// The remote commitment our signature created.
	pub next_remote_commit: RemoteCommit,
	/// The exact `commit_sig` we sent, for retransmission on reconnect.
	pub sent: CommitmentSigned,
	/// Our local commitment index at the time we sent it, which fixes the relative order of
	/// the `commit_sig` and any revocation we sent around it.
	pub sent_after_local_commit_index: u64,
	/// Whether a `CMD_SIGN` arrived while this signature was in flight and should be
	/// replayed as soon as the revocation lands.
	pub re_sign_asap: bool,
}

/// Whether we may sign a new remote commitment right now.
///
/// At most one commitment signature is in flight per direction: this is
/// [`RemoteNextCommitInfo::WaitingForRevocation`] exactly while ours is.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteNextCommitInfo {
	/// We sent a `commit_sig` and must not sign again until the peer revokes.
	WaitingForRevocation(WaitingForRevocation),
	/// The peer's next per-commitment point, ie we are free to sign its next commitment.
	Revoked(PublicKey),
}

/// The complete ledger of a funded channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Commitments {
	/// The channel semantics in force.
	pub channel_version: ChannelVersion,
	/// Our parameters.
	pub local_params: LocalParams,
	/// The peer's parameters.
	pub remote_params: RemoteParams,
	/// Channel flags from `open_channel`; bit 0 requests a public announcement.
	pub channel_flags: u8,
	/// Our commitment.
	pub local_commit: LocalCommit,
	/// The peer's commitment.
	pub remote_commit: RemoteCommit,
	/// Changes we initiated.
	pub local_changes: LocalChanges,
	/// Changes the peer initiated.
	pub remote_changes: RemoteChanges,
	/// The id our next outgoing HTLC gets.
	pub local_next_htlc_id: u64,
	/// The id we expect on the peer's next HTLC.
	pub remote_next_htlc_id: u64,
	/// Maps our outgoing HTLC ids to the payments that created them.
	pub payments: HashMap<u64, PaymentId>,
	/// Whether we may sign the peer's next commitment, see [`RemoteNextCommitInfo`].
	pub remote_next_commit_info: RemoteNextCommitInfo,
	/// The funding output all commitments spend.
	pub commit_input: InputInfo,
	/// Every revocation secret the peer has revealed, compactly.
	pub remote_per_commitment_secrets: CounterpartyCommitmentSecrets,
	/// The channel id, permanent once funding is known.
	pub channel_id: ChannelId,
	/// The peer's latest encrypted backup, held for it if we act as its backup provider.
	pub remote_channel_data: Option<EncryptedChannelData>,
}

impl Commitments {
	/// Whether we have anything new to put in a `commit_sig`.
	pub fn local_has_changes(&self) -> bool {
		!self.remote_changes.acked.is_empty() || !self.local_changes.proposed.is_empty()
	}

	/// Whether the peer had anything new to put in the `commit_sig` we just received.
	pub fn remote_has_changes(&self) -> bool {
		!self.local_changes.acked.is_empty() || !self.remote_changes.proposed.is_empty()
	}

	/// Whether we have offered HTLCs the peer has not signed for yet.
	pub fn local_has_unsigned_outgoing_htlcs(&self) -> bool {
		has_add(&self.local_changes.proposed)
	}

	/// Whether the peer has offered HTLCs we have not signed for yet.
	pub fn remote_has_unsigned_outgoing_htlcs(&self) -> bool {
		has_add(&self.remote_changes.proposed)
	}

	/// Whether every HTLC has been settled and signed off on both sides.
	pub fn has_no_pending_htlcs(&self) -> bool {
		self.local_commit.spec.htlcs.is_empty()
			&& self.remote_commit.spec.htlcs.is_empty()
			&& matches!(self.remote_next_commit_info, RemoteNextCommitInfo::Revoked(_))
	}

	/// True while the channel has no value at risk: nothing was ever committed beyond the
	/// initial balances and we hold none of them.
	pub fn nothing_at_stake(&self) -> bool {
		self.local_commit.index == 0
			&& self.local_commit.spec.to_local_msat == 0
			&& self.remote_commit.index == 0
			&& self.remote_commit.spec.to_remote_msat == 0
	}

	/// The reserve we must hold, zero on zero-reserve channels.
	pub fn local_channel_reserve_satoshis(&self) -> u64 {
		if self.channel_version.is_zero_reserve() {
			0
		} else {
			self.remote_params.channel_reserve_satoshis
		}
	}

	/// The reserve the peer must hold, zero on zero-reserve channels.
	pub fn remote_channel_reserve_satoshis(&self) -> u64 {
		if self.channel_version.is_zero_reserve() {
			0
		} else {
			self.local_params.channel_reserve_satoshis
		}
	}

	/// The peer's commitment spec as it will be once everything in flight is resolved.
	pub fn latest_remote_spec(&self) -> &CommitmentSpec {
		match &self.remote_next_commit_info {
			RemoteNextCommitInfo::WaitingForRevocation(waiting) => &waiting.next_remote_commit.spec,
			RemoteNextCommitInfo::Revoked(_) => &self.remote_commit.spec,
		}
	}

	/// Finds an HTLC offered to us which both sides have signed for, by the id the peer
	/// assigned it.
	pub fn get_incoming_htlc_cross_signed(&self, htlc_id: u64) -> Option<&UpdateAddHTLC> {
		self.latest_remote_spec().find_outgoing(htlc_id)?;
		self.local_commit.spec.find_incoming(htlc_id)
	}

	/// Finds an HTLC we offered which both sides have signed for, by the id we assigned it.
	pub fn get_outgoing_htlc_cross_signed(&self, htlc_id: u64) -> Option<&UpdateAddHTLC> {
		self.latest_remote_spec().find_incoming(htlc_id)?;
		self.local_commit.spec.find_outgoing(htlc_id)
	}

	/// Builds the parameters for materializing one of *our* commitments.
	pub fn local_commitment_params<'a>(
		&'a self, local_pubkeys: &'a ChannelPublicKeys, commitment_number: u64,
		per_commitment_point: PublicKey,
	) -> CommitmentTxParams<'a> {
		CommitmentTxParams {
			channel_version: self.channel_version,
			commit_input: &self.commit_input,
			commitment_number,
			broadcaster_is_funder: self.local_params.is_funder,
			broadcaster_dust_limit_satoshis: self.local_params.dust_limit_satoshis,
			broadcaster_to_self_delay: self.remote_params.to_self_delay,
			broadcaster_pubkeys: local_pubkeys,
			countersignatory_pubkeys: &self.remote_params.pubkeys,
			per_commitment_point,
		}
	}

	/// Builds the parameters for materializing one of the *peer's* commitments.
	pub fn remote_commitment_params<'a>(
		&'a self, local_pubkeys: &'a ChannelPublicKeys, commitment_number: u64,
		per_commitment_point: PublicKey,
	) -> CommitmentTxParams<'a> {
		CommitmentTxParams {
			channel_version: self.channel_version,
			commit_input: &self.commit_input,
			commitment_number,
			broadcaster_is_funder: !self.local_params.is_funder,
			broadcaster_dust_limit_satoshis: self.remote_params.dust_limit_satoshis,
			broadcaster_to_self_delay: self.local_params.to_self_delay,
			broadcaster_pubkeys: &self.remote_params.pubkeys,
			countersignatory_pubkeys: local_pubkeys,
			per_commitment_point,
		}
	}

	/// Offers a new HTLC to the peer, checking the BOLT 2 flow-control limits against the
	/// peer's commitment as it will look once everything in flight has been signed.
	pub fn send_add(
		&self, amount_msat: u64, payment_hash: PaymentHash, cltv_expiry: u32,
		onion_routing_packet: OnionRoutingPacket, payment_id: PaymentId,
		current_block_height: u32,
	) -> Result<(Commitments, UpdateAddHTLC), ChannelError> {
		let minimum = current_block_height + MIN_CLTV_EXPIRY_DELTA;
		if cltv_expiry < minimum {
			return Err(ChannelError::ExpiryTooSmall { expiry: cltv_expiry, minimum });
		}
		let maximum = current_block_height + MAX_CLTV_EXPIRY_DELTA;
		if cltv_expiry > maximum {
			return Err(ChannelError::ExpiryTooBig { expiry: cltv_expiry, maximum });
		}
		if amount_msat < self.remote_params.htlc_minimum_msat {
			return Err(ChannelError::HtlcValueTooSmall {
				amount_msat,
				minimum_msat: self.remote_params.htlc_minimum_msat,
			});
		}

		let add = UpdateAddHTLC {
			channel_id: self.channel_id,
			htlc_id: self.local_next_htlc_id,
			amount_msat,
			payment_hash,
			cltv_expiry,
			onion_routing_packet,
		};
		let mut changes = self.local_changes.proposed.clone();
		changes.push(UpdateMessage::AddHtlc(add.clone()));
		let reduced = self.latest_remote_spec().reduce(&self.remote_changes.acked, &changes)?;

		// In the peer's frame our HTLCs are the incoming ones.
		let in_flight_msat = reduced.htlc_value_in_flight_msat(true);
		if in_flight_msat > self.remote_params.max_htlc_value_in_flight_msat {
			return Err(ChannelError::HtlcValueTooHighInFlight {
				in_flight_msat,
				maximum_msat: self.remote_params.max_htlc_value_in_flight_msat,
			});
		}
		if reduced.htlc_count(true) > self.remote_params.max_accepted_htlcs as usize {
			return Err(ChannelError::TooManyAcceptedHtlcs {
				maximum: self.remote_params.max_accepted_htlcs,
			});
		}

		let fees = if self.local_params.is_funder {
			reduced.commit_tx_fee_sat(self.remote_params.dust_limit_satoshis)
		} else {
			0
		};
		let remaining = (reduced.to_remote_msat / 1000) as i64
			- self.local_channel_reserve_satoshis() as i64 - fees as i64;
		if remaining < 0 {
			return Err(ChannelError::InsufficientFunds { missing_satoshis: -remaining as u64 });
		}

		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::AddHtlc(add.clone()));
		commitments.local_next_htlc_id += 1;
		commitments.payments.insert(add.htlc_id, payment_id);
		Ok((commitments, add))
	}

	/// Accepts an HTLC offered by the peer, applying our own limits symmetrically.
	pub fn receive_add(&self, add: UpdateAddHTLC) -> Result<Commitments, ChannelError> {
		if add.htlc_id != self.remote_next_htlc_id {
			return Err(ChannelError::UnknownHtlcId { id: add.htlc_id });
		}
		if add.amount_msat < self.local_params.htlc_minimum_msat {
			return Err(ChannelError::HtlcValueTooSmall {
				amount_msat: add.amount_msat,
				minimum_msat: self.local_params.htlc_minimum_msat,
			});
		}

		let mut changes = self.remote_changes.proposed.clone();
		changes.push(UpdateMessage::AddHtlc(add.clone()));
		let reduced = self.local_commit.spec.reduce(&self.local_changes.acked, &changes)?;

		let in_flight_msat = reduced.htlc_value_in_flight_msat(true);
		if in_flight_msat > self.local_params.max_htlc_value_in_flight_msat {
			return Err(ChannelError::HtlcValueTooHighInFlight {
				in_flight_msat,
				maximum_msat: self.local_params.max_htlc_value_in_flight_msat,
			});
		}
		if reduced.htlc_count(true) > self.local_params.max_accepted_htlcs as usize {
			return Err(ChannelError::TooManyAcceptedHtlcs {
				maximum: self.local_params.max_accepted_htlcs,
			});
		}

		let fees = if self.local_params.is_funder {
			0
		} else {
			reduced.commit_tx_fee_sat(self.local_params.dust_limit_satoshis)
		};
		let remaining = (reduced.to_remote_msat / 1000) as i64
			- self.remote_channel_reserve_satoshis() as i64 - fees as i64;
		if remaining < 0 {
			return Err(ChannelError::InsufficientFunds { missing_satoshis: -remaining as u64 });
		}

		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::AddHtlc(add));
		commitments.remote_next_htlc_id += 1;
		Ok(commitments)
	}

	/// Settles an incoming HTLC with its preimage.
	pub fn send_fulfill(
		&self, htlc_id: u64, payment_preimage: PaymentPreimage,
	) -> Result<(Commitments, UpdateFulfillHTLC), ChannelError> {
		let add = self
			.get_incoming_htlc_cross_signed(htlc_id)
			.ok_or(ChannelError::UnknownHtlcId { id: htlc_id })?;
		if self.local_changes.proposed.iter().any(|change| settles(change, htlc_id)) {
			return Err(ChannelError::UnknownHtlcId { id: htlc_id });
		}
		if PaymentHash(Sha256::hash(&payment_preimage.0).to_byte_array()) != add.payment_hash {
			return Err(ChannelError::InvalidHtlcPreimage { id: htlc_id });
		}
		let fulfill = UpdateFulfillHTLC { channel_id: self.channel_id, htlc_id, payment_preimage };
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FulfillHtlc(fulfill.clone()));
		Ok((commitments, fulfill))
	}

	/// Applies the peer's settlement of one of our HTLCs. The upstream notification is
	/// deferred until the settlement is irrevocable, see [`Commitments::receive_revocation`].
	pub fn receive_fulfill(&self, fulfill: UpdateFulfillHTLC) -> Result<Commitments, ChannelError> {
		let add = self
			.get_outgoing_htlc_cross_signed(fulfill.htlc_id)
			.ok_or(ChannelError::UnknownHtlcId { id: fulfill.htlc_id })?;
		if PaymentHash(Sha256::hash(&fulfill.payment_preimage.0).to_byte_array()) != add.payment_hash {
			return Err(ChannelError::InvalidHtlcPreimage { id: fulfill.htlc_id });
		}
		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FulfillHtlc(fulfill));
		Ok(commitments)
	}

	/// Fails an incoming HTLC. The reason is already encrypted by the onion layer with the
	/// HTLC's shared secret.
	pub fn send_fail(
		&self, htlc_id: u64, reason: OnionErrorPacket,
	) -> Result<(Commitments, UpdateFailHTLC), ChannelError> {
		self.get_incoming_htlc_cross_signed(htlc_id)
			.ok_or(ChannelError::UnknownHtlcId { id: htlc_id })?;
		if self.local_changes.proposed.iter().any(|change| settles(change, htlc_id)) {
			return Err(ChannelError::UnknownHtlcId { id: htlc_id });
		}
		let fail = UpdateFailHTLC { channel_id: self.channel_id, htlc_id, reason };
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FailHtlc(fail.clone()));
		Ok((commitments, fail))
	}

	/// Fails an incoming HTLC whose onion we could not even parse.
	pub fn send_fail_malformed(
		&self, htlc_id: u64, sha256_of_onion: [u8; 32], failure_code: u16,
	) -> Result<(Commitments, UpdateFailMalformedHTLC), ChannelError> {
		self.get_incoming_htlc_cross_signed(htlc_id)
			.ok_or(ChannelError::UnknownHtlcId { id: htlc_id })?;
		if self.local_changes.proposed.iter().any(|change| settles(change, htlc_id)) {
			return Err(ChannelError::UnknownHtlcId { id: htlc_id });
		}
		let fail = UpdateFailMalformedHTLC {
			channel_id: self.channel_id,
			htlc_id,
			sha256_of_onion,
			failure_code,
		};
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FailMalformedHtlc(fail.clone()));
		Ok((commitments, fail))
	}

	/// Applies the peer's failure of one of our HTLCs.
	pub fn receive_fail(&self, fail: UpdateFailHTLC) -> Result<Commitments, ChannelError> {
		self.get_outgoing_htlc_cross_signed(fail.htlc_id)
			.ok_or(ChannelError::UnknownHtlcId { id: fail.htlc_id })?;
		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FailHtlc(fail));
		Ok(commitments)
	}

	/// Applies the peer's malformed-failure of one of our HTLCs.
	pub fn receive_fail_malformed(
		&self, fail: UpdateFailMalformedHTLC,
	) -> Result<Commitments, ChannelError> {
		self.get_outgoing_htlc_cross_signed(fail.htlc_id)
			.ok_or(ChannelError::UnknownHtlcId { id: fail.htlc_id })?;
		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FailMalformedHtlc(fail));
		Ok(commitments)
	}

	/// Proposes a new channel feerate. Only the funder pays commitment fees, so only the
	/// funder may change them.
	pub fn send_fee(&self, feerate_per_kw: u32) -> Result<(Commitments, UpdateFee), ChannelError> {
		if !self.local_params.is_funder {
			return Err(ChannelError::FundeeCannotSendUpdateFee);
		}
		let fee = UpdateFee { channel_id: self.channel_id, feerate_per_kw };
		// Only the latest pending fee update matters.
		let mut proposed: Vec<UpdateMessage> = self
			.local_changes
			.proposed
			.iter()
			.filter(|change| !matches!(change, UpdateMessage::Fee(_)))
			.cloned()
			.collect();
		proposed.push(UpdateMessage::Fee(fee.clone()));

		let reduced = self.latest_remote_spec().reduce(&self.remote_changes.acked, &proposed)?;
		let fees = reduced.commit_tx_fee_sat(self.remote_params.dust_limit_satoshis);
		let remaining = (reduced.to_remote_msat / 1000) as i64
			- self.local_channel_reserve_satoshis() as i64 - fees as i64;
		if remaining < 0 {
			return Err(ChannelError::CannotAffordFees { missing_satoshis: -remaining as u64 });
		}

		let mut commitments = self.clone();
		commitments.local_changes.proposed = proposed;
		Ok((commitments, fee))
	}

	/// Validates and applies the funder's feerate change.
	pub fn receive_fee(
		&self, fee: UpdateFee, max_feerate_mismatch_ratio: f64,
	) -> Result<Commitments, ChannelError> {
		if self.local_params.is_funder {
			return Err(ChannelError::FundeeCannotSendUpdateFee);
		}
		let reference = self.local_commit.spec.feerate_per_kw;
		if crate::ln::helpers::is_fee_diff_too_high(
			reference, fee.feerate_per_kw, max_feerate_mismatch_ratio,
		) {
			return Err(ChannelError::FeerateTooDifferent {
				proposed_feerate_per_kw: fee.feerate_per_kw,
				reference_feerate_per_kw: reference,
			});
		}
		let mut proposed: Vec<UpdateMessage> = self
			.remote_changes
			.proposed
			.iter()
			.filter(|change| !matches!(change, UpdateMessage::Fee(_)))
			.cloned()
			.collect();
		proposed.push(UpdateMessage::Fee(fee));

		let reduced = self.local_commit.spec.reduce(&self.local_changes.acked, &proposed)?;
		let fees = reduced.commit_tx_fee_sat(self.local_params.dust_limit_satoshis);
		let remaining = (reduced.to_remote_msat / 1000) as i64
			- self.remote_channel_reserve_satoshis() as i64 - fees as i64;
		if remaining < 0 {
			return Err(ChannelError::CannotAffordFees { missing_satoshis: -remaining as u64 });
		}

		let mut commitments = self.clone();
		commitments.remote_changes.proposed = proposed;
		Ok(commitments)
	}

	/// Signs the peer's next commitment, covering all our proposed changes and everything of
	/// theirs we have acked.
	///
	/// Returns the updated ledger, the `commit_sig` to send, and the HTLC records which MUST
	/// be durably stored before the message goes out.
	pub fn send_commit<S: ChannelSigner, B: TxBuilder>(
		&self, signer: &S, tx_builder: &B,
	) -> Result<(Commitments, CommitmentSigned, Vec<HtlcInfo>), ChannelError> {
		let remote_next_point = match &self.remote_next_commit_info {
			RemoteNextCommitInfo::Revoked(point) => *point,
			RemoteNextCommitInfo::WaitingForRevocation(_) => {
				return Err(ChannelError::CannotSignBeforeRevocation)
			},
		};
		if !self.local_has_changes() {
			return Err(ChannelError::CannotSignWithoutChanges);
		}

		let spec = self
			.remote_commit
			.spec
			.reduce(&self.remote_changes.acked, &self.local_changes.proposed)?;
		let index = self.remote_commit.index + 1;
		let local_pubkeys = signer.pubkeys().clone();
		let params = self.remote_commitment_params(&local_pubkeys, index, remote_next_point);
		let commit_tx = tx_builder.build_commitment_tx(&params, &spec);
		let htlc_txs = tx_builder.build_htlc_txs(&params, &commit_tx);
		let (signature, htlc_signatures) = signer.sign_counterparty_commitment(&commit_tx, &htlc_txs);

		let sent = CommitmentSigned {
			channel_id: self.channel_id,
			signature,
			htlc_signatures,
			channel_data: None,
		};
		let htlc_infos = commit_tx
			.htlc_outputs
			.iter()
			.filter(|htlc| htlc.transaction_output_index.is_some())
			.map(|htlc| HtlcInfo {
				channel_id: self.channel_id,
				commitment_number: index,
				payment_hash: htlc.payment_hash,
				cltv_expiry: htlc.cltv_expiry,
			})
			.collect();

		let mut commitments = self.clone();
		commitments.remote_next_commit_info =
			RemoteNextCommitInfo::WaitingForRevocation(WaitingForRevocation {
				next_remote_commit: RemoteCommit {
					index,
					spec,
					txid: commit_tx.txid(),
					remote_per_commitment_point: remote_next_point,
				},
				sent: sent.clone(),
				sent_after_local_commit_index: self.local_commit.index,
				re_sign_asap: false,
			});
		commitments.local_changes = LocalChanges {
			proposed: Vec::new(),
			signed: self.local_changes.proposed.clone(),
			acked: self.local_changes.acked.clone(),
		};
		commitments.remote_changes = RemoteChanges {
			proposed: self.remote_changes.proposed.clone(),
			acked: Vec::new(),
			signed: self.remote_changes.acked.clone(),
		};
		Ok((commitments, sent, htlc_infos))
	}

	/// Validates the peer's signature over our next commitment, adopts it, and produces the
	/// revocation of our previous one.
	pub fn receive_commit<S: ChannelSigner, B: TxBuilder>(
		&self, msg: &CommitmentSigned, signer: &S, tx_builder: &B,
	) -> Result<(Commitments, RevokeAndACK), ChannelError> {
		if !self.remote_has_changes() {
			return Err(ChannelError::CannotSignWithoutChanges);
		}

		let spec = self
			.local_commit
			.spec
			.reduce(&self.local_changes.acked, &self.remote_changes.proposed)?;
		let index = self.local_commit.index + 1;
		let per_commitment_point = signer.get_per_commitment_point(index);
		let local_pubkeys = signer.pubkeys().clone();
		let params = self.local_commitment_params(&local_pubkeys, index, per_commitment_point);
		let commit_tx = tx_builder.build_commitment_tx(&params, &spec);
		if !tx_builder.check_commitment_sig(
			&commit_tx, &self.commit_input, &self.remote_params.pubkeys.funding_pubkey,
			&msg.signature,
		) {
			return Err(ChannelError::InvalidCommitmentSignature);
		}
		let htlc_txs = tx_builder.build_htlc_txs(&params, &commit_tx);
		if htlc_txs.len() != msg.htlc_signatures.len() {
			return Err(ChannelError::HtlcSigCountMismatch {
				expected: htlc_txs.len(),
				got: msg.htlc_signatures.len(),
			});
		}
		for (htlc_tx, remote_sig) in htlc_txs.iter().zip(msg.htlc_signatures.iter()) {
			if !tx_builder.check_htlc_sig(
				htlc_tx, &commit_tx, &self.remote_params.pubkeys.htlc_basepoint,
				&per_commitment_point, remote_sig,
			) {
				return Err(ChannelError::InvalidCommitmentSignature);
			}
		}

		let (local_sig, local_htlc_sigs) = signer.sign_holder_commitment(&commit_tx, &htlc_txs);
		debug_assert_eq!(local_htlc_sigs.len(), htlc_txs.len());
		let publishable_commit = tx_builder.add_commitment_sigs(
			commit_tx.tx.clone(), &self.commit_input.redeem_script,
			&local_pubkeys.funding_pubkey, &self.remote_params.pubkeys.funding_pubkey,
			&local_sig, &msg.signature,
		);
		let htlc_txs_and_sigs = htlc_txs
			.into_iter()
			.zip(local_htlc_sigs.into_iter().zip(msg.htlc_signatures.iter()))
			.map(|(txinfo, (local_sig, remote_sig))| HTLCTxAndSigs {
				txinfo,
				local_sig,
				remote_sig: *remote_sig,
			})
			.collect();

		let revocation = RevokeAndACK {
			channel_id: self.channel_id,
			per_commitment_secret: signer.release_commitment_secret(self.local_commit.index),
			next_per_commitment_point: signer.get_per_commitment_point(index + 1),
			channel_data: None,
		};

		let mut commitments = self.clone();
		commitments.local_commit = LocalCommit {
			index,
			spec,
			publishable_txs: PublishableTxs { commit_tx: publishable_commit, htlc_txs_and_sigs },
		};
		commitments.local_changes.acked = Vec::new();
		commitments.remote_changes = RemoteChanges {
			proposed: Vec::new(),
			acked: [&self.remote_changes.acked[..], &self.remote_changes.proposed[..]].concat(),
			signed: self.remote_changes.signed.clone(),
		};
		Ok((commitments, revocation))
	}

	/// Verifies the peer's revocation of its previous commitment, advances the remote
	/// commitment, and reports the changes which just became irrevocable.
	pub fn receive_revocation(
		&self, msg: &RevokeAndACK,
	) -> Result<(Commitments, Vec<ChannelAction>), ChannelError> {
		let waiting = match &self.remote_next_commit_info {
			RemoteNextCommitInfo::WaitingForRevocation(waiting) => waiting.clone(),
			RemoteNextCommitInfo::Revoked(_) => return Err(ChannelError::UnexpectedRevocation),
		};
		let secp_ctx = Secp256k1::new();
		let secret = SecretKey::from_slice(&msg.per_commitment_secret)
			.map_err(|_| ChannelError::InvalidRevocation)?;
		if PublicKey::from_secret_key(&secp_ctx, &secret)
			!= self.remote_commit.remote_per_commitment_point
		{
			return Err(ChannelError::InvalidRevocation);
		}
		let mut secrets = self.remote_per_commitment_secrets.clone();
		secrets
			.provide_secret(
				INITIAL_COMMITMENT_NUMBER - self.remote_commit.index,
				msg.per_commitment_secret,
			)
			.map_err(|()| ChannelError::InvalidRevocation)?;

		// Everything we signed into the peer's new commitment is now present in both
		// commitments with the old one revoked: settlements of our HTLCs can be reported
		// upstream and the peer's new HTLCs can be relayed.
		let mut actions = Vec::new();
		let mut payments = self.payments.clone();
		for change in self.remote_changes.signed.iter() {
			match change {
				UpdateMessage::AddHtlc(add) => {
					actions.push(ChannelAction::ProcessAdd { add: add.clone() });
				},
				UpdateMessage::FulfillHtlc(fulfill) => {
					if let Some(payment_id) = payments.remove(&fulfill.htlc_id) {
						actions.push(ChannelAction::ProcessFulfill {
							fulfill: fulfill.clone(),
							payment_id,
						});
					}
				},
				UpdateMessage::FailHtlc(fail) => {
					if let Some(payment_id) = payments.remove(&fail.htlc_id) {
						actions.push(ChannelAction::ProcessFail { fail: fail.clone(), payment_id });
					}
				},
				UpdateMessage::FailMalformedHtlc(fail) => {
					if let Some(payment_id) = payments.remove(&fail.htlc_id) {
						actions.push(ChannelAction::ProcessFailMalformed {
							fail: fail.clone(),
							payment_id,
						});
					}
				},
				UpdateMessage::Fee(_) => {},
			}
		}

		let mut commitments = self.clone();
		commitments.remote_commit = waiting.next_remote_commit;
		commitments.remote_next_commit_info =
			RemoteNextCommitInfo::Revoked(msg.next_per_commitment_point);
		commitments.local_changes = LocalChanges {
			proposed: self.local_changes.proposed.clone(),
			signed: Vec::new(),
			acked: [&self.local_changes.acked[..], &self.local_changes.signed[..]].concat(),
		};
		commitments.remote_changes.signed = Vec::new();
		commitments.remote_per_commitment_secrets = secrets;
		commitments.payments = payments;

		if waiting.re_sign_asap && commitments.local_has_changes() {
			actions.push(ChannelAction::SendToSelf { command: crate::events::ChannelCommand::Sign });
		}
		Ok((commitments, actions))
	}

	/// Reconciles the ledger with the peer's `channel_reestablish` after a reconnection.
	///
	/// Un-signed proposals from before the disconnect are discarded (they were never
	/// received) and the HTLC id counters rewound accordingly; then the commitment numbers in
	/// the message decide what must be retransmitted. Returns the updated ledger, the
	/// messages to resend in order, and whether a fresh signature should follow.
	pub fn handle_sync<S: ChannelSigner>(
		&self, msg: &ChannelReestablish, signer: &S,
	) -> Result<(Commitments, Vec<ChannelMessage>, bool), ChannelError> {
		let mut commitments = self.clone();
		let discarded_local_adds = count_adds(&commitments.local_changes.proposed);
		let discarded_remote_adds = count_adds(&commitments.remote_changes.proposed);
		for change in commitments.local_changes.proposed.iter() {
			if let UpdateMessage::AddHtlc(add) = change {
				commitments.payments.remove(&add.htlc_id);
			}
		}
		commitments.local_changes.proposed.clear();
		commitments.remote_changes.proposed.clear();
		commitments.local_next_htlc_id -= discarded_local_adds;
		commitments.remote_next_htlc_id -= discarded_remote_adds;

		let resend_revocation = if msg.next_remote_revocation_number == commitments.local_commit.index {
			// They have seen all our revocations.
			None
		} else if commitments.local_commit.index >= 1
			&& msg.next_remote_revocation_number == commitments.local_commit.index - 1
		{
			// Our last revoke_and_ack never arrived.
			Some(ChannelMessage::RevokeAndACK(RevokeAndACK {
				channel_id: commitments.channel_id,
				per_commitment_secret: signer
					.release_commitment_secret(commitments.local_commit.index - 1),
				next_per_commitment_point: signer
					.get_per_commitment_point(commitments.local_commit.index + 1),
				channel_data: None,
			}))
		} else {
			return Err(ChannelError::RevocationSyncError);
		};

		let mut retransmit = Vec::new();
		match &commitments.remote_next_commit_info {
			RemoteNextCommitInfo::WaitingForRevocation(waiting)
				if msg.next_local_commitment_number == waiting.next_remote_commit.index + 1 =>
			{
				// They received our commit_sig and are about to revoke on their own.
				if let Some(revocation) = resend_revocation {
					retransmit.push(revocation);
				}
			},
			RemoteNextCommitInfo::WaitingForRevocation(waiting)
				if msg.next_local_commitment_number == waiting.next_remote_commit.index =>
			{
				// Our commit_sig never arrived: resend the signed changes and the very same
				// signature, keeping their original order relative to any lost revocation.
				let revocation_was_sent_last =
					commitments.local_commit.index > waiting.sent_after_local_commit_index;
				if !revocation_was_sent_last {
					if let Some(revocation) = resend_revocation.clone() {
						retransmit.push(revocation);
					}
				}
				for change in commitments.local_changes.signed.iter() {
					retransmit.push(change.to_channel_message());
				}
				retransmit.push(ChannelMessage::CommitmentSigned(waiting.sent.clone()));
				if revocation_was_sent_last {
					if let Some(revocation) = resend_revocation {
						retransmit.push(revocation);
					}
				}
			},
			RemoteNextCommitInfo::WaitingForRevocation(_) => {
				return Err(ChannelError::RevocationSyncError);
			},
			RemoteNextCommitInfo::Revoked(_)
				if msg.next_local_commitment_number == commitments.remote_commit.index + 1 =>
			{
				if let Some(revocation) = resend_revocation {
					retransmit.push(revocation);
				}
			},
			RemoteNextCommitInfo::Revoked(_) => {
				return Err(ChannelError::RevocationSyncError);
			},
		}

		let should_sign = commitments.local_has_changes()
			&& matches!(commitments.remote_next_commit_info, RemoteNextCommitInfo::Revoked(_));
		Ok((commitments, retransmit, should_sign))
	}
}
