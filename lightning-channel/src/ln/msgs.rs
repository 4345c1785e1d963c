// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages, traversing the channel-relevant subset of BOLT 1 and 2.
//!
//! The structs here are the in-memory shape of the messages; encoding and decoding them onto
//! the wire (TLV streams, noise framing) belongs to the transport layer and is not part of
//! this library. Messages that support the peer-backup feature carry an optional opaque
//! [`EncryptedChannelData`] blob.

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{BlockHash, ScriptBuf, Txid};

use crate::ln::channel_version::ChannelVersion;
use crate::ln::features::InitFeatures;
use crate::ln::{ChannelId, PaymentHash, PaymentPreimage};

/// An opaque, authenticated-encrypted serialization of a channel state, produced and consumed
/// only by the key manager. Peers supporting the backup feature store the latest blob they
/// received from us and echo it back in `channel_reestablish`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedChannelData {
	/// The ciphertext, including its authentication tag and nonce material.
	pub data: Vec<u8>,
}

/// An onion routing packet carried in `update_add_htlc`. Opaque to the channel: building and
/// peeling onions is the relayer's business.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionRoutingPacket {
	/// The raw packet bytes.
	pub data: Vec<u8>,
}

/// An encrypted failure blob carried in `update_fail_htlc`, produced by the onion layer with
/// the HTLC's shared secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionErrorPacket {
	/// The encrypted failure data.
	pub data: Vec<u8>,
}

/// An init message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct Init {
	/// The features the sending node supports.
	pub features: InitFeatures,
}

/// An error message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMessage {
	/// The channel the error applies to. All-zero means all channels.
	pub channel_id: ChannelId,
	/// A possibly printable description of the error.
	pub data: String,
}

/// An open_channel message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct OpenChannel {
	/// The genesis hash of the chain the channel is to be opened on.
	pub chain_hash: BlockHash,
	/// A temporary channel id, until the funding outpoint is announced.
	pub temporary_channel_id: ChannelId,
	/// The channel value.
	pub funding_satoshis: u64,
	/// The amount pushed to the fundee as part of the open.
	pub push_msat: u64,
	/// The threshold below which the funder's outputs should not be generated.
	pub dust_limit_satoshis: u64,
	/// The maximum total value of HTLCs the funder will accept in flight.
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum value the funder requires the fundee to keep on its side.
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size the funder will accept.
	pub htlc_minimum_msat: u64,
	/// The initial commitment feerate, per 1000 weight.
	pub feerate_per_kw: u32,
	/// How long the fundee's outputs are delayed after it broadcasts its commitment.
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs the funder will accept.
	pub max_accepted_htlcs: u16,
	/// The funder's key in the 2-of-2 multisig funding output.
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key on the fundee's commitments.
	pub revocation_basepoint: PublicKey,
	/// The funder's payment key, or its base when keys rotate per commitment.
	pub payment_basepoint: PublicKey,
	/// Used to derive the funder's delayed payment keys.
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive the funder's HTLC keys.
	pub htlc_basepoint: PublicKey,
	/// The per-commitment point for the funder's first commitment.
	pub first_per_commitment_point: PublicKey,
	/// Channel flags; bit 0 requests a public announcement.
	pub channel_flags: u8,
	/// An optional script the funder commits to close to.
	pub shutdown_scriptpubkey: Option<ScriptBuf>,
	/// The channel semantics the funder proposes.
	pub channel_version: Option<ChannelVersion>,
}

/// An accept_channel message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct AcceptChannel {
	/// The same temporary channel id as in `open_channel`.
	pub temporary_channel_id: ChannelId,
	/// The threshold below which the fundee's outputs should not be generated.
	pub dust_limit_satoshis: u64,
	/// The maximum total value of HTLCs the fundee will accept in flight.
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum value the fundee requires the funder to keep on its side.
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size the fundee will accept.
	pub htlc_minimum_msat: u64,
	/// The number of confirmations the fundee requires before the channel operates.
	pub minimum_depth: u32,
	/// How long the funder's outputs are delayed after it broadcasts its commitment.
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs the fundee will accept.
	pub max_accepted_htlcs: u16,
	/// The fundee's key in the 2-of-2 multisig funding output.
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key on the funder's commitments.
	pub revocation_basepoint: PublicKey,
	/// The fundee's payment key, or its base when keys rotate per commitment.
	pub payment_basepoint: PublicKey,
	/// Used to derive the fundee's delayed payment keys.
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive the fundee's HTLC keys.
	pub htlc_basepoint: PublicKey,
	/// The per-commitment point for the fundee's first commitment.
	pub first_per_commitment_point: PublicKey,
	/// An optional script the fundee commits to close to.
	pub shutdown_scriptpubkey: Option<ScriptBuf>,
}

/// A funding_created message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct FundingCreated {
	/// The same temporary channel id as in `open_channel`.
	pub temporary_channel_id: ChannelId,
	/// The funding transaction id.
	pub funding_txid: Txid,
	/// The output index of the funding output.
	pub funding_output_index: u16,
	/// The funder's signature on the fundee's first commitment transaction.
	pub signature: Signature,
}

/// A funding_signed message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct FundingSigned {
	/// The channel id, derived from the funding outpoint.
	pub channel_id: ChannelId,
	/// The fundee's signature on the funder's first commitment transaction.
	pub signature: Signature,
	/// The sender's encrypted channel backup, if it uses the backup feature.
	pub channel_data: Option<EncryptedChannelData>,
}

/// A funding_locked message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct FundingLocked {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The per-commitment point for the sender's next commitment.
	pub next_per_commitment_point: PublicKey,
}

/// A shutdown message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct Shutdown {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The script the sender wants its channel balance paid to.
	pub scriptpubkey: ScriptBuf,
}

/// A closing_signed message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct ClosingSigned {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The fee the sender proposes for the closing transaction.
	pub fee_satoshis: u64,
	/// The sender's signature on the closing transaction at that fee.
	pub signature: Signature,
	/// The sender's encrypted channel backup, if it uses the backup feature.
	pub channel_data: Option<EncryptedChannelData>,
}

/// An update_add_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateAddHTLC {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The sender's id for this HTLC, monotonic per direction.
	pub htlc_id: u64,
	/// The HTLC value.
	pub amount_msat: u64,
	/// The hash whose preimage unlocks the HTLC.
	pub payment_hash: PaymentHash,
	/// The block height after which the HTLC can be reclaimed by the sender.
	pub cltv_expiry: u32,
	/// The onion to forward to the next hop, or to interpret if we are the recipient.
	pub onion_routing_packet: OnionRoutingPacket,
}

/// An update_fulfill_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFulfillHTLC {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The id of the HTLC being settled.
	pub htlc_id: u64,
	/// The preimage proving receipt.
	pub payment_preimage: PaymentPreimage,
}

/// An update_fail_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFailHTLC {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The id of the HTLC being failed.
	pub htlc_id: u64,
	/// The failure, encrypted for the payment's originator.
	pub reason: OnionErrorPacket,
}

/// An update_fail_malformed_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFailMalformedHTLC {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The id of the HTLC being failed.
	pub htlc_id: u64,
	/// The hash of the onion we could not process.
	pub sha256_of_onion: [u8; 32],
	/// Why the onion was unprocessable.
	pub failure_code: u16,
}

/// An update_fee message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFee {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The new commitment feerate, per 1000 weight.
	pub feerate_per_kw: u32,
}

/// A commitment_signed message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentSigned {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The sender's signature on the recipient's next commitment transaction.
	pub signature: Signature,
	/// One signature per non-dust HTLC transaction, in commitment output order.
	pub htlc_signatures: Vec<Signature>,
	/// The sender's encrypted channel backup, if it uses the backup feature.
	pub channel_data: Option<EncryptedChannelData>,
}

/// A revoke_and_ack message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct RevokeAndACK {
	/// The channel id.
	pub channel_id: ChannelId,
	/// The secret revoking the sender's previous commitment.
	pub per_commitment_secret: [u8; 32],
	/// The per-commitment point for the sender's next commitment.
	pub next_per_commitment_point: PublicKey,
	/// The sender's encrypted channel backup, if it uses the backup feature.
	pub channel_data: Option<EncryptedChannelData>,
}

/// A channel_reestablish message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelReestablish {
	/// The channel id.
	pub channel_id: ChannelId,
	/// 1 + the index of the sender's latest signed local commitment.
	pub next_local_commitment_number: u64,
	/// The index of the next commitment the sender expects the recipient to revoke.
	pub next_remote_revocation_number: u64,
	/// The recipient's per-commitment secret the sender last received, proving how far the
	/// sender has seen the recipient revoke. All-zero if none yet.
	pub your_last_per_commitment_secret: [u8; 32],
	/// The per-commitment point of the sender's current commitment.
	pub my_current_per_commitment_point: PublicKey,
	/// The recipient's own backup, echoed back if the sender stores backups for its peers.
	pub channel_data: Option<EncryptedChannelData>,
}

/// All channel-level messages a peer can send us, as one closed sum for dispatch.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum ChannelMessage {
	OpenChannel(OpenChannel),
	AcceptChannel(AcceptChannel),
	FundingCreated(FundingCreated),
	FundingSigned(FundingSigned),
	FundingLocked(FundingLocked),
	UpdateAddHTLC(UpdateAddHTLC),
	UpdateFulfillHTLC(UpdateFulfillHTLC),
	UpdateFailHTLC(UpdateFailHTLC),
	UpdateFailMalformedHTLC(UpdateFailMalformedHTLC),
	UpdateFee(UpdateFee),
	CommitmentSigned(CommitmentSigned),
	RevokeAndACK(RevokeAndACK),
	Shutdown(Shutdown),
	ClosingSigned(ClosingSigned),
	ChannelReestablish(ChannelReestablish),
	Error(ErrorMessage),
}

impl ChannelMessage {
	/// The channel (or temporary channel) id the message addresses.
	pub fn channel_id(&self) -> ChannelId {
		match self {
			ChannelMessage::OpenChannel(msg) => msg.temporary_channel_id,
			ChannelMessage::AcceptChannel(msg) => msg.temporary_channel_id,
			ChannelMessage::FundingCreated(msg) => msg.temporary_channel_id,
			ChannelMessage::FundingSigned(msg) => msg.channel_id,
			ChannelMessage::FundingLocked(msg) => msg.channel_id,
			ChannelMessage::UpdateAddHTLC(msg) => msg.channel_id,
			ChannelMessage::UpdateFulfillHTLC(msg) => msg.channel_id,
			ChannelMessage::UpdateFailHTLC(msg) => msg.channel_id,
			ChannelMessage::UpdateFailMalformedHTLC(msg) => msg.channel_id,
			ChannelMessage::UpdateFee(msg) => msg.channel_id,
			ChannelMessage::CommitmentSigned(msg) => msg.channel_id,
			ChannelMessage::RevokeAndACK(msg) => msg.channel_id,
			ChannelMessage::Shutdown(msg) => msg.channel_id,
			ChannelMessage::ClosingSigned(msg) => msg.channel_id,
			ChannelMessage::ChannelReestablish(msg) => msg.channel_id,
			ChannelMessage::Error(msg) => msg.channel_id,
		}
	}
}

/// An update to the channel state (BOLT 2 calls these "updates"): the subset of messages that
/// ride the proposed/signed/acked change lists between commitment signatures.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum UpdateMessage {
	AddHtlc(UpdateAddHTLC),
	FulfillHtlc(UpdateFulfillHTLC),
	FailHtlc(UpdateFailHTLC),
	FailMalformedHtlc(UpdateFailMalformedHTLC),
	Fee(UpdateFee),
}

impl UpdateMessage {
	/// Wraps the update back into the message enum for (re)transmission.
	pub fn to_channel_message(&self) -> ChannelMessage {
		match self {
			UpdateMessage::AddHtlc(msg) => ChannelMessage::UpdateAddHTLC(msg.clone()),
			UpdateMessage::FulfillHtlc(msg) => ChannelMessage::UpdateFulfillHTLC(msg.clone()),
			UpdateMessage::FailHtlc(msg) => ChannelMessage::UpdateFailHTLC(msg.clone()),
			UpdateMessage::FailMalformedHtlc(msg) => ChannelMessage::UpdateFailMalformedHTLC(msg.clone()),
			UpdateMessage::Fee(msg) => ChannelMessage::UpdateFee(msg.clone()),
		}
	}
}
