// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Events flow into the channel state machine, actions flow out.
//!
//! Because this library has no built-in runtime, it is up to the client to feed every
//! [`ChannelEvent`] into [`crate::ln::channel::Channel::process`] and to execute the returned
//! [`ChannelAction`]s *in order*: in particular a `StoreState` must have completed before any
//! following `PublishTx` or `SendWatch` is acted on, or a crash in between can leave funds
//! broadcast whose claiming state was never persisted.

use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Transaction};

use crate::chain::{WatchEvent, WatchRequest};
use crate::ln::channel::FundedState;
use crate::ln::channel_version::ChannelVersion;
use crate::ln::commitments::{HtlcInfo, LocalParams};
use crate::ln::msgs::{ChannelMessage, Init, OnionErrorPacket, OnionRoutingPacket};
use crate::ln::{ChannelId, PaymentHash, PaymentId, PaymentPreimage};
use crate::util::errors::ChannelError;

/// Everything needed to start opening a channel as its funder.
#[derive(Clone, Debug, PartialEq)]
pub struct InitFunder {
	/// The id the channel goes by until the funding transaction exists.
	pub temporary_channel_id: ChannelId,
	/// The channel value we will fund.
	pub funding_satoshis: u64,
	/// The amount gifted to the fundee as part of the open.
	pub push_msat: u64,
	/// The feerate of the first commitment transactions.
	pub init_feerate_per_kw: u32,
	/// The feerate the funding transaction should aim for.
	pub funding_tx_feerate_per_kw: u32,
	/// Our own channel parameters.
	pub local_params: LocalParams,
	/// Channel flags; bit 0 requests a public announcement.
	pub channel_flags: u8,
	/// The channel semantics to propose.
	pub channel_version: ChannelVersion,
	/// The `init` our peer sent on this connection.
	pub remote_init: Init,
}

/// Everything needed to accept a channel opened by our peer.
#[derive(Clone, Debug, PartialEq)]
pub struct InitFundee {
	/// The temporary id the funder announced.
	pub temporary_channel_id: ChannelId,
	/// Our own channel parameters.
	pub local_params: LocalParams,
	/// The `init` our peer sent on this connection.
	pub remote_init: Init,
	/// Our current view of the chain feerate, to judge the funder's proposal.
	pub current_chain_feerate_per_kw: u32,
}

/// A local request to change or close the channel, executed through
/// [`ChannelEvent::ExecuteCommand`].
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelCommand {
	/// Offer a new HTLC to the peer.
	AddHtlc {
		/// The HTLC value.
		amount_msat: u64,
		/// The hash whose preimage settles the HTLC.
		payment_hash: PaymentHash,
		/// The block height after which the HTLC expires.
		cltv_expiry: u32,
		/// The onion to attach.
		onion_routing_packet: OnionRoutingPacket,
		/// Identifies the payment this HTLC belongs to, for settlement attribution.
		payment_id: PaymentId,
		/// Whether to immediately follow up with a signature.
		commit: bool,
	},
	/// Settle an incoming HTLC with its preimage.
	FulfillHtlc {
		/// The id the peer assigned the HTLC.
		htlc_id: u64,
		/// The preimage.
		payment_preimage: PaymentPreimage,
		/// Whether to immediately follow up with a signature.
		commit: bool,
	},
	/// Fail an incoming HTLC.
	FailHtlc {
		/// The id the peer assigned the HTLC.
		htlc_id: u64,
		/// The failure, already encrypted by the onion layer.
		reason: OnionErrorPacket,
		/// Whether to immediately follow up with a signature.
		commit: bool,
	},
	/// Fail an incoming HTLC whose onion we could not process.
	FailMalformedHtlc {
		/// The id the peer assigned the HTLC.
		htlc_id: u64,
		/// The hash of the onion we could not process.
		sha256_of_onion: [u8; 32],
		/// Why the onion was unprocessable.
		failure_code: u16,
		/// Whether to immediately follow up with a signature.
		commit: bool,
	},
	/// Sign all pending changes.
	Sign,
	/// Update the channel feerate. Only the funder may do this.
	UpdateFee {
		/// The new feerate, per 1000 weight.
		feerate_per_kw: u32,
		/// Whether to immediately follow up with a signature.
		commit: bool,
	},
	/// Start a mutual close, optionally to a specific script.
	Close {
		/// The script to close to; the key manager's shutdown script if `None`.
		script_pubkey: Option<ScriptBuf>,
	},
	/// Unilaterally close by publishing our commitment.
	ForceClose,
}

/// An input to the channel state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
	/// Start opening a channel as funder.
	InitFunder(InitFunder),
	/// Start accepting a channel as fundee.
	InitFundee(InitFundee),
	/// Revive a channel from persisted state at startup. The channel comes back offline and
	/// re-installs its chain watches.
	Restore(Box<FundedState>),
	/// The peer sent us a channel message.
	MessageReceived(ChannelMessage),
	/// The chain watcher observed something we asked about.
	WatchReceived(WatchEvent),
	/// A local command.
	ExecuteCommand(ChannelCommand),
	/// The wallet built the funding transaction we asked for with
	/// [`ChannelAction::MakeFundingTx`].
	MakeFundingTxResponse {
		/// The complete funding transaction, not yet published.
		funding_tx: Transaction,
		/// Which of its outputs is the funding output.
		funding_tx_output_index: u16,
		/// The fee the funding transaction pays.
		fee_satoshis: u64,
	},
	/// A new block was connected.
	NewBlock {
		/// The new chain height.
		height: u32,
	},
	/// The transport to the peer was lost.
	Disconnected,
	/// The transport to the peer is (re-)established.
	Connected {
		/// The `init` we sent on this connection.
		local_init: Init,
		/// The `init` the peer sent on this connection.
		remote_init: Init,
	},
}

/// A side effect requested by the channel state machine, to be executed by the caller in
/// list order.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelAction {
	/// Send a message to the peer.
	SendMessage {
		/// The message to send.
		message: ChannelMessage,
	},
	/// Register a chain watch.
	SendWatch {
		/// The watch to register.
		watch: WatchRequest,
	},
	/// Feed a command back into this same channel after the current actions are executed.
	SendToSelf {
		/// The command to feed back.
		command: ChannelCommand,
	},
	/// An incoming HTLC is irrevocably committed on both sides and can be relayed or
	/// settled.
	ProcessAdd {
		/// The newly locked-in HTLC.
		add: crate::ln::msgs::UpdateAddHTLC,
	},
	/// One of our outgoing HTLCs was fulfilled and the settlement is irrevocable.
	ProcessFulfill {
		/// The peer's fulfillment.
		fulfill: crate::ln::msgs::UpdateFulfillHTLC,
		/// The payment the HTLC belonged to.
		payment_id: PaymentId,
	},
	/// One of our outgoing HTLCs was failed and the failure is irrevocable.
	ProcessFail {
		/// The peer's failure.
		fail: crate::ln::msgs::UpdateFailHTLC,
		/// The payment the HTLC belonged to.
		payment_id: PaymentId,
	},
	/// One of our outgoing HTLCs was failed as malformed and the failure is irrevocable.
	ProcessFailMalformed {
		/// The peer's failure.
		fail: crate::ln::msgs::UpdateFailMalformedHTLC,
		/// The payment the HTLC belonged to.
		payment_id: PaymentId,
	},
	/// The state machine hit a local failure while handling an event; the channel has
	/// already taken the appropriate protective transition.
	ProcessLocalFailure {
		/// The failure.
		error: ChannelError,
	},
	/// Persist the given state. Must complete before any later action in the same list is
	/// executed.
	StoreState {
		/// The state to persist, atomically replacing the previous one.
		state: Box<FundedState>,
	},
	/// Durably record the HTLCs of a remote commitment we are about to sign, so revoked
	/// commitments can be penalized in full even after restarts. Must complete before the
	/// following `SendMessage` carrying the signature.
	StoreHtlcInfos {
		/// One record per non-dust HTLC on the signed commitment.
		htlc_infos: Vec<HtlcInfo>,
	},
	/// A command could not be executed; the channel state is unchanged.
	HandleCommandFailed {
		/// The command that failed.
		command: ChannelCommand,
		/// Why it failed.
		error: ChannelError,
	},
	/// Ask the wallet to build the funding transaction, answered with
	/// [`ChannelEvent::MakeFundingTxResponse`].
	MakeFundingTx {
		/// The script the funding output must pay to.
		script_pubkey: ScriptBuf,
		/// The funding amount.
		amount_satoshis: u64,
		/// The feerate to aim for.
		feerate_per_kw: u32,
	},
	/// Broadcast a transaction.
	PublishTx {
		/// The transaction to broadcast.
		tx: Transaction,
	},
	/// The permanent channel id is known; the channel is also still known under its
	/// temporary id.
	ChannelIdAssigned {
		/// The peer.
		remote_node_id: PublicKey,
		/// The id used so far.
		temporary_channel_id: ChannelId,
		/// The permanent id derived from the funding outpoint.
		channel_id: ChannelId,
	},
	/// From here on, messages use the new channel id. Precedes any action referring to it.
	ChannelIdSwitch {
		/// The id used so far.
		old_channel_id: ChannelId,
		/// The permanent id.
		new_channel_id: ChannelId,
	},
}
