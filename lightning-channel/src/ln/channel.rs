// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel state machine.
//!
//! [`Channel::process`] is the single entry point: it takes the channel by reference, an
//! event, and the collaborator handles, and returns the successor channel plus the ordered
//! actions the caller must execute. Internal handlers return `Result`; the only place errors
//! are caught is [`Channel::process`] itself, which converts them into the protective
//! transition appropriate for the state we were in (abort an unfunded channel, force-close a
//! funded one).

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Transaction;

use crate::chain::{WatchEvent, WatchRequest, WatchTag};
use crate::events::{ChannelAction, ChannelCommand, ChannelEvent, InitFundee, InitFunder};
use crate::ln::chan_utils::{InputInfo, INITIAL_COMMITMENT_NUMBER};
use crate::ln::channel_version::ChannelVersion;
use crate::ln::closing::{
	claim_current_local_commit_tx_outputs, claim_remote_commit_main_output,
	claim_remote_commit_tx_outputs, claim_revoked_remote_commit_tx_outputs, first_closing_fee,
	local_commit_published_actions, make_closing_tx, next_closing_fee,
	remote_commit_published_actions, revoked_commit_published_actions, Closing,
	ClosingTxProposed,
};
use crate::ln::commitment_spec::CommitmentSpec;
use crate::ln::commitments::{
	Commitments, LocalChanges, LocalCommit, LocalParams, PublishableTxs, RemoteChanges,
	RemoteCommit, RemoteNextCommitInfo, RemoteParams,
};
use crate::ln::helpers::{
	is_valid_final_script_pubkey, make_first_commit_txs, min_depth_for_funding,
	validate_params_fundee, validate_params_funder,
};
use crate::ln::msgs::{
	AcceptChannel, ChannelMessage, ChannelReestablish, ClosingSigned, CommitmentSigned,
	ErrorMessage, FundingCreated, FundingLocked, FundingSigned, OpenChannel, RevokeAndACK,
	Shutdown,
};
use crate::ln::chan_utils::CommitmentTxInfo;
use crate::ln::ChannelId;
use crate::sign::{ChannelSigner, KeysInterface, TxBuilder};
use crate::util::config::NodeParams;
use crate::util::errors::ChannelError;
use crate::util::logger::Logger;

use core::ops::Deref;
use std::collections::HashMap;

/// The protocol-wide cap on concurrently pending HTLCs per direction.
pub const MAX_ACCEPTED_HTLCS: u16 = 483;
/// The lowest dust limit we accept from a peer where real funds are at stake.
pub const MIN_DUST_LIMIT_SATOSHIS: u64 = 546;
/// The highest dust limit we accept from a peer.
pub const MAX_DUST_LIMIT_SATOSHIS: u64 = 100_000;
/// The smallest channel we accept.
pub const MIN_FUNDING_SATOSHIS: u64 = 1_000;
/// After this many `closing_signed` exchanges we accept the peer's fee rather than keep
/// haggling forever.
pub const MAX_NEGOTIATION_ITERATIONS: usize = 20;
/// The minimum margin, in blocks, an HTLC must leave us to claim it on chain.
pub const MIN_CLTV_EXPIRY_DELTA: u32 = 18;
/// The maximum time, in blocks, we allow an HTLC to remain pending.
pub const MAX_CLTV_EXPIRY_DELTA: u32 = 7 * 144;
/// The longest we ever allow our funds to be frozen after a unilateral close.
pub const MAX_TO_SELF_DELAY: u16 = 2016;
/// A fundee gives up on an unconfirmed funding transaction after this many blocks (5 days).
pub const FUNDING_TIMEOUT_FUNDEE_BLOCKS: u32 = 720;
/// Confirmations required before a channel may be publicly announced.
pub const ANNOUNCEMENTS_MINCONF: u32 = 6;

/// Node-wide context of a channel, fixed at creation.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticParams {
	/// The node policy in force when the channel was created.
	pub node_params: NodeParams,
	/// The peer on the other end.
	pub remote_node_id: PublicKey,
}

/// Fundee, waiting for the funder's `open_channel`.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForOpenChannel {
	/// The parameters we were initialized with.
	pub init: InitFundee,
}

/// Funder, waiting for the fundee's `accept_channel`.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForAcceptChannel {
	/// The parameters we were initialized with.
	pub init: InitFunder,
	/// The `open_channel` we sent.
	pub last_sent: OpenChannel,
}

/// Funder, waiting for the wallet to build the funding transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForFundingInternal {
	/// The id the channel goes by until the funding outpoint is known.
	pub temporary_channel_id: ChannelId,
	/// Our parameters.
	pub local_params: LocalParams,
	/// The peer's parameters, from its `accept_channel`.
	pub remote_params: RemoteParams,
	/// The channel value.
	pub funding_satoshis: u64,
	/// The amount pushed to the fundee.
	pub push_msat: u64,
	/// The feerate of the first commitments.
	pub initial_feerate_per_kw: u32,
	/// The fundee's first per-commitment point.
	pub remote_first_per_commitment_point: PublicKey,
	/// Channel flags from our `open_channel`.
	pub channel_flags: u8,
	/// The channel semantics in force.
	pub channel_version: ChannelVersion,
	/// The `open_channel` we sent.
	pub last_sent: OpenChannel,
}

/// Fundee, waiting for the funder's `funding_created`.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForFundingCreated {
	/// The id the channel goes by until the funding outpoint is known.
	pub temporary_channel_id: ChannelId,
	/// Our parameters.
	pub local_params: LocalParams,
	/// The peer's parameters, from its `open_channel`.
	pub remote_params: RemoteParams,
	/// The channel value.
	pub funding_satoshis: u64,
	/// The amount pushed to us.
	pub push_msat: u64,
	/// The feerate of the first commitments.
	pub initial_feerate_per_kw: u32,
	/// The funder's first per-commitment point.
	pub remote_first_per_commitment_point: PublicKey,
	/// Channel flags from the `open_channel`.
	pub channel_flags: u8,
	/// The channel semantics in force.
	pub channel_version: ChannelVersion,
	/// The `accept_channel` we sent.
	pub last_sent: AcceptChannel,
}

/// Funder, waiting for the fundee's signature on our first commitment.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForFundingSigned {
	/// The permanent channel id, derived from the funding outpoint.
	pub channel_id: ChannelId,
	/// The temporary id the handshake ran under.
	pub temporary_channel_id: ChannelId,
	/// Our parameters.
	pub local_params: LocalParams,
	/// The peer's parameters.
	pub remote_params: RemoteParams,
	/// The funding transaction, unpublished until the fundee signs.
	pub funding_tx: Transaction,
	/// The fee the funding transaction pays.
	pub funding_tx_fee_satoshis: u64,
	/// Our first commitment's content.
	pub local_spec: CommitmentSpec,
	/// Our first commitment transaction, unsigned.
	pub local_commit_tx: CommitmentTxInfo,
	/// The fundee's first commitment, which we signed in `funding_created`.
	pub remote_commit: RemoteCommit,
	/// Channel flags from our `open_channel`.
	pub channel_flags: u8,
	/// The channel semantics in force.
	pub channel_version: ChannelVersion,
	/// The funding output.
	pub commit_input: InputInfo,
	/// The `funding_created` we sent.
	pub last_sent: FundingCreated,
}

/// Funded, waiting for the funding transaction to reach its minimum depth.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForFundingConfirmed {
	/// The ledger.
	pub commitments: Commitments,
	/// The funding transaction, if we funded and may need to republish it.
	pub funding_tx: Option<Transaction>,
	/// The height at which we started waiting.
	pub waiting_since_block: u32,
	/// A `funding_locked` the peer sent early, replayed once we confirm.
	pub deferred: Option<FundingLocked>,
}

/// Funding confirmed on our side, waiting for the `funding_locked` exchange to complete.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForFundingLocked {
	/// The ledger.
	pub commitments: Commitments,
	/// The `funding_locked` we sent.
	pub last_sent: FundingLocked,
}

/// The operational state: HTLCs can flow.
#[derive(Clone, Debug, PartialEq)]
pub struct Normal {
	/// The ledger.
	pub commitments: Commitments,
	/// Whether the funding transaction is buried deeply enough to announce.
	pub buried: bool,
	/// Our `shutdown`, if we have initiated a close.
	pub local_shutdown: Option<Shutdown>,
	/// The peer's `shutdown`, if it initiated a close while changes were still unsigned.
	pub remote_shutdown: Option<Shutdown>,
}

/// Both `shutdown`s exchanged, pending HTLCs still being settled.
#[derive(Clone, Debug, PartialEq)]
pub struct ShuttingDown {
	/// The ledger.
	pub commitments: Commitments,
	/// Our `shutdown`.
	pub local_shutdown: Shutdown,
	/// The peer's `shutdown`.
	pub remote_shutdown: Shutdown,
}

/// No HTLCs left; negotiating the mutual close fee.
#[derive(Clone, Debug, PartialEq)]
pub struct Negotiating {
	/// The ledger.
	pub commitments: Commitments,
	/// Our `shutdown`.
	pub local_shutdown: Shutdown,
	/// The peer's `shutdown`.
	pub remote_shutdown: Shutdown,
	/// Our proposals, one inner list per negotiation round (a reconnection starts a new
	/// round).
	pub closing_txs_proposed: Vec<Vec<ClosingTxProposed>>,
	/// The best closing transaction we hold both signatures for but have not published.
	pub best_unpublished_closing_tx: Option<Transaction>,
}

/// We proved to the peer that we are behind; waiting for it to publish its current
/// commitment so we can recover our main output.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForRemotePublishFutureCommitment {
	/// The (outdated) ledger.
	pub commitments: Commitments,
	/// The peer's reestablish which proved us outdated, including the per-commitment point
	/// we will need to claim our output.
	pub remote_channel_reestablish: ChannelReestablish,
}

/// The funding output was spent by something we cannot attribute to either side. There is
/// nothing safe left to do automatically.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorInformationLeak {
	/// The ledger, for forensics.
	pub commitments: Commitments,
}

/// Every state a funded channel can be in. This is also the unit of persistence: the whole
/// value travels in [`ChannelAction::StoreState`] and in encrypted peer backups.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum FundedState {
	WaitForFundingConfirmed(WaitForFundingConfirmed),
	WaitForFundingLocked(WaitForFundingLocked),
	Normal(Normal),
	ShuttingDown(ShuttingDown),
	Negotiating(Negotiating),
	Closing(Closing),
	Closed(Closing),
	WaitForRemotePublishFutureCommitment(WaitForRemotePublishFutureCommitment),
	ErrorInformationLeak(ErrorInformationLeak),
}

impl FundedState {
	/// The ledger of this state.
	pub fn commitments(&self) -> &Commitments {
		match self {
			FundedState::WaitForFundingConfirmed(state) => &state.commitments,
			FundedState::WaitForFundingLocked(state) => &state.commitments,
			FundedState::Normal(state) => &state.commitments,
			FundedState::ShuttingDown(state) => &state.commitments,
			FundedState::Negotiating(state) => &state.commitments,
			FundedState::Closing(state) => &state.commitments,
			FundedState::Closed(state) => &state.commitments,
			FundedState::WaitForRemotePublishFutureCommitment(state) => &state.commitments,
			FundedState::ErrorInformationLeak(state) => &state.commitments,
		}
	}

	/// The channel id.
	pub fn channel_id(&self) -> ChannelId {
		self.commitments().channel_id
	}

	fn name(&self) -> &'static str {
		match self {
			FundedState::WaitForFundingConfirmed(_) => "WaitForFundingConfirmed",
			FundedState::WaitForFundingLocked(_) => "WaitForFundingLocked",
			FundedState::Normal(_) => "Normal",
			FundedState::ShuttingDown(_) => "ShuttingDown",
			FundedState::Negotiating(_) => "Negotiating",
			FundedState::Closing(_) => "Closing",
			FundedState::Closed(_) => "Closed",
			FundedState::WaitForRemotePublishFutureCommitment(_) => {
				"WaitForRemotePublishFutureCommitment"
			},
			FundedState::ErrorInformationLeak(_) => "ErrorInformationLeak",
		}
	}
}

/// Whether the transport to the peer is up, and how far reestablishment has progressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
	/// Connected and synchronized.
	Online,
	/// Transport down. Chain events still apply; peer messages and most commands do not.
	Offline,
	/// Transport up, `channel_reestablish` not yet exchanged.
	Syncing {
		/// Whether we hold our own `channel_reestablish` back until the peer's arrives,
		/// because the peer may be holding a fresher backup of our state.
		wait_for_their_reestablish: bool,
	},
}

/// A funded channel: its connection phase and its protocol state, kept orthogonal.
#[derive(Clone, Debug, PartialEq)]
pub struct FundedChannel {
	/// Connection phase.
	pub phase: Phase,
	/// Protocol state.
	pub state: FundedState,
}

/// Every state a channel can be in.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum ChannelState {
	/// Fresh channel, no role assigned yet.
	WaitForInit,
	WaitForOpenChannel(WaitForOpenChannel),
	WaitForAcceptChannel(WaitForAcceptChannel),
	WaitForFundingInternal(WaitForFundingInternal),
	WaitForFundingCreated(WaitForFundingCreated),
	WaitForFundingSigned(WaitForFundingSigned),
	Funded(FundedChannel),
	/// Terminal: the channel died before anything reached the chain.
	Aborted,
}

impl ChannelState {
	fn name(&self) -> &'static str {
		match self {
			ChannelState::WaitForInit => "WaitForInit",
			ChannelState::WaitForOpenChannel(_) => "WaitForOpenChannel",
			ChannelState::WaitForAcceptChannel(_) => "WaitForAcceptChannel",
			ChannelState::WaitForFundingInternal(_) => "WaitForFundingInternal",
			ChannelState::WaitForFundingCreated(_) => "WaitForFundingCreated",
			ChannelState::WaitForFundingSigned(_) => "WaitForFundingSigned",
			ChannelState::Funded(funded) => funded.state.name(),
			ChannelState::Aborted => "Aborted",
		}
	}
}

/// A channel with one peer, from handshake to on-chain resolution, as a pure value.
#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
	/// Node-wide context.
	pub static_params: StaticParams,
	/// Our view of the chain height, fed by [`ChannelEvent::NewBlock`].
	pub current_block_height: u32,
	/// Where the channel is in its lifecycle.
	pub state: ChannelState,
}

fn store(state: &FundedState) -> ChannelAction {
	ChannelAction::StoreState { state: Box::new(state.clone()) }
}

fn send(message: ChannelMessage) -> ChannelAction {
	ChannelAction::SendMessage { message }
}

fn error_message(channel_id: ChannelId, error: &ChannelError) -> ChannelMessage {
	ChannelMessage::Error(ErrorMessage { channel_id, data: error.to_string() })
}

impl Channel {
	/// A fresh channel with the given peer, in `WaitForInit`.
	pub fn new(static_params: StaticParams) -> Channel {
		Channel { static_params, current_block_height: 0, state: ChannelState::WaitForInit }
	}

	/// Feeds one event through the state machine.
	///
	/// Total: any event in any state produces a successor channel and a (possibly empty)
	/// list of actions, which the caller must execute in order. Internal failures are
	/// converted into the protective transition for the current state; they never escape.
	pub fn process<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, event: ChannelEvent, keys: &K, tx_builder: &B, logger: &L,
	) -> (Channel, Vec<ChannelAction>)
	where
		L::Target: Logger,
	{
		match self.process_internal(&event, keys, tx_builder, logger) {
			Ok((channel, actions)) => {
				let actions = channel.attach_channel_backup(actions, keys);
				(channel, actions)
			},
			Err(error) => self.handle_local_error(&event, error, keys, tx_builder, logger),
		}
	}

	fn with_state(&self, state: ChannelState) -> Channel {
		Channel {
			static_params: self.static_params.clone(),
			current_block_height: self.current_block_height,
			state,
		}
	}

	fn with_funded(&self, phase: Phase, state: FundedState) -> Channel {
		self.with_state(ChannelState::Funded(FundedChannel { phase, state }))
	}

	/// When the peer stores backups for us, every message that advances the channel carries
	/// our latest encrypted state so a fresh install can pick up where we left off.
	fn attach_channel_backup<K: KeysInterface>(
		&self, mut actions: Vec<ChannelAction>, keys: &K,
	) -> Vec<ChannelAction> {
		let funded_state = match &self.state {
			ChannelState::Funded(funded) => &funded.state,
			_ => return actions,
		};
		if !funded_state.commitments().local_params.features.supports_channel_backup_client() {
			return actions;
		}
		for action in actions.iter_mut() {
			if let ChannelAction::SendMessage { message } = action {
				let backup = || Some(keys.encrypt_channel_data(funded_state));
				match message {
					ChannelMessage::FundingSigned(msg) => msg.channel_data = backup(),
					ChannelMessage::CommitmentSigned(msg) => msg.channel_data = backup(),
					ChannelMessage::RevokeAndACK(msg) => msg.channel_data = backup(),
					ChannelMessage::ClosingSigned(msg) => msg.channel_data = backup(),
					_ => {},
				}
			}
		}
		actions
	}

	fn process_internal<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, event: &ChannelEvent, keys: &K, tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		// Events that apply uniformly, before per-state dispatch.
		match event {
			ChannelEvent::NewBlock { height } => return self.on_new_block(*height, logger),
			ChannelEvent::Disconnected => return self.on_disconnected(logger),
			_ => {},
		}

		match (&self.state, event) {
			(ChannelState::WaitForInit, ChannelEvent::InitFunder(init)) => {
				self.init_funder(init, keys)
			},
			(ChannelState::WaitForInit, ChannelEvent::InitFundee(init)) => Ok((
				self.with_state(ChannelState::WaitForOpenChannel(WaitForOpenChannel {
					init: init.clone(),
				})),
				Vec::new(),
			)),
			(ChannelState::WaitForInit, ChannelEvent::Restore(state)) => self.restore(state),
			(
				ChannelState::WaitForOpenChannel(state),
				ChannelEvent::MessageReceived(ChannelMessage::OpenChannel(msg)),
			) => self.on_open_channel(state, msg, keys),
			(
				ChannelState::WaitForAcceptChannel(state),
				ChannelEvent::MessageReceived(ChannelMessage::AcceptChannel(msg)),
			) => self.on_accept_channel(state, msg, keys, tx_builder),
			(
				ChannelState::WaitForFundingInternal(state),
				ChannelEvent::MakeFundingTxResponse {
					funding_tx,
					funding_tx_output_index,
					fee_satoshis,
				},
			) => self.on_funding_tx_built(
				state, funding_tx, *funding_tx_output_index, *fee_satoshis, keys, tx_builder,
			),
			(
				ChannelState::WaitForFundingCreated(state),
				ChannelEvent::MessageReceived(ChannelMessage::FundingCreated(msg)),
			) => self.on_funding_created(state, msg, keys, tx_builder),
			(
				ChannelState::WaitForFundingSigned(state),
				ChannelEvent::MessageReceived(ChannelMessage::FundingSigned(msg)),
			) => self.on_funding_signed(state, msg, keys, tx_builder),
			(ChannelState::Funded(funded), event) => {
				self.process_funded(funded, event, keys, tx_builder, logger)
			},
			(state, event) => {
				log_warn!(
					logger,
					"unhandled event {:?} in state {}, ignoring",
					event_name(event),
					state.name()
				);
				Ok((self.clone(), Vec::new()))
			},
		}
	}

	fn on_new_block<L: Deref>(
		&self, height: u32, _logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let mut channel = self.clone();
		channel.current_block_height = height;
		if let ChannelState::Funded(funded) = &channel.state {
			if let FundedState::WaitForFundingConfirmed(state) = &funded.state {
				let is_funder = state.commitments.local_params.is_funder;
				if !is_funder
					&& height.saturating_sub(state.waiting_since_block)
						> FUNDING_TIMEOUT_FUNDEE_BLOCKS
				{
					// A fundee has nothing on chain to defend; walk away with an error and
					// no on-chain action.
					let error = ChannelError::FundingTxTimedOut;
					let actions = vec![
						send(error_message(state.commitments.channel_id, &error)),
						ChannelAction::ProcessLocalFailure { error },
					];
					return Ok((channel.with_state(ChannelState::Aborted), actions));
				}
			}
		}
		Ok((channel, Vec::new()))
	}

	fn on_disconnected<L: Deref>(
		&self, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		match &self.state {
			ChannelState::Funded(funded) => {
				Ok((self.with_funded(Phase::Offline, funded.state.clone()), Vec::new()))
			},
			ChannelState::WaitForInit | ChannelState::Aborted => Ok((self.clone(), Vec::new())),
			state => {
				// The handshake has no persistence; a lost connection means starting over.
				log_info!(logger, "disconnected during handshake in state {}, aborting", state.name());
				Ok((self.with_state(ChannelState::Aborted), Vec::new()))
			},
		}
	}

	fn init_funder<K: KeysInterface>(
		&self, init: &InitFunder, keys: &K,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let signer = keys.derive_channel_signer(init.local_params.channel_keys_id);
		let pubkeys = signer.pubkeys().clone();
		let open = OpenChannel {
			chain_hash: self.static_params.node_params.chain_hash,
			temporary_channel_id: init.temporary_channel_id,
			funding_satoshis: init.funding_satoshis,
			push_msat: init.push_msat,
			dust_limit_satoshis: init.local_params.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: init.local_params.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: init.local_params.channel_reserve_satoshis,
			htlc_minimum_msat: init.local_params.htlc_minimum_msat,
			feerate_per_kw: init.init_feerate_per_kw,
			to_self_delay: init.local_params.to_self_delay,
			max_accepted_htlcs: init.local_params.max_accepted_htlcs,
			funding_pubkey: pubkeys.funding_pubkey,
			revocation_basepoint: pubkeys.revocation_basepoint,
			payment_basepoint: pubkeys.payment_basepoint,
			delayed_payment_basepoint: pubkeys.delayed_payment_basepoint,
			htlc_basepoint: pubkeys.htlc_basepoint,
			first_per_commitment_point: signer.get_per_commitment_point(0),
			channel_flags: init.channel_flags,
			shutdown_scriptpubkey: None,
			channel_version: Some(init.channel_version),
		};
		let actions = vec![send(ChannelMessage::OpenChannel(open.clone()))];
		Ok((
			self.with_state(ChannelState::WaitForAcceptChannel(WaitForAcceptChannel {
				init: init.clone(),
				last_sent: open,
			})),
			actions,
		))
	}

	fn restore(
		&self, state: &FundedState,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let commitments = state.commitments();
		let mut actions = Vec::new();
		actions.push(ChannelAction::SendWatch {
			watch: WatchRequest::Spent {
				channel_id: commitments.channel_id,
				txid: commitments.commit_input.outpoint.txid,
				output_index: commitments.commit_input.outpoint.vout,
				script_pubkey: commitments.commit_input.tx_out.script_pubkey.clone(),
				tag: WatchTag::FundingSpent,
			},
		});
		let min_depth = self.static_params.node_params.min_depth_blocks;
		match state {
			FundedState::WaitForFundingConfirmed(waiting) => {
				actions.push(ChannelAction::SendWatch {
					watch: WatchRequest::Confirmed {
						channel_id: commitments.channel_id,
						txid: commitments.commit_input.outpoint.txid,
						min_depth,
						tag: WatchTag::FundingDepthOk,
					},
				});
				if let Some(funding_tx) = &waiting.funding_tx {
					actions.push(ChannelAction::PublishTx { tx: funding_tx.clone() });
				}
			},
			FundedState::Closing(closing) => {
				if let Some(funding_tx) = &closing.funding_tx {
					actions.push(ChannelAction::PublishTx { tx: funding_tx.clone() });
				}
				for tx in closing.mutual_close_published.iter() {
					actions.push(ChannelAction::PublishTx { tx: tx.clone() });
					actions.push(ChannelAction::SendWatch {
						watch: WatchRequest::Confirmed {
							channel_id: commitments.channel_id,
							txid: tx.compute_txid(),
							min_depth,
							tag: WatchTag::TxConfirmed(tx.compute_txid()),
						},
					});
				}
				if let Some(lcp) = &closing.local_commit_published {
					actions.extend(local_commit_published_actions(
						commitments.channel_id, lcp, min_depth,
					));
				}
				if let Some(rcp) = &closing.current_remote_commit_published {
					actions.extend(remote_commit_published_actions(
						commitments.channel_id, rcp, min_depth,
					));
				}
				if let Some(rcp) = &closing.next_remote_commit_published {
					actions.extend(remote_commit_published_actions(
						commitments.channel_id, rcp, min_depth,
					));
				}
				if let Some(rcp) = &closing.future_remote_commit_published {
					actions.extend(remote_commit_published_actions(
						commitments.channel_id, rcp, min_depth,
					));
				}
				for rvk in closing.revoked_commit_published.iter() {
					actions.extend(revoked_commit_published_actions(
						commitments.channel_id, rvk, min_depth,
					));
				}
			},
			_ => {},
		}
		Ok((self.with_funded(Phase::Offline, state.clone()), actions))
	}

	fn on_open_channel<K: KeysInterface>(
		&self, state: &WaitForOpenChannel, msg: &OpenChannel, keys: &K,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let channel_version = msg.channel_version.unwrap_or(ChannelVersion::STANDARD);
		validate_params_fundee(
			&self.static_params.node_params, msg, channel_version,
			state.init.current_chain_feerate_per_kw,
		)?;
		let local_params = &state.init.local_params;
		let signer = keys.derive_channel_signer(local_params.channel_keys_id);
		let pubkeys = signer.pubkeys().clone();
		let accept = AcceptChannel {
			temporary_channel_id: msg.temporary_channel_id,
			dust_limit_satoshis: local_params.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: local_params.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: local_params.channel_reserve_satoshis,
			htlc_minimum_msat: local_params.htlc_minimum_msat,
			minimum_depth: min_depth_for_funding(
				&self.static_params.node_params, msg.funding_satoshis,
			),
			to_self_delay: local_params.to_self_delay,
			max_accepted_htlcs: local_params.max_accepted_htlcs,
			funding_pubkey: pubkeys.funding_pubkey,
			revocation_basepoint: pubkeys.revocation_basepoint,
			payment_basepoint: pubkeys.payment_basepoint,
			delayed_payment_basepoint: pubkeys.delayed_payment_basepoint,
			htlc_basepoint: pubkeys.htlc_basepoint,
			first_per_commitment_point: signer.get_per_commitment_point(0),
			shutdown_scriptpubkey: None,
		};
		let remote_params = RemoteParams {
			dust_limit_satoshis: msg.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: msg.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: msg.channel_reserve_satoshis,
			htlc_minimum_msat: msg.htlc_minimum_msat,
			to_self_delay: msg.to_self_delay,
			max_accepted_htlcs: msg.max_accepted_htlcs,
			pubkeys: crate::ln::chan_utils::ChannelPublicKeys {
				funding_pubkey: msg.funding_pubkey,
				revocation_basepoint: msg.revocation_basepoint,
				payment_basepoint: msg.payment_basepoint,
				delayed_payment_basepoint: msg.delayed_payment_basepoint,
				htlc_basepoint: msg.htlc_basepoint,
			},
			features: state.init.remote_init.features.clone(),
			shutdown_scriptpubkey: msg.shutdown_scriptpubkey.clone(),
		};
		let next = WaitForFundingCreated {
			temporary_channel_id: msg.temporary_channel_id,
			local_params: local_params.clone(),
			remote_params,
			funding_satoshis: msg.funding_satoshis,
			push_msat: msg.push_msat,
			initial_feerate_per_kw: msg.feerate_per_kw,
			remote_first_per_commitment_point: msg.first_per_commitment_point,
			channel_flags: msg.channel_flags,
			channel_version,
			last_sent: accept.clone(),
		};
		Ok((
			self.with_state(ChannelState::WaitForFundingCreated(next)),
			vec![send(ChannelMessage::AcceptChannel(accept))],
		))
	}

	fn on_accept_channel<K: KeysInterface, B: TxBuilder>(
		&self, state: &WaitForAcceptChannel, msg: &AcceptChannel, keys: &K, tx_builder: &B,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		validate_params_funder(&self.static_params.node_params, &state.last_sent, msg)?;
		let signer = keys.derive_channel_signer(state.init.local_params.channel_keys_id);
		let remote_params = RemoteParams {
			dust_limit_satoshis: msg.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: msg.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: msg.channel_reserve_satoshis,
			htlc_minimum_msat: msg.htlc_minimum_msat,
			to_self_delay: msg.to_self_delay,
			max_accepted_htlcs: msg.max_accepted_htlcs,
			pubkeys: crate::ln::chan_utils::ChannelPublicKeys {
				funding_pubkey: msg.funding_pubkey,
				revocation_basepoint: msg.revocation_basepoint,
				payment_basepoint: msg.payment_basepoint,
				delayed_payment_basepoint: msg.delayed_payment_basepoint,
				htlc_basepoint: msg.htlc_basepoint,
			},
			features: state.init.remote_init.features.clone(),
			shutdown_scriptpubkey: msg.shutdown_scriptpubkey.clone(),
		};
		let (_, funding_script_pubkey) = tx_builder.make_funding_script(
			&signer.pubkeys().funding_pubkey, &remote_params.pubkeys.funding_pubkey,
		);
		let next = WaitForFundingInternal {
			temporary_channel_id: state.init.temporary_channel_id,
			local_params: state.init.local_params.clone(),
			remote_params,
			funding_satoshis: state.init.funding_satoshis,
			push_msat: state.init.push_msat,
			initial_feerate_per_kw: state.init.init_feerate_per_kw,
			remote_first_per_commitment_point: msg.first_per_commitment_point,
			channel_flags: state.init.channel_flags,
			channel_version: state.init.channel_version,
			last_sent: state.last_sent.clone(),
		};
		let actions = vec![ChannelAction::MakeFundingTx {
			script_pubkey: funding_script_pubkey,
			amount_satoshis: state.init.funding_satoshis,
			feerate_per_kw: state.init.funding_tx_feerate_per_kw,
		}];
		Ok((self.with_state(ChannelState::WaitForFundingInternal(next)), actions))
	}

	fn on_funding_tx_built<K: KeysInterface, B: TxBuilder>(
		&self, state: &WaitForFundingInternal, funding_tx: &Transaction,
		funding_tx_output_index: u16, fee_satoshis: u64, keys: &K, tx_builder: &B,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let signer = keys.derive_channel_signer(state.local_params.channel_keys_id);
		let (redeem_script, _) = tx_builder.make_funding_script(
			&signer.pubkeys().funding_pubkey, &state.remote_params.pubkeys.funding_pubkey,
		);
		let funding_txid = funding_tx.compute_txid();
		let funding_output = funding_tx
			.output
			.get(funding_tx_output_index as usize)
			.ok_or(ChannelError::InvalidFundingAmount { funding_satoshis: 0 })?
			.clone();
		let commit_input = InputInfo {
			outpoint: bitcoin::OutPoint {
				txid: funding_txid,
				vout: funding_tx_output_index as u32,
			},
			tx_out: funding_output,
			redeem_script,
		};
		let first_commit_txs = make_first_commit_txs(
			&signer, tx_builder, state.channel_version, &state.local_params,
			&state.remote_params, state.funding_satoshis, state.push_msat,
			state.initial_feerate_per_kw, &commit_input,
			&state.remote_first_per_commitment_point,
		)?;
		let (remote_sig, _) =
			signer.sign_counterparty_commitment(&first_commit_txs.remote_commit_tx, &[]);
		let funding_created = FundingCreated {
			temporary_channel_id: state.temporary_channel_id,
			funding_txid,
			funding_output_index: funding_tx_output_index,
			signature: remote_sig,
		};
		let channel_id = crate::chain::transaction::OutPoint {
			txid: funding_txid,
			index: funding_tx_output_index,
		}
		.to_channel_id();
		let next = WaitForFundingSigned {
			channel_id,
			temporary_channel_id: state.temporary_channel_id,
			local_params: state.local_params.clone(),
			remote_params: state.remote_params.clone(),
			funding_tx: funding_tx.clone(),
			funding_tx_fee_satoshis: fee_satoshis,
			local_spec: first_commit_txs.local_spec.clone(),
			local_commit_tx: first_commit_txs.local_commit_tx.clone(),
			remote_commit: RemoteCommit {
				index: 0,
				spec: first_commit_txs.remote_spec.clone(),
				txid: first_commit_txs.remote_commit_tx.txid(),
				remote_per_commitment_point: state.remote_first_per_commitment_point,
			},
			channel_flags: state.channel_flags,
			channel_version: state.channel_version,
			commit_input,
			last_sent: funding_created.clone(),
		};
		let actions = vec![
			ChannelAction::ChannelIdAssigned {
				remote_node_id: self.static_params.remote_node_id,
				temporary_channel_id: state.temporary_channel_id,
				channel_id,
			},
			send(ChannelMessage::FundingCreated(funding_created)),
		];
		Ok((self.with_state(ChannelState::WaitForFundingSigned(next)), actions))
	}

	fn on_funding_created<K: KeysInterface, B: TxBuilder>(
		&self, state: &WaitForFundingCreated, msg: &FundingCreated, keys: &K, tx_builder: &B,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let signer = keys.derive_channel_signer(state.local_params.channel_keys_id);
		let (redeem_script, funding_script_pubkey) = tx_builder.make_funding_script(
			&signer.pubkeys().funding_pubkey, &state.remote_params.pubkeys.funding_pubkey,
		);
		let commit_input = InputInfo {
			outpoint: bitcoin::OutPoint {
				txid: msg.funding_txid,
				vout: msg.funding_output_index as u32,
			},
			tx_out: bitcoin::TxOut {
				value: bitcoin::Amount::from_sat(state.funding_satoshis),
				script_pubkey: funding_script_pubkey,
			},
			redeem_script,
		};
		let first_commit_txs = make_first_commit_txs(
			&signer, tx_builder, state.channel_version, &state.local_params,
			&state.remote_params, state.funding_satoshis, state.push_msat,
			state.initial_feerate_per_kw, &commit_input,
			&state.remote_first_per_commitment_point,
		)?;
		if !tx_builder.check_commitment_sig(
			&first_commit_txs.local_commit_tx, &commit_input,
			&state.remote_params.pubkeys.funding_pubkey, &msg.signature,
		) {
			return Err(ChannelError::InvalidCommitmentSignature);
		}
		let (local_sig, _) =
			signer.sign_holder_commitment(&first_commit_txs.local_commit_tx, &[]);
		let publishable_commit = tx_builder.add_commitment_sigs(
			first_commit_txs.local_commit_tx.tx.clone(), &commit_input.redeem_script,
			&signer.pubkeys().funding_pubkey, &state.remote_params.pubkeys.funding_pubkey,
			&local_sig, &msg.signature,
		);
		let (remote_sig, _) =
			signer.sign_counterparty_commitment(&first_commit_txs.remote_commit_tx, &[]);

		let channel_id = crate::chain::transaction::OutPoint {
			txid: msg.funding_txid,
			index: msg.funding_output_index,
		}
		.to_channel_id();
		let funding_signed = FundingSigned { channel_id, signature: remote_sig, channel_data: None };

		let commitments = Commitments {
			channel_version: state.channel_version,
			local_params: state.local_params.clone(),
			remote_params: state.remote_params.clone(),
			channel_flags: state.channel_flags,
			local_commit: LocalCommit {
				index: 0,
				spec: first_commit_txs.local_spec.clone(),
				publishable_txs: PublishableTxs {
					commit_tx: publishable_commit,
					htlc_txs_and_sigs: Vec::new(),
				},
			},
			remote_commit: RemoteCommit {
				index: 0,
				spec: first_commit_txs.remote_spec.clone(),
				txid: first_commit_txs.remote_commit_tx.txid(),
				remote_per_commitment_point: state.remote_first_per_commitment_point,
			},
			local_changes: LocalChanges::default(),
			remote_changes: RemoteChanges::default(),
			local_next_htlc_id: 0,
			remote_next_htlc_id: 0,
			payments: HashMap::new(),
			remote_next_commit_info: RemoteNextCommitInfo::Revoked(
				placeholder_point(keys),
			),
			commit_input: commit_input.clone(),
			remote_per_commitment_secrets:
				crate::ln::chan_utils::CounterpartyCommitmentSecrets::new(),
			channel_id,
			remote_channel_data: None,
		};
		let next = FundedState::WaitForFundingConfirmed(WaitForFundingConfirmed {
			commitments,
			funding_tx: None,
			waiting_since_block: self.current_block_height,
			deferred: None,
		});
		let min_depth = min_depth_for_funding(
			&self.static_params.node_params, state.funding_satoshis,
		);
		let actions = vec![
			ChannelAction::ChannelIdAssigned {
				remote_node_id: self.static_params.remote_node_id,
				temporary_channel_id: state.temporary_channel_id,
				channel_id,
			},
			ChannelAction::ChannelIdSwitch {
				old_channel_id: state.temporary_channel_id,
				new_channel_id: channel_id,
			},
			store(&next),
			send(ChannelMessage::FundingSigned(funding_signed)),
			ChannelAction::SendWatch {
				watch: WatchRequest::Spent {
					channel_id,
					txid: commit_input.outpoint.txid,
					output_index: commit_input.outpoint.vout,
					script_pubkey: commit_input.tx_out.script_pubkey.clone(),
					tag: WatchTag::FundingSpent,
				},
			},
			ChannelAction::SendWatch {
				watch: WatchRequest::Confirmed {
					channel_id,
					txid: commit_input.outpoint.txid,
					min_depth,
					tag: WatchTag::FundingDepthOk,
				},
			},
		];
		Ok((self.with_funded(Phase::Online, next), actions))
	}

	fn on_funding_signed<K: KeysInterface, B: TxBuilder>(
		&self, state: &WaitForFundingSigned, msg: &FundingSigned, keys: &K, tx_builder: &B,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let signer = keys.derive_channel_signer(state.local_params.channel_keys_id);
		if !tx_builder.check_commitment_sig(
			&state.local_commit_tx, &state.commit_input,
			&state.remote_params.pubkeys.funding_pubkey, &msg.signature,
		) {
			return Err(ChannelError::InvalidCommitmentSignature);
		}
		let (local_sig, _) = signer.sign_holder_commitment(&state.local_commit_tx, &[]);
		let publishable_commit = tx_builder.add_commitment_sigs(
			state.local_commit_tx.tx.clone(), &state.commit_input.redeem_script,
			&signer.pubkeys().funding_pubkey, &state.remote_params.pubkeys.funding_pubkey,
			&local_sig, &msg.signature,
		);

		let commitments = Commitments {
			channel_version: state.channel_version,
			local_params: state.local_params.clone(),
			remote_params: state.remote_params.clone(),
			channel_flags: state.channel_flags,
			local_commit: LocalCommit {
				index: 0,
				spec: state.local_spec.clone(),
				publishable_txs: PublishableTxs {
					commit_tx: publishable_commit,
					htlc_txs_and_sigs: Vec::new(),
				},
			},
			remote_commit: state.remote_commit.clone(),
			local_changes: LocalChanges::default(),
			remote_changes: RemoteChanges::default(),
			local_next_htlc_id: 0,
			remote_next_htlc_id: 0,
			payments: HashMap::new(),
			remote_next_commit_info: RemoteNextCommitInfo::Revoked(placeholder_point(keys)),
			commit_input: state.commit_input.clone(),
			remote_per_commitment_secrets:
				crate::ln::chan_utils::CounterpartyCommitmentSecrets::new(),
			channel_id: state.channel_id,
			remote_channel_data: msg.channel_data.clone(),
		};
		let next = FundedState::WaitForFundingConfirmed(WaitForFundingConfirmed {
			commitments,
			funding_tx: Some(state.funding_tx.clone()),
			waiting_since_block: self.current_block_height,
			deferred: None,
		});
		let min_depth = min_depth_for_funding(
			&self.static_params.node_params,
			state.commit_input.tx_out.value.to_sat(),
		);
		let actions = vec![
			store(&next),
			ChannelAction::SendWatch {
				watch: WatchRequest::Spent {
					channel_id: state.channel_id,
					txid: state.commit_input.outpoint.txid,
					output_index: state.commit_input.outpoint.vout,
					script_pubkey: state.commit_input.tx_out.script_pubkey.clone(),
					tag: WatchTag::FundingSpent,
				},
			},
			ChannelAction::SendWatch {
				watch: WatchRequest::Confirmed {
					channel_id: state.channel_id,
					txid: state.commit_input.outpoint.txid,
					min_depth,
					tag: WatchTag::FundingDepthOk,
				},
			},
			ChannelAction::PublishTx { tx: state.funding_tx.clone() },
		];
		Ok((self.with_funded(Phase::Online, next), actions))
	}
}

fn event_name(event: &ChannelEvent) -> &'static str {
	match event {
		ChannelEvent::InitFunder(_) => "InitFunder",
		ChannelEvent::InitFundee(_) => "InitFundee",
		ChannelEvent::Restore(_) => "Restore",
		ChannelEvent::MessageReceived(_) => "MessageReceived",
		ChannelEvent::WatchReceived(_) => "WatchReceived",
		ChannelEvent::ExecuteCommand(_) => "ExecuteCommand",
		ChannelEvent::MakeFundingTxResponse { .. } => "MakeFundingTxResponse",
		ChannelEvent::NewBlock { .. } => "NewBlock",
		ChannelEvent::Disconnected => "Disconnected",
		ChannelEvent::Connected { .. } => "Connected",
	}
}

/// Before the peer has told us its real next per-commitment point we keep a random
/// placeholder whose secret nobody knows; it is replaced on `funding_locked`.
fn placeholder_point<K: KeysInterface>(keys: &K) -> PublicKey {
	let secp_ctx = Secp256k1::new();
	let bytes = keys.get_secure_random_bytes();
	let secret = SecretKey::from_slice(&bytes)
		.unwrap_or_else(|_| SecretKey::from_slice(&[1u8; 32]).unwrap());
	PublicKey::from_secret_key(&secp_ctx, &secret)
}

impl Channel {
	fn process_funded<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, event: &ChannelEvent, keys: &K, tx_builder: &B,
		logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		match event {
			ChannelEvent::WatchReceived(watch_event) => {
				self.on_watch_event(funded, watch_event, keys, tx_builder, logger)
			},
			ChannelEvent::Connected { local_init, remote_init: _ } => {
				self.on_connected(funded, local_init, keys, logger)
			},
			ChannelEvent::MessageReceived(message) => match &funded.phase {
				Phase::Online => self.on_message_online(funded, message, keys, tx_builder, logger),
				Phase::Syncing { wait_for_their_reestablish } => match message {
					ChannelMessage::ChannelReestablish(msg) => self.on_reestablish(
						funded, *wait_for_their_reestablish, msg, keys, tx_builder, logger,
					),
					ChannelMessage::Error(_) => {
						self.handle_remote_error(funded, keys, tx_builder, logger)
					},
					message => {
						log_warn!(
							logger,
							"received {:?} while syncing {}, ignoring",
							message.channel_id(),
							funded.state.name()
						);
						Ok((self.clone(), Vec::new()))
					},
				},
				Phase::Offline => {
					log_warn!(
						logger,
						"received a message while offline in {}, ignoring",
						funded.state.name()
					);
					Ok((self.clone(), Vec::new()))
				},
			},
			ChannelEvent::ExecuteCommand(command) => {
				if let ChannelCommand::ForceClose = command {
					return self.on_force_close(funded, keys, tx_builder, logger);
				}
				match &funded.phase {
					Phase::Online => self.on_command(funded, command, keys, tx_builder, logger),
					_ => Ok((
						self.clone(),
						vec![ChannelAction::HandleCommandFailed {
							command: command.clone(),
							error: ChannelError::ChannelUnavailable,
						}],
					)),
				}
			},
			event => {
				log_warn!(
					logger,
					"unhandled event {:?} on funded channel in {}, ignoring",
					event_name(event),
					funded.state.name()
				);
				Ok((self.clone(), Vec::new()))
			},
		}
	}

	fn signer_for<K: KeysInterface>(&self, commitments: &Commitments, keys: &K) -> K::Signer {
		keys.derive_channel_signer(commitments.local_params.channel_keys_id)
	}

	/// Messages we would have sent must not leak while the transport is down or syncing;
	/// the reestablish protocol takes care of retransmission instead.
	fn strip_messages_unless_online(
		&self, phase: &Phase, mut actions: Vec<ChannelAction>,
	) -> Vec<ChannelAction> {
		if !matches!(phase, Phase::Online) {
			actions.retain(|action| !matches!(action, ChannelAction::SendMessage { .. }));
		}
		actions
	}

	fn on_watch_event<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, watch_event: &WatchEvent, keys: &K, tx_builder: &B,
		logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let (channel, actions) = match watch_event {
			WatchEvent::Spent { tx, tag: WatchTag::FundingSpent } => {
				self.on_funding_spent(funded, tx, keys, tx_builder, logger)?
			},
			WatchEvent::Spent { tx, tag: WatchTag::OutputSpent } => {
				self.on_output_spent(funded, tx, keys, tx_builder, logger)?
			},
			WatchEvent::Confirmed { tx, tag: WatchTag::FundingDepthOk, .. } => {
				self.on_funding_confirmed(funded, tx, keys, logger)?
			},
			WatchEvent::Confirmed { tag: WatchTag::FundingDeeplyBuried, .. } => {
				match &funded.state {
					FundedState::Normal(state) => {
						let next = FundedState::Normal(Normal { buried: true, ..state.clone() });
						(self.with_funded(funded.phase.clone(), next.clone()), vec![store(&next)])
					},
					_ => (self.clone(), Vec::new()),
				}
			},
			WatchEvent::Confirmed { tx, tag: WatchTag::TxConfirmed(_), .. } => {
				self.on_tx_confirmed(funded, tx, logger)?
			},
			watch_event => {
				log_warn!(
					logger,
					"unhandled watch event {:?} in {}, ignoring",
					watch_event,
					funded.state.name()
				);
				(self.clone(), Vec::new())
			},
		};
		let phase = match &channel.state {
			ChannelState::Funded(next) => next.phase.clone(),
			_ => Phase::Online,
		};
		Ok((channel, self.strip_messages_unless_online(&phase, actions)))
	}

	fn on_funding_confirmed<K: KeysInterface, L: Deref>(
		&self, funded: &FundedChannel, tx: &Transaction, keys: &K, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let state = match &funded.state {
			FundedState::WaitForFundingConfirmed(state) => state,
			_ => {
				log_debug!(logger, "funding depth-ok in {}, ignoring", funded.state.name());
				return Ok((self.clone(), Vec::new()));
			},
		};
		if tx.compute_txid() != state.commitments.commit_input.outpoint.txid {
			log_warn!(logger, "depth-ok for unknown tx {}, ignoring", tx.compute_txid());
			return Ok((self.clone(), Vec::new()));
		}
		let signer = self.signer_for(&state.commitments, keys);
		let funding_locked = FundingLocked {
			channel_id: state.commitments.channel_id,
			next_per_commitment_point: signer.get_per_commitment_point(1),
		};
		match &state.deferred {
			Some(their_funding_locked) => {
				// They saw the confirmation before we did; complete the exchange at once.
				let mut commitments = state.commitments.clone();
				commitments.remote_next_commit_info =
					RemoteNextCommitInfo::Revoked(their_funding_locked.next_per_commitment_point);
				let next = FundedState::Normal(Normal {
					commitments,
					buried: false,
					local_shutdown: None,
					remote_shutdown: None,
				});
				let actions = vec![
					store(&next),
					send(ChannelMessage::FundingLocked(funding_locked)),
					self.watch_deeply_buried(&next),
				];
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
			None => {
				let next = FundedState::WaitForFundingLocked(WaitForFundingLocked {
					commitments: state.commitments.clone(),
					last_sent: funding_locked.clone(),
				});
				let actions =
					vec![store(&next), send(ChannelMessage::FundingLocked(funding_locked))];
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
		}
	}

	fn watch_deeply_buried(&self, state: &FundedState) -> ChannelAction {
		let commitments = state.commitments();
		ChannelAction::SendWatch {
			watch: WatchRequest::Confirmed {
				channel_id: commitments.channel_id,
				txid: commitments.commit_input.outpoint.txid,
				min_depth: ANNOUNCEMENTS_MINCONF,
				tag: WatchTag::FundingDeeplyBuried,
			},
		}
	}

	fn on_tx_confirmed<L: Deref>(
		&self, funded: &FundedChannel, tx: &Transaction, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let closing = match &funded.state {
			FundedState::Closing(closing) => closing,
			state => {
				log_debug!(logger, "tx confirmed in {}, ignoring", state.name());
				return Ok((self.clone(), Vec::new()));
			},
		};
		let updated = closing.on_tx_confirmed(tx);
		match updated.is_closed(Some(tx)) {
			Some(closing_type) => {
				log_info!(
					logger,
					"channel {} closed: {:?}",
					log_bytes!(updated.commitments.channel_id),
					closing_type
				);
				let next = FundedState::Closed(updated);
				Ok((self.with_funded(funded.phase.clone(), next.clone()), vec![store(&next)]))
			},
			None => {
				let next = FundedState::Closing(updated);
				Ok((self.with_funded(funded.phase.clone(), next.clone()), vec![store(&next)]))
			},
		}
	}

	fn on_output_spent<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, tx: &Transaction, keys: &K, tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let closing = match &funded.state {
			FundedState::Closing(closing) => closing.clone(),
			state => {
				log_debug!(logger, "output spent in {}, ignoring", state.name());
				return Ok((self.clone(), Vec::new()));
			},
		};
		let channel_id = closing.commitments.channel_id;
		let min_depth = self.static_params.node_params.min_depth_blocks;
		let mut actions = Vec::new();
		// Track the spender so third-party resolutions count toward being done.
		actions.push(ChannelAction::SendWatch {
			watch: WatchRequest::Confirmed {
				channel_id,
				txid: tx.compute_txid(),
				min_depth,
				tag: WatchTag::TxConfirmed(tx.compute_txid()),
			},
		});

		// If the spender rides on a revoked commitment it is the cheater racing us with a
		// second-stage HTLC transaction: chase its delayed output with a penalty.
		let signer = self.signer_for(&closing.commitments, keys);
		let mut updated = closing.clone();
		let mut penalties = Vec::new();
		for rvk in updated.revoked_commit_published.iter_mut() {
			let revoked_txid = rvk.commit_tx.compute_txid();
			let spends_revoked =
				tx.input.iter().any(|input| input.previous_output.txid == revoked_txid);
			let is_ours = rvk.htlc_penalty_txs.iter().any(|p| p.compute_txid() == tx.compute_txid())
				|| rvk.main_penalty_tx.as_ref().map_or(false, |p| p.compute_txid() == tx.compute_txid())
				|| rvk.claim_main_output_tx.as_ref().map_or(false, |p| p.compute_txid() == tx.compute_txid());
			if !spends_revoked || is_ours {
				continue;
			}
			let commitment_number = match tx_builder.commit_tx_number(
				&rvk.commit_tx, &signer.pubkeys().payment_basepoint,
				&closing.commitments.remote_params.pubkeys.payment_basepoint,
				closing.commitments.local_params.is_funder,
			) {
				Some(number) => number,
				None => continue,
			};
			let secret = match closing
				.commitments
				.remote_per_commitment_secrets
				.get_secret(INITIAL_COMMITMENT_NUMBER - commitment_number)
			{
				Some(secret) => secret,
				None => continue,
			};
			if let Some(penalty) = tx_builder.build_claim_htlc_delayed_penalty_tx(
				&signer, tx, &secret, commitment_number,
				&closing.commitments.remote_params.pubkeys,
				closing.commitments.local_commit.spec.feerate_per_kw,
				&closing.commitments.local_params.default_final_script_pubkey,
			) {
				rvk.claim_htlc_delayed_penalty_txs.push(penalty.clone());
				penalties.push(penalty);
			}
		}
		let next = FundedState::Closing(updated);
		let mut all_actions = vec![store(&next)];
		for penalty in penalties {
			all_actions.push(ChannelAction::PublishTx { tx: penalty.clone() });
			all_actions.push(ChannelAction::SendWatch {
				watch: WatchRequest::Confirmed {
					channel_id,
					txid: penalty.compute_txid(),
					min_depth,
					tag: WatchTag::TxConfirmed(penalty.compute_txid()),
				},
			});
		}
		all_actions.extend(actions);
		Ok((self.with_funded(funded.phase.clone(), next), all_actions))
	}

	/// The starting point for any on-chain close: the current [`Closing`] if we are already
	/// in one, a fresh one otherwise, carrying over what the previous state knew.
	fn closing_base(&self, funded: &FundedChannel) -> Closing {
		match &funded.state {
			FundedState::Closing(closing) => closing.clone(),
			FundedState::Closed(closing) => closing.clone(),
			FundedState::Negotiating(state) => Closing {
				commitments: state.commitments.clone(),
				funding_tx: None,
				waiting_since_block: self.current_block_height,
				mutual_close_proposed: state
					.closing_txs_proposed
					.iter()
					.flatten()
					.map(|proposed| proposed.unsigned_tx.clone())
					.collect(),
				mutual_close_published: Vec::new(),
				local_commit_published: None,
				current_remote_commit_published: None,
				next_remote_commit_published: None,
				future_remote_commit_published: None,
				revoked_commit_published: Vec::new(),
			},
			FundedState::WaitForFundingConfirmed(state) => Closing {
				commitments: state.commitments.clone(),
				funding_tx: state.funding_tx.clone(),
				waiting_since_block: self.current_block_height,
				mutual_close_proposed: Vec::new(),
				mutual_close_published: Vec::new(),
				local_commit_published: None,
				current_remote_commit_published: None,
				next_remote_commit_published: None,
				future_remote_commit_published: None,
				revoked_commit_published: Vec::new(),
			},
			state => Closing {
				commitments: state.commitments().clone(),
				funding_tx: None,
				waiting_since_block: self.current_block_height,
				mutual_close_proposed: Vec::new(),
				mutual_close_published: Vec::new(),
				local_commit_published: None,
				current_remote_commit_published: None,
				next_remote_commit_published: None,
				future_remote_commit_published: None,
				revoked_commit_published: Vec::new(),
			},
		}
	}

	fn spend_local_current<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, keys: &K, tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let mut closing = self.closing_base(funded);
		// Never broadcast a commitment we may have revoked: if the peer proved us outdated
		// the only safe path is waiting for its commitment.
		if let FundedState::WaitForRemotePublishFutureCommitment(_) = &funded.state {
			return Ok((self.clone(), Vec::new()));
		}
		let mut best_unpublished = None;
		if let FundedState::Negotiating(state) = &funded.state {
			// We hold a fully signed mutual close from the aborted negotiation; give it a
			// chance to confirm alongside the commitment.
			if let Some(tx) = &state.best_unpublished_closing_tx {
				closing.mutual_close_published.push(tx.clone());
				best_unpublished = Some(tx.clone());
			}
		}
		if closing.local_commit_published.is_none() {
			let signer = self.signer_for(&closing.commitments, keys);
			closing.local_commit_published = Some(claim_current_local_commit_tx_outputs(
				&signer, tx_builder, &closing.commitments,
			));
		}
		let lcp = closing.local_commit_published.clone().expect("just set");
		log_info!(
			logger,
			"publishing local commit {} for channel {}",
			lcp.commit_tx.compute_txid(),
			log_bytes!(closing.commitments.channel_id)
		);
		let channel_id = closing.commitments.channel_id;
		let min_depth = self.static_params.node_params.min_depth_blocks;
		let next = FundedState::Closing(closing);
		let mut actions = vec![store(&next)];
		if let Some(tx) = best_unpublished {
			actions.push(ChannelAction::PublishTx { tx: tx.clone() });
			actions.push(ChannelAction::SendWatch {
				watch: WatchRequest::Confirmed {
					channel_id,
					txid: tx.compute_txid(),
					min_depth,
					tag: WatchTag::TxConfirmed(tx.compute_txid()),
				},
			});
		}
		actions.extend(local_commit_published_actions(channel_id, &lcp, min_depth));
		Ok((self.with_funded(funded.phase.clone(), next), actions))
	}

	fn on_funding_spent<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, tx: &Transaction, keys: &K, tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let commitments = funded.state.commitments().clone();
		let spending_txid = tx.compute_txid();
		let min_depth = self.static_params.node_params.min_depth_blocks;
		let channel_id = commitments.channel_id;
		let signer = self.signer_for(&commitments, keys);

		// A mutual close we proposed: nothing to claim, just wait for depth.
		let mutual_match = match &funded.state {
			FundedState::Negotiating(state) => state
				.closing_txs_proposed
				.iter()
				.flatten()
				.any(|proposed| proposed.unsigned_tx.compute_txid() == spending_txid),
			FundedState::Closing(closing) => closing
				.mutual_close_proposed
				.iter()
				.any(|proposed| proposed.compute_txid() == spending_txid),
			_ => false,
		};
		if mutual_match {
			log_info!(logger, "mutual close tx {} appeared on chain", spending_txid);
			let mut closing = self.closing_base(funded);
			if !closing.mutual_close_published.iter().any(|t| t.compute_txid() == spending_txid) {
				closing.mutual_close_published.push(tx.clone());
			}
			let next = FundedState::Closing(closing);
			let actions = vec![
				store(&next),
				ChannelAction::SendWatch {
					watch: WatchRequest::Confirmed {
						channel_id,
						txid: spending_txid,
						min_depth,
						tag: WatchTag::TxConfirmed(spending_txid),
					},
				},
			];
			return Ok((self.with_funded(funded.phase.clone(), next), actions));
		}

		if spending_txid == commitments.local_commit.publishable_txs.commit_tx.compute_txid() {
			// Our own commitment; either we published it or the watcher echoes our publish.
			return self.spend_local_current(funded, keys, tx_builder, logger);
		}

		if spending_txid == commitments.remote_commit.txid {
			log_info!(logger, "remote commit {} appeared on chain", spending_txid);
			let mut closing = self.closing_base(funded);
			if closing.current_remote_commit_published.is_none() {
				closing.current_remote_commit_published = Some(claim_remote_commit_tx_outputs(
					&signer, tx_builder, &commitments, &commitments.remote_commit, tx,
				));
			}
			let rcp = closing.current_remote_commit_published.clone().expect("just set");
			let next = FundedState::Closing(closing);
			let mut actions = vec![store(&next)];
			actions.extend(remote_commit_published_actions(channel_id, &rcp, min_depth));
			return Ok((self.with_funded(funded.phase.clone(), next), actions));
		}

		if let RemoteNextCommitInfo::WaitingForRevocation(waiting) =
			&commitments.remote_next_commit_info
		{
			if spending_txid == waiting.next_remote_commit.txid {
				log_info!(logger, "next remote commit {} appeared on chain", spending_txid);
				let mut closing = self.closing_base(funded);
				if closing.next_remote_commit_published.is_none() {
					closing.next_remote_commit_published = Some(claim_remote_commit_tx_outputs(
						&signer, tx_builder, &commitments, &waiting.next_remote_commit, tx,
					));
				}
				let rcp = closing.next_remote_commit_published.clone().expect("just set");
				let next = FundedState::Closing(closing);
				let mut actions = vec![store(&next)];
				actions.extend(remote_commit_published_actions(channel_id, &rcp, min_depth));
				return Ok((self.with_funded(funded.phase.clone(), next), actions));
			}
		}

		if let FundedState::WaitForRemotePublishFutureCommitment(state) = &funded.state {
			log_info!(logger, "future remote commit {} appeared on chain", spending_txid);
			let rcp = claim_remote_commit_main_output(
				&signer, tx_builder, &commitments,
				&state.remote_channel_reestablish.my_current_per_commitment_point, tx,
				commitments.local_commit.spec.feerate_per_kw,
			);
			let mut closing = self.closing_base(funded);
			closing.future_remote_commit_published = Some(rcp.clone());
			let next = FundedState::Closing(closing);
			let mut actions = vec![store(&next)];
			actions.extend(remote_commit_published_actions(channel_id, &rcp, min_depth));
			return Ok((self.with_funded(funded.phase.clone(), next), actions));
		}

		if let Some(rvk) =
			claim_revoked_remote_commit_tx_outputs(&signer, tx_builder, &commitments, tx)
		{
			log_warn!(
				logger,
				"revoked commit {} appeared on chain, publishing penalties",
				spending_txid
			);
			let mut closing = self.closing_base(funded);
			if !closing
				.revoked_commit_published
				.iter()
				.any(|existing| existing.commit_tx.compute_txid() == spending_txid)
			{
				closing.revoked_commit_published.push(rvk.clone());
			}
			let next = FundedState::Closing(closing);
			let mut actions = vec![store(&next)];
			actions.extend(revoked_commit_published_actions(channel_id, &rvk, min_depth));
			return Ok((self.with_funded(funded.phase.clone(), next), actions));
		}

		// A spend we cannot attribute to either party means key material has leaked
		// somewhere; there is no safe automatic response.
		log_error!(
			logger,
			"funding for channel {} spent by unrecognized tx {}",
			log_bytes!(channel_id),
			spending_txid
		);
		let next = FundedState::ErrorInformationLeak(ErrorInformationLeak { commitments });
		let error = ChannelError::UnrecognizedFundingSpend;
		let actions = vec![
			store(&next),
			send(error_message(channel_id, &error)),
			ChannelAction::ProcessLocalFailure { error },
		];
		Ok((self.with_funded(funded.phase.clone(), next), actions))
	}

	fn handle_remote_error<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, keys: &K, tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		match &funded.state {
			FundedState::Closing(_)
			| FundedState::Closed(_)
			| FundedState::ErrorInformationLeak(_)
			| FundedState::WaitForRemotePublishFutureCommitment(_) => {
				log_warn!(logger, "peer error in {}, nothing more to do", funded.state.name());
				Ok((self.clone(), Vec::new()))
			},
			state if state.commitments().nothing_at_stake() => {
				log_info!(logger, "peer error with nothing at stake, forgetting channel");
				Ok((self.with_state(ChannelState::Aborted), Vec::new()))
			},
			_ => self.spend_local_current(funded, keys, tx_builder, logger),
		}
	}

	fn on_connected<K: KeysInterface, L: Deref>(
		&self, funded: &FundedChannel, local_init: &crate::ln::msgs::Init, keys: &K, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		if !matches!(funded.phase, Phase::Offline) {
			log_warn!(logger, "connected while not offline in {}, ignoring", funded.state.name());
			return Ok((self.clone(), Vec::new()));
		}
		match &funded.state {
			FundedState::Closing(_)
			| FundedState::Closed(_)
			| FundedState::ErrorInformationLeak(_) => {
				// Everything left is on-chain business; nothing to reestablish.
				Ok((self.with_funded(Phase::Online, funded.state.clone()), Vec::new()))
			},
			state => {
				let wait_for_their_reestablish =
					local_init.features.supports_channel_backup_client();
				let mut actions = Vec::new();
				if !wait_for_their_reestablish {
					let commitments = state.commitments();
					let signer = self.signer_for(commitments, keys);
					actions.push(send(ChannelMessage::ChannelReestablish(
						make_channel_reestablish(commitments, &signer),
					)));
				}
				Ok((
					self.with_funded(
						Phase::Syncing { wait_for_their_reestablish },
						state.clone(),
					),
					actions,
				))
			},
		}
	}

	fn on_reestablish<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, wait_for_their_reestablish: bool,
		msg: &ChannelReestablish, keys: &K, tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		// The peer may hold a fresher backup of our own state than we do (fresh install).
		let mut state = funded.state.clone();
		if let Some(blob) = &msg.channel_data {
			if let Ok(restored) = keys.decrypt_channel_data(blob) {
				let ours = state.commitments();
				let theirs = restored.commitments();
				if theirs.channel_id == ours.channel_id
					&& (theirs.local_commit.index > ours.local_commit.index
						|| theirs.remote_commit.index > ours.remote_commit.index)
				{
					log_warn!(
						logger,
						"adopting channel state from peer backup (local {} -> {}, remote {} -> {})",
						ours.local_commit.index,
						theirs.local_commit.index,
						ours.remote_commit.index,
						theirs.remote_commit.index
					);
					state = restored;
				}
			}
		}
		let commitments = state.commitments().clone();
		let signer = self.signer_for(&commitments, keys);
		let mut actions = Vec::new();
		if wait_for_their_reestablish {
			actions.push(send(ChannelMessage::ChannelReestablish(make_channel_reestablish(
				&commitments, &signer,
			))));
		}

		match state {
			FundedState::WaitForFundingConfirmed(state) => {
				let next = FundedState::WaitForFundingConfirmed(state);
				Ok((self.with_funded(Phase::Online, next), actions))
			},
			FundedState::WaitForFundingLocked(state) => {
				actions.push(send(ChannelMessage::FundingLocked(state.last_sent.clone())));
				let next = FundedState::WaitForFundingLocked(state);
				Ok((self.with_funded(Phase::Online, next), actions))
			},
			FundedState::Normal(state) => {
				if msg.next_remote_revocation_number > commitments.local_commit.index {
					return self.on_future_commitment_proof(&commitments, msg, &signer, actions);
				}
				let (commitments1, retransmit, should_sign) =
					commitments.handle_sync(msg, &signer)?;
				let next = FundedState::Normal(Normal {
					commitments: commitments1.clone(),
					..state.clone()
				});
				actions.push(store(&next));
				if commitments1.local_commit.index == 0 && msg.next_local_commitment_number == 1 {
					// They never saw our funding_locked.
					actions.push(send(ChannelMessage::FundingLocked(FundingLocked {
						channel_id: commitments1.channel_id,
						next_per_commitment_point: signer.get_per_commitment_point(1),
					})));
				}
				for message in retransmit {
					actions.push(send(message));
				}
				if let Some(shutdown) = &state.local_shutdown {
					actions.push(send(ChannelMessage::Shutdown(shutdown.clone())));
				}
				if should_sign {
					actions.push(ChannelAction::SendToSelf { command: ChannelCommand::Sign });
				}
				Ok((self.with_funded(Phase::Online, next), actions))
			},
			FundedState::ShuttingDown(state) => {
				if msg.next_remote_revocation_number > commitments.local_commit.index {
					return self.on_future_commitment_proof(&commitments, msg, &signer, actions);
				}
				let (commitments1, retransmit, should_sign) =
					commitments.handle_sync(msg, &signer)?;
				let next = FundedState::ShuttingDown(ShuttingDown {
					commitments: commitments1,
					..state.clone()
				});
				actions.push(store(&next));
				for message in retransmit {
					actions.push(send(message));
				}
				actions.push(send(ChannelMessage::Shutdown(state.local_shutdown.clone())));
				if should_sign {
					actions.push(ChannelAction::SendToSelf { command: ChannelCommand::Sign });
				}
				Ok((self.with_funded(Phase::Online, next), actions))
			},
			FundedState::Negotiating(state) => {
				// Negotiation starts over on every reconnection.
				actions.push(send(ChannelMessage::Shutdown(state.local_shutdown.clone())));
				if commitments.local_params.is_funder {
					let fee = first_closing_fee(
						&commitments, &state.local_shutdown.scriptpubkey,
						&state.remote_shutdown.scriptpubkey,
					);
					let (unsigned_tx, closing_signed) = make_closing_tx(
						&signer, tx_builder, &commitments, &state.local_shutdown.scriptpubkey,
						&state.remote_shutdown.scriptpubkey, fee,
					)?;
					let mut rounds = state.closing_txs_proposed.clone();
					rounds.push(vec![ClosingTxProposed {
						unsigned_tx,
						local_closing_signed: closing_signed.clone(),
					}]);
					let next = FundedState::Negotiating(Negotiating {
						closing_txs_proposed: rounds,
						..state.clone()
					});
					actions.push(store(&next));
					actions.push(send(ChannelMessage::ClosingSigned(closing_signed)));
					Ok((self.with_funded(Phase::Online, next), actions))
				} else {
					let mut rounds = state.closing_txs_proposed.clone();
					rounds.push(Vec::new());
					let next = FundedState::Negotiating(Negotiating {
						closing_txs_proposed: rounds,
						..state.clone()
					});
					actions.push(store(&next));
					Ok((self.with_funded(Phase::Online, next), actions))
				}
			},
			FundedState::WaitForRemotePublishFutureCommitment(state) => {
				actions.push(send(ChannelMessage::Error(ErrorMessage {
					channel_id: commitments.channel_id,
					data: "please publish your local commitment".to_string(),
				})));
				let next = FundedState::WaitForRemotePublishFutureCommitment(state);
				Ok((self.with_funded(Phase::Online, next), actions))
			},
			state => Ok((self.with_funded(Phase::Online, state), actions)),
		}
	}

	/// The peer claims our revocations go further than our state does; if it can prove that
	/// with one of our own secrets we are the outdated ones, and the best we can do is ask
	/// it to close on its current commitment and pick up our main output.
	fn on_future_commitment_proof<S: ChannelSigner>(
		&self, commitments: &Commitments, msg: &ChannelReestablish, signer: &S,
		mut actions: Vec<ChannelAction>,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let our_secret = signer.release_commitment_secret(msg.next_remote_revocation_number - 1);
		if msg.your_last_per_commitment_secret != our_secret {
			return Err(ChannelError::RevocationSyncError);
		}
		let next = FundedState::WaitForRemotePublishFutureCommitment(
			WaitForRemotePublishFutureCommitment {
				commitments: commitments.clone(),
				remote_channel_reestablish: msg.clone(),
			},
		);
		actions.push(store(&next));
		actions.push(send(ChannelMessage::Error(ErrorMessage {
			channel_id: commitments.channel_id,
			data: "please publish your local commitment".to_string(),
		})));
		Ok((self.with_funded(Phase::Online, next), actions))
	}
}

fn make_channel_reestablish<S: ChannelSigner>(
	commitments: &Commitments, signer: &S,
) -> ChannelReestablish {
	let your_last_per_commitment_secret = if commitments.remote_commit.index == 0 {
		[0u8; 32]
	} else {
		commitments
			.remote_per_commitment_secrets
			.get_secret(INITIAL_COMMITMENT_NUMBER - (commitments.remote_commit.index - 1))
			.unwrap_or([0u8; 32])
	};
	ChannelReestablish {
		channel_id: commitments.channel_id,
		next_local_commitment_number: commitments.local_commit.index + 1,
		next_remote_revocation_number: commitments.remote_commit.index,
		your_last_per_commitment_secret,
		my_current_per_commitment_point: signer
			.get_per_commitment_point(commitments.local_commit.index),
		// If we hold a backup for the peer, reestablish is where we hand it back.
		channel_data: commitments.remote_channel_data.clone(),
	}
}

impl Channel {
	fn on_message_online<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, message: &ChannelMessage, keys: &K, tx_builder: &B,
		logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		match (&funded.state, message) {
			(_, ChannelMessage::Error(msg)) => {
				log_warn!(
					logger,
					"peer sent error on channel {}: {}",
					log_bytes!(msg.channel_id),
					msg.data
				);
				self.handle_remote_error(funded, keys, tx_builder, logger)
			},
			(
				FundedState::WaitForFundingConfirmed(state),
				ChannelMessage::FundingLocked(msg),
			) => {
				// They saw the confirmation first; hold on to it until we do too.
				let next = FundedState::WaitForFundingConfirmed(WaitForFundingConfirmed {
					deferred: Some(msg.clone()),
					..state.clone()
				});
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::WaitForFundingLocked(state), ChannelMessage::FundingLocked(msg)) => {
				let mut commitments = state.commitments.clone();
				commitments.remote_next_commit_info =
					RemoteNextCommitInfo::Revoked(msg.next_per_commitment_point);
				let next = FundedState::Normal(Normal {
					commitments,
					buried: false,
					local_shutdown: None,
					remote_shutdown: None,
				});
				let actions = vec![store(&next), self.watch_deeply_buried(&next)];
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
			(FundedState::Normal(state), ChannelMessage::UpdateAddHTLC(msg)) => {
				if state.remote_shutdown.is_some() {
					return Err(ChannelError::NoMoreHtlcsClosingInProgress);
				}
				let commitments = state.commitments.receive_add(msg.clone())?;
				let next = FundedState::Normal(Normal { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::ShuttingDown(_), ChannelMessage::UpdateAddHTLC(_)) => {
				Err(ChannelError::NoMoreHtlcsClosingInProgress)
			},
			(FundedState::Normal(state), ChannelMessage::UpdateFulfillHTLC(msg)) => {
				let commitments = state.commitments.receive_fulfill(msg.clone())?;
				let next = FundedState::Normal(Normal { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::ShuttingDown(state), ChannelMessage::UpdateFulfillHTLC(msg)) => {
				let commitments = state.commitments.receive_fulfill(msg.clone())?;
				let next = FundedState::ShuttingDown(ShuttingDown { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::Normal(state), ChannelMessage::UpdateFailHTLC(msg)) => {
				let commitments = state.commitments.receive_fail(msg.clone())?;
				let next = FundedState::Normal(Normal { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::ShuttingDown(state), ChannelMessage::UpdateFailHTLC(msg)) => {
				let commitments = state.commitments.receive_fail(msg.clone())?;
				let next = FundedState::ShuttingDown(ShuttingDown { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::Normal(state), ChannelMessage::UpdateFailMalformedHTLC(msg)) => {
				let commitments = state.commitments.receive_fail_malformed(msg.clone())?;
				let next = FundedState::Normal(Normal { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::ShuttingDown(state), ChannelMessage::UpdateFailMalformedHTLC(msg)) => {
				let commitments = state.commitments.receive_fail_malformed(msg.clone())?;
				let next = FundedState::ShuttingDown(ShuttingDown { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::Normal(state), ChannelMessage::UpdateFee(msg)) => {
				let commitments = state.commitments.receive_fee(
					msg.clone(), self.static_params.node_params.max_feerate_mismatch_ratio,
				)?;
				let next = FundedState::Normal(Normal { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::ShuttingDown(state), ChannelMessage::UpdateFee(msg)) => {
				let commitments = state.commitments.receive_fee(
					msg.clone(), self.static_params.node_params.max_feerate_mismatch_ratio,
				)?;
				let next = FundedState::ShuttingDown(ShuttingDown { commitments, ..state.clone() });
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			(FundedState::Normal(_), ChannelMessage::CommitmentSigned(msg))
			| (FundedState::ShuttingDown(_), ChannelMessage::CommitmentSigned(msg)) => {
				self.on_commitment_signed(funded, msg, keys, tx_builder)
			},
			(FundedState::Normal(_), ChannelMessage::RevokeAndACK(msg))
			| (FundedState::ShuttingDown(_), ChannelMessage::RevokeAndACK(msg)) => {
				self.on_revoke_and_ack(funded, msg, keys, tx_builder)
			},
			(FundedState::Normal(state), ChannelMessage::Shutdown(msg)) => {
				self.on_shutdown(funded, state, msg, keys, tx_builder)
			},
			(FundedState::ShuttingDown(_), ChannelMessage::Shutdown(_))
			| (FundedState::Negotiating(_), ChannelMessage::Shutdown(_)) => {
				// Retransmission after a reconnect; we have it already.
				Ok((self.clone(), Vec::new()))
			},
			(FundedState::Negotiating(state), ChannelMessage::ClosingSigned(msg)) => {
				self.on_closing_signed(funded, state, msg, keys, tx_builder, logger)
			},
			(state, message) => {
				log_warn!(
					logger,
					"unhandled message for channel {} in state {}, ignoring",
					log_bytes!(message.channel_id()),
					state.name()
				);
				Ok((self.clone(), Vec::new()))
			},
		}
	}

	/// Rebuilds the current state around an updated ledger, preserving the rest.
	fn rebuild_state(&self, funded: &FundedChannel, commitments: Commitments) -> FundedState {
		match &funded.state {
			FundedState::Normal(state) => {
				FundedState::Normal(Normal { commitments, ..state.clone() })
			},
			FundedState::ShuttingDown(state) => {
				FundedState::ShuttingDown(ShuttingDown { commitments, ..state.clone() })
			},
			state => {
				debug_assert!(false, "rebuild_state used outside Normal/ShuttingDown");
				(*state).clone()
			},
		}
	}

	/// If no HTLCs remain pending on either commitment, `ShuttingDown` graduates to
	/// `Negotiating` and the funder opens the fee negotiation.
	fn shutting_down_to_negotiating<K: KeysInterface, B: TxBuilder>(
		&self, commitments: &Commitments, local_shutdown: &Shutdown, remote_shutdown: &Shutdown,
		keys: &K, tx_builder: &B,
	) -> Result<(FundedState, Option<ClosingSigned>), ChannelError> {
		let signer = self.signer_for(commitments, keys);
		if commitments.local_params.is_funder {
			let fee = first_closing_fee(
				commitments, &local_shutdown.scriptpubkey, &remote_shutdown.scriptpubkey,
			);
			let (unsigned_tx, closing_signed) = make_closing_tx(
				&signer, tx_builder, commitments, &local_shutdown.scriptpubkey,
				&remote_shutdown.scriptpubkey, fee,
			)?;
			Ok((
				FundedState::Negotiating(Negotiating {
					commitments: commitments.clone(),
					local_shutdown: local_shutdown.clone(),
					remote_shutdown: remote_shutdown.clone(),
					closing_txs_proposed: vec![vec![ClosingTxProposed {
						unsigned_tx,
						local_closing_signed: closing_signed.clone(),
					}]],
					best_unpublished_closing_tx: None,
				}),
				Some(closing_signed),
			))
		} else {
			// The fundee stays silent until the funder's first closing_signed arrives.
			Ok((
				FundedState::Negotiating(Negotiating {
					commitments: commitments.clone(),
					local_shutdown: local_shutdown.clone(),
					remote_shutdown: remote_shutdown.clone(),
					closing_txs_proposed: vec![Vec::new()],
					best_unpublished_closing_tx: None,
				}),
				None,
			))
		}
	}

	fn on_commitment_signed<K: KeysInterface, B: TxBuilder>(
		&self, funded: &FundedChannel, msg: &CommitmentSigned, keys: &K, tx_builder: &B,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let commitments = funded.state.commitments();
		let signer = self.signer_for(commitments, keys);
		let (mut commitments1, revocation) = commitments.receive_commit(msg, &signer, tx_builder)?;
		if msg.channel_data.is_some() {
			commitments1.remote_channel_data = msg.channel_data.clone();
		}
		let can_sign_again = commitments1.local_has_changes()
			&& matches!(commitments1.remote_next_commit_info, RemoteNextCommitInfo::Revoked(_));
		if let FundedState::ShuttingDown(state) = &funded.state {
			if commitments1.has_no_pending_htlcs() {
				let (next, closing_signed) = self.shutting_down_to_negotiating(
					&commitments1, &state.local_shutdown, &state.remote_shutdown, keys,
					tx_builder,
				)?;
				let mut actions = vec![
					store(&next),
					send(ChannelMessage::RevokeAndACK(revocation)),
				];
				if let Some(closing_signed) = closing_signed {
					actions.push(send(ChannelMessage::ClosingSigned(closing_signed)));
				}
				return Ok((self.with_funded(funded.phase.clone(), next), actions));
			}
		}
		let next = self.rebuild_state(funded, commitments1);
		let mut actions = vec![store(&next), send(ChannelMessage::RevokeAndACK(revocation))];
		if can_sign_again {
			actions.push(ChannelAction::SendToSelf { command: ChannelCommand::Sign });
		}
		Ok((self.with_funded(funded.phase.clone(), next), actions))
	}

	fn on_revoke_and_ack<K: KeysInterface, B: TxBuilder>(
		&self, funded: &FundedChannel, msg: &RevokeAndACK, keys: &K, tx_builder: &B,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let commitments = funded.state.commitments();
		let (mut commitments1, settlement_actions) = commitments.receive_revocation(msg)?;
		if msg.channel_data.is_some() {
			commitments1.remote_channel_data = msg.channel_data.clone();
		}
		match &funded.state {
			FundedState::ShuttingDown(state) if commitments1.has_no_pending_htlcs() => {
				let (next, closing_signed) = self.shutting_down_to_negotiating(
					&commitments1, &state.local_shutdown, &state.remote_shutdown, keys,
					tx_builder,
				)?;
				let mut actions = vec![store(&next)];
				actions.extend(settlement_actions);
				if let Some(closing_signed) = closing_signed {
					actions.push(send(ChannelMessage::ClosingSigned(closing_signed)));
				}
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
			FundedState::Normal(state)
				if state.remote_shutdown.is_some()
					&& !commitments1.local_has_unsigned_outgoing_htlcs() =>
			{
				// Our pending changes are now signed for; we can answer the shutdown we
				// had to defer.
				let remote_shutdown = state.remote_shutdown.clone().expect("checked above");
				let local_shutdown = state.local_shutdown.clone().unwrap_or(Shutdown {
					channel_id: commitments1.channel_id,
					scriptpubkey: commitments1.local_params.default_final_script_pubkey.clone(),
				});
				let send_our_shutdown = state.local_shutdown.is_none();
				let (next, closing_signed) = if commitments1.has_no_pending_htlcs() {
					self.shutting_down_to_negotiating(
						&commitments1, &local_shutdown, &remote_shutdown, keys, tx_builder,
					)?
				} else {
					(
						FundedState::ShuttingDown(ShuttingDown {
							commitments: commitments1,
							local_shutdown: local_shutdown.clone(),
							remote_shutdown,
						}),
						None,
					)
				};
				let mut actions = vec![store(&next)];
				actions.extend(settlement_actions);
				if send_our_shutdown {
					actions.push(send(ChannelMessage::Shutdown(local_shutdown)));
				}
				if let Some(closing_signed) = closing_signed {
					actions.push(send(ChannelMessage::ClosingSigned(closing_signed)));
				}
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
			_ => {
				let next = self.rebuild_state(funded, commitments1);
				let mut actions = vec![store(&next)];
				actions.extend(settlement_actions);
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
		}
	}

	fn on_shutdown<K: KeysInterface, B: TxBuilder>(
		&self, funded: &FundedChannel, state: &Normal, msg: &Shutdown, keys: &K, tx_builder: &B,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let commitments = &state.commitments;
		if commitments.remote_has_unsigned_outgoing_htlcs() {
			return Err(ChannelError::CannotCloseWithUnsignedOutgoingHtlcs);
		}
		if !is_valid_final_script_pubkey(&msg.scriptpubkey) {
			return Err(ChannelError::InvalidFinalScript);
		}
		if let Some(upfront) = &commitments.remote_params.shutdown_scriptpubkey {
			if *upfront != msg.scriptpubkey {
				return Err(ChannelError::InvalidFinalScript);
			}
		}
		if commitments.local_has_unsigned_outgoing_htlcs() {
			// We cannot reply until our proposed changes are signed for; sign now and
			// answer after the revocation round, see on_revoke_and_ack.
			let next = FundedState::Normal(Normal {
				remote_shutdown: Some(msg.clone()),
				..state.clone()
			});
			let actions =
				vec![store(&next), ChannelAction::SendToSelf { command: ChannelCommand::Sign }];
			return Ok((self.with_funded(funded.phase.clone(), next), actions));
		}

		let local_shutdown = state.local_shutdown.clone().unwrap_or(Shutdown {
			channel_id: commitments.channel_id,
			scriptpubkey: commitments.local_params.default_final_script_pubkey.clone(),
		});
		let send_our_shutdown = state.local_shutdown.is_none();
		let (next, closing_signed) = if commitments.has_no_pending_htlcs() {
			self.shutting_down_to_negotiating(commitments, &local_shutdown, msg, keys, tx_builder)?
		} else {
			(
				FundedState::ShuttingDown(ShuttingDown {
					commitments: commitments.clone(),
					local_shutdown: local_shutdown.clone(),
					remote_shutdown: msg.clone(),
				}),
				None,
			)
		};
		let mut actions = vec![store(&next)];
		if send_our_shutdown {
			actions.push(send(ChannelMessage::Shutdown(local_shutdown)));
		}
		if let Some(closing_signed) = closing_signed {
			actions.push(send(ChannelMessage::ClosingSigned(closing_signed)));
		}
		Ok((self.with_funded(funded.phase.clone(), next), actions))
	}

	fn on_closing_signed<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, state: &Negotiating, msg: &ClosingSigned, keys: &K,
		tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let mut commitments = state.commitments.clone();
		if msg.channel_data.is_some() {
			commitments.remote_channel_data = msg.channel_data.clone();
		}
		let commitments = &commitments;
		let signer = self.signer_for(commitments, keys);
		let channel_id = commitments.channel_id;
		let min_depth = self.static_params.node_params.min_depth_blocks;

		// Whatever fee they propose, their signature must be valid for it.
		let (unsigned_tx_at_their_fee, _) = make_closing_tx(
			&signer, tx_builder, commitments, &state.local_shutdown.scriptpubkey,
			&state.remote_shutdown.scriptpubkey, msg.fee_satoshis,
		)?;
		if !tx_builder.check_closing_sig(
			&unsigned_tx_at_their_fee, &commitments.commit_input,
			&commitments.remote_params.pubkeys.funding_pubkey, &msg.signature,
		) {
			return Err(ChannelError::InvalidCloseSignature);
		}
		let our_sig_at_their_fee =
			signer.sign_closing_transaction(&unsigned_tx_at_their_fee, &commitments.commit_input);
		let signed_at_their_fee = tx_builder.add_closing_sigs(
			unsigned_tx_at_their_fee.clone(), &commitments.commit_input.redeem_script,
			&signer.pubkeys().funding_pubkey, &commitments.remote_params.pubkeys.funding_pubkey,
			&our_sig_at_their_fee, &msg.signature,
		);

		let last_local_fee = state
			.closing_txs_proposed
			.last()
			.and_then(|round| round.last())
			.map(|proposed| proposed.local_closing_signed.fee_satoshis);
		let iterations: usize = state.closing_txs_proposed.iter().map(|round| round.len()).sum();

		let publish_their_fee = |mut closing: Closing, extra: Option<ClosingSigned>| {
			closing.commitments = commitments.clone();
			closing.mutual_close_proposed.push(unsigned_tx_at_their_fee.clone());
			closing.mutual_close_published.push(signed_at_their_fee.clone());
			let next = FundedState::Closing(closing);
			let mut actions = vec![store(&next)];
			if let Some(closing_signed) = extra {
				actions.push(send(ChannelMessage::ClosingSigned(closing_signed)));
			}
			actions.push(ChannelAction::PublishTx { tx: signed_at_their_fee.clone() });
			actions.push(ChannelAction::SendWatch {
				watch: WatchRequest::Confirmed {
					channel_id,
					txid: signed_at_their_fee.compute_txid(),
					min_depth,
					tag: WatchTag::TxConfirmed(signed_at_their_fee.compute_txid()),
				},
			});
			(next, actions)
		};

		if Some(msg.fee_satoshis) == last_local_fee
			|| iterations >= MAX_NEGOTIATION_ITERATIONS
		{
			// Either they accepted our fee, or we are done haggling and accept theirs.
			log_info!(
				logger,
				"mutual close converged at {} sat after {} proposals",
				msg.fee_satoshis,
				iterations
			);
			let (next, actions) = publish_their_fee(self.closing_base(funded), None);
			return Ok((self.with_funded(funded.phase.clone(), next), actions));
		}

		let local_fee = last_local_fee.unwrap_or_else(|| {
			first_closing_fee(
				commitments, &state.local_shutdown.scriptpubkey,
				&state.remote_shutdown.scriptpubkey,
			)
		});
		let next_fee = next_closing_fee(local_fee, msg.fee_satoshis);
		if next_fee == msg.fee_satoshis {
			// We have converged on their fee: echo it back, then publish.
			let (_, closing_signed) = make_closing_tx(
				&signer, tx_builder, commitments, &state.local_shutdown.scriptpubkey,
				&state.remote_shutdown.scriptpubkey, next_fee,
			)?;
			log_info!(logger, "mutual close converged at {} sat", next_fee);
			let (next, actions) = publish_their_fee(self.closing_base(funded), Some(closing_signed));
			return Ok((self.with_funded(funded.phase.clone(), next), actions));
		}

		if Some(next_fee) == last_local_fee {
			// Rounding got us nowhere new; hold our proposal and keep their signed tx in
			// case they stop responding.
			let last_proposed = state
				.closing_txs_proposed
				.last()
				.and_then(|round| round.last())
				.expect("last_local_fee was Some")
				.local_closing_signed
				.clone();
			let next = FundedState::Negotiating(Negotiating {
				commitments: commitments.clone(),
				best_unpublished_closing_tx: Some(signed_at_their_fee),
				..state.clone()
			});
			let actions = vec![store(&next), send(ChannelMessage::ClosingSigned(last_proposed))];
			return Ok((self.with_funded(funded.phase.clone(), next), actions));
		}

		let (unsigned_tx, closing_signed) = make_closing_tx(
			&signer, tx_builder, commitments, &state.local_shutdown.scriptpubkey,
			&state.remote_shutdown.scriptpubkey, next_fee,
		)?;
		log_debug!(
			logger,
			"mutual close: they proposed {} sat, countering with {} sat",
			msg.fee_satoshis,
			next_fee
		);
		let mut rounds = state.closing_txs_proposed.clone();
		match rounds.last_mut() {
			Some(round) => round.push(ClosingTxProposed {
				unsigned_tx,
				local_closing_signed: closing_signed.clone(),
			}),
			None => rounds.push(vec![ClosingTxProposed {
				unsigned_tx,
				local_closing_signed: closing_signed.clone(),
			}]),
		}
		let next = FundedState::Negotiating(Negotiating {
			commitments: commitments.clone(),
			closing_txs_proposed: rounds,
			best_unpublished_closing_tx: Some(signed_at_their_fee),
			..state.clone()
		});
		let actions = vec![store(&next), send(ChannelMessage::ClosingSigned(closing_signed))];
		Ok((self.with_funded(funded.phase.clone(), next), actions))
	}

	fn on_command<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, command: &ChannelCommand, keys: &K, tx_builder: &B,
		logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let fail = |error: ChannelError| {
			Ok((
				self.clone(),
				vec![ChannelAction::HandleCommandFailed { command: command.clone(), error }],
			))
		};
		match (&funded.state, command) {
			(
				FundedState::Normal(state),
				ChannelCommand::AddHtlc {
					amount_msat,
					payment_hash,
					cltv_expiry,
					onion_routing_packet,
					payment_id,
					commit,
				},
			) => {
				if state.local_shutdown.is_some() || state.remote_shutdown.is_some() {
					return fail(ChannelError::NoMoreHtlcsClosingInProgress);
				}
				match state.commitments.send_add(
					*amount_msat, *payment_hash, *cltv_expiry, onion_routing_packet.clone(),
					*payment_id, self.current_block_height,
				) {
					Ok((commitments, add)) => {
						let next = FundedState::Normal(Normal { commitments, ..state.clone() });
						let mut actions = vec![send(ChannelMessage::UpdateAddHTLC(add))];
						if *commit {
							actions.push(ChannelAction::SendToSelf {
								command: ChannelCommand::Sign,
							});
						}
						Ok((self.with_funded(funded.phase.clone(), next), actions))
					},
					Err(error) => fail(error),
				}
			},
			(
				FundedState::ShuttingDown(_) | FundedState::Negotiating(_),
				ChannelCommand::AddHtlc { .. },
			) => fail(ChannelError::NoMoreHtlcsClosingInProgress),
			(
				FundedState::Normal(_) | FundedState::ShuttingDown(_),
				ChannelCommand::FulfillHtlc { htlc_id, payment_preimage, commit },
			) => {
				match funded.state.commitments().send_fulfill(*htlc_id, *payment_preimage) {
					Ok((commitments, fulfill)) => {
						let next = self.rebuild_state(funded, commitments);
						let mut actions = vec![send(ChannelMessage::UpdateFulfillHTLC(fulfill))];
						if *commit {
							actions.push(ChannelAction::SendToSelf {
								command: ChannelCommand::Sign,
							});
						}
						Ok((self.with_funded(funded.phase.clone(), next), actions))
					},
					Err(error) => fail(error),
				}
			},
			(
				FundedState::Normal(_) | FundedState::ShuttingDown(_),
				ChannelCommand::FailHtlc { htlc_id, reason, commit },
			) => match funded.state.commitments().send_fail(*htlc_id, reason.clone()) {
				Ok((commitments, fail_msg)) => {
					let next = self.rebuild_state(funded, commitments);
					let mut actions = vec![send(ChannelMessage::UpdateFailHTLC(fail_msg))];
					if *commit {
						actions.push(ChannelAction::SendToSelf { command: ChannelCommand::Sign });
					}
					Ok((self.with_funded(funded.phase.clone(), next), actions))
				},
				Err(error) => fail(error),
			},
			(
				FundedState::Normal(_) | FundedState::ShuttingDown(_),
				ChannelCommand::FailMalformedHtlc { htlc_id, sha256_of_onion, failure_code, commit },
			) => {
				match funded
					.state
					.commitments()
					.send_fail_malformed(*htlc_id, *sha256_of_onion, *failure_code)
				{
					Ok((commitments, fail_msg)) => {
						let next = self.rebuild_state(funded, commitments);
						let mut actions =
							vec![send(ChannelMessage::UpdateFailMalformedHTLC(fail_msg))];
						if *commit {
							actions.push(ChannelAction::SendToSelf {
								command: ChannelCommand::Sign,
							});
						}
						Ok((self.with_funded(funded.phase.clone(), next), actions))
					},
					Err(error) => fail(error),
				}
			},
			(
				FundedState::Normal(_) | FundedState::ShuttingDown(_),
				ChannelCommand::UpdateFee { feerate_per_kw, commit },
			) => match funded.state.commitments().send_fee(*feerate_per_kw) {
				Ok((commitments, fee)) => {
					let next = self.rebuild_state(funded, commitments);
					let mut actions = vec![send(ChannelMessage::UpdateFee(fee))];
					if *commit {
						actions.push(ChannelAction::SendToSelf { command: ChannelCommand::Sign });
					}
					Ok((self.with_funded(funded.phase.clone(), next), actions))
				},
				Err(error) => fail(error),
			},
			(FundedState::Normal(_) | FundedState::ShuttingDown(_), ChannelCommand::Sign) => {
				self.on_sign(funded, keys, tx_builder, logger)
			},
			(FundedState::Normal(state), ChannelCommand::Close { script_pubkey }) => {
				self.on_cmd_close(funded, state, script_pubkey, keys, tx_builder)
			},
			(
				FundedState::ShuttingDown(_)
				| FundedState::Negotiating(_)
				| FundedState::Closing(_)
				| FundedState::Closed(_),
				ChannelCommand::Close { .. },
			) => fail(ChannelError::ClosingAlreadyInProgress),
			(state, _) => {
				log_debug!(
					logger,
					"command not executable in state {}, failing it",
					state.name()
				);
				fail(ChannelError::ChannelUnavailable)
			},
		}
	}

	fn on_sign<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, keys: &K, tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		let commitments = funded.state.commitments();
		match &commitments.remote_next_commit_info {
			RemoteNextCommitInfo::WaitingForRevocation(waiting) => {
				// Their revocation is still in flight; sign as soon as it lands.
				let mut waiting = waiting.clone();
				waiting.re_sign_asap = true;
				let mut commitments1 = commitments.clone();
				commitments1.remote_next_commit_info =
					RemoteNextCommitInfo::WaitingForRevocation(waiting);
				let next = self.rebuild_state(funded, commitments1);
				Ok((self.with_funded(funded.phase.clone(), next), Vec::new()))
			},
			RemoteNextCommitInfo::Revoked(_) => {
				let signer = self.signer_for(commitments, keys);
				match commitments.send_commit(&signer, tx_builder) {
					Ok((commitments1, commit_sig, htlc_infos)) => {
						let next = self.rebuild_state(funded, commitments1);
						let actions = vec![
							ChannelAction::StoreHtlcInfos { htlc_infos },
							store(&next),
							send(ChannelMessage::CommitmentSigned(commit_sig)),
						];
						Ok((self.with_funded(funded.phase.clone(), next), actions))
					},
					Err(ChannelError::CannotSignWithoutChanges) => {
						log_debug!(logger, "ignoring CMD_SIGN, nothing to sign");
						Ok((self.clone(), Vec::new()))
					},
					Err(error) => Err(error),
				}
			},
		}
	}

	fn on_cmd_close<K: KeysInterface, B: TxBuilder>(
		&self, funded: &FundedChannel, state: &Normal,
		script_pubkey: &Option<bitcoin::ScriptBuf>, keys: &K, tx_builder: &B,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError> {
		let command = ChannelCommand::Close { script_pubkey: script_pubkey.clone() };
		let fail = |error: ChannelError| {
			Ok((self.clone(), vec![ChannelAction::HandleCommandFailed { command, error }]))
		};
		let commitments = &state.commitments;
		let script = script_pubkey
			.clone()
			.unwrap_or_else(|| commitments.local_params.default_final_script_pubkey.clone());
		if !is_valid_final_script_pubkey(&script) {
			return fail(ChannelError::InvalidFinalScript);
		}
		if state.local_shutdown.is_some() {
			return fail(ChannelError::ClosingAlreadyInProgress);
		}
		if commitments.local_has_unsigned_outgoing_htlcs() {
			return fail(ChannelError::CannotCloseWithUnsignedOutgoingHtlcs);
		}
		let local_shutdown = Shutdown { channel_id: commitments.channel_id, scriptpubkey: script };

		// The peer's script may already be known, through an earlier shutdown of theirs or
		// through the upfront option; if so and nothing is pending we can negotiate at once.
		let remote_script = state
			.remote_shutdown
			.as_ref()
			.map(|shutdown| shutdown.scriptpubkey.clone())
			.or_else(|| commitments.remote_params.shutdown_scriptpubkey.clone());
		match remote_script {
			Some(remote_script) if commitments.has_no_pending_htlcs() => {
				let remote_shutdown = state.remote_shutdown.clone().unwrap_or(Shutdown {
					channel_id: commitments.channel_id,
					scriptpubkey: remote_script,
				});
				let (next, closing_signed) = self.shutting_down_to_negotiating(
					commitments, &local_shutdown, &remote_shutdown, keys, tx_builder,
				)?;
				let mut actions =
					vec![store(&next), send(ChannelMessage::Shutdown(local_shutdown))];
				if let Some(closing_signed) = closing_signed {
					actions.push(send(ChannelMessage::ClosingSigned(closing_signed)));
				}
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
			Some(_) if state.remote_shutdown.is_some() => {
				let next = FundedState::ShuttingDown(ShuttingDown {
					commitments: commitments.clone(),
					local_shutdown: local_shutdown.clone(),
					remote_shutdown: state.remote_shutdown.clone().expect("checked above"),
				});
				let actions = vec![store(&next), send(ChannelMessage::Shutdown(local_shutdown))];
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
			_ => {
				let next = FundedState::Normal(Normal {
					local_shutdown: Some(local_shutdown.clone()),
					..state.clone()
				});
				let actions = vec![store(&next), send(ChannelMessage::Shutdown(local_shutdown))];
				Ok((self.with_funded(funded.phase.clone(), next), actions))
			},
		}
	}

	fn on_force_close<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, funded: &FundedChannel, keys: &K, tx_builder: &B, logger: &L,
	) -> Result<(Channel, Vec<ChannelAction>), ChannelError>
	where
		L::Target: Logger,
	{
		match &funded.state {
			FundedState::Closing(_)
			| FundedState::Closed(_)
			| FundedState::ErrorInformationLeak(_)
			| FundedState::WaitForRemotePublishFutureCommitment(_) => Ok((
				self.clone(),
				vec![ChannelAction::HandleCommandFailed {
					command: ChannelCommand::ForceClose,
					error: ChannelError::ClosingAlreadyInProgress,
				}],
			)),
			state => {
				let error = ChannelError::ForcedLocalCommit;
				let channel_id = state.channel_id();
				let (channel, mut actions) =
					self.spend_local_current(funded, keys, tx_builder, logger)?;
				actions.insert(0, send(error_message(channel_id, &error)));
				Ok((channel, actions))
			},
		}
	}

	fn handle_local_error<K: KeysInterface, B: TxBuilder, L: Deref>(
		&self, event: &ChannelEvent, error: ChannelError, keys: &K, tx_builder: &B, logger: &L,
	) -> (Channel, Vec<ChannelAction>)
	where
		L::Target: Logger,
	{
		log_error!(
			logger,
			"error processing {} in state {}: {}",
			event_name(event),
			self.state.name(),
			error
		);
		let failure = ChannelAction::ProcessLocalFailure { error: error.clone() };
		match &self.state {
			ChannelState::Funded(funded) => match &funded.state {
				FundedState::Closing(_)
				| FundedState::Closed(_)
				| FundedState::ErrorInformationLeak(_)
				| FundedState::WaitForRemotePublishFutureCommitment(_) => {
					(self.clone(), vec![failure])
				},
				state if state.commitments().nothing_at_stake() => {
					let actions =
						vec![send(error_message(state.channel_id(), &error)), failure];
					(self.with_state(ChannelState::Aborted), actions)
				},
				state => {
					let channel_id = state.channel_id();
					match self.spend_local_current(funded, keys, tx_builder, logger) {
						Ok((channel, mut actions)) => {
							actions.insert(0, failure);
							actions.insert(0, send(error_message(channel_id, &error)));
							(channel, actions)
						},
						Err(inner) => {
							log_error!(logger, "failed to spend local commit: {}", inner);
							(self.clone(), vec![failure])
						},
					}
				},
			},
			ChannelState::WaitForInit | ChannelState::Aborted => (self.clone(), vec![failure]),
			state => {
				let temporary_channel_id = match state {
					ChannelState::WaitForOpenChannel(s) => Some(s.init.temporary_channel_id),
					ChannelState::WaitForAcceptChannel(s) => Some(s.init.temporary_channel_id),
					ChannelState::WaitForFundingInternal(s) => Some(s.temporary_channel_id),
					ChannelState::WaitForFundingCreated(s) => Some(s.temporary_channel_id),
					ChannelState::WaitForFundingSigned(s) => Some(s.channel_id),
					_ => None,
				};
				let mut actions = Vec::new();
				if let Some(channel_id) = temporary_channel_id {
					actions.push(send(error_message(channel_id, &error)));
				}
				actions.push(failure);
				(self.with_state(ChannelState::Aborted), actions)
			},
		}
	}
}
