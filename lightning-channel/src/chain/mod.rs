// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Structs and traits which allow the channel state machine to interact with the blockchain.
//!
//! The state machine never looks at the chain itself. It emits [`WatchRequest`]s through
//! [`crate::events::ChannelAction::SendWatch`] and consumes the [`WatchEvent`]s an external
//! watcher delivers back via [`crate::events::ChannelEvent::WatchReceived`].

pub mod transaction;

use bitcoin::{ScriptBuf, Transaction, Txid};

use crate::ln::ChannelId;

/// Why a watch was registered. Returned verbatim in the corresponding [`WatchEvent`] so the
/// state machine can tell its watches apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchTag {
	/// The funding transaction reached the minimum depth required to start operating.
	FundingDepthOk,
	/// The funding transaction is buried deep enough to be announced.
	FundingDeeplyBuried,
	/// An output of the funding transaction was spent.
	FundingSpent,
	/// The funding transaction was reorged out.
	FundingLost,
	/// A specific transaction we published (or saw) confirmed deeply enough to be considered
	/// irrevocable.
	TxConfirmed(Txid),
	/// An output of a commitment or second-stage transaction was spent.
	OutputSpent,
}

/// A request for the external watcher, emitted by the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchRequest {
	/// Tell us when `txid` has `min_depth` confirmations.
	Confirmed {
		/// The channel registering the watch.
		channel_id: ChannelId,
		/// The transaction to watch.
		txid: Txid,
		/// How many confirmations we require.
		min_depth: u32,
		/// Returned in the corresponding [`WatchEvent::Confirmed`].
		tag: WatchTag,
	},
	/// Tell us when output `output_index` of `txid` is spent.
	Spent {
		/// The channel registering the watch.
		channel_id: ChannelId,
		/// The transaction whose output to watch.
		txid: Txid,
		/// The output to watch.
		output_index: u32,
		/// The script of the watched output, to help watchers that index by script.
		script_pubkey: ScriptBuf,
		/// Returned in the corresponding [`WatchEvent::Spent`].
		tag: WatchTag,
	},
	/// Tell us if `txid` disappears from the best chain.
	Lost {
		/// The channel registering the watch.
		channel_id: ChannelId,
		/// The transaction to watch.
		txid: Txid,
	},
}

/// A chain observation delivered by the external watcher.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
	/// A watched transaction reached its requested depth.
	Confirmed {
		/// The confirmed transaction.
		tx: Transaction,
		/// The height of the block including it.
		block_height: u32,
		/// Its index within that block.
		tx_index: u32,
		/// The tag of the [`WatchRequest::Confirmed`] this answers.
		tag: WatchTag,
	},
	/// A watched output was spent by `tx`.
	Spent {
		/// The spending transaction.
		tx: Transaction,
		/// The tag of the [`WatchRequest::Spent`] this answers.
		tag: WatchTag,
	},
}
