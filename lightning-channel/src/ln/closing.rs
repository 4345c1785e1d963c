// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Everything that happens once a channel starts closing: the mutual-close fee negotiation,
//! and the derivation of the claim transactions which follow any commitment transaction onto
//! the chain, honest or revoked.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};

use crate::chain::{WatchRequest, WatchTag};
use crate::events::ChannelAction;
use crate::ln::chan_utils::{closing_tx_weight, weight_to_fee_sat, HTLCOutputInCommitment, HTLCTx, INITIAL_COMMITMENT_NUMBER};
use crate::ln::commitment_spec::DirectedHtlc;
use crate::ln::commitments::{Commitments, RemoteCommit};
use crate::ln::msgs::{ClosingSigned, UpdateMessage};
use crate::ln::{PaymentHash, PaymentPreimage};
use crate::sign::{ChannelSigner, TxBuilder};
use crate::util::errors::ChannelError;

use std::collections::{HashMap, HashSet};

/// A mutual close transaction we proposed, kept so we can recognize it if the peer publishes
/// it and republish the exact same bytes ourselves.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosingTxProposed {
	/// The unsigned closing transaction at the proposed fee.
	pub unsigned_tx: Transaction,
	/// The `closing_signed` we sent for it.
	pub local_closing_signed: ClosingSigned,
}

/// Our own commitment on chain, with every transaction that claims its outputs back to us.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalCommitPublished {
	/// Our commitment transaction, fully signed.
	pub commit_tx: Transaction,
	/// Claims our main output once the to-self delay has passed, if it exists.
	pub claim_main_delayed_output_tx: Option<Transaction>,
	/// Second-stage claims of HTLCs offered to us, one per known preimage.
	pub htlc_success_txs: Vec<Transaction>,
	/// Second-stage reclaims of HTLCs we offered, one per non-dust offered HTLC.
	pub htlc_timeout_txs: Vec<Transaction>,
	/// Third-stage claims of the delayed outputs of the transactions above.
	pub claim_htlc_delayed_txs: Vec<Transaction>,
	/// Every output of ours we have seen irrevocably spent, and by which transaction.
	pub irrevocably_spent: HashMap<OutPoint, Txid>,
}

/// A commitment of the peer's on chain, with every transaction claiming what is ours on it.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteCommitPublished {
	/// The peer's commitment transaction as observed on chain.
	pub commit_tx: Transaction,
	/// Claims our main output, unless the channel pays it to the wallet directly.
	pub claim_main_output_tx: Option<Transaction>,
	/// Claims of HTLCs offered to us, one per known preimage.
	pub claim_htlc_success_txs: Vec<Transaction>,
	/// Reclaims of HTLCs we offered, after their expiry.
	pub claim_htlc_timeout_txs: Vec<Transaction>,
	/// Every output of ours we have seen irrevocably spent, and by which transaction.
	pub irrevocably_spent: HashMap<OutPoint, Txid>,
}

/// A revoked commitment of the peer's on chain, with the penalty transactions that punish
/// the attempt by sweeping every output.
#[derive(Clone, Debug, PartialEq)]
pub struct RevokedCommitPublished {
	/// The revoked commitment transaction as observed on chain.
	pub commit_tx: Transaction,
	/// Claims our own main output on it.
	pub claim_main_output_tx: Option<Transaction>,
	/// Sweeps the cheater's main output with the revocation key.
	pub main_penalty_tx: Option<Transaction>,
	/// Sweeps every HTLC output with the revocation key.
	pub htlc_penalty_txs: Vec<Transaction>,
	/// Sweeps the delayed outputs of any second-stage transaction the cheater confirmed.
	pub claim_htlc_delayed_penalty_txs: Vec<Transaction>,
	/// Every output we have seen irrevocably spent, and by which transaction.
	pub irrevocably_spent: HashMap<OutPoint, Txid>,
}

/// How a channel ended up closed on chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosingType {
	/// A negotiated close transaction confirmed.
	MutualClose,
	/// Our own commitment confirmed, all claims done.
	LocalClose,
	/// The peer's current commitment confirmed, all claims done.
	CurrentRemoteClose,
	/// The peer's signed-but-unrevoked next commitment confirmed, all claims done.
	NextRemoteClose,
	/// A commitment from the peer's future (we were outdated) confirmed; we recovered our
	/// main output.
	RecoveryClose,
	/// A revoked commitment confirmed and every penalty landed.
	RevokedClose,
}

fn record_spends(
	irrevocably_spent: &mut HashMap<OutPoint, Txid>, relevant_txids: &HashSet<Txid>,
	tx: &Transaction,
) {
	let txid = tx.compute_txid();
	for input in tx.input.iter() {
		if relevant_txids.contains(&input.previous_output.txid) {
			irrevocably_spent.insert(input.previous_output, txid);
		}
	}
}

fn all_inputs_spent(txs: &[Transaction], irrevocably_spent: &HashMap<OutPoint, Txid>) -> bool {
	txs.iter().all(|tx| {
		tx.input.iter().all(|input| irrevocably_spent.contains_key(&input.previous_output))
	})
}

fn option_inputs_spent(
	tx: &Option<Transaction>, irrevocably_spent: &HashMap<OutPoint, Txid>,
) -> bool {
	tx.as_ref().map_or(true, |tx| {
		tx.input.iter().all(|input| irrevocably_spent.contains_key(&input.previous_output))
	})
}

/// The outpoints (beyond the funding input) that the given planned claims spend; these are
/// what we watch for third-party spends.
fn claimed_outpoints<'a>(txs: impl Iterator<Item = &'a Transaction>) -> Vec<OutPoint> {
	let mut outpoints = Vec::new();
	for tx in txs {
		for input in tx.input.iter() {
			if !outpoints.contains(&input.previous_output) {
				outpoints.push(input.previous_output);
			}
		}
	}
	outpoints
}

impl LocalCommitPublished {
	fn relevant_txids(&self) -> HashSet<Txid> {
		let mut txids: HashSet<Txid> = HashSet::new();
		txids.insert(self.commit_tx.compute_txid());
		for input in self.commit_tx.input.iter() {
			txids.insert(input.previous_output.txid);
		}
		for tx in self.htlc_success_txs.iter().chain(self.htlc_timeout_txs.iter()) {
			txids.insert(tx.compute_txid());
		}
		txids
	}

	/// Records the spends performed by a deeply confirmed transaction.
	pub fn on_tx_confirmed(&self, tx: &Transaction) -> LocalCommitPublished {
		let mut updated = self.clone();
		record_spends(&mut updated.irrevocably_spent, &self.relevant_txids(), tx);
		updated
	}

	/// Whether the commitment and every claim descending from it are irrevocably resolved.
	pub fn is_done(&self) -> bool {
		let confirmed: HashSet<Txid> = self.irrevocably_spent.values().copied().collect();
		if !confirmed.contains(&self.commit_tx.compute_txid()) {
			return false;
		}
		option_inputs_spent(&self.claim_main_delayed_output_tx, &self.irrevocably_spent)
			&& all_inputs_spent(&self.htlc_success_txs, &self.irrevocably_spent)
			&& all_inputs_spent(&self.htlc_timeout_txs, &self.irrevocably_spent)
			&& all_inputs_spent(&self.claim_htlc_delayed_txs, &self.irrevocably_spent)
	}
}

impl RemoteCommitPublished {
	fn relevant_txids(&self) -> HashSet<Txid> {
		let mut txids: HashSet<Txid> = HashSet::new();
		txids.insert(self.commit_tx.compute_txid());
		for input in self.commit_tx.input.iter() {
			txids.insert(input.previous_output.txid);
		}
		txids
	}

	/// Records the spends performed by a deeply confirmed transaction.
	pub fn on_tx_confirmed(&self, tx: &Transaction) -> RemoteCommitPublished {
		let mut updated = self.clone();
		record_spends(&mut updated.irrevocably_spent, &self.relevant_txids(), tx);
		updated
	}

	/// Whether the commitment and every claim we planned on it are irrevocably resolved.
	pub fn is_done(&self) -> bool {
		let confirmed: HashSet<Txid> = self.irrevocably_spent.values().copied().collect();
		if !confirmed.contains(&self.commit_tx.compute_txid()) {
			return false;
		}
		option_inputs_spent(&self.claim_main_output_tx, &self.irrevocably_spent)
			&& all_inputs_spent(&self.claim_htlc_success_txs, &self.irrevocably_spent)
			&& all_inputs_spent(&self.claim_htlc_timeout_txs, &self.irrevocably_spent)
	}
}

impl RevokedCommitPublished {
	fn relevant_txids(&self) -> HashSet<Txid> {
		let mut txids: HashSet<Txid> = HashSet::new();
		txids.insert(self.commit_tx.compute_txid());
		for input in self.commit_tx.input.iter() {
			txids.insert(input.previous_output.txid);
		}
		for tx in self.claim_htlc_delayed_penalty_txs.iter() {
			for input in tx.input.iter() {
				txids.insert(input.previous_output.txid);
			}
		}
		txids
	}

	/// Records the spends performed by a deeply confirmed transaction.
	pub fn on_tx_confirmed(&self, tx: &Transaction) -> RevokedCommitPublished {
		let mut updated = self.clone();
		record_spends(&mut updated.irrevocably_spent, &self.relevant_txids(), tx);
		updated
	}

	/// Whether the revoked commitment and every penalty are irrevocably resolved.
	pub fn is_done(&self) -> bool {
		let confirmed: HashSet<Txid> = self.irrevocably_spent.values().copied().collect();
		if !confirmed.contains(&self.commit_tx.compute_txid()) {
			return false;
		}
		option_inputs_spent(&self.claim_main_output_tx, &self.irrevocably_spent)
			&& option_inputs_spent(&self.main_penalty_tx, &self.irrevocably_spent)
			&& all_inputs_spent(&self.htlc_penalty_txs, &self.irrevocably_spent)
			&& all_inputs_spent(&self.claim_htlc_delayed_penalty_txs, &self.irrevocably_spent)
	}
}

/// The state payload of a channel whose funding output has been spent, while we wait for
/// everything relevant to confirm deeply enough.
#[derive(Clone, Debug, PartialEq)]
pub struct Closing {
	/// The ledger, frozen at the moment the close started.
	pub commitments: Commitments,
	/// The funding transaction, if we funded the channel and may need to republish it.
	pub funding_tx: Option<Transaction>,
	/// The block height at which we entered the closing state.
	pub waiting_since_block: u32,
	/// Every mutual close transaction we ever proposed.
	pub mutual_close_proposed: Vec<Transaction>,
	/// Fully signed mutual close transactions that may confirm.
	pub mutual_close_published: Vec<Transaction>,
	/// Set if our own commitment is on chain.
	pub local_commit_published: Option<LocalCommitPublished>,
	/// Set if the peer's current commitment is on chain.
	pub current_remote_commit_published: Option<RemoteCommitPublished>,
	/// Set if the peer's signed-but-unrevoked next commitment is on chain.
	pub next_remote_commit_published: Option<RemoteCommitPublished>,
	/// Set if a commitment beyond our ken is on chain and we recovered what we could.
	pub future_remote_commit_published: Option<RemoteCommitPublished>,
	/// One entry per revoked commitment the peer has put on chain.
	pub revoked_commit_published: Vec<RevokedCommitPublished>,
}

impl Closing {
	/// Folds a deeply confirmed transaction into every published descriptor.
	pub fn on_tx_confirmed(&self, tx: &Transaction) -> Closing {
		let mut updated = self.clone();
		updated.local_commit_published =
			self.local_commit_published.as_ref().map(|lcp| lcp.on_tx_confirmed(tx));
		updated.current_remote_commit_published =
			self.current_remote_commit_published.as_ref().map(|rcp| rcp.on_tx_confirmed(tx));
		updated.next_remote_commit_published =
			self.next_remote_commit_published.as_ref().map(|rcp| rcp.on_tx_confirmed(tx));
		updated.future_remote_commit_published =
			self.future_remote_commit_published.as_ref().map(|rcp| rcp.on_tx_confirmed(tx));
		updated.revoked_commit_published =
			self.revoked_commit_published.iter().map(|rvk| rvk.on_tx_confirmed(tx)).collect();
		updated
	}

	/// Determines whether the channel is fully closed, and how. `additional_confirmed` is
	/// the transaction whose deep confirmation triggered the check, if any; a mutual close
	/// is recognized through it.
	pub fn is_closed(&self, additional_confirmed: Option<&Transaction>) -> Option<ClosingType> {
		if let Some(tx) = additional_confirmed {
			let txid = tx.compute_txid();
			if self.mutual_close_published.iter().any(|close| close.compute_txid() == txid) {
				return Some(ClosingType::MutualClose);
			}
		}
		if self.local_commit_published.as_ref().map_or(false, |lcp| lcp.is_done()) {
			return Some(ClosingType::LocalClose);
		}
		if self.current_remote_commit_published.as_ref().map_or(false, |rcp| rcp.is_done()) {
			return Some(ClosingType::CurrentRemoteClose);
		}
		if self.next_remote_commit_published.as_ref().map_or(false, |rcp| rcp.is_done()) {
			return Some(ClosingType::NextRemoteClose);
		}
		if self.future_remote_commit_published.as_ref().map_or(false, |rcp| rcp.is_done()) {
			return Some(ClosingType::RecoveryClose);
		}
		if self.revoked_commit_published.iter().any(|rvk| rvk.is_done()) {
			return Some(ClosingType::RevokedClose);
		}
		None
	}
}

/// The fee the funder opens the negotiation with: what the closing transaction costs at the
/// channel's current feerate.
pub fn first_closing_fee(
	commitments: &Commitments, local_script: &ScriptBuf, remote_script: &ScriptBuf,
) -> u64 {
	weight_to_fee_sat(
		commitments.local_commit.spec.feerate_per_kw,
		closing_tx_weight(local_script, remote_script),
	)
}

/// The next fee to propose: the midpoint of the two sides' last proposals, rounded down to
/// an even value so both sides compute the same number.
pub fn next_closing_fee(local_fee_satoshis: u64, remote_fee_satoshis: u64) -> u64 {
	((local_fee_satoshis + remote_fee_satoshis) / 4) * 2
}

/// Builds and signs a mutual close transaction at the given fee.
pub fn make_closing_tx<S: ChannelSigner, B: TxBuilder>(
	signer: &S, tx_builder: &B, commitments: &Commitments, local_script: &ScriptBuf,
	remote_script: &ScriptBuf, fee_satoshis: u64,
) -> Result<(Transaction, ClosingSigned), ChannelError> {
	if !commitments.has_no_pending_htlcs() {
		return Err(ChannelError::NoMoreHtlcsClosingInProgress);
	}
	let unsigned_tx = tx_builder.build_closing_tx(
		&commitments.commit_input, local_script, remote_script,
		commitments.local_params.is_funder, commitments.local_params.dust_limit_satoshis,
		fee_satoshis, &commitments.local_commit.spec,
	);
	let signature = signer.sign_closing_transaction(&unsigned_tx, &commitments.commit_input);
	let closing_signed = ClosingSigned {
		channel_id: commitments.channel_id,
		fee_satoshis,
		signature,
		channel_data: None,
	};
	Ok((unsigned_tx, closing_signed))
}

fn known_preimages(commitments: &Commitments) -> Vec<PaymentPreimage> {
	commitments
		.local_changes
		.proposed
		.iter()
		.chain(commitments.local_changes.signed.iter())
		.chain(commitments.local_changes.acked.iter())
		.filter_map(|change| match change {
			UpdateMessage::FulfillHtlc(fulfill) => Some(fulfill.payment_preimage),
			_ => None,
		})
		.collect()
}

fn preimage_for(preimages: &[PaymentPreimage], payment_hash: &PaymentHash) -> Option<PaymentPreimage> {
	preimages
		.iter()
		.find(|preimage| PaymentHash(Sha256::hash(&preimage.0).to_byte_array()) == *payment_hash)
		.copied()
}

/// Derives every transaction claiming our funds back from our own commitment: the delayed
/// main output, the second-stage HTLC transactions (success only where we know the
/// preimage), and the third-stage claims of their delayed outputs.
pub fn claim_current_local_commit_tx_outputs<S: ChannelSigner, B: TxBuilder>(
	signer: &S, tx_builder: &B, commitments: &Commitments,
) -> LocalCommitPublished {
	let commit_tx = commitments.local_commit.publishable_txs.commit_tx.clone();
	let feerate_per_kw = commitments.local_commit.spec.feerate_per_kw;
	let to_script = commitments.local_params.default_final_script_pubkey.clone();
	let local_pubkeys = signer.pubkeys().clone();
	let per_commitment_point = signer.get_per_commitment_point(commitments.local_commit.index);
	let params = commitments.local_commitment_params(
		&local_pubkeys, commitments.local_commit.index, per_commitment_point,
	);

	let claim_main_delayed_output_tx =
		tx_builder.build_claim_delayed_output_tx(signer, &commit_tx, &params, feerate_per_kw, &to_script);

	let preimages = known_preimages(commitments);
	let mut htlc_success_txs = Vec::new();
	let mut htlc_timeout_txs = Vec::new();
	let mut claim_htlc_delayed_txs = Vec::new();
	for htlc in commitments.local_commit.publishable_txs.htlc_txs_and_sigs.iter() {
		let published = match &htlc.txinfo {
			HTLCTx::Success { payment_hash, .. } => {
				// We can only go through the success path once the preimage is known.
				match preimage_for(&preimages, payment_hash) {
					Some(preimage) => {
						let tx = tx_builder.finalize_htlc_tx(
							&htlc.txinfo, &htlc.local_sig, &htlc.remote_sig, Some(&preimage),
						);
						htlc_success_txs.push(tx.clone());
						Some(tx)
					},
					None => None,
				}
			},
			HTLCTx::Timeout { .. } => {
				let tx = tx_builder.finalize_htlc_tx(
					&htlc.txinfo, &htlc.local_sig, &htlc.remote_sig, None,
				);
				htlc_timeout_txs.push(tx.clone());
				Some(tx)
			},
		};
		if let Some(tx) = published {
			if let Some(claim) = tx_builder.build_claim_htlc_delayed_tx(
				signer, &tx, &params, feerate_per_kw, &to_script,
			) {
				claim_htlc_delayed_txs.push(claim);
			}
		}
	}

	LocalCommitPublished {
		commit_tx,
		claim_main_delayed_output_tx,
		htlc_success_txs,
		htlc_timeout_txs,
		claim_htlc_delayed_txs,
		irrevocably_spent: HashMap::new(),
	}
}

/// Derives every transaction claiming our funds from a commitment of the peer's: the main
/// output (unless it pays to the wallet directly), preimage claims of HTLCs offered to us,
/// and expiry reclaims of HTLCs we offered.
pub fn claim_remote_commit_tx_outputs<S: ChannelSigner, B: TxBuilder>(
	signer: &S, tx_builder: &B, commitments: &Commitments, remote_commit: &RemoteCommit,
	tx: &Transaction,
) -> RemoteCommitPublished {
	let feerate_per_kw = commitments.local_commit.spec.feerate_per_kw;
	let to_script = commitments.local_params.default_final_script_pubkey.clone();
	let remote_pubkeys = &commitments.remote_params.pubkeys;

	let claim_main_output_tx = if commitments.channel_version.pays_directly_to_wallet() {
		None
	} else {
		tx_builder.build_claim_remote_main_output_tx(
			signer, tx, commitments.channel_version,
			&remote_commit.remote_per_commitment_point, remote_pubkeys, feerate_per_kw,
			&to_script,
		)
	};

	let preimages = known_preimages(commitments);
	let mut claim_htlc_success_txs = Vec::new();
	let mut claim_htlc_timeout_txs = Vec::new();
	// The spec is in the peer's frame: its outgoing HTLCs are the ones offered to us.
	for htlc in remote_commit.spec.htlcs.iter() {
		let add = htlc.add();
		let output = HTLCOutputInCommitment {
			offered: !htlc.is_incoming(),
			htlc_id: add.htlc_id,
			amount_msat: add.amount_msat,
			cltv_expiry: add.cltv_expiry,
			payment_hash: add.payment_hash,
			transaction_output_index: None,
		};
		match htlc {
			DirectedHtlc::Outgoing(_) => {
				if let Some(preimage) = preimage_for(&preimages, &add.payment_hash) {
					if let Some(claim) = tx_builder.build_claim_htlc_success_tx(
						signer, tx, &output, &preimage,
						&remote_commit.remote_per_commitment_point, remote_pubkeys,
						feerate_per_kw, &to_script,
					) {
						claim_htlc_success_txs.push(claim);
					}
				}
			},
			DirectedHtlc::Incoming(_) => {
				if let Some(claim) = tx_builder.build_claim_htlc_timeout_tx(
					signer, tx, &output, &remote_commit.remote_per_commitment_point,
					remote_pubkeys, feerate_per_kw, &to_script,
				) {
					claim_htlc_timeout_txs.push(claim);
				}
			},
		}
	}

	RemoteCommitPublished {
		commit_tx: tx.clone(),
		claim_main_output_tx,
		claim_htlc_success_txs,
		claim_htlc_timeout_txs,
		irrevocably_spent: HashMap::new(),
	}
}

/// Claims only our main output on a commitment of the peer's. Used when the peer proves it
/// is ahead of us and publishes a commitment we never signed: we cannot know its HTLCs, but
/// our main output is still ours.
pub fn claim_remote_commit_main_output<S: ChannelSigner, B: TxBuilder>(
	signer: &S, tx_builder: &B, commitments: &Commitments,
	their_per_commitment_point: &PublicKey, tx: &Transaction, feerate_per_kw: u32,
) -> RemoteCommitPublished {
	let to_script = commitments.local_params.default_final_script_pubkey.clone();
	let claim_main_output_tx = if commitments.channel_version.pays_directly_to_wallet() {
		None
	} else {
		tx_builder.build_claim_remote_main_output_tx(
			signer, tx, commitments.channel_version, their_per_commitment_point,
			&commitments.remote_params.pubkeys, feerate_per_kw, &to_script,
		)
	};
	RemoteCommitPublished {
		commit_tx: tx.clone(),
		claim_main_output_tx,
		claim_htlc_success_txs: Vec::new(),
		claim_htlc_timeout_txs: Vec::new(),
		irrevocably_spent: HashMap::new(),
	}
}

/// Recognizes a revoked commitment of the peer's and derives the full penalty set: our main
/// output claim, the main penalty, and one penalty per HTLC output.
///
/// Returns `None` if the transaction is not one of the peer's revoked commitments (its
/// number is at or past the current one, or we never received its revocation secret).
pub fn claim_revoked_remote_commit_tx_outputs<S: ChannelSigner, B: TxBuilder>(
	signer: &S, tx_builder: &B, commitments: &Commitments, tx: &Transaction,
) -> Option<RevokedCommitPublished> {
	let local_pubkeys = signer.pubkeys().clone();
	let commitment_number = tx_builder.commit_tx_number(
		tx, &local_pubkeys.payment_basepoint, &commitments.remote_params.pubkeys.payment_basepoint,
		commitments.local_params.is_funder,
	)?;
	if commitment_number >= commitments.remote_commit.index {
		return None;
	}
	let secret = commitments
		.remote_per_commitment_secrets
		.get_secret(INITIAL_COMMITMENT_NUMBER - commitment_number)?;

	let feerate_per_kw = commitments.local_commit.spec.feerate_per_kw;
	let to_script = commitments.local_params.default_final_script_pubkey.clone();
	let remote_pubkeys = &commitments.remote_params.pubkeys;

	let secp_ctx = Secp256k1::new();
	let their_per_commitment_point =
		PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&secret).ok()?);

	let claim_main_output_tx = if commitments.channel_version.pays_directly_to_wallet() {
		None
	} else {
		tx_builder.build_claim_remote_main_output_tx(
			signer, tx, commitments.channel_version, &their_per_commitment_point,
			remote_pubkeys, feerate_per_kw, &to_script,
		)
	};
	let main_penalty_tx = tx_builder.build_main_penalty_tx(
		signer, tx, &secret, commitment_number, remote_pubkeys, feerate_per_kw, &to_script,
	);
	let htlc_penalty_txs = tx_builder.build_htlc_penalty_txs(
		signer, tx, &secret, commitment_number, remote_pubkeys, feerate_per_kw, &to_script,
	);

	Some(RevokedCommitPublished {
		commit_tx: tx.clone(),
		claim_main_output_tx,
		main_penalty_tx,
		htlc_penalty_txs,
		claim_htlc_delayed_penalty_txs: Vec::new(),
		irrevocably_spent: HashMap::new(),
	})
}

fn watch_confirmed(
	channel_id: [u8; 32], tx: &Transaction, min_depth: u32,
) -> ChannelAction {
	ChannelAction::SendWatch {
		watch: WatchRequest::Confirmed {
			channel_id,
			txid: tx.compute_txid(),
			min_depth,
			tag: WatchTag::TxConfirmed(tx.compute_txid()),
		},
	}
}

fn watch_spent_outpoints(
	channel_id: [u8; 32], parent: &Transaction, outpoints: &[OutPoint],
) -> Vec<ChannelAction> {
	let parent_txid = parent.compute_txid();
	outpoints
		.iter()
		.filter(|outpoint| outpoint.txid == parent_txid)
		.filter_map(|outpoint| {
			let spent_output = parent.output.get(outpoint.vout as usize)?;
			Some(ChannelAction::SendWatch {
				watch: WatchRequest::Spent {
					channel_id,
					txid: outpoint.txid,
					output_index: outpoint.vout,
					script_pubkey: spent_output.script_pubkey.clone(),
					tag: WatchTag::OutputSpent,
				},
			})
		})
		.collect()
}

/// The publishes and watches that carry a [`LocalCommitPublished`] to resolution.
pub fn local_commit_published_actions(
	channel_id: [u8; 32], lcp: &LocalCommitPublished, min_depth: u32,
) -> Vec<ChannelAction> {
	let mut actions = Vec::new();
	actions.push(ChannelAction::PublishTx { tx: lcp.commit_tx.clone() });
	if let Some(tx) = &lcp.claim_main_delayed_output_tx {
		actions.push(ChannelAction::PublishTx { tx: tx.clone() });
	}
	for tx in lcp.htlc_success_txs.iter().chain(lcp.htlc_timeout_txs.iter()) {
		actions.push(ChannelAction::PublishTx { tx: tx.clone() });
	}
	for tx in lcp.claim_htlc_delayed_txs.iter() {
		actions.push(ChannelAction::PublishTx { tx: tx.clone() });
	}
	actions.push(watch_confirmed(channel_id, &lcp.commit_tx, min_depth));
	if let Some(tx) = &lcp.claim_main_delayed_output_tx {
		actions.push(watch_confirmed(channel_id, tx, min_depth));
	}
	for tx in lcp.claim_htlc_delayed_txs.iter() {
		actions.push(watch_confirmed(channel_id, tx, min_depth));
	}
	// Watch the HTLC outputs themselves: the peer may beat us to them and we want the
	// preimages out of its transactions.
	let outpoints = claimed_outpoints(
		lcp.htlc_success_txs.iter().chain(lcp.htlc_timeout_txs.iter()),
	);
	actions.extend(watch_spent_outpoints(channel_id, &lcp.commit_tx, &outpoints));
	actions
}

/// The publishes and watches that carry a [`RemoteCommitPublished`] to resolution.
pub fn remote_commit_published_actions(
	channel_id: [u8; 32], rcp: &RemoteCommitPublished, min_depth: u32,
) -> Vec<ChannelAction> {
	let mut actions = Vec::new();
	if let Some(tx) = &rcp.claim_main_output_tx {
		actions.push(ChannelAction::PublishTx { tx: tx.clone() });
	}
	for tx in rcp.claim_htlc_success_txs.iter().chain(rcp.claim_htlc_timeout_txs.iter()) {
		actions.push(ChannelAction::PublishTx { tx: tx.clone() });
	}
	actions.push(watch_confirmed(channel_id, &rcp.commit_tx, min_depth));
	if let Some(tx) = &rcp.claim_main_output_tx {
		actions.push(watch_confirmed(channel_id, tx, min_depth));
	}
	let outpoints = claimed_outpoints(
		rcp.claim_htlc_success_txs.iter().chain(rcp.claim_htlc_timeout_txs.iter()),
	);
	actions.extend(watch_spent_outpoints(channel_id, &rcp.commit_tx, &outpoints));
	actions
}

/// The publishes and watches that carry a [`RevokedCommitPublished`] to resolution.
pub fn revoked_commit_published_actions(
	channel_id: [u8; 32], rvk: &RevokedCommitPublished, min_depth: u32,
) -> Vec<ChannelAction> {
	let mut actions = Vec::new();
	if let Some(tx) = &rvk.claim_main_output_tx {
		actions.push(ChannelAction::PublishTx { tx: tx.clone() });
	}
	if let Some(tx) = &rvk.main_penalty_tx {
		actions.push(ChannelAction::PublishTx { tx: tx.clone() });
	}
	for tx in rvk.htlc_penalty_txs.iter().chain(rvk.claim_htlc_delayed_penalty_txs.iter()) {
		actions.push(ChannelAction::PublishTx { tx: tx.clone() });
	}
	actions.push(watch_confirmed(channel_id, &rvk.commit_tx, min_depth));
	if let Some(tx) = &rvk.claim_main_output_tx {
		actions.push(watch_confirmed(channel_id, tx, min_depth));
	}
	if let Some(tx) = &rvk.main_penalty_tx {
		actions.push(watch_confirmed(channel_id, tx, min_depth));
	}
	// Watch every revoked output for the cheater's own spends, so the delayed-penalty path
	// can chase its second-stage transactions.
	let outpoints = claimed_outpoints(
		rvk.main_penalty_tx.iter().chain(rvk.htlc_penalty_txs.iter()),
	);
	actions.extend(watch_spent_outpoints(channel_id, &rvk.commit_tx, &outpoints));
	actions
}

#[cfg(test)]
mod tests {
	use super::*;

	use bitcoin::absolute::LockTime;
	use bitcoin::hashes::Hash;
	use bitcoin::transaction::Version;
	use bitcoin::{Amount, Sequence, TxIn, TxOut, Witness};

	fn spend(prevouts: &[(Txid, u32)], value_satoshis: u64) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: prevouts
				.iter()
				.map(|(txid, vout)| TxIn {
					previous_output: OutPoint { txid: *txid, vout: *vout },
					script_sig: ScriptBuf::new(),
					sequence: Sequence(0xfffffffd),
					witness: Witness::new(),
				})
				.collect(),
			output: vec![TxOut {
				value: Amount::from_sat(value_satoshis),
				script_pubkey: ScriptBuf::new(),
			}],
		}
	}

	#[test]
	fn local_commit_resolution_bookkeeping() {
		let funding_txid = Txid::from_byte_array([1; 32]);
		let commit_tx = spend(&[(funding_txid, 0)], 100_000);
		let claim_main = spend(&[(commit_tx.compute_txid(), 0)], 99_000);
		let lcp = LocalCommitPublished {
			commit_tx: commit_tx.clone(),
			claim_main_delayed_output_tx: Some(claim_main.clone()),
			htlc_success_txs: Vec::new(),
			htlc_timeout_txs: Vec::new(),
			claim_htlc_delayed_txs: Vec::new(),
			irrevocably_spent: HashMap::new(),
		};
		assert!(!lcp.is_done());

		// The commitment confirms: the funding output is irrevocably spent, but our claim
		// is still floating.
		let lcp = lcp.on_tx_confirmed(&commit_tx);
		assert_eq!(
			lcp.irrevocably_spent.get(&OutPoint { txid: funding_txid, vout: 0 }),
			Some(&commit_tx.compute_txid())
		);
		assert!(!lcp.is_done());

		// The claim confirms too: everything resolved.
		let lcp = lcp.on_tx_confirmed(&claim_main);
		assert!(lcp.is_done());
	}

	#[test]
	fn third_party_spend_also_resolves_a_claim() {
		let funding_txid = Txid::from_byte_array([1; 32]);
		let commit_tx = spend(&[(funding_txid, 0)], 100_000);
		let our_claim = spend(&[(commit_tx.compute_txid(), 1)], 9_000);
		let rcp = RemoteCommitPublished {
			commit_tx: commit_tx.clone(),
			claim_main_output_tx: None,
			claim_htlc_success_txs: vec![our_claim],
			claim_htlc_timeout_txs: Vec::new(),
			irrevocably_spent: HashMap::new(),
		};
		let rcp = rcp.on_tx_confirmed(&commit_tx);
		assert!(!rcp.is_done());
		// The peer beats us to the HTLC output; its spend still resolves our plan.
		let their_spend = spend(&[(commit_tx.compute_txid(), 1)], 9_500);
		let rcp = rcp.on_tx_confirmed(&their_spend);
		assert!(rcp.is_done());
	}

	#[test]
	fn closing_fee_negotiation_terminates() {
		// From any starting gap, alternate averaging converges within the iteration cap.
		let mut local = 1_000u64;
		let mut remote = 200_000u64;
		let mut iterations = 0;
		while local != remote {
			local = next_closing_fee(local, remote);
			if local == remote {
				break;
			}
			remote = next_closing_fee(remote, local);
			iterations += 1;
			assert!(iterations <= crate::ln::channel::MAX_NEGOTIATION_ITERATIONS);
		}
	}
}
