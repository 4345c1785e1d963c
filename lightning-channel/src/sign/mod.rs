// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Provides the contracts through which the channel state machine reaches everything it is
//! not allowed to do itself: key derivation, signing, transaction assembly and entropy.
//!
//! The state machine is a pure function; implementations of these traits are expected to be
//! deterministic for a given key material (except [`KeysInterface::get_secure_random_bytes`],
//! the one sanctioned source of entropy) and must not perform I/O on the calling thread's
//! behalf.

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Transaction};

use crate::ln::chan_utils::{
	ChannelPublicKeys, CommitmentTxInfo, HTLCOutputInCommitment, HTLCTx, InputInfo,
};
use crate::ln::channel::FundedState;
use crate::ln::channel_version::ChannelVersion;
use crate::ln::commitment_spec::CommitmentSpec;
use crate::ln::msgs::EncryptedChannelData;
use crate::ln::PaymentPreimage;

/// Everything a transaction builder needs to know to materialize one side's commitment
/// transaction: which side broadcasts, its policy knobs, and both key sets.
///
/// The commitment spec handed to the builder is always expressed in the broadcaster's frame
/// (`to_local` is the broadcaster's balance, `Outgoing` HTLCs are offered by the broadcaster).
#[derive(Clone, Debug)]
pub struct CommitmentTxParams<'a> {
	/// The channel semantics in force.
	pub channel_version: ChannelVersion,
	/// The funding output every commitment spends.
	pub commit_input: &'a InputInfo,
	/// The broadcaster's index for this commitment, ascending from zero.
	pub commitment_number: u64,
	/// Whether the broadcaster funded the channel and therefore pays the commitment fee.
	pub broadcaster_is_funder: bool,
	/// Outputs below this are trimmed from the broadcaster's commitment.
	pub broadcaster_dust_limit_satoshis: u64,
	/// How long the broadcaster's own outputs are delayed.
	pub broadcaster_to_self_delay: u16,
	/// The broadcaster's channel keys.
	pub broadcaster_pubkeys: &'a ChannelPublicKeys,
	/// The non-broadcasting side's channel keys.
	pub countersignatory_pubkeys: &'a ChannelPublicKeys,
	/// The broadcaster's per-commitment point at `commitment_number`.
	pub per_commitment_point: PublicKey,
}

/// A trait to sign lightning channel transactions as described in BOLT 3.
///
/// Signing services could be implemented on a hardware wallet. In this case, the current
/// implementation would ask to sign everything it is handed; an external policy engine
/// should be used to verify what gets signed.
pub trait ChannelSigner {
	/// Returns the holder's channel public keys and basepoints.
	fn pubkeys(&self) -> &ChannelPublicKeys;

	/// Returns an identifier from which this signer can be re-derived by
	/// [`KeysInterface::derive_channel_signer`].
	fn channel_keys_id(&self) -> [u8; 32];

	/// Gets the per-commitment point for a specific commitment number, ascending from zero.
	fn get_per_commitment_point(&self, idx: u64) -> PublicKey;

	/// Gets the commitment secret for a specific commitment number. Once this has been
	/// handed to the counterparty the commitment at `idx` is revoked; it must therefore
	/// never be called on an index at or past the current local commitment except while
	/// proving data loss during reestablishment.
	fn release_commitment_secret(&self, idx: u64) -> [u8; 32];

	/// Creates signatures for a counterparty's commitment transaction and its attached
	/// second-stage HTLC transactions, in the order the HTLC transactions were given.
	fn sign_counterparty_commitment(
		&self, commit_tx: &CommitmentTxInfo, htlc_txs: &[HTLCTx],
	) -> (Signature, Vec<Signature>);

	/// Creates signatures for our own commitment transaction and its second-stage HTLC
	/// transactions.
	fn sign_holder_commitment(
		&self, commit_tx: &CommitmentTxInfo, htlc_txs: &[HTLCTx],
	) -> (Signature, Vec<Signature>);

	/// Creates a signature for a mutual close transaction.
	fn sign_closing_transaction(
		&self, closing_tx: &Transaction, commit_input: &InputInfo,
	) -> Signature;
}

/// A trait which should be implemented to provide keys and derived entropy to the channel
/// state machine, and to seal channel backups destined for peers.
pub trait KeysInterface {
	/// The signer type this interface derives per channel.
	type Signer: ChannelSigner;

	/// Derives the per-channel signer for the channel identified by `channel_keys_id`. Must
	/// be deterministic: restoring a channel re-derives the same signer.
	fn derive_channel_signer(&self, channel_keys_id: [u8; 32]) -> Self::Signer;

	/// Gets a unique, cryptographically-secure random 32 byte value. The state machine's only
	/// entropy: it seeds the placeholder per-commitment point used before the counterparty
	/// has told us its real one.
	fn get_secure_random_bytes(&self) -> [u8; 32];

	/// Gets the script this node closes channels to when no explicit script is requested.
	fn get_shutdown_scriptpubkey(&self) -> ScriptBuf;

	/// Seals the given channel state into an opaque blob a peer can hold for us.
	///
	/// The construction is ChaCha20-Poly1305 (RFC 8439) keyed by the SHA-256 of the node
	/// secret; the blob is `ciphertext || 16-byte tag || 32-byte random salt`, with the
	/// 12-byte nonce derived as the first half of `HMAC-SHA256(key, salt)`. Only this node
	/// can open its own blobs.
	fn encrypt_channel_data(&self, state: &FundedState) -> EncryptedChannelData;

	/// Opens a blob previously produced by [`KeysInterface::encrypt_channel_data`]. Fails on
	/// any authentication or decoding error, including blobs sealed by other nodes.
	fn decrypt_channel_data(&self, data: &EncryptedChannelData) -> Result<FundedState, ()>;
}

/// A trait which assembles the transactions a channel can put on chain.
///
/// Script construction, sighash computation and witness assembly live behind this trait; the
/// state machine decides *which* transactions exist and *when* they are built, the builder
/// decides what their bytes are. Builders must be deterministic.
///
/// Claim builders return `None` when the output they would claim does not exist on the given
/// transaction or is not worth claiming at the given feerate.
pub trait TxBuilder {
	/// Builds the funding redeem script and the corresponding output script for the 2-of-2
	/// funding output.
	fn make_funding_script(
		&self, local_funding_pubkey: &PublicKey, remote_funding_pubkey: &PublicKey,
	) -> (ScriptBuf, ScriptBuf);

	/// Builds the commitment transaction for `spec`, assigning output indexes to every
	/// non-dust HTLC.
	fn build_commitment_tx(
		&self, params: &CommitmentTxParams, spec: &CommitmentSpec,
	) -> CommitmentTxInfo;

	/// Builds the second-stage transactions attached to a commitment: one HTLC-timeout per
	/// non-dust offered HTLC and one HTLC-success per non-dust received HTLC.
	fn build_htlc_txs(
		&self, params: &CommitmentTxParams, commit_tx: &CommitmentTxInfo,
	) -> Vec<HTLCTx>;

	/// Checks a commitment signature against the funding output.
	fn check_commitment_sig(
		&self, commit_tx: &CommitmentTxInfo, commit_input: &InputInfo,
		funding_pubkey: &PublicKey, sig: &Signature,
	) -> bool;

	/// Checks an HTLC transaction signature made with the key derived from the given HTLC
	/// basepoint and per-commitment point.
	fn check_htlc_sig(
		&self, htlc_tx: &HTLCTx, commit_tx: &CommitmentTxInfo, htlc_basepoint: &PublicKey,
		per_commitment_point: &PublicKey, sig: &Signature,
	) -> bool;

	/// Checks a mutual close signature against the funding output.
	fn check_closing_sig(
		&self, closing_tx: &Transaction, commit_input: &InputInfo, funding_pubkey: &PublicKey,
		sig: &Signature,
	) -> bool;

	/// Completes a commitment transaction with its 2-of-2 witness, making it publishable.
	fn add_commitment_sigs(
		&self, commit_tx: Transaction, redeem_script: &ScriptBuf,
		local_funding_pubkey: &PublicKey, remote_funding_pubkey: &PublicKey,
		local_sig: &Signature, remote_sig: &Signature,
	) -> Transaction;

	/// Completes a mutual close transaction with its 2-of-2 witness.
	fn add_closing_sigs(
		&self, closing_tx: Transaction, redeem_script: &ScriptBuf,
		local_funding_pubkey: &PublicKey, remote_funding_pubkey: &PublicKey,
		local_sig: &Signature, remote_sig: &Signature,
	) -> Transaction;

	/// Completes a second-stage HTLC transaction with its witness. Success transactions
	/// additionally need the payment preimage.
	fn finalize_htlc_tx(
		&self, htlc_tx: &HTLCTx, local_sig: &Signature, remote_sig: &Signature,
		preimage: Option<&PaymentPreimage>,
	) -> Transaction;

	/// Builds the unsigned mutual close transaction: one output per side above the dust
	/// limit, the fee taken from the funder's output.
	fn build_closing_tx(
		&self, commit_input: &InputInfo, local_script: &ScriptBuf, remote_script: &ScriptBuf,
		local_is_funder: bool, dust_limit_satoshis: u64, fee_satoshis: u64,
		spec: &CommitmentSpec,
	) -> Transaction;

	/// Recovers the broadcaster's ascending commitment number from a commitment
	/// transaction's obscured fields, or `None` if the transaction is not a commitment of
	/// this channel.
	fn commit_tx_number(
		&self, commit_tx: &Transaction, local_payment_basepoint: &PublicKey,
		remote_payment_basepoint: &PublicKey, local_is_funder: bool,
	) -> Option<u64>;

	/// Claims our delayed main output on our own commitment transaction, once the
	/// `to_self_delay` has passed.
	fn build_claim_delayed_output_tx<S: ChannelSigner>(
		&self, signer: &S, commit_tx: &Transaction, params: &CommitmentTxParams,
		feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction>;

	/// Claims the delayed output of one of our own second-stage HTLC transactions.
	fn build_claim_htlc_delayed_tx<S: ChannelSigner>(
		&self, signer: &S, htlc_tx: &Transaction, params: &CommitmentTxParams,
		feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction>;

	/// Claims our main output on a counterparty commitment transaction.
	fn build_claim_remote_main_output_tx<S: ChannelSigner>(
		&self, signer: &S, commit_tx: &Transaction, channel_version: ChannelVersion,
		remote_per_commitment_point: &PublicKey, remote_pubkeys: &ChannelPublicKeys,
		feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction>;

	/// Claims an HTLC offered to us on a counterparty commitment, using the preimage.
	fn build_claim_htlc_success_tx<S: ChannelSigner>(
		&self, signer: &S, commit_tx: &Transaction, htlc: &HTLCOutputInCommitment,
		preimage: &PaymentPreimage, remote_per_commitment_point: &PublicKey,
		remote_pubkeys: &ChannelPublicKeys, feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction>;

	/// Reclaims an HTLC we offered on a counterparty commitment, after its expiry.
	fn build_claim_htlc_timeout_tx<S: ChannelSigner>(
		&self, signer: &S, commit_tx: &Transaction, htlc: &HTLCOutputInCommitment,
		remote_per_commitment_point: &PublicKey, remote_pubkeys: &ChannelPublicKeys,
		feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction>;

	/// Sweeps the cheater's main output on a revoked commitment with the revocation key.
	fn build_main_penalty_tx<S: ChannelSigner>(
		&self, signer: &S, commit_tx: &Transaction, remote_per_commitment_secret: &[u8; 32],
		commitment_number: u64, remote_pubkeys: &ChannelPublicKeys, feerate_per_kw: u32,
		to_script: &ScriptBuf,
	) -> Option<Transaction>;

	/// Sweeps every HTLC output on a revoked commitment with the revocation key. The builder
	/// reconstructs the HTLC scripts from the HTLC information persisted for
	/// `commitment_number` when that commitment was signed.
	fn build_htlc_penalty_txs<S: ChannelSigner>(
		&self, signer: &S, commit_tx: &Transaction, remote_per_commitment_secret: &[u8; 32],
		commitment_number: u64, remote_pubkeys: &ChannelPublicKeys, feerate_per_kw: u32,
		to_script: &ScriptBuf,
	) -> Vec<Transaction>;

	/// Sweeps the delayed output of a second-stage HTLC transaction the cheater managed to
	/// confirm on top of a revoked commitment.
	fn build_claim_htlc_delayed_penalty_tx<S: ChannelSigner>(
		&self, signer: &S, htlc_spending_tx: &Transaction,
		remote_per_commitment_secret: &[u8; 32], commitment_number: u64,
		remote_pubkeys: &ChannelPublicKeys, feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction>;
}
