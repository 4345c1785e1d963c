// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Deterministic collaborator doubles for tests: a capturing logger, a key manager with a
//! real secret chain, and a transaction builder producing stable, recognizable transactions
//! whose outputs follow the commitment spec.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
	Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, WPubkeyHash, WScriptHash,
	Witness,
};

use crate::ln::chan_utils::{
	build_commitment_secret, htlc_success_fee_sat, htlc_timeout_fee_sat, weight_to_fee_sat,
	ChannelPublicKeys, CommitmentTxInfo, HTLCOutputInCommitment, HTLCTx, InputInfo,
	INITIAL_COMMITMENT_NUMBER,
};
use crate::ln::channel::FundedState;
use crate::ln::channel_version::ChannelVersion;
use crate::ln::commitment_spec::CommitmentSpec;
use crate::ln::msgs::EncryptedChannelData;
use crate::ln::PaymentPreimage;
use crate::sign::{ChannelSigner, CommitmentTxParams, KeysInterface, TxBuilder};
use crate::util::logger::{Level, Logger, Record};

use std::collections::HashMap;
use std::sync::Mutex;

/// A logger that records every line for assertions and prints at or above its level.
pub struct TestLogger {
	level: Level,
	/// Count of lines seen, keyed by (module path, formatted message).
	pub lines: Mutex<HashMap<(String, String), usize>>,
}

impl TestLogger {
	/// A logger printing nothing below `Error`.
	pub fn new() -> TestLogger {
		TestLogger { level: Level::Error, lines: Mutex::new(HashMap::new()) }
	}

	/// Lowers the print threshold.
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}

	/// Asserts an exact line was logged `count` times from `module`.
	pub fn assert_log(&self, module: &str, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		assert_eq!(log_entries.get(&(module.to_string(), line)), Some(&count));
	}

	/// Asserts some line containing `fragment` was logged at least once.
	pub fn assert_log_contains(&self, module: &str, fragment: &str) {
		let log_entries = self.lines.lock().unwrap();
		assert!(
			log_entries
				.iter()
				.any(|((m, line), _)| m == module && line.contains(fragment)),
			"no log line from {} containing {:?}",
			module,
			fragment
		);
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		*self
			.lines
			.lock()
			.unwrap()
			.entry((record.module_path.to_string(), format!("{}", record.args)))
			.or_insert(0) += 1;
		if record.level >= self.level {
			println!(
				"{:<5} [{} : {}] {}",
				record.level.to_string(),
				record.module_path,
				record.line,
				record.args
			);
		}
	}
}

fn derive_key(seed: &[u8; 32], channel_keys_id: &[u8; 32], tag: &[u8]) -> SecretKey {
	let mut engine = Sha256::engine();
	engine.input(seed);
	engine.input(channel_keys_id);
	engine.input(tag);
	SecretKey::from_slice(&Sha256::from_engine(engine).to_byte_array()).unwrap()
}

fn sighash(tx: &Transaction) -> Message {
	let digest = Sha256::hash(&tx.compute_txid().to_byte_array()).to_byte_array();
	Message::from_digest(digest)
}

/// A signer with a real per-commitment secret chain and deterministic ECDSA signatures over
/// a hash of the transaction id, which [`TestTxBuilder`] verifies symmetrically.
pub struct TestChannelSigner {
	secp_ctx: Secp256k1<All>,
	funding_key: SecretKey,
	htlc_base_key: SecretKey,
	commitment_seed: [u8; 32],
	pubkeys: ChannelPublicKeys,
	channel_keys_id: [u8; 32],
}

impl TestChannelSigner {
	fn new(seed: &[u8; 32], channel_keys_id: [u8; 32]) -> TestChannelSigner {
		let secp_ctx = Secp256k1::new();
		let funding_key = derive_key(seed, &channel_keys_id, b"funding");
		let revocation_base_key = derive_key(seed, &channel_keys_id, b"revocation");
		let payment_base_key = derive_key(seed, &channel_keys_id, b"payment");
		let delayed_payment_base_key = derive_key(seed, &channel_keys_id, b"delayed");
		let htlc_base_key = derive_key(seed, &channel_keys_id, b"htlc");
		let commitment_seed = derive_key(seed, &channel_keys_id, b"commitment_seed").secret_bytes();
		let pubkeys = ChannelPublicKeys {
			funding_pubkey: PublicKey::from_secret_key(&secp_ctx, &funding_key),
			revocation_basepoint: PublicKey::from_secret_key(&secp_ctx, &revocation_base_key),
			payment_basepoint: PublicKey::from_secret_key(&secp_ctx, &payment_base_key),
			delayed_payment_basepoint: PublicKey::from_secret_key(
				&secp_ctx,
				&delayed_payment_base_key,
			),
			htlc_basepoint: PublicKey::from_secret_key(&secp_ctx, &htlc_base_key),
		};
		TestChannelSigner {
			secp_ctx,
			funding_key,
			htlc_base_key,
			commitment_seed,
			pubkeys,
			channel_keys_id,
		}
	}
}

impl ChannelSigner for TestChannelSigner {
	fn pubkeys(&self) -> &ChannelPublicKeys {
		&self.pubkeys
	}

	fn channel_keys_id(&self) -> [u8; 32] {
		self.channel_keys_id
	}

	fn get_per_commitment_point(&self, idx: u64) -> PublicKey {
		let secret = self.release_commitment_secret(idx);
		PublicKey::from_secret_key(&self.secp_ctx, &SecretKey::from_slice(&secret).unwrap())
	}

	fn release_commitment_secret(&self, idx: u64) -> [u8; 32] {
		build_commitment_secret(&self.commitment_seed, INITIAL_COMMITMENT_NUMBER - idx)
	}

	fn sign_counterparty_commitment(
		&self, commit_tx: &CommitmentTxInfo, htlc_txs: &[HTLCTx],
	) -> (Signature, Vec<Signature>) {
		let commit_sig = self.secp_ctx.sign_ecdsa(&sighash(&commit_tx.tx), &self.funding_key);
		let htlc_sigs = htlc_txs
			.iter()
			.map(|htlc_tx| self.secp_ctx.sign_ecdsa(&sighash(htlc_tx.tx()), &self.htlc_base_key))
			.collect();
		(commit_sig, htlc_sigs)
	}

	fn sign_holder_commitment(
		&self, commit_tx: &CommitmentTxInfo, htlc_txs: &[HTLCTx],
	) -> (Signature, Vec<Signature>) {
		self.sign_counterparty_commitment(commit_tx, htlc_txs)
	}

	fn sign_closing_transaction(
		&self, closing_tx: &Transaction, _commit_input: &InputInfo,
	) -> Signature {
		self.secp_ctx.sign_ecdsa(&sighash(closing_tx), &self.funding_key)
	}
}

/// A deterministic [`KeysInterface`] whose channel backups round-trip through an in-memory
/// store, standing in for the AEAD the production key manager performs.
pub struct TestKeysInterface {
	seed: [u8; 32],
	entropy_counter: Mutex<u64>,
	backups: Mutex<Vec<FundedState>>,
}

impl TestKeysInterface {
	/// A key manager derived entirely from `seed`.
	pub fn new(seed: [u8; 32]) -> TestKeysInterface {
		TestKeysInterface {
			seed,
			entropy_counter: Mutex::new(0),
			backups: Mutex::new(Vec::new()),
		}
	}
}

impl KeysInterface for TestKeysInterface {
	type Signer = TestChannelSigner;

	fn derive_channel_signer(&self, channel_keys_id: [u8; 32]) -> TestChannelSigner {
		TestChannelSigner::new(&self.seed, channel_keys_id)
	}

	fn get_secure_random_bytes(&self) -> [u8; 32] {
		let mut counter = self.entropy_counter.lock().unwrap();
		*counter += 1;
		let mut engine = Sha256::engine();
		engine.input(&self.seed);
		engine.input(&counter.to_be_bytes());
		engine.input(b"entropy");
		Sha256::from_engine(engine).to_byte_array()
	}

	fn get_shutdown_scriptpubkey(&self) -> ScriptBuf {
		let key = derive_key(&self.seed, &[0; 32], b"shutdown");
		let secp_ctx = Secp256k1::new();
		let pubkey = PublicKey::from_secret_key(&secp_ctx, &key);
		ScriptBuf::new_p2wpkh(&WPubkeyHash::hash(&pubkey.serialize()))
	}

	fn encrypt_channel_data(&self, state: &FundedState) -> EncryptedChannelData {
		let mut backups = self.backups.lock().unwrap();
		backups.push(state.clone());
		let mut data = b"backup".to_vec();
		data.extend_from_slice(&((backups.len() - 1) as u64).to_be_bytes());
		EncryptedChannelData { data }
	}

	fn decrypt_channel_data(&self, data: &EncryptedChannelData) -> Result<FundedState, ()> {
		if data.data.len() != 14 || !data.data.starts_with(b"backup") {
			return Err(());
		}
		let mut index_bytes = [0u8; 8];
		index_bytes.copy_from_slice(&data.data[6..]);
		let index = u64::from_be_bytes(index_bytes) as usize;
		self.backups.lock().unwrap().get(index).cloned().ok_or(())
	}
}

// Commitment transactions carry their number in the locktime, offset so that claim and
// closing transactions (locktime zero or a real CLTV) never look like commitments.
const COMMITMENT_LOCKTIME_OFFSET: u32 = 500_000;

fn marker_script(parts: &[&[u8]]) -> ScriptBuf {
	let mut engine = Sha256::engine();
	for part in parts {
		engine.input(part);
	}
	ScriptBuf::new_p2wsh(&WScriptHash::from_byte_array(
		Sha256::from_engine(engine).to_byte_array(),
	))
}

fn to_local_script(params: &CommitmentTxParams) -> ScriptBuf {
	to_local_script_parts(
		&params.per_commitment_point,
		&params.broadcaster_pubkeys.delayed_payment_basepoint,
	)
}

fn to_local_script_parts(
	per_commitment_point: &PublicKey, delayed_payment_basepoint: &PublicKey,
) -> ScriptBuf {
	marker_script(&[
		b"to_local",
		&per_commitment_point.serialize(),
		&delayed_payment_basepoint.serialize(),
	])
}

fn to_remote_script(countersignatory_payment_basepoint: &PublicKey) -> ScriptBuf {
	marker_script(&[b"to_remote", &countersignatory_payment_basepoint.serialize()])
}

fn htlc_script(htlc: &HTLCOutputInCommitment) -> ScriptBuf {
	marker_script(&[
		b"htlc",
		&[htlc.offered as u8],
		&htlc.payment_hash.0,
		&htlc.cltv_expiry.to_be_bytes(),
	])
}

fn htlc_delayed_script(params: &CommitmentTxParams) -> ScriptBuf {
	marker_script(&[
		b"htlc_delayed",
		&params.per_commitment_point.serialize(),
		&params.broadcaster_pubkeys.delayed_payment_basepoint.serialize(),
	])
}

fn spend_input(txid: bitcoin::Txid, vout: u32) -> TxIn {
	TxIn {
		previous_output: OutPoint { txid, vout },
		script_sig: ScriptBuf::new(),
		sequence: Sequence(0xfffffffd),
		witness: Witness::new(),
	}
}

fn spend_output(
	parent: &Transaction, script: &ScriptBuf, fee_satoshis: u64, to_script: &ScriptBuf,
	locktime: u32,
) -> Option<Transaction> {
	let parent_txid = parent.compute_txid();
	let (vout, output) = parent
		.output
		.iter()
		.enumerate()
		.find(|(_, output)| output.script_pubkey == *script)?;
	let value = output.value.to_sat().saturating_sub(fee_satoshis);
	if value == 0 {
		return None;
	}
	Some(Transaction {
		version: Version::TWO,
		lock_time: LockTime::from_consensus(locktime),
		input: vec![spend_input(parent_txid, vout as u32)],
		output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: to_script.clone() }],
	})
}

/// A transaction builder producing deterministic placeholder transactions: real outpoints
/// and amounts, marker scripts instead of real BOLT 3 scripts, and signature checks matching
/// [`TestChannelSigner`].
pub struct TestTxBuilder {
	secp_ctx: Secp256k1<All>,
}

impl TestTxBuilder {
	/// A fresh builder.
	pub fn new() -> TestTxBuilder {
		TestTxBuilder { secp_ctx: Secp256k1::new() }
	}

	fn check_sig(&self, tx: &Transaction, pubkey: &PublicKey, sig: &Signature) -> bool {
		self.secp_ctx.verify_ecdsa(&sighash(tx), sig, pubkey).is_ok()
	}
}

impl TxBuilder for TestTxBuilder {
	fn make_funding_script(
		&self, local_funding_pubkey: &PublicKey, remote_funding_pubkey: &PublicKey,
	) -> (ScriptBuf, ScriptBuf) {
		// Order the keys so both sides derive the same script.
		let (first, second) =
			if local_funding_pubkey.serialize() < remote_funding_pubkey.serialize() {
				(local_funding_pubkey, remote_funding_pubkey)
			} else {
				(remote_funding_pubkey, local_funding_pubkey)
			};
		let redeem =
			marker_script(&[b"funding_redeem", &first.serialize(), &second.serialize()]);
		let spk = marker_script(&[b"funding", &first.serialize(), &second.serialize()]);
		(redeem, spk)
	}

	fn build_commitment_tx(
		&self, params: &CommitmentTxParams, spec: &CommitmentSpec,
	) -> CommitmentTxInfo {
		let fee_satoshis = spec.commit_tx_fee_sat(params.broadcaster_dust_limit_satoshis);
		let mut to_local_satoshis = spec.to_local_msat / 1000;
		let mut to_remote_satoshis = spec.to_remote_msat / 1000;
		if params.broadcaster_is_funder {
			to_local_satoshis = to_local_satoshis.saturating_sub(fee_satoshis);
		} else {
			to_remote_satoshis = to_remote_satoshis.saturating_sub(fee_satoshis);
		}

		let mut output = Vec::new();
		if to_local_satoshis >= params.broadcaster_dust_limit_satoshis {
			output.push(TxOut {
				value: Amount::from_sat(to_local_satoshis),
				script_pubkey: to_local_script(params),
			});
		}
		if to_remote_satoshis >= params.broadcaster_dust_limit_satoshis {
			output.push(TxOut {
				value: Amount::from_sat(to_remote_satoshis),
				script_pubkey: to_remote_script(
					&params.countersignatory_pubkeys.payment_basepoint,
				),
			});
		}

		let mut htlc_outputs = Vec::new();
		for htlc in spec.htlcs.iter() {
			let add = htlc.add();
			let mut in_commitment = HTLCOutputInCommitment {
				offered: !htlc.is_incoming(),
				htlc_id: add.htlc_id,
				amount_msat: add.amount_msat,
				cltv_expiry: add.cltv_expiry,
				payment_hash: add.payment_hash,
				transaction_output_index: None,
			};
			if spec.is_untrimmed(htlc, params.broadcaster_dust_limit_satoshis) {
				in_commitment.transaction_output_index = Some(output.len() as u32);
				output.push(TxOut {
					value: Amount::from_sat(add.amount_msat / 1000),
					script_pubkey: htlc_script(&in_commitment),
				});
			}
			htlc_outputs.push(in_commitment);
		}

		let tx = Transaction {
			version: Version::TWO,
			lock_time: LockTime::from_consensus(
				COMMITMENT_LOCKTIME_OFFSET + params.commitment_number as u32,
			),
			input: vec![spend_input(
				params.commit_input.outpoint.txid,
				params.commit_input.outpoint.vout,
			)],
			output,
		};
		CommitmentTxInfo { tx, htlc_outputs }
	}

	fn build_htlc_txs(
		&self, params: &CommitmentTxParams, commit_tx: &CommitmentTxInfo,
	) -> Vec<HTLCTx> {
		let commit_txid = commit_tx.tx.compute_txid();
		let mut htlc_txs = Vec::new();
		for htlc in commit_tx.htlc_outputs.iter() {
			let vout = match htlc.transaction_output_index {
				Some(vout) => vout,
				None => continue,
			};
			let amount = commit_tx.tx.output[vout as usize].value.to_sat();
			if htlc.offered {
				let fee = htlc_timeout_fee_sat(commit_tx_feerate(commit_tx, params));
				htlc_txs.push(HTLCTx::Timeout {
					tx: Transaction {
						version: Version::TWO,
						lock_time: LockTime::from_consensus(htlc.cltv_expiry),
						input: vec![spend_input(commit_txid, vout)],
						output: vec![TxOut {
							value: Amount::from_sat(amount.saturating_sub(fee).max(1)),
							script_pubkey: htlc_delayed_script(params),
						}],
					},
					htlc_id: htlc.htlc_id,
				});
			} else {
				let fee = htlc_success_fee_sat(commit_tx_feerate(commit_tx, params));
				htlc_txs.push(HTLCTx::Success {
					tx: Transaction {
						version: Version::TWO,
						lock_time: LockTime::ZERO,
						input: vec![spend_input(commit_txid, vout)],
						output: vec![TxOut {
							value: Amount::from_sat(amount.saturating_sub(fee).max(1)),
							script_pubkey: htlc_delayed_script(params),
						}],
					},
					htlc_id: htlc.htlc_id,
					payment_hash: htlc.payment_hash,
				});
			}
		}
		htlc_txs
	}

	fn check_commitment_sig(
		&self, commit_tx: &CommitmentTxInfo, _commit_input: &InputInfo,
		funding_pubkey: &PublicKey, sig: &Signature,
	) -> bool {
		self.check_sig(&commit_tx.tx, funding_pubkey, sig)
	}

	fn check_htlc_sig(
		&self, htlc_tx: &HTLCTx, _commit_tx: &CommitmentTxInfo, htlc_basepoint: &PublicKey,
		_per_commitment_point: &PublicKey, sig: &Signature,
	) -> bool {
		self.check_sig(htlc_tx.tx(), htlc_basepoint, sig)
	}

	fn check_closing_sig(
		&self, closing_tx: &Transaction, _commit_input: &InputInfo, funding_pubkey: &PublicKey,
		sig: &Signature,
	) -> bool {
		self.check_sig(closing_tx, funding_pubkey, sig)
	}

	fn add_commitment_sigs(
		&self, mut commit_tx: Transaction, redeem_script: &ScriptBuf,
		_local_funding_pubkey: &PublicKey, _remote_funding_pubkey: &PublicKey,
		local_sig: &Signature, remote_sig: &Signature,
	) -> Transaction {
		let mut witness = Witness::new();
		witness.push(Vec::new());
		witness.push(local_sig.serialize_der().to_vec());
		witness.push(remote_sig.serialize_der().to_vec());
		witness.push(redeem_script.to_bytes());
		commit_tx.input[0].witness = witness;
		commit_tx
	}

	fn add_closing_sigs(
		&self, closing_tx: Transaction, redeem_script: &ScriptBuf,
		local_funding_pubkey: &PublicKey, remote_funding_pubkey: &PublicKey,
		local_sig: &Signature, remote_sig: &Signature,
	) -> Transaction {
		self.add_commitment_sigs(
			closing_tx, redeem_script, local_funding_pubkey, remote_funding_pubkey, local_sig,
			remote_sig,
		)
	}

	fn finalize_htlc_tx(
		&self, htlc_tx: &HTLCTx, local_sig: &Signature, remote_sig: &Signature,
		preimage: Option<&PaymentPreimage>,
	) -> Transaction {
		let mut tx = htlc_tx.tx().clone();
		let mut witness = Witness::new();
		witness.push(Vec::new());
		witness.push(remote_sig.serialize_der().to_vec());
		witness.push(local_sig.serialize_der().to_vec());
		if let Some(preimage) = preimage {
			witness.push(preimage.0.to_vec());
		}
		tx.input[0].witness = witness;
		tx
	}

	fn build_closing_tx(
		&self, commit_input: &InputInfo, local_script: &ScriptBuf, remote_script: &ScriptBuf,
		local_is_funder: bool, dust_limit_satoshis: u64, fee_satoshis: u64,
		spec: &CommitmentSpec,
	) -> Transaction {
		let mut to_local_satoshis = spec.to_local_msat / 1000;
		let mut to_remote_satoshis = spec.to_remote_msat / 1000;
		if local_is_funder {
			to_local_satoshis = to_local_satoshis.saturating_sub(fee_satoshis);
		} else {
			to_remote_satoshis = to_remote_satoshis.saturating_sub(fee_satoshis);
		}
		let mut output = Vec::new();
		if to_local_satoshis >= dust_limit_satoshis {
			output.push(TxOut {
				value: Amount::from_sat(to_local_satoshis),
				script_pubkey: local_script.clone(),
			});
		}
		if to_remote_satoshis >= dust_limit_satoshis {
			output.push(TxOut {
				value: Amount::from_sat(to_remote_satoshis),
				script_pubkey: remote_script.clone(),
			});
		}
		// Both sides must assemble byte-identical closing transactions.
		output.sort_by(|a, b| {
			a.value.cmp(&b.value).then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
		});
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![spend_input(commit_input.outpoint.txid, commit_input.outpoint.vout)],
			output,
		}
	}

	fn commit_tx_number(
		&self, commit_tx: &Transaction, _local_payment_basepoint: &PublicKey,
		_remote_payment_basepoint: &PublicKey, _local_is_funder: bool,
	) -> Option<u64> {
		let locktime = commit_tx.lock_time.to_consensus_u32();
		if locktime >= COMMITMENT_LOCKTIME_OFFSET && locktime < 500_000_000 {
			Some((locktime - COMMITMENT_LOCKTIME_OFFSET) as u64)
		} else {
			None
		}
	}

	fn build_claim_delayed_output_tx<S: ChannelSigner>(
		&self, _signer: &S, commit_tx: &Transaction, params: &CommitmentTxParams,
		feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction> {
		spend_output(
			commit_tx, &to_local_script(params), weight_to_fee_sat(feerate_per_kw, 500),
			to_script, 0,
		)
	}

	fn build_claim_htlc_delayed_tx<S: ChannelSigner>(
		&self, _signer: &S, htlc_tx: &Transaction, params: &CommitmentTxParams,
		feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction> {
		spend_output(
			htlc_tx, &htlc_delayed_script(params), weight_to_fee_sat(feerate_per_kw, 500),
			to_script, 0,
		)
	}

	fn build_claim_remote_main_output_tx<S: ChannelSigner>(
		&self, signer: &S, commit_tx: &Transaction, _channel_version: ChannelVersion,
		_remote_per_commitment_point: &PublicKey, _remote_pubkeys: &ChannelPublicKeys,
		feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction> {
		// Our main output on their commitment pays to our payment basepoint.
		spend_output(
			commit_tx, &to_remote_script(&signer.pubkeys().payment_basepoint),
			weight_to_fee_sat(feerate_per_kw, 500), to_script, 0,
		)
	}

	fn build_claim_htlc_success_tx<S: ChannelSigner>(
		&self, _signer: &S, commit_tx: &Transaction, htlc: &HTLCOutputInCommitment,
		_preimage: &PaymentPreimage, _remote_per_commitment_point: &PublicKey,
		_remote_pubkeys: &ChannelPublicKeys, feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction> {
		spend_output(
			commit_tx, &htlc_script(htlc), weight_to_fee_sat(feerate_per_kw, 500), to_script, 0,
		)
	}

	fn build_claim_htlc_timeout_tx<S: ChannelSigner>(
		&self, _signer: &S, commit_tx: &Transaction, htlc: &HTLCOutputInCommitment,
		_remote_per_commitment_point: &PublicKey, _remote_pubkeys: &ChannelPublicKeys,
		feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction> {
		spend_output(
			commit_tx, &htlc_script(htlc), weight_to_fee_sat(feerate_per_kw, 500), to_script,
			htlc.cltv_expiry,
		)
	}

	fn build_main_penalty_tx<S: ChannelSigner>(
		&self, _signer: &S, commit_tx: &Transaction, remote_per_commitment_secret: &[u8; 32],
		_commitment_number: u64, remote_pubkeys: &ChannelPublicKeys, feerate_per_kw: u32,
		to_script: &ScriptBuf,
	) -> Option<Transaction> {
		let per_commitment_point = PublicKey::from_secret_key(
			&self.secp_ctx,
			&SecretKey::from_slice(remote_per_commitment_secret).ok()?,
		);
		let cheater_main = to_local_script_parts(
			&per_commitment_point, &remote_pubkeys.delayed_payment_basepoint,
		);
		let (vout, output) = commit_tx
			.output
			.iter()
			.enumerate()
			.find(|(_, output)| output.script_pubkey == cheater_main)?;
		let value = output.value.to_sat().saturating_sub(weight_to_fee_sat(feerate_per_kw, 500));
		if value == 0 {
			return None;
		}
		Some(Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![spend_input(commit_tx.compute_txid(), vout as u32)],
			output: vec![TxOut {
				value: Amount::from_sat(value),
				script_pubkey: to_script.clone(),
			}],
		})
	}

	fn build_htlc_penalty_txs<S: ChannelSigner>(
		&self, signer: &S, commit_tx: &Transaction, remote_per_commitment_secret: &[u8; 32],
		_commitment_number: u64, remote_pubkeys: &ChannelPublicKeys, feerate_per_kw: u32,
		to_script: &ScriptBuf,
	) -> Vec<Transaction> {
		// Everything that is neither side's main output is an HTLC output; sweep each.
		let per_commitment_point = match SecretKey::from_slice(remote_per_commitment_secret) {
			Ok(secret) => PublicKey::from_secret_key(&self.secp_ctx, &secret),
			Err(_) => return Vec::new(),
		};
		let cheater_main = to_local_script_parts(
			&per_commitment_point, &remote_pubkeys.delayed_payment_basepoint,
		);
		let our_main = to_remote_script(&signer.pubkeys().payment_basepoint);
		let commit_txid = commit_tx.compute_txid();
		let mut penalties = Vec::new();
		for (vout, output) in commit_tx.output.iter().enumerate() {
			if output.script_pubkey == our_main || output.script_pubkey == cheater_main {
				continue;
			}
			let value =
				output.value.to_sat().saturating_sub(weight_to_fee_sat(feerate_per_kw, 500));
			if value == 0 {
				continue;
			}
			penalties.push(Transaction {
				version: Version::TWO,
				lock_time: LockTime::ZERO,
				input: vec![spend_input(commit_txid, vout as u32)],
				output: vec![TxOut {
					value: Amount::from_sat(value),
					script_pubkey: to_script.clone(),
				}],
			});
		}
		penalties
	}

	fn build_claim_htlc_delayed_penalty_tx<S: ChannelSigner>(
		&self, _signer: &S, htlc_spending_tx: &Transaction,
		_remote_per_commitment_secret: &[u8; 32], _commitment_number: u64,
		_remote_pubkeys: &ChannelPublicKeys, feerate_per_kw: u32, to_script: &ScriptBuf,
	) -> Option<Transaction> {
		let output = htlc_spending_tx.output.first()?;
		let value =
			output.value.to_sat().saturating_sub(weight_to_fee_sat(feerate_per_kw, 500));
		if value == 0 {
			return None;
		}
		Some(Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![spend_input(htlc_spending_tx.compute_txid(), 0)],
			output: vec![TxOut {
				value: Amount::from_sat(value),
				script_pubkey: to_script.clone(),
			}],
		})
	}
}

fn commit_tx_feerate(_commit_tx: &CommitmentTxInfo, _params: &CommitmentTxParams) -> u32 {
	// The placeholder second-stage fees use a flat feerate; precise fee modeling belongs to
	// the production builder.
	1000
}
