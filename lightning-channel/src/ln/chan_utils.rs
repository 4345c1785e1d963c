// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various utilities shared between the channel ledger and the transaction builders: weight
//! and fee arithmetic, the types describing commitment and second-stage transactions, and the
//! compact storage of counterparty revocation secrets.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, ScriptBuf, Transaction, TxOut, Txid};

use crate::ln::PaymentHash;

/// The weight of a commitment transaction with no HTLC outputs.
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// The marginal weight of one HTLC output on a commitment transaction.
pub const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;
/// The weight of a second-stage HTLC-success transaction.
pub const HTLC_SUCCESS_TX_WEIGHT: u64 = 703;
/// The weight of a second-stage HTLC-timeout transaction.
pub const HTLC_TIMEOUT_TX_WEIGHT: u64 = 663;

/// Commitment (and revocation) numbers count down from here, keeping the on-chain obscured
/// commitment number fields small while our in-memory indexes count up from zero.
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// The fee for a commitment transaction carrying `num_htlcs` non-dust HTLCs, paid by the
/// funder.
pub fn commit_tx_fee_sat(feerate_per_kw: u32, num_htlcs: usize) -> u64 {
	(COMMITMENT_TX_BASE_WEIGHT + num_htlcs as u64 * COMMITMENT_TX_WEIGHT_PER_HTLC)
		* feerate_per_kw as u64 / 1000
}

/// The fee of a second-stage HTLC-timeout transaction.
pub fn htlc_timeout_fee_sat(feerate_per_kw: u32) -> u64 {
	HTLC_TIMEOUT_TX_WEIGHT * feerate_per_kw as u64 / 1000
}

/// The fee of a second-stage HTLC-success transaction.
pub fn htlc_success_fee_sat(feerate_per_kw: u32) -> u64 {
	HTLC_SUCCESS_TX_WEIGHT * feerate_per_kw as u64 / 1000
}

/// Converts a weight into the fee it costs at the given feerate.
pub fn weight_to_fee_sat(feerate_per_kw: u32, weight: u64) -> u64 {
	weight * feerate_per_kw as u64 / 1000
}

/// The weight of a mutual close transaction paying to the two given scripts, assuming
/// worst-case 72-byte signatures in the 2-of-2 witness.
pub fn closing_tx_weight(local_scriptpubkey: &ScriptBuf, remote_scriptpubkey: &ScriptBuf) -> u64 {
	(4 + 1 + 36 + 4 + 1 + 1 + 2 * (8 + 1) + 4
		+ local_scriptpubkey.len() as u64 + remote_scriptpubkey.len() as u64) * 4
		+ 2 + 1 + 1 + 2 * (1 + 72)
}

/// The set of public keys which identify one party in a channel, fixed at open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelPublicKeys {
	/// The public key in the 2-of-2 multisig funding output.
	pub funding_pubkey: PublicKey,
	/// The base from which revocation keys on the counterparty's commitments are derived.
	pub revocation_basepoint: PublicKey,
	/// The key (or base of the keys) this party's main outputs pay to.
	pub payment_basepoint: PublicKey,
	/// The base from which this party's delayed payment keys are derived.
	pub delayed_payment_basepoint: PublicKey,
	/// The base from which this party's HTLC keys are derived.
	pub htlc_basepoint: PublicKey,
}

/// The funding output being spent by every commitment and closing transaction of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputInfo {
	/// The funding outpoint.
	pub outpoint: OutPoint,
	/// The funding output itself.
	pub tx_out: TxOut,
	/// The 2-of-2 multisig script the funding output commits to.
	pub redeem_script: ScriptBuf,
}

/// Information about an HTLC as it appears in a commitment transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HTLCOutputInCommitment {
	/// Whether the HTLC was "offered" (ie outbound in relation to the broadcaster of the
	/// commitment transaction).
	pub offered: bool,
	/// The id its sender assigned the HTLC.
	pub htlc_id: u64,
	/// The value, in msat, of the HTLC. The value as it appears in the commitment transaction
	/// is this value, rounded down to whole satoshis.
	pub amount_msat: u64,
	/// The CLTV lock-time at which this HTLC expires.
	pub cltv_expiry: u32,
	/// The hash of the preimage which unlocks this HTLC.
	pub payment_hash: PaymentHash,
	/// The position within the commitment transactions' outputs. This may be None if the
	/// value is below the dust limit (in which case no output appears in the commitment
	/// transaction and the value is spent to additional transaction fees).
	pub transaction_output_index: Option<u32>,
}

/// An unsigned commitment transaction together with the HTLCs it commits to.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentTxInfo {
	/// The unsigned commitment transaction.
	pub tx: Transaction,
	/// Every HTLC in the commitment's spec, dust included (those have no output index).
	pub htlc_outputs: Vec<HTLCOutputInCommitment>,
}

impl CommitmentTxInfo {
	/// The txid the commitment transaction will have once signed (witness data does not
	/// affect it).
	pub fn txid(&self) -> Txid {
		self.tx.compute_txid()
	}
}

/// A second-stage HTLC transaction, spending one HTLC output of our own commitment.
#[derive(Clone, Debug, PartialEq)]
pub enum HTLCTx {
	/// Reclaims one of our offered HTLCs after its expiry.
	Timeout {
		/// The unsigned timeout transaction.
		tx: Transaction,
		/// The id of the HTLC it spends.
		htlc_id: u64,
	},
	/// Claims one of the HTLCs offered to us, once we know the preimage.
	Success {
		/// The unsigned success transaction.
		tx: Transaction,
		/// The id of the HTLC it spends.
		htlc_id: u64,
		/// The hash whose preimage must be placed in the witness.
		payment_hash: PaymentHash,
	},
}

impl HTLCTx {
	/// The underlying transaction.
	pub fn tx(&self) -> &Transaction {
		match self {
			HTLCTx::Timeout { tx, .. } => tx,
			HTLCTx::Success { tx, .. } => tx,
		}
	}

	/// The id of the HTLC this transaction resolves.
	pub fn htlc_id(&self) -> u64 {
		match self {
			HTLCTx::Timeout { htlc_id, .. } => *htlc_id,
			HTLCTx::Success { htlc_id, .. } => *htlc_id,
		}
	}
}

/// Build the commitment secret from the seed and the commitment number
pub fn build_commitment_secret(commitment_seed: &[u8; 32], idx: u64) -> [u8; 32] {
	let mut res: [u8; 32] = commitment_seed.clone();
	for i in 0..48 {
		let bitpos = 47 - i;
		if idx & (1 << bitpos) == (1 << bitpos) {
			res[bitpos / 8] ^= 1 << (bitpos & 7);
			res = Sha256::hash(&res).to_byte_array();
		}
	}
	res
}

/// Implements the per-commitment secret storage scheme from
/// [BOLT 3](https://github.com/lightning/bolts/blob/master/03-transactions.md#efficient-per-commitment-secret-storage).
///
/// Allows us to keep track of all of the revocation secrets of our counterparty in just
/// 50*32 bytes or so.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterpartyCommitmentSecrets {
	old_secrets: [([u8; 32], u64); 49],
}

impl CounterpartyCommitmentSecrets {
	/// Creates a new empty `CounterpartyCommitmentSecrets` structure.
	pub fn new() -> Self {
		Self { old_secrets: [([0; 32], 1 << 48); 49] }
	}

	#[inline]
	fn place_secret(idx: u64) -> u8 {
		for i in 0..48 {
			if idx & (1 << i) == (1 << i) {
				return i;
			}
		}
		48
	}

	/// Returns the minimum index of all stored secrets. Note that indexes start at 1 << 48
	/// and get decremented by one for each new secret.
	pub fn get_min_seen_secret(&self) -> u64 {
		let mut min = 1 << 48;
		for &(_, idx) in self.old_secrets.iter() {
			if idx < min {
				min = idx;
			}
		}
		min
	}

	#[inline]
	fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
		let mut res: [u8; 32] = secret;
		for i in 0..bits {
			let bitpos = bits - 1 - i;
			if idx & (1 << bitpos) == (1 << bitpos) {
				res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
				res = Sha256::hash(&res).to_byte_array();
			}
		}
		res
	}

	/// Inserts the `secret` at `idx`. Returns `Ok(())` if the secret
	/// was generated in accordance with BOLT 3 and is consistent
	/// with the previous secret, `Err(())` otherwise.
	pub fn provide_secret(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), ()> {
		let pos = Self::place_secret(idx);
		for i in 0..pos {
			let (old_secret, old_idx) = self.old_secrets[i as usize];
			if Self::derive_secret(secret, pos, old_idx) != old_secret {
				return Err(());
			}
		}
		if self.get_min_seen_secret() <= idx {
			return Ok(());
		}
		self.old_secrets[pos as usize] = (secret, idx);
		Ok(())
	}

	/// Returns the secret at `idx`.
	/// Returns `None` if `idx` is < [`CounterpartyCommitmentSecrets::get_min_seen_secret`],
	/// ie. we cannot derive the secret as it has not been revealed yet.
	pub fn get_secret(&self, idx: u64) -> Option<[u8; 32]> {
		for i in 0..self.old_secrets.len() {
			if (idx & (!((1 << i) - 1))) == self.old_secrets[i].1 {
				return Some(Self::derive_secret(self.old_secrets[i].0, i as u8, idx));
			}
		}
		debug_assert!(idx < self.get_min_seen_secret());
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn secrets_from_seed(seed: &[u8; 32], indexes: core::ops::Range<u64>) -> Vec<[u8; 32]> {
		indexes.map(|i| build_commitment_secret(seed, INITIAL_COMMITMENT_NUMBER - i)).collect()
	}

	#[test]
	fn counterparty_secrets_accept_a_valid_chain() {
		let seed = [42; 32];
		let mut store = CounterpartyCommitmentSecrets::new();
		for (i, secret) in secrets_from_seed(&seed, 0..50).iter().enumerate() {
			store.provide_secret(INITIAL_COMMITMENT_NUMBER - i as u64, *secret).unwrap();
		}
		// Every previously provided secret stays derivable.
		for i in 0..50u64 {
			assert_eq!(
				store.get_secret(INITIAL_COMMITMENT_NUMBER - i),
				Some(build_commitment_secret(&seed, INITIAL_COMMITMENT_NUMBER - i))
			);
		}
		// Unrevealed secrets are not.
		assert_eq!(store.get_secret(INITIAL_COMMITMENT_NUMBER - 50), None);
	}

	#[test]
	fn counterparty_secrets_reject_an_inconsistent_chain() {
		let seed = [42; 32];
		let mut store = CounterpartyCommitmentSecrets::new();
		for (i, secret) in secrets_from_seed(&seed, 0..3).iter().enumerate() {
			store.provide_secret(INITIAL_COMMITMENT_NUMBER - i as u64, *secret).unwrap();
		}
		// The next slot up must derive every stored leaf; a secret from a different seed
		// cannot.
		let bogus = build_commitment_secret(&[43; 32], INITIAL_COMMITMENT_NUMBER - 3);
		assert!(store.provide_secret(INITIAL_COMMITMENT_NUMBER - 3, bogus).is_err());
		let genuine = build_commitment_secret(&seed, INITIAL_COMMITMENT_NUMBER - 3);
		assert!(store.provide_secret(INITIAL_COMMITMENT_NUMBER - 3, genuine).is_ok());
	}

	#[test]
	fn commit_tx_fee_scales_with_htlcs() {
		assert_eq!(commit_tx_fee_sat(2500, 0), COMMITMENT_TX_BASE_WEIGHT * 2500 / 1000);
		assert_eq!(
			commit_tx_fee_sat(2500, 2),
			(COMMITMENT_TX_BASE_WEIGHT + 2 * COMMITMENT_TX_WEIGHT_PER_HTLC) * 2500 / 1000
		);
	}
}
