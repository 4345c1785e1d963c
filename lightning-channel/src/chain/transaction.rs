// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Types describing on-chain transactions.

use bitcoin::hashes::Hash;
use bitcoin::Txid;

use crate::ln::ChannelId;

/// A reference to a transaction output.
///
/// Differs from bitcoin::blockdata::transaction::OutPoint as the index is a u16 instead of
/// u32 due to LN's restrictions on index values.
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct OutPoint {
	/// The referenced transaction's txid.
	pub txid: Txid,
	/// The index of the referenced output in its transaction's vout.
	pub index: u16,
}

impl OutPoint {
	/// Convert an outpoint into the permanent channel id: the funding txid with the funding
	/// output index folded into its last two bytes.
	pub fn to_channel_id(&self) -> ChannelId {
		let mut res = self.txid.to_byte_array();
		res[30] ^= ((self.index >> 8) & 0xff) as u8;
		res[31] ^= ((self.index >> 0) & 0xff) as u8;
		res
	}

	/// Converts this outpoint into the `bitcoin` crate's.
	pub fn into_bitcoin_outpoint(self) -> bitcoin::OutPoint {
		bitcoin::OutPoint { txid: self.txid, vout: self.index as u32 }
	}
}

#[cfg(test)]
mod tests {
	use super::OutPoint;

	use bitcoin::hashes::Hash;
	use bitcoin::Txid;

	#[test]
	fn test_channel_id_calculation() {
		let txid = Txid::from_byte_array([2; 32]);
		let mut expected = [2; 32];
		assert_eq!(OutPoint { txid, index: 0 }.to_channel_id(), expected);

		expected[31] ^= 0x2a;
		assert_eq!(OutPoint { txid, index: 0x2a }.to_channel_id(), expected);

		let mut expected = [2; 32];
		expected[30] ^= 0x01;
		expected[31] ^= 0x2a;
		assert_eq!(OutPoint { txid, index: 0x012a }.to_channel_id(), expected);
	}
}
