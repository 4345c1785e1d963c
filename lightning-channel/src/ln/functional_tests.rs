// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Tests that drive two real channel values against each other, ferrying the messages one
//! side emits into the other, and assert on the states and action lists that come out.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, WPubkeyHash, Witness};

use crate::chain::{WatchEvent, WatchRequest, WatchTag};
use crate::events::{ChannelAction, ChannelCommand, ChannelEvent, InitFundee, InitFunder};
use crate::ln::channel::{
	Channel, ChannelState, FundedState, Phase, StaticParams, FUNDING_TIMEOUT_FUNDEE_BLOCKS,
};
use crate::ln::channel_version::ChannelVersion;
use crate::ln::closing::ClosingType;
use crate::ln::commitments::{LocalParams, RemoteNextCommitInfo};
use crate::ln::features::InitFeatures;
use crate::ln::msgs::{
	ChannelMessage, ClosingSigned, Init, OnionRoutingPacket, Shutdown,
};
use crate::ln::{PaymentHash, PaymentId, PaymentPreimage};
use crate::sign::{ChannelSigner, KeysInterface, TxBuilder};
use crate::util::config::NodeParams;
use crate::util::errors::ChannelError;
use crate::util::test_utils::{TestKeysInterface, TestLogger, TestTxBuilder};

use std::collections::VecDeque;

struct TestNode {
	keys: TestKeysInterface,
	tx_builder: TestTxBuilder,
	logger: TestLogger,
	node_id: PublicKey,
}

impl TestNode {
	fn new(seed: [u8; 32]) -> TestNode {
		let secp_ctx = Secp256k1::new();
		let node_key = SecretKey::from_slice(&Sha256::hash(&seed).to_byte_array()).unwrap();
		TestNode {
			keys: TestKeysInterface::new(seed),
			tx_builder: TestTxBuilder::new(),
			logger: TestLogger::new(),
			node_id: PublicKey::from_secret_key(&secp_ctx, &node_key),
		}
	}
}

fn process(
	node: &TestNode, channel: &Channel, event: ChannelEvent,
) -> (Channel, Vec<ChannelAction>) {
	channel.process(event, &node.keys, &node.tx_builder, &&node.logger)
}

fn final_script(tag: u8) -> ScriptBuf {
	ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([tag; 20]))
}

fn local_params(is_funder: bool, keys_id_tag: u8, features: InitFeatures) -> LocalParams {
	LocalParams {
		dust_limit_satoshis: 546,
		max_htlc_value_in_flight_msat: 800_000_000,
		channel_reserve_satoshis: 10_000,
		htlc_minimum_msat: 1_000,
		to_self_delay: 144,
		max_accepted_htlcs: 30,
		is_funder,
		default_final_script_pubkey: final_script(keys_id_tag),
		features,
		channel_keys_id: [keys_id_tag; 32],
	}
}

fn node_params(features: InitFeatures) -> NodeParams {
	NodeParams { features, ..NodeParams::default() }
}

fn new_channel(node: &TestNode, peer: &TestNode, features: InitFeatures) -> Channel {
	Channel::new(StaticParams {
		node_params: node_params(features),
		remote_node_id: peer.node_id,
	})
}

const TEMP_CHANNEL_ID: [u8; 32] = [42; 32];
const FUNDING_SATOSHIS: u64 = 1_000_000;
const FEERATE_PER_KW: u32 = 2500;

fn init_funder(features: InitFeatures, remote_features: InitFeatures) -> InitFunder {
	InitFunder {
		temporary_channel_id: TEMP_CHANNEL_ID,
		funding_satoshis: FUNDING_SATOSHIS,
		push_msat: 0,
		init_feerate_per_kw: FEERATE_PER_KW,
		funding_tx_feerate_per_kw: FEERATE_PER_KW,
		local_params: local_params(true, 1, features),
		channel_flags: 0,
		channel_version: ChannelVersion::STANDARD,
		remote_init: Init { features: remote_features },
	}
}

fn init_fundee(features: InitFeatures, remote_features: InitFeatures) -> InitFundee {
	InitFundee {
		temporary_channel_id: TEMP_CHANNEL_ID,
		local_params: local_params(false, 2, features),
		remote_init: Init { features: remote_features },
		current_chain_feerate_per_kw: FEERATE_PER_KW,
	}
}

fn sent_messages(actions: &[ChannelAction]) -> Vec<ChannelMessage> {
	actions
		.iter()
		.filter_map(|action| match action {
			ChannelAction::SendMessage { message } => Some(message.clone()),
			_ => None,
		})
		.collect()
}

fn funded_state(channel: &Channel) -> &FundedState {
	match &channel.state {
		ChannelState::Funded(funded) => &funded.state,
		state => panic!("not a funded channel: {:?}", state),
	}
}

fn phase(channel: &Channel) -> &Phase {
	match &channel.state {
		ChannelState::Funded(funded) => &funded.phase,
		state => panic!("not a funded channel: {:?}", state),
	}
}

fn action_index(actions: &[ChannelAction], predicate: impl Fn(&ChannelAction) -> bool) -> usize {
	actions
		.iter()
		.position(predicate)
		.unwrap_or_else(|| panic!("action not found in {:?}", actions))
}

/// Feeds every message and self-command that comes out of one side into the right recipient
/// until both sides go quiet. Returns the actions each side produced, in order.
fn pump(
	alice: &mut Channel, bob: &mut Channel, alice_node: &TestNode, bob_node: &TestNode,
	seed_actions: Vec<ChannelAction>, seed_from_alice: bool,
) -> (Vec<ChannelAction>, Vec<ChannelAction>) {
	let mut alice_log = Vec::new();
	let mut bob_log = Vec::new();
	let mut queue: VecDeque<(bool, ChannelEvent)> = VecDeque::new();
	let enqueue = |queue: &mut VecDeque<(bool, ChannelEvent)>,
	               from_alice: bool,
	               actions: &[ChannelAction]| {
		for action in actions {
			match action {
				ChannelAction::SendMessage { message } => queue
					.push_back((!from_alice, ChannelEvent::MessageReceived(message.clone()))),
				ChannelAction::SendToSelf { command } => {
					queue.push_back((from_alice, ChannelEvent::ExecuteCommand(command.clone())))
				},
				_ => {},
			}
		}
	};
	if seed_from_alice {
		alice_log.extend(seed_actions.clone());
	} else {
		bob_log.extend(seed_actions.clone());
	}
	enqueue(&mut queue, seed_from_alice, &seed_actions);
	while let Some((to_alice, event)) = queue.pop_front() {
		if to_alice {
			let (next, actions) = process(alice_node, alice, event);
			*alice = next;
			enqueue(&mut queue, true, &actions);
			alice_log.extend(actions);
		} else {
			let (next, actions) = process(bob_node, bob, event);
			*bob = next;
			enqueue(&mut queue, false, &actions);
			bob_log.extend(actions);
		}
	}
	(alice_log, bob_log)
}

struct OpenedPair {
	alice: Channel,
	bob: Channel,
	alice_node: TestNode,
	bob_node: TestNode,
	funding_tx: Transaction,
}

fn open_pair_with_features(
	alice_features: InitFeatures, bob_features: InitFeatures,
) -> OpenedPair {
	let alice_node = TestNode::new([11; 32]);
	let bob_node = TestNode::new([22; 32]);
	let mut alice = new_channel(&alice_node, &bob_node, alice_features.clone());
	let mut bob = new_channel(&bob_node, &alice_node, bob_features.clone());

	let (next, actions) = process(
		&alice_node,
		&alice,
		ChannelEvent::InitFunder(init_funder(alice_features.clone(), bob_features.clone())),
	);
	alice = next;
	let open = match &sent_messages(&actions)[..] {
		[ChannelMessage::OpenChannel(open)] => open.clone(),
		other => panic!("expected open_channel, got {:?}", other),
	};

	let (next, _) = process(
		&bob_node,
		&bob,
		ChannelEvent::InitFundee(init_fundee(bob_features, alice_features)),
	);
	bob = next;
	let (next, actions) =
		process(&bob_node, &bob, ChannelEvent::MessageReceived(ChannelMessage::OpenChannel(open)));
	bob = next;
	let accept = match &sent_messages(&actions)[..] {
		[ChannelMessage::AcceptChannel(accept)] => accept.clone(),
		other => panic!("expected accept_channel, got {:?}", other),
	};

	let (next, actions) = process(
		&alice_node,
		&alice,
		ChannelEvent::MessageReceived(ChannelMessage::AcceptChannel(accept)),
	);
	alice = next;
	let funding_script = match &actions[..] {
		[ChannelAction::MakeFundingTx { script_pubkey, amount_satoshis, .. }] => {
			assert_eq!(*amount_satoshis, FUNDING_SATOSHIS);
			script_pubkey.clone()
		},
		other => panic!("expected MakeFundingTx, got {:?}", other),
	};

	let funding_tx = Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: bitcoin::OutPoint { txid: Txid::from_byte_array([9; 32]), vout: 0 },
			script_sig: ScriptBuf::new(),
			sequence: Sequence(0xffffffff),
			witness: Witness::new(),
		}],
		output: vec![TxOut {
			value: Amount::from_sat(FUNDING_SATOSHIS),
			script_pubkey: funding_script,
		}],
	};
	let (next, actions) = process(
		&alice_node,
		&alice,
		ChannelEvent::MakeFundingTxResponse {
			funding_tx: funding_tx.clone(),
			funding_tx_output_index: 0,
			fee_satoshis: 150,
		},
	);
	alice = next;
	let funding_created = match &sent_messages(&actions)[..] {
		[ChannelMessage::FundingCreated(msg)] => msg.clone(),
		other => panic!("expected funding_created, got {:?}", other),
	};
	assert!(actions
		.iter()
		.any(|action| matches!(action, ChannelAction::ChannelIdAssigned { .. })));

	let (next, actions) = process(
		&bob_node,
		&bob,
		ChannelEvent::MessageReceived(ChannelMessage::FundingCreated(funding_created)),
	);
	bob = next;
	// The id switch must precede anything using the new id, and the state must be on disk
	// before our signature leaves the process.
	let switch_index =
		action_index(&actions, |action| matches!(action, ChannelAction::ChannelIdSwitch { .. }));
	let store_index =
		action_index(&actions, |action| matches!(action, ChannelAction::StoreState { .. }));
	let send_index =
		action_index(&actions, |action| matches!(action, ChannelAction::SendMessage { .. }));
	assert!(switch_index < send_index);
	assert!(store_index < send_index);
	let funding_signed = match &sent_messages(&actions)[..] {
		[ChannelMessage::FundingSigned(msg)] => msg.clone(),
		other => panic!("expected funding_signed, got {:?}", other),
	};

	let (next, actions) = process(
		&alice_node,
		&alice,
		ChannelEvent::MessageReceived(ChannelMessage::FundingSigned(funding_signed)),
	);
	alice = next;
	// StoreState must precede the funding broadcast.
	let store_index =
		action_index(&actions, |action| matches!(action, ChannelAction::StoreState { .. }));
	let publish_index =
		action_index(&actions, |action| matches!(action, ChannelAction::PublishTx { .. }));
	assert!(store_index < publish_index);
	assert!(matches!(funded_state(&alice), FundedState::WaitForFundingConfirmed(_)));
	assert!(matches!(funded_state(&bob), FundedState::WaitForFundingConfirmed(_)));

	// The funding transaction confirms for both sides.
	let confirm = ChannelEvent::WatchReceived(WatchEvent::Confirmed {
		tx: funding_tx.clone(),
		block_height: 100,
		tx_index: 1,
		tag: WatchTag::FundingDepthOk,
	});
	let (next, actions) = process(&alice_node, &alice, confirm.clone());
	alice = next;
	let alice_locked = match &sent_messages(&actions)[..] {
		[ChannelMessage::FundingLocked(msg)] => msg.clone(),
		other => panic!("expected funding_locked, got {:?}", other),
	};
	let (next, actions) = process(&bob_node, &bob, confirm);
	bob = next;
	let bob_locked = match &sent_messages(&actions)[..] {
		[ChannelMessage::FundingLocked(msg)] => msg.clone(),
		other => panic!("expected funding_locked, got {:?}", other),
	};

	let (next, _) = process(
		&alice_node,
		&alice,
		ChannelEvent::MessageReceived(ChannelMessage::FundingLocked(bob_locked)),
	);
	alice = next;
	let (next, _) = process(
		&bob_node,
		&bob,
		ChannelEvent::MessageReceived(ChannelMessage::FundingLocked(alice_locked)),
	);
	bob = next;
	assert!(matches!(funded_state(&alice), FundedState::Normal(_)));
	assert!(matches!(funded_state(&bob), FundedState::Normal(_)));

	OpenedPair { alice, bob, alice_node, bob_node, funding_tx }
}

fn open_pair() -> OpenedPair {
	open_pair_with_features(InitFeatures::empty(), InitFeatures::empty())
}

fn payment(tag: u8) -> (PaymentPreimage, PaymentHash) {
	let preimage = PaymentPreimage([tag; 32]);
	(preimage, PaymentHash(Sha256::hash(&preimage.0).to_byte_array()))
}

fn add_htlc_command(amount_msat: u64, payment_hash: PaymentHash, tag: u8) -> ChannelCommand {
	ChannelCommand::AddHtlc {
		amount_msat,
		payment_hash,
		cltv_expiry: 40,
		onion_routing_packet: OnionRoutingPacket { data: vec![tag] },
		payment_id: PaymentId([tag; 32]),
		commit: true,
	}
}

/// Adds an HTLC from alice to bob and settles the full sign/revoke dance in both
/// directions.
fn add_and_lock_in_htlc(pair: &mut OpenedPair, amount_msat: u64, tag: u8) -> PaymentPreimage {
	let (preimage, payment_hash) = payment(tag);
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(add_htlc_command(amount_msat, payment_hash, tag)),
	);
	pair.alice = next;
	assert!(matches!(&actions[..], [
		ChannelAction::SendMessage { message: ChannelMessage::UpdateAddHTLC(_) },
		ChannelAction::SendToSelf { command: ChannelCommand::Sign },
	]));
	let (_, bob_actions) = pump(
		&mut pair.alice, &mut pair.bob, &pair.alice_node, &pair.bob_node, actions, true,
	);
	// Once the peer's revocation of the old commitment lands, the HTLC is safe to process.
	assert!(bob_actions
		.iter()
		.any(|action| matches!(action, ChannelAction::ProcessAdd { .. })));
	preimage
}

#[test]
fn funder_open_happy_path_sends_open_channel() {
	let alice_node = TestNode::new([11; 32]);
	let bob_node = TestNode::new([22; 32]);
	let alice = new_channel(&alice_node, &bob_node, InitFeatures::empty());

	let (alice, actions) = process(
		&alice_node,
		&alice,
		ChannelEvent::InitFunder(init_funder(InitFeatures::empty(), InitFeatures::empty())),
	);
	assert!(matches!(alice.state, ChannelState::WaitForAcceptChannel(_)));
	match &actions[..] {
		[ChannelAction::SendMessage { message: ChannelMessage::OpenChannel(open) }] => {
			assert_eq!(open.chain_hash, NodeParams::default().chain_hash);
			assert_eq!(open.temporary_channel_id, TEMP_CHANNEL_ID);
			assert_eq!(open.funding_satoshis, FUNDING_SATOSHIS);
			assert_eq!(open.push_msat, 0);
			assert_eq!(open.feerate_per_kw, FEERATE_PER_KW);
			assert_eq!(open.shutdown_scriptpubkey, None);
			assert_eq!(open.channel_version, Some(ChannelVersion::STANDARD));
		},
		other => panic!("expected open_channel, got {:?}", other),
	}
}

#[test]
fn validation_rejects_excessive_max_accepted_htlcs() {
	let alice_node = TestNode::new([11; 32]);
	let bob_node = TestNode::new([22; 32]);
	let alice = new_channel(&alice_node, &bob_node, InitFeatures::empty());
	let (alice, _) = process(
		&alice_node,
		&alice,
		ChannelEvent::InitFunder(init_funder(InitFeatures::empty(), InitFeatures::empty())),
	);

	// A plausible accept_channel, except for the HTLC cap.
	let bob_signer = bob_node.keys.derive_channel_signer([2; 32]);
	let pubkeys = bob_signer.pubkeys().clone();
	let accept = crate::ln::msgs::AcceptChannel {
		temporary_channel_id: TEMP_CHANNEL_ID,
		dust_limit_satoshis: 546,
		max_htlc_value_in_flight_msat: 800_000_000,
		channel_reserve_satoshis: 10_000,
		htlc_minimum_msat: 1_000,
		minimum_depth: 3,
		to_self_delay: 144,
		max_accepted_htlcs: 500,
		funding_pubkey: pubkeys.funding_pubkey,
		revocation_basepoint: pubkeys.revocation_basepoint,
		payment_basepoint: pubkeys.payment_basepoint,
		delayed_payment_basepoint: pubkeys.delayed_payment_basepoint,
		htlc_basepoint: pubkeys.htlc_basepoint,
		first_per_commitment_point: bob_signer.get_per_commitment_point(0),
		shutdown_scriptpubkey: None,
	};
	let (alice, actions) = process(
		&alice_node,
		&alice,
		ChannelEvent::MessageReceived(ChannelMessage::AcceptChannel(accept)),
	);
	assert!(matches!(alice.state, ChannelState::Aborted));
	match &sent_messages(&actions)[..] {
		[ChannelMessage::Error(error)] => {
			assert_eq!(error.channel_id, TEMP_CHANNEL_ID);
			assert_eq!(error.data, "InvalidMaxAcceptedHtlcs: 500 > 483");
		},
		other => panic!("expected error message, got {:?}", other),
	}
}

#[test]
fn commit_revoke_round_trip() {
	let mut pair = open_pair();
	let (_, payment_hash) = payment(7);

	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(add_htlc_command(10_000_000, payment_hash, 7)),
	);
	pair.alice = next;
	let add = match &actions[..] {
		[ChannelAction::SendMessage { message: ChannelMessage::UpdateAddHTLC(add) }, ChannelAction::SendToSelf { command: ChannelCommand::Sign }] => {
			add.clone()
		},
		other => panic!("expected add + self-sign, got {:?}", other),
	};
	assert_eq!(add.htlc_id, 0);

	// CMD_SIGN: the HTLC records hit storage before the signature leaves, and the state
	// before the message.
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(ChannelCommand::Sign),
	);
	pair.alice = next;
	match &actions[..] {
		[ChannelAction::StoreHtlcInfos { htlc_infos }, ChannelAction::StoreState { .. }, ChannelAction::SendMessage { message: ChannelMessage::CommitmentSigned(commit_sig) }] =>
		{
			assert_eq!(htlc_infos.len(), 1);
			assert_eq!(htlc_infos[0].commitment_number, 1);
			assert_eq!(htlc_infos[0].payment_hash, payment_hash);
			assert_eq!(htlc_infos[0].cltv_expiry, 40);
			assert_eq!(commit_sig.htlc_signatures.len(), 1);
		},
		other => panic!("expected StoreHtlcInfos/StoreState/commit_sig, got {:?}", other),
	}

	// Deliver the add and the signature; bob responds with a revocation (and will sign
	// back on his own).
	let (next, _) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::MessageReceived(ChannelMessage::UpdateAddHTLC(add)),
	);
	pair.bob = next;
	let commit_sig = match &sent_messages(&actions)[..] {
		[ChannelMessage::CommitmentSigned(msg)] => msg.clone(),
		other => panic!("expected commit_sig, got {:?}", other),
	};
	let (next, bob_actions) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::MessageReceived(ChannelMessage::CommitmentSigned(commit_sig)),
	);
	pair.bob = next;
	let revocation = match &bob_actions[..] {
		[ChannelAction::StoreState { .. }, ChannelAction::SendMessage { message: ChannelMessage::RevokeAndACK(msg) }, ChannelAction::SendToSelf { command: ChannelCommand::Sign }] => {
			msg.clone()
		},
		other => panic!("expected store/revoke/self-sign, got {:?}", other),
	};

	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::RevokeAndACK(revocation)),
	);
	pair.alice = next;
	assert!(matches!(&actions[..], [ChannelAction::StoreState { .. }]));
	assert_eq!(funded_state(&pair.alice).commitments().remote_commit.index, 1);

	// Let bob's answering signature run to quiescence: the HTLC locks in on both sides.
	let (next, bob_actions) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::ExecuteCommand(ChannelCommand::Sign),
	);
	pair.bob = next;
	let (_, bob_log) = pump(
		&mut pair.alice, &mut pair.bob, &pair.alice_node, &pair.bob_node, bob_actions, false,
	);
	assert!(bob_log.iter().any(|action| matches!(action, ChannelAction::ProcessAdd { .. })));
	let alice_commitments = funded_state(&pair.alice).commitments();
	let bob_commitments = funded_state(&pair.bob).commitments();
	assert_eq!(alice_commitments.local_commit.index, 1);
	assert_eq!(alice_commitments.local_commit.spec.htlcs.len(), 1);
	assert_eq!(bob_commitments.local_commit.index, 1);
	assert_eq!(bob_commitments.local_commit.spec.htlcs.len(), 1);
}

#[test]
fn fulfill_settles_upstream_after_revocation() {
	let mut pair = open_pair();
	let preimage = add_and_lock_in_htlc(&mut pair, 10_000_000, 7);

	let (next, actions) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::ExecuteCommand(ChannelCommand::FulfillHtlc {
			htlc_id: 0,
			payment_preimage: preimage,
			commit: true,
		}),
	);
	pair.bob = next;
	let (alice_log, _) = pump(
		&mut pair.alice, &mut pair.bob, &pair.alice_node, &pair.bob_node, actions, false,
	);
	let fulfilled = alice_log.iter().find_map(|action| match action {
		ChannelAction::ProcessFulfill { fulfill, payment_id } => {
			Some((fulfill.clone(), *payment_id))
		},
		_ => None,
	});
	let (fulfill, payment_id) = fulfilled.expect("fulfill must be reported upstream");
	assert_eq!(fulfill.htlc_id, 0);
	assert_eq!(fulfill.payment_preimage, preimage);
	assert_eq!(payment_id, PaymentId([7; 32]));
	// Both ledgers are empty again.
	assert!(funded_state(&pair.alice).commitments().local_commit.spec.htlcs.is_empty());
	assert!(funded_state(&pair.bob).commitments().local_commit.spec.htlcs.is_empty());
	// And the settled payment is no longer attributed.
	assert!(funded_state(&pair.alice).commitments().payments.is_empty());
}

#[test]
fn flow_control_rejections_fail_the_command() {
	let mut pair = open_pair();
	let (_, payment_hash) = payment(3);

	let cases: Vec<(ChannelCommand, ChannelError)> = vec![
		(
			ChannelCommand::AddHtlc {
				amount_msat: 10_000_000,
				payment_hash,
				cltv_expiry: 5,
				onion_routing_packet: OnionRoutingPacket { data: Vec::new() },
				payment_id: PaymentId([3; 32]),
				commit: false,
			},
			ChannelError::ExpiryTooSmall { expiry: 5, minimum: 18 },
		),
		(
			ChannelCommand::AddHtlc {
				amount_msat: 500,
				payment_hash,
				cltv_expiry: 40,
				onion_routing_packet: OnionRoutingPacket { data: Vec::new() },
				payment_id: PaymentId([3; 32]),
				commit: false,
			},
			ChannelError::HtlcValueTooSmall { amount_msat: 500, minimum_msat: 1_000 },
		),
		(
			ChannelCommand::FulfillHtlc {
				htlc_id: 99,
				payment_preimage: PaymentPreimage([0; 32]),
				commit: false,
			},
			ChannelError::UnknownHtlcId { id: 99 },
		),
	];
	for (command, expected) in cases {
		let (next, actions) =
			process(&pair.alice_node, &pair.alice, ChannelEvent::ExecuteCommand(command.clone()));
		pair.alice = next;
		match &actions[..] {
			[ChannelAction::HandleCommandFailed { command: failed, error }] => {
				assert_eq!(*failed, command);
				assert_eq!(*error, expected);
			},
			other => panic!("expected HandleCommandFailed, got {:?}", other),
		}
	}

	// An HTLC bigger than the whole balance is a funds problem.
	let (_, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(add_htlc_command(2_000_000_000, payment_hash, 3)),
	);
	match &actions[..] {
		[ChannelAction::HandleCommandFailed { error: ChannelError::InsufficientFunds { .. }, .. }] => {},
		other => panic!("expected InsufficientFunds, got {:?}", other),
	}
}

#[test]
fn invalid_commitment_signature_force_closes() {
	let mut pair = open_pair();
	let preimage = add_and_lock_in_htlc(&mut pair, 10_000_000, 5);

	// Bob settles without signing, so alice has pending remote changes; then a commit_sig
	// arrives whose signature was made by the wrong key.
	let (next, actions) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::ExecuteCommand(ChannelCommand::FulfillHtlc {
			htlc_id: 0,
			payment_preimage: preimage,
			commit: false,
		}),
	);
	pair.bob = next;
	let fulfill = match &sent_messages(&actions)[..] {
		[ChannelMessage::UpdateFulfillHTLC(msg)] => msg.clone(),
		other => panic!("expected fulfill, got {:?}", other),
	};
	let (next, _) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::UpdateFulfillHTLC(fulfill)),
	);
	pair.alice = next;

	let rogue = pair.bob_node.keys.derive_channel_signer([9; 32]);
	let commitments = funded_state(&pair.alice).commitments();
	let garbage_sig = rogue.sign_closing_transaction(
		&commitments.local_commit.publishable_txs.commit_tx, &commitments.commit_input,
	);
	let commit_sig = crate::ln::msgs::CommitmentSigned {
		channel_id: commitments.channel_id,
		signature: garbage_sig,
		htlc_signatures: Vec::new(),
		channel_data: None,
	};
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::CommitmentSigned(commit_sig)),
	);
	pair.alice = next;

	assert!(matches!(funded_state(&pair.alice), FundedState::Closing(_)));
	assert!(sent_messages(&actions)
		.iter()
		.any(|message| matches!(message, ChannelMessage::Error(_))));
	assert!(actions
		.iter()
		.any(|action| matches!(action, ChannelAction::ProcessLocalFailure { .. })));
	// The protective close persists before it publishes.
	let store_index =
		action_index(&actions, |action| matches!(action, ChannelAction::StoreState { .. }));
	let publish_index =
		action_index(&actions, |action| matches!(action, ChannelAction::PublishTx { .. }));
	assert!(store_index < publish_index);
}

#[test]
fn force_close_publishes_local_commit_and_claims() {
	let mut pair = open_pair();
	add_and_lock_in_htlc(&mut pair, 10_000_000, 7);

	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(ChannelCommand::ForceClose),
	);
	pair.alice = next;
	let closing = match funded_state(&pair.alice) {
		FundedState::Closing(closing) => closing.clone(),
		state => panic!("expected Closing, got {:?}", state),
	};
	let lcp = closing.local_commit_published.expect("local commit published");
	assert_eq!(lcp.htlc_timeout_txs.len(), 1);
	// We do not know the preimage, so no success path.
	assert!(lcp.htlc_success_txs.is_empty());
	assert!(lcp.claim_main_delayed_output_tx.is_some());

	let store_index =
		action_index(&actions, |action| matches!(action, ChannelAction::StoreState { .. }));
	let publish_index =
		action_index(&actions, |action| matches!(action, ChannelAction::PublishTx { .. }));
	assert!(store_index < publish_index);
	assert!(sent_messages(&actions)
		.iter()
		.any(|message| matches!(message, ChannelMessage::Error(_))));
	// The commit, the delayed-main claim and the timeout claim all get broadcast.
	let published: Vec<_> = actions
		.iter()
		.filter(|action| matches!(action, ChannelAction::PublishTx { .. }))
		.collect();
	assert!(published.len() >= 3);
}

#[test]
fn remote_close_claims_our_outputs() {
	let mut pair = open_pair();
	add_and_lock_in_htlc(&mut pair, 10_000_000, 7);

	// Bob force-closes: alice sees his commitment spend the funding output.
	let bob_commit =
		funded_state(&pair.bob).commitments().local_commit.publishable_txs.commit_tx.clone();
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::WatchReceived(WatchEvent::Spent {
			tx: bob_commit.clone(),
			tag: WatchTag::FundingSpent,
		}),
	);
	pair.alice = next;
	let closing = match funded_state(&pair.alice) {
		FundedState::Closing(closing) => closing.clone(),
		state => panic!("expected Closing, got {:?}", state),
	};
	let rcp = closing.current_remote_commit_published.expect("remote commit published");
	assert_eq!(rcp.commit_tx.compute_txid(), bob_commit.compute_txid());
	// Our main output and our offered HTLC (timeout path) are claimable.
	assert!(rcp.claim_main_output_tx.is_some());
	assert_eq!(rcp.claim_htlc_timeout_txs.len(), 1);
	let store_index =
		action_index(&actions, |action| matches!(action, ChannelAction::StoreState { .. }));
	let publish_index =
		action_index(&actions, |action| matches!(action, ChannelAction::PublishTx { .. }));
	assert!(store_index < publish_index);
}

#[test]
fn revoked_commit_is_fully_penalized() {
	let mut pair = open_pair();
	add_and_lock_in_htlc(&mut pair, 10_000_000, 7);

	// Bob's commitment #1 carries the HTLC. Settle it, which makes #1 revoked.
	let revoked_commit =
		funded_state(&pair.bob).commitments().local_commit.publishable_txs.commit_tx.clone();
	let preimage = {
		let (preimage, _) = payment(7);
		preimage
	};
	let (next, actions) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::ExecuteCommand(ChannelCommand::FulfillHtlc {
			htlc_id: 0,
			payment_preimage: preimage,
			commit: true,
		}),
	);
	pair.bob = next;
	pump(&mut pair.alice, &mut pair.bob, &pair.alice_node, &pair.bob_node, actions, false);
	assert!(funded_state(&pair.alice).commitments().remote_commit.index >= 2);

	// Bob cheats with the revoked commitment.
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::WatchReceived(WatchEvent::Spent {
			tx: revoked_commit.clone(),
			tag: WatchTag::FundingSpent,
		}),
	);
	pair.alice = next;
	let closing = match funded_state(&pair.alice) {
		FundedState::Closing(closing) => closing.clone(),
		state => panic!("expected Closing, got {:?}", state),
	};
	assert_eq!(closing.revoked_commit_published.len(), 1);
	let rvk = &closing.revoked_commit_published[0];

	// Every output of the revoked commitment is spent by the claim/penalty set.
	let mut spent = std::collections::HashSet::new();
	for tx in rvk
		.claim_main_output_tx
		.iter()
		.chain(rvk.main_penalty_tx.iter())
		.chain(rvk.htlc_penalty_txs.iter())
	{
		for input in tx.input.iter() {
			assert_eq!(input.previous_output.txid, revoked_commit.compute_txid());
			spent.insert(input.previous_output.vout);
		}
	}
	assert_eq!(spent.len(), revoked_commit.output.len());

	// Penalties get broadcast and the revoked outputs watched for the cheater's spends.
	assert!(actions
		.iter()
		.any(|action| matches!(action, ChannelAction::PublishTx { .. })));
	assert!(actions.iter().any(|action| matches!(
		action,
		ChannelAction::SendWatch { watch: WatchRequest::Spent { tag: WatchTag::OutputSpent, .. } }
	)));
}

#[test]
fn mutual_close_converges_and_confirms() {
	let mut pair = open_pair();

	// Alice knows bob's close script upfront, so CMD_CLOSE can open negotiation at once.
	let bob_script = local_params(false, 2, InitFeatures::empty()).default_final_script_pubkey;
	match &mut pair.alice.state {
		ChannelState::Funded(funded) => match &mut funded.state {
			FundedState::Normal(normal) => {
				normal.commitments.remote_params.shutdown_scriptpubkey = Some(bob_script);
			},
			_ => unreachable!(),
		},
		_ => unreachable!(),
	}

	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(ChannelCommand::Close { script_pubkey: None }),
	);
	pair.alice = next;
	match &actions[..] {
		[ChannelAction::StoreState { state }, ChannelAction::SendMessage { message: ChannelMessage::Shutdown(_) }, ChannelAction::SendMessage { message: ChannelMessage::ClosingSigned(_) }] =>
		{
			assert!(matches!(**state, FundedState::Negotiating(_)));
		},
		other => panic!("expected store/shutdown/closing_signed, got {:?}", other),
	}

	// Let both sides run the negotiation to the end.
	let (alice_log, bob_log) = pump(
		&mut pair.alice, &mut pair.bob, &pair.alice_node, &pair.bob_node, actions, true,
	);
	let closing = match funded_state(&pair.alice) {
		FundedState::Closing(closing) => closing.clone(),
		state => panic!("expected Closing, got {:?}", state),
	};
	assert_eq!(closing.mutual_close_published.len(), 1);
	assert!(matches!(funded_state(&pair.bob), FundedState::Closing(_)));
	assert!(alice_log.iter().any(|action| matches!(action, ChannelAction::PublishTx { .. })));
	assert!(bob_log.iter().any(|action| matches!(action, ChannelAction::PublishTx { .. })));

	// Deep confirmation of the closing transaction finishes the channel.
	let close_tx = closing.mutual_close_published[0].clone();
	assert_eq!(closing.is_closed(Some(&close_tx)), Some(ClosingType::MutualClose));
	let (next, _) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::WatchReceived(WatchEvent::Confirmed {
			tx: close_tx.clone(),
			block_height: 200,
			tx_index: 1,
			tag: WatchTag::TxConfirmed(close_tx.compute_txid()),
		}),
	);
	pair.alice = next;
	assert!(matches!(funded_state(&pair.alice), FundedState::Closed(_)));
}

#[test]
fn mutual_close_fee_negotiation_averages() {
	let mut pair = open_pair();
	let bob_script = local_params(false, 2, InitFeatures::empty()).default_final_script_pubkey;
	let alice_script = local_params(true, 1, InitFeatures::empty()).default_final_script_pubkey;
	match &mut pair.alice.state {
		ChannelState::Funded(funded) => match &mut funded.state {
			FundedState::Normal(normal) => {
				normal.commitments.remote_params.shutdown_scriptpubkey =
					Some(bob_script.clone());
			},
			_ => unreachable!(),
		},
		_ => unreachable!(),
	}
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(ChannelCommand::Close { script_pubkey: None }),
	);
	pair.alice = next;
	let fee_0 = match &sent_messages(&actions)[..] {
		[ChannelMessage::Shutdown(_), ChannelMessage::ClosingSigned(closing_signed)] => {
			closing_signed.fee_satoshis
		},
		other => panic!("expected shutdown + closing_signed, got {:?}", other),
	};

	// Bob (played by hand) wants a much higher fee.
	let commitments = funded_state(&pair.alice).commitments().clone();
	let bob_signer = pair.bob_node.keys.derive_channel_signer([2; 32]);
	let bob_closing_signed = |fee_satoshis: u64| -> ClosingSigned {
		let tx = pair.bob_node.tx_builder.build_closing_tx(
			&commitments.commit_input, &alice_script, &bob_script, true, 546, fee_satoshis,
			&commitments.local_commit.spec,
		);
		ClosingSigned {
			channel_id: commitments.channel_id,
			fee_satoshis,
			signature: bob_signer.sign_closing_transaction(&tx, &commitments.commit_input),
			channel_data: None,
		}
	};
	let fee_1 = fee_0 + 1000;
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::ClosingSigned(bob_closing_signed(fee_1))),
	);
	pair.alice = next;
	let fee_2 = match &sent_messages(&actions)[..] {
		[ChannelMessage::ClosingSigned(closing_signed)] => closing_signed.fee_satoshis,
		other => panic!("expected counter-proposal, got {:?}", other),
	};
	assert_eq!(fee_2, ((fee_0 + fee_1) / 4) * 2);
	assert!(matches!(funded_state(&pair.alice), FundedState::Negotiating(_)));

	// Bob accepts our counter-proposal: we publish at that fee.
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::ClosingSigned(bob_closing_signed(fee_2))),
	);
	pair.alice = next;
	assert!(matches!(funded_state(&pair.alice), FundedState::Closing(_)));
	let store_index =
		action_index(&actions, |action| matches!(action, ChannelAction::StoreState { .. }));
	let publish_index =
		action_index(&actions, |action| matches!(action, ChannelAction::PublishTx { .. }));
	assert!(store_index < publish_index);
	assert!(actions.iter().any(|action| matches!(
		action,
		ChannelAction::SendWatch { watch: WatchRequest::Confirmed { .. } }
	)));
}

#[test]
fn shutdown_with_pending_htlcs_settles_then_negotiates() {
	let mut pair = open_pair();
	let preimage = add_and_lock_in_htlc(&mut pair, 10_000_000, 7);

	// Bob initiates the close while the HTLC is still pending.
	let bob_shutdown = Shutdown {
		channel_id: funded_state(&pair.bob).commitments().channel_id,
		scriptpubkey: local_params(false, 2, InitFeatures::empty()).default_final_script_pubkey,
	};
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::Shutdown(bob_shutdown.clone())),
	);
	pair.alice = next;
	assert!(matches!(funded_state(&pair.alice), FundedState::ShuttingDown(_)));
	assert!(sent_messages(&actions)
		.iter()
		.any(|message| matches!(message, ChannelMessage::Shutdown(_))));
	// Mirror on bob's side so both agree they are shutting down.
	let alice_shutdown = match sent_messages(&actions).into_iter().next() {
		Some(ChannelMessage::Shutdown(shutdown)) => shutdown,
		other => panic!("expected shutdown, got {:?}", other),
	};
	let (next, _) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::ExecuteCommand(ChannelCommand::Close { script_pubkey: None }),
	);
	pair.bob = next;
	let (next, _) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::MessageReceived(ChannelMessage::Shutdown(alice_shutdown)),
	);
	pair.bob = next;

	// No new HTLCs are accepted during shutdown.
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(add_htlc_command(1_000_000, payment(9).1, 9)),
	);
	pair.alice = next;
	match &actions[..] {
		[ChannelAction::HandleCommandFailed { error, .. }] => {
			assert_eq!(*error, ChannelError::NoMoreHtlcsClosingInProgress);
		},
		other => panic!("expected failed add, got {:?}", other),
	}

	// Settling the last HTLC rolls both sides into negotiation.
	let (next, actions) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::ExecuteCommand(ChannelCommand::FulfillHtlc {
			htlc_id: 0,
			payment_preimage: preimage,
			commit: true,
		}),
	);
	pair.bob = next;
	pump(&mut pair.alice, &mut pair.bob, &pair.alice_node, &pair.bob_node, actions, false);
	assert!(matches!(
		funded_state(&pair.alice),
		FundedState::Closing(_) | FundedState::Negotiating(_)
	));
	assert!(matches!(
		funded_state(&pair.bob),
		FundedState::Closing(_) | FundedState::Negotiating(_)
	));
}

#[test]
fn reconnect_retransmits_lost_revocation_and_commit_sig() {
	let mut pair = open_pair();
	add_and_lock_in_htlc(&mut pair, 10_000_000, 7);

	// Alice offers a second HTLC and signs; bob processes the signature, but his
	// revocation and his answering signature are lost in transit.
	let (_, payment_hash) = payment(8);
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(add_htlc_command(20_000_000, payment_hash, 8)),
	);
	pair.alice = next;
	let add = match &sent_messages(&actions)[..] {
		[ChannelMessage::UpdateAddHTLC(add)] => add.clone(),
		other => panic!("expected add, got {:?}", other),
	};
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(ChannelCommand::Sign),
	);
	pair.alice = next;
	let commit_sig = match &sent_messages(&actions)[..] {
		[ChannelMessage::CommitmentSigned(msg)] => msg.clone(),
		other => panic!("expected commit_sig, got {:?}", other),
	};
	let (next, _) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::MessageReceived(ChannelMessage::UpdateAddHTLC(add)),
	);
	pair.bob = next;
	let (next, _lost_revocation) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::MessageReceived(ChannelMessage::CommitmentSigned(commit_sig)),
	);
	pair.bob = next;
	// Execute bob's self-sign so his commit_sig is also pending-lost.
	let (next, _lost_commit_sig) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::ExecuteCommand(ChannelCommand::Sign),
	);
	pair.bob = next;

	// Transport drops and comes back.
	let empty_init = Init { features: InitFeatures::empty() };
	for (node, channel) in
		[(&pair.alice_node, &mut pair.alice), (&pair.bob_node, &mut pair.bob)]
	{
		let (next, _) = process(node, channel, ChannelEvent::Disconnected);
		*channel = next;
		assert!(matches!(phase(channel), Phase::Offline));
		let (next, _) = process(
			node,
			channel,
			ChannelEvent::Connected {
				local_init: empty_init.clone(),
				remote_init: empty_init.clone(),
			},
		);
		*channel = next;
		assert!(matches!(phase(channel), Phase::Syncing { .. }));
	}
	let alice_reestablish = crate::ln::msgs::ChannelReestablish {
		channel_id: funded_state(&pair.alice).commitments().channel_id,
		next_local_commitment_number: funded_state(&pair.alice).commitments().local_commit.index
			+ 1,
		next_remote_revocation_number: funded_state(&pair.alice).commitments().remote_commit.index,
		your_last_per_commitment_secret: [0; 32],
		my_current_per_commitment_point: pair
			.alice_node
			.keys
			.derive_channel_signer([1; 32])
			.get_per_commitment_point(funded_state(&pair.alice).commitments().local_commit.index),
		channel_data: None,
	};

	// Bob sees that alice's revocation expectations are one behind his commitment and that
	// his commit_sig never arrived: he must retransmit both, revocation first.
	let (next, actions) = process(
		&pair.bob_node,
		&pair.bob,
		ChannelEvent::MessageReceived(ChannelMessage::ChannelReestablish(alice_reestablish)),
	);
	pair.bob = next;
	let messages = sent_messages(&actions);
	let revocation_index = messages
		.iter()
		.position(|message| matches!(message, ChannelMessage::RevokeAndACK(_)))
		.expect("revocation retransmitted");
	let commit_index = messages
		.iter()
		.position(|message| matches!(message, ChannelMessage::CommitmentSigned(_)))
		.expect("commit_sig retransmitted");
	assert!(revocation_index < commit_index);
	assert!(matches!(phase(&pair.bob), Phase::Online));

	// Deliver bob's catch-up to alice and let everything settle: the channel ends in sync.
	let (next, _) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::ChannelReestablish(
			make_reestablish_for(&pair.bob, &pair.bob_node),
		)),
	);
	pair.alice = next;
	pump(&mut pair.alice, &mut pair.bob, &pair.alice_node, &pair.bob_node, actions, false);
	let alice_commitments = funded_state(&pair.alice).commitments();
	let bob_commitments = funded_state(&pair.bob).commitments();
	assert_eq!(alice_commitments.local_commit.index, bob_commitments.remote_commit.index);
	assert_eq!(bob_commitments.local_commit.index, alice_commitments.remote_commit.index);
	assert!(matches!(
		alice_commitments.remote_next_commit_info,
		RemoteNextCommitInfo::Revoked(_)
	));
}

fn make_reestablish_for(channel: &Channel, node: &TestNode) -> crate::ln::msgs::ChannelReestablish {
	let commitments = funded_state(channel).commitments();
	let signer = node.keys.derive_channel_signer(commitments.local_params.channel_keys_id);
	let your_last_per_commitment_secret = if commitments.remote_commit.index == 0 {
		[0u8; 32]
	} else {
		commitments
			.remote_per_commitment_secrets
			.get_secret(
				crate::ln::chan_utils::INITIAL_COMMITMENT_NUMBER
					- (commitments.remote_commit.index - 1),
			)
			.unwrap_or([0u8; 32])
	};
	crate::ln::msgs::ChannelReestablish {
		channel_id: commitments.channel_id,
		next_local_commitment_number: commitments.local_commit.index + 1,
		next_remote_revocation_number: commitments.remote_commit.index,
		your_last_per_commitment_secret,
		my_current_per_commitment_point: signer
			.get_per_commitment_point(commitments.local_commit.index),
		channel_data: commitments.remote_channel_data.clone(),
	}
}

#[test]
fn peer_backup_restores_a_stale_node() {
	let backup_features = InitFeatures::empty().set_channel_backup_client();
	let mut pair =
		open_pair_with_features(backup_features.clone(), InitFeatures::empty());

	// Alice's signed messages carry her encrypted state; bob holds the latest blob.
	let (_, payment_hash) = payment(7);
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(add_htlc_command(10_000_000, payment_hash, 7)),
	);
	pair.alice = next;
	let stale_alice = pair.alice.clone();
	let (next, actions2) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(ChannelCommand::Sign),
	);
	pair.alice = next;
	match &sent_messages(&actions2)[..] {
		[ChannelMessage::CommitmentSigned(commit_sig)] => {
			assert!(commit_sig.channel_data.is_some());
		},
		other => panic!("expected commit_sig, got {:?}", other),
	}
	let mut seed = actions;
	seed.extend(actions2);
	pump(&mut pair.alice, &mut pair.bob, &pair.alice_node, &pair.bob_node, seed, true);
	assert!(funded_state(&pair.bob).commitments().remote_channel_data.is_some());

	// Alice loses her disk and comes back with the stale state. On reconnect she waits
	// for bob's reestablish, which returns her own backup; she adopts the fresher state.
	pair.alice = stale_alice;
	let (next, _) = process(&pair.alice_node, &pair.alice, ChannelEvent::Disconnected);
	pair.alice = next;
	let backup_init = Init { features: backup_features };
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::Connected {
			local_init: backup_init,
			remote_init: Init { features: InitFeatures::empty() },
		},
	);
	pair.alice = next;
	// Waiting for their reestablish first: nothing sent yet.
	assert!(sent_messages(&actions).is_empty());
	assert!(matches!(
		phase(&pair.alice),
		Phase::Syncing { wait_for_their_reestablish: true }
	));

	let stale_index = funded_state(&pair.alice).commitments().local_commit.index;
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::ChannelReestablish(
			make_reestablish_for(&pair.bob, &pair.bob_node),
		)),
	);
	pair.alice = next;
	let restored = funded_state(&pair.alice).commitments();
	assert!(restored.local_commit.index > stale_index);
	// And only now does alice send her own reestablish, reflecting the restored state.
	match &sent_messages(&actions)[..] {
		[ChannelMessage::ChannelReestablish(reestablish), ..] => {
			assert_eq!(
				reestablish.next_local_commitment_number,
				restored.local_commit.index + 1
			);
		},
		other => panic!("expected reestablish first, got {:?}", other),
	}
}

#[test]
fn fundee_times_out_waiting_for_funding() {
	let alice_node = TestNode::new([11; 32]);
	let bob_node = TestNode::new([22; 32]);
	let mut alice = new_channel(&alice_node, &bob_node, InitFeatures::empty());
	let mut bob = new_channel(&bob_node, &alice_node, InitFeatures::empty());

	// Run the handshake up to the funding broadcast, but never confirm.
	let (next, actions) = process(
		&alice_node,
		&alice,
		ChannelEvent::InitFunder(init_funder(InitFeatures::empty(), InitFeatures::empty())),
	);
	alice = next;
	let (next, _) = process(
		&bob_node,
		&bob,
		ChannelEvent::InitFundee(init_fundee(InitFeatures::empty(), InitFeatures::empty())),
	);
	bob = next;
	pump(&mut alice, &mut bob, &alice_node, &bob_node, actions, true);

	// The pump stalls at WaitForFundingInternal; feed the funding tx in.
	assert!(matches!(alice.state, ChannelState::WaitForFundingInternal(_)));
	let (next, actions) = process(
		&alice_node,
		&alice,
		ChannelEvent::MakeFundingTxResponse {
			funding_tx: Transaction {
				version: Version::TWO,
				lock_time: LockTime::ZERO,
				input: vec![],
				output: vec![TxOut {
					value: Amount::from_sat(FUNDING_SATOSHIS),
					script_pubkey: ScriptBuf::new(),
				}],
			},
			funding_tx_output_index: 0,
			fee_satoshis: 150,
		},
	);
	alice = next;
	pump(&mut alice, &mut bob, &alice_node, &bob_node, actions, true);
	assert!(matches!(funded_state(&bob), FundedState::WaitForFundingConfirmed(_)));

	// Five days of blocks later, the fundee walks away without touching the chain.
	let (next, actions) = process(
		&bob_node,
		&bob,
		ChannelEvent::NewBlock { height: FUNDING_TIMEOUT_FUNDEE_BLOCKS + 100 },
	);
	bob = next;
	assert!(matches!(bob.state, ChannelState::Aborted));
	assert!(sent_messages(&actions)
		.iter()
		.any(|message| matches!(message, ChannelMessage::Error(_))));
	assert!(!actions.iter().any(|action| matches!(action, ChannelAction::PublishTx { .. })));
}

#[test]
fn restore_reinstalls_watches_and_republishes() {
	let mut pair = open_pair();
	add_and_lock_in_htlc(&mut pair, 10_000_000, 7);

	// Plain restore of an operational channel: offline, funding-spent watch back up.
	let state = funded_state(&pair.alice).clone();
	let restored = new_channel(&pair.alice_node, &pair.bob_node, InitFeatures::empty());
	let (restored, actions) = process(
		&pair.alice_node,
		&restored,
		ChannelEvent::Restore(Box::new(state)),
	);
	assert!(matches!(phase(&restored), Phase::Offline));
	assert!(actions.iter().any(|action| matches!(
		action,
		ChannelAction::SendWatch { watch: WatchRequest::Spent { tag: WatchTag::FundingSpent, .. } }
	)));

	// Restore of a closing channel: every publishable transaction goes out again.
	let (next, _) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(ChannelCommand::ForceClose),
	);
	pair.alice = next;
	let closing_state = funded_state(&pair.alice).clone();
	let fresh = new_channel(&pair.alice_node, &pair.bob_node, InitFeatures::empty());
	let (fresh, actions) = process(
		&pair.alice_node,
		&fresh,
		ChannelEvent::Restore(Box::new(closing_state)),
	);
	assert!(matches!(funded_state(&fresh), FundedState::Closing(_)));
	let published: Vec<_> = actions
		.iter()
		.filter(|action| matches!(action, ChannelAction::PublishTx { .. }))
		.collect();
	assert!(published.len() >= 2);
	assert!(actions.iter().any(|action| matches!(
		action,
		ChannelAction::SendWatch { watch: WatchRequest::Confirmed { .. } }
	)));
}

#[test]
fn unrecognized_funding_spend_is_an_information_leak() {
	let mut pair = open_pair();
	let commitments = funded_state(&pair.alice).commitments();
	let rogue_tx = Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: commitments.commit_input.outpoint,
			script_sig: ScriptBuf::new(),
			sequence: Sequence(0xffffffff),
			witness: Witness::new(),
		}],
		output: vec![TxOut { value: Amount::from_sat(1), script_pubkey: ScriptBuf::new() }],
	};
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::WatchReceived(WatchEvent::Spent {
			tx: rogue_tx,
			tag: WatchTag::FundingSpent,
		}),
	);
	pair.alice = next;
	assert!(matches!(funded_state(&pair.alice), FundedState::ErrorInformationLeak(_)));
	assert!(actions
		.iter()
		.any(|action| matches!(action, ChannelAction::ProcessLocalFailure { .. })));
}

#[test]
fn outdated_node_waits_for_remote_publish_and_recovers() {
	let mut pair = open_pair();
	// Keep a pre-update copy of alice, then advance the channel past it.
	let stale_alice = pair.alice.clone();
	add_and_lock_in_htlc(&mut pair, 10_000_000, 7);

	// Alice restarts on the stale state. The peer's reestablish proves she is behind by
	// revealing her own secret for a commitment she thinks is current.
	pair.alice = stale_alice;
	let empty_init = Init { features: InitFeatures::empty() };
	let (next, _) = process(&pair.alice_node, &pair.alice, ChannelEvent::Disconnected);
	pair.alice = next;
	let (next, _) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::Connected { local_init: empty_init.clone(), remote_init: empty_init },
	);
	pair.alice = next;
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::ChannelReestablish(
			make_reestablish_for(&pair.bob, &pair.bob_node),
		)),
	);
	pair.alice = next;
	assert!(matches!(
		funded_state(&pair.alice),
		FundedState::WaitForRemotePublishFutureCommitment(_)
	));
	// We beg the peer to close on its commitment; we must never publish our own.
	assert!(sent_messages(&actions)
		.iter()
		.any(|message| matches!(message, ChannelMessage::Error(_))));
	assert!(!actions.iter().any(|action| matches!(action, ChannelAction::PublishTx { .. })));
	let (_, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::ExecuteCommand(ChannelCommand::ForceClose),
	);
	assert!(!actions.iter().any(|action| matches!(action, ChannelAction::PublishTx { .. })));

	// The peer publishes; we recover our main output and nothing else.
	let bob_commit =
		funded_state(&pair.bob).commitments().local_commit.publishable_txs.commit_tx.clone();
	let (next, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::WatchReceived(WatchEvent::Spent {
			tx: bob_commit,
			tag: WatchTag::FundingSpent,
		}),
	);
	pair.alice = next;
	let closing = match funded_state(&pair.alice) {
		FundedState::Closing(closing) => closing.clone(),
		state => panic!("expected Closing, got {:?}", state),
	};
	let rcp = closing.future_remote_commit_published.expect("future remote commit published");
	assert!(rcp.claim_main_output_tx.is_some());
	assert!(rcp.claim_htlc_success_txs.is_empty() && rcp.claim_htlc_timeout_txs.is_empty());
	assert!(actions.iter().any(|action| matches!(action, ChannelAction::PublishTx { .. })));
}

#[test]
fn reserve_is_tracked_per_side() {
	let pair = open_pair();
	// The funder's whole balance sits above the reserve; the fundee has nothing yet.
	assert!(crate::ln::helpers::above_reserve(funded_state(&pair.alice).commitments()));
	assert!(!crate::ln::helpers::above_reserve(funded_state(&pair.bob).commitments()));
}

#[test]
fn unhandled_events_leave_the_state_alone() {
	let pair = open_pair();
	// A closing_signed out of nowhere in Normal is logged and ignored.
	let commitments = funded_state(&pair.alice).commitments();
	let bogus = ClosingSigned {
		channel_id: commitments.channel_id,
		fee_satoshis: 1,
		signature: pair
			.alice_node
			.keys
			.derive_channel_signer([1; 32])
			.sign_closing_transaction(
				&commitments.local_commit.publishable_txs.commit_tx,
				&commitments.commit_input,
			),
		channel_data: None,
	};
	let before = pair.alice.clone();
	let (after, actions) = process(
		&pair.alice_node,
		&pair.alice,
		ChannelEvent::MessageReceived(ChannelMessage::ClosingSigned(bogus)),
	);
	assert_eq!(before, after);
	assert!(actions.is_empty());
}
