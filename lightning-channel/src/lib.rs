// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The core of a Lightning Network payment channel, as a deterministic state machine.
//!
//! A [`ln::channel::Channel`] is a pure value. Feeding it a [`events::ChannelEvent`] via
//! [`ln::channel::Channel::process`] yields a new channel value plus an ordered list of
//! [`events::ChannelAction`]s which the caller must execute: messages to send to the peer,
//! transactions to broadcast, chain watches to install, and state to persist. The library
//! itself never performs I/O, never blocks, and never talks to the network or the chain.
//!
//! Everything that requires key material, transaction assembly or entropy is reached through
//! the traits in [`sign`], so the state machine stays deterministic and replayable: applying
//! the same events to the same persisted state always produces the same actions.

#![cfg_attr(not(test), deny(missing_docs))]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(unused_imports)]

#[macro_use]
pub mod util;
pub mod chain;
pub mod events;
pub mod ln;
pub mod sign;
