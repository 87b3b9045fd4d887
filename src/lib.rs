// Lightning channel library: per-peer payment channel state machine
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate strict_encoding;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_with;
#[cfg(feature = "serde")]
extern crate serde_crate as serde;

pub mod accept;
pub mod command;
pub mod effects;
pub mod htlc;
pub mod input;
pub mod messages;
pub mod peer;
pub mod state;
mod transition;

pub use command::{Command, CommandStatus};
pub use effects::{
    ChainWatcher, Collaborators, FeePolicy, HtlcDiscovery, Outcome,
    PacketQueue, SigValidation, TxBuilder,
};
pub use htlc::{
    Change, ChangeKind, Htlc, HtlcProgress, HtlcRef, HtlcState, Party,
};
pub use input::{Input, InputData};
pub use messages::{AnchorOffer, Pkt};
pub use peer::{
    Anchor, ChainEvent, ChannelParams, CloseNegotiation, Commitment, Peer,
    PeerState,
};
pub use state::ChannelState;
pub use transition::state;
