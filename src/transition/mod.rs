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

//! The transition function of the channel state machine.
//!
//! [`state`] reduces one input against the peer context, invoking the
//! collaborator interfaces for all side effects and returning an
//! [`Outcome`]. Dispatch is a (state × input) table: first on the current
//! [`ChannelState`], then — inside the per-region handlers — an exhaustive,
//! wildcard-free `match` over [`Input`]. Adding a state or an input does not
//! compile until every new cell is classified as expected, benign-ignore,
//! protocol violation or impossible.

mod closing;
mod normal;
mod onchain;
mod opening;

use crate::accept::AcceptError;
use crate::command::{Command, CommandStatus};
use crate::effects::{Collaborators, Outcome};
use crate::input::{Input, InputData};
use crate::messages::Pkt;
use crate::peer::Peer;
use crate::state::ChannelState;

/// Runs a single transition of the per-peer channel state machine.
///
/// For a fixed `(peer snapshot, input, idata)` the transition is
/// deterministic; all non-determinism (block arrival, network delivery) is
/// injected through inputs. The function runs to completion without
/// suspension: anything that would block is requested through `ctx` now and
/// answered by a later input.
pub fn state(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match peer.state() {
        ChannelState::Init => opening::init(peer, input, idata, ctx),
        ChannelState::OpenWaitForAnchorCreate => {
            opening::wait_for_anchor_create(peer, input, idata, ctx)
        }
        ChannelState::OpenWaitForOpenWithAnchor
        | ChannelState::OpenWaitForOpenNoAnchor => {
            opening::wait_for_open(peer, input, idata, ctx)
        }
        ChannelState::OpenWaitForAnchor => {
            opening::wait_for_anchor(peer, input, idata, ctx)
        }
        ChannelState::OpenWaitForCommitSig => {
            opening::wait_for_commit_sig(peer, input, idata, ctx)
        }
        ChannelState::OpenWaitingOurAnchor
        | ChannelState::OpenWaitingOurAnchorTheyCompleted
        | ChannelState::OpenWaitingTheirAnchor
        | ChannelState::OpenWaitingTheirAnchorTheyCompleted => {
            opening::waiting_anchor_depth(peer, input, idata, ctx)
        }
        ChannelState::OpenWaitForCompleteOurAnchor
        | ChannelState::OpenWaitForCompleteTheirAnchor => {
            opening::wait_for_complete(peer, input, idata, ctx)
        }
        ChannelState::Normal => normal::run(peer, input, idata, ctx),
        ChannelState::UsClearing | ChannelState::BothClearing => {
            closing::clearing(peer, input, idata, ctx)
        }
        ChannelState::WaitForCloseSig => {
            closing::wait_for_close_sig(peer, input, idata, ctx)
        }
        ChannelState::OnchainMutual => onchain::mutual(peer, input, idata, ctx),
        ChannelState::OnchainOurCommit => {
            onchain::our_commit(peer, input, idata, ctx)
        }
        ChannelState::OnchainTheirCommit | ChannelState::OnchainSteal => {
            onchain::their_resolution(peer, input, idata, ctx)
        }
        ChannelState::Closed
        | ChannelState::ErrAnchorTimeout
        | ChannelState::ErrAnchorLost
        | ChannelState::ErrProtocol
        | ChannelState::ErrInformationLeak
        | ChannelState::ErrInternal => absorb(input),
    }
}

/// Terminal states absorb every input: the state never changes, commands
/// are rejected, everything else is ignored.
fn absorb(input: Input) -> Outcome {
    if input.is_cmd() {
        Outcome::status(CommandStatus::Failed)
    } else {
        Outcome::none()
    }
}

/// A local command inconsistent with the current state (or issued while
/// another command is outstanding) fails without touching the channel.
fn reject_command() -> Outcome {
    Outcome::status(CommandStatus::Failed)
}

/// Fails the outstanding command, if any, returning the status to report.
fn fail_current_cmd(peer: &mut Peer) -> CommandStatus {
    peer.cmd_htlc = None;
    if peer.current_cmd.take().is_some() {
        CommandStatus::Failed
    } else {
        CommandStatus::None
    }
}

/// Enters the given error state. A live anchor is defended by broadcasting
/// our commitment; an abandoned on-chain resolution drops its HTLC
/// watches; the outstanding command, if any, is reported failed.
fn goto_error(
    peer: &mut Peer,
    ctx: &mut dyn Collaborators,
    err_state: ChannelState,
) -> Outcome {
    debug_assert!(err_state.is_error());
    let broadcast = if peer.anchor_is_live() {
        Some(ctx.commit_tx(peer))
    } else {
        None
    };
    if peer.onchain.take().is_some() {
        ctx.unwatch_all_htlc_outputs(peer);
    }
    peer.state = err_state;
    let status = fail_current_cmd(peer);
    Outcome { status, broadcast }
}

/// A packet failed validation: the acceptor's diagnostic goes back to the
/// peer inside an error packet and the channel falls to unilateral close.
fn protocol_violation(
    peer: &mut Peer,
    ctx: &mut dyn Collaborators,
    err: AcceptError,
) -> Outcome {
    ctx.queue_pkt_err(peer, Pkt::err(err));
    goto_error(peer, ctx, ChannelState::ErrProtocol)
}

/// A syntactically valid packet arrived in a state where it is impossible.
fn unexpected_pkt(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let pkt = match idata {
        InputData::Pkt(pkt) => pkt,
        _ => return internal(peer, Input::None),
    };
    ctx.queue_pkt_err(peer, Pkt::err_unexpected(pkt));
    goto_error(peer, ctx, ChannelState::ErrProtocol)
}

/// The counterparty reported an error and abandoned the channel.
fn peer_error(
    peer: &mut Peer,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    goto_error(peer, ctx, ChannelState::ErrProtocol)
}

/// An impossible (state, input) cell was reached: an implementation bug.
/// Asserts in debug builds; degrades to the `ErrInternal` absorbing state.
fn internal(peer: &mut Peer, input: Input) -> Outcome {
    debug_assert!(
        false,
        "impossible input {} in state {}",
        input,
        peer.state()
    );
    peer.state = ChannelState::ErrInternal;
    let status = fail_current_cmd(peer);
    Outcome {
        status,
        broadcast: None,
    }
}

/// A late anchor depth notification. Stale deliveries are benign for a
/// watched counterparty anchor; for our own anchor no timeout was ever
/// registered, so receiving one is an implementation bug.
fn stale_anchor_timeout(peer: &mut Peer) -> Outcome {
    let ours = peer.anchor.as_ref().map(|anchor| anchor.ours).unwrap_or(true);
    if ours {
        internal(peer, Input::BitcoinAnchorTimeout)
    } else {
        Outcome::none()
    }
}

/// Reports the outstanding send command succeeded once the change it
/// proposed has settled into the commitments of both sides.
fn resolve_settled_command(peer: &mut Peer) -> CommandStatus {
    match peer.cmd_htlc {
        Some(href)
            if !peer
                .changes
                .iter()
                .any(|change| change.htlc_ref() == href) =>
        {
            peer.current_cmd = None;
            peer.cmd_htlc = None;
            CommandStatus::Succeeded
        }
        _ => CommandStatus::None,
    }
}

/// Marks the open command complete upon entering normal operation.
fn succeed_open(peer: &mut Peer) -> Outcome {
    debug_assert!(matches!(
        peer.current_cmd,
        Some(Command::OpenWithAnchor(_))
            | Some(Command::OpenWithoutAnchor(_))
            | None
    ));
    peer.state = ChannelState::Normal;
    let status = if peer.current_cmd.take().is_some() {
        CommandStatus::Succeeded
    } else {
        CommandStatus::None
    };
    Outcome::status(status)
}

#[cfg(test)]
mod test;
