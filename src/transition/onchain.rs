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

//! Unilateral close and on-chain defense.
//!
//! A commitment on-chain (ours by decision, theirs by observation) opens a
//! resolution phase: the primary spend is watched until burial, every HTLC
//! output is watched and resolved by timeout refund or preimage collection,
//! and a revoked commitment is punished by a steal transaction using the
//! secret its revocation revealed. `Closed` is reached when the primary
//! spend is buried and no HTLC watches remain.

use amplify::Slice32;
use bitcoin_scripts::hlc::HashLock;

use super::{
    fail_current_cmd, goto_error, internal, reject_command,
    stale_anchor_timeout,
};
use crate::command::{Command, CommandStatus};
use crate::effects::{Collaborators, Outcome};
use crate::htlc::{HtlcRef, HtlcState, Party};
use crate::input::{Input, InputData};
use crate::peer::{ChainEvent, OnchainResolution, Peer};
use crate::state::ChannelState;

/// Broadcasts our commitment, watching its delayed output and every HTLC
/// output it carries. Any outstanding command fails: the channel will not
/// complete its cooperative flow.
pub(super) fn broadcast_our_commit(
    peer: &mut Peer,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let commit_tx = ctx.commit_tx(peer);
    ctx.watch_delayed(peer, &commit_tx, Input::BitcoinCommitDelayPassed);
    let any_htlcs = ctx.watch_our_htlc_outputs(
        peer,
        &commit_tx,
        Input::BitcoinHtlcToUsTimeout,
        Input::BitcoinHtlcToThemSpent,
        Input::BitcoinHtlcToThemTimeout,
    );
    peer.onchain = Some(OnchainResolution {
        primary_buried: false,
        htlcs_done: !any_htlcs,
    });
    peer.state = ChannelState::OnchainOurCommit;
    let status = fail_current_cmd(peer);
    Outcome {
        status,
        broadcast: Some(commit_tx),
    }
}

/// They spent the anchor with a commitment transaction. Their latest
/// commitment is resolved by spending our outputs; any other recognized
/// generation is a revoked commitment and gets punished.
pub(super) fn their_spend(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let event = match idata {
        InputData::Btc(event) => event.clone(),
        _ => return internal(peer, Input::BitcoinAnchorTheySpent),
    };
    if let Some(anchor) = &mut peer.anchor {
        anchor.live = false;
    }
    match event.commitment_number {
        Some(number) if number == peer.remote_commit.number => {
            let spend_tx = ctx.spend_theirs_tx(peer, &event);
            ctx.watch_tx(peer, &spend_tx, Input::BitcoinSpendTheirsDone);
            let any_htlcs = ctx.watch_their_htlc_outputs(
                peer,
                &event,
                Input::BitcoinHtlcToUsTimeout,
                Input::BitcoinHtlcToThemSpent,
                Input::BitcoinHtlcToThemTimeout,
            );
            peer.onchain = Some(OnchainResolution {
                primary_buried: false,
                htlcs_done: !any_htlcs,
            });
            peer.state = ChannelState::OnchainTheirCommit;
            let status = fail_current_cmd(peer);
            Outcome {
                status,
                broadcast: Some(spend_tx),
            }
        }
        Some(number) => match peer.revocations.get(&number).copied() {
            Some(secret) => steal(peer, ctx, &event, secret),
            None => goto_error(peer, ctx, ChannelState::ErrInformationLeak),
        },
        None => goto_error(peer, ctx, ChannelState::ErrInformationLeak),
    }
}

/// The anchor was spent by a transaction the watcher did not attribute to
/// the counterparty's current commitment. A recognized revoked generation
/// is punished; anything else means key compromise.
pub(super) fn other_spend(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let event = match idata {
        InputData::Btc(event) => event.clone(),
        _ => return internal(peer, Input::BitcoinAnchorOtherSpent),
    };
    if let Some(anchor) = &mut peer.anchor {
        anchor.live = false;
    }
    match event
        .commitment_number
        .and_then(|number| peer.revocations.get(&number).copied())
    {
        Some(secret) => steal(peer, ctx, &event, secret),
        None => goto_error(peer, ctx, ChannelState::ErrInformationLeak),
    }
}

/// Punishes a revoked commitment: every output accrues to us.
fn steal(
    peer: &mut Peer,
    ctx: &mut dyn Collaborators,
    event: &ChainEvent,
    secret: Slice32,
) -> Outcome {
    let steal_tx = ctx.steal_tx(peer, event, secret);
    ctx.watch_tx(peer, &steal_tx, Input::BitcoinStealDone);
    let any_htlcs = ctx.watch_their_htlc_outputs(
        peer,
        event,
        Input::BitcoinHtlcToUsTimeout,
        Input::BitcoinHtlcToThemSpent,
        Input::BitcoinHtlcToThemTimeout,
    );
    peer.onchain = Some(OnchainResolution {
        primary_buried: false,
        htlcs_done: !any_htlcs,
    });
    peer.state = ChannelState::OnchainSteal;
    let status = fail_current_cmd(peer);
    Outcome {
        status,
        broadcast: Some(steal_tx),
    }
}

/// Reaches `Closed` once nothing remains to watch, resolving a pending
/// close command.
pub(super) fn try_close(peer: &mut Peer) -> Outcome {
    let complete = peer
        .onchain
        .map(OnchainResolution::is_complete)
        .unwrap_or(false);
    if !complete {
        return Outcome::none();
    }
    peer.state = ChannelState::Closed;
    peer.anchor = None;
    peer.onchain = None;
    let status = match peer.current_cmd.take() {
        Some(Command::Close) => CommandStatus::Succeeded,
        Some(_) => CommandStatus::Failed,
        None => CommandStatus::None,
    };
    peer.cmd_htlc = None;
    Outcome::status(status)
}

fn primary_done(peer: &mut Peer) -> Outcome {
    if let Some(onchain) = &mut peer.onchain {
        onchain.primary_buried = true;
    }
    try_close(peer)
}

fn all_htlcs_done(peer: &mut Peer) -> Outcome {
    if let Some(onchain) = &mut peer.onchain {
        onchain.htlcs_done = true;
    }
    try_close(peer)
}

/// An HTLC output refunding to us has passed its timeout: collect it.
fn htlc_tous_timeout(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let href = match idata {
        InputData::Htlc(href) => *href,
        _ => return internal(peer, Input::BitcoinHtlcToUsTimeout),
    };
    let htlc = match peer.htlc(href).copied() {
        Some(htlc) => htlc,
        None => return internal(peer, Input::BitcoinHtlcToUsTimeout),
    };
    let timeout_tx = ctx.htlc_timeout_tx(peer, &htlc);
    ctx.unwatch_htlc_output(peer, &htlc, Input::AllHtlcsDone);
    ctx.watch_htlc_spend(
        peer,
        &timeout_tx,
        &htlc,
        Input::BitcoinHtlcSpendDone,
    );
    if let Some(htlc) = peer.htlc_mut(href) {
        htlc.state = HtlcState::OnchainResolved { preimage: None };
    }
    Outcome {
        status: CommandStatus::None,
        broadcast: Some(timeout_tx),
    }
}

/// An HTLC output was spent towards the counterparty. If the spend reveals
/// a preimage, the matching offered HTLC is marked fulfilled so upstream
/// peers can be paid, and any received HTLC locked by the same hash is
/// collected on-chain.
fn htlc_tothem_spent(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let event = match idata {
        InputData::Btc(event) => event.clone(),
        _ => return internal(peer, Input::BitcoinHtlcToThemSpent),
    };
    let revealed = ctx.tx_revealed_r_value(peer, &event);
    let (id, preimage) = match revealed {
        Some(revealed) => revealed,
        None => {
            // no preimage in the witness: nothing to collect, just retire
            // the watch
            if let Some(id) = event.htlc_id {
                let href = HtlcRef {
                    side: Party::Local,
                    id,
                };
                if let Some(htlc) = peer.htlc(href).copied() {
                    ctx.unwatch_htlc_output(peer, &htlc, Input::AllHtlcsDone);
                    if let Some(htlc) = peer.htlc_mut(href) {
                        htlc.state =
                            HtlcState::OnchainResolved { preimage: None };
                    }
                }
            }
            return Outcome::none();
        }
    };

    let href = HtlcRef {
        side: Party::Local,
        id,
    };
    if let Some(htlc) = peer.htlc(href).copied() {
        ctx.unwatch_htlc_output(peer, &htlc, Input::AllHtlcsDone);
    }
    if let Some(htlc) = peer.htlc_mut(href) {
        htlc.state = HtlcState::OnchainResolved {
            preimage: Some(preimage),
        };
    }

    // the revealed preimage may unlock a received HTLC with the same lock
    let hashlock = HashLock::from(preimage);
    let unlocked = peer
        .received
        .values()
        .find(|htlc| {
            htlc.payment_hash == hashlock && htlc.state.is_live()
        })
        .copied();
    if let Some(htlc) = unlocked {
        let spend_tx = ctx.htlc_spend_tx(peer, &htlc);
        ctx.watch_htlc_spend(
            peer,
            &spend_tx,
            &htlc,
            Input::BitcoinHtlcSpendDone,
        );
        if let Some(htlc) = peer.received.get_mut(&htlc.id) {
            htlc.state = HtlcState::OnchainResolved {
                preimage: Some(preimage),
            };
        }
        return Outcome {
            status: CommandStatus::None,
            broadcast: Some(spend_tx),
        };
    }
    Outcome::none()
}

/// An HTLC output refunding to the counterparty has passed its timeout;
/// nothing accrues to us.
fn htlc_tothem_timeout(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let href = match idata {
        InputData::Htlc(href) => *href,
        _ => return internal(peer, Input::BitcoinHtlcToThemTimeout),
    };
    let htlc = match peer.htlc(href).copied() {
        Some(htlc) => htlc,
        None => return internal(peer, Input::BitcoinHtlcToThemTimeout),
    };
    ctx.unwatch_htlc_output(peer, &htlc, Input::AllHtlcsDone);
    if let Some(htlc) = peer.htlc_mut(href) {
        htlc.state = HtlcState::OnchainResolved { preimage: None };
    }
    Outcome::none()
}

/// Our spend of an HTLC output is buried; retire its watch.
fn htlc_spend_done(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let href = match idata {
        InputData::Htlc(href) => *href,
        _ => return internal(peer, Input::BitcoinHtlcSpendDone),
    };
    let htlc = match peer.htlc(href).copied() {
        Some(htlc) => htlc,
        None => return internal(peer, Input::BitcoinHtlcSpendDone),
    };
    ctx.unwatch_htlc_spend(peer, &htlc, Input::AllHtlcsDone);
    Outcome::none()
}

pub(super) fn mutual(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::BitcoinCloseDone => primary_done(peer),
        // a reorganisation can still replace the close with a commitment
        Input::BitcoinAnchorTheySpent => their_spend(peer, idata, ctx),
        Input::BitcoinAnchorOtherSpent => other_spend(peer, idata, ctx),
        // the counterparty is done; late packets carry no meaning anymore
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktOpenComplete
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation
        | Input::PktCloseClearing
        | Input::PktCloseSignature
        | Input::PktError => Outcome::none(),
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorDepthOk
        | Input::BitcoinAnchorUnspent
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout => Outcome::none(),
        Input::BitcoinAnchorTimeout => stale_anchor_timeout(peer),
        Input::BitcoinAnchorCreated
        | Input::BitcoinCommitDelayPassed
        | Input::BitcoinHtlcToUsTimeout
        | Input::BitcoinHtlcToThemSpent
        | Input::BitcoinHtlcToThemTimeout
        | Input::BitcoinHtlcSpendDone
        | Input::BitcoinSpendOursDone
        | Input::BitcoinSpendTheirsDone
        | Input::BitcoinStealDone
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn our_commit(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::BitcoinCommitDelayPassed => {
            let spend_tx = ctx.spend_ours_tx(peer);
            ctx.watch_tx(peer, &spend_tx, Input::BitcoinSpendOursDone);
            Outcome {
                status: CommandStatus::None,
                broadcast: Some(spend_tx),
            }
        }
        Input::BitcoinSpendOursDone => primary_done(peer),
        Input::BitcoinHtlcToUsTimeout => htlc_tous_timeout(peer, idata, ctx),
        Input::BitcoinHtlcToThemSpent => htlc_tothem_spent(peer, idata, ctx),
        Input::BitcoinHtlcToThemTimeout => {
            htlc_tothem_timeout(peer, idata, ctx)
        }
        Input::BitcoinHtlcSpendDone => htlc_spend_done(peer, idata, ctx),
        Input::AllHtlcsDone => all_htlcs_done(peer),
        // both commitments raced on-chain and theirs won
        Input::BitcoinAnchorTheySpent => their_spend(peer, idata, ctx),
        Input::BitcoinAnchorOtherSpent => other_spend(peer, idata, ctx),
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktOpenComplete
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation
        | Input::PktCloseClearing
        | Input::PktCloseSignature
        | Input::PktError => Outcome::none(),
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorDepthOk
        | Input::BitcoinAnchorUnspent
        | Input::BitcoinCloseDone
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout => Outcome::none(),
        Input::BitcoinAnchorTimeout => stale_anchor_timeout(peer),
        Input::BitcoinAnchorCreated
        | Input::BitcoinSpendTheirsDone
        | Input::BitcoinStealDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn their_resolution(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let stealing = peer.state() == ChannelState::OnchainSteal;
    match input {
        Input::BitcoinSpendTheirsDone => {
            if stealing {
                internal(peer, input)
            } else {
                primary_done(peer)
            }
        }
        Input::BitcoinStealDone => {
            if stealing {
                primary_done(peer)
            } else {
                internal(peer, input)
            }
        }
        Input::BitcoinHtlcToUsTimeout => htlc_tous_timeout(peer, idata, ctx),
        Input::BitcoinHtlcToThemSpent => htlc_tothem_spent(peer, idata, ctx),
        Input::BitcoinHtlcToThemTimeout => {
            htlc_tothem_timeout(peer, idata, ctx)
        }
        Input::BitcoinHtlcSpendDone => htlc_spend_done(peer, idata, ctx),
        Input::AllHtlcsDone => all_htlcs_done(peer),
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktOpenComplete
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation
        | Input::PktCloseClearing
        | Input::PktCloseSignature
        | Input::PktError => Outcome::none(),
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorDepthOk
        | Input::BitcoinAnchorUnspent
        | Input::BitcoinAnchorTheySpent
        | Input::BitcoinAnchorOtherSpent
        | Input::BitcoinCloseDone
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout => Outcome::none(),
        Input::BitcoinAnchorTimeout => stale_anchor_timeout(peer),
        Input::BitcoinAnchorCreated | Input::BitcoinCommitDelayPassed
        | Input::BitcoinSpendOursDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}
