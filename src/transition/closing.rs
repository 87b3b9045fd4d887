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

//! Clearing and mutual close.
//!
//! Clearing forbids new HTLC proposals while in-flight payments drain
//! through the usual commit/revoke rounds. Once no HTLCs remain committed,
//! fee negotiation starts: both sides exchange `close_signature` offers,
//! converging on the midpoint, until a signature at an identical fee is
//! observed. The matched close transaction is broadcast and watched until
//! burial.

use super::{
    goto_error, internal, normal, onchain, peer_error, protocol_violation,
    reject_command, stale_anchor_timeout, unexpected_pkt,
};
use crate::accept;
use crate::command::CommandStatus;
use crate::effects::{Collaborators, Outcome};
use crate::input::{Input, InputData};
use crate::messages::Pkt;
use crate::peer::{CloseNegotiation, OnchainResolution, Peer};
use crate::state::ChannelState;

/// Once both sides cleared: start fee negotiation immediately, or wait for
/// the in-flight HTLCs to drain first.
pub(super) fn after_both_clearing(
    peer: &mut Peer,
    ctx: &mut dyn Collaborators,
) {
    if peer.committed_to_htlcs() {
        ctx.watch_htlcs_cleared(peer, Input::HtlcsCleared);
    } else {
        begin_negotiation(peer, ctx);
    }
}

/// Computes our close fee offer, arms the close watch and sends our
/// signature.
fn begin_negotiation(peer: &mut Peer, ctx: &mut dyn Collaborators) {
    let fee = ctx.calculate_close_fee(peer);
    let close = peer.close.get_or_insert(CloseNegotiation {
        our_fee: 0,
        their_fee: None,
        their_sig: None,
        matched: false,
        their_script: None,
    });
    close.our_fee = fee;
    peer.state = ChannelState::WaitForCloseSig;
    ctx.watch_close(
        peer,
        Input::BitcoinCloseDone,
        Input::CloseCompleteTimeout,
    );
    ctx.queue_pkt_close_signature(peer, fee);
}

/// Their `close_signature`: accept a matching fee and broadcast, or move
/// our offer towards theirs and re-sign.
fn on_close_signature(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let pkt = match idata {
        InputData::Pkt(Pkt::CloseSignature(pkt)) => *pkt,
        _ => return internal(peer, Input::PktCloseSignature),
    };
    // they may start negotiating before we observed the HTLCs draining;
    // make sure our own offer is on the wire first
    let offered = peer
        .close
        .as_ref()
        .map(|close| close.our_fee > 0)
        .unwrap_or(false);
    if !offered && !peer.committed_to_htlcs() {
        begin_negotiation(peer, ctx);
    }
    match accept::accept_pkt_close_sig(peer, &pkt, &*ctx) {
        Err(err) => protocol_violation(peer, ctx, err),
        Ok(true) => {
            ctx.unwatch_close_timeout(peer, Input::CloseCompleteTimeout);
            let close_tx = ctx.close_tx(peer, pkt.close_fee);
            peer.onchain = Some(OnchainResolution {
                primary_buried: false,
                htlcs_done: true,
            });
            peer.state = ChannelState::OnchainMutual;
            Outcome::broadcast(CommandStatus::None, close_tx)
        }
        Ok(false) => {
            let (our_fee, their_fee) = match &peer.close {
                Some(close) => {
                    (close.our_fee, close.their_fee.unwrap_or(close.our_fee))
                }
                None => return internal(peer, Input::PktCloseSignature),
            };
            let next = (our_fee + their_fee) / 2;
            if next != our_fee {
                if let Some(close) = &mut peer.close {
                    close.our_fee = next;
                }
                ctx.queue_pkt_close_signature(peer, next);
            }
            Outcome::none()
        }
    }
}

/// The counterparty never produced a matching close signature. Fall back
/// to the best unilateral option: an acceptable signed close transaction
/// is still preferred to broadcasting our commitment.
fn close_timeout(peer: &mut Peer, ctx: &mut dyn Collaborators) -> Outcome {
    if peer.has_close_sig() {
        let fee = peer
            .close
            .as_ref()
            .and_then(|close| close.their_fee)
            .unwrap_or_default();
        let close_tx = ctx.close_tx(peer, fee);
        peer.onchain = Some(OnchainResolution {
            primary_buried: false,
            htlcs_done: true,
        });
        peer.state = ChannelState::OnchainMutual;
        Outcome::broadcast(CommandStatus::None, close_tx)
    } else {
        onchain::broadcast_our_commit(peer, ctx)
    }
}

pub(super) fn clearing(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let both = peer.state() == ChannelState::BothClearing;
    match input {
        Input::PktCloseClearing => {
            let pkt = match idata {
                InputData::Pkt(Pkt::CloseClearing(pkt)) => pkt,
                _ => return internal(peer, input),
            };
            match accept::accept_pkt_close_clearing(peer, pkt) {
                Err(err) => protocol_violation(peer, ctx, err),
                Ok(()) => {
                    if !both {
                        peer.state = ChannelState::BothClearing;
                        after_both_clearing(peer, ctx);
                    }
                    Outcome::none()
                }
            }
        }
        // no new HTLCs once clearing began
        Input::PktUpdateAddHtlc => {
            ctx.queue_pkt_err(
                peer,
                Pkt::err("new HTLC proposed during clearing"),
            );
            goto_error(peer, ctx, ChannelState::ErrProtocol)
        }
        Input::PktUpdateFulfillHtlc | Input::PktUpdateFailHtlc => {
            normal::handle_update_pkt(peer, input, idata, ctx)
        }
        Input::PktUpdateCommit => normal::handle_commit(peer, idata, ctx),
        Input::PktUpdateRevocation => {
            normal::handle_revocation(peer, idata, ctx)
        }
        Input::HtlcsCleared => {
            if both {
                begin_negotiation(peer, ctx);
                Outcome::none()
            } else {
                internal(peer, input)
            }
        }
        Input::PktCloseSignature => {
            if both {
                on_close_signature(peer, idata, ctx)
            } else {
                unexpected_pkt(peer, idata, ctx)
            }
        }
        Input::PktError => peer_error(peer, ctx),
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktOpenComplete => unexpected_pkt(peer, idata, ctx),
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorTheySpent => {
            onchain::their_spend(peer, idata, ctx)
        }
        Input::BitcoinAnchorOtherSpent => {
            onchain::other_spend(peer, idata, ctx)
        }
        Input::BitcoinAnchorUnspent => {
            if let Some(anchor) = &mut peer.anchor {
                anchor.live = false;
            }
            goto_error(peer, ctx, ChannelState::ErrAnchorLost)
        }
        Input::BitcoinAnchorDepthOk => Outcome::none(),
        Input::BitcoinAnchorTimeout => stale_anchor_timeout(peer),
        Input::BitcoinAnchorCreated
        | Input::BitcoinCommitDelayPassed
        | Input::BitcoinHtlcToUsTimeout
        | Input::BitcoinHtlcToThemSpent
        | Input::BitcoinHtlcToThemTimeout
        | Input::BitcoinHtlcSpendDone
        | Input::BitcoinCloseDone
        | Input::BitcoinSpendOursDone
        | Input::BitcoinSpendTheirsDone
        | Input::BitcoinStealDone
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn wait_for_close_sig(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::PktCloseSignature => on_close_signature(peer, idata, ctx),
        Input::CloseCompleteTimeout => close_timeout(peer, ctx),
        // their close broadcast can reach burial before their signature
        // packet reaches us
        Input::BitcoinCloseDone => {
            peer.onchain = Some(OnchainResolution {
                primary_buried: true,
                htlcs_done: true,
            });
            onchain::try_close(peer)
        }
        // a repeated clearing announcement changes nothing
        Input::PktCloseClearing => Outcome::none(),
        Input::PktError => peer_error(peer, ctx),
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktOpenComplete
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation => unexpected_pkt(peer, idata, ctx),
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorTheySpent => {
            onchain::their_spend(peer, idata, ctx)
        }
        Input::BitcoinAnchorOtherSpent => {
            onchain::other_spend(peer, idata, ctx)
        }
        Input::BitcoinAnchorUnspent => {
            if let Some(anchor) = &mut peer.anchor {
                anchor.live = false;
            }
            goto_error(peer, ctx, ChannelState::ErrAnchorLost)
        }
        Input::BitcoinAnchorDepthOk | Input::HtlcsCleared => Outcome::none(),
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
