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

//! Opening handshake handlers.
//!
//! Flow: the funding side creates its anchor before sending `open`; both
//! sides exchange `open`; the funder announces the anchor and receives the
//! counterparty signature over its first commitment, then broadcasts the
//! anchor. Both sides watch the anchor and exchange `open_complete` once it
//! reaches depth. Any failure before the anchor is on-chain releases the
//! reserved utxos.

use super::{
    goto_error, internal, peer_error, protocol_violation, reject_command,
    succeed_open, unexpected_pkt,
};
use crate::accept;
use crate::command::{Command, CommandStatus};
use crate::effects::{Collaborators, Outcome};
use crate::input::{Input, InputData};
use crate::messages::{AnchorOffer, Pkt};
use crate::peer::{Anchor, Peer};
use crate::state::ChannelState;

/// Releases anchor utxos reserved for an anchor we created but never
/// broadcast.
fn release_unbroadcast_anchor(peer: &Peer, ctx: &mut dyn Collaborators) {
    let pending = peer
        .anchor()
        .as_ref()
        .map(|anchor| anchor.ours && !anchor.live)
        .unwrap_or(false);
    if pending {
        ctx.release_anchor(peer, Input::None);
    }
}

pub(super) fn init(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::CmdOpenWithAnchor => {
            let params = match idata {
                InputData::Cmd(Command::OpenWithAnchor(params)) => *params,
                _ => return internal(peer, input),
            };
            peer.local_params = params;
            peer.current_cmd = Some(Command::OpenWithAnchor(params));
            peer.state = ChannelState::OpenWaitForAnchorCreate;
            ctx.create_anchor(peer, Input::BitcoinAnchorCreated);
            Outcome::status(CommandStatus::InProgress)
        }
        Input::CmdOpenWithoutAnchor => {
            let params = match idata {
                InputData::Cmd(Command::OpenWithoutAnchor(params)) => *params,
                _ => return internal(peer, input),
            };
            peer.local_params = params;
            peer.current_cmd = Some(Command::OpenWithoutAnchor(params));
            peer.state = ChannelState::OpenWaitForOpenNoAnchor;
            ctx.queue_pkt_open(peer, AnchorOffer::WontCreateAnchor);
            Outcome::status(CommandStatus::InProgress)
        }
        Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::PktError => peer_error(peer, ctx),
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
        | Input::PktCloseSignature => unexpected_pkt(peer, idata, ctx),
        Input::BitcoinAnchorCreated
        | Input::BitcoinAnchorDepthOk
        | Input::BitcoinAnchorTimeout
        | Input::BitcoinAnchorUnspent
        | Input::BitcoinAnchorTheySpent
        | Input::BitcoinAnchorOtherSpent
        | Input::BitcoinCommitDelayPassed
        | Input::BitcoinHtlcToUsTimeout
        | Input::BitcoinHtlcToThemSpent
        | Input::BitcoinHtlcToThemTimeout
        | Input::BitcoinHtlcSpendDone
        | Input::BitcoinCloseDone
        | Input::BitcoinSpendOursDone
        | Input::BitcoinSpendTheirsDone
        | Input::BitcoinStealDone
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn wait_for_anchor_create(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::BitcoinAnchorCreated => {
            let event = match idata {
                InputData::Btc(event) => event,
                _ => return internal(peer, input),
            };
            let satoshis =
                event.tx.output.first().map(|out| out.value).unwrap_or(0);
            peer.anchor = Some(Anchor {
                txid: event.tx.txid(),
                vout: 0,
                satoshis,
                ours: true,
                min_depth: peer.local_params.min_depth,
                live: false,
            });
            peer.state = ChannelState::OpenWaitForOpenWithAnchor;
            ctx.queue_pkt_open(peer, AnchorOffer::WillCreateAnchor);
            Outcome::none()
        }
        Input::PktError => {
            ctx.release_anchor(peer, Input::BitcoinAnchorCreated);
            peer_error(peer, ctx)
        }
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
        | Input::PktCloseSignature => {
            ctx.release_anchor(peer, Input::BitcoinAnchorCreated);
            unexpected_pkt(peer, idata, ctx)
        }
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorDepthOk
        | Input::BitcoinAnchorTimeout
        | Input::BitcoinAnchorUnspent
        | Input::BitcoinAnchorTheySpent
        | Input::BitcoinAnchorOtherSpent
        | Input::BitcoinCommitDelayPassed
        | Input::BitcoinHtlcToUsTimeout
        | Input::BitcoinHtlcToThemSpent
        | Input::BitcoinHtlcToThemTimeout
        | Input::BitcoinHtlcSpendDone
        | Input::BitcoinCloseDone
        | Input::BitcoinSpendOursDone
        | Input::BitcoinSpendTheirsDone
        | Input::BitcoinStealDone
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn wait_for_open(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::PktOpen => {
            let pkt = match idata {
                InputData::Pkt(Pkt::Open(pkt)) => pkt,
                _ => return internal(peer, input),
            };
            match accept::accept_pkt_open(peer, pkt) {
                Err(err) => {
                    release_unbroadcast_anchor(peer, ctx);
                    protocol_violation(peer, ctx, err)
                }
                Ok(()) => {
                    if peer.state()
                        == ChannelState::OpenWaitForOpenWithAnchor
                    {
                        peer.state = ChannelState::OpenWaitForCommitSig;
                        ctx.queue_pkt_anchor(peer);
                    } else {
                        peer.state = ChannelState::OpenWaitForAnchor;
                    }
                    Outcome::none()
                }
            }
        }
        Input::PktError => {
            release_unbroadcast_anchor(peer, ctx);
            peer_error(peer, ctx)
        }
        Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktOpenComplete
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation
        | Input::PktCloseClearing
        | Input::PktCloseSignature => {
            release_unbroadcast_anchor(peer, ctx);
            unexpected_pkt(peer, idata, ctx)
        }
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorCreated
        | Input::BitcoinAnchorDepthOk
        | Input::BitcoinAnchorTimeout
        | Input::BitcoinAnchorUnspent
        | Input::BitcoinAnchorTheySpent
        | Input::BitcoinAnchorOtherSpent
        | Input::BitcoinCommitDelayPassed
        | Input::BitcoinHtlcToUsTimeout
        | Input::BitcoinHtlcToThemSpent
        | Input::BitcoinHtlcToThemTimeout
        | Input::BitcoinHtlcSpendDone
        | Input::BitcoinCloseDone
        | Input::BitcoinSpendOursDone
        | Input::BitcoinSpendTheirsDone
        | Input::BitcoinStealDone
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn wait_for_anchor(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::PktOpenAnchor => {
            let pkt = match idata {
                InputData::Pkt(Pkt::OpenAnchor(pkt)) => pkt,
                _ => return internal(peer, input),
            };
            match accept::accept_pkt_anchor(peer, pkt) {
                Err(err) => protocol_violation(peer, ctx, err),
                Ok(()) => {
                    peer.state = ChannelState::OpenWaitingTheirAnchor;
                    ctx.queue_pkt_open_commit_sig(peer);
                    ctx.watch_anchor(
                        peer,
                        Input::BitcoinAnchorDepthOk,
                        Input::BitcoinAnchorTimeout,
                        Input::BitcoinAnchorUnspent,
                        Input::BitcoinAnchorTheySpent,
                        Input::BitcoinAnchorOtherSpent,
                    );
                    Outcome::none()
                }
            }
        }
        Input::PktError => peer_error(peer, ctx),
        Input::PktOpen
        | Input::PktOpenCommitSig
        | Input::PktOpenComplete
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation
        | Input::PktCloseClearing
        | Input::PktCloseSignature => unexpected_pkt(peer, idata, ctx),
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorCreated
        | Input::BitcoinAnchorDepthOk
        | Input::BitcoinAnchorTimeout
        | Input::BitcoinAnchorUnspent
        | Input::BitcoinAnchorTheySpent
        | Input::BitcoinAnchorOtherSpent
        | Input::BitcoinCommitDelayPassed
        | Input::BitcoinHtlcToUsTimeout
        | Input::BitcoinHtlcToThemSpent
        | Input::BitcoinHtlcToThemTimeout
        | Input::BitcoinHtlcSpendDone
        | Input::BitcoinCloseDone
        | Input::BitcoinSpendOursDone
        | Input::BitcoinSpendTheirsDone
        | Input::BitcoinStealDone
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn wait_for_commit_sig(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::PktOpenCommitSig => {
            let pkt = match idata {
                InputData::Pkt(Pkt::OpenCommitSig(pkt)) => pkt,
                _ => return internal(peer, input),
            };
            match accept::accept_pkt_open_commit_sig(peer, pkt, &*ctx) {
                Err(err) => {
                    release_unbroadcast_anchor(peer, ctx);
                    protocol_violation(peer, ctx, err)
                }
                Ok(()) => {
                    if let Some(anchor) = &mut peer.anchor {
                        anchor.live = true;
                    }
                    peer.state = ChannelState::OpenWaitingOurAnchor;
                    ctx.watch_anchor(
                        peer,
                        Input::BitcoinAnchorDepthOk,
                        Input::None,
                        Input::BitcoinAnchorUnspent,
                        Input::BitcoinAnchorTheySpent,
                        Input::BitcoinAnchorOtherSpent,
                    );
                    let anchor_tx = ctx.anchor_tx(peer);
                    Outcome::broadcast(CommandStatus::None, anchor_tx)
                }
            }
        }
        Input::PktError => {
            release_unbroadcast_anchor(peer, ctx);
            peer_error(peer, ctx)
        }
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenComplete
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation
        | Input::PktCloseClearing
        | Input::PktCloseSignature => {
            release_unbroadcast_anchor(peer, ctx);
            unexpected_pkt(peer, idata, ctx)
        }
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
        Input::BitcoinAnchorCreated
        | Input::BitcoinAnchorDepthOk
        | Input::BitcoinAnchorTimeout
        | Input::BitcoinAnchorUnspent
        | Input::BitcoinAnchorTheySpent
        | Input::BitcoinAnchorOtherSpent
        | Input::BitcoinCommitDelayPassed
        | Input::BitcoinHtlcToUsTimeout
        | Input::BitcoinHtlcToThemSpent
        | Input::BitcoinHtlcToThemTimeout
        | Input::BitcoinHtlcSpendDone
        | Input::BitcoinCloseDone
        | Input::BitcoinSpendOursDone
        | Input::BitcoinSpendTheirsDone
        | Input::BitcoinStealDone
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn waiting_anchor_depth(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let ours = matches!(
        peer.state(),
        ChannelState::OpenWaitingOurAnchor
            | ChannelState::OpenWaitingOurAnchorTheyCompleted
    );
    let they_completed = matches!(
        peer.state(),
        ChannelState::OpenWaitingOurAnchorTheyCompleted
            | ChannelState::OpenWaitingTheirAnchorTheyCompleted
    );
    match input {
        Input::BitcoinAnchorDepthOk => {
            let timeout = if ours {
                Input::None
            } else {
                Input::BitcoinAnchorTimeout
            };
            ctx.unwatch_anchor_depth(
                peer,
                Input::BitcoinAnchorDepthOk,
                timeout,
            );
            ctx.queue_pkt_open_complete(peer);
            if they_completed {
                succeed_open(peer)
            } else {
                peer.state = if ours {
                    ChannelState::OpenWaitForCompleteOurAnchor
                } else {
                    ChannelState::OpenWaitForCompleteTheirAnchor
                };
                Outcome::none()
            }
        }
        Input::PktOpenComplete => {
            let pkt = match idata {
                InputData::Pkt(Pkt::OpenComplete(pkt)) => pkt,
                _ => return internal(peer, input),
            };
            match accept::accept_pkt_open_complete(peer, pkt) {
                Err(err) => protocol_violation(peer, ctx, err),
                Ok(()) => {
                    if !they_completed {
                        peer.state = if ours {
                            ChannelState::OpenWaitingOurAnchorTheyCompleted
                        } else {
                            ChannelState::OpenWaitingTheirAnchorTheyCompleted
                        };
                    }
                    Outcome::none()
                }
            }
        }
        Input::BitcoinAnchorTimeout => {
            if ours {
                // we never register a timeout for our own anchor
                internal(peer, input)
            } else {
                if let Some(anchor) = &mut peer.anchor {
                    anchor.live = false;
                }
                goto_error(peer, ctx, ChannelState::ErrAnchorTimeout)
            }
        }
        Input::BitcoinAnchorUnspent => {
            if let Some(anchor) = &mut peer.anchor {
                anchor.live = false;
            }
            goto_error(peer, ctx, ChannelState::ErrAnchorLost)
        }
        Input::BitcoinAnchorTheySpent => {
            super::onchain::their_spend(peer, idata, ctx)
        }
        Input::BitcoinAnchorOtherSpent => {
            super::onchain::other_spend(peer, idata, ctx)
        }
        Input::PktError => peer_error(peer, ctx),
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation
        | Input::PktCloseClearing
        | Input::PktCloseSignature => unexpected_pkt(peer, idata, ctx),
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
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
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}

pub(super) fn wait_for_complete(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let ours = peer.state() == ChannelState::OpenWaitForCompleteOurAnchor;
    match input {
        Input::PktOpenComplete => {
            let pkt = match idata {
                InputData::Pkt(Pkt::OpenComplete(pkt)) => pkt,
                _ => return internal(peer, input),
            };
            match accept::accept_pkt_open_complete(peer, pkt) {
                Err(err) => protocol_violation(peer, ctx, err),
                Ok(()) => succeed_open(peer),
            }
        }
        // depth was already acknowledged; a late notification is harmless
        Input::BitcoinAnchorDepthOk => Outcome::none(),
        Input::BitcoinAnchorTimeout => {
            if ours {
                internal(peer, input)
            } else {
                Outcome::none()
            }
        }
        Input::BitcoinAnchorUnspent => {
            if let Some(anchor) = &mut peer.anchor {
                anchor.live = false;
            }
            goto_error(peer, ctx, ChannelState::ErrAnchorLost)
        }
        Input::BitcoinAnchorTheySpent => {
            super::onchain::their_spend(peer, idata, ctx)
        }
        Input::BitcoinAnchorOtherSpent => {
            super::onchain::other_spend(peer, idata, ctx)
        }
        Input::PktError => peer_error(peer, ctx),
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc
        | Input::PktUpdateCommit
        | Input::PktUpdateRevocation
        | Input::PktCloseClearing
        | Input::PktCloseSignature => unexpected_pkt(peer, idata, ctx),
        Input::CmdOpenWithAnchor
        | Input::CmdOpenWithoutAnchor
        | Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail
        | Input::CmdClose => reject_command(),
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
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}
