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

//! Normal operation: HTLC proposals and commit/revoke rounds.
//!
//! Each commitment (in either direction) covers every staged change not yet
//! in that commitment. Our `update_commit` stays outstanding until their
//! revocation arrives; a change settles once both commitments reflect it,
//! which is also when a send command reports success.

use bitcoin_scripts::hlc::HashLock;

use super::{
    internal, peer_error, protocol_violation, reject_command,
    resolve_settled_command, stale_anchor_timeout, unexpected_pkt,
};
use crate::accept;
use crate::command::{Command, CommandStatus};
use crate::effects::{Collaborators, Outcome};
use crate::htlc::{
    Change, ChangeKind, Htlc, HtlcProgress, HtlcRef, HtlcState, Party,
};
use crate::input::{Input, InputData};
use crate::messages::Pkt;
use crate::peer::Peer;
use crate::state::ChannelState;

/// Queues our `update_commit` if we owe the counterparty one and no round
/// is already outstanding.
pub(super) fn maybe_send_commit(peer: &mut Peer, ctx: &mut dyn Collaborators) {
    if !peer.awaiting_revocation() && peer.changes_pending_remote() {
        peer.begin_remote_commit();
        peer.awaiting_revocation = true;
        ctx.queue_pkt_commit(peer);
    }
}

/// Their `update_commit`: validate, rotate our commitment, reply with our
/// revocation and, if we owe them changes, our own commitment.
pub(super) fn handle_commit(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let pkt = match idata {
        InputData::Pkt(Pkt::UpdateCommit(pkt)) => pkt,
        _ => return internal(peer, Input::PktUpdateCommit),
    };
    match accept::accept_pkt_commit(peer, pkt, &*ctx) {
        Err(err) => protocol_violation(peer, ctx, err),
        Ok(()) => {
            ctx.queue_pkt_revocation(peer);
            peer.drain_settled_changes();
            let status = resolve_settled_command(peer);
            maybe_send_commit(peer, ctx);
            Outcome::status(status)
        }
    }
}

/// Their `update_revocation`: validate the revealed secret, advance their
/// commitment generation and settle the changes our commitment carried.
pub(super) fn handle_revocation(
    peer: &mut Peer,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let pkt = match idata {
        InputData::Pkt(Pkt::UpdateRevocation(pkt)) => pkt,
        _ => return internal(peer, Input::PktUpdateRevocation),
    };
    match accept::accept_pkt_revocation(peer, pkt) {
        Err(err) => protocol_violation(peer, ctx, err),
        Ok(()) => {
            peer.drain_settled_changes();
            let status = resolve_settled_command(peer);
            maybe_send_commit(peer, ctx);
            Outcome::status(status)
        }
    }
}

/// Their `update_add_htlc`/`update_fulfill_htlc`/`update_fail_htlc`.
pub(super) fn handle_update_pkt(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    let result = match (input, idata) {
        (Input::PktUpdateAddHtlc, InputData::Pkt(Pkt::UpdateAddHtlc(pkt))) => {
            accept::accept_pkt_htlc_add(peer, pkt)
        }
        (
            Input::PktUpdateFulfillHtlc,
            InputData::Pkt(Pkt::UpdateFulfillHtlc(pkt)),
        ) => accept::accept_pkt_htlc_fulfill(peer, pkt),
        (
            Input::PktUpdateFailHtlc,
            InputData::Pkt(Pkt::UpdateFailHtlc(pkt)),
        ) => accept::accept_pkt_htlc_fail(peer, pkt),
        _ => return internal(peer, input),
    };
    match result {
        Err(err) => protocol_violation(peer, ctx, err),
        Ok(()) => Outcome::none(),
    }
}

/// A send command: stage the change, emit the update packet and commit.
fn send_update(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    if peer.current_cmd().is_some() {
        return reject_command();
    }
    let cmd = match idata {
        InputData::Cmd(cmd) => cmd.clone(),
        _ => return internal(peer, input),
    };
    let (kind, htlc) = match (input, &cmd) {
        (Input::CmdSendHtlcAdd, Command::SendHtlcAdd(add)) => {
            let id = peer.next_htlc_id;
            let htlc = Htlc {
                id,
                direction: Party::Local,
                amount_msat: add.amount_msat,
                payment_hash: add.payment_hash,
                cltv_expiry: add.cltv_expiry,
                state: HtlcState::ProposedByUs,
            };
            peer.next_htlc_id += 1;
            peer.offered.insert(id, htlc);
            (ChangeKind::Add { id }, htlc)
        }
        (Input::CmdSendHtlcFulfill, Command::SendHtlcFulfill(fulfill)) => {
            let href = HtlcRef {
                side: Party::Remote,
                id: fulfill.id,
            };
            let htlc = match peer.htlc(href).copied() {
                Some(htlc) if htlc.state == HtlcState::Committed => htlc,
                _ => return reject_command(),
            };
            if HashLock::from(fulfill.payment_preimage) != htlc.payment_hash
            {
                return reject_command();
            }
            let preimage = fulfill.payment_preimage;
            if let Some(htlc) = peer.htlc_mut(href) {
                htlc.state = HtlcState::Fulfilling { preimage };
            }
            (
                ChangeKind::Fulfill {
                    id: fulfill.id,
                    preimage,
                },
                htlc,
            )
        }
        (Input::CmdSendHtlcFail, Command::SendHtlcFail(fail)) => {
            let href = HtlcRef {
                side: Party::Remote,
                id: fail.id,
            };
            let htlc = match peer.htlc(href).copied() {
                Some(htlc) if htlc.state == HtlcState::Committed => htlc,
                _ => return reject_command(),
            };
            if let Some(htlc) = peer.htlc_mut(href) {
                htlc.state = HtlcState::Failing;
            }
            (ChangeKind::Fail { id: fail.id }, htlc)
        }
        _ => return internal(peer, input),
    };

    let change = Change::new(kind, Party::Local);
    peer.changes.push(change);
    peer.current_cmd = Some(cmd);
    peer.cmd_htlc = Some(change.htlc_ref());
    let progress = HtlcProgress { kind, htlc };
    match kind {
        ChangeKind::Add { .. } => ctx.queue_pkt_htlc_add(peer, &progress),
        ChangeKind::Fulfill { .. } => {
            ctx.queue_pkt_htlc_fulfill(peer, &progress)
        }
        ChangeKind::Fail { .. } => ctx.queue_pkt_htlc_fail(peer, &progress),
    }
    maybe_send_commit(peer, ctx);
    Outcome::status(CommandStatus::InProgress)
}

pub(super) fn run(
    peer: &mut Peer,
    input: Input,
    idata: &InputData,
    ctx: &mut dyn Collaborators,
) -> Outcome {
    match input {
        Input::CmdSendHtlcAdd
        | Input::CmdSendHtlcFulfill
        | Input::CmdSendHtlcFail => send_update(peer, input, idata, ctx),
        Input::CmdClose => {
            if peer.current_cmd().is_some() {
                return reject_command();
            }
            peer.current_cmd = Some(Command::Close);
            peer.state = ChannelState::UsClearing;
            ctx.queue_pkt_close_clearing(peer);
            Outcome::status(CommandStatus::InProgress)
        }
        Input::CmdOpenWithAnchor | Input::CmdOpenWithoutAnchor => {
            reject_command()
        }
        Input::PktUpdateAddHtlc
        | Input::PktUpdateFulfillHtlc
        | Input::PktUpdateFailHtlc => {
            handle_update_pkt(peer, input, idata, ctx)
        }
        Input::PktUpdateCommit => handle_commit(peer, idata, ctx),
        Input::PktUpdateRevocation => handle_revocation(peer, idata, ctx),
        Input::PktCloseClearing => {
            let pkt = match idata {
                InputData::Pkt(Pkt::CloseClearing(pkt)) => pkt,
                _ => return internal(peer, input),
            };
            match accept::accept_pkt_close_clearing(peer, pkt) {
                Err(err) => protocol_violation(peer, ctx, err),
                Ok(()) => {
                    peer.state = ChannelState::BothClearing;
                    ctx.queue_pkt_close_clearing(peer);
                    super::closing::after_both_clearing(peer, ctx);
                    Outcome::none()
                }
            }
        }
        Input::PktError => peer_error(peer, ctx),
        Input::PktOpen
        | Input::PktOpenAnchor
        | Input::PktOpenCommitSig
        | Input::PktOpenComplete
        | Input::PktCloseSignature => unexpected_pkt(peer, idata, ctx),
        Input::BitcoinAnchorTheySpent => {
            super::onchain::their_spend(peer, idata, ctx)
        }
        Input::BitcoinAnchorOtherSpent => {
            super::onchain::other_spend(peer, idata, ctx)
        }
        Input::BitcoinAnchorUnspent => {
            if let Some(anchor) = &mut peer.anchor {
                anchor.live = false;
            }
            super::goto_error(peer, ctx, ChannelState::ErrAnchorLost)
        }
        // late depth notifications straggle after the open handshake
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
        | Input::HtlcsCleared
        | Input::CloseCompleteTimeout
        | Input::AllHtlcsDone => internal(peer, input),
        Input::None => Outcome::none(),
    }
}
