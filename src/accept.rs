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

//! Packet acceptors.
//!
//! Each `accept_pkt_*` validates one packet kind against the peer context
//! and, on success, stages the packet data into it. A failed validation
//! leaves the context untouched and returns an [`AcceptError`] whose display
//! text becomes the diagnostic of the error packet sent back.

use amplify::{Slice32, Wrapper};
use bitcoin::hashes::{sha256, Hash};
use bitcoin_scripts::hlc::HashLock;

use crate::effects::Collaborators;
use crate::htlc::{Change, ChangeKind, Htlc, HtlcRef, HtlcState, Party};
use crate::messages::{
    AnchorOffer, CloseClearing, CloseSignature, Open, OpenAnchor,
    OpenCommitSig, OpenComplete, UpdateAddHtlc, UpdateCommit, UpdateFailHtlc,
    UpdateFulfillHtlc, UpdateRevocation,
};
use crate::peer::{Anchor, ChannelParams, CloseNegotiation, Peer};
use crate::state::ChannelState;

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest `to_self_delay` we tolerate from a counterparty, in blocks.
pub const MAX_TO_SELF_DELAY: u16 = 250;

/// Largest anchor confirmation depth a counterparty may require.
pub const MAX_MIN_DEPTH: u32 = 100;

/// Smallest anchor we accept funding a channel with, in satoshi.
pub const MIN_FUNDING_SAT: u64 = 10_000;

/// Largest channel reserve a counterparty may require, in satoshi.
pub const MAX_RESERVE_SAT: u64 = 1_000_000;

/// Upper bound for HTLC expiries, mirroring the consensus locktime split.
pub const MAX_CLTV_EXPIRY: u32 = 500_000_000;

/// Validation failures of incoming packets.
///
/// The display text is diagnostic only: it travels to the counterparty
/// inside an error packet and carries no protocol semantics.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum AcceptError {
    /// unknown protocol version {0}
    VersionUnknown(u16),

    /// both sides offer to create the channel anchor
    BothOfferAnchor,

    /// neither side offers to create the channel anchor
    NoAnchorOffered,

    /// zero commitment fee rate proposed
    ZeroFeeRate,

    /// required anchor depth {proposed} exceeds the maximum of
    /// {allowed_maximum} we tolerate
    UnreasonableMinDepth {
        proposed: u32,
        allowed_maximum: u32,
    },

    /// proposed `to_self_delay` of {proposed} blocks exceeds our limit of
    /// {allowed_maximum}
    ToSelfDelayUnreasonablyLarge {
        proposed: u16,
        allowed_maximum: u16,
    },

    /// required reserve of {proposed} sat exceeds our limit of
    /// {allowed_maximum} sat
    ReserveUnreasonable {
        proposed: u64,
        allowed_maximum: u64,
    },

    /// anchor of {proposed} sat is below the required minimum of
    /// {required_minimum} sat
    AnchorAmountTooSmall {
        proposed: u64,
        required_minimum: u64,
    },

    /// anchor announcement carries an empty channel script
    AnchorScriptMissing,

    /// signature over our commitment transaction is invalid
    CommitSigInvalid,

    /// HTLC of {proposed} msat is below our minimum of {required_minimum}
    /// msat
    HtlcAmountTooSmall {
        proposed: u64,
        required_minimum: u64,
    },

    /// HTLC amount {0} msat exceeds the 32-bit millisatoshi bound
    HtlcAmountOverflow(u64),

    /// HTLC id {proposed} does not exceed the previous id {previous}
    HtlcIdNonMonotonic { proposed: u64, previous: u64 },

    /// HTLC expiry {0} is outside the acceptable block height range
    HtlcCltvOutOfBounds(u32),

    /// number of in-flight HTLCs would exceed our limit of {0}
    TooManyHtlcs(u16),

    /// total in-flight HTLC value would exceed our limit of {0} msat
    HtlcValueInFlightExceeded(u64),

    /// {0} references no HTLC known to the channel
    UnknownHtlc(HtlcRef),

    /// {0} is not in a committed state and cannot be settled
    HtlcNotCommitted(HtlcRef),

    /// preimage does not hash to the hashlock of htlc {0}
    PreimageMismatch(u64),

    /// commitment covering no changes
    EmptyCommitment,

    /// revocation received without an outstanding commitment of ours
    RevocationWithoutCommitment,

    /// revealed secret does not match the revocation hash of the
    /// commitment being revoked
    RevocationSecretMismatch,

    /// close signature received while HTLCs are still committed
    CloseWithHtlcs,

    /// close fee of {0} sat is unacceptable
    CloseFeeUnacceptable(u64),

    /// signature over the mutual close transaction is invalid
    CloseSigInvalid,
}

fn preimage_matches(secret: Slice32, hash: Slice32) -> bool {
    let digest = sha256::Hash::hash(secret.as_inner());
    Slice32::from(digest.into_inner()) == hash
}

/// Validates their channel opening proposal and stages their parameters.
pub fn accept_pkt_open(peer: &mut Peer, pkt: &Open) -> Result<(), AcceptError> {
    if pkt.version != PROTOCOL_VERSION {
        return Err(AcceptError::VersionUnknown(pkt.version));
    }
    let we_fund = peer.state() != ChannelState::OpenWaitForOpenNoAnchor;
    match (we_fund, pkt.anchor_offer) {
        (true, AnchorOffer::WillCreateAnchor) => {
            return Err(AcceptError::BothOfferAnchor)
        }
        (false, AnchorOffer::WontCreateAnchor) => {
            return Err(AcceptError::NoAnchorOffered)
        }
        (true, AnchorOffer::WontCreateAnchor)
        | (false, AnchorOffer::WillCreateAnchor) => {}
    }
    if pkt.commit_fee_rate == 0 {
        return Err(AcceptError::ZeroFeeRate);
    }
    if pkt.min_depth > MAX_MIN_DEPTH {
        return Err(AcceptError::UnreasonableMinDepth {
            proposed: pkt.min_depth,
            allowed_maximum: MAX_MIN_DEPTH,
        });
    }
    if pkt.to_self_delay > MAX_TO_SELF_DELAY {
        return Err(AcceptError::ToSelfDelayUnreasonablyLarge {
            proposed: pkt.to_self_delay,
            allowed_maximum: MAX_TO_SELF_DELAY,
        });
    }
    if pkt.reserve_sat > MAX_RESERVE_SAT {
        return Err(AcceptError::ReserveUnreasonable {
            proposed: pkt.reserve_sat,
            allowed_maximum: MAX_RESERVE_SAT,
        });
    }

    peer.remote_params = Some(ChannelParams {
        commit_fee_rate: pkt.commit_fee_rate,
        min_depth: pkt.min_depth,
        reserve_sat: pkt.reserve_sat,
        to_self_delay: pkt.to_self_delay,
        htlc_minimum_msat: pkt.htlc_minimum_msat,
        max_htlc_value_in_flight_msat: pkt.max_htlc_value_in_flight_msat,
        max_accepted_htlcs: pkt.max_accepted_htlcs,
    });
    peer.remote_commit.revocation_hash = pkt.next_revocation_hash;
    Ok(())
}

/// Validates their anchor announcement and stages the anchor record.
pub fn accept_pkt_anchor(
    peer: &mut Peer,
    pkt: &OpenAnchor,
) -> Result<(), AcceptError> {
    if pkt.amount < MIN_FUNDING_SAT {
        return Err(AcceptError::AnchorAmountTooSmall {
            proposed: pkt.amount,
            required_minimum: MIN_FUNDING_SAT,
        });
    }
    if pkt.script_pubkey.is_empty() {
        return Err(AcceptError::AnchorScriptMissing);
    }

    peer.anchor = Some(Anchor {
        txid: pkt.txid,
        vout: pkt.output_index,
        satoshis: pkt.amount,
        ours: false,
        min_depth: peer.local_params.min_depth,
        live: true,
    });
    Ok(())
}

/// Validates their signature over our first commitment and stores it.
pub fn accept_pkt_open_commit_sig(
    peer: &mut Peer,
    pkt: &OpenCommitSig,
    ctx: &dyn Collaborators,
) -> Result<(), AcceptError> {
    let commit_tx = ctx.commit_tx(peer);
    if !ctx.check_commit_sig(peer, &commit_tx, &pkt.commit_sig) {
        return Err(AcceptError::CommitSigInvalid);
    }
    peer.local_commit.txid = Some(commit_tx.txid());
    peer.local_commit.sig = Some(pkt.commit_sig);
    Ok(())
}

/// Validates their opening completion announcement.
pub fn accept_pkt_open_complete(
    _peer: &mut Peer,
    _pkt: &OpenComplete,
) -> Result<(), AcceptError> {
    // The packet carries no fields to validate
    Ok(())
}

/// Validates a new incoming HTLC and stages it on our next commitment.
pub fn accept_pkt_htlc_add(
    peer: &mut Peer,
    pkt: &UpdateAddHtlc,
) -> Result<(), AcceptError> {
    let params = peer.local_params;
    if pkt.amount_msat == 0 || pkt.amount_msat < params.htlc_minimum_msat {
        return Err(AcceptError::HtlcAmountTooSmall {
            proposed: pkt.amount_msat,
            required_minimum: params.htlc_minimum_msat,
        });
    }
    if pkt.amount_msat.leading_zeros() < 32 {
        return Err(AcceptError::HtlcAmountOverflow(pkt.amount_msat));
    }
    if let Some(previous) = peer.last_remote_htlc_id {
        if pkt.id <= previous {
            return Err(AcceptError::HtlcIdNonMonotonic {
                proposed: pkt.id,
                previous,
            });
        }
    }
    if pkt.cltv_expiry == 0 || pkt.cltv_expiry > MAX_CLTV_EXPIRY {
        return Err(AcceptError::HtlcCltvOutOfBounds(pkt.cltv_expiry));
    }
    if peer.inflight_count(Party::Remote)
        >= params.max_accepted_htlcs as usize
    {
        return Err(AcceptError::TooManyHtlcs(params.max_accepted_htlcs));
    }
    if peer.inflight_msat(Party::Remote) + pkt.amount_msat
        > params.max_htlc_value_in_flight_msat
    {
        return Err(AcceptError::HtlcValueInFlightExceeded(
            params.max_htlc_value_in_flight_msat,
        ));
    }

    peer.received.insert(pkt.id, Htlc {
        id: pkt.id,
        direction: Party::Remote,
        amount_msat: pkt.amount_msat,
        payment_hash: pkt.payment_hash,
        cltv_expiry: pkt.cltv_expiry,
        state: HtlcState::ProposedByThem,
    });
    peer.changes
        .push(Change::new(ChangeKind::Add { id: pkt.id }, Party::Remote));
    peer.last_remote_htlc_id = Some(pkt.id);
    Ok(())
}

/// Validates their failure of an HTLC we offered and stages the removal.
pub fn accept_pkt_htlc_fail(
    peer: &mut Peer,
    pkt: &UpdateFailHtlc,
) -> Result<(), AcceptError> {
    let htlc_ref = HtlcRef {
        side: Party::Local,
        id: pkt.id,
    };
    let htlc = peer
        .htlc(htlc_ref)
        .copied()
        .ok_or(AcceptError::UnknownHtlc(htlc_ref))?;
    if htlc.state != HtlcState::Committed {
        return Err(AcceptError::HtlcNotCommitted(htlc_ref));
    }

    if let Some(htlc) = peer.htlc_mut(htlc_ref) {
        htlc.state = HtlcState::Failing;
    }
    peer.changes
        .push(Change::new(ChangeKind::Fail { id: pkt.id }, Party::Remote));
    Ok(())
}

/// Validates their fulfilment of an HTLC we offered, capturing the
/// preimage, and stages the removal.
pub fn accept_pkt_htlc_fulfill(
    peer: &mut Peer,
    pkt: &UpdateFulfillHtlc,
) -> Result<(), AcceptError> {
    let htlc_ref = HtlcRef {
        side: Party::Local,
        id: pkt.id,
    };
    let htlc = peer
        .htlc(htlc_ref)
        .copied()
        .ok_or(AcceptError::UnknownHtlc(htlc_ref))?;
    if htlc.state != HtlcState::Committed {
        return Err(AcceptError::HtlcNotCommitted(htlc_ref));
    }
    if HashLock::from(pkt.payment_preimage) != htlc.payment_hash {
        return Err(AcceptError::PreimageMismatch(pkt.id));
    }

    if let Some(htlc) = peer.htlc_mut(htlc_ref) {
        htlc.state = HtlcState::Fulfilling {
            preimage: pkt.payment_preimage,
        };
    }
    peer.changes.push(Change::new(
        ChangeKind::Fulfill {
            id: pkt.id,
            preimage: pkt.payment_preimage,
        },
        Party::Remote,
    ));
    Ok(())
}

/// Validates their signature over our next commitment built from staged
/// changes and rotates our commitment generation.
pub fn accept_pkt_commit(
    peer: &mut Peer,
    pkt: &UpdateCommit,
    ctx: &dyn Collaborators,
) -> Result<(), AcceptError> {
    if !peer.changes.iter().any(|change| !change.in_local_commit) {
        return Err(AcceptError::EmptyCommitment);
    }
    let commit_tx = ctx.commit_tx(peer);
    if !ctx.check_commit_sig(peer, &commit_tx, &pkt.commit_sig) {
        return Err(AcceptError::CommitSigInvalid);
    }

    peer.local_commit.number += 1;
    peer.local_commit.txid = Some(commit_tx.txid());
    peer.local_commit.sig = Some(pkt.commit_sig);
    peer.mark_local_commit();
    Ok(())
}

/// Validates their revocation of the previous remote commitment, records
/// the revealed secret for cheat punishment and advances their generation.
pub fn accept_pkt_revocation(
    peer: &mut Peer,
    pkt: &UpdateRevocation,
) -> Result<(), AcceptError> {
    if !peer.awaiting_revocation {
        return Err(AcceptError::RevocationWithoutCommitment);
    }
    if !preimage_matches(
        pkt.revocation_secret,
        peer.remote_commit.revocation_hash,
    ) {
        return Err(AcceptError::RevocationSecretMismatch);
    }

    peer.revocations
        .insert(peer.remote_commit.number, pkt.revocation_secret);
    peer.remote_commit.number += 1;
    peer.remote_commit.revocation_hash = pkt.next_revocation_hash;
    peer.awaiting_revocation = false;
    peer.mark_remote_commit();
    Ok(())
}

/// Validates their clearing announcement and stages their close script.
pub fn accept_pkt_close_clearing(
    peer: &mut Peer,
    pkt: &CloseClearing,
) -> Result<(), AcceptError> {
    let close = peer.close.get_or_insert(CloseNegotiation {
        our_fee: 0,
        their_fee: None,
        their_sig: None,
        matched: false,
        their_script: None,
    });
    close.their_script = Some(pkt.script_pubkey.clone());
    Ok(())
}

/// Validates their mutual close signature. On success stores their offer
/// and sets `matches` to whether their fee equals ours.
pub fn accept_pkt_close_sig(
    peer: &mut Peer,
    pkt: &CloseSignature,
    ctx: &dyn Collaborators,
) -> Result<bool, AcceptError> {
    if peer.committed_to_htlcs() {
        return Err(AcceptError::CloseWithHtlcs);
    }
    if pkt.close_fee == 0 {
        return Err(AcceptError::CloseFeeUnacceptable(pkt.close_fee));
    }
    let close_tx = ctx.close_tx(peer, pkt.close_fee);
    if !ctx.check_close_sig(peer, &close_tx, pkt.close_fee, &pkt.sig) {
        return Err(AcceptError::CloseSigInvalid);
    }

    let our_fee = match &peer.close {
        Some(close) => close.our_fee,
        None => ctx.calculate_close_fee(peer),
    };
    let matches = pkt.close_fee == our_fee;
    let close = peer.close.get_or_insert(CloseNegotiation {
        our_fee,
        their_fee: None,
        their_sig: None,
        matched: false,
        their_script: None,
    });
    close.their_fee = Some(pkt.close_fee);
    close.their_sig = Some(pkt.sig);
    if matches {
        close.matched = true;
    }
    Ok(matches)
}

#[cfg(test)]
mod test {
    use bitcoin_scripts::hlc::HashPreimage;

    use super::*;
    fn peer_waiting_their_open() -> Peer {
        let mut peer = Peer::new(ChannelParams::default());
        peer.state = ChannelState::OpenWaitForOpenNoAnchor;
        peer
    }

    fn open_pkt() -> Open {
        Open {
            version: PROTOCOL_VERSION,
            anchor_offer: AnchorOffer::WillCreateAnchor,
            commit_fee_rate: 253,
            min_depth: 3,
            reserve_sat: 10_000,
            to_self_delay: 144,
            htlc_minimum_msat: 1000,
            max_htlc_value_in_flight_msat: 5_000_000_000,
            max_accepted_htlcs: 30,
            next_revocation_hash: Slice32::from([7u8; 32]),
        }
    }

    fn add_pkt(id: u64, amount_msat: u64) -> UpdateAddHtlc {
        UpdateAddHtlc {
            id,
            amount_msat,
            payment_hash: HashLock::from(Slice32::from(
                sha256::Hash::hash(&[1u8; 32]).into_inner(),
            )),
            cltv_expiry: 500,
        }
    }

    #[test]
    fn open_records_remote_side() {
        let mut peer = peer_waiting_their_open();
        accept_pkt_open(&mut peer, &open_pkt()).unwrap();
        assert_eq!(
            peer.remote_commit.revocation_hash,
            Slice32::from([7u8; 32])
        );
        assert_eq!(peer.remote_params.unwrap().to_self_delay, 144);
    }

    #[test]
    fn open_rejects_anchor_role_conflict() {
        let mut peer = peer_waiting_their_open();
        let mut pkt = open_pkt();
        pkt.anchor_offer = AnchorOffer::WontCreateAnchor;
        assert_eq!(
            accept_pkt_open(&mut peer, &pkt),
            Err(AcceptError::NoAnchorOffered)
        );

        peer.state = ChannelState::OpenWaitForOpenWithAnchor;
        pkt.anchor_offer = AnchorOffer::WillCreateAnchor;
        assert_eq!(
            accept_pkt_open(&mut peer, &pkt),
            Err(AcceptError::BothOfferAnchor)
        );
        assert!(peer.remote_params.is_none());
    }

    #[test]
    fn open_rejects_unreasonable_delay() {
        let mut peer = peer_waiting_their_open();
        let mut pkt = open_pkt();
        pkt.to_self_delay = 10_000;
        assert_eq!(
            accept_pkt_open(&mut peer, &pkt),
            Err(AcceptError::ToSelfDelayUnreasonablyLarge {
                proposed: 10_000,
                allowed_maximum: MAX_TO_SELF_DELAY,
            })
        );
    }

    #[test]
    fn htlc_add_enforces_monotonic_ids() {
        let mut peer = Peer::new(ChannelParams::default());
        peer.state = ChannelState::Normal;
        accept_pkt_htlc_add(&mut peer, &add_pkt(0, 10_000)).unwrap();
        assert_eq!(
            accept_pkt_htlc_add(&mut peer, &add_pkt(0, 10_000)),
            Err(AcceptError::HtlcIdNonMonotonic {
                proposed: 0,
                previous: 0
            })
        );
        accept_pkt_htlc_add(&mut peer, &add_pkt(5, 10_000)).unwrap();
        assert_eq!(peer.last_remote_htlc_id, Some(5));
        assert_eq!(peer.changes.len(), 2);
    }

    #[test]
    fn htlc_add_enforces_limits() {
        let mut peer = Peer::new(ChannelParams::default());
        peer.local_params.max_accepted_htlcs = 1;
        accept_pkt_htlc_add(&mut peer, &add_pkt(0, 10_000)).unwrap();
        assert_eq!(
            accept_pkt_htlc_add(&mut peer, &add_pkt(1, 10_000)),
            Err(AcceptError::TooManyHtlcs(1))
        );
        assert_eq!(
            accept_pkt_htlc_add(&mut peer, &add_pkt(1, 10)),
            Err(AcceptError::HtlcAmountTooSmall {
                proposed: 10,
                required_minimum: 1000
            })
        );
        assert_eq!(
            accept_pkt_htlc_add(&mut peer, &add_pkt(1, 1 << 33)),
            Err(AcceptError::HtlcAmountOverflow(1 << 33))
        );
    }

    #[test]
    fn fulfill_requires_matching_preimage() {
        let mut peer = Peer::new(ChannelParams::default());
        let preimage = HashPreimage::from(Slice32::from([3u8; 32]));
        peer.offered.insert(0, Htlc {
            id: 0,
            direction: Party::Local,
            amount_msat: 5000,
            payment_hash: HashLock::from(preimage),
            cltv_expiry: 500,
            state: HtlcState::Committed,
        });

        let bad = UpdateFulfillHtlc {
            id: 0,
            payment_preimage: HashPreimage::from(Slice32::from([4u8; 32])),
        };
        assert_eq!(
            accept_pkt_htlc_fulfill(&mut peer, &bad),
            Err(AcceptError::PreimageMismatch(0))
        );

        let good = UpdateFulfillHtlc {
            id: 0,
            payment_preimage: preimage,
        };
        accept_pkt_htlc_fulfill(&mut peer, &good).unwrap();
        assert_eq!(peer.offered[&0].state, HtlcState::Fulfilling {
            preimage
        });
    }

    #[test]
    fn fail_requires_known_committed_htlc() {
        let mut peer = Peer::new(ChannelParams::default());
        let htlc_ref = HtlcRef {
            side: Party::Local,
            id: 9,
        };
        assert_eq!(
            accept_pkt_htlc_fail(&mut peer, &UpdateFailHtlc {
                id: 9,
                reason: "no route".to_string()
            }),
            Err(AcceptError::UnknownHtlc(htlc_ref))
        );
    }

    #[test]
    fn revocation_checks_secret_chain() {
        let mut peer = Peer::new(ChannelParams::default());
        let secret = Slice32::from([5u8; 32]);
        let hash = Slice32::from(
            sha256::Hash::hash(secret.as_inner()).into_inner(),
        );
        peer.remote_commit.revocation_hash = hash;
        peer.awaiting_revocation = true;
        peer.remote_commit.number = 2;

        let bad = UpdateRevocation {
            revocation_secret: Slice32::from([6u8; 32]),
            next_revocation_hash: Slice32::default(),
        };
        assert_eq!(
            accept_pkt_revocation(&mut peer, &bad),
            Err(AcceptError::RevocationSecretMismatch)
        );

        let good = UpdateRevocation {
            revocation_secret: secret,
            next_revocation_hash: Slice32::from([8u8; 32]),
        };
        accept_pkt_revocation(&mut peer, &good).unwrap();
        assert_eq!(peer.revocations[&2], secret);
        assert_eq!(peer.remote_commit.number, 3);
        assert_eq!(
            peer.remote_commit.revocation_hash,
            Slice32::from([8u8; 32])
        );
        assert!(!peer.awaiting_revocation);

        peer.awaiting_revocation = false;
        assert_eq!(
            accept_pkt_revocation(&mut peer, &good),
            Err(AcceptError::RevocationWithoutCommitment)
        );
    }
}
