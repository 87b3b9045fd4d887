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

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use amplify::ToYamlString;
#[cfg(feature = "serde")]
use serde_with::{As, DisplayFromStr, Same};

use amplify::{DumbDefault, Slice32};
use bitcoin::{Script, Transaction, Txid};
use secp256k1::ecdsa::Signature;

use crate::command::Command;
use crate::htlc::{Change, ChangeKind, Htlc, HtlcRef, HtlcState, Party};
use crate::state::ChannelState;

/// Channel parameters of one side, negotiated during the opening handshake.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct ChannelParams {
    /// Fee rate used for commitment transactions, satoshi per kiloweight
    pub commit_fee_rate: u64,

    /// Anchor confirmation depth required before the channel activates
    pub min_depth: u32,

    /// Reserve the counterparty keeps unencumbered, in satoshi
    pub reserve_sat: u64,

    /// Blocks to wait before claiming own funds after a unilateral close
    pub to_self_delay: u16,

    /// Smallest acceptable HTLC, in millisatoshi
    pub htlc_minimum_msat: u64,

    /// Upper bound on the total value of in-flight incoming HTLCs
    pub max_htlc_value_in_flight_msat: u64,

    /// Upper bound on the number of in-flight incoming HTLCs
    pub max_accepted_htlcs: u16,
}

impl Default for ChannelParams {
    /// Sets reasonable defaults for a small channel
    fn default() -> ChannelParams {
        ChannelParams {
            commit_fee_rate: 253,
            // three blocks is enough to get sufficient security
            min_depth: 3,
            reserve_sat: 10000,
            to_self_delay: 144,
            htlc_minimum_msat: 1000,
            max_htlc_value_in_flight_msat: 5_000_000_000,
            max_accepted_htlcs: 30,
        }
    }
}

/// The on-chain funding transaction output controlling the channel.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("anchor {txid}:{vout} ({satoshis} sat)")]
pub struct Anchor {
    /// Id of the anchor transaction
    pub txid: Txid,

    /// Output paying to the channel 2-of-2 script
    pub vout: u32,

    /// Value of the channel output, in satoshi
    pub satoshis: u64,

    /// Whether we created and funded the anchor
    pub ours: bool,

    /// Depth required before the channel activates
    pub min_depth: u32,

    /// Set once the anchor is broadcast (or announced by its creator) and
    /// under watch; a live anchor can be spent by our commitment
    pub live: bool,
}

/// One side's view of a commitment transaction generation.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct Commitment {
    /// Generation number, starting at zero for the first commitment
    pub number: u64,

    /// Id of the commitment transaction, once known
    pub txid: Option<Txid>,

    /// Counterparty signature (kept for our own commitment only)
    #[cfg_attr(feature = "serde", serde(with = "As::<Option<DisplayFromStr>>"))]
    pub sig: Option<Signature>,

    /// Hash whose preimage revokes this commitment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub revocation_hash: Slice32,
}

impl DumbDefault for Commitment {
    fn dumb_default() -> Self {
        Commitment {
            number: 0,
            txid: None,
            sig: None,
            revocation_hash: Slice32::default(),
        }
    }
}

/// Mutual close fee negotiation data; present only while clearing/closing.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct CloseNegotiation {
    /// Fee we currently offer, in satoshi
    pub our_fee: u64,

    /// Latest acceptable fee offered by them
    pub their_fee: Option<u64>,

    /// Their signature over the close transaction at `their_fee`
    #[cfg_attr(feature = "serde", serde(with = "As::<Option<DisplayFromStr>>"))]
    pub their_sig: Option<Signature>,

    /// Set once both sides signed the same fee
    pub matched: bool,

    /// Script they wish to be paid to, from their `close_clearing`
    pub their_script: Option<Script>,
}

/// Progress of an on-chain channel resolution: the machine reaches `Closed`
/// once the primary spend is buried and no HTLC watches remain.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct OnchainResolution {
    /// The resolution transaction (close, commitment spend or steal) is
    /// buried
    pub primary_buried: bool,

    /// No HTLC output or HTLC spend watches remain
    pub htlcs_done: bool,
}

impl OnchainResolution {
    /// True once nothing remains to watch.
    #[inline]
    pub fn is_complete(self) -> bool {
        self.primary_buried && self.htlcs_done
    }
}

/// An on-chain observation delivered by the chain watcher as the payload of
/// a `Bitcoin*` input.
#[derive(Clone, Debug)]
pub struct ChainEvent {
    /// The transaction the watch fired on
    pub tx: Transaction,

    /// Commitment generation the transaction was recognized as, if any
    pub commitment_number: Option<u64>,

    /// HTLC the event is scoped to, if any
    pub htlc_id: Option<u64>,
}

impl ChainEvent {
    /// Event for a transaction which is not a recognized commitment.
    pub fn tx(tx: Transaction) -> ChainEvent {
        ChainEvent {
            tx,
            commitment_number: None,
            htlc_id: None,
        }
    }
}

/// Per-channel mutable context, exclusively owned by the state machine
/// while a transition runs.
///
/// All protocol data lives here; the machine itself holds no state between
/// invocations. The [`PeerState`] snapshot captures every field for
/// persistence; replay is restore-then-feed-inputs-in-order.
#[derive(Getters, Clone, Debug)]
pub struct Peer {
    /// Current protocol state; mutated only by the transition function
    #[getter(as_copy)]
    pub(crate) state: ChannelState,

    /// Parameters we require from the counterparty
    pub(crate) local_params: ChannelParams,

    /// Parameters they require from us, from their `open`
    pub(crate) remote_params: Option<ChannelParams>,

    /// The channel anchor, once created or announced
    pub(crate) anchor: Option<Anchor>,

    /// Our commitment generation (their signature over it)
    pub(crate) local_commit: Commitment,

    /// Their commitment generation (their revocation hash for it)
    pub(crate) remote_commit: Commitment,

    /// Revocation secrets revealed by their revoke-acks, keyed by the
    /// revoked commitment number
    pub(crate) revocations: BTreeMap<u64, Slice32>,

    /// Staged changes not yet in a signed commitment on both sides
    pub(crate) changes: Vec<Change>,

    /// HTLCs offered by us, keyed by our id sequence
    pub(crate) offered: BTreeMap<u64, Htlc>,

    /// HTLCs offered by them, keyed by their id sequence
    pub(crate) received: BTreeMap<u64, Htlc>,

    /// Id for the next HTLC we offer
    #[getter(as_copy)]
    pub(crate) next_htlc_id: u64,

    /// Highest HTLC id they used so far; their ids must strictly increase
    pub(crate) last_remote_htlc_id: Option<u64>,

    /// Mutual close negotiation, present in the clearing/closing region
    pub(crate) close: Option<CloseNegotiation>,

    /// Set while our `update_commit` awaits their revocation
    #[getter(as_copy)]
    pub(crate) awaiting_revocation: bool,

    /// HTLCs covered by the outstanding `update_commit`
    pub(crate) committing: Vec<HtlcRef>,

    /// On-chain resolution progress, present in the on-chain region
    pub(crate) onchain: Option<OnchainResolution>,

    /// The command whose status the current protocol flow must resolve
    pub(crate) current_cmd: Option<Command>,

    /// HTLC the outstanding send command refers to
    pub(crate) cmd_htlc: Option<HtlcRef>,
}

impl Peer {
    /// Constructs a fresh channel context in the `Init` state.
    pub fn new(local_params: ChannelParams) -> Peer {
        Peer {
            state: ChannelState::Init,
            local_params,
            remote_params: None,
            anchor: None,
            local_commit: Commitment::dumb_default(),
            remote_commit: Commitment::dumb_default(),
            revocations: empty!(),
            changes: vec![],
            offered: empty!(),
            received: empty!(),
            next_htlc_id: 0,
            last_remote_htlc_id: None,
            close: None,
            awaiting_revocation: false,
            committing: vec![],
            onchain: None,
            current_cmd: None,
            cmd_htlc: None,
        }
    }

    /// Would a commitment transaction generated now carry HTLC outputs?
    pub fn committed_to_htlcs(&self) -> bool {
        self.offered
            .values()
            .chain(self.received.values())
            .any(|htlc| htlc.state.is_live())
    }

    /// Do we hold an acceptable close signature from them? An acceptable
    /// close transaction is preferred to any unilateral alternative.
    pub fn has_close_sig(&self) -> bool {
        self.close
            .as_ref()
            .map(|close| close.their_sig.is_some())
            .unwrap_or(false)
    }

    /// Looks up an HTLC on the side which offered it.
    pub fn htlc(&self, htlc_ref: HtlcRef) -> Option<&Htlc> {
        match htlc_ref.side {
            Party::Local => self.offered.get(&htlc_ref.id),
            Party::Remote => self.received.get(&htlc_ref.id),
        }
    }

    pub(crate) fn htlc_mut(&mut self, htlc_ref: HtlcRef) -> Option<&mut Htlc> {
        match htlc_ref.side {
            Party::Local => self.offered.get_mut(&htlc_ref.id),
            Party::Remote => self.received.get_mut(&htlc_ref.id),
        }
    }

    /// The anchor exists and is believed to be on-chain.
    pub(crate) fn anchor_is_live(&self) -> bool {
        self.anchor.as_ref().map(|anchor| anchor.live).unwrap_or(false)
    }

    /// Total millisatoshi of live HTLCs offered by the given side.
    pub(crate) fn inflight_msat(&self, side: Party) -> u64 {
        let map = match side {
            Party::Local => &self.offered,
            Party::Remote => &self.received,
        };
        map.values()
            .filter(|htlc| htlc.state.is_live())
            .map(|htlc| htlc.amount_msat)
            .sum()
    }

    /// Number of live HTLCs offered by the given side.
    pub(crate) fn inflight_count(&self, side: Party) -> usize {
        let map = match side {
            Party::Local => &self.offered,
            Party::Remote => &self.received,
        };
        map.values().filter(|htlc| htlc.state.is_live()).count()
    }

    /// Marks every staged change as included into our commitment. Returns
    /// the number of changes the new commitment covers; a commitment
    /// covering nothing is a protocol violation reported by the acceptor.
    pub(crate) fn mark_local_commit(&mut self) -> usize {
        let mut covered = 0;
        for change in &mut self.changes {
            if !change.in_local_commit {
                change.in_local_commit = true;
                covered += 1;
            }
        }
        covered
    }

    /// Records which changes the `update_commit` we are about to send
    /// covers. Returns the number of covered changes.
    pub(crate) fn begin_remote_commit(&mut self) -> usize {
        self.committing = self
            .changes
            .iter()
            .filter(|change| !change.in_remote_commit)
            .map(Change::htlc_ref)
            .collect();
        self.committing.len()
    }

    /// Marks the changes covered by the outstanding `update_commit` as
    /// included into their commitment (their revocation acknowledged it).
    pub(crate) fn mark_remote_commit(&mut self) {
        for change in &mut self.changes {
            if self.committing.contains(&change.htlc_ref()) {
                change.in_remote_commit = true;
            }
        }
        self.committing = vec![];
    }

    /// Are there changes still missing from their commitment (i.e. do we
    /// owe them an `update_commit`)?
    pub(crate) fn changes_pending_remote(&self) -> bool {
        self.changes.iter().any(|change| !change.in_remote_commit)
    }

    /// Removes settled changes and applies their final effect to the HTLC
    /// set. Returns the drained changes.
    pub(crate) fn drain_settled_changes(&mut self) -> Vec<Change> {
        let changes = std::mem::take(&mut self.changes);
        let (settled, remaining) =
            changes.into_iter().partition::<Vec<_>, _>(Change::is_settled);
        self.changes = remaining;
        for change in &settled {
            let state = match change.kind {
                ChangeKind::Add { .. } => HtlcState::Committed,
                ChangeKind::Fulfill { preimage, .. } => HtlcState::Dead {
                    preimage: Some(preimage),
                },
                ChangeKind::Fail { .. } => HtlcState::Dead { preimage: None },
            };
            if let Some(htlc) = self.htlc_mut(change.htlc_ref()) {
                htlc.state = state;
            }
        }
        settled
    }

    /// Produces a snapshot of the full context for persistence.
    pub fn snapshot(&self) -> PeerState {
        PeerState {
            state: self.state,
            local_params: self.local_params,
            remote_params: self.remote_params,
            anchor: self.anchor.clone(),
            local_commit: self.local_commit.clone(),
            remote_commit: self.remote_commit.clone(),
            revocations: self.revocations.clone(),
            changes: self.changes.clone(),
            offered: self.offered.clone(),
            received: self.received.clone(),
            next_htlc_id: self.next_htlc_id,
            last_remote_htlc_id: self.last_remote_htlc_id,
            close: self.close.clone(),
            awaiting_revocation: self.awaiting_revocation,
            committing: self.committing.clone(),
            onchain: self.onchain,
            current_cmd: self.current_cmd.clone(),
            cmd_htlc: self.cmd_htlc,
        }
    }

    /// Restores a context from a persisted snapshot.
    pub fn restore(state: PeerState) -> Peer {
        Peer {
            state: state.state,
            local_params: state.local_params,
            remote_params: state.remote_params,
            anchor: state.anchor,
            local_commit: state.local_commit,
            remote_commit: state.remote_commit,
            revocations: state.revocations,
            changes: state.changes,
            offered: state.offered,
            received: state.received,
            next_htlc_id: state.next_htlc_id,
            last_remote_htlc_id: state.last_remote_htlc_id,
            close: state.close,
            awaiting_revocation: state.awaiting_revocation,
            committing: state.committing,
            onchain: state.onchain,
            current_cmd: state.current_cmd,
            cmd_htlc: state.cmd_htlc,
        }
    }
}

/// Strict-encoded snapshot of the peer context.
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Display, Serialize, Deserialize),
    serde(crate = "serde_crate"),
    display(PeerState::to_yaml_string)
)]
pub struct PeerState {
    pub state: ChannelState,
    pub local_params: ChannelParams,
    pub remote_params: Option<ChannelParams>,
    pub anchor: Option<Anchor>,
    pub local_commit: Commitment,
    pub remote_commit: Commitment,
    #[cfg_attr(
        feature = "serde",
        serde(with = "As::<BTreeMap<Same, DisplayFromStr>>")
    )]
    pub revocations: BTreeMap<u64, Slice32>,
    pub changes: Vec<Change>,
    pub offered: BTreeMap<u64, Htlc>,
    pub received: BTreeMap<u64, Htlc>,
    pub next_htlc_id: u64,
    pub last_remote_htlc_id: Option<u64>,
    pub close: Option<CloseNegotiation>,
    pub awaiting_revocation: bool,
    pub committing: Vec<HtlcRef>,
    pub onchain: Option<OnchainResolution>,
    pub current_cmd: Option<Command>,
    pub cmd_htlc: Option<HtlcRef>,
}

#[cfg(feature = "serde")]
impl ToYamlString for PeerState {}

impl DumbDefault for PeerState {
    fn dumb_default() -> Self {
        Peer::new(ChannelParams::default()).snapshot()
    }
}

#[cfg(test)]
mod test {
    use bitcoin_scripts::hlc::HashLock;

    use super::*;

    fn committed_htlc(id: u64, direction: Party) -> Htlc {
        Htlc {
            id,
            direction,
            amount_msat: 10_000,
            payment_hash: HashLock::from(Slice32::default()),
            cltv_expiry: 500,
            state: HtlcState::Committed,
        }
    }

    #[test]
    fn fresh_peer_has_no_htlcs() {
        let peer = Peer::new(ChannelParams::default());
        assert_eq!(peer.state(), ChannelState::Init);
        assert!(!peer.committed_to_htlcs());
        assert!(!peer.has_close_sig());
        assert!(!peer.anchor_is_live());
    }

    #[test]
    fn inflight_accounting() {
        let mut peer = Peer::new(ChannelParams::default());
        peer.offered.insert(0, committed_htlc(0, Party::Local));
        peer.received.insert(0, committed_htlc(0, Party::Remote));
        let mut dead = committed_htlc(1, Party::Remote);
        dead.state = HtlcState::Dead { preimage: None };
        peer.received.insert(1, dead);

        assert_eq!(peer.inflight_count(Party::Remote), 1);
        assert_eq!(peer.inflight_msat(Party::Remote), 10_000);
        assert_eq!(peer.inflight_count(Party::Local), 1);
        assert!(peer.committed_to_htlcs());
    }

    #[test]
    fn change_rounds_drain_when_settled() {
        let mut peer = Peer::new(ChannelParams::default());
        peer.offered.insert(0, {
            let mut htlc = committed_htlc(0, Party::Local);
            htlc.state = HtlcState::ProposedByUs;
            htlc
        });
        peer.changes
            .push(Change::new(ChangeKind::Add { id: 0 }, Party::Local));

        assert_eq!(peer.begin_remote_commit(), 1);
        assert!(peer.drain_settled_changes().is_empty());

        peer.mark_remote_commit();
        assert_eq!(peer.mark_local_commit(), 1);
        let settled = peer.drain_settled_changes();
        assert_eq!(settled.len(), 1);
        assert_eq!(peer.offered[&0].state, HtlcState::Committed);
        assert!(!peer.changes_pending_remote());
    }

    #[test]
    fn htlc_lookup_respects_sides() {
        let mut peer = Peer::new(ChannelParams::default());
        peer.offered.insert(3, committed_htlc(3, Party::Local));
        assert!(peer
            .htlc(HtlcRef {
                side: Party::Local,
                id: 3
            })
            .is_some());
        assert!(peer
            .htlc(HtlcRef {
                side: Party::Remote,
                id: 3
            })
            .is_none());
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut peer = Peer::new(ChannelParams::default());
        peer.received.insert(7, committed_htlc(7, Party::Remote));
        peer.state = ChannelState::Normal;
        let restored = Peer::restore(peer.snapshot());
        assert_eq!(restored.snapshot(), peer.snapshot());
    }
}
