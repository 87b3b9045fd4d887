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

#[cfg(feature = "serde")]
use serde_with::{As, DisplayFromStr};

use bitcoin_scripts::hlc::{HashLock, HashPreimage};

/// Side of the channel which originated a change or payment.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum Party {
    /// The local node
    #[display("local")]
    Local,

    /// The remote counterparty
    #[display("remote")]
    Remote,
}

/// Lifecycle of a single HTLC as seen by the local node.
///
/// At any instant an HTLC is in exactly one of these states; transitions are
/// driven by the commit/revoke rounds and by on-chain resolution.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum HtlcState {
    /// Proposed by us, not yet in a signed commitment on both sides
    #[display("proposed_by_us")]
    ProposedByUs,

    /// Proposed by them, not yet in a signed commitment on both sides
    #[display("proposed_by_them")]
    ProposedByThem,

    /// Live in the current commitments of both sides
    #[display("committed")]
    Committed,

    /// A fulfilment carrying this preimage is staged
    #[display("fulfilling")]
    Fulfilling {
        /// Preimage which settles the HTLC
        #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
        preimage: HashPreimage,
    },

    /// A failure removal is staged
    #[display("failing")]
    Failing,

    /// The HTLC output was resolved by an on-chain transaction
    #[display("resolved_onchain")]
    OnchainResolved {
        /// Preimage learned from the chain, if the resolution revealed one
        #[cfg_attr(feature = "serde", serde(with = "As::<Option<DisplayFromStr>>"))]
        preimage: Option<HashPreimage>,
    },

    /// Removed from both commitments; retained for bookkeeping only
    #[display("dead")]
    Dead {
        /// Preimage obtained before removal, if the HTLC was fulfilled
        #[cfg_attr(feature = "serde", serde(with = "As::<Option<DisplayFromStr>>"))]
        preimage: Option<HashPreimage>,
    },
}

impl HtlcState {
    /// An HTLC is live while it occupies (or is about to occupy) an output
    /// on a commitment transaction of either side.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            HtlcState::ProposedByUs
                | HtlcState::ProposedByThem
                | HtlcState::Committed
                | HtlcState::Fulfilling { .. }
                | HtlcState::Failing
        )
    }

    /// Returns the preimage associated with a settled HTLC, if any.
    pub fn preimage(self) -> Option<HashPreimage> {
        match self {
            HtlcState::Fulfilling { preimage } => Some(preimage),
            HtlcState::OnchainResolved { preimage }
            | HtlcState::Dead { preimage } => preimage,
            HtlcState::ProposedByUs
            | HtlcState::ProposedByThem
            | HtlcState::Committed
            | HtlcState::Failing => None,
        }
    }
}

/// A hash-time-locked conditional payment tracked by the channel.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("htlc {id} ({direction}, {amount_msat} msat, {state})")]
pub struct Htlc {
    /// Id assigned by the offering side, strictly increasing per direction
    pub id: u64,

    /// Which side offered the HTLC (`Local` = outgoing payment)
    pub direction: Party,

    /// HTLC value in millisatoshi
    pub amount_msat: u64,

    /// Hash locking the payment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub payment_hash: HashLock,

    /// Absolute block height after which the HTLC refunds to the offerer
    pub cltv_expiry: u32,

    /// Current lifecycle state
    pub state: HtlcState,
}

/// Kind of a staged commitment change.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum ChangeKind {
    /// Addition of a new HTLC output
    #[display("add({id})")]
    Add {
        /// Id of the HTLC being added
        id: u64,
    },

    /// Removal of an HTLC settled with its preimage
    #[display("fulfill({id})")]
    Fulfill {
        /// Id of the HTLC being fulfilled
        id: u64,

        /// Preimage settling it
        #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
        preimage: HashPreimage,
    },

    /// Removal of a failed HTLC
    #[display("fail({id})")]
    Fail {
        /// Id of the HTLC being failed
        id: u64,
    },
}

impl ChangeKind {
    /// Id of the HTLC the change refers to.
    pub fn htlc_id(self) -> u64 {
        match self {
            ChangeKind::Add { id }
            | ChangeKind::Fulfill { id, .. }
            | ChangeKind::Fail { id } => id,
        }
    }
}

/// Reference to an HTLC within one side's id space.
///
/// HTLC ids increase independently per offering side, so an id alone is
/// ambiguous; every cross-reference carries the side which offered the HTLC.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("{side} htlc {id}")]
pub struct HtlcRef {
    /// Side which offered the HTLC
    pub side: Party,

    /// Id within that side's sequence
    pub id: u64,
}

/// A proposed commitment change and its inclusion progress.
///
/// Every change must enter the commitments of both sides: the local one via
/// a counterparty `update_commit` acknowledged by our revocation, the remote
/// one via our `update_commit` acknowledged by theirs. Once both bits are
/// set the change is drained and its final effect applied to the HTLC set.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("{kind} by {proposed_by} (local: {in_local_commit}, remote: {in_remote_commit})")]
pub struct Change {
    /// What the change does
    pub kind: ChangeKind,

    /// Which side proposed it
    pub proposed_by: Party,

    /// Whether the change is reflected in our current commitment
    pub in_local_commit: bool,

    /// Whether the change is reflected in their current commitment
    pub in_remote_commit: bool,
}

impl Change {
    /// Stages a fresh change proposed by the given party.
    pub fn new(kind: ChangeKind, proposed_by: Party) -> Change {
        Change {
            kind,
            proposed_by,
            in_local_commit: false,
            in_remote_commit: false,
        }
    }

    /// A change is settled once both commitments reflect it.
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.in_local_commit && self.in_remote_commit
    }

    /// The HTLC the change operates on. An addition creates an HTLC on the
    /// proposer's side; a fulfilment or failure settles an HTLC offered by
    /// the opposite side.
    pub fn htlc_ref(&self) -> HtlcRef {
        let side = match self.kind {
            ChangeKind::Add { .. } => self.proposed_by,
            ChangeKind::Fulfill { .. } | ChangeKind::Fail { .. } => {
                match self.proposed_by {
                    Party::Local => Party::Remote,
                    Party::Remote => Party::Local,
                }
            }
        };
        HtlcRef {
            side,
            id: self.kind.htlc_id(),
        }
    }
}

/// Snapshot of an HTLC change in flight, used when asking the packet queue
/// to emit the corresponding `update_*` packet.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("{kind}: {htlc}")]
pub struct HtlcProgress {
    /// The change being transmitted
    pub kind: ChangeKind,

    /// State of the affected HTLC after staging
    pub htlc: Htlc,
}

#[cfg(test)]
mod test {
    use super::*;
    use amplify::Slice32;

    fn htlc(state: HtlcState) -> Htlc {
        Htlc {
            id: 0,
            direction: Party::Local,
            amount_msat: 1000,
            payment_hash: HashLock::from(Slice32::default()),
            cltv_expiry: 500,
            state,
        }
    }

    #[test]
    fn liveness() {
        assert!(htlc(HtlcState::ProposedByUs).state.is_live());
        assert!(htlc(HtlcState::Committed).state.is_live());
        assert!(htlc(HtlcState::Failing).state.is_live());
        assert!(!htlc(HtlcState::Dead { preimage: None }).state.is_live());
        assert!(
            !htlc(HtlcState::OnchainResolved { preimage: None })
                .state
                .is_live()
        );
    }

    #[test]
    fn change_settlement() {
        let mut change =
            Change::new(ChangeKind::Add { id: 4 }, Party::Remote);
        assert!(!change.is_settled());
        change.in_local_commit = true;
        assert!(!change.is_settled());
        change.in_remote_commit = true;
        assert!(change.is_settled());
        assert_eq!(change.kind.htlc_id(), 4);
    }

    #[test]
    fn change_targets_correct_side() {
        let add = Change::new(ChangeKind::Add { id: 1 }, Party::Remote);
        assert_eq!(add.htlc_ref(), HtlcRef {
            side: Party::Remote,
            id: 1
        });
        let fulfill = Change::new(
            ChangeKind::Fulfill {
                id: 1,
                preimage: HashPreimage::from(Slice32::default()),
            },
            Party::Remote,
        );
        assert_eq!(fulfill.htlc_ref(), HtlcRef {
            side: Party::Local,
            id: 1
        });
    }

    #[test]
    fn preimage_retention() {
        let preimage = HashPreimage::from(Slice32::default());
        let dead = HtlcState::Dead {
            preimage: Some(preimage),
        };
        assert_eq!(dead.preimage(), Some(preimage));
        assert_eq!(HtlcState::Committed.preimage(), None);
    }
}
