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

/// Protocol states of the per-peer channel state machine.
///
/// The set is closed; every transition of the machine is a cell in the
/// (state × input) table implemented by [`crate::state`]. States fall into
/// four regions: opening handshake, normal operation, clearing & closing,
/// and terminal states (`Closed` plus the error states). Terminal states are
/// absorbing: no input transitions out of them.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum ChannelState {
    /// Channel object constructed; no command or packet processed yet
    #[display("INIT")]
    Init,

    /// Asked the wallet to construct our anchor, awaiting completion
    #[display("OPEN_WAIT_FOR_ANCHOR_CREATE")]
    OpenWaitForAnchorCreate,

    /// Sent `open` offering the anchor, awaiting their `open`
    #[display("OPEN_WAIT_FOR_OPEN_WITHANCHOR")]
    OpenWaitForOpenWithAnchor,

    /// Sent `open` without an anchor, awaiting their `open`
    #[display("OPEN_WAIT_FOR_OPEN_NOANCHOR")]
    OpenWaitForOpenNoAnchor,

    /// They fund the channel: awaiting their `open_anchor`
    #[display("OPEN_WAIT_FOR_ANCHOR")]
    OpenWaitForAnchor,

    /// We fund the channel: awaiting their signature on our first commitment
    #[display("OPEN_WAIT_FOR_COMMIT_SIG")]
    OpenWaitForCommitSig,

    /// Our anchor is broadcast, awaiting confirmation depth
    #[display("OPEN_WAITING_OURANCHOR")]
    OpenWaitingOurAnchor,

    /// Our anchor awaiting depth, their `open_complete` already received
    #[display("OPEN_WAITING_OURANCHOR_THEYCOMPLETED")]
    OpenWaitingOurAnchorTheyCompleted,

    /// Their anchor is broadcast, awaiting confirmation depth
    #[display("OPEN_WAITING_THEIRANCHOR")]
    OpenWaitingTheirAnchor,

    /// Their anchor awaiting depth, their `open_complete` already received
    #[display("OPEN_WAITING_THEIRANCHOR_THEYCOMPLETED")]
    OpenWaitingTheirAnchorTheyCompleted,

    /// Our anchor reached depth and we sent `open_complete`, awaiting theirs
    #[display("OPEN_WAIT_FOR_COMPLETE_OURANCHOR")]
    OpenWaitForCompleteOurAnchor,

    /// Their anchor reached depth and we sent `open_complete`, awaiting
    /// theirs
    #[display("OPEN_WAIT_FOR_COMPLETE_THEIRANCHOR")]
    OpenWaitForCompleteTheirAnchor,

    /// Steady state: HTLCs added, fulfilled and failed; commitments rotated
    /// through commit/revoke rounds
    #[display("NORMAL")]
    Normal,

    /// We sent `close_clearing`; no new HTLCs accepted, awaiting their
    /// clearing
    #[display("US_CLEARING")]
    UsClearing,

    /// Both sides cleared; draining committed HTLCs before fee negotiation
    #[display("BOTH_CLEARING")]
    BothClearing,

    /// Exchanging `close_signature` until a fee matches
    #[display("WAIT_FOR_CLOSE_SIG")]
    WaitForCloseSig,

    /// Mutual close transaction broadcast, awaiting burial
    #[display("CLOSE_ONCHAIN_MUTUAL")]
    OnchainMutual,

    /// Our commitment broadcast, resolving its outputs on-chain
    #[display("CLOSE_ONCHAIN_OUR_COMMIT")]
    OnchainOurCommit,

    /// Their latest commitment broadcast, resolving its outputs on-chain
    #[display("CLOSE_ONCHAIN_THEIR_COMMIT")]
    OnchainTheirCommit,

    /// A revoked commitment broadcast; punishment transaction issued
    #[display("CLOSE_ONCHAIN_STEAL")]
    OnchainSteal,

    /// Channel fully resolved and buried; nothing left to watch
    #[display("CLOSED")]
    Closed,

    /// Their anchor never reached the required depth
    #[display("ERR_ANCHOR_TIMEOUT")]
    ErrAnchorTimeout,

    /// A confirmed anchor became unspent: reorganisation beyond the safety
    /// depth
    #[display("ERR_ANCHOR_LOST")]
    ErrAnchorLost,

    /// Counterparty violated the protocol
    #[display("ERR_PROTOCOL")]
    ErrProtocol,

    /// The anchor was spent by a transaction we cannot attribute; channel
    /// keys may be compromised
    #[display("ERR_INFORMATION_LEAK")]
    ErrInformationLeak,

    /// An impossible (state, input) cell was reached; implementation bug
    #[display("ERR_INTERNAL")]
    ErrInternal,
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState::Init
    }
}

impl ChannelState {
    /// All members of the closed state set, in declaration order. Exists so
    /// that table-coverage tests can iterate every state.
    pub const ALL: [ChannelState; 26] = [
        ChannelState::Init,
        ChannelState::OpenWaitForAnchorCreate,
        ChannelState::OpenWaitForOpenWithAnchor,
        ChannelState::OpenWaitForOpenNoAnchor,
        ChannelState::OpenWaitForAnchor,
        ChannelState::OpenWaitForCommitSig,
        ChannelState::OpenWaitingOurAnchor,
        ChannelState::OpenWaitingOurAnchorTheyCompleted,
        ChannelState::OpenWaitingTheirAnchor,
        ChannelState::OpenWaitingTheirAnchorTheyCompleted,
        ChannelState::OpenWaitForCompleteOurAnchor,
        ChannelState::OpenWaitForCompleteTheirAnchor,
        ChannelState::Normal,
        ChannelState::UsClearing,
        ChannelState::BothClearing,
        ChannelState::WaitForCloseSig,
        ChannelState::OnchainMutual,
        ChannelState::OnchainOurCommit,
        ChannelState::OnchainTheirCommit,
        ChannelState::OnchainSteal,
        ChannelState::Closed,
        ChannelState::ErrAnchorTimeout,
        ChannelState::ErrAnchorLost,
        ChannelState::ErrProtocol,
        ChannelState::ErrInformationLeak,
        ChannelState::ErrInternal,
    ];

    /// Detects states of the opening handshake, from the first command until
    /// both sides exchanged `open_complete`.
    pub fn is_opening(self) -> bool {
        matches!(
            self,
            ChannelState::Init
                | ChannelState::OpenWaitForAnchorCreate
                | ChannelState::OpenWaitForOpenWithAnchor
                | ChannelState::OpenWaitForOpenNoAnchor
                | ChannelState::OpenWaitForAnchor
                | ChannelState::OpenWaitForCommitSig
                | ChannelState::OpenWaitingOurAnchor
                | ChannelState::OpenWaitingOurAnchorTheyCompleted
                | ChannelState::OpenWaitingTheirAnchor
                | ChannelState::OpenWaitingTheirAnchorTheyCompleted
                | ChannelState::OpenWaitForCompleteOurAnchor
                | ChannelState::OpenWaitForCompleteTheirAnchor
        )
    }

    /// Detects states where the mutual shutdown protocol is in progress but
    /// the channel is not yet resolved on-chain.
    pub fn is_clearing(self) -> bool {
        matches!(
            self,
            ChannelState::UsClearing
                | ChannelState::BothClearing
                | ChannelState::WaitForCloseSig
        )
    }

    /// Detects states where a channel resolution transaction is on-chain and
    /// the machine tracks its outputs until burial.
    pub fn is_onchain(self) -> bool {
        matches!(
            self,
            ChannelState::OnchainMutual
                | ChannelState::OnchainOurCommit
                | ChannelState::OnchainTheirCommit
                | ChannelState::OnchainSteal
        )
    }

    /// Detects error states.
    ///
    /// The check matches variants directly and does not depend on enum
    /// discriminant ordering.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ChannelState::ErrAnchorTimeout
                | ChannelState::ErrAnchorLost
                | ChannelState::ErrProtocol
                | ChannelState::ErrInformationLeak
                | ChannelState::ErrInternal
        )
    }

    /// Detects absorbing states: every input self-loops.
    #[inline]
    pub fn is_terminal(self) -> bool {
        self == ChannelState::Closed || self.is_error()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regions_partition_state_set() {
        for state in ChannelState::ALL {
            let regions = [
                state.is_opening(),
                state == ChannelState::Normal,
                state.is_clearing(),
                state.is_onchain(),
                state.is_terminal(),
            ];
            assert_eq!(
                regions.iter().filter(|r| **r).count(),
                1,
                "state {} must belong to exactly one region",
                state
            );
        }
    }

    #[test]
    fn error_states_are_terminal() {
        for state in ChannelState::ALL {
            if state.is_error() {
                assert!(state.is_terminal());
            }
        }
        assert!(ChannelState::Closed.is_terminal());
        assert!(!ChannelState::Closed.is_error());
    }

    #[test]
    fn display_names() {
        assert_eq!(ChannelState::Normal.to_string(), "NORMAL");
        assert_eq!(
            ChannelState::ErrAnchorTimeout.to_string(),
            "ERR_ANCHOR_TIMEOUT"
        );
        assert_eq!(
            ChannelState::OpenWaitingOurAnchor.to_string(),
            "OPEN_WAITING_OURANCHOR"
        );
    }
}
