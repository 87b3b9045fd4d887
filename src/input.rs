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

use crate::command::Command;
use crate::htlc::{HtlcProgress, HtlcRef};
use crate::messages::Pkt;
use crate::peer::ChainEvent;

/// Input alphabet of the channel state machine.
///
/// The set is closed and partitioned into peer packets, local commands,
/// on-chain events and internal inputs. Values are fieldless so that chain
/// watches can be registered with the input they must deliver on firing; the
/// payload travels separately as [`InputData`].
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum Input {
    /// Their `open` packet received
    #[display("PKT_OPEN")]
    PktOpen,

    /// Their `open_anchor` packet received
    #[display("PKT_OPEN_ANCHOR")]
    PktOpenAnchor,

    /// Their signature over our first commitment received
    #[display("PKT_OPEN_COMMIT_SIG")]
    PktOpenCommitSig,

    /// Their `open_complete` packet received
    #[display("PKT_OPEN_COMPLETE")]
    PktOpenComplete,

    /// They propose a new HTLC on our commitment
    #[display("PKT_UPDATE_ADD_HTLC")]
    PktUpdateAddHtlc,

    /// They fulfill an HTLC we offered, revealing its preimage
    #[display("PKT_UPDATE_FULFILL_HTLC")]
    PktUpdateFulfillHtlc,

    /// They fail an HTLC we offered
    #[display("PKT_UPDATE_FAIL_HTLC")]
    PktUpdateFailHtlc,

    /// Their signature over our next commitment received
    #[display("PKT_UPDATE_COMMIT")]
    PktUpdateCommit,

    /// Their revocation of their previous commitment received
    #[display("PKT_UPDATE_REVOCATION")]
    PktUpdateRevocation,

    /// They enter clearing mode: no new HTLCs from either side
    #[display("PKT_CLOSE_CLEARING")]
    PktCloseClearing,

    /// Their mutual close signature at some fee received
    #[display("PKT_CLOSE_SIGNATURE")]
    PktCloseSignature,

    /// They report a protocol error and abandon the channel
    #[display("PKT_ERROR")]
    PktError,

    /// Local request: open a channel, funding it ourselves
    #[display("CMD_OPEN_WITH_ANCHOR")]
    CmdOpenWithAnchor,

    /// Local request: open a channel funded by the counterparty
    #[display("CMD_OPEN_WITHOUT_ANCHOR")]
    CmdOpenWithoutAnchor,

    /// Local request: offer a new HTLC
    #[display("CMD_SEND_HTLC_ADD")]
    CmdSendHtlcAdd,

    /// Local request: fulfill a received HTLC with its preimage
    #[display("CMD_SEND_HTLC_FULFILL")]
    CmdSendHtlcFulfill,

    /// Local request: fail a received HTLC
    #[display("CMD_SEND_HTLC_FAIL")]
    CmdSendHtlcFail,

    /// Local request: begin mutual close
    #[display("CMD_CLOSE")]
    CmdClose,

    /// The wallet finished constructing our anchor transaction
    #[display("BITCOIN_ANCHOR_CREATED")]
    BitcoinAnchorCreated,

    /// The anchor reached the negotiated confirmation depth
    #[display("BITCOIN_ANCHOR_DEPTHOK")]
    BitcoinAnchorDepthOk,

    /// Their anchor failed to reach depth in time
    #[display("BITCOIN_ANCHOR_TIMEOUT")]
    BitcoinAnchorTimeout,

    /// A confirmed anchor became unspent (deep reorganisation)
    #[display("BITCOIN_ANCHOR_UNSPENT")]
    BitcoinAnchorUnspent,

    /// They spent the anchor with one of their commitment transactions
    #[display("BITCOIN_ANCHOR_THEYSPENT")]
    BitcoinAnchorTheySpent,

    /// The anchor was spent by a transaction we do not recognize
    #[display("BITCOIN_ANCHOR_OTHERSPENT")]
    BitcoinAnchorOtherSpent,

    /// The to-self delay on our broadcast commitment has passed
    #[display("BITCOIN_COMMIT_DELAYPASSED")]
    BitcoinCommitDelayPassed,

    /// An HTLC output to us reached its timeout
    #[display("BITCOIN_HTLC_TOUS_TIMEOUT")]
    BitcoinHtlcToUsTimeout,

    /// An HTLC output to them was spent, possibly revealing a preimage
    #[display("BITCOIN_HTLC_TOTHEM_SPENT")]
    BitcoinHtlcToThemSpent,

    /// An HTLC output to them reached its timeout
    #[display("BITCOIN_HTLC_TOTHEM_TIMEOUT")]
    BitcoinHtlcToThemTimeout,

    /// Our spend of an HTLC output is buried
    #[display("BITCOIN_HTLC_SPEND_DONE")]
    BitcoinHtlcSpendDone,

    /// The mutual close transaction is buried
    #[display("BITCOIN_CLOSE_DONE")]
    BitcoinCloseDone,

    /// Our spend of our commitment outputs is buried
    #[display("BITCOIN_SPEND_OURS_DONE")]
    BitcoinSpendOursDone,

    /// Our spend of their commitment outputs is buried
    #[display("BITCOIN_SPEND_THEIRS_DONE")]
    BitcoinSpendTheirsDone,

    /// Our punishment transaction is buried
    #[display("BITCOIN_STEAL_DONE")]
    BitcoinStealDone,

    /// No HTLCs remain in the commitments of either side
    #[display("INPUT_HTLCS_CLEARED")]
    HtlcsCleared,

    /// The counterparty never delivered a matching close signature
    #[display("INPUT_CLOSE_COMPLETE_TIMEOUT")]
    CloseCompleteTimeout,

    /// No HTLC output or HTLC spend watches remain
    #[display("INPUT_ALL_HTLCS_DONE")]
    AllHtlcsDone,

    /// Absence of an input; used for unregistered watch slots
    #[display("INPUT_NONE")]
    None,
}

impl Input {
    /// All members of the closed input alphabet, in declaration order.
    /// Exists so that table-coverage tests can iterate every input.
    pub const ALL: [Input; 37] = [
        Input::PktOpen,
        Input::PktOpenAnchor,
        Input::PktOpenCommitSig,
        Input::PktOpenComplete,
        Input::PktUpdateAddHtlc,
        Input::PktUpdateFulfillHtlc,
        Input::PktUpdateFailHtlc,
        Input::PktUpdateCommit,
        Input::PktUpdateRevocation,
        Input::PktCloseClearing,
        Input::PktCloseSignature,
        Input::PktError,
        Input::CmdOpenWithAnchor,
        Input::CmdOpenWithoutAnchor,
        Input::CmdSendHtlcAdd,
        Input::CmdSendHtlcFulfill,
        Input::CmdSendHtlcFail,
        Input::CmdClose,
        Input::BitcoinAnchorCreated,
        Input::BitcoinAnchorDepthOk,
        Input::BitcoinAnchorTimeout,
        Input::BitcoinAnchorUnspent,
        Input::BitcoinAnchorTheySpent,
        Input::BitcoinAnchorOtherSpent,
        Input::BitcoinCommitDelayPassed,
        Input::BitcoinHtlcToUsTimeout,
        Input::BitcoinHtlcToThemSpent,
        Input::BitcoinHtlcToThemTimeout,
        Input::BitcoinHtlcSpendDone,
        Input::BitcoinCloseDone,
        Input::BitcoinSpendOursDone,
        Input::BitcoinSpendTheirsDone,
        Input::BitcoinStealDone,
        Input::HtlcsCleared,
        Input::CloseCompleteTimeout,
        Input::AllHtlcsDone,
        Input::None,
    ];

    /// Detects inputs originating from a counterparty packet.
    pub fn is_pkt(self) -> bool {
        matches!(
            self,
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
                | Input::PktError
        )
    }

    /// Detects inputs originating from a local command.
    pub fn is_cmd(self) -> bool {
        matches!(
            self,
            Input::CmdOpenWithAnchor
                | Input::CmdOpenWithoutAnchor
                | Input::CmdSendHtlcAdd
                | Input::CmdSendHtlcFulfill
                | Input::CmdSendHtlcFail
                | Input::CmdClose
        )
    }

    /// Detects inputs delivered by the chain watcher.
    pub fn is_chain(self) -> bool {
        matches!(
            self,
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
        )
    }

    /// Detects the group of HTLC-sending commands. Replaces the historic
    /// `CMD_SEND_UPDATE_ANY` pseudo-input: the grouping is a pattern, not a
    /// member of the alphabet.
    #[inline]
    pub fn is_send_update(self) -> bool {
        matches!(
            self,
            Input::CmdSendHtlcAdd
                | Input::CmdSendHtlcFulfill
                | Input::CmdSendHtlcFail
        )
    }
}

/// Payload accompanying an [`Input`].
///
/// Carries exactly one of: a peer packet, a command descriptor, a chain
/// event, an HTLC handle or an HTLC progress record. The expected variant is
/// implied by the input value; the transition function treats a mismatch as
/// an internal error.
#[derive(Clone, Debug)]
pub enum InputData {
    /// Payload for `Pkt*` inputs
    Pkt(Pkt),

    /// Payload for `Cmd*` inputs
    Cmd(Command),

    /// Payload for chain events referring to an on-chain transaction
    Btc(ChainEvent),

    /// Payload for chain events scoped to a single HTLC
    Htlc(HtlcRef),

    /// Payload describing a staged HTLC change in flight
    HtlcProgress(HtlcProgress),

    /// No payload
    None,
}

impl From<&Pkt> for Input {
    fn from(pkt: &Pkt) -> Self {
        match pkt {
            Pkt::Open(_) => Input::PktOpen,
            Pkt::OpenAnchor(_) => Input::PktOpenAnchor,
            Pkt::OpenCommitSig(_) => Input::PktOpenCommitSig,
            Pkt::OpenComplete(_) => Input::PktOpenComplete,
            Pkt::UpdateAddHtlc(_) => Input::PktUpdateAddHtlc,
            Pkt::UpdateFulfillHtlc(_) => Input::PktUpdateFulfillHtlc,
            Pkt::UpdateFailHtlc(_) => Input::PktUpdateFailHtlc,
            Pkt::UpdateCommit(_) => Input::PktUpdateCommit,
            Pkt::UpdateRevocation(_) => Input::PktUpdateRevocation,
            Pkt::CloseClearing(_) => Input::PktCloseClearing,
            Pkt::CloseSignature(_) => Input::PktCloseSignature,
            Pkt::Error(_) => Input::PktError,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alphabet_partition() {
        for input in Input::ALL {
            let classes = [
                input.is_pkt(),
                input.is_cmd(),
                input.is_chain(),
                matches!(
                    input,
                    Input::HtlcsCleared
                        | Input::CloseCompleteTimeout
                        | Input::AllHtlcsDone
                        | Input::None
                ),
            ];
            assert_eq!(
                classes.iter().filter(|c| **c).count(),
                1,
                "input {} must belong to exactly one class",
                input
            );
        }
    }

    #[test]
    fn send_update_grouping() {
        let group: Vec<Input> = Input::ALL
            .into_iter()
            .filter(|i| i.is_send_update())
            .collect();
        assert_eq!(group, vec![
            Input::CmdSendHtlcAdd,
            Input::CmdSendHtlcFulfill,
            Input::CmdSendHtlcFail
        ]);
        for input in group {
            assert!(input.is_cmd());
        }
    }

    #[test]
    fn pkt_error_terminates_packet_range() {
        let pkts: Vec<Input> =
            Input::ALL.into_iter().filter(|i| i.is_pkt()).collect();
        assert_eq!(pkts.last(), Some(&Input::PktError));
        assert_eq!(pkts.len(), 12);
    }
}
