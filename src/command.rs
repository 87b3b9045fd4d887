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

use crate::peer::ChannelParams;

/// Descriptor of a local command handed to the state machine.
///
/// At most one command may be outstanding per channel; its resolution is
/// always reported through [`CommandStatus`].
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum Command {
    /// Open a channel, creating and funding the anchor ourselves
    #[display("open_with_anchor(...)")]
    OpenWithAnchor(ChannelParams),

    /// Open a channel which the counterparty funds
    #[display("open_without_anchor(...)")]
    OpenWithoutAnchor(ChannelParams),

    /// Offer a new HTLC to the counterparty
    #[display("send_htlc_add({0})")]
    SendHtlcAdd(AddHtlc),

    /// Fulfill a received HTLC, forwarding its preimage
    #[display("send_htlc_fulfill({0})")]
    SendHtlcFulfill(FulfillHtlc),

    /// Fail a received HTLC
    #[display("send_htlc_fail({0})")]
    SendHtlcFail(FailHtlc),

    /// Begin mutual close of the channel
    #[display("close")]
    Close,
}

/// Parameters of a locally-offered HTLC.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("{amount_msat} msat, {payment_hash}, expiry {cltv_expiry}")]
pub struct AddHtlc {
    /// HTLC value in millisatoshi
    pub amount_msat: u64,

    /// Hash locking the payment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub payment_hash: HashLock,

    /// Absolute block height after which the HTLC refunds to us
    pub cltv_expiry: u32,
}

/// Reference to a received HTLC together with the preimage settling it.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("htlc {id}")]
pub struct FulfillHtlc {
    /// Id of the HTLC being fulfilled
    pub id: u64,

    /// Preimage hashing to the HTLC hashlock
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub payment_preimage: HashPreimage,
}

/// Reference to a received HTLC which cannot be routed further.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("htlc {id}: {reason}")]
pub struct FailHtlc {
    /// Id of the HTLC being failed
    pub id: u64,

    /// Diagnostic failure reason relayed to the counterparty
    pub reason: String,
}

/// Status of the channel command as observed after a transition.
///
/// Command-originated transitions report `InProgress`, `Succeeded` or
/// `Failed`; packet- and chain-originated transitions report `None` unless
/// they resolve the outstanding command.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum CommandStatus {
    /// No command resolution in this transition
    #[display("NONE")]
    None,

    /// The command was accepted and awaits completion
    #[display("IN_PROGRESS")]
    InProgress,

    /// The command completed successfully
    #[display("SUCCEEDED")]
    Succeeded,

    /// The command was rejected or its protocol flow failed
    #[display("FAILED")]
    Failed,
}

#[cfg(test)]
mod test {
    use super::*;
    use amplify::Slice32;

    #[test]
    fn command_display() {
        let cmd = Command::SendHtlcFail(FailHtlc {
            id: 7,
            reason: "route unavailable".to_string(),
        });
        assert_eq!(
            cmd.to_string(),
            "send_htlc_fail(htlc 7: route unavailable)"
        );
        assert_eq!(Command::Close.to_string(), "close");
    }

    #[test]
    fn fulfill_display_hides_preimage() {
        let fulfill = FulfillHtlc {
            id: 2,
            payment_preimage: HashPreimage::from(Slice32::default()),
        };
        assert_eq!(fulfill.to_string(), "htlc 2");
    }
}
