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

//! Peer packet data structures.
//!
//! These are the payloads of the `Pkt*` inputs consumed by the state
//! machine. Wire framing and serialization are not part of the core: the
//! types here are plain data handed over by the packet transport.

#[cfg(feature = "serde")]
use serde_with::{As, DisplayFromStr};

use amplify::Slice32;
use bitcoin::{Script, Txid};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use secp256k1::ecdsa::Signature;

/// Whether the sender of an `open` packet will create the anchor.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[repr(u8)]
pub enum AnchorOffer {
    /// The sender will create and broadcast the anchor transaction
    #[display("will_create_anchor")]
    WillCreateAnchor,

    /// The sender expects the counterparty to fund the channel
    #[display("wont_create_anchor")]
    WontCreateAnchor,
}

/// Channel opening proposal.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("open({version}, {anchor_offer}, fee rate {commit_fee_rate}, ...)")]
pub struct Open {
    /// Protocol version spoken by the sender
    pub version: u16,

    /// Who funds the channel
    pub anchor_offer: AnchorOffer,

    /// Fee rate the sender will use for commitment transactions, in
    /// satoshi per kiloweight
    pub commit_fee_rate: u64,

    /// Anchor depth the sender requires before the channel activates
    pub min_depth: u32,

    /// Reserve the counterparty must keep unencumbered, in satoshi
    pub reserve_sat: u64,

    /// Blocks the sender must wait to claim its own funds after a
    /// unilateral close
    pub to_self_delay: u16,

    /// Smallest HTLC the sender accepts, in millisatoshi
    pub htlc_minimum_msat: u64,

    /// Upper bound on the total value of in-flight HTLCs towards the sender
    pub max_htlc_value_in_flight_msat: u64,

    /// Upper bound on the number of in-flight HTLCs towards the sender
    pub max_accepted_htlcs: u16,

    /// Hash revoking the sender's first commitment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub next_revocation_hash: Slice32,
}

/// Anchor transaction announcement by the funding side.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("open_anchor({txid}:{output_index}, {amount} sat)")]
pub struct OpenAnchor {
    /// Id of the anchor transaction
    pub txid: Txid,

    /// Output paying to the channel 2-of-2 script
    pub output_index: u32,

    /// Value of the channel output, in satoshi
    pub amount: u64,

    /// Script of the channel output
    pub script_pubkey: Script,
}

/// Signature over the counterparty's first commitment transaction.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("open_commit_sig(...)")]
pub struct OpenCommitSig {
    /// Signature over the receiver's first commitment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub commit_sig: Signature,
}

/// Confirmation that the sender observed the anchor at sufficient depth.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("open_complete()")]
pub struct OpenComplete {}

/// Proposal of a new HTLC on the receiver's next commitment.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("update_add_htlc({id}, {amount_msat} msat, {payment_hash}, ...)")]
pub struct UpdateAddHtlc {
    /// Id of the HTLC, strictly increasing per sender
    pub id: u64,

    /// HTLC value in millisatoshi
    pub amount_msat: u64,

    /// Hash locking the payment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub payment_hash: HashLock,

    /// Absolute block height after which the HTLC refunds to the sender
    pub cltv_expiry: u32,
}

/// Settlement of an HTLC offered by the receiver, revealing its preimage.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("update_fulfill_htlc({id})")]
pub struct UpdateFulfillHtlc {
    /// Id of the HTLC being fulfilled
    pub id: u64,

    /// Preimage hashing to the HTLC hashlock
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub payment_preimage: HashPreimage,
}

/// Removal of an HTLC offered by the receiver which cannot be completed.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("update_fail_htlc({id}, {reason})")]
pub struct UpdateFailHtlc {
    /// Id of the HTLC being failed
    pub id: u64,

    /// Diagnostic failure reason
    pub reason: String,
}

/// Commitment to all staged changes: signature over the receiver's next
/// commitment transaction.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("update_commit(...)")]
pub struct UpdateCommit {
    /// Signature over the receiver's next commitment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub commit_sig: Signature,
}

/// Revocation of the sender's previous commitment.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("update_revocation(...)")]
pub struct UpdateRevocation {
    /// Preimage of the revocation hash of the commitment being revoked
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub revocation_secret: Slice32,

    /// Hash revoking the sender's new commitment
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub next_revocation_hash: Slice32,
}

/// Entry into clearing mode: the sender will accept no new HTLCs.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("close_clearing(...)")]
pub struct CloseClearing {
    /// Script the sender wishes to be paid to by the mutual close
    pub script_pubkey: Script,
}

/// Mutual close signature at the fee offered by the sender.
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("close_signature({close_fee} sat, ...)")]
pub struct CloseSignature {
    /// Fee the sender offers to pay from the channel funds, in satoshi
    pub close_fee: u64,

    /// Signature over the mutual close transaction at `close_fee`
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    pub sig: Signature,
}

/// Protocol error report. The text is diagnostic only and carries no
/// protocol semantics.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display("error({message})")]
pub struct Error {
    /// Human-readable description of the violation
    pub message: String,
}

/// Any packet received from (or, for error packets, sent to) the
/// counterparty.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[display(inner)]
#[repr(u8)]
pub enum Pkt {
    /// Channel opening proposal
    Open(Open),

    /// Anchor announcement from the funding side
    OpenAnchor(OpenAnchor),

    /// Signature over our first commitment
    OpenCommitSig(OpenCommitSig),

    /// Opening handshake completion
    OpenComplete(OpenComplete),

    /// New HTLC proposal
    UpdateAddHtlc(UpdateAddHtlc),

    /// HTLC settlement with preimage
    UpdateFulfillHtlc(UpdateFulfillHtlc),

    /// HTLC failure
    UpdateFailHtlc(UpdateFailHtlc),

    /// Commitment signature over staged changes
    UpdateCommit(UpdateCommit),

    /// Revocation of the previous commitment
    UpdateRevocation(UpdateRevocation),

    /// Clearing mode announcement
    CloseClearing(CloseClearing),

    /// Mutual close fee offer with signature
    CloseSignature(CloseSignature),

    /// Protocol error report
    Error(Error),
}

impl Pkt {
    /// Constructs an error packet with the given diagnostic text.
    pub fn err(message: impl ToString) -> Pkt {
        Pkt::Error(Error {
            message: message.to_string(),
        })
    }

    /// Constructs an error packet reporting a syntactically valid but
    /// contextually impossible packet.
    pub fn err_unexpected(pkt: &Pkt) -> Pkt {
        Pkt::err(format!("unexpected packet {}", pkt))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn err_unexpected_names_packet() {
        let pkt = Pkt::OpenComplete(OpenComplete::default());
        match Pkt::err_unexpected(&pkt) {
            Pkt::Error(err) => {
                assert_eq!(err.message, "unexpected packet open_complete()")
            }
            _ => panic!("error constructor must produce an error packet"),
        }
    }

    #[test]
    fn packet_display() {
        let pkt = Pkt::UpdateFailHtlc(UpdateFailHtlc {
            id: 3,
            reason: "no route".to_string(),
        });
        assert_eq!(pkt.to_string(), "update_fail_htlc(3, no route)");
    }
}
