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

//! Collaborator interfaces consumed by the state machine.
//!
//! The machine never touches the network or the chain itself: it invokes
//! these traits and returns an [`Outcome`]. Implementations live with the
//! embedding daemon; tests use a recording mock.

use amplify::Slice32;
use bitcoin::Transaction;
use bitcoin_scripts::hlc::HashPreimage;
use secp256k1::ecdsa::Signature;

use crate::command::CommandStatus;
use crate::htlc::{Htlc, HtlcProgress};
use crate::input::Input;
use crate::messages::{AnchorOffer, Pkt};
use crate::peer::{ChainEvent, Peer};

/// Result of a single transition of the state machine.
#[derive(Clone, Debug)]
pub struct Outcome {
    /// Status of the channel command observable after the transition
    pub status: CommandStatus,

    /// Transaction to broadcast, if the transition produced one. Ownership
    /// transfers to the caller.
    pub broadcast: Option<Transaction>,
}

impl Outcome {
    /// Transition with no command resolution and nothing to broadcast.
    pub fn none() -> Outcome {
        Outcome {
            status: CommandStatus::None,
            broadcast: None,
        }
    }

    /// Transition reporting a command status without a broadcast.
    pub fn status(status: CommandStatus) -> Outcome {
        Outcome {
            status,
            broadcast: None,
        }
    }

    /// Transition broadcasting a transaction.
    pub fn broadcast(status: CommandStatus, tx: Transaction) -> Outcome {
        Outcome {
            status,
            broadcast: Some(tx),
        }
    }
}

/// Queue of outgoing packets towards the counterparty.
///
/// Packet content construction (signatures, revocation secrets) is the
/// implementation's concern; the machine supplies the peer context and, for
/// HTLC updates, the staged change descriptor. Packets must be delivered in
/// the exact order of their enqueuing.
pub trait PacketQueue {
    fn queue_pkt_open(&mut self, peer: &Peer, anchor_offer: AnchorOffer);
    fn queue_pkt_anchor(&mut self, peer: &Peer);
    fn queue_pkt_open_commit_sig(&mut self, peer: &Peer);
    fn queue_pkt_open_complete(&mut self, peer: &Peer);
    fn queue_pkt_htlc_add(&mut self, peer: &Peer, progress: &HtlcProgress);
    fn queue_pkt_htlc_fulfill(
        &mut self,
        peer: &Peer,
        progress: &HtlcProgress,
    );
    fn queue_pkt_htlc_fail(&mut self, peer: &Peer, progress: &HtlcProgress);
    fn queue_pkt_commit(&mut self, peer: &Peer);
    fn queue_pkt_revocation(&mut self, peer: &Peer);
    fn queue_pkt_close_clearing(&mut self, peer: &Peer);
    fn queue_pkt_close_signature(&mut self, peer: &Peer, fee: u64);
    fn queue_pkt_err(&mut self, peer: &Peer, err: Pkt);
}

/// Registration of chain watches.
///
/// Watches are capability intents: each registers the input the machine must
/// receive when the watched condition fires. The watcher owns the watch
/// handles; the machine identifies them by their firing inputs (and, for
/// HTLC watches, the HTLC).
pub trait ChainWatcher {
    /// Watches the anchor transaction. `timeout` is [`Input::None`] for our
    /// own anchor: we do not time ourselves out.
    fn watch_anchor(
        &mut self,
        peer: &Peer,
        depthok: Input,
        timeout: Input,
        unspent: Input,
        theyspent: Input,
        otherspent: Input,
    );

    /// Removes the depth part of an anchor watch once depth is reached.
    /// `depthok` and `timeout` must match the `watch_anchor` call.
    fn unwatch_anchor_depth(
        &mut self,
        peer: &Peer,
        depthok: Input,
        timeout: Input,
    );

    /// Watches our broadcast commitment until its to-self delay passes.
    fn watch_delayed(&mut self, peer: &Peer, tx: &Transaction, canspend: Input);

    /// Watches a transaction we broadcast until it is irreversible.
    fn watch_tx(&mut self, peer: &Peer, tx: &Transaction, done: Input);

    /// Watches the mutual close: `done` when buried, `timedout` if the
    /// counterparty never delivers a matching signature.
    fn watch_close(&mut self, peer: &Peer, done: Input, timedout: Input);

    /// Removes the close timeout once their matching signature arrived.
    fn unwatch_close_timeout(&mut self, peer: &Peer, timedout: Input);

    /// Watches HTLC outputs of our broadcast commitment. Returns whether
    /// any outputs existed; `false` means resolution bookkeeping advances
    /// immediately.
    fn watch_our_htlc_outputs(
        &mut self,
        peer: &Peer,
        tx: &Transaction,
        tous_timeout: Input,
        tothem_spent: Input,
        tothem_timeout: Input,
    ) -> bool;

    /// Watches HTLC outputs of their broadcast commitment. Returns whether
    /// any outputs existed.
    fn watch_their_htlc_outputs(
        &mut self,
        peer: &Peer,
        event: &ChainEvent,
        tous_timeout: Input,
        tothem_spent: Input,
        tothem_timeout: Input,
    ) -> bool;

    /// Stops watching one HTLC output; `all_done` fires once no HTLC
    /// watches remain.
    fn unwatch_htlc_output(&mut self, peer: &Peer, htlc: &Htlc, all_done: Input);

    /// Stops watching all HTLC outputs at once.
    fn unwatch_all_htlc_outputs(&mut self, peer: &Peer);

    /// Watches our spend of an HTLC output until it is buried.
    fn watch_htlc_spend(
        &mut self,
        peer: &Peer,
        tx: &Transaction,
        htlc: &Htlc,
        done: Input,
    );

    /// Stops watching our HTLC spend; `all_done` fires once nothing
    /// remains watched.
    fn unwatch_htlc_spend(&mut self, peer: &Peer, htlc: &Htlc, all_done: Input);

    /// Delivers `all_done` once no HTLCs remain in the commitment
    /// transactions of either side.
    fn watch_htlcs_cleared(&mut self, peer: &Peer, all_done: Input);
}

/// Construction of channel transactions.
///
/// Builders are pure constructors over the peer context; they do not sign
/// with keys they do not hold. Returned transactions are owned by the caller
/// for the duration of the transition.
pub trait TxBuilder {
    /// Starts asynchronous construction of our anchor; `done` is delivered
    /// when the transaction is ready.
    fn create_anchor(&mut self, peer: &Peer, done: Input);

    /// Releases the utxos reserved for an anchor that will not be
    /// broadcast. If `done` is not [`Input::None`], an in-flight
    /// `create_anchor` with that completion input is cancelled too.
    fn release_anchor(&mut self, peer: &Peer, done: Input);

    /// Our anchor transaction.
    fn anchor_tx(&self, peer: &Peer) -> Transaction;

    /// Mutual close transaction at the given fee.
    fn close_tx(&self, peer: &Peer, fee: u64) -> Transaction;

    /// Our current commitment transaction, reflecting staged changes.
    fn commit_tx(&self, peer: &Peer) -> Transaction;

    /// Spend of the delayed output of our broadcast commitment.
    fn spend_ours_tx(&self, peer: &Peer) -> Transaction;

    /// Spend of the outputs accruing to us on their broadcast commitment.
    fn spend_theirs_tx(&self, peer: &Peer, event: &ChainEvent) -> Transaction;

    /// Punishment transaction taking every output of a revoked commitment.
    fn steal_tx(
        &self,
        peer: &Peer,
        event: &ChainEvent,
        revocation_secret: Slice32,
    ) -> Transaction;

    /// Refund collection of an HTLC output past its timeout.
    fn htlc_timeout_tx(&self, peer: &Peer, htlc: &Htlc) -> Transaction;

    /// Collection of an HTLC output whose preimage we know.
    fn htlc_spend_tx(&self, peer: &Peer, htlc: &Htlc) -> Transaction;
}

/// Fee policy for the mutual close negotiation.
pub trait FeePolicy {
    /// Computes the close fee we are willing to offer.
    fn calculate_close_fee(&self, peer: &Peer) -> u64;
}

/// Extraction of HTLC preimages from observed on-chain spends.
pub trait HtlcDiscovery {
    /// Parses an on-chain spend and returns the HTLC whose preimage it
    /// revealed, if any.
    fn tx_revealed_r_value(
        &self,
        peer: &Peer,
        event: &ChainEvent,
    ) -> Option<(u64, HashPreimage)>;
}

/// Verification of counterparty signatures over channel transactions.
pub trait SigValidation {
    /// Checks their signature over the given commitment transaction.
    fn check_commit_sig(
        &self,
        peer: &Peer,
        commit_tx: &Transaction,
        sig: &Signature,
    ) -> bool;

    /// Checks their signature over the mutual close transaction at the
    /// given fee.
    fn check_close_sig(
        &self,
        peer: &Peer,
        close_tx: &Transaction,
        fee: u64,
        sig: &Signature,
    ) -> bool;
}

/// The full collaborator set the transition function runs against.
pub trait Collaborators:
    PacketQueue
    + ChainWatcher
    + TxBuilder
    + FeePolicy
    + HtlcDiscovery
    + SigValidation
{
}

impl<T> Collaborators for T where
    T: PacketQueue
        + ChainWatcher
        + TxBuilder
        + FeePolicy
        + HtlcDiscovery
        + SigValidation
{
}
