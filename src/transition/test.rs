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

//! Scenario and property tests driving the machine through a recording
//! mock of all collaborator interfaces.

use amplify::{Slice32, Wrapper};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{PackedLockTime, Script, Transaction, TxOut};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, SecretKey, SECP256K1};

use super::state;
use crate::command::{AddHtlc, Command, CommandStatus, FulfillHtlc};
use crate::effects::{
    ChainWatcher, FeePolicy, HtlcDiscovery, Outcome, PacketQueue,
    SigValidation, TxBuilder,
};
use crate::htlc::{Htlc, HtlcProgress, HtlcRef, HtlcState, Party};
use crate::input::{Input, InputData};
use crate::messages::{
    AnchorOffer, CloseClearing, CloseSignature, Open, OpenAnchor,
    OpenCommitSig, OpenComplete, Pkt, UpdateAddHtlc, UpdateCommit,
    UpdateFulfillHtlc, UpdateRevocation,
};
use crate::peer::{ChainEvent, ChannelParams, OnchainResolution, Peer};
use crate::state::ChannelState;

// Transaction markers produced by the mock builder, recovered from the
// lock time of a broadcast transaction.
const MARKER_ANCHOR: u32 = 900_001;
const MARKER_COMMIT: u32 = 900_002;
const MARKER_SPEND_OURS: u32 = 900_003;
const MARKER_SPEND_THEIRS: u32 = 900_004;
const MARKER_STEAL: u32 = 900_005;
const MARKER_CLOSE_BASE: u32 = 800_000;
const MARKER_HTLC_TIMEOUT_BASE: u32 = 700_000;
const MARKER_HTLC_SPEND_BASE: u32 = 710_000;

fn marker_tx(marker: u32) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime(marker),
        input: vec![],
        output: vec![],
    }
}

fn marker(tx: &Transaction) -> u32 {
    tx.lock_time.0
}

fn sig(seed: u8) -> Signature {
    let sk = SecretKey::from_slice(&[seed; 32]).expect("static test key");
    let msg = Message::from_slice(&[seed; 32]).expect("static test digest");
    SECP256K1.sign_ecdsa(&msg, &sk)
}

fn rsecret(n: u8) -> Slice32 {
    Slice32::from([n; 32])
}

fn rhash(n: u8) -> Slice32 {
    Slice32::from(sha256::Hash::hash(rsecret(n).as_inner()).into_inner())
}

fn anchor_tx() -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime(0),
        input: vec![],
        output: vec![TxOut {
            value: 1_000_000,
            script_pubkey: Script::new(),
        }],
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Effect {
    QueuePkt(String),
    QueueErr(String),
    WatchAnchor {
        depthok: Input,
        timeout: Input,
    },
    UnwatchAnchorDepth,
    WatchDelayed(Input),
    WatchTx {
        marker: u32,
        done: Input,
    },
    WatchClose {
        done: Input,
        timedout: Input,
    },
    UnwatchCloseTimeout,
    WatchOurHtlcOutputs,
    WatchTheirHtlcOutputs,
    UnwatchHtlcOutput(HtlcRef),
    UnwatchAllHtlcOutputs,
    WatchHtlcSpend(HtlcRef),
    UnwatchHtlcSpend(HtlcRef),
    WatchHtlcsCleared,
    CreateAnchor(Input),
    ReleaseAnchor(Input),
}

/// Recording mock of every collaborator interface.
#[derive(Default)]
struct Harness {
    effects: Vec<Effect>,
    steal_secrets: std::cell::RefCell<Vec<Slice32>>,
    bad_sig: Option<Signature>,
    revealed: Option<(u64, HashPreimage)>,
}

impl Harness {
    fn queued(&self, name: &str) -> usize {
        self.effects
            .iter()
            .filter(|e| matches!(e, Effect::QueuePkt(n) if n.as_str() == name))
            .count()
    }

    fn queued_err(&self) -> Option<&String> {
        self.effects.iter().find_map(|e| match e {
            Effect::QueueErr(msg) => Some(msg),
            _ => None,
        })
    }
}

impl PacketQueue for Harness {
    fn queue_pkt_open(&mut self, _peer: &Peer, _anchor_offer: AnchorOffer) {
        self.effects.push(Effect::QueuePkt("open".to_string()));
    }
    fn queue_pkt_anchor(&mut self, _peer: &Peer) {
        self.effects.push(Effect::QueuePkt("open_anchor".to_string()));
    }
    fn queue_pkt_open_commit_sig(&mut self, _peer: &Peer) {
        self.effects
            .push(Effect::QueuePkt("open_commit_sig".to_string()));
    }
    fn queue_pkt_open_complete(&mut self, _peer: &Peer) {
        self.effects
            .push(Effect::QueuePkt("open_complete".to_string()));
    }
    fn queue_pkt_htlc_add(&mut self, _peer: &Peer, _progress: &HtlcProgress) {
        self.effects.push(Effect::QueuePkt("htlc_add".to_string()));
    }
    fn queue_pkt_htlc_fulfill(
        &mut self,
        _peer: &Peer,
        _progress: &HtlcProgress,
    ) {
        self.effects
            .push(Effect::QueuePkt("htlc_fulfill".to_string()));
    }
    fn queue_pkt_htlc_fail(&mut self, _peer: &Peer, _progress: &HtlcProgress) {
        self.effects.push(Effect::QueuePkt("htlc_fail".to_string()));
    }
    fn queue_pkt_commit(&mut self, _peer: &Peer) {
        self.effects.push(Effect::QueuePkt("commit".to_string()));
    }
    fn queue_pkt_revocation(&mut self, _peer: &Peer) {
        self.effects.push(Effect::QueuePkt("revocation".to_string()));
    }
    fn queue_pkt_close_clearing(&mut self, _peer: &Peer) {
        self.effects
            .push(Effect::QueuePkt("close_clearing".to_string()));
    }
    fn queue_pkt_close_signature(&mut self, _peer: &Peer, fee: u64) {
        self.effects
            .push(Effect::QueuePkt(format!("close_signature({})", fee)));
    }
    fn queue_pkt_err(&mut self, _peer: &Peer, err: Pkt) {
        match err {
            Pkt::Error(err) => {
                self.effects.push(Effect::QueueErr(err.message))
            }
            _ => panic!("queue_pkt_err must carry an error packet"),
        }
    }
}

impl ChainWatcher for Harness {
    fn watch_anchor(
        &mut self,
        _peer: &Peer,
        depthok: Input,
        timeout: Input,
        _unspent: Input,
        _theyspent: Input,
        _otherspent: Input,
    ) {
        self.effects.push(Effect::WatchAnchor { depthok, timeout });
    }
    fn unwatch_anchor_depth(
        &mut self,
        _peer: &Peer,
        _depthok: Input,
        _timeout: Input,
    ) {
        self.effects.push(Effect::UnwatchAnchorDepth);
    }
    fn watch_delayed(
        &mut self,
        _peer: &Peer,
        _tx: &Transaction,
        canspend: Input,
    ) {
        self.effects.push(Effect::WatchDelayed(canspend));
    }
    fn watch_tx(&mut self, _peer: &Peer, tx: &Transaction, done: Input) {
        self.effects.push(Effect::WatchTx {
            marker: marker(tx),
            done,
        });
    }
    fn watch_close(&mut self, _peer: &Peer, done: Input, timedout: Input) {
        self.effects.push(Effect::WatchClose { done, timedout });
    }
    fn unwatch_close_timeout(&mut self, _peer: &Peer, _timedout: Input) {
        self.effects.push(Effect::UnwatchCloseTimeout);
    }
    fn watch_our_htlc_outputs(
        &mut self,
        peer: &Peer,
        _tx: &Transaction,
        _tous_timeout: Input,
        _tothem_spent: Input,
        _tothem_timeout: Input,
    ) -> bool {
        self.effects.push(Effect::WatchOurHtlcOutputs);
        peer.committed_to_htlcs()
    }
    fn watch_their_htlc_outputs(
        &mut self,
        peer: &Peer,
        _event: &ChainEvent,
        _tous_timeout: Input,
        _tothem_spent: Input,
        _tothem_timeout: Input,
    ) -> bool {
        self.effects.push(Effect::WatchTheirHtlcOutputs);
        peer.committed_to_htlcs()
    }
    fn unwatch_htlc_output(
        &mut self,
        _peer: &Peer,
        htlc: &Htlc,
        _all_done: Input,
    ) {
        self.effects.push(Effect::UnwatchHtlcOutput(HtlcRef {
            side: htlc.direction,
            id: htlc.id,
        }));
    }
    fn unwatch_all_htlc_outputs(&mut self, _peer: &Peer) {
        self.effects.push(Effect::UnwatchAllHtlcOutputs);
    }
    fn watch_htlc_spend(
        &mut self,
        _peer: &Peer,
        _tx: &Transaction,
        htlc: &Htlc,
        _done: Input,
    ) {
        self.effects.push(Effect::WatchHtlcSpend(HtlcRef {
            side: htlc.direction,
            id: htlc.id,
        }));
    }
    fn unwatch_htlc_spend(
        &mut self,
        _peer: &Peer,
        htlc: &Htlc,
        _all_done: Input,
    ) {
        self.effects.push(Effect::UnwatchHtlcSpend(HtlcRef {
            side: htlc.direction,
            id: htlc.id,
        }));
    }
    fn watch_htlcs_cleared(&mut self, _peer: &Peer, _all_done: Input) {
        self.effects.push(Effect::WatchHtlcsCleared);
    }
}

impl TxBuilder for Harness {
    fn create_anchor(&mut self, _peer: &Peer, done: Input) {
        self.effects.push(Effect::CreateAnchor(done));
    }
    fn release_anchor(&mut self, _peer: &Peer, done: Input) {
        self.effects.push(Effect::ReleaseAnchor(done));
    }
    fn anchor_tx(&self, _peer: &Peer) -> Transaction {
        marker_tx(MARKER_ANCHOR)
    }
    fn close_tx(&self, _peer: &Peer, fee: u64) -> Transaction {
        marker_tx(MARKER_CLOSE_BASE + fee as u32)
    }
    fn commit_tx(&self, _peer: &Peer) -> Transaction {
        marker_tx(MARKER_COMMIT)
    }
    fn spend_ours_tx(&self, _peer: &Peer) -> Transaction {
        marker_tx(MARKER_SPEND_OURS)
    }
    fn spend_theirs_tx(&self, _peer: &Peer, _event: &ChainEvent) -> Transaction {
        marker_tx(MARKER_SPEND_THEIRS)
    }
    fn steal_tx(
        &self,
        _peer: &Peer,
        _event: &ChainEvent,
        revocation_secret: Slice32,
    ) -> Transaction {
        self.steal_secrets.borrow_mut().push(revocation_secret);
        marker_tx(MARKER_STEAL)
    }
    fn htlc_timeout_tx(&self, _peer: &Peer, htlc: &Htlc) -> Transaction {
        marker_tx(MARKER_HTLC_TIMEOUT_BASE + htlc.id as u32)
    }
    fn htlc_spend_tx(&self, _peer: &Peer, htlc: &Htlc) -> Transaction {
        marker_tx(MARKER_HTLC_SPEND_BASE + htlc.id as u32)
    }
}

impl FeePolicy for Harness {
    fn calculate_close_fee(&self, _peer: &Peer) -> u64 {
        5000
    }
}

impl HtlcDiscovery for Harness {
    fn tx_revealed_r_value(
        &self,
        _peer: &Peer,
        _event: &ChainEvent,
    ) -> Option<(u64, HashPreimage)> {
        self.revealed
    }
}

impl SigValidation for Harness {
    fn check_commit_sig(
        &self,
        _peer: &Peer,
        _commit_tx: &Transaction,
        sig: &Signature,
    ) -> bool {
        self.bad_sig.as_ref() != Some(sig)
    }
    fn check_close_sig(
        &self,
        _peer: &Peer,
        _close_tx: &Transaction,
        _fee: u64,
        sig: &Signature,
    ) -> bool {
        self.bad_sig.as_ref() != Some(sig)
    }
}

struct Fixture {
    peer: Peer,
    ctx: Harness,
}

impl Fixture {
    fn new() -> Fixture {
        Fixture {
            peer: Peer::new(ChannelParams::default()),
            ctx: Harness::default(),
        }
    }

    fn step(&mut self, input: Input, idata: InputData) -> Outcome {
        state(&mut self.peer, input, &idata, &mut self.ctx)
    }

    fn step_pkt(&mut self, pkt: Pkt) -> Outcome {
        let input = Input::from(&pkt);
        self.step(input, InputData::Pkt(pkt))
    }

    fn step_cmd(&mut self, cmd: Command) -> Outcome {
        let input = match cmd {
            Command::OpenWithAnchor(_) => Input::CmdOpenWithAnchor,
            Command::OpenWithoutAnchor(_) => Input::CmdOpenWithoutAnchor,
            Command::SendHtlcAdd(_) => Input::CmdSendHtlcAdd,
            Command::SendHtlcFulfill(_) => Input::CmdSendHtlcFulfill,
            Command::SendHtlcFail(_) => Input::CmdSendHtlcFail,
            Command::Close => Input::CmdClose,
        };
        self.step(input, InputData::Cmd(cmd))
    }

    fn step_bare(&mut self, input: Input) -> Outcome {
        self.step(input, InputData::None)
    }
}

fn their_open(anchor_offer: AnchorOffer) -> Open {
    Open {
        version: crate::accept::PROTOCOL_VERSION,
        anchor_offer,
        commit_fee_rate: 253,
        min_depth: 3,
        reserve_sat: 10_000,
        to_self_delay: 144,
        htlc_minimum_msat: 1000,
        max_htlc_value_in_flight_msat: 5_000_000_000,
        max_accepted_htlcs: 30,
        next_revocation_hash: rhash(1),
    }
}

/// Drives a fresh funder-side fixture through the whole opening handshake
/// into normal operation.
fn opened_fixture() -> Fixture {
    let mut f = Fixture::new();

    let outcome =
        f.step_cmd(Command::OpenWithAnchor(ChannelParams::default()));
    assert_eq!(outcome.status, CommandStatus::InProgress);
    assert_eq!(f.peer.state(), ChannelState::OpenWaitForAnchorCreate);

    let outcome = f.step(
        Input::BitcoinAnchorCreated,
        InputData::Btc(ChainEvent::tx(anchor_tx())),
    );
    assert!(outcome.broadcast.is_none());
    assert_eq!(f.peer.state(), ChannelState::OpenWaitForOpenWithAnchor);
    assert_eq!(f.ctx.queued("open"), 1);

    let outcome =
        f.step_pkt(Pkt::Open(their_open(AnchorOffer::WontCreateAnchor)));
    assert_eq!(outcome.status, CommandStatus::None);
    assert_eq!(f.peer.state(), ChannelState::OpenWaitForCommitSig);
    assert_eq!(f.ctx.queued("open_anchor"), 1);

    let outcome = f.step_pkt(Pkt::OpenCommitSig(OpenCommitSig {
        commit_sig: sig(11),
    }));
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_ANCHOR)
    );
    assert_eq!(f.peer.state(), ChannelState::OpenWaitingOurAnchor);
    assert!(f.ctx.effects.contains(&Effect::WatchAnchor {
        depthok: Input::BitcoinAnchorDepthOk,
        timeout: Input::None,
    }));

    let outcome = f.step_bare(Input::BitcoinAnchorDepthOk);
    assert!(outcome.broadcast.is_none());
    assert_eq!(f.peer.state(), ChannelState::OpenWaitForCompleteOurAnchor);
    assert_eq!(f.ctx.queued("open_complete"), 1);

    let outcome = f.step_pkt(Pkt::OpenComplete(OpenComplete::default()));
    assert_eq!(outcome.status, CommandStatus::Succeeded);
    assert_eq!(f.peer.state(), ChannelState::Normal);
    assert!(f.peer.current_cmd().is_none());

    f
}

fn payment_preimage() -> HashPreimage {
    HashPreimage::from(Slice32::from([9u8; 32]))
}

/// Sends one HTLC and settles it through their fulfilment, mirroring the
/// add/fulfill round-trip scenario.
fn settled_htlc_fixture() -> Fixture {
    let mut f = opened_fixture();
    let preimage = payment_preimage();

    let outcome = f.step_cmd(Command::SendHtlcAdd(AddHtlc {
        amount_msat: 100_000,
        payment_hash: HashLock::from(preimage),
        cltv_expiry: 500,
    }));
    assert_eq!(outcome.status, CommandStatus::InProgress);
    assert_eq!(f.ctx.queued("htlc_add"), 1);
    assert_eq!(f.ctx.queued("commit"), 1);
    assert!(f.peer.awaiting_revocation());

    let outcome = f.step_pkt(Pkt::UpdateCommit(UpdateCommit {
        commit_sig: sig(12),
    }));
    assert_eq!(outcome.status, CommandStatus::None);
    assert_eq!(f.ctx.queued("revocation"), 1);

    let outcome = f.step_pkt(Pkt::UpdateRevocation(UpdateRevocation {
        revocation_secret: rsecret(1),
        next_revocation_hash: rhash(2),
    }));
    assert_eq!(outcome.status, CommandStatus::Succeeded);
    assert!(f.peer.committed_to_htlcs());
    assert_eq!(
        f.peer.htlc(HtlcRef { side: Party::Local, id: 0 }).unwrap().state,
        HtlcState::Committed
    );

    let outcome = f.step_pkt(Pkt::UpdateFulfillHtlc(UpdateFulfillHtlc {
        id: 0,
        payment_preimage: preimage,
    }));
    assert_eq!(outcome.status, CommandStatus::None);

    let outcome = f.step_pkt(Pkt::UpdateCommit(UpdateCommit {
        commit_sig: sig(13),
    }));
    assert_eq!(outcome.status, CommandStatus::None);
    assert_eq!(f.ctx.queued("revocation"), 2);
    assert_eq!(f.ctx.queued("commit"), 2);

    let outcome = f.step_pkt(Pkt::UpdateRevocation(UpdateRevocation {
        revocation_secret: rsecret(2),
        next_revocation_hash: rhash(3),
    }));
    assert_eq!(outcome.status, CommandStatus::None);
    assert!(!f.peer.committed_to_htlcs());

    f
}

#[test]
fn s1_mutual_open_and_close() {
    let mut f = opened_fixture();

    let outcome = f.step_cmd(Command::Close);
    assert_eq!(outcome.status, CommandStatus::InProgress);
    assert_eq!(f.peer.state(), ChannelState::UsClearing);
    assert_eq!(f.ctx.queued("close_clearing"), 1);

    let outcome = f.step_pkt(Pkt::CloseClearing(CloseClearing {
        script_pubkey: Script::from(vec![0x51]),
    }));
    assert_eq!(outcome.status, CommandStatus::None);
    // no HTLCs: fee negotiation starts at once
    assert_eq!(f.peer.state(), ChannelState::WaitForCloseSig);
    assert_eq!(f.ctx.queued("close_clearing"), 2);
    assert_eq!(f.ctx.queued("close_signature(5000)"), 1);
    assert!(f.ctx.effects.contains(&Effect::WatchClose {
        done: Input::BitcoinCloseDone,
        timedout: Input::CloseCompleteTimeout,
    }));

    let outcome = f.step_pkt(Pkt::CloseSignature(CloseSignature {
        close_fee: 5000,
        sig: sig(14),
    }));
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_CLOSE_BASE + 5000)
    );
    assert_eq!(f.peer.state(), ChannelState::OnchainMutual);
    assert!(f.ctx.effects.contains(&Effect::UnwatchCloseTimeout));
    assert!(f.peer.has_close_sig());

    let outcome = f.step_bare(Input::BitcoinCloseDone);
    assert_eq!(outcome.status, CommandStatus::Succeeded);
    assert_eq!(f.peer.state(), ChannelState::Closed);
    assert!(f.peer.anchor().is_none());
}

#[test]
fn s2_add_then_fulfill_htlc() {
    let f = settled_htlc_fixture();
    let htlc = f
        .peer
        .htlc(HtlcRef {
            side: Party::Local,
            id: 0,
        })
        .unwrap();
    assert_eq!(htlc.state, HtlcState::Dead {
        preimage: Some(payment_preimage())
    });
}

#[test]
fn their_add_and_our_fulfill() {
    let mut f = opened_fixture();
    let preimage = payment_preimage();

    let outcome = f.step_pkt(Pkt::UpdateAddHtlc(UpdateAddHtlc {
        id: 0,
        amount_msat: 40_000,
        payment_hash: HashLock::from(preimage),
        cltv_expiry: 450,
    }));
    assert_eq!(outcome.status, CommandStatus::None);

    // their add lands in our commitment; we owe them one for the same
    // change
    let outcome = f.step_pkt(Pkt::UpdateCommit(UpdateCommit {
        commit_sig: sig(21),
    }));
    assert_eq!(outcome.status, CommandStatus::None);
    assert_eq!(f.ctx.queued("revocation"), 1);
    assert_eq!(f.ctx.queued("commit"), 1);

    let outcome = f.step_pkt(Pkt::UpdateRevocation(UpdateRevocation {
        revocation_secret: rsecret(1),
        next_revocation_hash: rhash(2),
    }));
    assert_eq!(outcome.status, CommandStatus::None);
    assert_eq!(
        f.peer
            .htlc(HtlcRef {
                side: Party::Remote,
                id: 0
            })
            .unwrap()
            .state,
        HtlcState::Committed
    );

    let outcome = f.step_cmd(Command::SendHtlcFulfill(FulfillHtlc {
        id: 0,
        payment_preimage: preimage,
    }));
    assert_eq!(outcome.status, CommandStatus::InProgress);
    assert_eq!(f.ctx.queued("htlc_fulfill"), 1);
    assert_eq!(f.ctx.queued("commit"), 2);

    let outcome = f.step_pkt(Pkt::UpdateCommit(UpdateCommit {
        commit_sig: sig(22),
    }));
    assert_eq!(outcome.status, CommandStatus::None);

    let outcome = f.step_pkt(Pkt::UpdateRevocation(UpdateRevocation {
        revocation_secret: rsecret(2),
        next_revocation_hash: rhash(3),
    }));
    assert_eq!(outcome.status, CommandStatus::Succeeded);
    assert!(!f.peer.committed_to_htlcs());
}

#[test]
fn s3_revoked_commitment_is_stolen() {
    let mut f = settled_htlc_fixture();
    // two revocations seen; they broadcast the first (revoked) commitment
    assert_eq!(f.peer.remote_commit().number, 2);

    let event = ChainEvent {
        tx: marker_tx(1),
        commitment_number: Some(0),
        htlc_id: None,
    };
    let outcome =
        f.step(Input::BitcoinAnchorTheySpent, InputData::Btc(event));
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_STEAL)
    );
    assert_eq!(f.peer.state(), ChannelState::OnchainSteal);
    assert!(f.ctx.effects.contains(&Effect::WatchTx {
        marker: MARKER_STEAL,
        done: Input::BitcoinStealDone,
    }));
    assert!(f.ctx.effects.contains(&Effect::WatchTheirHtlcOutputs));
    // the punishment uses the secret their first revocation revealed
    assert_eq!(f.ctx.steal_secrets.borrow().as_slice(), &[rsecret(1)]);

    let outcome = f.step_bare(Input::BitcoinStealDone);
    assert_eq!(outcome.status, CommandStatus::None);
    assert_eq!(f.peer.state(), ChannelState::Closed);
}

#[test]
fn s4_their_anchor_times_out() {
    let mut f = Fixture::new();

    let outcome =
        f.step_cmd(Command::OpenWithoutAnchor(ChannelParams::default()));
    assert_eq!(outcome.status, CommandStatus::InProgress);
    assert_eq!(f.ctx.queued("open"), 1);

    f.step_pkt(Pkt::Open(their_open(AnchorOffer::WillCreateAnchor)));
    assert_eq!(f.peer.state(), ChannelState::OpenWaitForAnchor);

    let outcome = f.step_pkt(Pkt::OpenAnchor(OpenAnchor {
        txid: anchor_tx().txid(),
        output_index: 0,
        amount: 1_000_000,
        script_pubkey: Script::from(vec![0x51]),
    }));
    assert_eq!(outcome.status, CommandStatus::None);
    assert_eq!(f.peer.state(), ChannelState::OpenWaitingTheirAnchor);
    assert_eq!(f.ctx.queued("open_commit_sig"), 1);
    assert!(f.ctx.effects.contains(&Effect::WatchAnchor {
        depthok: Input::BitcoinAnchorDepthOk,
        timeout: Input::BitcoinAnchorTimeout,
    }));

    let outcome = f.step_bare(Input::BitcoinAnchorTimeout);
    assert_eq!(outcome.status, CommandStatus::Failed);
    assert!(outcome.broadcast.is_none());
    assert_eq!(f.peer.state(), ChannelState::ErrAnchorTimeout);
}

#[test]
fn s5_unexpected_packet_in_steady_state() {
    let mut f = opened_fixture();

    let outcome =
        f.step_pkt(Pkt::Open(their_open(AnchorOffer::WontCreateAnchor)));
    assert_eq!(f.peer.state(), ChannelState::ErrProtocol);
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_COMMIT)
    );
    let err = f.ctx.queued_err().expect("error packet must be queued");
    assert!(err.contains("unexpected packet"));
}

#[test]
fn s6_htlc_timeout_on_our_commit() {
    let mut f = opened_fixture();
    // our commitment with one offered HTLC is on-chain
    let href = HtlcRef {
        side: Party::Local,
        id: 0,
    };
    f.peer.offered.insert(0, Htlc {
        id: 0,
        direction: Party::Local,
        amount_msat: 100_000,
        payment_hash: HashLock::from(payment_preimage()),
        cltv_expiry: 500,
        state: HtlcState::Committed,
    });
    f.peer.state = ChannelState::OnchainOurCommit;
    f.peer.onchain = Some(OnchainResolution {
        primary_buried: false,
        htlcs_done: false,
    });

    let outcome =
        f.step(Input::BitcoinHtlcToUsTimeout, InputData::Htlc(href));
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_HTLC_TIMEOUT_BASE)
    );
    assert!(f.ctx.effects.contains(&Effect::UnwatchHtlcOutput(href)));
    assert!(f.ctx.effects.contains(&Effect::WatchHtlcSpend(href)));
    assert_eq!(f.peer.htlc(href).unwrap().state, HtlcState::OnchainResolved {
        preimage: None
    });

    let outcome = f.step(Input::BitcoinHtlcSpendDone, InputData::Htlc(href));
    assert_eq!(outcome.status, CommandStatus::None);
    assert!(f.ctx.effects.contains(&Effect::UnwatchHtlcSpend(href)));

    f.step_bare(Input::AllHtlcsDone);
    assert_eq!(f.peer.state(), ChannelState::OnchainOurCommit);

    let outcome = f.step_bare(Input::BitcoinCommitDelayPassed);
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_SPEND_OURS)
    );

    let outcome = f.step_bare(Input::BitcoinSpendOursDone);
    assert_eq!(outcome.status, CommandStatus::None);
    assert_eq!(f.peer.state(), ChannelState::Closed);
}

#[test]
fn absorbing_terminal_states() {
    let terminals = ChannelState::ALL
        .into_iter()
        .filter(|state| state.is_terminal());
    for terminal in terminals {
        for input in Input::ALL {
            let mut f = Fixture::new();
            f.peer.state = terminal;
            let outcome = f.step_bare(input);
            assert_eq!(
                f.peer.state(),
                terminal,
                "input {} must not leave terminal state {}",
                input,
                terminal
            );
            assert!(outcome.broadcast.is_none());
            assert!(f.ctx.effects.is_empty());
            if input.is_cmd() {
                assert_eq!(outcome.status, CommandStatus::Failed);
            } else {
                assert_eq!(outcome.status, CommandStatus::None);
            }
        }
    }
}

#[test]
fn deterministic_replay() {
    let base = opened_fixture();
    let snapshot = base.peer.snapshot();
    let preimage = payment_preimage();

    let script = |f: &mut Fixture| -> Vec<CommandStatus> {
        let mut statuses = vec![];
        statuses.push(
            f.step_cmd(Command::SendHtlcAdd(AddHtlc {
                amount_msat: 100_000,
                payment_hash: HashLock::from(preimage),
                cltv_expiry: 500,
            }))
            .status,
        );
        statuses.push(
            f.step_pkt(Pkt::UpdateCommit(UpdateCommit {
                commit_sig: sig(12),
            }))
            .status,
        );
        statuses.push(
            f.step_pkt(Pkt::UpdateRevocation(UpdateRevocation {
                revocation_secret: rsecret(1),
                next_revocation_hash: rhash(2),
            }))
            .status,
        );
        statuses
    };

    let mut first = Fixture {
        peer: Peer::restore(snapshot.clone()),
        ctx: Harness::default(),
    };
    let mut second = Fixture {
        peer: Peer::restore(snapshot),
        ctx: Harness::default(),
    };
    let statuses_first = script(&mut first);
    let statuses_second = script(&mut second);

    assert_eq!(statuses_first, statuses_second);
    assert_eq!(first.ctx.effects, second.ctx.effects);
    assert_eq!(first.peer.snapshot(), second.peer.snapshot());
}

#[test]
fn at_most_one_outstanding_command() {
    let mut f = opened_fixture();
    let preimage = payment_preimage();

    let outcome = f.step_cmd(Command::SendHtlcAdd(AddHtlc {
        amount_msat: 100_000,
        payment_hash: HashLock::from(preimage),
        cltv_expiry: 500,
    }));
    assert_eq!(outcome.status, CommandStatus::InProgress);

    let outcome = f.step_cmd(Command::SendHtlcAdd(AddHtlc {
        amount_msat: 50_000,
        payment_hash: HashLock::from(preimage),
        cltv_expiry: 400,
    }));
    assert_eq!(outcome.status, CommandStatus::Failed);
    assert_eq!(f.peer.state(), ChannelState::Normal);
    assert!(f.peer.current_cmd().is_some());
    // only the first command staged anything
    assert_eq!(f.ctx.queued("htlc_add"), 1);
    assert_eq!(f.peer.next_htlc_id(), 1);
}

#[test]
fn close_preference_over_unilateral() {
    let mut f = opened_fixture();
    f.step_cmd(Command::Close);
    f.step_pkt(Pkt::CloseClearing(CloseClearing {
        script_pubkey: Script::from(vec![0x51]),
    }));
    assert_eq!(f.peer.state(), ChannelState::WaitForCloseSig);

    // a non-matching but acceptable counter-offer: we move to the midpoint
    let outcome = f.step_pkt(Pkt::CloseSignature(CloseSignature {
        close_fee: 7000,
        sig: sig(15),
    }));
    assert!(outcome.broadcast.is_none());
    assert_eq!(f.peer.state(), ChannelState::WaitForCloseSig);
    assert_eq!(f.ctx.queued("close_signature(6000)"), 1);
    assert!(f.peer.has_close_sig());

    // the negotiation stalls; their signed close still beats our commit
    let outcome = f.step_bare(Input::CloseCompleteTimeout);
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_CLOSE_BASE + 7000)
    );
    assert_eq!(f.peer.state(), ChannelState::OnchainMutual);
}

#[test]
fn rejected_command_keeps_channel_untouched() {
    let mut f = opened_fixture();
    let snapshot = f.peer.snapshot();

    let outcome = f.step_cmd(Command::SendHtlcFulfill(FulfillHtlc {
        id: 99,
        payment_preimage: payment_preimage(),
    }));
    assert_eq!(outcome.status, CommandStatus::Failed);
    assert_eq!(f.peer.snapshot(), snapshot);
}

#[test]
fn bad_commit_sig_is_a_protocol_violation() {
    let mut f = opened_fixture();
    f.ctx.bad_sig = Some(sig(66));
    let preimage = payment_preimage();

    f.step_cmd(Command::SendHtlcAdd(AddHtlc {
        amount_msat: 100_000,
        payment_hash: HashLock::from(preimage),
        cltv_expiry: 500,
    }));
    let outcome = f.step_pkt(Pkt::UpdateCommit(UpdateCommit {
        commit_sig: sig(66),
    }));
    assert_eq!(outcome.status, CommandStatus::Failed);
    assert_eq!(f.peer.state(), ChannelState::ErrProtocol);
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_COMMIT)
    );
    assert!(f.ctx.queued_err().is_some());
}

#[test]
fn preimage_revealed_onchain_pays_upstream() {
    let mut f = opened_fixture();
    let preimage = payment_preimage();
    // one offered and one received HTLC locked by the same hash, with
    // their commitment on-chain
    f.peer.offered.insert(0, Htlc {
        id: 0,
        direction: Party::Local,
        amount_msat: 100_000,
        payment_hash: HashLock::from(preimage),
        cltv_expiry: 500,
        state: HtlcState::Committed,
    });
    f.peer.received.insert(4, Htlc {
        id: 4,
        direction: Party::Remote,
        amount_msat: 90_000,
        payment_hash: HashLock::from(preimage),
        cltv_expiry: 450,
        state: HtlcState::Committed,
    });
    f.peer.state = ChannelState::OnchainTheirCommit;
    f.peer.onchain = Some(OnchainResolution {
        primary_buried: false,
        htlcs_done: false,
    });
    f.ctx.revealed = Some((0, preimage));

    let outcome = f.step(
        Input::BitcoinHtlcToThemSpent,
        InputData::Btc(ChainEvent {
            tx: marker_tx(2),
            commitment_number: None,
            htlc_id: Some(0),
        }),
    );
    // the offered HTLC is fulfilled for upstream and the received one is
    // collected with the learned preimage
    assert_eq!(
        outcome.broadcast.as_ref().map(marker),
        Some(MARKER_HTLC_SPEND_BASE + 4)
    );
    assert_eq!(
        f.peer
            .htlc(HtlcRef {
                side: Party::Local,
                id: 0
            })
            .unwrap()
            .state,
        HtlcState::OnchainResolved {
            preimage: Some(preimage)
        }
    );
    assert!(f.ctx.effects.contains(&Effect::WatchHtlcSpend(HtlcRef {
        side: Party::Remote,
        id: 4
    })));
}

#[test]
fn unknown_anchor_spend_is_an_information_leak() {
    let mut f = opened_fixture();
    let outcome = f.step(
        Input::BitcoinAnchorOtherSpent,
        InputData::Btc(ChainEvent {
            tx: marker_tx(3),
            commitment_number: None,
            htlc_id: None,
        }),
    );
    assert_eq!(f.peer.state(), ChannelState::ErrInformationLeak);
    // the anchor is gone; there is nothing of ours to broadcast
    assert!(outcome.broadcast.is_none());
}

#[test]
#[should_panic(expected = "impossible input")]
fn impossible_cell_is_loud() {
    let mut f = opened_fixture();
    f.step_bare(Input::BitcoinStealDone);
}
