//! replicant is a replicated state machine platform:  a cluster of daemons cooperatively orders
//! client commands and applies them deterministically to user-supplied objects, each hosted out of
//! process as a sandboxed child.  This crate holds the replicated-execution plane of the daemon
//! and the client core:  the object manager, the robust history behind exactly-once calls, the
//! client manager and failure tracker, and the client-side server selector and retry envelope.
//! The consensus plane feeds [Replica::enact] a stream of pvalues in strict ascending slot order
//! and everything else follows from there.

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR};
use zerror::Z;

use replicant_pb::{
    Command, CommandResponse, Configuration, Error, ObjectID, PValue, ReturnCode, ServerID,
};

pub mod atomic_io;
pub mod client;
pub mod client_manager;
pub mod conditions;
pub mod controller;
pub mod failure_tracker;
pub mod object_manager;
pub mod robust_history;
pub mod server_selector;

pub use client::{Client, ClientOptions, PendingRobust, Transport};
pub use client_manager::ClientManager;
pub use conditions::ConditionTable;
pub use controller::Controller;
pub use failure_tracker::FailureTracker;
pub use object_manager::{ObjectManager, ObjectManagerOptions, ObjectSnapshot, SnapshotSet};
pub use robust_history::RobustHistory;
pub use server_selector::ServerSelector;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ENACT: Counter = Counter::new("replicant.enact");
static ENACT_REMEMBERED: Counter = Counter::new("replicant.enact.remembered");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ENACT);
    collector.register_counter(&ENACT_REMEMBERED);
    client::register_biometrics(collector);
    client_manager::register_biometrics(collector);
    failure_tracker::register_biometrics(collector);
    object_manager::register_biometrics(collector);
    robust_history::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

////////////////////////////////////////// monotonic time //////////////////////////////////////////

/// Nanoseconds on the monotonic clock.  Liveness arithmetic runs on this clock so wall-clock
/// steps cannot manufacture or hide silence.
pub fn monotonic_time() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/////////////////////////////////////////// ReplicaOptions /////////////////////////////////////////

#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
pub struct ReplicaOptions {
    #[arrrg(nested)]
    pub objects: ObjectManagerOptions,
    #[arrrg(optional, "Milliseconds without proof of life before a replica is suspected.")]
    pub suspect_timeout_ms: u64,
    #[arrrg(optional, "Robust command outputs to remember for dedup.")]
    pub nonce_history: usize,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            objects: ObjectManagerOptions::default(),
            suspect_timeout_ms: 5_000,
            nonce_history: replicant_pb::SERVER_DRIVEN_NONCE_HISTORY,
        }
    }
}

////////////////////////////////////////// ReplicaSnapshot /////////////////////////////////////////

/// Everything a replica exports when consensus asks for a snapshot:  each object's snapshot plus
/// the serialized robust history, captured under a pinned history window.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplicaSnapshot {
    pub objects: SnapshotSet,
    pub history: Vec<u8>,
}

////////////////////////////////////////////// Replica /////////////////////////////////////////////

/// The replicated-execution plane of one daemon.  Consensus delivers ordered commands to
/// [Replica::enact]; everything downstream of the ordering decision lives here.
pub struct Replica {
    us: ServerID,
    options: ReplicaOptions,
    controller: Controller,
    objects: ObjectManager,
    history: RobustHistory,
    clients: ClientManager,
    failures: FailureTracker,
    enacted_through: u64,
}

impl Replica {
    pub fn new(us: ServerID, config: Configuration, options: ReplicaOptions) -> Self {
        let controller = Controller::new(config.clone());
        let objects = ObjectManager::new(options.objects.clone());
        let history = RobustHistory::with_capacity(options.nonce_history);
        let clients = ClientManager::new();
        let failures = FailureTracker::new(config, us);
        Self {
            us,
            options,
            controller,
            objects,
            history,
            clients,
            failures,
            enacted_through: 0,
        }
    }

    pub fn server_id(&self) -> ServerID {
        self.us
    }

    /// Consume one ordered command.  Robust commands consult the history first, so a command the
    /// cluster ordered twice executes once and answers identically both times; fresh executions
    /// record their outcome before the response leaves.
    pub fn enact(&mut self, p: &PValue) -> Result<CommandResponse, Error> {
        ENACT.click();
        if p.slot <= self.enacted_through {
            return Err(Error::logic("slots must be strictly increasing")
                .with_info("slot", p.slot)
                .with_info("enacted_through", self.enacted_through));
        }
        self.enacted_through = p.slot;
        let cmd = Command::from_pvalue(p)?;
        if cmd.is_robust() {
            if let Some((status, output)) = self.history.has_output(cmd.nonce, cmd.min_slot) {
                ENACT_REMEMBERED.click();
                return Ok(CommandResponse::new(cmd.nonce, status, output));
            }
        }
        let resp = self.objects.apply(&cmd)?;
        if cmd.is_robust() {
            self.history.executed(p, cmd.nonce, resp.status, &resp.output);
        }
        Ok(resp)
    }

    /// Construct a new object from library bytes delivered through consensus.
    pub fn new_object(&mut self, id: ObjectID, path: &[u8], lib: &[u8]) -> ReturnCode {
        match self.objects.create(id, path, lib) {
            Ok(()) => ReturnCode::Success,
            Err(Error::AlreadyExists { .. }) => ReturnCode::ObjExist,
            Err(err) => {
                clue!(COLLECTOR, ERROR, {
                    new_object_failed: {
                        object: id.get(),
                        what: err.to_string(),
                    },
                });
                ReturnCode::ServerError
            }
        }
    }

    pub fn del_object(&mut self, id: ObjectID) -> ReturnCode {
        match self.objects.del(id) {
            Ok(()) => ReturnCode::Success,
            Err(Error::NotFound { .. }) => ReturnCode::ObjNotFound,
            Err(err) => {
                clue!(COLLECTOR, ERROR, {
                    del_object_failed: {
                        object: id.get(),
                        what: err.to_string(),
                    },
                });
                ReturnCode::ServerError
            }
        }
    }

    pub fn restore_object(&mut self, id: ObjectID, path: &[u8], snapshot: &[u8]) -> ReturnCode {
        match self.objects.restore(id, path, snapshot) {
            Ok(()) => ReturnCode::Success,
            Err(Error::AlreadyExists { .. }) => ReturnCode::ObjExist,
            Err(Error::NotFound { .. }) => ReturnCode::ObjNotFound,
            Err(err) => {
                clue!(COLLECTOR, ERROR, {
                    restore_object_failed: {
                        object: id.get(),
                        what: err.to_string(),
                    },
                });
                ReturnCode::ServerError
            }
        }
    }

    /// Capture every object's snapshot and the robust history as one consistent set.  GC stays
    /// inhibited for the duration so the serialized window matches what the objects saw.
    pub fn take_snapshot(&mut self) -> Result<ReplicaSnapshot, Error> {
        self.history.inhibit_gc();
        let objects = self.objects.take_snapshot();
        let history = self.history.serialize();
        self.history.allow_gc();
        Ok(ReplicaSnapshot {
            objects: objects?,
            history,
        })
    }

    /// Rebuild objects and history from a snapshot set.  Slots after the snapshot are replayed by
    /// the consensus plane, not here.
    pub fn restore_from_snapshot(&mut self, snap: &ReplicaSnapshot) -> Result<(), Error> {
        for obj in snap.objects.objects.iter() {
            self.objects
                .restore(obj.id, obj.path.as_bytes(), &obj.snapshot)?;
        }
        self.history.deserialize(&snap.history)
    }

    /// Record a proof of life from a peer replica.
    pub fn proof_of_life(&mut self, si: ServerID) {
        self.failures.proof_of_life(si);
    }

    /// Whether `si` has been silent past the configured timeout, discounting our own isolation.
    pub fn suspect_failed(&mut self, si: ServerID) -> bool {
        let timeout = self.options.suspect_timeout_ms.saturating_mul(1_000_000);
        self.failures.suspect_failed(si, timeout)
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectManager {
        &mut self.objects
    }

    pub fn history(&self) -> &RobustHistory {
        &self.history
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut ClientManager {
        &mut self.clients
    }

    pub fn failures_mut(&mut self) -> &mut FailureTracker {
        &mut self.failures
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use replicant_pb::{ClientID, Server, CALL_IDEMPOTENT, CALL_ROBUST};
    use rsm::demos::{COUNTER, ECHO};
    use rsm::{ObjectInterface, StateMachine};

    use super::*;

    fn config() -> Configuration {
        Configuration {
            cluster: 1,
            version: 1,
            servers: vec![
                Server::new(ServerID::new(1), "one:2049"),
                Server::new(ServerID::new(2), "two:2049"),
            ],
        }
    }

    fn replica(nonce_history: usize) -> Replica {
        let options = ReplicaOptions {
            nonce_history,
            ..ReplicaOptions::default()
        };
        Replica::new(ServerID::new(1), config(), options)
    }

    fn adopt(
        replica: &mut Replica,
        id: ObjectID,
        rsm: &'static StateMachine,
    ) -> thread::JoinHandle<Result<(), Error>> {
        let (daemon, child) = UnixStream::pair().expect("socketpair");
        let handle = thread::spawn(move || {
            let mut intf = ObjectInterface::new(child);
            rsm::child::serve(&mut intf, rsm)
        });
        let (status, _) = replica.objects_mut().adopt(id, "demo.so", daemon).expect("adopt");
        assert_eq!(ReturnCode::Success, status);
        handle
    }

    fn robust(object: ObjectID, nonce: u64, min_slot: u64, func: &str, input: &[u8]) -> Command {
        Command {
            object,
            client: ClientID::new(7),
            nonce,
            flags: CALL_ROBUST,
            min_slot,
            func: func.to_string(),
            input: input.to_vec(),
        }
    }

    #[test]
    fn a_reordered_robust_command_executes_once() {
        let mut replica = replica(64);
        let id = ObjectID::new(1);
        let handle = adopt(&mut replica, id, &COUNTER);
        // the same logical command committed at two slots answers identically
        let cmd = robust(id, 42, 1, "counter", b"");
        let first = replica.enact(&cmd.to_pvalue(100)).unwrap();
        assert_eq!(ReturnCode::Success, first.status);
        assert_eq!(1u64.to_be_bytes().to_vec(), first.output);
        let second = replica.enact(&cmd.to_pvalue(101)).unwrap();
        assert_eq!(first.output, second.output);
        // a fresh nonce really executes
        let third = replica.enact(&robust(id, 43, 1, "counter", b"").to_pvalue(102)).unwrap();
        assert_eq!(2u64.to_be_bytes().to_vec(), third.output);
        replica.del_object(id);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn aged_window_answers_maybe() {
        let mut replica = replica(2);
        let id = ObjectID::new(1);
        let handle = adopt(&mut replica, id, &ECHO);
        for nonce in 1..=4u64 {
            replica
                .enact(&robust(id, nonce, nonce, "echo", b"x").to_pvalue(nonce))
                .unwrap();
        }
        // the window kept slots 3 and 4; a resubmission from before the window cannot be judged
        let resp = replica
            .enact(&robust(id, 99, 1, "echo", b"x").to_pvalue(5))
            .unwrap();
        assert_eq!(ReturnCode::Maybe, resp.status);
        assert!(resp.output.is_empty());
        replica.del_object(id);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn idempotent_commands_leave_no_history() {
        let mut replica = replica(64);
        let id = ObjectID::new(1);
        let handle = adopt(&mut replica, id, &ECHO);
        let cmd = Command {
            object: id,
            client: ClientID::new(7),
            nonce: 42,
            flags: CALL_IDEMPOTENT,
            min_slot: 0,
            func: "echo".to_string(),
            input: b"hi".to_vec(),
        };
        let resp = replica.enact(&cmd.to_pvalue(1)).unwrap();
        assert_eq!(ReturnCode::Success, resp.status);
        assert_eq!(b"hi".to_vec(), resp.output);
        assert!(replica.history().is_empty());
        replica.del_object(id);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn slots_must_advance() {
        let mut replica = replica(64);
        let id = ObjectID::new(1);
        let handle = adopt(&mut replica, id, &ECHO);
        let cmd = robust(id, 1, 1, "echo", b"");
        replica.enact(&cmd.to_pvalue(5)).unwrap();
        assert!(replica.enact(&robust(id, 2, 1, "echo", b"").to_pvalue(5)).is_err());
        assert!(replica.enact(&robust(id, 3, 1, "echo", b"").to_pvalue(4)).is_err());
        replica.del_object(id);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn failed_executions_are_remembered_verbatim() {
        let mut replica = replica(64);
        let id = ObjectID::new(1);
        let handle = adopt(&mut replica, id, &ECHO);
        let cmd = robust(id, 9, 1, "absent", b"");
        let first = replica.enact(&cmd.to_pvalue(10)).unwrap();
        assert_eq!(ReturnCode::FuncNotFound, first.status);
        let second = replica.enact(&cmd.to_pvalue(11)).unwrap();
        assert_eq!(ReturnCode::FuncNotFound, second.status);
        replica.del_object(id);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn object_lifecycle_verdicts() {
        let mut replica = replica(64);
        let id = ObjectID::new(1);
        let handle = adopt(&mut replica, id, &ECHO);
        assert_eq!(ReturnCode::ObjExist, replica.new_object(id, b"echo.so", b""));
        assert_eq!(
            ReturnCode::ServerError,
            replica.new_object(ObjectID::new(2), b"bad/path.so", b"")
        );
        assert_eq!(ReturnCode::Success, replica.del_object(id));
        assert_eq!(ReturnCode::ObjNotFound, replica.del_object(id));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn snapshot_captures_objects_and_history() {
        let mut replica = replica(64);
        let id = ObjectID::new(1);
        let handle = adopt(&mut replica, id, &COUNTER);
        replica
            .enact(&robust(id, 42, 1, "counter", b"").to_pvalue(100))
            .unwrap();
        let snap = replica.take_snapshot().unwrap();
        assert_eq!(1, snap.objects.objects.len());
        assert_eq!(1u64.to_be_bytes().to_vec(), snap.objects.objects[0].snapshot);
        let history = RobustHistory::new();
        history.deserialize(&snap.history).unwrap();
        assert_eq!(
            Some((ReturnCode::Success, 1u64.to_be_bytes().to_vec())),
            history.has_output(42, 50)
        );
        replica.del_object(id);
        handle.join().unwrap().unwrap();
    }
}
