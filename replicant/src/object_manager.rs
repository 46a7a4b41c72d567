//! The object manager owns every live object:  it forks the children, persists their libraries,
//! drives the host protocol from the daemon side, and collects snapshots.  Dispatch is
//! single-threaded per object over the synchronous socket; a protocol violation or short IO kills
//! the child and marks the object dead, and re-creation goes through restore plus external
//! replay.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use biometrics::{Collector, Counter, Moments};
use indicio::{clue, ERROR, INFO, WARNING};
use utf8path::Path;
use utilz::stopwatch::Stopwatch;
use zerror::Z;

use replicant_pb::{Command, CommandResponse, Error, ObjectID, ReturnCode};
use rsm::wire::{self, Response};
use rsm::Conditions;

use crate::conditions::ConditionTable;
use crate::{atomic_io, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CREATE: Counter = Counter::new("replicant.objects.create");
static RESTORE: Counter = Counter::new("replicant.objects.restore");
static SPAWN: Counter = Counter::new("replicant.objects.spawn");
static APPLY: Counter = Counter::new("replicant.objects.apply");
static APPLY_LATENCY: Moments = Moments::new("replicant.objects.apply.latency");
static SNAPSHOT: Counter = Counter::new("replicant.objects.snapshot");
static KILL: Counter = Counter::new("replicant.objects.kill");
static UNKNOWN_OBJECT: Counter = Counter::new("replicant.objects.unknown");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CREATE);
    collector.register_counter(&RESTORE);
    collector.register_counter(&SPAWN);
    collector.register_counter(&APPLY);
    collector.register_moments(&APPLY_LATENCY);
    collector.register_counter(&SNAPSHOT);
    collector.register_counter(&KILL);
    collector.register_counter(&UNKNOWN_OBJECT);
}

/////////////////////////////////////// ObjectManagerOptions ///////////////////////////////////////

#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
pub struct ObjectManagerOptions {
    #[arrrg(optional, "Directory under which object libraries are persisted.")]
    pub data_dir: String,
    #[arrrg(optional, "The object-child executable to spawn.")]
    pub child_executable: String,
}

impl Default for ObjectManagerOptions {
    fn default() -> Self {
        Self {
            data_dir: "objects".to_string(),
            child_executable: "replicant-rsm".to_string(),
        }
    }
}

////////////////////////////////////////////// Object //////////////////////////////////////////////

struct Object {
    path: String,
    pid: libc::pid_t,
    sock: UnixStream,
    conditions: ConditionTable,
    ticks: Vec<(String, u64)>,
}

///////////////////////////////////////////// snapshots ////////////////////////////////////////////

/// One object's snapshot as exported to the consensus plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectSnapshot {
    pub id: ObjectID,
    pub path: String,
    pub snapshot: Vec<u8>,
}

/// Every object's snapshot, captured in the daemon's call order (ascending object id).  The set
/// owns the bytes backing each snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SnapshotSet {
    pub objects: Vec<ObjectSnapshot>,
}

/////////////////////////////////////////// ObjectManager //////////////////////////////////////////

pub struct ObjectManager {
    options: ObjectManagerOptions,
    objects: BTreeMap<ObjectID, Object>,
}

impl ObjectManager {
    pub fn new(options: ObjectManagerOptions) -> Self {
        Self {
            options,
            objects: BTreeMap::new(),
        }
    }

    pub fn exists(&self, id: ObjectID) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn list(&self) -> Vec<ObjectID> {
        self.objects.keys().copied().collect()
    }

    /// Whether `path` may name an object library:  short enough to become a file name, and
    /// restricted to `[A-Za-z0-9._-]` plus NUL padding.
    pub fn valid_path(path: &[u8]) -> bool {
        if path.len() + 3 >= libc::PATH_MAX as usize {
            return false;
        }
        path.iter().all(|&c| {
            c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.' || c == 0
        })
    }

    fn path_to_str(path: &[u8]) -> Result<&str, Error> {
        if !Self::valid_path(path) {
            return Err(Error::logic("invalid object path"));
        }
        let end = path.iter().position(|&c| c == 0).unwrap_or(path.len());
        std::str::from_utf8(&path[..end]).map_err(|_| Error::logic("invalid object path"))
    }

    /// Persist `lib` under `path`, fork a child for it, and construct the object.  Duplicate ids
    /// fail before anything touches disk.
    pub fn create(&mut self, id: ObjectID, path: &[u8], lib: &[u8]) -> Result<(), Error> {
        if self.exists(id) {
            return Err(Error::already_exists(format!("{:?}", id)));
        }
        let name = Self::path_to_str(path)?;
        std::fs::create_dir_all(&self.options.data_dir)?;
        let library = Path::from(self.options.data_dir.as_str())
            .join(name)
            .into_owned();
        atomic_io::atomic_write(&library, lib)?;
        let mut obj = self.spawn(name, &library)?;
        CREATE.click();
        clue!(COLLECTOR, INFO, {
            create: {
                object: id.get(),
                path: name,
            },
        });
        let res = (|| -> Result<(ReturnCode, Vec<u8>), Error> {
            wire::write_ctor(&mut obj.sock)?;
            Self::pump(id, &mut obj)
        })();
        self.construct(id, obj, res, "ctor")
    }

    /// As create, but reconstruct from `snapshot`.  The library must already be on disk.
    pub fn restore(&mut self, id: ObjectID, path: &[u8], snapshot: &[u8]) -> Result<(), Error> {
        if self.exists(id) {
            return Err(Error::already_exists(format!("{:?}", id)));
        }
        let name = Self::path_to_str(path)?;
        let library = Path::from(self.options.data_dir.as_str())
            .join(name)
            .into_owned();
        if !library.exists() {
            return Err(Error::not_found(format!("library {}", library)));
        }
        let mut obj = self.spawn(name, &library)?;
        RESTORE.click();
        clue!(COLLECTOR, INFO, {
            restore: {
                object: id.get(),
                path: name,
            },
        });
        let res = (|| -> Result<(ReturnCode, Vec<u8>), Error> {
            wire::write_rtor(&mut obj.sock, snapshot)?;
            Self::pump(id, &mut obj)
        })();
        self.construct(id, obj, res, "rtor")
    }

    fn construct(
        &mut self,
        id: ObjectID,
        mut obj: Object,
        res: Result<(ReturnCode, Vec<u8>), Error>,
        what: &str,
    ) -> Result<(), Error> {
        match res {
            Ok((ReturnCode::Success, _)) => {
                self.objects.insert(id, obj);
                Ok(())
            }
            Ok((status, _)) => {
                Self::kill(&mut obj);
                Err(Error::object_failed(format!("{} returned {}", what, status)))
            }
            Err(err) => {
                Self::kill(&mut obj);
                Err(err.with_info("object", id))
            }
        }
    }

    /// Route one ordered command into its object and materialize the response envelope.  A dead
    /// object id draws OBJ_NOT_FOUND; a protocol or IO failure kills the child and surfaces.
    pub fn apply(&mut self, cmd: &Command) -> Result<CommandResponse, Error> {
        APPLY.click();
        let Some(obj) = self.objects.get_mut(&cmd.object) else {
            UNKNOWN_OBJECT.click();
            clue!(COLLECTOR, WARNING, {
                apply_unknown_object: cmd.object.get(),
            });
            return Ok(CommandResponse::new(
                cmd.nonce,
                ReturnCode::ObjNotFound,
                Vec::new(),
            ));
        };
        let stopwatch = Stopwatch::default();
        let res = (|| -> Result<(ReturnCode, Vec<u8>), Error> {
            wire::write_command(&mut obj.sock, &cmd.func, &cmd.input)?;
            Self::pump(cmd.object, obj)
        })();
        match res {
            Ok((status, output)) => {
                APPLY_LATENCY.add(stopwatch.since());
                Ok(CommandResponse::new(cmd.nonce, status, output))
            }
            Err(err) => {
                clue!(COLLECTOR, ERROR, {
                    apply_failed: {
                        object: cmd.object.get(),
                        what: err.to_string(),
                    },
                });
                self.fail(cmd.object);
                Err(err.with_info("object", cmd.object))
            }
        }
    }

    /// Snapshot every object in ascending id order.
    pub fn take_snapshot(&mut self) -> Result<SnapshotSet, Error> {
        SNAPSHOT.click();
        let mut set = SnapshotSet::default();
        let ids = self.list();
        for id in ids {
            let Some(obj) = self.objects.get_mut(&id) else {
                continue;
            };
            let res = (|| -> Result<Vec<u8>, Error> {
                wire::write_snapshot_request(&mut obj.sock)?;
                wire::read_snapshot_reply(&mut obj.sock)
            })();
            match res {
                Ok(snapshot) => {
                    set.objects.push(ObjectSnapshot {
                        id,
                        path: obj.path.clone(),
                        snapshot,
                    });
                }
                Err(err) => {
                    self.fail(id);
                    return Err(err.with_info("object", id));
                }
            }
        }
        Ok(set)
    }

    /// Shut an object down cleanly and forget it.
    pub fn del(&mut self, id: ObjectID) -> Result<(), Error> {
        let Some(mut obj) = self.objects.remove(&id) else {
            return Err(Error::not_found(format!("{:?}", id)));
        };
        match wire::write_shutdown(&mut obj.sock) {
            Ok(()) => {
                Self::reap(&mut obj);
                Ok(())
            }
            Err(err) => {
                Self::kill(&mut obj);
                Err(err.with_info("object", id))
            }
        }
    }

    /// The tick registrations the object has announced, most recent per function.
    pub fn tick_intervals(&self, id: ObjectID) -> Vec<(String, u64)> {
        self.objects
            .get(&id)
            .map(|obj| obj.ticks.clone())
            .unwrap_or_default()
    }

    fn spawn(&self, name: &str, library: &Path) -> Result<Object, Error> {
        let (sock, child_end) = UnixStream::pair()?;
        // the child end must survive exec
        let fd = child_end.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        let exe = CString::new(self.options.child_executable.as_str())
            .map_err(|_| Error::logic("child executable contains NUL"))?;
        let lib = CString::new(library.as_str())
            .map_err(|_| Error::logic("library path contains NUL"))?;
        let fd_env = CString::new(format!("FD={}", fd))
            .map_err(|_| Error::logic("FD environment contains NUL"))?;
        let debug_env = std::env::var("RSM_DEBUG")
            .ok()
            .and_then(|v| CString::new(format!("RSM_DEBUG={}", v)).ok());
        let mut argv: Vec<*mut libc::c_char> = vec![
            exe.as_ptr() as _,
            lib.as_ptr() as _,
            std::ptr::null_mut(),
        ];
        let argv: *const *mut libc::c_char = argv.as_mut_ptr() as _;
        let mut envp: Vec<*mut libc::c_char> = vec![fd_env.as_ptr() as _];
        if let Some(debug) = &debug_env {
            envp.push(debug.as_ptr() as _);
        }
        envp.push(std::ptr::null_mut());
        let envp: *const *mut libc::c_char = envp.as_mut_ptr() as _;
        let mut pid: libc::pid_t = -1;
        unsafe {
            if libc::posix_spawnp(
                &mut pid,
                exe.as_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                argv,
                envp,
            ) != 0
            {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        SPAWN.click();
        clue!(COLLECTOR, INFO, {
            spawn: {
                pid: pid,
                library: library.as_str(),
            },
        });
        drop(child_end);
        Ok(Object {
            path: name.to_string(),
            pid,
            sock,
            conditions: ConditionTable::new(),
            ticks: Vec::new(),
        })
    }

    /// Read response frames until the one that closes the action in flight, routing side-effect
    /// frames as they arrive:  LOG to the collector, COND_* to the object's condition table,
    /// TICK_INTERVAL to the registration list.
    fn pump(id: ObjectID, obj: &mut Object) -> Result<(ReturnCode, Vec<u8>), Error> {
        loop {
            match wire::read_response(&mut obj.sock)? {
                Response::Log(text) => {
                    clue!(COLLECTOR, INFO, {
                        object: id.get(),
                        log: String::from_utf8_lossy(&text).into_owned(),
                    });
                }
                Response::CondCreate(cond) => {
                    _ = obj.conditions.cond_create(&cond);
                }
                Response::CondDestroy(cond) => {
                    _ = obj.conditions.cond_destroy(&cond);
                }
                Response::CondBroadcast(cond) => {
                    let ok = obj.conditions.cond_broadcast(&cond).is_ok();
                    wire::write_cond_reply(&mut obj.sock, ok)?;
                }
                Response::CondBroadcastData(cond, data) => {
                    let ok = obj.conditions.cond_broadcast_data(&cond, &data).is_ok();
                    wire::write_cond_reply(&mut obj.sock, ok)?;
                }
                Response::CondCurrentValue(cond) => match obj.conditions.cond_current_value(&cond)
                {
                    Ok((state, data)) => {
                        wire::write_cond_value_reply(&mut obj.sock, state, &data)?;
                    }
                    Err(_) => {
                        wire::write_cond_reply(&mut obj.sock, false)?;
                    }
                },
                Response::TickInterval(func, seconds) => {
                    obj.ticks.retain(|(f, _)| f != &func);
                    obj.ticks.push((func, seconds));
                }
                Response::Output(status, output) => {
                    return Ok((status, output));
                }
            }
        }
    }

    fn fail(&mut self, id: ObjectID) {
        if let Some(mut obj) = self.objects.remove(&id) {
            Self::kill(&mut obj);
        }
    }

    fn kill(obj: &mut Object) {
        KILL.click();
        if obj.pid > 0 {
            clue!(COLLECTOR, ERROR, {
                kill: {
                    pid: obj.pid,
                    path: obj.path.as_str(),
                },
            });
            unsafe {
                libc::kill(obj.pid, minimal_signals::SIGKILL.into_i32());
            }
            Self::reap(obj);
        }
    }

    fn reap(obj: &mut Object) {
        if obj.pid > 0 {
            unsafe {
                let mut status = 0;
                libc::waitpid(obj.pid, &mut status, 0);
            }
            obj.pid = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn adopt(
        &mut self,
        id: ObjectID,
        path: &str,
        sock: UnixStream,
    ) -> Result<(ReturnCode, Vec<u8>), Error> {
        let mut obj = Object {
            path: path.to_string(),
            pid: 0,
            sock,
            conditions: ConditionTable::new(),
            ticks: Vec::new(),
        };
        wire::write_ctor(&mut obj.sock)?;
        let out = Self::pump(id, &mut obj)?;
        self.objects.insert(id, obj);
        Ok(out)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::os::raw::c_void;
    use std::thread;

    use rsm::demos::{CONDITION, COUNTER, ECHO};
    use rsm::{
        copy_snapshot, ObjectInterface, RsmContext, StateMachine, Transition,
    };

    use super::*;

    fn manager() -> ObjectManager {
        ObjectManager::new(ObjectManagerOptions::default())
    }

    fn command(object: ObjectID, func: &str, input: &[u8]) -> Command {
        Command {
            object,
            client: replicant_pb::ClientID::new(1),
            nonce: 0,
            flags: 0,
            min_slot: 0,
            func: func.to_string(),
            input: input.to_vec(),
        }
    }

    fn adopt(
        mgr: &mut ObjectManager,
        id: ObjectID,
        rsm: &'static StateMachine,
    ) -> thread::JoinHandle<Result<(), Error>> {
        let (daemon, child) = UnixStream::pair().expect("socketpair");
        let handle = thread::spawn(move || {
            let mut intf = ObjectInterface::new(child);
            rsm::child::serve(&mut intf, rsm)
        });
        let (status, _) = mgr.adopt(id, "demo.so", daemon).expect("adopt");
        assert_eq!(ReturnCode::Success, status);
        handle
    }

    #[test]
    fn valid_paths() {
        assert!(ObjectManager::valid_path(b"echo.so"));
        assert!(ObjectManager::valid_path(b"my-object_v2.so\x00\x00"));
        assert!(ObjectManager::valid_path(b""));
        assert!(!ObjectManager::valid_path(b"../escape.so"));
        assert!(!ObjectManager::valid_path(b"dir/lib.so"));
        assert!(!ObjectManager::valid_path(b"spaced name.so"));
        let long = vec![b'a'; libc::PATH_MAX as usize];
        assert!(!ObjectManager::valid_path(&long));
    }

    #[test]
    fn apply_routes_to_the_object() {
        let mut mgr = manager();
        let id = ObjectID::new(8);
        let handle = adopt(&mut mgr, id, &ECHO);
        let resp = mgr.apply(&command(id, "echo", b"hi")).unwrap();
        assert_eq!(ReturnCode::Success, resp.status);
        assert_eq!(b"hi".to_vec(), resp.output);
        let resp = mgr.apply(&command(id, "absent", b"")).unwrap();
        assert_eq!(ReturnCode::FuncNotFound, resp.status);
        assert!(resp.output.is_empty());
        mgr.del(id).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn unknown_object_draws_obj_not_found() {
        let mut mgr = manager();
        let resp = mgr.apply(&command(ObjectID::new(404), "echo", b"")).unwrap();
        assert_eq!(ReturnCode::ObjNotFound, resp.status);
    }

    #[test]
    fn duplicate_create_fails_before_spawning() {
        let mut mgr = manager();
        let id = ObjectID::new(8);
        let handle = adopt(&mut mgr, id, &ECHO);
        assert!(matches!(
            mgr.create(id, b"echo.so", b""),
            Err(Error::AlreadyExists { .. })
        ));
        mgr.del(id).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn snapshots_collect_in_id_order() {
        let mut mgr = manager();
        let low = ObjectID::new(3);
        let high = ObjectID::new(9);
        let h1 = adopt(&mut mgr, high, &COUNTER);
        let h2 = adopt(&mut mgr, low, &COUNTER);
        for _ in 0..2 {
            mgr.apply(&command(high, "counter", b"")).unwrap();
        }
        mgr.apply(&command(low, "counter", b"")).unwrap();
        let set = mgr.take_snapshot().unwrap();
        assert_eq!(2, set.objects.len());
        assert_eq!(low, set.objects[0].id);
        assert_eq!(1u64.to_be_bytes().to_vec(), set.objects[0].snapshot);
        assert_eq!(high, set.objects[1].id);
        assert_eq!(2u64.to_be_bytes().to_vec(), set.objects[1].snapshot);
        mgr.del(low).unwrap();
        mgr.del(high).unwrap();
        h1.join().unwrap().unwrap();
        h2.join().unwrap().unwrap();
    }

    #[test]
    fn conditions_route_through_the_table() {
        let mut mgr = manager();
        let id = ObjectID::new(5);
        let handle = adopt(&mut mgr, id, &CONDITION);
        let resp = mgr.apply(&command(id, "notify", b"payload")).unwrap();
        assert_eq!(ReturnCode::Success, resp.status);
        assert_eq!(b"ok".to_vec(), resp.output);
        let resp = mgr.apply(&command(id, "peek", b"")).unwrap();
        assert_eq!(ReturnCode::Success, resp.status);
        let mut expected = 1u64.to_be_bytes().to_vec();
        expected.extend_from_slice(b"payload");
        assert_eq!(expected, resp.output);
        mgr.del(id).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn del_of_unknown_object_errors() {
        let mut mgr = manager();
        assert!(matches!(
            mgr.del(ObjectID::new(404)),
            Err(Error::NotFound { .. })
        ));
    }

    // a machine that registers a tick interval when poked
    unsafe extern "C" fn ticker_create(_: *mut RsmContext) -> *mut c_void {
        usize::MAX as *mut c_void
    }
    unsafe extern "C" fn ticker_recreate(
        _: *mut RsmContext,
        _: *const u8,
        _: usize,
    ) -> *mut c_void {
        usize::MAX as *mut c_void
    }
    unsafe extern "C" fn ticker_snapshot(
        _: *mut RsmContext,
        _: *mut c_void,
        data: *mut *mut u8,
        data_sz: *mut usize,
    ) -> i32 {
        copy_snapshot(&[], data, data_sz)
    }
    unsafe extern "C" fn ticker_arm(
        ctx: *mut RsmContext,
        _: *mut c_void,
        _: *const u8,
        _: usize,
    ) {
        let ctx = &mut *ctx;
        ctx.tick_interval("tick", 60);
        ctx.set_output(b"armed");
    }
    static TICKER_TRANSITIONS: [Transition; 2] = [
        Transition {
            name: c"arm".as_ptr(),
            func: Some(ticker_arm),
        },
        Transition::END,
    ];
    static TICKER: StateMachine = StateMachine {
        ctor: Some(ticker_create),
        rtor: Some(ticker_recreate),
        snap: Some(ticker_snapshot),
        transitions: TICKER_TRANSITIONS.as_ptr(),
    };

    #[test]
    fn tick_registrations_are_recorded() {
        let mut mgr = manager();
        let id = ObjectID::new(6);
        let handle = adopt(&mut mgr, id, &TICKER);
        assert!(mgr.tick_intervals(id).is_empty());
        let resp = mgr.apply(&command(id, "arm", b"")).unwrap();
        assert_eq!(b"armed".to_vec(), resp.output);
        assert_eq!(vec![("tick".to_string(), 60)], mgr.tick_intervals(id));
        // re-arming replaces the registration instead of duplicating it
        mgr.apply(&command(id, "arm", b"")).unwrap();
        assert_eq!(vec![("tick".to_string(), 60)], mgr.tick_intervals(id));
        mgr.del(id).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn protocol_violation_kills_the_object() {
        let mut mgr = manager();
        let id = ObjectID::new(7);
        // a "child" that answers the command with garbage
        let (daemon, mut child) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            use std::io::{Read, Write};
            let mut buf = [0u8; 1];
            child.read_exact(&mut buf).unwrap();
            wire::write_output(&mut child, ReturnCode::Success, b"").unwrap();
            // swallow the command bytes, then emit an unknown frame code
            let mut drain = [0u8; 64];
            _ = child.read(&mut drain).unwrap();
            child.write_all(&[250u8]).unwrap();
        });
        let (status, _) = mgr.adopt(id, "garbage.so", daemon).unwrap();
        assert_eq!(ReturnCode::Success, status);
        assert!(mgr.apply(&command(id, "anything", b"")).is_err());
        assert!(!mgr.exists(id));
        // the object is gone; a retry draws OBJ_NOT_FOUND
        let resp = mgr.apply(&command(id, "anything", b"")).unwrap();
        assert_eq!(ReturnCode::ObjNotFound, resp.status);
        handle.join().unwrap();
    }
}
