//! The child side of the object host:  the interface that owns the daemon socket, the library
//! loader, and the action-dispatch loop behind the `replicant-rsm` binary.  The child is
//! single-threaded and strictly blocking on the daemon's next action.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::Write as _;
use std::os::raw::c_void;
use std::os::unix::net::UnixStream;

use zerror::Z;

use replicant_pb::{Error, ReturnCode};

use crate::wire::{self, Action};
use crate::{RsmContext, StateMachine, TransitionFunc};

////////////////////////////////////////// ObjectInterface /////////////////////////////////////////

/// The child's end of the object socket, plus the opt-in debug stream named by the `RSM_DEBUG`
/// environment variable.
pub struct ObjectInterface {
    sock: UnixStream,
    debug: Option<File>,
}

impl ObjectInterface {
    pub fn new(sock: UnixStream) -> Self {
        Self { sock, debug: None }
    }

    pub fn with_debug(sock: UnixStream, debug: Option<File>) -> Self {
        Self { sock, debug }
    }

    /// Write a diagnostic to the debug stream, if one is open.
    pub fn debug(&mut self, msg: &str) {
        if let Some(debug) = self.debug.as_mut() {
            _ = writeln!(debug, "{}", msg);
        }
    }

    pub(crate) fn log(&mut self, text: &str) -> Result<(), Error> {
        wire::write_log(&mut self.sock, text.as_bytes())
    }

    pub(crate) fn cond_create(&mut self, cond: &str) -> Result<(), Error> {
        wire::write_cond_create(&mut self.sock, cond)
    }

    pub(crate) fn cond_destroy(&mut self, cond: &str) -> Result<(), Error> {
        wire::write_cond_destroy(&mut self.sock, cond)
    }

    pub(crate) fn cond_broadcast(&mut self, cond: &str) -> Result<bool, Error> {
        wire::write_cond_broadcast(&mut self.sock, cond)?;
        wire::read_cond_reply(&mut self.sock)
    }

    pub(crate) fn cond_broadcast_data(&mut self, cond: &str, data: &[u8]) -> Result<bool, Error> {
        wire::write_cond_broadcast_data(&mut self.sock, cond, data)?;
        wire::read_cond_reply(&mut self.sock)
    }

    pub(crate) fn cond_current_value(
        &mut self,
        cond: &str,
    ) -> Result<Option<(u64, Vec<u8>)>, Error> {
        wire::write_cond_current_value(&mut self.sock, cond)?;
        wire::read_cond_value_reply(&mut self.sock)
    }

    pub(crate) fn tick_interval(&mut self, func: &str, seconds: u64) -> Result<(), Error> {
        wire::write_tick_interval(&mut self.sock, func, seconds)
    }
}

///////////////////////////////////////////// loading //////////////////////////////////////////////

fn dlerror_string() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown dlopen error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// Load `library` and resolve its `rsm` symbol.
///
/// # Safety
///
/// The library must export a [StateMachine] as `rsm`, and its function pointers must uphold the
/// ABI contract.  The library is never unloaded.
pub unsafe fn load_library(library: &str) -> Result<&'static StateMachine, Error> {
    let path =
        CString::new(library).map_err(|_| Error::protocol("library path contains NUL"))?;
    let lib = libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL);
    if lib.is_null() {
        return Err(Error::object_failed(format!(
            "could not load library: {}",
            dlerror_string()
        ))
        .with_info("library", library));
    }
    let sym = libc::dlsym(lib, c"rsm".as_ptr());
    if sym.is_null() {
        return Err(
            Error::object_failed("could not find \"rsm\" symbol in library")
                .with_info("library", library),
        );
    }
    let rsm: &'static StateMachine = &*(sym as *const StateMachine);
    if rsm.ctor.is_none() || rsm.rtor.is_none() || rsm.snap.is_none() || rsm.transitions.is_null()
    {
        return Err(
            Error::object_failed("symbol \"rsm\" contains one or more NULL functions")
                .with_info("library", library),
        );
    }
    Ok(rsm)
}

////////////////////////////////////////////// serve ///////////////////////////////////////////////

fn find_transition(rsm: &StateMachine, func: &str) -> Option<TransitionFunc> {
    let mut t = rsm.transitions;
    if t.is_null() {
        return None;
    }
    unsafe {
        while !(*t).name.is_null() {
            let name = CStr::from_ptr((*t).name);
            if name.to_bytes() == func.as_bytes() {
                return (*t).func;
            }
            t = t.add(1);
        }
    }
    None
}

/// Dispatch actions into `rsm` until the daemon sends SHUTDOWN.  Any IO or protocol error, and any
/// call that leaves a non-zero status in its context, is permanent and surfaces as `Err`.
pub fn serve(intf: &mut ObjectInterface, rsm: &StateMachine) -> Result<(), Error> {
    let mut state: *mut c_void = std::ptr::null_mut();
    loop {
        match wire::read_action(&mut intf.sock)? {
            Action::Ctor => {
                let ctor = rsm
                    .ctor
                    .ok_or_else(|| Error::object_failed("state machine has a NULL ctor"))?;
                let mut ctx = RsmContext::new(intf);
                state = unsafe { ctor(&mut ctx) };
                if ctx.status() != 0 {
                    return Err(Error::object_failed("ctor failed"));
                }
                wire::write_output(&mut intf.sock, ReturnCode::Success, ctx.output())?;
            }
            Action::Rtor => {
                let snapshot = wire::read_snapshot(&mut intf.sock)?;
                let rtor = rsm
                    .rtor
                    .ok_or_else(|| Error::object_failed("state machine has a NULL rtor"))?;
                let mut ctx = RsmContext::new(intf);
                state = unsafe { rtor(&mut ctx, snapshot.as_ptr(), snapshot.len()) };
                if ctx.status() != 0 {
                    return Err(Error::object_failed("rtor failed"));
                }
                wire::write_output(&mut intf.sock, ReturnCode::Success, ctx.output())?;
            }
            Action::Command => {
                let (func, input) = wire::read_command(&mut intf.sock)?;
                match find_transition(rsm, &func) {
                    Some(transition) => {
                        let mut ctx = RsmContext::new(intf);
                        unsafe {
                            transition(&mut ctx, state, input.as_ptr(), input.len());
                        }
                        if ctx.status() != 0 {
                            return Err(Error::object_failed("execution failed")
                                .with_info("func", func));
                        }
                        wire::write_output(&mut intf.sock, ReturnCode::Success, ctx.output())?;
                    }
                    None => {
                        wire::write_output(&mut intf.sock, ReturnCode::FuncNotFound, &[])?;
                    }
                }
            }
            Action::Snapshot => {
                let snap = rsm
                    .snap
                    .ok_or_else(|| Error::object_failed("state machine has a NULL snap"))?;
                let mut ctx = RsmContext::new(intf);
                let mut data: *mut u8 = std::ptr::null_mut();
                let mut data_sz: usize = 0;
                let ret = unsafe { snap(&mut ctx, state, &mut data, &mut data_sz) };
                if ret < 0 {
                    return Err(Error::object_failed("snapshot failed"));
                }
                let bytes: &[u8] = if data.is_null() {
                    &[]
                } else {
                    unsafe { std::slice::from_raw_parts(data, data_sz) }
                };
                let res = wire::write_snapshot(&mut intf.sock, bytes);
                if !data.is_null() {
                    unsafe {
                        libc::free(data as *mut c_void);
                    }
                }
                res?;
            }
            Action::Shutdown => {
                break;
            }
        }
    }
    Ok(())
}

/// The child entry point:  load the library named on the command line and serve the socket.
/// Errors are reported to the debug stream before they surface.
pub fn run(library: &str, sock: UnixStream, debug: Option<File>) -> Result<(), Error> {
    let mut intf = ObjectInterface::with_debug(sock, debug);
    let rsm = match unsafe { load_library(library) } {
        Ok(rsm) => rsm,
        Err(err) => {
            intf.debug(&err.long_form());
            return Err(err);
        }
    };
    let res = serve(&mut intf, rsm);
    if let Err(err) = &res {
        intf.debug(&err.long_form());
    }
    res
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
