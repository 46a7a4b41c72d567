//! rsm provides everything needed to host replicated state machines out of process:  the
//! state-machine ABI that object libraries export, the context through which a state machine talks
//! back to its daemon, the object-host wire protocol, and the child driver behind the
//! `replicant-rsm` binary.
//!
//! A state machine is a shared library exporting one symbol, `rsm`, laid out as [StateMachine]:
//! a constructor, a reconstructor, a snapshot function, and a `{NULL, NULL}`-terminated table of
//! named transitions.  The layout is C so the library may be written in any language; in Rust it
//! is a `cdylib` with `#[no_mangle] pub static rsm: StateMachine`.

use std::os::raw::{c_char, c_int, c_void};

use replicant_pb::ReturnCode;

pub mod child;
pub mod demos;
pub mod wire;

pub use child::ObjectInterface;

/////////////////////////////////////////////// ABI ////////////////////////////////////////////////

/// A transition function.  `state` is whatever the constructor returned; `data` points at
/// `data_sz` bytes of input.  Output is reported through the context.
pub type TransitionFunc =
    unsafe extern "C" fn(ctx: *mut RsmContext, state: *mut c_void, data: *const u8, data_sz: usize);

/// A constructor.  Returns the state pointer passed to every subsequent call.
pub type CtorFunc = unsafe extern "C" fn(ctx: *mut RsmContext) -> *mut c_void;

/// A reconstructor.  Rebuilds the state from a snapshot previously produced by the snapshot
/// function.
pub type RtorFunc =
    unsafe extern "C" fn(ctx: *mut RsmContext, data: *const u8, data_sz: usize) -> *mut c_void;

/// A snapshot function.  On success returns zero and leaves a `malloc`'d buffer in `*data`; the
/// driver frees it with `free` after transmission.  [copy_snapshot] upholds the allocation
/// contract for Rust libraries.
pub type SnapFunc = unsafe extern "C" fn(
    ctx: *mut RsmContext,
    state: *mut c_void,
    data: *mut *mut u8,
    data_sz: *mut usize,
) -> c_int;

/// One named transition.  The table a [StateMachine] points at ends with [Transition::END].
#[repr(C)]
pub struct Transition {
    /// A NUL-terminated transition name.
    pub name: *const c_char,
    pub func: Option<TransitionFunc>,
}

impl Transition {
    /// The `{NULL, NULL}` table terminator.
    pub const END: Transition = Transition {
        name: std::ptr::null(),
        func: None,
    };
}

unsafe impl Sync for Transition {}

/// The descriptor an object library exports as the symbol `rsm`.
#[repr(C)]
pub struct StateMachine {
    pub ctor: Option<CtorFunc>,
    pub rtor: Option<RtorFunc>,
    pub snap: Option<SnapFunc>,
    /// Points at a [Transition::END]-terminated array.
    pub transitions: *const Transition,
}

unsafe impl Sync for StateMachine {}

/// Copy `data` into a `malloc`'d buffer, satisfying the snapshot allocation contract.  Returns
/// zero on success the way a [SnapFunc] does.
///
/// # Safety
///
/// `out_data` and `out_sz` must be valid for writes.
pub unsafe fn copy_snapshot(data: &[u8], out_data: *mut *mut u8, out_sz: *mut usize) -> c_int {
    if data.is_empty() {
        *out_data = std::ptr::null_mut();
        *out_sz = 0;
        return 0;
    }
    let ptr = libc::malloc(data.len()) as *mut u8;
    if ptr.is_null() {
        return -1;
    }
    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    *out_data = ptr;
    *out_sz = data.len();
    0
}

//////////////////////////////////////////// Conditions ////////////////////////////////////////////

/// The condition capability set:  named waitable objects with a monotonically increasing 64-bit
/// state and an optional payload.  There are two realizations:  [RsmContext] forwards each call
/// over the object socket, and the daemon holds the authoritative in-process table.
pub trait Conditions {
    fn cond_create(&mut self, cond: &str) -> Result<(), ReturnCode>;
    fn cond_destroy(&mut self, cond: &str) -> Result<(), ReturnCode>;
    fn cond_broadcast(&mut self, cond: &str) -> Result<(), ReturnCode>;
    fn cond_broadcast_data(&mut self, cond: &str, data: &[u8]) -> Result<(), ReturnCode>;
    fn cond_current_value(&mut self, cond: &str) -> Result<(u64, Vec<u8>), ReturnCode>;
}

//////////////////////////////////////////// RsmContext ////////////////////////////////////////////

/// The context the driver passes into every state machine call.  It owns the call's output buffer
/// and forwards logging, conditions, and tick registration over the object socket.  A failed
/// interface call poisons the context; the driver treats a poisoned context as a permanent error.
pub struct RsmContext {
    intf: *mut ObjectInterface,
    status: c_int,
    output: Vec<u8>,
}

impl RsmContext {
    pub fn new(intf: &mut ObjectInterface) -> Self {
        Self {
            intf: intf as *mut ObjectInterface,
            status: 0,
            output: Vec::new(),
        }
    }

    fn intf(&mut self) -> &mut ObjectInterface {
        // SAFETY: the driver keeps the interface alive for the duration of the call and hands the
        // context to exactly one single-threaded state machine invocation at a time.
        unsafe { &mut *self.intf }
    }

    /// Emit a log line through the daemon's logger.
    pub fn log(&mut self, text: &str) {
        let res = self.intf().log(text);
        if res.is_err() {
            self.status = -1;
        }
    }

    /// Set the output returned for this call.  Replaces any previous output.
    pub fn set_output(&mut self, output: &[u8]) {
        self.output.clear();
        self.output.extend_from_slice(output);
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn status(&self) -> c_int {
        self.status
    }

    /// Mark this call failed.  A non-zero status is a permanent error for the object.
    pub fn set_status(&mut self, status: c_int) {
        self.status = status;
    }

    /// Register `func` to be proposed every `seconds` seconds.
    pub fn tick_interval(&mut self, func: &str, seconds: u64) {
        let res = self.intf().tick_interval(func, seconds);
        if res.is_err() {
            self.status = -1;
        }
    }
}

impl Conditions for RsmContext {
    fn cond_create(&mut self, cond: &str) -> Result<(), ReturnCode> {
        if self.intf().cond_create(cond).is_err() {
            self.status = -1;
            return Err(ReturnCode::ServerError);
        }
        Ok(())
    }

    fn cond_destroy(&mut self, cond: &str) -> Result<(), ReturnCode> {
        if self.intf().cond_destroy(cond).is_err() {
            self.status = -1;
            return Err(ReturnCode::ServerError);
        }
        Ok(())
    }

    fn cond_broadcast(&mut self, cond: &str) -> Result<(), ReturnCode> {
        match self.intf().cond_broadcast(cond) {
            Ok(true) => Ok(()),
            // over the socket every failure collapses to one status byte
            Ok(false) => Err(ReturnCode::CondNotFound),
            Err(_) => {
                self.status = -1;
                Err(ReturnCode::ServerError)
            }
        }
    }

    fn cond_broadcast_data(&mut self, cond: &str, data: &[u8]) -> Result<(), ReturnCode> {
        match self.intf().cond_broadcast_data(cond, data) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReturnCode::CondNotFound),
            Err(_) => {
                self.status = -1;
                Err(ReturnCode::ServerError)
            }
        }
    }

    fn cond_current_value(&mut self, cond: &str) -> Result<(u64, Vec<u8>), ReturnCode> {
        match self.intf().cond_current_value(cond) {
            Ok(Some((state, data))) => Ok((state, data)),
            Ok(None) => Err(ReturnCode::CondNotFound),
            Err(_) => {
                self.status = -1;
                Err(ReturnCode::ServerError)
            }
        }
    }
}
