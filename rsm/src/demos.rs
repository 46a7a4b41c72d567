//! Demonstration state machines exercising the ABI.  The protocol and daemon tests drive these
//! over in-process socketpairs; they double as templates for object authors.

use std::os::raw::{c_int, c_void};

use crate::{copy_snapshot, Conditions, RsmContext, StateMachine, Transition};

// A stand-in state pointer for machines that keep no state.
const NO_STATE: *mut c_void = usize::MAX as *mut c_void;

/////////////////////////////////////////////// echo ///////////////////////////////////////////////

unsafe extern "C" fn echo_create(_: *mut RsmContext) -> *mut c_void {
    NO_STATE
}

unsafe extern "C" fn echo_recreate(_: *mut RsmContext, _: *const u8, _: usize) -> *mut c_void {
    NO_STATE
}

unsafe extern "C" fn echo_snapshot(
    _: *mut RsmContext,
    _: *mut c_void,
    data: *mut *mut u8,
    data_sz: *mut usize,
) -> c_int {
    copy_snapshot(&[], data, data_sz)
}

unsafe extern "C" fn echo_echo(
    ctx: *mut RsmContext,
    _: *mut c_void,
    data: *const u8,
    data_sz: usize,
) {
    let ctx = &mut *ctx;
    let input = if data.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(data, data_sz)
    };
    ctx.set_output(input);
}

static ECHO_TRANSITIONS: [Transition; 2] = [
    Transition {
        name: c"echo".as_ptr(),
        func: Some(echo_echo),
    },
    Transition::END,
];

/// Replies with its input.
pub static ECHO: StateMachine = StateMachine {
    ctor: Some(echo_create),
    rtor: Some(echo_recreate),
    snap: Some(echo_snapshot),
    transitions: ECHO_TRANSITIONS.as_ptr(),
};

////////////////////////////////////////////// counter /////////////////////////////////////////////

unsafe extern "C" fn counter_create(_: *mut RsmContext) -> *mut c_void {
    Box::into_raw(Box::new(0u64)) as *mut c_void
}

unsafe extern "C" fn counter_recreate(
    ctx: *mut RsmContext,
    data: *const u8,
    data_sz: usize,
) -> *mut c_void {
    let ctx = &mut *ctx;
    if data.is_null() || data_sz != 8 {
        ctx.log("recreation failed: corrupt snapshot");
        ctx.set_status(-1);
        return std::ptr::null_mut();
    }
    let mut buf = [0u8; 8];
    std::ptr::copy_nonoverlapping(data, buf.as_mut_ptr(), 8);
    Box::into_raw(Box::new(u64::from_be_bytes(buf))) as *mut c_void
}

unsafe extern "C" fn counter_snapshot(
    _: *mut RsmContext,
    state: *mut c_void,
    data: *mut *mut u8,
    data_sz: *mut usize,
) -> c_int {
    if state.is_null() {
        return copy_snapshot(&[], data, data_sz);
    }
    let count = *(state as *const u64);
    copy_snapshot(&count.to_be_bytes(), data, data_sz)
}

unsafe extern "C" fn counter_counter(
    ctx: *mut RsmContext,
    state: *mut c_void,
    _: *const u8,
    _: usize,
) {
    let ctx = &mut *ctx;
    let count = &mut *(state as *mut u64);
    *count += 1;
    ctx.set_output(&count.to_be_bytes());
}

static COUNTER_TRANSITIONS: [Transition; 2] = [
    Transition {
        name: c"counter".as_ptr(),
        func: Some(counter_counter),
    },
    Transition::END,
];

/// Counts invocations; snapshots and restores the count.
pub static COUNTER: StateMachine = StateMachine {
    ctor: Some(counter_create),
    rtor: Some(counter_recreate),
    snap: Some(counter_snapshot),
    transitions: COUNTER_TRANSITIONS.as_ptr(),
};

///////////////////////////////////////////// condition ////////////////////////////////////////////

unsafe extern "C" fn condition_create(ctx: *mut RsmContext) -> *mut c_void {
    let ctx = &mut *ctx;
    _ = ctx.cond_create("c");
    NO_STATE
}

unsafe extern "C" fn condition_recreate(
    ctx: *mut RsmContext,
    _: *const u8,
    _: usize,
) -> *mut c_void {
    let ctx = &mut *ctx;
    _ = ctx.cond_create("c");
    NO_STATE
}

unsafe extern "C" fn condition_snapshot(
    _: *mut RsmContext,
    _: *mut c_void,
    data: *mut *mut u8,
    data_sz: *mut usize,
) -> c_int {
    copy_snapshot(&[], data, data_sz)
}

unsafe extern "C" fn condition_notify(
    ctx: *mut RsmContext,
    _: *mut c_void,
    data: *const u8,
    data_sz: usize,
) {
    let ctx = &mut *ctx;
    let input = if data.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(data, data_sz)
    };
    if ctx.cond_broadcast_data("c", input).is_ok() {
        ctx.set_output(b"ok");
    } else {
        ctx.set_output(b"fail");
    }
}

unsafe extern "C" fn condition_peek(
    ctx: *mut RsmContext,
    _: *mut c_void,
    _: *const u8,
    _: usize,
) {
    let ctx = &mut *ctx;
    match ctx.cond_current_value("c") {
        Ok((state, data)) => {
            let mut out = state.to_be_bytes().to_vec();
            out.extend_from_slice(&data);
            ctx.set_output(&out);
        }
        Err(_) => {
            ctx.set_output(b"gone");
        }
    }
}

static CONDITION_TRANSITIONS: [Transition; 3] = [
    Transition {
        name: c"notify".as_ptr(),
        func: Some(condition_notify),
    },
    Transition {
        name: c"peek".as_ptr(),
        func: Some(condition_peek),
    },
    Transition::END,
];

/// Broadcasts and inspects a condition named "c".
pub static CONDITION: StateMachine = StateMachine {
    ctor: Some(condition_create),
    rtor: Some(condition_recreate),
    snap: Some(condition_snapshot),
    transitions: CONDITION_TRANSITIONS.as_ptr(),
};
