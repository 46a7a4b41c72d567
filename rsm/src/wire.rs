//! The object-host protocol:  a framed, synchronous, length-prefixed wire protocol spoken over a
//! single socket between the daemon and each object child.  The daemon drives by sending a single
//! action byte followed by its payload; the child answers with zero or more response frames and a
//! closing frame that completes the action.  All fields are big-endian.  Any framing violation is
//! permanent:  the daemon drops the child and the child aborts.

use std::io::{Read, Write};

use replicant_pb::{Error, ReturnCode};

/// The largest payload either end will accept in a single frame.
pub const MAX_FRAME_SIZE: u64 = 1 << 26;

/////////////////////////////////////////////// io /////////////////////////////////////////////////

pub fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), Error> {
    r.read_exact(buf)
        .map_err(|err| Error::io(format!("short read: {}", err)))
}

pub fn write_all(w: &mut impl Write, buf: &[u8]) -> Result<(), Error> {
    w.write_all(buf)
        .map_err(|err| Error::io(format!("short write: {}", err)))
}

fn read_u8(r: &mut impl Read) -> Result<u8, Error> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    Ok(buf[0])
}

fn read_u16be(r: &mut impl Read) -> Result<u16, Error> {
    let mut buf = [0u8; 2];
    read_exact(r, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32be(r: &mut impl Read) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64be(r: &mut impl Read) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_buffer(r: &mut impl Read) -> Result<Vec<u8>, Error> {
    let sz = read_u32be(r)?;
    if u64::from(sz) > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!("frame of {} bytes exceeds limit", sz)));
    }
    let mut buf = vec![0u8; sz as usize];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

fn read_string(r: &mut impl Read) -> Result<String, Error> {
    let buf = read_buffer(r)?;
    String::from_utf8(buf).map_err(|_| Error::protocol("name is not utf8"))
}

fn write_buffer(w: &mut impl Write, buf: &[u8]) -> Result<(), Error> {
    if buf.len() as u64 > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!(
            "frame of {} bytes exceeds limit",
            buf.len()
        )));
    }
    write_all(w, &(buf.len() as u32).to_be_bytes())?;
    write_all(w, buf)
}

////////////////////////////////////////////// Action //////////////////////////////////////////////

/// An action the daemon sends to the child.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Action {
    Ctor = 1,
    Rtor = 2,
    Command = 3,
    Snapshot = 4,
    Shutdown = 16,
}

impl Action {
    pub fn from_u8(x: u8) -> Option<Action> {
        match x {
            1 => Some(Action::Ctor),
            2 => Some(Action::Rtor),
            3 => Some(Action::Command),
            4 => Some(Action::Snapshot),
            16 => Some(Action::Shutdown),
            _ => None,
        }
    }
}

/// Read the next action byte.  An unknown action is a protocol violation.
pub fn read_action(r: &mut impl Read) -> Result<Action, Error> {
    let act = read_u8(r)?;
    Action::from_u8(act).ok_or_else(|| Error::protocol(format!("bad action {}", act)))
}

/// CTOR carries no payload.
pub fn write_ctor(w: &mut impl Write) -> Result<(), Error> {
    write_all(w, &[Action::Ctor as u8])
}

/// RTOR carries the snapshot to restore from.
pub fn write_rtor(w: &mut impl Write, snapshot: &[u8]) -> Result<(), Error> {
    write_all(w, &[Action::Rtor as u8])?;
    write_buffer(w, snapshot)
}

/// COMMAND carries a declared total size (which includes the eight bytes of the size field
/// itself), then the length-prefixed function name and input.
pub fn write_command(w: &mut impl Write, func: &str, input: &[u8]) -> Result<(), Error> {
    let size = 16u64 + func.len() as u64 + input.len() as u64;
    if size > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!(
            "command of {} bytes exceeds limit",
            size
        )));
    }
    write_all(w, &[Action::Command as u8])?;
    write_all(w, &size.to_be_bytes())?;
    write_all(w, &(func.len() as u32).to_be_bytes())?;
    write_all(w, func.as_bytes())?;
    write_all(w, &(input.len() as u32).to_be_bytes())?;
    write_all(w, input)
}

/// SNAPSHOT carries no payload.
pub fn write_snapshot_request(w: &mut impl Write) -> Result<(), Error> {
    write_all(w, &[Action::Snapshot as u8])
}

/// SHUTDOWN carries no payload.
pub fn write_shutdown(w: &mut impl Write) -> Result<(), Error> {
    write_all(w, &[Action::Shutdown as u8])
}

/// Read the RTOR payload.
pub fn read_snapshot(r: &mut impl Read) -> Result<Vec<u8>, Error> {
    read_buffer(r)
}

/// Read the COMMAND payload and return `(func, input)`.  The declared size must be at least the
/// sixteen bytes of framing and the inner lengths must sum exactly to it.
pub fn read_command(r: &mut impl Read) -> Result<(String, Vec<u8>), Error> {
    let size = read_u64be(r)?;
    if size < 16 {
        return Err(Error::protocol("received corrupt command"));
    }
    if size > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!(
            "command of {} bytes exceeds limit",
            size
        )));
    }
    let remain = (size - 8) as usize;
    let mut msg = vec![0u8; remain];
    read_exact(r, &mut msg)?;
    let func_sz = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]) as usize;
    if 8 + func_sz > remain {
        return Err(Error::protocol("received corrupt command"));
    }
    let input_sz = u32::from_be_bytes([
        msg[4 + func_sz],
        msg[5 + func_sz],
        msg[6 + func_sz],
        msg[7 + func_sz],
    ]) as usize;
    if 8 + func_sz + input_sz != remain {
        return Err(Error::protocol("received corrupt command"));
    }
    let func = String::from_utf8(msg[4..4 + func_sz].to_vec())
        .map_err(|_| Error::protocol("function name is not utf8"))?;
    let input = msg[8 + func_sz..8 + func_sz + input_sz].to_vec();
    Ok((func, input))
}

///////////////////////////////////////////// Response /////////////////////////////////////////////

const RESPONSE_LOG: u8 = 1;
const RESPONSE_COND_CREATE: u8 = 2;
const RESPONSE_COND_DESTROY: u8 = 3;
const RESPONSE_COND_BROADCAST: u8 = 4;
const RESPONSE_COND_BROADCAST_DATA: u8 = 5;
const RESPONSE_COND_CURRENT_VALUE: u8 = 6;
const RESPONSE_TICK_INTERVAL: u8 = 7;
const RESPONSE_OUTPUT: u8 = 16;

/// A frame the child sends to the daemon while an action is in flight.  OUTPUT closes a CTOR,
/// RTOR, or COMMAND action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    Log(Vec<u8>),
    CondCreate(String),
    CondDestroy(String),
    CondBroadcast(String),
    CondBroadcastData(String, Vec<u8>),
    CondCurrentValue(String),
    TickInterval(String, u64),
    Output(ReturnCode, Vec<u8>),
}

/// Read the next response frame.  The daemon calls this in a loop until it sees the frame that
/// closes the action in flight.
pub fn read_response(r: &mut impl Read) -> Result<Response, Error> {
    let code = read_u8(r)?;
    match code {
        RESPONSE_LOG => Ok(Response::Log(read_buffer(r)?)),
        RESPONSE_COND_CREATE => Ok(Response::CondCreate(read_string(r)?)),
        RESPONSE_COND_DESTROY => Ok(Response::CondDestroy(read_string(r)?)),
        RESPONSE_COND_BROADCAST => Ok(Response::CondBroadcast(read_string(r)?)),
        RESPONSE_COND_BROADCAST_DATA => {
            let cond = read_string(r)?;
            let data = read_buffer(r)?;
            Ok(Response::CondBroadcastData(cond, data))
        }
        RESPONSE_COND_CURRENT_VALUE => Ok(Response::CondCurrentValue(read_string(r)?)),
        RESPONSE_TICK_INTERVAL => {
            let func = read_string(r)?;
            let seconds = read_u64be(r)?;
            Ok(Response::TickInterval(func, seconds))
        }
        RESPONSE_OUTPUT => {
            let status = read_u16be(r)?;
            let status = ReturnCode::from_u16(status)
                .ok_or_else(|| Error::protocol(format!("bad status {}", status)))?;
            let output = read_buffer(r)?;
            Ok(Response::Output(status, output))
        }
        _ => Err(Error::protocol(format!("bad response {}", code))),
    }
}

pub fn write_log(w: &mut impl Write, text: &[u8]) -> Result<(), Error> {
    write_all(w, &[RESPONSE_LOG])?;
    write_buffer(w, text)
}

pub fn write_cond_create(w: &mut impl Write, cond: &str) -> Result<(), Error> {
    write_all(w, &[RESPONSE_COND_CREATE])?;
    write_buffer(w, cond.as_bytes())
}

pub fn write_cond_destroy(w: &mut impl Write, cond: &str) -> Result<(), Error> {
    write_all(w, &[RESPONSE_COND_DESTROY])?;
    write_buffer(w, cond.as_bytes())
}

pub fn write_cond_broadcast(w: &mut impl Write, cond: &str) -> Result<(), Error> {
    write_all(w, &[RESPONSE_COND_BROADCAST])?;
    write_buffer(w, cond.as_bytes())
}

pub fn write_cond_broadcast_data(
    w: &mut impl Write,
    cond: &str,
    data: &[u8],
) -> Result<(), Error> {
    write_all(w, &[RESPONSE_COND_BROADCAST_DATA])?;
    write_buffer(w, cond.as_bytes())?;
    write_buffer(w, data)
}

pub fn write_cond_current_value(w: &mut impl Write, cond: &str) -> Result<(), Error> {
    write_all(w, &[RESPONSE_COND_CURRENT_VALUE])?;
    write_buffer(w, cond.as_bytes())
}

pub fn write_tick_interval(w: &mut impl Write, func: &str, seconds: u64) -> Result<(), Error> {
    write_all(w, &[RESPONSE_TICK_INTERVAL])?;
    write_buffer(w, func.as_bytes())?;
    write_all(w, &seconds.to_be_bytes())
}

pub fn write_output(w: &mut impl Write, status: ReturnCode, data: &[u8]) -> Result<(), Error> {
    write_all(w, &[RESPONSE_OUTPUT])?;
    write_all(w, &u16::from(status).to_be_bytes())?;
    write_buffer(w, data)
}

/// The frame that closes a SNAPSHOT action.
pub fn write_snapshot(w: &mut impl Write, data: &[u8]) -> Result<(), Error> {
    write_buffer(w, data)
}

/// Read the frame that closes a SNAPSHOT action.
pub fn read_snapshot_reply(r: &mut impl Read) -> Result<Vec<u8>, Error> {
    read_buffer(r)
}

/////////////////////////////////////////// cond replies ///////////////////////////////////////////

/// The daemon's reply to COND_BROADCAST, COND_BROADCAST_DATA, and failed COND_CURRENT_VALUE
/// frames:  a single status byte, zero on success.
pub fn write_cond_reply(w: &mut impl Write, ok: bool) -> Result<(), Error> {
    write_all(w, &[if ok { 0 } else { 1 }])
}

/// The daemon's reply to a COND_CURRENT_VALUE frame that succeeds:  the zero status byte, the
/// condition's state, and its payload.
pub fn write_cond_value_reply(w: &mut impl Write, state: u64, data: &[u8]) -> Result<(), Error> {
    write_all(w, &[0])?;
    write_all(w, &state.to_be_bytes())?;
    write_buffer(w, data)
}

/// Child side:  read the status byte that answers a broadcast.
pub fn read_cond_reply(r: &mut impl Read) -> Result<bool, Error> {
    Ok(read_u8(r)? == 0)
}

/// Child side:  read the reply to a COND_CURRENT_VALUE frame.
pub fn read_cond_value_reply(r: &mut impl Read) -> Result<Option<(u64, Vec<u8>)>, Error> {
    if read_u8(r)? != 0 {
        return Ok(None);
    }
    let state = read_u64be(r)?;
    let data = read_buffer(r)?;
    Ok(Some((state, data)))
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
