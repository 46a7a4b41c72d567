//! The client-side retry envelope.  A robust call reserves a `(nonce, min_slot)` pair once and
//! resubmits it unchanged across server failover, so the server-side robust history turns "retry
//! until someone answers" into exactly-once.  Transient transport errors rotate to the next
//! server; COMM_FAILED surfaces only after a full rotation exhausts; everything a server actually
//! says is terminal and returned verbatim.

use biometrics::{Collector, Counter};
use guacamole::Guacamole;
use indicio::{clue, WARNING};

use replicant_pb::{
    ClientID, Command, CommandResponse, Error, ObjectID, ReturnCode, ServerID, CALL_ROBUST,
};

use crate::server_selector::ServerSelector;
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CALL: Counter = Counter::new("replicant.client.call");
static ROTATE: Counter = Counter::new("replicant.client.rotate");
static COMM_FAILED: Counter = Counter::new("replicant.client.comm_failed");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CALL);
    collector.register_counter(&ROTATE);
    collector.register_counter(&COMM_FAILED);
}

//////////////////////////////////////////// Transport /////////////////////////////////////////////

/// The network seam.  Implementations speak whatever RPC the cluster speaks; the envelope only
/// needs these two calls and the transient/terminal split in their errors:
/// [Error::TimedOut] is terminal, every other error is transient and rotates.
pub trait Transport {
    /// Reserve a nonce for a robust call.  Returns the nonce and the oldest slot at which a
    /// command carrying it could first be accepted.
    fn unique_number(&mut self, server: ServerID, timeout_ms: u64) -> Result<(u64, u64), Error>;

    /// Submit a command to one server and wait for its response envelope.
    fn issue(
        &mut self,
        server: ServerID,
        cmd: &Command,
        timeout_ms: u64,
    ) -> Result<CommandResponse, Error>;
}

/////////////////////////////////////////// PendingRobust //////////////////////////////////////////

/// The stable identity of one robust call.  Once armed, the pair never changes, no matter how
/// many servers the call visits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PendingRobust {
    command_nonce: u64,
    min_slot: u64,
    armed: bool,
}

impl PendingRobust {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_params(&mut self, command_nonce: u64, min_slot: u64) {
        self.command_nonce = command_nonce;
        self.min_slot = min_slot;
        self.armed = true;
    }

    pub fn command_nonce(&self) -> u64 {
        self.command_nonce
    }

    pub fn min_slot(&self) -> u64 {
        self.min_slot
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

////////////////////////////////////////// ClientOptions ///////////////////////////////////////////

#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
pub struct ClientOptions {
    #[arrrg(optional, "Milliseconds to wait for any single request.")]
    pub timeout_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

////////////////////////////////////////////// Client //////////////////////////////////////////////

/// The client core:  selector rotation plus the pending-robust machinery, over a pluggable
/// transport.
pub struct Client<T: Transport> {
    client: ClientID,
    servers: Vec<ServerID>,
    transport: T,
    options: ClientOptions,
    guac: Guacamole,
}

impl<T: Transport> Client<T> {
    /// The rotation stream seeds from the client id, so one client's order is deterministic and
    /// different clients land on different servers.
    pub fn new(client: ClientID, servers: Vec<ServerID>, transport: T, options: ClientOptions) -> Self {
        let guac = Guacamole::new(client.get());
        Self {
            client,
            servers,
            transport,
            options,
            guac,
        }
    }

    /// Issue one call against the replicated object and block for its outcome.
    pub fn call(
        &mut self,
        object: ObjectID,
        func: &str,
        input: &[u8],
        flags: u32,
    ) -> (ReturnCode, Vec<u8>) {
        CALL.click();
        let mut pending = PendingRobust::new();
        if flags & CALL_ROBUST != 0 {
            if let Err(status) = self.reserve(&mut pending) {
                return (status, Vec::new());
            }
        }
        let cmd = Command {
            object,
            client: self.client,
            nonce: pending.command_nonce(),
            flags,
            min_slot: pending.min_slot(),
            func: func.to_string(),
            input: input.to_vec(),
        };
        let timeout_ms = self.options.timeout_ms;
        let mut sel = self.selector();
        loop {
            let Some(server) = sel.next() else {
                COMM_FAILED.click();
                return (ReturnCode::CommFailed, Vec::new());
            };
            match self.transport.issue(server, &cmd, timeout_ms) {
                Ok(resp) => {
                    return (resp.status, resp.output);
                }
                Err(Error::TimedOut { .. }) => {
                    return (ReturnCode::Timeout, Vec::new());
                }
                Err(err) => {
                    ROTATE.click();
                    clue!(COLLECTOR, WARNING, {
                        rotate: {
                            server: server.get(),
                            what: err.to_string(),
                        },
                    });
                }
            }
        }
    }

    fn reserve(&mut self, pending: &mut PendingRobust) -> Result<(), ReturnCode> {
        let timeout_ms = self.options.timeout_ms;
        let mut sel = self.selector();
        loop {
            let Some(server) = sel.next() else {
                COMM_FAILED.click();
                return Err(ReturnCode::CommFailed);
            };
            match self.transport.unique_number(server, timeout_ms) {
                Ok((nonce, min_slot)) => {
                    pending.set_params(nonce, min_slot);
                    return Ok(());
                }
                Err(Error::TimedOut { .. }) => {
                    return Err(ReturnCode::Timeout);
                }
                Err(_) => {
                    ROTATE.click();
                }
            }
        }
    }

    fn selector(&mut self) -> ServerSelector {
        let mut buf = [0u8; 8];
        self.guac.generate(&mut buf);
        ServerSelector::new(&self.servers, u64::from_le_bytes(buf))
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
