//! replicant_pb provides the wire types shared by the replicant daemon and client:  identifiers,
//! return codes, call flags, commands as they travel through the consensus log, and the error
//! type.

use buffertk::{stack_pack, Unpackable};
use prototk_derive::Message;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The number of robust command outputs each server remembers.  Resubmissions whose `min_slot`
/// precedes the remembered window get [ReturnCode::Maybe].
pub const SERVER_DRIVEN_NONCE_HISTORY: usize = 4096;

/// The maximum number of replicas in a cluster.
pub const MAX_REPLICAS: usize = 7;

/// Call flag for at-least-once semantics.  The command may execute more than once if the client
/// resubmits.
pub const CALL_IDEMPOTENT: u32 = 1;
/// Call flag for exactly-once semantics.  The command carries a nonce and the server records its
/// output in the robust history.
pub const CALL_ROBUST: u32 = 2;

/// The largest two nonce values are reserved by the server's lookup structures and will never be
/// assigned to a command.
pub fn is_valid_nonce(nonce: u64) -> bool {
    nonce < u64::MAX - 1
}

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

macro_rules! generate_u64_id {
    ($what:ident, $prefix:literal) => {
        /// An opaque 64-bit identifier, totally ordered, compared as unsigned.
        #[derive(Clone, Copy, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
        pub struct $what {
            #[prototk(1, uint64)]
            id: u64,
        }

        impl $what {
            /// The smallest identifier.
            pub const BOTTOM: $what = $what { id: 0 };

            /// The largest identifier.
            pub const TOP: $what = $what { id: u64::MAX };

            /// Create a new identifier wrapping `id`.
            pub const fn new(id: u64) -> Self {
                Self { id }
            }

            /// The raw 64-bit value.
            pub const fn get(self) -> u64 {
                self.id
            }
        }

        impl std::fmt::Debug for $what {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                write!(f, concat!($prefix, "{}"), self.id)
            }
        }

        impl std::fmt::Display for $what {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                write!(f, "{:?}", self)
            }
        }

        impl From<u64> for $what {
            fn from(id: u64) -> Self {
                Self { id }
            }
        }
    };
}

generate_u64_id! {ServerID, "server:"}
generate_u64_id! {ObjectID, "object:"}
generate_u64_id! {ClientID, "client:"}

//////////////////////////////////////////// ReturnCode ////////////////////////////////////////////

/// The outcome of an operation as reported to clients and recorded in the robust history.  The
/// numeric values are fixed by the wire protocol:  the OUTPUT frame of the object-host protocol
/// carries them as a big-endian u16.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(u16)]
pub enum ReturnCode {
    #[default]
    Success = 5120,
    /// Maybe the operation happened, maybe it didn't; the history window aged past the point
    /// where the evidence would have lived.
    Maybe = 5121,
    /// The client connected to a different cluster than the one it bootstrapped against.
    ClusterJump = 5123,
    /// Total communication breakdown after exhausting every known server.
    CommFailed = 5124,
    ObjNotFound = 5184,
    ObjExist = 5185,
    FuncNotFound = 5186,
    CondNotFound = 5187,
    CondDestroyed = 5188,
    /// A server behaving abnormally.
    ServerError = 5248,
    Timeout = 5312,
    Interrupted = 5313,
    NonePending = 5314,
    /// This should never happen.  It indicates a bug.
    Internal = 5373,
}

impl ReturnCode {
    /// Interpret a wire-level status.  Returns None for values outside the protocol.
    pub fn from_u16(x: u16) -> Option<ReturnCode> {
        match x {
            5120 => Some(ReturnCode::Success),
            5121 => Some(ReturnCode::Maybe),
            5123 => Some(ReturnCode::ClusterJump),
            5124 => Some(ReturnCode::CommFailed),
            5184 => Some(ReturnCode::ObjNotFound),
            5185 => Some(ReturnCode::ObjExist),
            5186 => Some(ReturnCode::FuncNotFound),
            5187 => Some(ReturnCode::CondNotFound),
            5188 => Some(ReturnCode::CondDestroyed),
            5248 => Some(ReturnCode::ServerError),
            5312 => Some(ReturnCode::Timeout),
            5313 => Some(ReturnCode::Interrupted),
            5314 => Some(ReturnCode::NonePending),
            5373 => Some(ReturnCode::Internal),
            _ => None,
        }
    }
}

impl From<ReturnCode> for u16 {
    fn from(rc: ReturnCode) -> u16 {
        rc as u16
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let s = match self {
            ReturnCode::Success => "SUCCESS",
            ReturnCode::Maybe => "MAYBE",
            ReturnCode::ClusterJump => "CLUSTER_JUMP",
            ReturnCode::CommFailed => "COMM_FAILED",
            ReturnCode::ObjNotFound => "OBJ_NOT_FOUND",
            ReturnCode::ObjExist => "OBJ_EXIST",
            ReturnCode::FuncNotFound => "FUNC_NOT_FOUND",
            ReturnCode::CondNotFound => "COND_NOT_FOUND",
            ReturnCode::CondDestroyed => "COND_DESTROYED",
            ReturnCode::ServerError => "SERVER_ERROR",
            ReturnCode::Timeout => "TIMEOUT",
            ReturnCode::Interrupted => "INTERRUPTED",
            ReturnCode::NonePending => "NONE_PENDING",
            ReturnCode::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

////////////////////////////////////////////// Command /////////////////////////////////////////////

/// A command as it travels through the consensus log.  The header fields are filled in by the
/// surrounding RPC framing; `func` and `input` come from the caller.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Command {
    #[prototk(1, message)]
    pub object: ObjectID,
    #[prototk(2, message)]
    pub client: ClientID,
    #[prototk(3, uint64)]
    pub nonce: u64,
    #[prototk(4, uint32)]
    pub flags: u32,
    /// The oldest slot at which this command could have first been accepted.  Governs the MAYBE
    /// verdict when the robust history has aged past it.
    #[prototk(5, uint64)]
    pub min_slot: u64,
    #[prototk(6, string)]
    pub func: String,
    #[prototk(7, bytes)]
    pub input: Vec<u8>,
}

impl Command {
    pub fn is_idempotent(&self) -> bool {
        self.flags & CALL_IDEMPOTENT != 0
    }

    pub fn is_robust(&self) -> bool {
        self.flags & CALL_ROBUST != 0
    }

    /// Pack this command into the opaque bytes a [PValue] carries.
    pub fn to_pvalue(&self, slot: u64) -> PValue {
        PValue {
            slot,
            command: stack_pack(self).to_vec(),
        }
    }

    /// Unpack a command from a [PValue]'s bytes.
    pub fn from_pvalue(p: &PValue) -> Result<Command, Error> {
        let (cmd, _) = <Command as Unpackable>::unpack(&p.command)?;
        Ok(cmd)
    }
}

////////////////////////////////////////////// PValue //////////////////////////////////////////////

/// An ordered command as delivered by consensus:  the slot and the opaque command bytes.  Slots
/// form a strict monotone sequence and the core consumes them in slot order.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PValue {
    #[prototk(1, uint64)]
    pub slot: u64,
    #[prototk(2, bytes)]
    pub command: Vec<u8>,
}

////////////////////////////////////////// CommandResponse /////////////////////////////////////////

/// The materialized outcome of one command.  The response envelope that carries this back to the
/// client belongs to the transport, so this is not a wire message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandResponse {
    pub nonce: u64,
    pub status: ReturnCode,
    pub output: Vec<u8>,
}

impl CommandResponse {
    pub fn new(nonce: u64, status: ReturnCode, output: Vec<u8>) -> Self {
        Self {
            nonce,
            status,
            output,
        }
    }
}

////////////////////////////////////////////// Server //////////////////////////////////////////////

/// One server in the cluster configuration.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Server {
    #[prototk(1, message)]
    pub id: ServerID,
    #[prototk(2, string)]
    pub bind_to: String,
}

impl Server {
    pub fn new(id: ServerID, bind_to: impl Into<String>) -> Self {
        Self {
            id,
            bind_to: bind_to.into(),
        }
    }
}

/////////////////////////////////////////// Configuration //////////////////////////////////////////

/// A configuration of the cluster:  the cluster identity and the ordered list of servers.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Configuration {
    #[prototk(1, uint64)]
    pub cluster: u64,
    #[prototk(2, uint64)]
    pub version: u64,
    #[prototk(3, message)]
    pub servers: Vec<Server>,
}

impl Configuration {
    /// The servers of this configuration, in configuration order.
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// The position of `id` within the configuration.
    pub fn index(&self, id: ServerID) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    /// The ids of every server in the configuration.
    pub fn server_ids(&self) -> Vec<ServerID> {
        self.servers.iter().map(|s| s.id).collect()
    }
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type shared by the replicant crates.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(606208, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(606209, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        err: prototk::Error,
        #[prototk(3, string)]
        context: String,
    },
    /// An OS/IO error.
    #[prototk(606210, message)]
    IoError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// A bit-defined wire structure violated its framing:  the object socket, or a serialized
    /// history.
    #[prototk(606211, message)]
    ProtocolError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// An object child failed permanently.
    #[prototk(606212, message)]
    ObjectFailed {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// The named entity does not exist.
    #[prototk(606213, message)]
    NotFound {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// The named entity already exists.
    #[prototk(606214, message)]
    AlreadyExists {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// There was an error at the transport layer.  Transient; the client rotates servers.
    #[prototk(606215, message)]
    TransportFailure {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// The request timed out.
    #[prototk(606216, message)]
    TimedOut {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// A logic error in the replicant implementation.
    #[prototk(606217, message)]
    LogicError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
}

impl Error {
    pub fn io(what: impl Into<String>) -> Self {
        Self::IoError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn protocol(what: impl Into<String>) -> Self {
        Self::ProtocolError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn object_failed(what: impl Into<String>) -> Self {
        Self::ObjectFailed {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn transport(what: impl Into<String>) -> Self {
        Self::TransportFailure {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn timed_out(what: impl Into<String>) -> Self {
        Self::TimedOut {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn logic(what: impl Into<String>) -> Self {
        Self::LogicError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(err: buffertk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err: err.into(),
            context: "buffertk unpack error".to_string(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(err: prototk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err,
            context: "prototk unpack error".to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError {
            core: ErrorCore::default(),
            what: format!("{}", err),
        }
    }
}

iotoz! {Error}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
