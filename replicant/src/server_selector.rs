//! The client-side server selector.  Each client sorts the known servers and rotates the order so
//! it starts at the first id at or after a 64-bit random, which spreads clients across servers
//! without a coordinator while keeping each client's order deterministic.

use replicant_pb::ServerID;

pub struct ServerSelector {
    servers: Vec<ServerID>,
    consumed: usize,
}

impl ServerSelector {
    pub fn new(servers: &[ServerID], random: u64) -> Self {
        let mut servers = servers.to_vec();
        servers.sort();
        let idx = servers.partition_point(|s| s.get() < random);
        if idx < servers.len() {
            servers.rotate_left(idx);
        }
        Self {
            servers,
            consumed: 0,
        }
    }

    /// The next server to try, or None once every server has been consumed.
    pub fn next(&mut self) -> Option<ServerID> {
        if self.consumed >= self.servers.len() {
            None
        } else {
            let server = self.servers[self.consumed];
            self.consumed += 1;
            Some(server)
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
