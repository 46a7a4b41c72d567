//! The controller answers "where does this server live?"  It consults an auxiliary list before
//! the configuration proper, so a server learned out of band (say, from a bootstrap hint) can be
//! reached before the configuration catches up.

use std::sync::Mutex;

use replicant_pb::{Configuration, Server, ServerID};

#[derive(Debug, Default)]
struct Inner {
    config: Configuration,
    aux: Vec<Server>,
}

pub struct Controller {
    inner: Mutex<Inner>,
}

impl Controller {
    pub fn new(config: Configuration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                aux: Vec::new(),
            }),
        }
    }

    /// The address `si` binds to, aux list first.
    pub fn lookup(&self, si: ServerID) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        for server in inner.aux.iter() {
            if server.id == si {
                return Some(server.bind_to.clone());
            }
        }
        for server in inner.config.servers().iter() {
            if server.id == si {
                return Some(server.bind_to.clone());
            }
        }
        None
    }

    /// Remember an out-of-band server.  Servers the configuration already names verbatim are
    /// ignored; an aux entry for the same id is replaced.
    pub fn add_aux(&self, s: Server) {
        let mut inner = self.inner.lock().unwrap();
        for server in inner.config.servers().iter() {
            if server.id == s.id && server.bind_to == s.bind_to {
                return;
            }
        }
        for server in inner.aux.iter_mut() {
            if server.id == s.id {
                *server = s;
                return;
            }
        }
        inner.aux.push(s);
    }

    pub fn clear_aux(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aux.clear();
    }

    /// Swap in a new configuration.
    pub fn reconfigure(&self, config: Configuration) {
        let mut inner = self.inner.lock().unwrap();
        inner.config = config;
        inner.aux.clear();
    }

    pub fn config(&self) -> Configuration {
        let inner = self.inner.lock().unwrap();
        inner.config.clone()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> Controller {
        Controller::new(Configuration {
            cluster: 1,
            version: 1,
            servers: vec![
                Server::new(ServerID::new(1), "one:2049"),
                Server::new(ServerID::new(2), "two:2049"),
            ],
        })
    }

    #[test]
    fn lookup_prefers_aux() {
        let controller = controller();
        assert_eq!(Some("one:2049".to_string()), controller.lookup(ServerID::new(1)));
        controller.add_aux(Server::new(ServerID::new(1), "one.alt:2049"));
        assert_eq!(
            Some("one.alt:2049".to_string()),
            controller.lookup(ServerID::new(1))
        );
        controller.clear_aux();
        assert_eq!(Some("one:2049".to_string()), controller.lookup(ServerID::new(1)));
    }

    #[test]
    fn aux_refuses_configured_duplicates() {
        let controller = controller();
        controller.add_aux(Server::new(ServerID::new(2), "two:2049"));
        controller.add_aux(Server::new(ServerID::new(3), "three:2049"));
        controller.add_aux(Server::new(ServerID::new(3), "three.alt:2049"));
        assert_eq!(
            Some("three.alt:2049".to_string()),
            controller.lookup(ServerID::new(3))
        );
        assert_eq!(None, controller.lookup(ServerID::new(4)));
    }

    #[test]
    fn reconfigure_replaces_and_clears() {
        let controller = controller();
        controller.add_aux(Server::new(ServerID::new(3), "three:2049"));
        controller.reconfigure(Configuration {
            cluster: 1,
            version: 2,
            servers: vec![Server::new(ServerID::new(9), "nine:2049")],
        });
        assert_eq!(None, controller.lookup(ServerID::new(1)));
        assert_eq!(None, controller.lookup(ServerID::new(3)));
        assert_eq!(Some("nine:2049".to_string()), controller.lookup(ServerID::new(9)));
    }
}
