//! The in-process realization of the condition capability set:  the daemon's authoritative table
//! of named conditions.  Each condition carries a monotonically increasing 64-bit state and the
//! payload of its most recent broadcast.  The other realization lives in the object child, which
//! forwards the same calls over its socket; the object manager routes those frames here.

use std::collections::{HashMap, HashSet};

use replicant_pb::ReturnCode;
use rsm::Conditions;

#[derive(Clone, Debug, Default)]
struct Condition {
    state: u64,
    data: Vec<u8>,
}

/// One object's conditions.  Destroyed conditions are remembered so waiters can distinguish
/// "never existed" from "went away".
#[derive(Debug, Default)]
pub struct ConditionTable {
    conditions: HashMap<String, Condition>,
    destroyed: HashSet<String>,
}

impl ConditionTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Conditions for ConditionTable {
    fn cond_create(&mut self, cond: &str) -> Result<(), ReturnCode> {
        self.destroyed.remove(cond);
        self.conditions.entry(cond.to_string()).or_default();
        Ok(())
    }

    fn cond_destroy(&mut self, cond: &str) -> Result<(), ReturnCode> {
        if self.conditions.remove(cond).is_none() {
            return Err(ReturnCode::CondNotFound);
        }
        self.destroyed.insert(cond.to_string());
        Ok(())
    }

    fn cond_broadcast(&mut self, cond: &str) -> Result<(), ReturnCode> {
        match self.conditions.get_mut(cond) {
            Some(c) => {
                c.state += 1;
                c.data.clear();
                Ok(())
            }
            None if self.destroyed.contains(cond) => Err(ReturnCode::CondDestroyed),
            None => Err(ReturnCode::CondNotFound),
        }
    }

    fn cond_broadcast_data(&mut self, cond: &str, data: &[u8]) -> Result<(), ReturnCode> {
        match self.conditions.get_mut(cond) {
            Some(c) => {
                c.state += 1;
                c.data.clear();
                c.data.extend_from_slice(data);
                Ok(())
            }
            None if self.destroyed.contains(cond) => Err(ReturnCode::CondDestroyed),
            None => Err(ReturnCode::CondNotFound),
        }
    }

    fn cond_current_value(&mut self, cond: &str) -> Result<(u64, Vec<u8>), ReturnCode> {
        match self.conditions.get(cond) {
            Some(c) => Ok((c.state, c.data.clone())),
            None if self.destroyed.contains(cond) => Err(ReturnCode::CondDestroyed),
            None => Err(ReturnCode::CondNotFound),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let mut table = ConditionTable::new();
        assert_eq!(Err(ReturnCode::CondNotFound), table.cond_broadcast("c"));
        table.cond_create("c").unwrap();
        assert_eq!(Ok((0, Vec::new())), table.cond_current_value("c"));
        table.cond_broadcast("c").unwrap();
        assert_eq!(Ok((1, Vec::new())), table.cond_current_value("c"));
        table.cond_broadcast_data("c", b"payload").unwrap();
        assert_eq!(Ok((2, b"payload".to_vec())), table.cond_current_value("c"));
        // a plain broadcast clears the payload
        table.cond_broadcast("c").unwrap();
        assert_eq!(Ok((3, Vec::new())), table.cond_current_value("c"));
    }

    #[test]
    fn destroyed_is_not_unknown() {
        let mut table = ConditionTable::new();
        table.cond_create("c").unwrap();
        table.cond_destroy("c").unwrap();
        assert_eq!(Err(ReturnCode::CondDestroyed), table.cond_broadcast("c"));
        assert_eq!(Err(ReturnCode::CondDestroyed), table.cond_current_value("c"));
        assert_eq!(Err(ReturnCode::CondNotFound), table.cond_destroy("c"));
        assert_eq!(Err(ReturnCode::CondNotFound), table.cond_broadcast("d"));
        // re-creation resurrects the condition with fresh state
        table.cond_create("c").unwrap();
        assert_eq!(Ok((0, Vec::new())), table.cond_current_value("c"));
    }

    #[test]
    fn create_is_idempotent() {
        let mut table = ConditionTable::new();
        table.cond_create("c").unwrap();
        table.cond_broadcast("c").unwrap();
        table.cond_create("c").unwrap();
        assert_eq!(Ok((1, Vec::new())), table.cond_current_value("c"));
    }
}
