//! The robust history is the per-server dedup ledger behind exactly-once execution.  After an
//! object executes a robust command at some slot, any later resubmission carrying the same nonce
//! observes the identical `(status, output)`.  If the history window has slid past the
//! resubmission's `min_slot`, the verdict is MAYBE instead:  the evidence would have lived in the
//! part of the window that aged out, so the server cannot say whether the command ran.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use biometrics::{Collector, Counter};

use replicant_pb::{is_valid_nonce, Error, PValue, ReturnCode};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static EXECUTED: Counter = Counter::new("replicant.history.executed");
static REMEMBERED: Counter = Counter::new("replicant.history.remembered");
static MAYBE: Counter = Counter::new("replicant.history.maybe");
static EVICTED: Counter = Counter::new("replicant.history.evicted");
static RESERVED_NONCE: Counter = Counter::new("replicant.history.reserved_nonce");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&EXECUTED);
    collector.register_counter(&REMEMBERED);
    collector.register_counter(&MAYBE);
    collector.register_counter(&EVICTED);
    collector.register_counter(&RESERVED_NONCE);
}

/////////////////////////////////////////////// Entry //////////////////////////////////////////////

#[derive(Clone, Debug, Eq, PartialEq)]
struct Entry {
    slot: u64,
    nonce: u64,
    status: ReturnCode,
    output: Vec<u8>,
}

/////////////////////////////////////////////// Inner //////////////////////////////////////////////

#[derive(Debug, Default)]
struct Inner {
    history: VecDeque<Entry>,
    nonces: HashSet<u64>,
    inhibit_gc: bool,
}

impl Inner {
    fn cleanup(&mut self, capacity: usize) {
        if self.inhibit_gc {
            return;
        }
        while self.history.len() > capacity {
            if let Some(evicted) = self.history.pop_front() {
                self.nonces.remove(&evicted.nonce);
                EVICTED.click();
            }
        }
    }
}

/////////////////////////////////////////// RobustHistory //////////////////////////////////////////

/// The dedup ledger:  an ordered-by-slot window of `(slot, nonce, status, output)` entries with a
/// nonce membership set, bounded GC, and a GC inhibit used while snapshots export the window.
pub struct RobustHistory {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl RobustHistory {
    pub fn new() -> Self {
        Self::with_capacity(replicant_pb::SERVER_DRIVEN_NONCE_HISTORY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Look up the remembered outcome for `nonce`.  Returns the recorded `(status, output)` if
    /// the nonce is in the window, `(MAYBE, [])` if the window has aged past `min_slot` without
    /// evidence, and None if the command has simply not executed yet.
    pub fn has_output(&self, nonce: u64, min_slot: u64) -> Option<(ReturnCode, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        if !inner.history.is_empty()
            && min_slot < inner.history.front().map(|e| e.slot).unwrap_or(0)
            && !inner.nonces.contains(&nonce)
        {
            MAYBE.click();
            return Some((ReturnCode::Maybe, Vec::new()));
        }
        if !inner.nonces.contains(&nonce) {
            return None;
        }
        // the membership set says the entry is in the window
        let found = inner.history.iter().find(|e| e.nonce == nonce);
        found.map(|e| {
            REMEMBERED.click();
            (e.status, e.output.clone())
        })
    }

    /// Record the outcome of the command executed at `p.slot`.  Recording the same slot or the
    /// same nonce twice is a no-op.
    pub fn executed(&self, p: &PValue, command_nonce: u64, status: ReturnCode, result: &[u8]) {
        if !is_valid_nonce(command_nonce) {
            RESERVED_NONCE.click();
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.nonces.contains(&command_nonce) {
            return;
        }
        let entry = Entry {
            slot: p.slot,
            nonce: command_nonce,
            status,
            output: result.to_vec(),
        };
        // In practice the insert always lands at the back because slots arrive in order; the
        // remaining cases keep the window sorted if they ever fire.
        if inner.history.is_empty() {
            inner.history.push_back(entry);
        } else if inner.history.front().map(|e| e.slot).unwrap_or(0) > p.slot {
            inner.history.push_front(entry);
        } else {
            let idx = inner.history.partition_point(|e| e.slot < p.slot);
            if idx < inner.history.len() && inner.history[idx].slot == p.slot {
                return;
            }
            inner.history.insert(idx, entry);
        }
        inner.nonces.insert(command_nonce);
        EXECUTED.click();
        let capacity = self.capacity;
        inner.cleanup(capacity);
    }

    /// Clear `other` and copy into it every entry with a slot before `slot`, in order.
    pub fn copy_up_to(&self, other: &RobustHistory, slot: u64) {
        let inner = self.inner.lock().unwrap();
        let mut target = other.inner.lock().unwrap();
        target.history.clear();
        target.nonces.clear();
        for entry in inner.history.iter() {
            if entry.slot < slot {
                target.nonces.insert(entry.nonce);
                target.history.push_back(entry.clone());
            }
        }
    }

    /// Pin the window:  cleanup becomes a no-op until [RobustHistory::allow_gc].
    pub fn inhibit_gc(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.inhibit_gc = true;
    }

    /// Release the window and run the deferred cleanup.
    pub fn allow_gc(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.inhibit_gc = false;
        let capacity = self.capacity;
        inner.cleanup(capacity);
    }

    /// The slot of the oldest remembered entry.  `min_slot`s before this boundary draw MAYBE.
    pub fn window_start(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.history.front().map(|e| e.slot)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the window:  a big-endian u32 entry count, then per entry the slot, the nonce,
    /// the status as a u16, and the length-prefixed output.
    pub fn serialize(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(inner.history.len() as u32).to_be_bytes());
        for entry in inner.history.iter() {
            buf.extend_from_slice(&entry.slot.to_be_bytes());
            buf.extend_from_slice(&entry.nonce.to_be_bytes());
            buf.extend_from_slice(&u16::from(entry.status).to_be_bytes());
            buf.extend_from_slice(&(entry.output.len() as u32).to_be_bytes());
            buf.extend_from_slice(&entry.output);
        }
        buf
    }

    /// Replace the window with a serialized one, rebuild the membership set, and run cleanup so
    /// the size invariant holds even when the serialized window was larger.
    pub fn deserialize(&self, buf: &[u8]) -> Result<(), Error> {
        fn take<'a>(buf: &mut &'a [u8], sz: usize) -> Result<&'a [u8], Error> {
            if buf.len() < sz {
                return Err(Error::protocol("truncated robust history"));
            }
            let (head, tail) = buf.split_at(sz);
            *buf = tail;
            Ok(head)
        }
        fn take_u32(buf: &mut &[u8]) -> Result<u32, Error> {
            let head = take(buf, 4)?;
            Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
        }
        fn take_u64(buf: &mut &[u8]) -> Result<u64, Error> {
            let head = take(buf, 8)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(head);
            Ok(u64::from_be_bytes(bytes))
        }
        let mut buf = buf;
        let count = take_u32(&mut buf)?;
        let mut history = VecDeque::with_capacity(count as usize);
        let mut nonces = HashSet::with_capacity(count as usize);
        for _ in 0..count {
            let slot = take_u64(&mut buf)?;
            let nonce = take_u64(&mut buf)?;
            let status = take(&mut buf, 2)?;
            let status = u16::from_be_bytes([status[0], status[1]]);
            let status = ReturnCode::from_u16(status)
                .ok_or_else(|| Error::protocol(format!("bad status {} in robust history", status)))?;
            let output_sz = take_u32(&mut buf)? as usize;
            let output = take(&mut buf, output_sz)?.to_vec();
            nonces.insert(nonce);
            history.push_back(Entry {
                slot,
                nonce,
                status,
                output,
            });
        }
        if !buf.is_empty() {
            return Err(Error::protocol("trailing bytes in robust history"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.history = history;
        inner.nonces = nonces;
        let capacity = self.capacity;
        inner.cleanup(capacity);
        Ok(())
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let inner = self.inner.lock().unwrap();
        let mut prev: Option<u64> = None;
        for entry in inner.history.iter() {
            if let Some(prev) = prev {
                assert!(prev < entry.slot);
            }
            prev = Some(entry.slot);
            assert!(inner.nonces.contains(&entry.nonce));
        }
        assert_eq!(inner.nonces.len(), inner.history.len());
    }
}

impl Default for RobustHistory {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use guacamole::Guacamole;

    use super::*;

    fn pvalue(slot: u64) -> PValue {
        PValue {
            slot,
            command: Vec::new(),
        }
    }

    #[test]
    fn remembered_output_is_stable() {
        let history = RobustHistory::new();
        history.executed(&pvalue(100), 42, ReturnCode::Success, b"A");
        assert_eq!(
            Some((ReturnCode::Success, b"A".to_vec())),
            history.has_output(42, 50)
        );
        assert_eq!(
            Some((ReturnCode::Success, b"A".to_vec())),
            history.has_output(42, 200)
        );
        history.check_invariants();
    }

    #[test]
    fn absent_nonce_with_live_window() {
        let history = RobustHistory::new();
        history.executed(&pvalue(100), 42, ReturnCode::Success, b"A");
        // min_slot at or after the window start means the evidence would still be here
        assert_eq!(None, history.has_output(9999, 100));
        assert_eq!(None, history.has_output(9999, 150));
    }

    #[test]
    fn aged_window_draws_maybe() {
        let history = RobustHistory::with_capacity(5);
        for i in 0..10u64 {
            history.executed(&pvalue(100 + i), i, ReturnCode::Success, b"");
        }
        assert_eq!(Some(105), history.window_start());
        assert_eq!(
            Some((ReturnCode::Maybe, Vec::new())),
            history.has_output(9999, 50)
        );
        // a nonce still in the window is remembered even though the window aged
        assert_eq!(
            Some((ReturnCode::Success, Vec::new())),
            history.has_output(7, 50)
        );
        history.check_invariants();
    }

    #[test]
    fn failures_are_remembered_too() {
        let history = RobustHistory::new();
        history.executed(&pvalue(3), 7, ReturnCode::FuncNotFound, b"");
        assert_eq!(
            Some((ReturnCode::FuncNotFound, Vec::new())),
            history.has_output(7, 1)
        );
    }

    #[test]
    fn gc_bounds_the_window() {
        let history = RobustHistory::with_capacity(4);
        for i in 0..100u64 {
            history.executed(&pvalue(i + 1), i, ReturnCode::Success, b"x");
            assert!(history.len() <= 4);
        }
        history.check_invariants();
    }

    #[test]
    fn inhibit_gc_pins_the_window() {
        let history = RobustHistory::with_capacity(2);
        history.inhibit_gc();
        for i in 0..10u64 {
            history.executed(&pvalue(i + 1), i, ReturnCode::Success, b"");
        }
        assert_eq!(10, history.len());
        history.allow_gc();
        assert_eq!(2, history.len());
        history.check_invariants();
    }

    #[test]
    fn same_slot_and_same_nonce_record_once() {
        let history = RobustHistory::new();
        history.executed(&pvalue(5), 1, ReturnCode::Success, b"first");
        history.executed(&pvalue(5), 2, ReturnCode::Success, b"second");
        history.executed(&pvalue(6), 1, ReturnCode::Success, b"third");
        assert_eq!(1, history.len());
        assert_eq!(
            Some((ReturnCode::Success, b"first".to_vec())),
            history.has_output(1, 5)
        );
        history.check_invariants();
    }

    #[test]
    fn head_insert_is_explicit() {
        let history = RobustHistory::new();
        history.executed(&pvalue(10), 1, ReturnCode::Success, b"");
        history.executed(&pvalue(5), 2, ReturnCode::Success, b"");
        history.executed(&pvalue(7), 3, ReturnCode::Success, b"");
        assert_eq!(Some(5), history.window_start());
        assert_eq!(3, history.len());
        history.check_invariants();
    }

    #[test]
    fn reserved_nonces_are_rejected() {
        let history = RobustHistory::new();
        history.executed(&pvalue(1), u64::MAX, ReturnCode::Success, b"");
        history.executed(&pvalue(2), u64::MAX - 1, ReturnCode::Success, b"");
        assert!(history.is_empty());
    }

    #[test]
    fn copy_up_to_takes_a_prefix() {
        let history = RobustHistory::new();
        for i in 1..=10u64 {
            history.executed(&pvalue(i), i, ReturnCode::Success, b"");
        }
        let prefix = RobustHistory::new();
        history.copy_up_to(&prefix, 6);
        assert_eq!(5, prefix.len());
        assert_eq!(Some((ReturnCode::Success, Vec::new())), prefix.has_output(5, 1));
        assert_eq!(None, prefix.has_output(6, 1));
        prefix.check_invariants();
    }

    #[test]
    fn serialization_round_trips() {
        let history = RobustHistory::new();
        history.executed(&pvalue(10), 1, ReturnCode::Success, b"one");
        history.executed(&pvalue(11), 2, ReturnCode::FuncNotFound, b"");
        history.executed(&pvalue(12), 3, ReturnCode::Success, b"three");
        let buf = history.serialize();
        let restored = RobustHistory::new();
        restored.deserialize(&buf).unwrap();
        assert_eq!(3, restored.len());
        for (nonce, status, output) in [
            (1u64, ReturnCode::Success, b"one".to_vec()),
            (2, ReturnCode::FuncNotFound, Vec::new()),
            (3, ReturnCode::Success, b"three".to_vec()),
        ] {
            assert_eq!(Some((status, output)), restored.has_output(nonce, 10));
        }
        restored.check_invariants();
    }

    #[test]
    fn deserialization_upholds_the_bound() {
        let history = RobustHistory::new();
        for i in 1..=10u64 {
            history.executed(&pvalue(i), i, ReturnCode::Success, b"");
        }
        let buf = history.serialize();
        let restored = RobustHistory::with_capacity(4);
        restored.deserialize(&buf).unwrap();
        assert_eq!(4, restored.len());
        assert_eq!(Some(7), restored.window_start());
        restored.check_invariants();
    }

    #[test]
    fn deserialization_rejects_garbage() {
        let history = RobustHistory::new();
        assert!(history.deserialize(&[1, 2, 3]).is_err());
        let mut buf = 1u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&1u64.to_be_bytes());
        buf.extend_from_slice(&1u64.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert!(history.deserialize(&buf).is_err());
    }

    #[test]
    fn random_order_keeps_invariants() {
        let mut guac = Guacamole::new(0x7e5707a15);
        let history = RobustHistory::with_capacity(64);
        for nonce in 0..1000u64 {
            let mut buf = [0u8; 8];
            guac.generate(&mut buf);
            let slot = u64::from_le_bytes(buf) % 4096;
            history.executed(&pvalue(slot), nonce, ReturnCode::Success, b"");
            history.check_invariants();
        }
    }
}
