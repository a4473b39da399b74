//! Prepared-id registry
//!
//! A sharded set of the gtrids of externally-visible prepared branches,
//! kept in sync with the transaction cache for one narrow purpose: binlog
//! rotation snapshots the set into each new file's preamble. Rotation is
//! serialized by the binlog's own lock, so `serialize_into` reads a
//! consistent snapshot without stopping concurrent add/del on other shards.

use parking_lot::Mutex;
use std::collections::BTreeSet;

const SLOTS: usize = 16;
const SEPARATOR: u8 = b'|';

/// Sharded set of prepared branch ids (raw gtrid bytes).
pub struct PreparedRegistry {
    slots: [Mutex<BTreeSet<Vec<u8>>>; SLOTS],
}

impl PreparedRegistry {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(BTreeSet::new())),
        }
    }

    fn slot(&self, id: &[u8]) -> &Mutex<BTreeSet<Vec<u8>>> {
        // FNV-1a; ids are short and the distribution only has to spread
        // contention, not be cryptographic.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for &byte in id {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.slots[(hash as usize) % SLOTS]
    }

    pub fn add_id(&self, id: &[u8]) {
        self.slot(id).lock().insert(id.to_vec());
    }

    pub fn del_id(&self, id: &[u8]) {
        self.slot(id).lock().remove(id);
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.slot(id).lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().map(|slot| slot.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append every id, `'|'`-separated, to `out`. Must only be called
    /// under the binlog rotation lock.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        let mut first = out.is_empty();
        for slot in &self.slots {
            let ids = slot.lock();
            for id in ids.iter() {
                if !first {
                    out.push(SEPARATOR);
                }
                first = false;
                out.extend_from_slice(id);
            }
        }
    }

    /// Split a serialized id list back into a set. An empty list is fine.
    pub fn parse(bytes: &[u8]) -> BTreeSet<Vec<u8>> {
        bytes
            .split(|&b| b == SEPARATOR)
            .filter(|segment| !segment.is_empty())
            .map(<[u8]>::to_vec)
            .collect()
    }

    /// Seed the registry from recovery: every retained prepared id.
    pub fn populate_from_recovery(&self, prepared: &BTreeSet<Vec<u8>>) {
        for id in prepared {
            self.add_id(id);
        }
    }

    /// Seed the registry from a binlog preamble: the prepared ids minus
    /// those the same file already finalized.
    pub fn populate_reconciled(
        &self,
        mut prepared: BTreeSet<Vec<u8>>,
        committed: &BTreeSet<Vec<u8>>,
        aborted: &BTreeSet<Vec<u8>>,
    ) {
        for id in committed {
            prepared.remove(id);
        }
        for id in aborted {
            prepared.remove(id);
        }
        self.populate_from_recovery(&prepared);
    }
}

impl Default for PreparedRegistry {
    fn default() -> Self {
        Self::new()
    }
}
