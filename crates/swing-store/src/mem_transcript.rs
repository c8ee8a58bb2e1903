use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use swing_abi::VatId;
use swing_codec::Digest256;

use crate::transcript::{TranscriptEntry, TranscriptPosition, TranscriptStore};
use crate::{StoreError, StoreResult};

#[derive(Debug, Default, Clone)]
struct VatLog {
    entries: Vec<TranscriptEntry>,
    hash: Digest256,
}

/// In-memory transcript store; clones share the same logs.
#[derive(Clone, Default)]
pub struct MemTranscriptStore {
    logs: Arc<RwLock<HashMap<VatId, VatLog>>>,
}

impl std::fmt::Debug for MemTranscriptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemTranscriptStore")
            .field("vats", &logs.len())
            .finish()
    }
}

impl MemTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a recorded entry in place and recompute the chain hash.
    /// Exists to rewrite history in replay tests.
    pub fn overwrite_entry(
        &self,
        vat_id: &VatId,
        position: TranscriptPosition,
        entry: TranscriptEntry,
    ) -> StoreResult<()> {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(vat_id.clone()).or_default();
        let len = log.entries.len() as TranscriptPosition;
        let slot = log
            .entries
            .get_mut(position as usize)
            .ok_or_else(|| StoreError::PositionOutOfRange {
                vat_id: vat_id.to_string(),
                position,
                len,
            })?;
        *slot = entry;
        let mut hash = Digest256::default();
        for entry in &log.entries {
            hash = entry.chain_hash(&hash)?;
        }
        log.hash = hash;
        Ok(())
    }
}

impl TranscriptStore for MemTranscriptStore {
    fn append(&self, vat_id: &VatId, entry: &TranscriptEntry) -> StoreResult<TranscriptPosition> {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(vat_id.clone()).or_default();
        log.hash = entry.chain_hash(&log.hash)?;
        log.entries.push(entry.clone());
        Ok(log.entries.len() as TranscriptPosition - 1)
    }

    fn read_from(
        &self,
        vat_id: &VatId,
        start: TranscriptPosition,
    ) -> StoreResult<Vec<(TranscriptPosition, TranscriptEntry)>> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs
            .get(vat_id)
            .map(|log| {
                log.entries
                    .iter()
                    .enumerate()
                    .skip(start as usize)
                    .map(|(idx, entry)| (idx as TranscriptPosition, entry.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn len(&self, vat_id: &VatId) -> StoreResult<TranscriptPosition> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs
            .get(vat_id)
            .map(|log| log.entries.len() as TranscriptPosition)
            .unwrap_or(0))
    }

    fn hash(&self, vat_id: &VatId) -> StoreResult<Digest256> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.get(vat_id).map(|log| log.hash).unwrap_or_default())
    }

    fn delete_vat(&self, vat_id: &VatId) -> StoreResult<()> {
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(vat_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::TranscriptSyscall;
    use swing_abi::{SlotKind, VatDelivery, VatSlot, VatSyscall, VatSyscallResult};

    fn entry(n: u64) -> TranscriptEntry {
        let mut entry = TranscriptEntry::new(VatDelivery::BringOutYourDead);
        entry.syscalls.push(TranscriptSyscall {
            request: VatSyscall::Subscribe {
                vpid: VatSlot::import(SlotKind::Promise, n),
            },
            response: VatSyscallResult::ok(),
        });
        entry
    }

    #[test]
    fn append_and_read_from_position() {
        let store = MemTranscriptStore::new();
        let vat = VatId::from_index(1);
        for n in 0..3 {
            assert_eq!(store.append(&vat, &entry(n)).unwrap(), n);
        }
        assert_eq!(store.len(&vat).unwrap(), 3);
        let tail = store.read_from(&vat, 1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 1);
        assert_eq!(tail[1].1, entry(2));
        assert!(store.read_from(&VatId::from_index(9), 0).unwrap().is_empty());
    }

    #[test]
    fn overwrite_changes_hash() {
        let store = MemTranscriptStore::new();
        let vat = VatId::from_index(1);
        store.append(&vat, &entry(1)).unwrap();
        store.append(&vat, &entry(2)).unwrap();
        let before = store.hash(&vat).unwrap();
        store.overwrite_entry(&vat, 1, entry(7)).unwrap();
        assert_ne!(store.hash(&vat).unwrap(), before);
        store.overwrite_entry(&vat, 1, entry(2)).unwrap();
        assert_eq!(store.hash(&vat).unwrap(), before);
        assert!(store.overwrite_entry(&vat, 5, entry(0)).is_err());
    }

    #[test]
    fn delete_vat_forgets_log() {
        let store = MemTranscriptStore::new();
        let vat = VatId::from_index(2);
        store.append(&vat, &entry(0)).unwrap();
        store.delete_vat(&vat).unwrap();
        assert_eq!(store.len(&vat).unwrap(), 0);
        assert_eq!(store.hash(&vat).unwrap(), Digest256::default());
    }
}
