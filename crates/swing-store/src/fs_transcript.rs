use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use swing_abi::VatId;
use swing_codec::{Digest256, to_canonical_cbor};

use crate::transcript::{TranscriptEntry, TranscriptPosition, TranscriptStore};
use crate::{StoreError, StoreResult, io_error};

const TRANSCRIPT_DIR: &str = "transcripts";

#[derive(Serialize, Deserialize)]
struct DiskRecord {
    position: TranscriptPosition,
    entry: TranscriptEntry,
}

#[derive(Clone, Copy, Debug, Default)]
struct LogHead {
    next: TranscriptPosition,
    hash: Digest256,
}

/// Filesystem transcript store: one file per vat holding length-prefixed
/// (u32 LE) canonical CBOR records.
#[derive(Debug)]
pub struct FsTranscriptStore {
    dir: PathBuf,
    heads: Mutex<HashMap<VatId, LogHead>>,
}

impl FsTranscriptStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = root.as_ref().join(TRANSCRIPT_DIR);
        fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))?;
        Ok(Self {
            dir,
            heads: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, vat_id: &VatId) -> PathBuf {
        self.dir.join(format!("{vat_id}.log"))
    }

    fn head(&self, vat_id: &VatId) -> StoreResult<LogHead> {
        let mut heads = self.heads.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(head) = heads.get(vat_id) {
            return Ok(*head);
        }
        let mut head = LogHead::default();
        for record in read_all_records(&self.path_for(vat_id))? {
            if record.position != head.next {
                return Err(StoreError::Corrupt(format!(
                    "{vat_id}: expected position {}, found {}",
                    head.next, record.position
                )));
            }
            head.hash = record.entry.chain_hash(&head.hash)?;
            head.next += 1;
        }
        heads.insert(vat_id.clone(), head);
        Ok(head)
    }
}

impl TranscriptStore for FsTranscriptStore {
    fn append(&self, vat_id: &VatId, entry: &TranscriptEntry) -> StoreResult<TranscriptPosition> {
        let head = self.head(vat_id)?;
        let record = DiskRecord {
            position: head.next,
            entry: entry.clone(),
        };
        let bytes = to_canonical_cbor(&record)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| StoreError::Corrupt("entry larger than 4GiB".into()))?;
        let path = self.path_for(vat_id);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        file.write_all(&len.to_le_bytes())
            .and_then(|_| file.write_all(&bytes))
            .and_then(|_| file.sync_all())
            .map_err(|err| io_error(&path, err))?;

        let next = LogHead {
            next: head.next + 1,
            hash: entry.chain_hash(&head.hash)?,
        };
        self.heads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vat_id.clone(), next);
        Ok(head.next)
    }

    fn read_from(
        &self,
        vat_id: &VatId,
        start: TranscriptPosition,
    ) -> StoreResult<Vec<(TranscriptPosition, TranscriptEntry)>> {
        Ok(read_all_records(&self.path_for(vat_id))?
            .into_iter()
            .filter(|record| record.position >= start)
            .map(|record| (record.position, record.entry))
            .collect())
    }

    fn len(&self, vat_id: &VatId) -> StoreResult<TranscriptPosition> {
        Ok(self.head(vat_id)?.next)
    }

    fn hash(&self, vat_id: &VatId) -> StoreResult<Digest256> {
        Ok(self.head(vat_id)?.hash)
    }

    fn delete_vat(&self, vat_id: &VatId) -> StoreResult<()> {
        let path = self.path_for(vat_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&path, err)),
        }
        self.heads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(vat_id);
        Ok(())
    }
}

fn read_all_records(path: &Path) -> StoreResult<Vec<DiskRecord>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(path, err)),
    };
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        let read = file.read(&mut len_buf).map_err(|err| io_error(path, err))?;
        if read == 0 {
            break;
        }
        if read < len_buf.len() {
            file.read_exact(&mut len_buf[read..]).map_err(|err| {
                if err.kind() == ErrorKind::UnexpectedEof {
                    torn(path, records.len(), format!("length header cut off after {read} bytes"))
                } else {
                    io_error(path, err)
                }
            })?;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                torn(path, records.len(), format!("payload shorter than its {len} byte header"))
            } else {
                io_error(path, err)
            }
        })?;
        records.push(serde_cbor::from_slice(&buf)?);
    }
    Ok(records)
}

/// A record cut short, typically by a crash mid-append.
fn torn(path: &Path, complete: usize, detail: String) -> StoreError {
    log::warn!("{}: torn record after {complete} complete entries: {detail}", path.display());
    StoreError::Corrupt(format!("{}: torn record {complete}: {detail}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::TranscriptSyscall;
    use crate::MemTranscriptStore;
    use swing_abi::{CapData, Message, SlotKind, VatDelivery, VatSlot, VatSyscall, VatSyscallResult};
    use tempfile::TempDir;

    fn sample(method: &str) -> TranscriptEntry {
        let target = VatSlot::export(SlotKind::Object, 0);
        let mut entry = TranscriptEntry::new(VatDelivery::Message {
            target,
            msg: Message::new(method, CapData::new("[]", vec![]), None),
        });
        entry.syscalls.push(TranscriptSyscall {
            request: VatSyscall::VatstoreSet {
                key: "k".into(),
                value: method.into(),
            },
            response: VatSyscallResult::ok(),
        });
        entry
    }

    #[test]
    fn writes_and_recovers_entries() {
        let tmp = TempDir::new().unwrap();
        let vat = VatId::from_index(1);
        {
            let store = FsTranscriptStore::open(tmp.path()).unwrap();
            assert_eq!(store.append(&vat, &sample("a")).unwrap(), 0);
            assert_eq!(store.append(&vat, &sample("b")).unwrap(), 1);
        }
        let store = FsTranscriptStore::open(tmp.path()).unwrap();
        assert_eq!(store.len(&vat).unwrap(), 2);
        let entries = store.read_from(&vat, 1).unwrap();
        assert_eq!(entries, vec![(1, sample("b"))]);
        assert_eq!(store.append(&vat, &sample("c")).unwrap(), 2);
    }

    #[test]
    fn hash_matches_memory_store() {
        let tmp = TempDir::new().unwrap();
        let vat = VatId::from_index(4);
        let fs_store = FsTranscriptStore::open(tmp.path()).unwrap();
        let mem_store = MemTranscriptStore::new();
        for method in ["x", "y"] {
            fs_store.append(&vat, &sample(method)).unwrap();
            mem_store.append(&vat, &sample(method)).unwrap();
        }
        assert_eq!(fs_store.hash(&vat).unwrap(), mem_store.hash(&vat).unwrap());
        let reopened = FsTranscriptStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.hash(&vat).unwrap(), mem_store.hash(&vat).unwrap());
    }

    #[test]
    fn detects_truncated_entry() {
        let tmp = TempDir::new().unwrap();
        let vat = VatId::from_index(1);
        let store = FsTranscriptStore::open(tmp.path()).unwrap();
        store.append(&vat, &sample("payload")).unwrap();
        let path = store.path_for(&vat);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let reopened = FsTranscriptStore::open(tmp.path()).unwrap();
        let err = reopened.read_from(&vat, 0).unwrap_err();
        assert!(matches!(&err, StoreError::Corrupt(reason) if reason.contains("torn record 0")), "{err}");

        // A second entry whose length header was only partly written.
        fs::write(&path, [bytes.as_slice(), &[7u8, 0][..]].concat()).unwrap();
        let reopened = FsTranscriptStore::open(tmp.path()).unwrap();
        let err = reopened.read_from(&vat, 0).unwrap_err();
        assert!(matches!(&err, StoreError::Corrupt(reason) if reason.contains("torn record 1")), "{err}");
    }

    #[test]
    fn delete_vat_removes_file() {
        let tmp = TempDir::new().unwrap();
        let vat = VatId::from_index(3);
        let store = FsTranscriptStore::open(tmp.path()).unwrap();
        store.append(&vat, &sample("a")).unwrap();
        store.delete_vat(&vat).unwrap();
        assert!(!store.path_for(&vat).exists());
        assert_eq!(store.len(&vat).unwrap(), 0);
        store.delete_vat(&vat).unwrap();
    }
}
