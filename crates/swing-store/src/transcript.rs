use serde::{Deserialize, Serialize};
use swing_abi::{VatDelivery, VatId, VatSyscall, VatSyscallResult};
use swing_codec::Digest256;

use crate::StoreResult;

/// Zero-based index of an entry in a vat's transcript.
pub type TranscriptPosition = u64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSyscall {
    pub request: VatSyscall,
    pub response: VatSyscallResult,
}

/// One delivery and the non-GC syscalls it made, in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub delivery: VatDelivery,
    #[serde(default)]
    pub syscalls: Vec<TranscriptSyscall>,
}

impl TranscriptEntry {
    pub fn new(delivery: VatDelivery) -> Self {
        Self {
            delivery,
            syscalls: Vec::new(),
        }
    }

    pub(crate) fn chain_hash(&self, previous: &Digest256) -> StoreResult<Digest256> {
        let bytes = swing_codec::to_canonical_cbor(self)?;
        Ok(previous.chain(&bytes))
    }
}

/// Append-only per-vat transcript logs. There is a single writer per vat:
/// the kernel never runs two deliveries to one vat at once.
pub trait TranscriptStore: Send + Sync {
    fn append(&self, vat_id: &VatId, entry: &TranscriptEntry) -> StoreResult<TranscriptPosition>;

    /// Entries at or after `start`, paired with their positions.
    fn read_from(
        &self,
        vat_id: &VatId,
        start: TranscriptPosition,
    ) -> StoreResult<Vec<(TranscriptPosition, TranscriptEntry)>>;

    /// Number of entries recorded for the vat.
    fn len(&self, vat_id: &VatId) -> StoreResult<TranscriptPosition>;

    /// Hash chained over every entry; changes whenever history changes.
    fn hash(&self, vat_id: &VatId) -> StoreResult<Digest256>;

    fn delete_vat(&self, vat_id: &VatId) -> StoreResult<()>;
}
