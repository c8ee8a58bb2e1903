//! Vat slots (`o+5`, `p-12`, `d-1`) and kernel slots (`ko5`, `kp12`, `kd1`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("unrecognized slot type {0:?}")]
    UnrecognizedType(String),
    #[error("malformed slot {0:?}")]
    Malformed(String),
    #[error("expected {expected} slot, got {found}")]
    WrongKind { expected: SlotKind, found: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKind {
    Object,
    Promise,
    Device,
}

impl SlotKind {
    pub fn letter(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Device => 'd',
        }
    }

    fn from_letter(letter: u8) -> Option<Self> {
        match letter {
            b'o' => Some(SlotKind::Object),
            b'p' => Some(SlotKind::Promise),
            b'd' => Some(SlotKind::Device),
            _ => None,
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotKind::Object => "object",
            SlotKind::Promise => "promise",
            SlotKind::Device => "device",
        })
    }
}

/// A vat-scoped reference. `allocated_by_vat` is the `+` sign: the vat
/// exported it. `-` slots were handed to the vat by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VatSlot {
    pub kind: SlotKind,
    pub allocated_by_vat: bool,
    pub id: u64,
}

impl VatSlot {
    pub const fn new(kind: SlotKind, allocated_by_vat: bool, id: u64) -> Self {
        Self {
            kind,
            allocated_by_vat,
            id,
        }
    }

    pub const fn export(kind: SlotKind, id: u64) -> Self {
        Self::new(kind, true, id)
    }

    pub const fn import(kind: SlotKind, id: u64) -> Self {
        Self::new(kind, false, id)
    }

    pub fn insist_kind(&self, kind: SlotKind) -> Result<(), SlotError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(SlotError::WrongKind {
                expected: kind,
                found: self.to_string(),
            })
        }
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        write!(f, "{}{}{}", self.kind.letter(), sign, self.id)
    }
}

impl FromStr for VatSlot {
    type Err = SlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let kind = bytes
            .first()
            .and_then(|b| SlotKind::from_letter(*b))
            .ok_or_else(|| SlotError::UnrecognizedType(s.to_string()))?;
        let allocated_by_vat = match bytes.get(1) {
            Some(b'+') => true,
            Some(b'-') => false,
            _ => return Err(SlotError::Malformed(s.to_string())),
        };
        let id = s.get(2..).and_then(parse_id).ok_or_else(|| SlotError::Malformed(s.to_string()))?;
        Ok(VatSlot::new(kind, allocated_by_vat, id))
    }
}

/// A durable kernel-wide reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelSlot {
    pub kind: SlotKind,
    pub id: u64,
}

impl KernelSlot {
    pub const fn new(kind: SlotKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub const fn object(id: u64) -> Self {
        Self::new(SlotKind::Object, id)
    }

    pub const fn promise(id: u64) -> Self {
        Self::new(SlotKind::Promise, id)
    }

    pub const fn device(id: u64) -> Self {
        Self::new(SlotKind::Device, id)
    }

    pub fn insist_kind(&self, kind: SlotKind) -> Result<(), SlotError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(SlotError::WrongKind {
                expected: kind,
                found: self.to_string(),
            })
        }
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}{}", self.kind.letter(), self.id)
    }
}

impl FromStr for KernelSlot {
    type Err = SlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.first() != Some(&b'k') {
            return Err(SlotError::UnrecognizedType(s.to_string()));
        }
        let kind = bytes
            .get(1)
            .and_then(|b| SlotKind::from_letter(*b))
            .ok_or_else(|| SlotError::UnrecognizedType(s.to_string()))?;
        let id = s.get(2..).and_then(parse_id).ok_or_else(|| SlotError::Malformed(s.to_string()))?;
        Ok(KernelSlot::new(kind, id))
    }
}

fn parse_id(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(VatSlot);
string_serde!(KernelSlot);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vat_slots_round_trip() {
        for text in ["o+0", "o-12", "p+5", "p-3", "d-1", "d+7"] {
            let slot: VatSlot = text.parse().unwrap();
            assert_eq!(slot.to_string(), text);
        }
        let slot: VatSlot = "p-12".parse().unwrap();
        assert_eq!(slot, VatSlot::import(SlotKind::Promise, 12));
    }

    #[test]
    fn kernel_slots_round_trip() {
        for text in ["ko1", "kp40", "kd2"] {
            let slot: KernelSlot = text.parse().unwrap();
            assert_eq!(slot.to_string(), text);
        }
        assert_eq!("kp9".parse::<KernelSlot>().unwrap(), KernelSlot::promise(9));
    }

    #[test]
    fn rejects_unknown_types_and_garbage() {
        assert!(matches!(
            "x+1".parse::<VatSlot>(),
            Err(SlotError::UnrecognizedType(_))
        ));
        assert!(matches!(
            "".parse::<VatSlot>(),
            Err(SlotError::UnrecognizedType(_))
        ));
        assert!(matches!("o*1".parse::<VatSlot>(), Err(SlotError::Malformed(_))));
        assert!(matches!("o+".parse::<VatSlot>(), Err(SlotError::Malformed(_))));
        assert!(matches!("o+01".parse::<VatSlot>(), Err(SlotError::Malformed(_))));
        assert!(matches!(
            "kx1".parse::<KernelSlot>(),
            Err(SlotError::UnrecognizedType(_))
        ));
        assert!(matches!(
            "o1".parse::<KernelSlot>(),
            Err(SlotError::UnrecognizedType(_))
        ));
    }

    #[test]
    fn serde_uses_string_form() {
        let slot = VatSlot::export(SlotKind::Object, 5);
        assert_eq!(serde_json::to_string(&slot).unwrap(), "\"o+5\"");
        let back: KernelSlot = serde_json::from_str("\"ko7\"").unwrap();
        assert_eq!(back, KernelSlot::object(7));
        assert!(serde_json::from_str::<VatSlot>("\"q+1\"").is_err());
    }

    #[test]
    fn insist_kind_reports_mismatch() {
        let slot = VatSlot::import(SlotKind::Device, 1);
        assert!(slot.insist_kind(SlotKind::Device).is_ok());
        let err = slot.insist_kind(SlotKind::Object).unwrap_err();
        assert_eq!(err.to_string(), "expected object slot, got d-1");
    }
}
