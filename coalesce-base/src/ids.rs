use crate::{err, Result};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use test_log::test;

/// Length of every generated replica identifier, in bytes.
pub const REPLICA_ID_LEN: usize = 12;

// Every printable ASCII character (0x21..=0x7e). 94^12 distinct ids,
// a little over 78 bits.
const ALPHABET: &[u8; 94] =
    b"!\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// Identity of one replica of a document.
///
/// Generated ids are 12 printable bytes carrying more than 77 bits of
/// fresh randomness, stable for the lifetime of the runtime that
/// generated them. The empty id is reserved as an internal sentinel (the
/// owner of the waypoint root) and never appears on the wire as a sender.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn random() -> Self {
        // Symbols come from repeated division of the uuid's random
        // bits, so none of them are thrown away by a mask.
        let mut n = uuid::Uuid::new_v4().as_u128();
        let base = ALPHABET.len() as u128;
        let mut id = String::with_capacity(REPLICA_ID_LEN);
        for _ in 0..REPLICA_ID_LEN {
            id.push(ALPHABET[(n % base) as usize] as char);
            n /= base;
        }
        ReplicaId(id)
    }

    /// Sentinel id owning internal roots. Not a valid sender.
    pub fn root() -> Self {
        ReplicaId(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Wrap a caller-supplied id (debug override). Must be nonempty
    /// printable ASCII.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() {
            return Err(err("replica id must be nonempty"));
        }
        if !s.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
            return Err(err("replica id must be printable ASCII"));
        }
        Ok(ReplicaId(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReplicaId({})", self.0)
    }
}

#[test]
fn test_random_ids() {
    let a = ReplicaId::random();
    let b = ReplicaId::random();
    assert_eq!(a.as_str().len(), REPLICA_ID_LEN);
    assert!(a.as_str().bytes().all(|b| (0x21..=0x7e).contains(&b)));
    assert_ne!(a, b);
    assert!(!a.is_root());
    assert!(ReplicaId::root().is_root());
}

#[test]
fn test_id_validation() {
    assert!(ReplicaId::new("alice").is_ok());
    assert!(ReplicaId::new("").is_err());
    assert!(ReplicaId::new("has space").is_err());
}
