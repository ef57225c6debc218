//! Thin seam around the Yrs CRDT library.
//!
//! The relay never inspects update bytes. It relies on three properties
//! the library guarantees: applying the same update twice is a no-op,
//! applying updates in any order yields the same final state, and the
//! encoded state is itself a valid update that reproduces the document
//! when applied to an empty one.

use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact, Update};

/// Errors from the CRDT adapter.
#[derive(Debug, Clone)]
pub enum CrdtError {
    /// The update bytes could not be decoded or applied.
    MalformedUpdate(String),
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrdtError::MalformedUpdate(e) => write!(f, "malformed update: {e}"),
        }
    }
}

impl std::error::Error for CrdtError {}

/// A room's replicated document.
pub struct Document {
    doc: yrs::Doc,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self { doc: yrs::Doc::new() }
    }

    /// Decode and apply an opaque update blob.
    ///
    /// Idempotent and commutative under concurrent application (Yrs
    /// guarantee). A blob that cannot be decoded or applied leaves the
    /// document unchanged and returns `MalformedUpdate`.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<(), CrdtError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CrdtError::MalformedUpdate(e.to_string()))
    }

    /// Encode the full current state as a single self-contained update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}
