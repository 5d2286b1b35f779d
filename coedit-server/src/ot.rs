//! Operational transform over UTF-16 code units.
//!
//! Wire operations are single insert/delete primitives at an absolute offset.
//! Internally each primitive is normalized into a compound retain/insert/delete
//! walk over the whole document ([`OpSeq`]), which keeps pairwise transform
//! closed: a delete that spans a concurrent insert stays one compound op and
//! is only split back into sequential primitives when it is logged and
//! broadcast.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum document size, in UTF-16 code units.
pub const MAX_DOC_LEN: u32 = 256 * 1024;

/// Discriminator shared by wire operations and persisted op-log rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    /// Insert text at a position.
    Insert,
    /// Remove a span starting at a position.
    Delete,
}

/// A single primitive change at a UTF-16 offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Edit {
    /// Insert `text` before the code unit at `position`.
    Insert {
        /// Offset in UTF-16 code units.
        position: u32,
        /// Non-empty inserted text.
        text: String,
    },
    /// Delete `length` code units starting at `position`.
    Delete {
        /// Offset in UTF-16 code units.
        position: u32,
        /// Positive span length in code units.
        length: u32,
    },
}

impl Edit {
    /// The kind discriminator of this edit.
    pub fn kind(&self) -> EditKind {
        match self {
            Edit::Insert { .. } => EditKind::Insert,
            Edit::Delete { .. } => EditKind::Delete,
        }
    }

    /// The offset this edit applies at.
    pub fn position(&self) -> u32 {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    /// UTF-16 length of the inserted text or the deleted span.
    pub fn len_utf16(&self) -> u32 {
        match self {
            Edit::Insert { text, .. } => utf16_len(text),
            Edit::Delete { length, .. } => *length,
        }
    }
}

/// Why an operation could not be normalized, transformed, or applied.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OpError {
    /// Position or span reaches past the end of the document.
    #[error("position out of bounds")]
    OutOfBounds,
    /// Offset lands between the two code units of a surrogate pair.
    #[error("position splits a surrogate pair")]
    SurrogateBoundary,
    /// Insert without text, or delete of zero length.
    #[error("operation is empty")]
    Empty,
    /// Operation was produced against a document of a different length.
    #[error("operation base length mismatch")]
    LengthMismatch,
    /// Applying the operation would exceed [`MAX_DOC_LEN`].
    #[error("document would exceed maximum size")]
    TooLarge,
}

/// Number of UTF-16 code units in `s`.
pub fn utf16_len(s: &str) -> u32 {
    s.chars().map(|c| c.len_utf16() as u32).sum()
}

/// Byte offset of the UTF-16 offset `units` into `s`.
///
/// `None` if the offset is past the end or falls inside a surrogate pair.
fn byte_offset(s: &str, units: u32) -> Option<usize> {
    if units == 0 {
        return Some(0);
    }
    let mut seen = 0u32;
    for (idx, ch) in s.char_indices() {
        if seen == units {
            return Some(idx);
        }
        seen += ch.len_utf16() as u32;
        if seen > units {
            return None; // inside a surrogate pair
        }
    }
    (seen == units).then_some(s.len())
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Atom {
    Retain(u32),
    Insert(String),
    Delete(u32),
}

/// A compound operation spanning an entire document.
///
/// The atom walk consumes exactly `base_len` code units of input and produces
/// `target_len` code units of output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpSeq {
    atoms: Vec<Atom>,
    base_len: u32,
    target_len: u32,
}

impl OpSeq {
    /// Length of the document this operation applies to.
    pub fn base_len(&self) -> u32 {
        self.base_len
    }

    /// Length of the document after this operation.
    pub fn target_len(&self) -> u32 {
        self.target_len
    }

    /// Whether this operation changes nothing.
    pub fn is_identity(&self) -> bool {
        !self
            .atoms
            .iter()
            .any(|a| matches!(a, Atom::Insert(_) | Atom::Delete(_)))
    }

    fn retain(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Atom::Retain(m)) = self.atoms.last_mut() {
            *m += n;
        } else {
            self.atoms.push(Atom::Retain(n));
        }
    }

    fn insert(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.target_len += utf16_len(s);
        if let Some(Atom::Insert(t)) = self.atoms.last_mut() {
            t.push_str(s);
        } else {
            self.atoms.push(Atom::Insert(s.to_string()));
        }
    }

    fn delete(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(Atom::Delete(m)) = self.atoms.last_mut() {
            *m += n;
        } else {
            self.atoms.push(Atom::Delete(n));
        }
    }

    /// Normalize a primitive edit into a compound op over a document of
    /// `doc_len` code units, validating bounds.
    pub fn from_edit(edit: &Edit, doc_len: u32) -> Result<Self, OpError> {
        let mut seq = Self::default();
        match edit {
            Edit::Insert { position, text } => {
                if text.is_empty() {
                    return Err(OpError::Empty);
                }
                if *position > doc_len {
                    return Err(OpError::OutOfBounds);
                }
                seq.retain(*position);
                seq.insert(text);
                seq.retain(doc_len - position);
            }
            Edit::Delete { position, length } => {
                if *length == 0 {
                    return Err(OpError::Empty);
                }
                let end = (*position as u64) + (*length as u64);
                if end > doc_len as u64 {
                    return Err(OpError::OutOfBounds);
                }
                seq.retain(*position);
                seq.delete(*length);
                seq.retain(doc_len - position - length);
            }
        }
        Ok(seq)
    }

    /// Like [`OpSeq::from_edit`] but for persisted op rows, which carry only
    /// the UTF-16 length of inserted text. The placeholder content is never
    /// observed: transforming against an insert only uses its length.
    pub fn from_row_shape(kind: EditKind, position: u32, length: u32, doc_len: u32) -> Result<Self, OpError> {
        let edit = match kind {
            EditKind::Insert => Edit::Insert {
                position,
                text: " ".repeat(length as usize),
            },
            EditKind::Delete => Edit::Delete { position, length },
        };
        Self::from_edit(&edit, doc_len)
    }

    /// Apply this operation to `s`, which must be `base_len` code units long.
    pub fn apply(&self, s: &str) -> Result<String, OpError> {
        if utf16_len(s) != self.base_len {
            return Err(OpError::LengthMismatch);
        }
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        for atom in &self.atoms {
            match atom {
                Atom::Retain(n) => {
                    let idx = byte_offset(rest, *n).ok_or(OpError::SurrogateBoundary)?;
                    out.push_str(&rest[..idx]);
                    rest = &rest[idx..];
                }
                Atom::Insert(t) => out.push_str(t),
                Atom::Delete(n) => {
                    let idx = byte_offset(rest, *n).ok_or(OpError::SurrogateBoundary)?;
                    rest = &rest[idx..];
                }
            }
        }
        debug_assert!(rest.is_empty());
        Ok(out)
    }

    /// Transform `self` against a concurrent `other` based on the same
    /// document, so that the result applies on top of `other`.
    ///
    /// `self_first` breaks insertion-point ties: when both operations insert
    /// at the same position, `self`'s text ends up first iff it is true. The
    /// caller derives it from the lexicographic order of the emitting client
    /// ids.
    pub fn transform(&self, other: &OpSeq, self_first: bool) -> Result<OpSeq, OpError> {
        if self.base_len != other.base_len {
            return Err(OpError::LengthMismatch);
        }
        let mut out = OpSeq::default();
        let mut ours = self.atoms.iter().cloned();
        let mut theirs = other.atoms.iter().cloned();
        let mut cur_a = ours.next();
        let mut cur_b = theirs.next();
        loop {
            match (cur_a.take(), cur_b.take()) {
                (None, None) => break,
                (Some(Atom::Insert(s)), b) => {
                    if self_first || !matches!(b, Some(Atom::Insert(_))) {
                        out.insert(&s);
                        cur_a = ours.next();
                        cur_b = b;
                    } else {
                        // their insert at the same point wins the tie
                        if let Some(Atom::Insert(t)) = b {
                            out.retain(utf16_len(&t));
                            cur_b = theirs.next();
                        }
                        cur_a = Some(Atom::Insert(s));
                    }
                }
                (a, Some(Atom::Insert(t))) => {
                    out.retain(utf16_len(&t));
                    cur_a = a;
                    cur_b = theirs.next();
                }
                (None, Some(_)) | (Some(_), None) => return Err(OpError::LengthMismatch),
                (Some(Atom::Retain(x)), Some(Atom::Retain(y))) => {
                    let n = x.min(y);
                    out.retain(n);
                    cur_a = if x > n { Some(Atom::Retain(x - n)) } else { ours.next() };
                    cur_b = if y > n { Some(Atom::Retain(y - n)) } else { theirs.next() };
                }
                (Some(Atom::Delete(x)), Some(Atom::Delete(y))) => {
                    // both deleted the same span; nothing left to do
                    let n = x.min(y);
                    cur_a = if x > n { Some(Atom::Delete(x - n)) } else { ours.next() };
                    cur_b = if y > n { Some(Atom::Delete(y - n)) } else { theirs.next() };
                }
                (Some(Atom::Delete(x)), Some(Atom::Retain(y))) => {
                    let n = x.min(y);
                    out.delete(n);
                    cur_a = if x > n { Some(Atom::Delete(x - n)) } else { ours.next() };
                    cur_b = if y > n { Some(Atom::Retain(y - n)) } else { theirs.next() };
                }
                (Some(Atom::Retain(x)), Some(Atom::Delete(y))) => {
                    let n = x.min(y);
                    cur_a = if x > n { Some(Atom::Retain(x - n)) } else { ours.next() };
                    cur_b = if y > n { Some(Atom::Delete(y - n)) } else { theirs.next() };
                }
            }
        }
        Ok(out)
    }

    /// Decompose into sequential primitives: applying them in order equals
    /// applying the compound op once. Identity decomposes to nothing.
    pub fn primitives(&self) -> Vec<Edit> {
        let mut pos = 0u32;
        let mut out = Vec::new();
        for atom in &self.atoms {
            match atom {
                Atom::Retain(n) => pos += n,
                Atom::Insert(s) => {
                    out.push(Edit::Insert {
                        position: pos,
                        text: s.clone(),
                    });
                    pos += utf16_len(s);
                }
                Atom::Delete(n) => out.push(Edit::Delete {
                    position: pos,
                    length: *n,
                }),
            }
        }
        out
    }
}
