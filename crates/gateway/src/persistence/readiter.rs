use std::collections::VecDeque;

use crate::auth::Identity;
use crate::authz::{can_read, AclEntity};
use crate::error::{Error, Result};

/// Single-pass cursor over index entities that yields only the entries the
/// current identity may read. Must be closed when done; a closed iterator
/// refuses further reads.
pub struct CanReadIter<T> {
    identity: Identity,
    entries: VecDeque<T>,
    closed: bool,
}

impl<T: AclEntity> CanReadIter<T> {
    pub fn new(identity: &Identity, entries: impl IntoIterator<Item = T>) -> Self {
        Self {
            identity: identity.clone(),
            entries: entries.into_iter().collect(),
            closed: false,
        }
    }

    /// Returns the next readable entry, skipping entries the identity may
    /// not see.
    pub fn next(&mut self) -> Result<Option<T>> {
        if self.closed {
            return Err(Error::internal("iterator has been closed"));
        }
        while let Some(entry) = self.entries.pop_front() {
            if can_read(&self.identity, &entry) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.entries.clear();
    }

    /// Drains the iterator into a vector and closes it.
    pub fn collect_all(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next()? {
            out.push(entry);
        }
        self.close();
        Ok(out)
    }
}
