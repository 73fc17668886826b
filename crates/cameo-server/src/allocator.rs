//! Instance id and port allocation
//!
//! Both allocators are plain values owned by the registry and guarded by its
//! lock; there are no process-wide counters.

use std::collections::BTreeSet;

use cameo_core::prelude::*;

/// Largest instance id handed out by default.
pub const MAX_ID: i32 = 65536;

/// Assigns instance ids from `[1, max]`.
///
/// The search starts just after the last id handed out and wraps around
/// once, so recently released ids are not reused straight away.
#[derive(Debug)]
pub struct IdAllocator {
    used: BTreeSet<i32>,
    last: i32,
    max: i32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(MAX_ID)
    }
}

impl IdAllocator {
    pub fn new(max: i32) -> Self {
        Self {
            used: BTreeSet::new(),
            last: 0,
            max: max.max(1),
        }
    }

    fn first_free(&self, from: i32, to: i32) -> Option<i32> {
        (from..=to).find(|id| !self.used.contains(id))
    }

    pub fn allocate(&mut self) -> Result<i32> {
        let id = self
            .first_free(self.last + 1, self.max)
            .or_else(|| self.first_free(1, self.last.min(self.max)))
            .ok_or_else(|| Error::capacity(format!("all {} instance ids in use", self.max)))?;

        self.used.insert(id);
        self.last = id;
        Ok(id)
    }

    /// Returns false if the id was not allocated.
    pub fn release(&mut self, id: i32) -> bool {
        self.used.remove(&id)
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}

/// Assigns port numbers starting from a base port.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    assigned: BTreeSet<u16>,
    unavailable: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            assigned: BTreeSet::new(),
            unavailable: BTreeSet::new(),
        }
    }

    /// Lowest port at or above the base that is neither assigned nor unavailable.
    pub fn allocate(&mut self) -> Result<u16> {
        let port = (self.base..=u16::MAX)
            .find(|p| !self.assigned.contains(p) && !self.unavailable.contains(p))
            .ok_or_else(|| Error::capacity(format!("no free port above {}", self.base)))?;
        self.assigned.insert(port);
        Ok(port)
    }

    pub fn release(&mut self, port: u16) -> bool {
        self.assigned.remove(&port)
    }

    /// Never hand this port out again (something else holds it).
    pub fn set_unavailable(&mut self, port: u16) {
        self.assigned.remove(&port);
        self.unavailable.insert(port);
    }

    pub fn is_assigned(&self, port: u16) -> bool {
        self.assigned.contains(&port)
    }
}
