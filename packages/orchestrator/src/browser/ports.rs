// ABOUTME: Hands out stream ports for browser daemons from a per-process counter
// ABOUTME: Ports still referenced by a persisted browser state are never handed out again

use std::collections::HashSet;
use std::sync::Mutex;

pub struct StreamPortAllocator {
    base: u16,
    next: Mutex<u16>,
}

impl StreamPortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            next: Mutex::new(base.saturating_add(1)),
        }
    }

    /// Reuse `existing` when the session already has a port, otherwise take the next
    /// counter value not in `in_use`. Wraps back to `base + 1` after `u16::MAX`.
    pub fn allocate(&self, existing: Option<u16>, in_use: &HashSet<u16>) -> Option<u16> {
        if let Some(port) = existing {
            return Some(port);
        }

        let first = self.base.saturating_add(1);
        let mut next = match self.next.lock() {
            Ok(next) => next,
            Err(poisoned) => poisoned.into_inner(),
        };

        let span = u32::from(u16::MAX - first) + 1;
        for _ in 0..span {
            let candidate = *next;
            *next = if candidate == u16::MAX { first } else { candidate + 1 };
            if !in_use.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
