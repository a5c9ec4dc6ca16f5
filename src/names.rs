use crate::error::{NpzError, NpzResult};

pub const DEFAULT_PREFIX: &str = "arr_";

/// Hands out `<prefix>0`, `<prefix>1`, ... for members added without a name.
///
/// The counter only moves forward. An index whose name is already taken is
/// skipped, so the sequence never reuses or collides with an explicit name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAllocator {
    prefix: String,
    next: usize,
}

impl Default for NameAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl NameAllocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Allocate the next free name according to `is_taken`.
    pub fn next_name(&mut self, is_taken: impl Fn(&str) -> bool) -> NpzResult<String> {
        loop {
            let index = self.next;
            self.next = index
                .checked_add(1)
                .ok_or_else(|| NpzError::DuplicateMemberName(format!("{}{index}", self.prefix)))?;
            let name = format!("{}{index}", self.prefix);
            if !is_taken(&name) {
                return Ok(name);
            }
            tracing::trace!(name = %name, "default name taken, skipping");
        }
    }
}
