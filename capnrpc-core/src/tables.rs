use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Table of entries whose ids are allocated locally.
///
/// Ids are dense: a retired id is handed out again before the table grows, lowest
/// first, so the peer's matching import table stays compact.
#[derive(Debug)]
pub struct ExportTable<T> {
    slots: Vec<Option<T>>,
    free_ids: BinaryHeap<Reverse<u32>>,
    len: usize,
}

impl<T> ExportTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_ids: BinaryHeap::new(),
            len: 0,
        }
    }

    /// Insert a new entry and return the id it was assigned
    pub fn next(&mut self, value: T) -> u32 {
        self.len += 1;
        match self.free_ids.pop() {
            Some(Reverse(id)) => {
                self.slots[id as usize] = Some(value);
                id
            }
            None => {
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub fn find(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Remove an entry and make its id available again
    pub fn erase(&mut self, id: u32) -> Option<T> {
        let value = self.slots.get_mut(id as usize).and_then(Option::take)?;
        self.len -= 1;
        if id as usize == self.slots.len() - 1 {
            // Trim trailing free slots so the heap doesn't grow without bound.
            self.slots.pop();
            while matches!(self.slots.last(), Some(None)) {
                self.slots.pop();
            }
            let limit = self.slots.len() as u32;
            self.free_ids.retain(|Reverse(free)| *free < limit);
        } else {
            self.free_ids.push(Reverse(id));
        }
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|value| (id as u32, value)))
    }

    /// Remove every entry, returning them in id order
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let drained = std::mem::take(&mut self.slots)
            .into_iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.map(|value| (id as u32, value)))
            .collect();
        self.free_ids.clear();
        self.len = 0;
        drained
    }
}

impl<T> Default for ExportTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Table of entries whose ids were chosen by the peer.
#[derive(Debug)]
pub struct ImportTable<T> {
    entries: HashMap<u32, T>,
}

impl<T> ImportTable<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert an entry under a peer-chosen id
    pub fn put(&mut self, id: u32, value: T) -> Result<(), TableError> {
        if self.entries.contains_key(&id) {
            return Err(TableError::DuplicateId(id));
        }
        self.entries.insert(id, value);
        Ok(())
    }

    pub fn get_or_insert_with(&mut self, id: u32, init: impl FnOnce() -> T) -> &mut T {
        self.entries.entry(id).or_insert_with(init)
    }

    pub fn find(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn erase(&mut self, id: u32) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries.iter().map(|(id, value)| (*id, value))
    }

    pub fn drain(&mut self) -> Vec<(u32, T)> {
        self.entries.drain().collect()
    }
}

impl<T> Default for ImportTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Id {0} is already in use")]
    DuplicateId(u32),

    #[error("Unknown id {0}")]
    UnknownId(u32),
}
