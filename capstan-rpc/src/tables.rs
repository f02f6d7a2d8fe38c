// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Id-keyed tables backing the peer state machine. Locally allocated ids
//! (questions, exports, embargoes) come from a free-list slab so they stay
//! small and recyclable; remotely allocated ids (answers, imports) are plain
//! maps keyed by whatever the peer chose.

use std::collections::HashMap;

/// A table whose ids we allocate: lowest free id first, recycled after
/// erase.
pub struct ExportTable<T> {
    slots: Vec<Option<T>>,
    free_ids: Vec<u32>,
}

impl<T> ExportTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_ids: Vec::new(),
        }
    }

    pub fn push(&mut self, value: T) -> u32 {
        match self.free_ids.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(value);
                id
            }
            None => {
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    pub fn erase(&mut self, id: u32) -> Option<T> {
        let value = self.slots.get_mut(id as usize).and_then(|s| s.take());
        if value.is_some() {
            self.free_ids.push(id);
            // Keep the lowest ids first in line, matching the reference
            // implementations' preference for small ids on the wire.
            self.free_ids.sort_unstable_by(|a, b| b.cmp(a));
        }
        value
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u32, v)))
    }

    pub fn ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let mut out = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.take() {
                out.push((i as u32, value));
            }
        }
        self.slots.clear();
        self.free_ids.clear();
        out
    }
}

impl<T> Default for ExportTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A table keyed by ids the remote peer allocates.
pub struct ImportTable<T> {
    map: HashMap<u32, T>,
}

impl<T> ImportTable<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: u32, value: T) -> Option<T> {
        self.map.insert(id, value)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.map.get_mut(&id)
    }

    pub fn entry(&mut self, id: u32) -> std::collections::hash_map::Entry<'_, u32, T> {
        self.map.entry(id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.map.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.map.keys().copied().collect()
    }

    pub fn drain(&mut self) -> Vec<(u32, T)> {
        self.map.drain().collect()
    }
}

impl<T> Default for ImportTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_table_recycles_lowest_id_first() {
        let mut table = ExportTable::new();
        assert_eq!(table.push("a"), 0);
        assert_eq!(table.push("b"), 1);
        assert_eq!(table.push("c"), 2);

        assert_eq!(table.erase(2), Some("c"));
        assert_eq!(table.erase(0), Some("a"));
        assert_eq!(table.erase(0), None);

        assert_eq!(table.push("d"), 0);
        assert_eq!(table.push("e"), 2);
        assert_eq!(table.push("f"), 3);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn export_table_drain_empties() {
        let mut table = ExportTable::new();
        table.push(1);
        table.push(2);
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert_eq!(table.push(3), 0);
    }

    #[test]
    fn import_table_uses_remote_ids() {
        let mut table = ImportTable::new();
        assert!(table.insert(17, "x").is_none());
        assert!(table.contains(17));
        assert!(!table.contains(0));
        assert_eq!(table.remove(17), Some("x"));
        assert!(table.is_empty());
    }
}
