// Copyright (c) 2013-2016 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
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

//! A queue of work parked behind an unresolved promise: pipelined calls
//! waiting on a Return, or calls on a promise export waiting on its Resolve.
//! Entries keep arrival order and can be removed individually when the
//! waiter is canceled.

use std::collections::BTreeMap;

pub struct CallQueue<T> {
    next_id: u64,
    map: BTreeMap<u64, T>,
}

impl<T> CallQueue<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            map: BTreeMap::new(),
        }
    }

    /// Parks `value`, returning a ticket that can later remove it.
    pub fn push(&mut self, value: T) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(id, value);
        id
    }

    /// Cancels a parked entry.
    pub fn remove(&mut self, id: u64) -> Option<T> {
        self.map.remove(&id)
    }

    /// Removes the first entry matching a predicate.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let id = self
            .map
            .iter()
            .find(|(_, v)| predicate(v))
            .map(|(id, _)| *id)?;
        self.map.remove(&id)
    }

    /// Takes everything, in arrival order.
    pub fn drain(&mut self) -> Drain<T> {
        self.next_id = 0;
        let map = std::mem::take(&mut self.map);
        Drain {
            iter: map.into_iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.map.values()
    }
}

impl<T> Default for CallQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Drain<T> {
    iter: std::collections::btree_map::IntoIter<u64, T>,
}

impl<T> Iterator for Drain<T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.iter.next().map(|(_k, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_arrival_order() {
        let mut queue = CallQueue::new();
        queue.push("first");
        let second = queue.push("second");
        queue.push("third");

        assert_eq!(queue.remove(second), Some("second"));
        assert_eq!(queue.remove(second), None);

        let order: Vec<&str> = queue.drain().collect();
        assert_eq!(order, vec!["first", "third"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_where_takes_first_match() {
        let mut queue = CallQueue::new();
        queue.push(10);
        queue.push(25);
        queue.push(35);
        assert_eq!(queue.remove_where(|v| *v > 20), Some(25));
        assert_eq!(queue.len(), 2);
    }
}
