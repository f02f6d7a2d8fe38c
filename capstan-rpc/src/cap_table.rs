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

//! Transactional side-effects of encoding an outbound capability table.
//!
//! Writing a cap descriptor into a frame implies bookkeeping: a new export
//! entry, a reference on an existing one, a promise advertisement. None of
//! that may become observable until the frame has actually been handed to
//! the transport, and all of it must unwind if the send fails. Each staged
//! effect is a tagged record; commit and rollback are table-driven over the
//! record kind.

use crate::peer::ExportId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagedEffect {
    /// An export entry was created for this frame. The entry exists (so its
    /// id could be encoded) but carries no references yet. Commit grants the
    /// remote peer's reference; rollback deletes the entry.
    NewExport(ExportId),

    /// The frame references an already-live export. Commit adds the remote
    /// peer's reference; rollback leaves the entry untouched.
    ExportRef(ExportId),

    /// The frame advertises an export as a promise that will later resolve.
    /// Commit records the advertisement so a Resolve must follow; rollback
    /// leaves no trace.
    PromiseRegistration(ExportId),
}

/// The tables a staged effect touches. Implemented by the peer; kept as a
/// trait so the commit/rollback logic is testable in isolation.
pub trait EffectTables {
    fn grant_export_ref(&mut self, id: ExportId);
    fn discard_fresh_export(&mut self, id: ExportId);
    fn register_promise_advertisement(&mut self, id: ExportId);
}

/// The staged side-effects of one outbound frame.
#[derive(Default)]
pub struct OutboundCapEffects {
    effects: Vec<StagedEffect>,
}

impl OutboundCapEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: StagedEffect) {
        self.effects.push(effect);
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Applies every staged effect. Call only after the transport accepted
    /// the frame.
    pub fn commit(self, tables: &mut impl EffectTables) {
        for effect in self.effects {
            match effect {
                StagedEffect::NewExport(id) | StagedEffect::ExportRef(id) => {
                    tables.grant_export_ref(id)
                }
                StagedEffect::PromiseRegistration(id) => {
                    tables.register_promise_advertisement(id)
                }
            }
        }
    }

    /// Reverses every staged effect, newest first.
    pub fn rollback(mut self, tables: &mut impl EffectTables) {
        while let Some(effect) = self.effects.pop() {
            match effect {
                StagedEffect::NewExport(id) => tables.discard_fresh_export(id),
                StagedEffect::ExportRef(_) | StagedEffect::PromiseRegistration(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockTables {
        refs: HashMap<ExportId, u32>,
        discarded: Vec<ExportId>,
        promises: Vec<ExportId>,
    }

    impl EffectTables for MockTables {
        fn grant_export_ref(&mut self, id: ExportId) {
            *self.refs.entry(id).or_insert(0) += 1;
        }
        fn discard_fresh_export(&mut self, id: ExportId) {
            self.discarded.push(id);
        }
        fn register_promise_advertisement(&mut self, id: ExportId) {
            self.promises.push(id);
        }
    }

    #[test]
    fn commit_applies_every_effect() {
        let mut effects = OutboundCapEffects::new();
        effects.push(StagedEffect::NewExport(3));
        effects.push(StagedEffect::ExportRef(3));
        effects.push(StagedEffect::PromiseRegistration(7));

        let mut tables = MockTables::default();
        effects.commit(&mut tables);
        assert_eq!(tables.refs.get(&3), Some(&2));
        assert_eq!(tables.promises, vec![7]);
        assert!(tables.discarded.is_empty());
    }

    #[test]
    fn rollback_discards_only_fresh_exports() {
        let mut effects = OutboundCapEffects::new();
        effects.push(StagedEffect::NewExport(1));
        effects.push(StagedEffect::ExportRef(2));
        effects.push(StagedEffect::NewExport(4));

        let mut tables = MockTables::default();
        effects.rollback(&mut tables);
        // Reversed, newest first.
        assert_eq!(tables.discarded, vec![4, 1]);
        assert!(tables.refs.is_empty());
        assert!(tables.promises.is_empty());
    }
}
