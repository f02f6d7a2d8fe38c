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

//! Promised-answer transforms: the path from a call's result struct to a
//! capability that was pipelined before the result existed.

use capstan::{Error, ErrorKind, Result};
use smallvec::SmallVec;

use crate::proto::promised_answer;

/// A sequence of `getPointerField` operations applied to a result struct.
/// The empty sequence designates the result root itself. Transforms are
/// short in practice, so they live inline without allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Transform {
    ops: SmallVec<[u16; 4]>,
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: &[u16]) -> Self {
        Self {
            ops: SmallVec::from_slice(ops),
        }
    }

    /// Appends one more pointer-field hop, as `Pipeline::get_pointer_field`
    /// does on the client side.
    pub fn then(&self, pointer_index: u16) -> Self {
        let mut ops = self.ops.clone();
        ops.push(pointer_index);
        Self { ops }
    }

    pub fn is_root(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[u16] {
        &self.ops
    }

    /// Decodes the wire form. `noop` entries are skipped, as the reference
    /// implementations do.
    pub fn from_reader(
        reader: capstan::struct_list::Reader<'_, promised_answer::op::Owned>,
    ) -> Result<Self> {
        let mut ops = SmallVec::new();
        for i in 0..reader.len() {
            match reader.get(i).which()? {
                promised_answer::op::Which::Noop(()) => {}
                promised_answer::op::Which::GetPointerField(index) => ops.push(index),
            }
        }
        Ok(Self { ops })
    }

    pub fn write_to(&self, mut builder: promised_answer::Builder<'_>) {
        let mut list = builder.init_transform(self.ops.len() as u32);
        for (i, &op) in self.ops.iter().enumerate() {
            list.reborrow().get(i as u32).set_get_pointer_field(op);
        }
    }

    /// Applies the transform to a result payload's content, yielding the
    /// capability index the transform designates.
    pub fn resolve_capability(
        &self,
        content: capstan::any_pointer::Reader<'_>,
    ) -> Result<u32> {
        let target = content.get_pointer_path(&self.ops)?;
        target.get_capability_index().map_err(|e| {
            Error::from_kind(ErrorKind::CapabilityUnavailable)
                .context(format!("pipelined transform did not reach a capability: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::payload;
    use capstan::message::Builder;

    #[test]
    fn transform_round_trips_through_wire_form() {
        let mut message = Builder::new_default();
        {
            let mut promised = message.init_root::<promised_answer::Builder>();
            promised.set_question_id(4);
            Transform::from_ops(&[1, 0, 3]).write_to(promised);
        }
        let reader: promised_answer::Reader = message.get_root_as_reader().unwrap();
        let transform = Transform::from_reader(reader.get_transform().unwrap()).unwrap();
        assert_eq!(transform.ops(), &[1, 0, 3]);
        assert!(!transform.is_root());
        assert!(Transform::new().is_root());
    }

    #[test]
    fn transform_reports_non_capability_targets() {
        let mut message = Builder::new_default();
        {
            let mut payload = message.init_root::<payload::Builder>();
            let content = payload.get_content();
            // Result content is a struct whose pointer field 0 holds text,
            // not a capability.
            let mut root: promised_answer::Builder = content.init_as();
            root.set_question_id(9);
            Transform::from_ops(&[2]).write_to(root);
        }
        let payload: payload::Reader = message.get_root_as_reader().unwrap();
        let err = Transform::from_ops(&[0])
            .resolve_capability(payload.get_content())
            .unwrap_err();
        assert_eq!(err.kind, capstan::ErrorKind::CapabilityUnavailable);
    }
}
