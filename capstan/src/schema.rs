// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
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

//! The in-memory schema model: the node graph a code generator consumes.
//!
//! The compiler plugin hands the generator a set of nodes keyed by 64-bit id.
//! [SchemaSet::validate] checks the graph before any code is emitted, so the
//! generator itself never has to defend against malformed manifests, and
//! [SchemaSet::canonicalize] fixes an ordering so emitted code is stable
//! across runs.

use std::collections::BTreeMap;

use crate::{Error, ErrorKind, Result};

/// Resource limits applied while validating a schema manifest.
#[derive(Clone, Copy, Debug)]
pub struct SchemaLimits {
    pub max_nodes: usize,
    pub max_fields_per_node: usize,
    pub max_type_depth: u32,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_nodes: 1 << 16,
            max_fields_per_node: 1 << 12,
            max_type_depth: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Text,
    Data,
    List(Box<Type>),
    Enum(u64),
    Struct(u64),
    Interface(u64),
    AnyPointer,
}

impl Type {
    /// Whether values of this type live in a struct's pointer section.
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            Type::Text
                | Type::Data
                | Type::List(_)
                | Type::Struct(_)
                | Type::Interface(_)
                | Type::AnyPointer
        )
    }

    /// Width of the value in a struct's data section, in bits.
    pub fn data_bits(&self) -> u32 {
        match self {
            Type::Void => 0,
            Type::Bool => 1,
            Type::Int8 | Type::Uint8 => 8,
            Type::Int16 | Type::Uint16 | Type::Enum(_) => 16,
            Type::Int32 | Type::Uint32 | Type::Float32 => 32,
            Type::Int64 | Type::Uint64 | Type::Float64 => 64,
            _ => 0,
        }
    }

    fn referenced_id(&self) -> Option<u64> {
        match self {
            Type::Enum(id) | Type::Struct(id) | Type::Interface(id) => Some(*id),
            _ => None,
        }
    }

    fn depth(&self) -> u32 {
        match self {
            Type::List(inner) => 1 + inner.depth(),
            _ => 1,
        }
    }
}

/// A typed default value. Pointer-typed defaults are stored as pre-encoded
/// message literals whose word 0 is the root pointer, ready to hand to the
/// reader layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Data(Vec<u8>),
    Enum(u16),
    Pointer(Vec<u8>),
}

#[derive(Clone, Debug)]
pub enum FieldKind {
    /// A value stored directly in the struct's data or pointer section.
    Slot {
        offset: u32,
        field_type: Type,
        default: Value,
        had_explicit_default: bool,
    },
    /// A group of fields sharing the parent struct's space.
    Group { type_id: u64 },
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub code_order: u16,
    /// The union discriminant value, if this field is a union member.
    pub discriminant: Option<u16>,
    pub kind: FieldKind,
}

#[derive(Clone, Debug)]
pub struct StructNode {
    pub data_words: u16,
    pub pointer_count: u16,
    pub discriminant_count: u16,
    /// Offset of the discriminant in the data section, in 16-bit units.
    pub discriminant_offset: u32,
    pub fields: Vec<Field>,
}

#[derive(Clone, Debug)]
pub struct EnumNode {
    /// Enumerant names, ordered by their wire value.
    pub enumerants: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Method {
    pub name: String,
    pub code_order: u16,
    pub param_struct_type: u64,
    pub result_struct_type: u64,
}

#[derive(Clone, Debug)]
pub struct InterfaceNode {
    pub methods: Vec<Method>,
    pub superclasses: Vec<u64>,
}

#[derive(Clone, Debug)]
pub struct ConstNode {
    pub const_type: Type,
    pub value: Value,
}

#[derive(Clone, Debug)]
pub struct AnnotationNode {
    pub annotation_type: Type,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Struct(StructNode),
    Enum(EnumNode),
    Interface(InterfaceNode),
    Const(ConstNode),
    Annotation(AnnotationNode),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: u64,
    pub display_name: String,
    pub scope_id: u64,
    pub kind: NodeKind,
}

/// A schema manifest: the node graph for one compilation.
#[derive(Default)]
pub struct SchemaSet {
    nodes: BTreeMap<u64, Node>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(Error::from_kind(ErrorKind::ProtocolViolation)
                .context(format!("duplicate node id {:#x}", node.id)));
        }
        self.nodes.insert(node.id, node);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Checks the whole graph: resource limits, referential integrity, slot
    /// extents, and union discriminant consistency.
    pub fn validate(&self, limits: &SchemaLimits) -> Result<()> {
        if self.nodes.len() > limits.max_nodes {
            return Err(Error::from_kind(ErrorKind::ProtocolViolation).context(format!(
                "schema has {} nodes; the limit is {}",
                self.nodes.len(),
                limits.max_nodes
            )));
        }
        for node in self.nodes.values() {
            match &node.kind {
                NodeKind::Struct(s) => self.validate_struct(node, s, limits)?,
                NodeKind::Enum(_) => {}
                NodeKind::Interface(i) => {
                    for method in &i.methods {
                        self.check_reference(node, method.param_struct_type)?;
                        self.check_reference(node, method.result_struct_type)?;
                    }
                    for &superclass in &i.superclasses {
                        self.check_reference(node, superclass)?;
                    }
                }
                NodeKind::Const(c) => self.validate_type(node, &c.const_type, limits)?,
                NodeKind::Annotation(a) => {
                    self.validate_type(node, &a.annotation_type, limits)?
                }
            }
        }
        Ok(())
    }

    fn validate_struct(
        &self,
        node: &Node,
        s: &StructNode,
        limits: &SchemaLimits,
    ) -> Result<()> {
        if s.fields.len() > limits.max_fields_per_node {
            return Err(Error::from_kind(ErrorKind::ProtocolViolation).context(format!(
                "struct {} has {} fields; the limit is {}",
                node.display_name,
                s.fields.len(),
                limits.max_fields_per_node
            )));
        }
        let mut union_members = 0u32;
        for field in &s.fields {
            if let Some(discriminant) = field.discriminant {
                union_members += 1;
                if discriminant >= s.discriminant_count {
                    return Err(self.struct_error(
                        node,
                        field,
                        "discriminant value is out of range",
                    ));
                }
            }
            match &field.kind {
                FieldKind::Group { type_id } => self.check_reference(node, *type_id)?,
                FieldKind::Slot {
                    offset, field_type, ..
                } => {
                    self.validate_type(node, field_type, limits)?;
                    if field_type.is_pointer() {
                        if *offset >= s.pointer_count as u32 {
                            return Err(self.struct_error(
                                node,
                                field,
                                "pointer offset is outside the struct's pointer section",
                            ));
                        }
                    } else {
                        let bits = field_type.data_bits();
                        if bits > 0 {
                            let end = (*offset as u64 + 1) * bits as u64;
                            if end > s.data_words as u64 * 64 {
                                return Err(self.struct_error(
                                    node,
                                    field,
                                    "slot extends past the struct's data section",
                                ));
                            }
                        }
                    }
                }
            }
        }
        if s.discriminant_count > 0 {
            if union_members != s.discriminant_count as u32 {
                return Err(Error::from_kind(ErrorKind::ProtocolViolation).context(format!(
                    "struct {} declares {} union members but defines {}",
                    node.display_name, s.discriminant_count, union_members
                )));
            }
            let end = (s.discriminant_offset as u64 + 1) * 16;
            if end > s.data_words as u64 * 64 {
                return Err(Error::from_kind(ErrorKind::ProtocolViolation).context(format!(
                    "struct {}'s discriminant lies outside its data section",
                    node.display_name
                )));
            }
        }
        Ok(())
    }

    fn validate_type(&self, node: &Node, t: &Type, limits: &SchemaLimits) -> Result<()> {
        if t.depth() > limits.max_type_depth {
            return Err(Error::from_kind(ErrorKind::NestingLimitExceeded).context(format!(
                "type in {} nests deeper than {}",
                node.display_name, limits.max_type_depth
            )));
        }
        let mut current = t;
        loop {
            if let Some(id) = current.referenced_id() {
                self.check_reference(node, id)?;
            }
            match current {
                Type::List(inner) => current = inner,
                _ => return Ok(()),
            }
        }
    }

    fn check_reference(&self, node: &Node, id: u64) -> Result<()> {
        if self.nodes.contains_key(&id) {
            Ok(())
        } else {
            Err(Error::from_kind(ErrorKind::ProtocolViolation).context(format!(
                "{} references unknown node {:#x}",
                node.display_name, id
            )))
        }
    }

    fn struct_error(&self, node: &Node, field: &Field, what: &str) -> Error {
        Error::from_kind(ErrorKind::ProtocolViolation)
            .context(format!("{}.{}: {}", node.display_name, field.name, what))
    }

    /// Returns the nodes in a deterministic order (by id), with each struct's
    /// fields ordered by declaration order. Generators iterate this to emit
    /// stable output.
    pub fn canonicalize(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        for node in &mut nodes {
            if let NodeKind::Struct(s) = &mut node.kind {
                s.fields.sort_by_key(|f| f.code_order);
            }
            if let NodeKind::Interface(i) = &mut node.kind {
                i.methods.sort_by_key(|m| m.code_order);
            }
        }
        nodes
    }
}
