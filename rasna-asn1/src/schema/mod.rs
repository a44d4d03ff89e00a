//! In-memory representation of a parsed ASN.1 module.
//!
//! A module is an arena of [`SchemaNode`]s addressed by integer ids. Top-level
//! assignments are reachable by name; `TYPE_REF` nodes are resolved by name
//! lookup on demand, so mutually recursive definitions are legal as long as
//! decoding breaks the cycle (through a `SEQUENCE OF`, `ANY`, or optionality).

mod parser;

use crate::error::{Asn1Error, Result};
use crate::tag::{Tag, TagClass};
use std::collections::HashMap;

pub type SchemaNodeId = usize;

/// The closed set of type constructors the loader recognizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchemaType {
    Integer,
    Boolean,
    BitString,
    OctetString,
    Null,
    Oid,
    Utf8String,
    PrintableString,
    Ia5String,
    UtcTime,
    GeneralizedTime,
    Sequence,
    SequenceOf,
    Set,
    SetOf,
    Choice,
    Any,
    TypeRef,
}

impl SchemaType {
    /// The universal tag of a primitive or structured type. `None` for the
    /// transparent constructs (`CHOICE`, `ANY`, `TYPE_REF`).
    pub fn universal_tag(self) -> Option<Tag> {
        match self {
            SchemaType::Integer => Some(Tag::INTEGER),
            SchemaType::Boolean => Some(Tag::BOOLEAN),
            SchemaType::BitString => Some(Tag::BIT_STRING),
            SchemaType::OctetString => Some(Tag::OCTET_STRING),
            SchemaType::Null => Some(Tag::NULL),
            SchemaType::Oid => Some(Tag::OID),
            SchemaType::Utf8String => Some(Tag::UTF8_STRING),
            SchemaType::PrintableString => Some(Tag::PRINTABLE_STRING),
            SchemaType::Ia5String => Some(Tag::IA5_STRING),
            SchemaType::UtcTime => Some(Tag::UTC_TIME),
            SchemaType::GeneralizedTime => Some(Tag::GENERALIZED_TIME),
            SchemaType::Sequence | SchemaType::SequenceOf => Some(Tag::SEQUENCE),
            SchemaType::Set | SchemaType::SetOf => Some(Tag::SET),
            SchemaType::Choice | SchemaType::Any | SchemaType::TypeRef => None,
        }
    }

    pub fn is_constructed(self) -> bool {
        matches!(
            self,
            SchemaType::Sequence | SchemaType::SequenceOf | SchemaType::Set | SchemaType::SetOf
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TagMode {
    Implicit,
    Explicit,
}

/// A `[class n]` tag written in front of a type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TagOverride {
    pub class: TagClass,
    pub number: u32,
    pub mode: TagMode,
}

impl TagOverride {
    pub fn tag(&self) -> Tag {
        Tag {
            class: self.class,
            number: self.number,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchemaNode {
    /// Field or assignment name; `None` for anonymous element types.
    pub name: Option<String>,
    pub ty: SchemaType,
    /// Referenced assignment name for `TypeRef` nodes.
    pub reference: Option<String>,
    pub tag: Option<TagOverride>,
    pub optional: bool,
    pub has_default: bool,
    pub child: Option<SchemaNodeId>,
    pub sibling: Option<SchemaNodeId>,
}

impl SchemaNode {
    fn new(ty: SchemaType) -> Self {
        SchemaNode {
            name: None,
            ty,
            reference: None,
            tag: None,
            optional: false,
            has_default: false,
            child: None,
            sibling: None,
        }
    }

    /// OPTIONAL or DEFAULT: may be absent from the image.
    pub fn may_be_absent(&self) -> bool {
        self.optional || self.has_default
    }
}

/// A parsed ASN.1 module, immutable after load.
#[derive(Debug)]
pub struct Schema {
    name: String,
    nodes: Vec<SchemaNode>,
    assignments: HashMap<String, SchemaNodeId>,
}

impl Schema {
    /// Parses the textual module `text`.
    pub fn parse(text: &str) -> Result<Schema> {
        let schema = parser::parse_module(text)?;
        schema.check_references()?;
        Ok(schema)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: SchemaNodeId) -> &SchemaNode {
        &self.nodes[id]
    }

    /// Looks up a top-level assignment.
    pub fn assignment(&self, name: &str) -> Option<SchemaNodeId> {
        self.assignments.get(name).copied()
    }

    /// Follows `TypeRef` chains until a concrete type is reached.
    pub fn resolve(&self, id: SchemaNodeId) -> Result<SchemaNodeId> {
        let mut id = id;
        for _ in 0..self.nodes.len() + 1 {
            let node = &self.nodes[id];
            if node.ty != SchemaType::TypeRef {
                return Ok(id);
            }
            let name = node.reference.as_deref().unwrap_or("");
            id = self
                .assignment(name)
                .ok_or_else(|| Asn1Error::SchemaReference(name.to_owned()))?;
        }
        Err(Asn1Error::SchemaReference("reference cycle".to_owned()))
    }

    /// Every `TYPE_REF` in the module must name an assignment.
    fn check_references(&self) -> Result<()> {
        for node in &self.nodes {
            if node.ty == SchemaType::TypeRef {
                let name = node.reference.as_deref().unwrap_or("");
                if !self.assignments.contains_key(name) {
                    return Err(Asn1Error::SchemaReference(name.to_owned()));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, node: SchemaNode) -> SchemaNodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub(crate) fn node_mut(&mut self, id: SchemaNodeId) -> &mut SchemaNode {
        &mut self.nodes[id]
    }

    pub(crate) fn empty(name: String) -> Schema {
        Schema {
            name,
            nodes: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    pub(crate) fn add_assignment(&mut self, name: String, id: SchemaNodeId) {
        self.assignments.insert(name, id);
    }

    pub(crate) fn new_node(&mut self, ty: SchemaType) -> SchemaNodeId {
        self.push(SchemaNode::new(ty))
    }
}
