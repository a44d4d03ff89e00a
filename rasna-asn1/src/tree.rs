//! Schema-bound value trees.
//!
//! A `ValueTree` is a structural clone of a schema subtree held in an arena.
//! Each node either points into the owned image (`off` set), holds content
//! placed by one of the `store_*` operations, or is structurally present but
//! absent from the image (`off == None`, the decoder's way of recording an
//! OPTIONAL element that was not encoded).

use crate::error::{Asn1Error, Result};
use crate::schema::{Schema, SchemaNodeId, SchemaType, TagMode};
use crate::tag::Tag;
use std::sync::Arc;

pub type NodeId = usize;

const MAX_EXPAND_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub(crate) enum Stored {
    /// Canonical content octets; the node's header is regenerated on encode.
    Content(Vec<u8>),
    /// A complete pre-encoded TLV emitted verbatim.
    Raw(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct ValueNode {
    pub(crate) schema_id: SchemaNodeId,
    pub(crate) name: Option<String>,
    pub(crate) ty: SchemaType,
    /// Tag seen/emitted on the wire; `None` until an ANY or CHOICE is bound.
    pub(crate) vtype: Option<Tag>,
    /// Outer tag of an EXPLICIT override, wrapped around `vtype`.
    pub(crate) explicit: Option<Tag>,
    pub(crate) optional: bool,
    pub(crate) has_default: bool,
    pub(crate) off: Option<usize>,
    pub(crate) nhdr: usize,
    pub(crate) len: usize,
    pub(crate) stored: Option<Stored>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) child: Option<NodeId>,
    pub(crate) sibling: Option<NodeId>,
}

impl ValueNode {
    /// OPTIONAL or DEFAULT: may be absent from the image.
    pub fn may_be_absent(&self) -> bool {
        self.optional || self.has_default
    }
}

/// A value tree plus the image it decodes, owned as a unit.
#[derive(Debug)]
pub struct ValueTree {
    pub(crate) schema: Arc<Schema>,
    pub(crate) nodes: Vec<ValueNode>,
    pub(crate) image: Vec<u8>,
}

impl ValueTree {
    /// Structural clone of the assignment `name`; every node starts absent.
    pub fn expand(schema: &Arc<Schema>, name: &str) -> Result<ValueTree> {
        let root_id = schema
            .assignment(name)
            .ok_or_else(|| Asn1Error::SchemaReference(name.to_owned()))?;
        let mut tree = ValueTree {
            schema: Arc::clone(schema),
            nodes: Vec::new(),
            image: Vec::new(),
        };
        tree.build(root_id, None, 0)?;
        Ok(tree)
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    fn build(&mut self, schema_id: SchemaNodeId, parent: Option<NodeId>, depth: usize) -> Result<NodeId> {
        if depth > MAX_EXPAND_DEPTH {
            return Err(Asn1Error::SchemaReference("expansion depth exceeded".to_owned()));
        }

        // Field node first, then the concrete type it may reference.
        let field = self.schema.node(schema_id).clone();
        let concrete_id = self.schema.resolve(schema_id)?;
        let concrete = self.schema.node(concrete_id).clone();

        let mut vtype = concrete.ty.universal_tag();
        let mut explicit = None;
        if let Some(tag) = field.tag {
            match tag.mode {
                TagMode::Implicit => vtype = Some(tag.tag()),
                TagMode::Explicit => explicit = Some(tag.tag()),
            }
        }

        let id = self.nodes.len();
        self.nodes.push(ValueNode {
            schema_id: concrete_id,
            name: field.name.clone(),
            ty: concrete.ty,
            vtype,
            explicit,
            optional: field.optional,
            has_default: field.has_default,
            off: None,
            nhdr: 0,
            len: 0,
            stored: None,
            parent,
            child: None,
            sibling: None,
        });

        match concrete.ty {
            SchemaType::Sequence | SchemaType::Set | SchemaType::Choice => {
                let mut prev: Option<NodeId> = None;
                let mut next_child = concrete.child;
                while let Some(child_schema) = next_child {
                    let child_id = self.build(child_schema, Some(id), depth + 1)?;
                    match prev {
                        None => self.nodes[id].child = Some(child_id),
                        Some(p) => self.nodes[p].sibling = Some(child_id),
                    }
                    prev = Some(child_id);
                    next_child = self.schema.node(child_schema).sibling;
                }
            }
            // OF elements are instantiated on demand by `append`.
            _ => {}
        }

        Ok(id)
    }

    /// Instantiates one more element of a `SEQUENCE OF` / `SET OF` node.
    pub fn append(&mut self, parent: NodeId) -> Result<NodeId> {
        let node = &self.nodes[parent];
        if !matches!(node.ty, SchemaType::SequenceOf | SchemaType::SetOf) {
            return Err(Asn1Error::UnsupportedType);
        }
        let elem_schema = self
            .schema
            .node(node.schema_id)
            .child
            .ok_or(Asn1Error::UnsupportedType)?;

        let elem = self.build(elem_schema, Some(parent), 0)?;
        match self.last_child(parent) {
            None => self.nodes[parent].child = Some(elem),
            Some(last) => self.nodes[last].sibling = Some(elem),
        }
        Ok(elem)
    }

    pub fn node(&self, id: NodeId) -> &ValueNode {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut ValueNode {
        &mut self.nodes[id]
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.nodes[id].name.as_deref()
    }

    pub fn ty(&self, id: NodeId) -> SchemaType {
        self.nodes[id].ty
    }

    /// Effective wire tag recorded for the node.
    pub fn value_type(&self, id: NodeId) -> Option<Tag> {
        self.nodes[id].vtype
    }

    pub fn offset(&self, id: NodeId) -> Option<usize> {
        self.nodes[id].off
    }

    pub fn header_len(&self, id: NodeId) -> usize {
        self.nodes[id].nhdr
    }

    pub fn content_len(&self, id: NodeId) -> usize {
        self.nodes[id].len
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].child
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].sibling
    }

    pub fn children(&self, id: NodeId) -> ChildIter<'_> {
        ChildIter {
            tree: self,
            next: self.nodes[id].child,
        }
    }

    fn last_child(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = self.nodes[id].child?;
        while let Some(next) = self.nodes[cur].sibling {
            cur = next;
        }
        Some(cur)
    }

    /// A node takes part in the image if it, or any descendant, is bound or
    /// stored.
    pub fn is_present(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        if node.off.is_some() || node.stored.is_some() {
            return true;
        }
        match node.ty {
            SchemaType::Sequence
            | SchemaType::Set
            | SchemaType::SequenceOf
            | SchemaType::SetOf
            | SchemaType::Choice => self.children(id).any(|c| self.is_present(c)),
            _ => false,
        }
    }

    /// Content octets of a leaf (stored bytes or a slice of the image).
    pub fn content(&self, id: NodeId) -> Option<&[u8]> {
        let node = &self.nodes[id];
        match &node.stored {
            Some(Stored::Content(bytes)) => Some(bytes),
            Some(Stored::Raw(bytes)) => Some(&bytes[node.nhdr..]),
            None => {
                let off = node.off?;
                self.image.get(off + node.nhdr..off + node.nhdr + node.len)
            }
        }
    }

    /// The complete TLV span of an image-bound or raw-stored node.
    pub fn tlv_span(&self, id: NodeId) -> Option<&[u8]> {
        let node = &self.nodes[id];
        match &node.stored {
            Some(Stored::Raw(bytes)) => Some(bytes),
            _ => {
                let off = node.off?;
                self.image.get(off..off + node.nhdr + node.len)
            }
        }
    }
}

pub struct ChildIter<'a> {
    tree: &'a ValueTree,
    next: Option<NodeId>,
}

impl Iterator for ChildIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = self.tree.nodes[cur].sibling;
        Some(cur)
    }
}
