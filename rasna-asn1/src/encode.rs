//! DER encoder: emits a value tree into a fresh image and rebinds the tree
//! to it, plus the `store_*` content writers and subtree copying.

use crate::ber::{tl_len, write_tl, Length};
use crate::error::{Asn1Error, Result};
use crate::schema::SchemaType;
use crate::tag::Tag;
use crate::tree::{NodeId, Stored, ValueTree};

#[derive(Clone, Copy, Default)]
struct NodeSize {
    present: bool,
    /// Encoded size of the node including every header.
    total: usize,
    /// Content length of the node's own TLV (inner TLV when explicit).
    len: usize,
}

/// Encodes the tree into a new image.
///
/// Every present node is rebound to the produced image, which replaces the
/// tree's owned image, so encoding is idempotent. `SET OF` elements are
/// emitted in tree order; producing sorted sets is the caller's concern.
pub fn encode(tree: &mut ValueTree) -> Result<Vec<u8>> {
    let mut sizes = vec![NodeSize::default(); tree.nodes.len()];
    let root = tree.root();
    measure(tree, root, &mut sizes)?;
    if !sizes[root].present {
        return Err(Asn1Error::InvalidValue);
    }

    let old_image = std::mem::take(&mut tree.image);
    let mut out = Vec::with_capacity(sizes[root].total);
    emit(tree, root, &sizes, &old_image, &mut out);
    tree.image = out.clone();

    for node in &mut tree.nodes {
        node.stored = None;
    }

    Ok(out)
}

fn measure(tree: &ValueTree, id: NodeId, sizes: &mut Vec<NodeSize>) -> Result<usize> {
    if !tree.is_present(id) {
        sizes[id] = NodeSize::default();
        return Ok(0);
    }

    let node = tree.node(id);
    let total = match node.ty {
        SchemaType::Choice => {
            let mut selected = 0usize;
            let children: Vec<NodeId> = tree.children(id).collect();
            for child in children {
                if tree.is_present(child) {
                    selected = measure(tree, child, sizes)?;
                    break;
                }
            }
            if selected == 0 {
                return Err(Asn1Error::InvalidValue);
            }
            match node.explicit {
                Some(tag) => {
                    sizes[id].len = selected;
                    tl_len(tag.number, Length::Definite(selected)) + selected
                }
                None => selected,
            }
        }
        SchemaType::Sequence | SchemaType::Set | SchemaType::SequenceOf | SchemaType::SetOf => {
            let mut content = 0usize;
            let children: Vec<NodeId> = tree.children(id).collect();
            for child in children {
                content += measure(tree, child, sizes)?;
            }
            sizes[id].len = content;
            wrapped_len(node.vtype, node.explicit, content)?
        }
        _ => {
            // leaf: raw TLV, stored content, or an image-bound span
            if let Some(Stored::Raw(bytes)) = &node.stored {
                sizes[id].len = node.len;
                bytes.len()
            } else if node.ty == SchemaType::Any && node.stored.is_none() {
                // an image-bound ANY may hold constructed content; its span
                // is carried over verbatim
                if node.off.is_none() {
                    return Err(Asn1Error::InvalidValue);
                }
                sizes[id].len = node.len;
                node.nhdr + node.len
            } else {
                let content_len = match &node.stored {
                    Some(Stored::Content(bytes)) => bytes.len(),
                    Some(Stored::Raw(_)) => unreachable!(),
                    None => {
                        if node.off.is_none() {
                            return Err(Asn1Error::InvalidValue);
                        }
                        node.len
                    }
                };
                sizes[id].len = content_len;
                wrapped_len(node.vtype, node.explicit, content_len)?
            }
        }
    };

    sizes[id].present = true;
    sizes[id].total = total;
    Ok(total)
}

fn wrapped_len(vtype: Option<Tag>, explicit: Option<Tag>, content: usize) -> Result<usize> {
    let tag = vtype.ok_or(Asn1Error::InvalidValue)?;
    let inner = tl_len(tag.number, Length::Definite(content)) + content;
    Ok(match explicit {
        Some(outer) => tl_len(outer.number, Length::Definite(inner)) + inner,
        None => inner,
    })
}

fn emit(tree: &mut ValueTree, id: NodeId, sizes: &[NodeSize], old_image: &[u8], out: &mut Vec<u8>) {
    if !sizes[id].present {
        return;
    }

    let pos = out.len();
    let content_len = sizes[id].len;
    let node = tree.node(id);
    let ty = node.ty;
    let vtype = node.vtype;
    let explicit = node.explicit;

    match ty {
        SchemaType::Choice => {
            if let Some(tag) = explicit {
                write_tl(out, tag.class, tag.number, true, Length::Definite(content_len));
                let nhdr = out.len() - pos;
                let node = tree.node_mut(id);
                node.off = Some(pos);
                node.nhdr = nhdr;
                node.len = content_len;
            } else {
                tree.node_mut(id).off = None;
            }
            let children: Vec<NodeId> = tree.children(id).collect();
            for child in children {
                emit(tree, child, sizes, old_image, out);
            }
        }
        SchemaType::Sequence | SchemaType::Set | SchemaType::SequenceOf | SchemaType::SetOf => {
            let tag = vtype.expect("constructed node without a tag");
            if let Some(outer) = explicit {
                let inner = tl_len(tag.number, Length::Definite(content_len)) + content_len;
                write_tl(out, outer.class, outer.number, true, Length::Definite(inner));
            }
            write_tl(out, tag.class, tag.number, true, Length::Definite(content_len));
            let nhdr = out.len() - pos;
            {
                let node = tree.node_mut(id);
                node.off = Some(pos);
                node.nhdr = nhdr;
                node.len = content_len;
            }
            let children: Vec<NodeId> = tree.children(id).collect();
            for child in children {
                emit(tree, child, sizes, old_image, out);
            }
        }
        _ => {
            if let Some(Stored::Raw(bytes)) = &node.stored {
                out.extend_from_slice(bytes);
                let node = tree.node_mut(id);
                node.off = Some(pos);
                return;
            }

            if ty == SchemaType::Any && node.stored.is_none() {
                let off = node.off.expect("measured ANY lost its binding");
                let span = &old_image[off..off + node.nhdr + node.len];
                out.extend_from_slice(span);
                let node = tree.node_mut(id);
                node.off = Some(pos);
                return;
            }

            let content: Vec<u8> = match &node.stored {
                Some(Stored::Content(bytes)) => bytes.clone(),
                Some(Stored::Raw(_)) => unreachable!(),
                None => {
                    let off = node.off.expect("measured leaf lost its binding");
                    old_image[off + node.nhdr..off + node.nhdr + node.len].to_vec()
                }
            };

            let tag = vtype.expect("leaf without a tag");
            if let Some(outer) = explicit {
                let inner = tl_len(tag.number, Length::Definite(content.len())) + content.len();
                write_tl(out, outer.class, outer.number, true, Length::Definite(inner));
            }
            write_tl(out, tag.class, tag.number, false, Length::Definite(content.len()));
            let nhdr = out.len() - pos;
            out.extend_from_slice(&content);

            let node = tree.node_mut(id);
            node.off = Some(pos);
            node.nhdr = nhdr;
            node.len = content.len();
        }
    }
}

fn store_with(tree: &mut ValueTree, id: NodeId, expected: SchemaType, content: Vec<u8>) -> Result<()> {
    let node = tree.node_mut(id);
    if node.ty == SchemaType::Any {
        node.vtype = expected.universal_tag();
    } else if node.ty != expected {
        return Err(Asn1Error::InvalidValue);
    }
    node.len = content.len();
    node.off = None;
    node.stored = Some(Stored::Content(content));
    Ok(())
}

/// Places OID content octets (not a TLV) into the node.
pub fn store_oid(tree: &mut ValueTree, id: NodeId, content: &[u8]) -> Result<()> {
    if content.is_empty() {
        return Err(Asn1Error::InvalidValue);
    }
    store_with(tree, id, SchemaType::Oid, content.to_vec())
}

/// Places raw INTEGER content octets as given; leading zeros are preserved.
pub fn store_integer(tree: &mut ValueTree, id: NodeId, content: &[u8]) -> Result<()> {
    if content.is_empty() {
        return Err(Asn1Error::InvalidValue);
    }
    store_with(tree, id, SchemaType::Integer, content.to_vec())
}

pub fn store_octet_string(tree: &mut ValueTree, id: NodeId, content: &[u8]) -> Result<()> {
    store_with(tree, id, SchemaType::OctetString, content.to_vec())
}

pub fn store_null(tree: &mut ValueTree, id: NodeId) -> Result<()> {
    store_with(tree, id, SchemaType::Null, Vec::new())
}

pub fn store_boolean(tree: &mut ValueTree, id: NodeId, value: bool) -> Result<()> {
    store_with(tree, id, SchemaType::Boolean, vec![if value { 0xFF } else { 0x00 }])
}

/// `unused` is the count of unused bits in the final octet; it becomes the
/// leading content octet.
pub fn store_bit_string(tree: &mut ValueTree, id: NodeId, unused: u8, bits: &[u8]) -> Result<()> {
    if unused > 7 || (bits.is_empty() && unused != 0) {
        return Err(Asn1Error::InvalidValue);
    }
    let mut content = Vec::with_capacity(bits.len() + 1);
    content.push(unused);
    content.extend_from_slice(bits);
    store_with(tree, id, SchemaType::BitString, content)
}

pub fn store_utf8_string(tree: &mut ValueTree, id: NodeId, value: &str) -> Result<()> {
    store_with(tree, id, SchemaType::Utf8String, value.as_bytes().to_vec())
}

pub fn store_printable_string(tree: &mut ValueTree, id: NodeId, value: &str) -> Result<()> {
    if !value.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b' ' | b'\'' | b'(' | b')' | b'+' | b',' | b'-' | b'.' | b'/' | b':' | b'=' | b'?')
    }) {
        return Err(Asn1Error::InvalidValue);
    }
    store_with(tree, id, SchemaType::PrintableString, value.as_bytes().to_vec())
}

pub fn store_ia5_string(tree: &mut ValueTree, id: NodeId, value: &str) -> Result<()> {
    if !value.is_ascii() {
        return Err(Asn1Error::InvalidValue);
    }
    store_with(tree, id, SchemaType::Ia5String, value.as_bytes().to_vec())
}

/// `YYMMDDhhmmssZ`.
pub fn store_utc_time(tree: &mut ValueTree, id: NodeId, value: &str) -> Result<()> {
    if value.len() != 13 || !value.ends_with('Z') || !value[..12].bytes().all(|b| b.is_ascii_digit()) {
        return Err(Asn1Error::InvalidValue);
    }
    store_with(tree, id, SchemaType::UtcTime, value.as_bytes().to_vec())
}

/// `YYYYMMDDhhmmssZ`.
pub fn store_generalized_time(tree: &mut ValueTree, id: NodeId, value: &str) -> Result<()> {
    if value.len() != 15 || !value.ends_with('Z') || !value[..14].bytes().all(|b| b.is_ascii_digit()) {
        return Err(Asn1Error::InvalidValue);
    }
    store_with(tree, id, SchemaType::GeneralizedTime, value.as_bytes().to_vec())
}

/// Places a complete pre-encoded TLV into an `ANY` node.
pub fn store_any_raw(tree: &mut ValueTree, id: NodeId, tlv: &[u8]) -> Result<()> {
    let h = crate::ber::read_tl(tlv, 0)?;
    let len = h.length.definite()?;
    if h.nhdr + len != tlv.len() {
        return Err(Asn1Error::InvalidValue);
    }
    let node = tree.node_mut(id);
    if node.ty != SchemaType::Any {
        return Err(Asn1Error::InvalidValue);
    }
    node.vtype = Some(h.tag());
    node.nhdr = h.nhdr;
    node.len = len;
    node.off = None;
    node.stored = Some(Stored::Raw(tlv.to_vec()));
    Ok(())
}

/// Replaces the payload of `dst_id` with a structural clone of the subtree at
/// `src_id`. Leaf payloads are copied out of the source tree; every copied
/// node is unbound until the next `encode` of the destination tree.
pub fn copy_tree(dst: &mut ValueTree, dst_id: NodeId, src: &ValueTree, src_id: NodeId) -> Result<()> {
    let src_node = src.node(src_id);

    {
        let d = dst.node_mut(dst_id);
        d.ty = src_node.ty;
        d.vtype = src_node.vtype;
        d.explicit = src_node.explicit;
        d.off = None;
        d.child = None;
        d.stored = None;
    }

    copy_payload(dst, dst_id, src, src_id)?;
    Ok(())
}

fn copy_payload(dst: &mut ValueTree, dst_id: NodeId, src: &ValueTree, src_id: NodeId) -> Result<()> {
    let src_node = src.node(src_id);

    match src_node.ty {
        SchemaType::Sequence
        | SchemaType::Set
        | SchemaType::SequenceOf
        | SchemaType::SetOf
        | SchemaType::Choice => {
            let mut prev: Option<NodeId> = None;
            let src_children: Vec<NodeId> = src.children(src_id).collect();
            for src_child in src_children {
                let c = src.node(src_child).clone();
                let new_id = dst.nodes.len();
                dst.nodes.push(crate::tree::ValueNode {
                    schema_id: c.schema_id,
                    name: c.name.clone(),
                    ty: c.ty,
                    vtype: c.vtype,
                    explicit: c.explicit,
                    optional: c.optional,
                    has_default: c.has_default,
                    off: None,
                    nhdr: 0,
                    len: 0,
                    stored: None,
                    parent: Some(dst_id),
                    child: None,
                    sibling: None,
                });
                match prev {
                    None => dst.nodes[dst_id].child = Some(new_id),
                    Some(p) => dst.nodes[p].sibling = Some(new_id),
                }
                prev = Some(new_id);
                copy_payload(dst, new_id, src, src_child)?;
            }
        }
        _ => {
            // leaf: carry the complete source TLV so implicit and explicit
            // tags survive the copy verbatim
            if src.is_present(src_id) {
                let tlv = src.tlv_span(src_id).ok_or(Asn1Error::InvalidValue)?.to_vec();
                let d = dst.node_mut(dst_id);
                d.nhdr = src_node.nhdr;
                d.len = src_node.len;
                d.off = None;
                d.stored = Some(Stored::Raw(tlv));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::schema::Schema;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::parse(
                r#"
                Test DEFINITIONS ::= BEGIN

                Record ::= SEQUENCE {
                    serial INTEGER,
                    label  [0] IMPLICIT UTF8String OPTIONAL,
                    active BOOLEAN DEFAULT FALSE,
                    blob   OCTET STRING }

                Attribute ::= SEQUENCE {
                    attrType   OBJECT IDENTIFIER,
                    attrValues SET OF AttributeValue }
                AttributeValue ::= ANY

                Wrapped ::= SEQUENCE {
                    inner [1] EXPLICIT INTEGER }

                END
                "#,
            )
            .unwrap(),
        )
    }

    fn child(tree: &ValueTree, id: NodeId, name: &str) -> NodeId {
        tree.children(id)
            .find(|&c| tree.name(c) == Some(name))
            .unwrap()
    }

    #[test]
    fn decode_encode_round_trip() {
        let image = hex::decode("300f020101800261620101ff0403ff0102").unwrap();
        let mut tree = decode(&schema(), "Record", image.clone()).unwrap();
        let encoded = encode(&mut tree).unwrap();
        assert_eq!(encoded, image);

        // encoding is idempotent
        let again = encode(&mut tree).unwrap();
        assert_eq!(again, image);
    }

    #[test]
    fn absent_optionals_stay_absent() {
        let image = hex::decode("30080201070403ff0102").unwrap();
        let mut tree = decode(&schema(), "Record", image.clone()).unwrap();
        assert_eq!(encode(&mut tree).unwrap(), image);
    }

    #[test]
    fn built_attribute_matches_hand_encoding() {
        // messageDigest attribute with a 20-byte digest
        let oid = hex::decode("2a864886f70d010904").unwrap();
        let digest = [0xAB_u8; 20];

        let mut tree = ValueTree::expand(&schema(), "Attribute").unwrap();
        let root = tree.root();
        let attr_type = child(&tree, root, "attrType");
        store_oid(&mut tree, attr_type, &oid).unwrap();
        let values = child(&tree, root, "attrValues");
        let value = tree.append(values).unwrap();
        store_octet_string(&mut tree, value, &digest).unwrap();

        let encoded = encode(&mut tree).unwrap();

        let mut expected = vec![0x30, 0x23, 0x06, 0x09];
        expected.extend_from_slice(&oid);
        expected.extend_from_slice(&[0x31, 0x16, 0x04, 0x14]);
        expected.extend_from_slice(&digest);
        assert_eq!(encoded, expected);

        // offsets were rebound to the produced image
        assert_eq!(tree.offset(root), Some(0));
        let value_off = tree.offset(value).unwrap();
        assert_eq!(
            &encoded[value_off + tree.header_len(value)..][..20],
            &digest
        );
    }

    #[test]
    fn explicit_wrapper_is_regenerated() {
        let mut tree = ValueTree::expand(&schema(), "Wrapped").unwrap();
        let inner = child(&tree, tree.root(), "inner");
        store_integer(&mut tree, inner, &[0x05]).unwrap();

        let encoded = encode(&mut tree).unwrap();
        assert_eq!(encoded, hex::decode("3005a103020105").unwrap());
        assert_eq!(tree.offset(inner), Some(2));
        assert_eq!(tree.header_len(inner), 4);
    }

    #[test]
    fn copied_subtree_round_trips() {
        let image = hex::decode("300f020101800261620101ff0403ff0102").unwrap();
        let src = decode(&schema(), "Record", image.clone()).unwrap();

        let mut dst = ValueTree::expand(&schema(), "Record").unwrap();
        let dst_root = dst.root();
        let src_root = src.root();
        copy_tree(&mut dst, dst_root, &src, src_root).unwrap();
        assert_eq!(encode(&mut dst).unwrap(), image);
    }

    #[test]
    fn store_type_mismatch_is_rejected() {
        let mut tree = ValueTree::expand(&schema(), "Record").unwrap();
        let serial = child(&tree, tree.root(), "serial");
        assert!(matches!(
            store_octet_string(&mut tree, serial, &[1, 2]),
            Err(Asn1Error::InvalidValue)
        ));
    }
}
