//! DER decoder: binds a byte image to a schema-expanded value tree.

use crate::ber::{read_tl, Length, TlHeader};
use crate::error::{Asn1Error, Result};
use crate::schema::{Schema, SchemaType};
use crate::tree::{NodeId, ValueTree};
use std::sync::Arc;

/// Decodes exactly one TLV of the assignment `name` covering the whole image.
pub fn decode(schema: &Arc<Schema>, name: &str, image: Vec<u8>) -> Result<ValueTree> {
    let mut tree = ValueTree::expand(schema, name)?;
    decode_into(&mut tree, image)?;
    Ok(tree)
}

/// Binds `image` to an already expanded tree. The image must hold exactly
/// one TLV of the tree's root type.
pub fn decode_into(tree: &mut ValueTree, image: Vec<u8>) -> Result<()> {
    tree.image = image;
    let end = tree.image.len();
    let pos = decode_node(tree, tree.root(), 0, end)?;
    if pos != end {
        return Err(Asn1Error::LengthMismatch);
    }
    Ok(())
}

/// How the end of a constructed region is recognized.
#[derive(Clone, Copy)]
enum RegionEnd {
    At(usize),
    EndOfContents,
}

fn peek(tree: &ValueTree, pos: usize, end: usize) -> Result<TlHeader> {
    if pos >= end {
        return Err(Asn1Error::PrematureEof);
    }
    let h = read_tl(&tree.image, pos)?;
    if let Length::Definite(len) = h.length {
        if pos + h.nhdr + len > end {
            return Err(Asn1Error::LengthMismatch);
        }
    }
    Ok(h)
}

fn at_region_end(tree: &ValueTree, pos: usize, end: usize, region: RegionEnd) -> Result<bool> {
    match region {
        RegionEnd::At(region_end) => Ok(pos >= region_end),
        RegionEnd::EndOfContents => Ok(peek(tree, pos, end)?.is_end_of_contents()),
    }
}

/// Does the TLV at `h` satisfy the node (including its CHOICE alternatives)?
fn node_matches(tree: &ValueTree, id: NodeId, h: &TlHeader) -> bool {
    let node = tree.node(id);
    if let Some(tag) = node.explicit {
        return h.tag() == tag && h.constructed;
    }
    match node.ty {
        // an implicitly tagged ANY only matches its override tag
        SchemaType::Any => node.vtype.is_none() || node.vtype == Some(h.tag()),
        SchemaType::Choice => tree.children(id).any(|alt| node_matches(tree, alt, h)),
        _ => node.vtype == Some(h.tag()),
    }
}

/// Decodes the TLV at `pos` into `id`, returning the position after it.
pub(crate) fn decode_node(tree: &mut ValueTree, id: NodeId, pos: usize, end: usize) -> Result<usize> {
    debug_log!(
        "decode {:?} `{}` at {}",
        tree.ty(id),
        tree.name(id).unwrap_or("?"),
        pos
    );

    // An EXPLICIT override is a synthetic constructed wrapper around the
    // underlying encoding.
    if let Some(tag) = tree.node(id).explicit {
        let h = peek(tree, pos, end)?;
        if h.tag() != tag || !h.constructed {
            return Err(Asn1Error::UnexpectedTag {
                expected: tag,
                found: h.tag(),
            });
        }
        let inner_start = pos + h.nhdr;
        let (after, span) = match h.length {
            Length::Definite(len) => {
                let inner_end = inner_start + len;
                let after = decode_inner(tree, id, inner_start, inner_end)?;
                if after != inner_end {
                    return Err(Asn1Error::LengthMismatch);
                }
                (after, len)
            }
            Length::Indefinite => {
                let after = decode_inner(tree, id, inner_start, end)?;
                if !peek(tree, after, end)?.is_end_of_contents() {
                    return Err(Asn1Error::LengthMismatch);
                }
                (after + 2, after - inner_start)
            }
        };
        let node = tree.node_mut(id);
        if node.ty == SchemaType::Choice {
            // the selected alternative carries its own TLV; the wrapper is
            // recorded on the CHOICE node itself
            node.off = Some(pos);
            node.nhdr = h.nhdr;
            node.len = span;
        } else {
            // the node spans both headers; `len` is the inner content length
            let inner_nhdr = node.nhdr;
            node.off = Some(pos);
            node.nhdr = h.nhdr + inner_nhdr;
        }
        return Ok(after);
    }

    decode_inner(tree, id, pos, end)
}

/// Decodes the underlying (post-override) encoding of a node.
fn decode_inner(tree: &mut ValueTree, id: NodeId, pos: usize, end: usize) -> Result<usize> {
    match tree.ty(id) {
        SchemaType::Choice => {
            let h = peek(tree, pos, end)?;
            let alt = tree
                .children(id)
                .find(|&alt| node_matches(tree, alt, &h))
                .ok_or(Asn1Error::ChoiceNoMatch { found: h.tag() })?;
            decode_node(tree, alt, pos, end)
        }
        SchemaType::Any => {
            let h = peek(tree, pos, end)?;
            if let Some(expected) = tree.node(id).vtype {
                if h.tag() != expected {
                    return Err(Asn1Error::UnexpectedTag {
                        expected,
                        found: h.tag(),
                    });
                }
            }
            let len = match h.length {
                Length::Definite(len) => len,
                Length::Indefinite => return Err(Asn1Error::UnsupportedType),
            };
            let node = tree.node_mut(id);
            node.off = Some(pos);
            node.nhdr = h.nhdr;
            node.len = len;
            node.vtype = Some(h.tag());
            Ok(pos + h.nhdr + len)
        }
        ty => {
            let expected = tree.node(id).vtype.ok_or(Asn1Error::UnsupportedType)?;
            let h = peek(tree, pos, end)?;
            if h.tag() != expected {
                return Err(Asn1Error::UnexpectedTag {
                    expected,
                    found: h.tag(),
                });
            }

            if ty.is_constructed() {
                if !h.constructed {
                    return Err(Asn1Error::UnexpectedTag {
                        expected,
                        found: h.tag(),
                    });
                }
                decode_constructed(tree, id, pos, &h, end)
            } else {
                if h.constructed {
                    // constructed primitives (BER segmented strings) are not
                    // handled by the tree decoder
                    return Err(Asn1Error::UnsupportedType);
                }
                let len = h.length.definite()?;
                let node = tree.node_mut(id);
                node.off = Some(pos);
                node.nhdr = h.nhdr;
                node.len = len;
                Ok(pos + h.nhdr + len)
            }
        }
    }
}

fn decode_constructed(
    tree: &mut ValueTree,
    id: NodeId,
    pos: usize,
    h: &TlHeader,
    end: usize,
) -> Result<usize> {
    let content_start = pos + h.nhdr;
    let (region, hard_end) = match h.length {
        Length::Definite(len) => (RegionEnd::At(content_start + len), content_start + len),
        Length::Indefinite => (RegionEnd::EndOfContents, end),
    };

    let mut cpos = content_start;
    match tree.ty(id) {
        SchemaType::Sequence | SchemaType::Set => {
            let children: Vec<NodeId> = tree.children(id).collect();
            for child in children {
                if at_region_end(tree, cpos, hard_end, region)? {
                    if tree.node(child).may_be_absent() {
                        continue;
                    }
                    return Err(Asn1Error::PrematureEof);
                }
                let next = peek(tree, cpos, hard_end)?;
                if node_matches(tree, child, &next) {
                    cpos = decode_node(tree, child, cpos, hard_end)?;
                } else if tree.node(child).may_be_absent() {
                    // the cursor does not advance; the element is absent
                    continue;
                } else if tree.ty(child) == SchemaType::Choice {
                    return Err(Asn1Error::ChoiceNoMatch { found: next.tag() });
                } else {
                    let expected = tree
                        .node(child)
                        .explicit
                        .or(tree.node(child).vtype)
                        .unwrap_or(next.tag());
                    return Err(Asn1Error::UnexpectedTag {
                        expected,
                        found: next.tag(),
                    });
                }
            }
        }
        SchemaType::SequenceOf | SchemaType::SetOf => {
            while !at_region_end(tree, cpos, hard_end, region)? {
                let item = tree.append(id)?;
                cpos = decode_node(tree, item, cpos, hard_end)?;
            }
        }
        _ => unreachable!("decode_constructed on a non-constructed node"),
    }

    let (content_len, after) = match region {
        RegionEnd::At(region_end) => {
            if cpos != region_end {
                return Err(Asn1Error::LengthMismatch);
            }
            (region_end - content_start, region_end)
        }
        RegionEnd::EndOfContents => {
            if !peek(tree, cpos, hard_end)?.is_end_of_contents() {
                return Err(Asn1Error::LengthMismatch);
            }
            (cpos - content_start, cpos + 2)
        }
    };

    let node = tree.node_mut(id);
    node.off = Some(pos);
    node.nhdr = h.nhdr;
    node.len = content_len;
    Ok(after)
}
