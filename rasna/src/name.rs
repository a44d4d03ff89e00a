//! RFC 2253 formatting of decoded distinguished names.

use crate::oids;
use rasna_asn1::schema::SchemaType;
use rasna_asn1::tree::{NodeId, ValueTree};
use rasna_asn1::Tag;
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("malformed distinguished name")]
pub struct DnError;

/// Short names RFC 2253 and common practice assign to attribute types.
fn short_name(oid: &str) -> Option<&'static str> {
    Some(match oid {
        oids::AT_COMMON_NAME => "CN",
        oids::AT_SURNAME => "SN",
        oids::AT_SERIAL_NUMBER => "SERIALNUMBER",
        oids::AT_COUNTRY_NAME => "C",
        oids::AT_LOCALITY_NAME => "L",
        oids::AT_STATE_OR_PROVINCE_NAME => "ST",
        oids::AT_STREET_ADDRESS => "STREET",
        oids::AT_ORGANIZATION_NAME => "O",
        oids::AT_ORGANIZATIONAL_UNIT_NAME => "OU",
        oids::AT_TITLE => "T",
        oids::AT_GIVEN_NAME => "GN",
        oids::AT_DOMAIN_COMPONENT => "DC",
        oids::AT_USER_ID => "UID",
        oids::EMAIL_ADDRESS => "EMail",
        _ => return None,
    })
}

/// Formats the `Name` CHOICE node at `name_node` as an RFC 2253 string:
/// RDNs in reverse order, `+`-joined multi-valued RDNs, `\`-escaping, and
/// `#hex` for values that are not character strings.
pub(crate) fn dn_to_string(tree: &ValueTree, name_node: NodeId) -> Result<String, DnError> {
    let rdn_sequence = tree
        .children(name_node)
        .find(|&c| tree.name(c) == Some("rdnSequence"))
        .filter(|&c| tree.is_present(c))
        .ok_or(DnError)?;

    let rdns: Vec<NodeId> = tree.children(rdn_sequence).collect();
    let mut out = String::new();

    for (i, &rdn) in rdns.iter().rev().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let mut first = true;
        for atv in tree.children(rdn) {
            if !first {
                out.push('+');
            }
            first = false;
            format_atv(tree, atv, &mut out)?;
        }
        if first {
            // an empty RDN set is not a valid encoding
            return Err(DnError);
        }
    }

    Ok(out)
}

/// Formats one RelativeDistinguishedName (a SET OF AttributeTypeAndValue).
pub(crate) fn rdn_to_string(tree: &ValueTree, rdn: NodeId) -> Result<String, DnError> {
    let mut out = String::new();
    let mut first = true;
    for atv in tree.children(rdn) {
        if !first {
            out.push('+');
        }
        first = false;
        format_atv(tree, atv, &mut out)?;
    }
    if first {
        return Err(DnError);
    }
    Ok(out)
}

fn format_atv(tree: &ValueTree, atv: NodeId, out: &mut String) -> Result<(), DnError> {
    if tree.ty(atv) != SchemaType::Sequence {
        return Err(DnError);
    }
    let oid_node = tree.first_child(atv).ok_or(DnError)?;
    let value_node = tree.next_sibling(oid_node).ok_or(DnError)?;

    let oid_content = tree.content(oid_node).ok_or(DnError)?;
    let oid_str = oids::from_der(oid_content).ok_or(DnError)?;

    match short_name(&oid_str) {
        Some(name) => out.push_str(name),
        None => out.push_str(&oid_str),
    }
    out.push('=');

    let vtype = tree.value_type(value_node).ok_or(DnError)?;
    let content = tree.content(value_node).ok_or(DnError)?;
    if matches!(
        vtype,
        Tag::UTF8_STRING | Tag::PRINTABLE_STRING | Tag::IA5_STRING
    ) {
        let text = std::str::from_utf8(content).map_err(|_| DnError)?;
        escape_into(text, out);
    } else {
        // not a character string: hex form of the complete value TLV
        let tlv = tree.tlv_span(value_node).ok_or(DnError)?;
        out.push('#');
        for byte in tlv {
            write!(out, "{byte:02X}").expect("writing to a String cannot fail");
        }
    }

    Ok(())
}

fn escape_into(text: &str, out: &mut String) {
    let chars: Vec<char> = text.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        let escape = match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' => true,
            '#' | ' ' if i == 0 => true,
            ' ' if i == chars.len() - 1 => true,
            _ => false,
        };
        if escape {
            out.push('\\');
        }
        out.push(c);
    }
}
