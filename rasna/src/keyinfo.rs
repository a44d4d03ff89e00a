//! Conversion between DER key material and canonical S-expressions.
//!
//! Public keys travel as `(public-key (rsa (n #...#) (e #...#)))`, signature
//! values as `(sig-val (rsa (s #...#)))`, both in canonical encoding
//! (`(10:public-key...)` on the wire). The caller's cryptography consumes and
//! produces these; this module only converts.

use crate::{modules, oids};
use rasna_asn1::ber::{read_tl, Length};
use rasna_asn1::decode::decode;
use rasna_asn1::encode::{encode, store_any_raw, store_bit_string, store_integer, store_null, store_oid};
use rasna_asn1::path::find;
use rasna_asn1::tree::{NodeId, ValueTree};
use rasna_asn1::Asn1Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeyInfoError>;

#[derive(Debug, Error)]
pub enum KeyInfoError {
    #[error("unknown algorithm `{0}`")]
    UnknownAlgorithm(String),

    #[error("malformed S-expression")]
    InvalidSexp,

    #[error("inconsistent key material")]
    InvalidKeyInfo,

    #[error(transparent)]
    Asn1(#[from] Asn1Error),
}

/// Key algorithm families the bridge understands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Algorithm {
    Rsa,
    Dsa,
}

impl Algorithm {
    fn from_oid(oid: &str) -> Option<Algorithm> {
        match oid {
            oids::RSA_ENCRYPTION
            | oids::MD5_WITH_RSA_ENCRYPTION
            | oids::SHA1_WITH_RSA_ENCRYPTION => Some(Algorithm::Rsa),
            oids::DSA | oids::DSA_WITH_SHA1 => Some(Algorithm::Dsa),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Algorithm::Rsa => "rsa",
            Algorithm::Dsa => "dsa",
        }
    }
}

// canonical S-expression scaffolding

fn put_atom(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn put_param(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.push(b'(');
    put_atom(out, name.as_bytes());
    put_atom(out, value);
    out.push(b')');
}

#[derive(Debug, PartialEq)]
enum SexpVal {
    Atom(Vec<u8>),
    List(Vec<SexpVal>),
}

fn parse_sexp(data: &[u8]) -> Result<SexpVal> {
    let (value, used) = parse_value(data)?;
    if used != data.len() {
        return Err(KeyInfoError::InvalidSexp);
    }
    Ok(value)
}

fn parse_value(data: &[u8]) -> Result<(SexpVal, usize)> {
    match data.first() {
        Some(b'(') => {
            let mut items = Vec::new();
            let mut pos = 1;
            loop {
                match data.get(pos) {
                    Some(b')') => return Ok((SexpVal::List(items), pos + 1)),
                    Some(_) => {
                        let (item, used) = parse_value(&data[pos..])?;
                        items.push(item);
                        pos += used;
                    }
                    None => return Err(KeyInfoError::InvalidSexp),
                }
            }
        }
        Some(c) if c.is_ascii_digit() => {
            let colon = data
                .iter()
                .position(|&b| b == b':')
                .ok_or(KeyInfoError::InvalidSexp)?;
            let len: usize = std::str::from_utf8(&data[..colon])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(KeyInfoError::InvalidSexp)?;
            let start = colon + 1;
            let bytes = data
                .get(start..start + len)
                .ok_or(KeyInfoError::InvalidSexp)?;
            Ok((SexpVal::Atom(bytes.to_vec()), start + len))
        }
        _ => Err(KeyInfoError::InvalidSexp),
    }
}

impl SexpVal {
    fn atom(&self) -> Result<&[u8]> {
        match self {
            SexpVal::Atom(bytes) => Ok(bytes),
            SexpVal::List(_) => Err(KeyInfoError::InvalidSexp),
        }
    }

    fn list(&self) -> Result<&[SexpVal]> {
        match self {
            SexpVal::List(items) => Ok(items),
            SexpVal::Atom(_) => Err(KeyInfoError::InvalidSexp),
        }
    }
}

/// Named parameters of a `(name (p1 v1)(p2 v2)...)` list, in order.
fn named_params<'a>(items: &'a [SexpVal], expected: &[&str]) -> Result<Vec<&'a [u8]>> {
    if items.len() != expected.len() {
        return Err(KeyInfoError::InvalidSexp);
    }
    let mut out = Vec::with_capacity(expected.len());
    for (item, want) in items.iter().zip(expected) {
        let pair = item.list()?;
        if pair.len() != 2 || pair[0].atom()? != want.as_bytes() {
            return Err(KeyInfoError::InvalidSexp);
        }
        out.push(pair[1].atom()?);
    }
    Ok(out)
}

fn leaf(tree: &ValueTree, from: NodeId, path: &str) -> Result<NodeId> {
    find(tree, from, path).ok_or(KeyInfoError::InvalidKeyInfo)
}

fn content<'a>(tree: &'a ValueTree, id: NodeId) -> Result<&'a [u8]> {
    tree.content(id).ok_or(KeyInfoError::InvalidKeyInfo)
}

/// BIT STRING content with no unused bits, i.e. the wrapped DER.
fn bit_string_payload(content: &[u8]) -> Result<&[u8]> {
    match content.split_first() {
        Some((0, rest)) => Ok(rest),
        _ => Err(KeyInfoError::InvalidKeyInfo),
    }
}

/// `SubjectPublicKeyInfo` DER to `(public-key ...)`.
pub fn spki_to_sexp(der: &[u8]) -> Result<Vec<u8>> {
    let schema = modules::x509();
    let tree = decode(schema, "SubjectPublicKeyInfo", der.to_vec())?;
    let root = tree.root();

    let oid_node = leaf(&tree, root, "SubjectPublicKeyInfo.algorithm.algorithm")?;
    let oid_str = oids::from_der(content(&tree, oid_node)?).ok_or(KeyInfoError::InvalidKeyInfo)?;
    let algorithm =
        Algorithm::from_oid(&oid_str).ok_or(KeyInfoError::UnknownAlgorithm(oid_str.clone()))?;

    let key_node = leaf(&tree, root, "SubjectPublicKeyInfo.subjectPublicKey")?;
    let key_der = bit_string_payload(content(&tree, key_node)?)?;

    let mut out = Vec::new();
    out.push(b'(');
    put_atom(&mut out, b"public-key");
    out.push(b'(');
    put_atom(&mut out, algorithm.name().as_bytes());

    match algorithm {
        Algorithm::Rsa => {
            let key = decode(schema, "RSAPublicKey", key_der.to_vec())?;
            let n = content(&key, leaf(&key, key.root(), "RSAPublicKey.modulus")?)?;
            let e = content(&key, leaf(&key, key.root(), "RSAPublicKey.publicExponent")?)?;
            put_param(&mut out, "n", n);
            put_param(&mut out, "e", e);
        }
        Algorithm::Dsa => {
            let params_node = leaf(&tree, root, "SubjectPublicKeyInfo.algorithm.parameters")?;
            let params_der = tree.tlv_span(params_node).ok_or(KeyInfoError::InvalidKeyInfo)?;
            let params = decode(schema, "DSAParameters", params_der.to_vec())?;
            let p = content(&params, leaf(&params, params.root(), "DSAParameters.p")?)?;
            let q = content(&params, leaf(&params, params.root(), "DSAParameters.q")?)?;
            let g = content(&params, leaf(&params, params.root(), "DSAParameters.g")?)?;

            let y_tree = decode(schema, "DSAPublicKey", key_der.to_vec())?;
            let y = content(&y_tree, y_tree.root())?;

            put_param(&mut out, "p", p);
            put_param(&mut out, "q", q);
            put_param(&mut out, "g", g);
            put_param(&mut out, "y", y);
        }
    }

    out.push(b')');
    out.push(b')');
    Ok(out)
}

/// `(public-key ...)` back to `SubjectPublicKeyInfo` DER.
pub fn sexp_to_spki(sexp: &[u8]) -> Result<Vec<u8>> {
    let parsed = parse_sexp(sexp)?;
    let top = parsed.list()?;
    if top.len() != 2 || top[0].atom()? != b"public-key" {
        return Err(KeyInfoError::InvalidSexp);
    }
    let key = top[1].list()?;
    let (alg, params) = key.split_first().ok_or(KeyInfoError::InvalidSexp)?;
    let alg = alg.atom()?;

    let schema = modules::x509();
    let mut spki = ValueTree::expand(schema, "SubjectPublicKeyInfo")?;
    let root = spki.root();
    let alg_oid_node = leaf(&spki, root, "SubjectPublicKeyInfo.algorithm.algorithm")?;
    let params_node = leaf(&spki, root, "SubjectPublicKeyInfo.algorithm.parameters")?;
    let key_node = leaf(&spki, root, "SubjectPublicKeyInfo.subjectPublicKey")?;

    match alg {
        b"rsa" => {
            let values = named_params(params, &["n", "e"])?;

            store_oid(&mut spki, alg_oid_node, &oids::to_der(oids::RSA_ENCRYPTION).unwrap())?;
            store_null(&mut spki, params_node)?;

            let mut rsa = ValueTree::expand(schema, "RSAPublicKey")?;
            let n_node = leaf(&rsa, rsa.root(), "RSAPublicKey.modulus")?;
            let e_node = leaf(&rsa, rsa.root(), "RSAPublicKey.publicExponent")?;
            store_integer(&mut rsa, n_node, values[0])?;
            store_integer(&mut rsa, e_node, values[1])?;
            let key_der = encode(&mut rsa)?;

            store_bit_string(&mut spki, key_node, 0, &key_der)?;
        }
        b"dsa" => {
            let values = named_params(params, &["p", "q", "g", "y"])?;

            store_oid(&mut spki, alg_oid_node, &oids::to_der(oids::DSA).unwrap())?;

            let mut dsa_params = ValueTree::expand(schema, "DSAParameters")?;
            for (name, value) in ["p", "q", "g"].iter().zip(values.iter()) {
                let node = leaf(&dsa_params, dsa_params.root(), &format!("DSAParameters.{name}"))?;
                store_integer(&mut dsa_params, node, value)?;
            }
            let params_der = encode(&mut dsa_params)?;
            store_any_raw(&mut spki, params_node, &params_der)?;

            let mut y = ValueTree::expand(schema, "DSAPublicKey")?;
            let y_root = y.root();
            store_integer(&mut y, y_root, values[3])?;
            let y_der = encode(&mut y)?;

            store_bit_string(&mut spki, key_node, 0, &y_der)?;
        }
        other => {
            let name = String::from_utf8_lossy(other).into_owned();
            return Err(KeyInfoError::UnknownAlgorithm(name));
        }
    }

    Ok(encode(&mut spki)?)
}

/// `AlgorithmIdentifier` TLV followed by the signature TLV (BIT STRING in
/// certificates, OCTET STRING in signer infos) to `(sig-val ...)`.
pub fn sigval_to_sexp(der: &[u8]) -> Result<Vec<u8>> {
    let schema = modules::x509();

    let alg_header = read_tl(der, 0)?;
    let alg_len = match alg_header.length {
        Length::Definite(len) => len,
        Length::Indefinite => return Err(KeyInfoError::InvalidKeyInfo),
    };
    let alg_end = alg_header.nhdr + alg_len;
    let alg_der = der.get(..alg_end).ok_or(KeyInfoError::InvalidKeyInfo)?;
    let alg_tree = decode(schema, "AlgorithmIdentifier", alg_der.to_vec())?;
    let oid_node = leaf(&alg_tree, alg_tree.root(), "AlgorithmIdentifier.algorithm")?;
    let oid_str =
        oids::from_der(content(&alg_tree, oid_node)?).ok_or(KeyInfoError::InvalidKeyInfo)?;
    let algorithm =
        Algorithm::from_oid(&oid_str).ok_or(KeyInfoError::UnknownAlgorithm(oid_str.clone()))?;

    let sig_header = read_tl(der, alg_end)?;
    let sig_len = match sig_header.length {
        Length::Definite(len) => len,
        Length::Indefinite => return Err(KeyInfoError::InvalidKeyInfo),
    };
    let sig_start = alg_end + sig_header.nhdr;
    let sig_content = der
        .get(sig_start..sig_start + sig_len)
        .ok_or(KeyInfoError::InvalidKeyInfo)?;
    let sig_bytes = match sig_header.tag() {
        rasna_asn1::Tag::BIT_STRING => bit_string_payload(sig_content)?,
        rasna_asn1::Tag::OCTET_STRING => sig_content,
        _ => return Err(KeyInfoError::InvalidKeyInfo),
    };

    let mut out = Vec::new();
    out.push(b'(');
    put_atom(&mut out, b"sig-val");
    out.push(b'(');
    put_atom(&mut out, algorithm.name().as_bytes());

    match algorithm {
        Algorithm::Rsa => put_param(&mut out, "s", sig_bytes),
        Algorithm::Dsa => {
            let rs = decode(schema, "DSASignatureValue", sig_bytes.to_vec())?;
            let r = content(&rs, leaf(&rs, rs.root(), "DSASignatureValue.r")?)?;
            let s = content(&rs, leaf(&rs, rs.root(), "DSASignatureValue.s")?)?;
            put_param(&mut out, "r", r);
            put_param(&mut out, "s", s);
        }
    }

    out.push(b')');
    out.push(b')');
    Ok(out)
}

/// Splits a `(sig-val ...)` S-expression into the signature algorithm and the
/// octets to place into a `SignerInfo.signature`.
pub(crate) fn sexp_to_sigval(sexp: &[u8]) -> Result<(Algorithm, Vec<u8>)> {
    let parsed = parse_sexp(sexp)?;
    let top = parsed.list()?;
    if top.len() != 2 || top[0].atom()? != b"sig-val" {
        return Err(KeyInfoError::InvalidSexp);
    }
    let body = top[1].list()?;
    let (alg, params) = body.split_first().ok_or(KeyInfoError::InvalidSexp)?;

    match alg.atom()? {
        b"rsa" => {
            let values = named_params(params, &["s"])?;
            Ok((Algorithm::Rsa, values[0].to_vec()))
        }
        b"dsa" => {
            let values = named_params(params, &["r", "s"])?;
            let schema = modules::x509();
            let mut rs = ValueTree::expand(schema, "DSASignatureValue")?;
            let r_node = leaf(&rs, rs.root(), "DSASignatureValue.r")?;
            let s_node = leaf(&rs, rs.root(), "DSASignatureValue.s")?;
            store_integer(&mut rs, r_node, values[0])?;
            store_integer(&mut rs, s_node, values[1])?;
            Ok((Algorithm::Dsa, encode(&mut rs)?))
        }
        other => Err(KeyInfoError::UnknownAlgorithm(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

/// The `signatureAlgorithm` OID the engine writes for signatures of this
/// family.
pub(crate) fn signature_oid(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::Rsa => oids::RSA_ENCRYPTION,
        Algorithm::Dsa => oids::DSA,
    }
}
