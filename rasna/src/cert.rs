//! X.509 certificate reader.
//!
//! A [`Certificate`] owns the DER image and the value tree decoded from it;
//! accessors compute derived representations on demand. Optional elements
//! that are absent surface as [`CertError::NoData`], so callers can tell a
//! missing extension apart from a malformed one.

use crate::keyinfo::{self, KeyInfoError};
use crate::name::{dn_to_string, DnError};
use crate::time::{IsoTime, TimeError};
use crate::{modules, oids};
use rasna_asn1::ber::{read_tl_from, write_tl, Length};
use rasna_asn1::decode::decode;
use rasna_asn1::path::find;
use rasna_asn1::tree::{NodeId, ValueTree};
use rasna_asn1::Asn1Error;
use std::io::Read;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CertError>;

#[derive(Debug, Error)]
pub enum CertError {
    /// Clean end of a stream or of an enumeration.
    #[error("end of stream")]
    Eof,

    /// The certificate object was already filled by `read_der`.
    #[error("certificate already initialized")]
    Conflict,

    /// The object is empty, or an optional element is not present.
    #[error("no data")]
    NoData,

    /// The element is present but cannot be interpreted.
    #[error("invalid {0}")]
    InvalidData(&'static str),

    /// A mandatory element is missing from the image.
    #[error("mandatory element `{0}` not found")]
    ValueNotFound(&'static str),

    #[error(transparent)]
    Asn1(#[from] Asn1Error),

    #[error(transparent)]
    KeyInfo(#[from] KeyInfoError),
}

impl From<DnError> for CertError {
    fn from(_: DnError) -> Self {
        CertError::InvalidData("distinguished name")
    }
}

impl From<TimeError> for CertError {
    fn from(_: TimeError) -> Self {
        CertError::InvalidData("time value")
    }
}

/// Key usage flag set; bit `n` of the KeyUsage BIT STRING maps to `1 << n`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeyUsage(u32);

impl KeyUsage {
    pub const DIGITAL_SIGNATURE: u32 = 1;
    pub const NON_REPUDIATION: u32 = 2;
    pub const KEY_ENCIPHERMENT: u32 = 4;
    pub const DATA_ENCIPHERMENT: u32 = 8;
    pub const KEY_AGREEMENT: u32 = 16;
    pub const KEY_CERT_SIGN: u32 = 32;
    pub const CRL_SIGN: u32 = 64;
    pub const ENCIPHER_ONLY: u32 = 128;
    pub const DECIPHER_ONLY: u32 = 256;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    /// Projects BIT STRING content octets (leading unused-bit count included)
    /// onto the flag set.
    pub(crate) fn from_bit_string(content: &[u8]) -> Result<KeyUsage> {
        let (&unused, bits) = content.split_first().ok_or(CertError::InvalidData("key usage"))?;
        if unused > 7 {
            return Err(CertError::InvalidData("key usage"));
        }
        let mut flags = 0u32;
        let total_bits = bits.len() * 8 - unused as usize;
        for bit in 0..total_bits.min(9) {
            if bits[bit / 8] & (0x80 >> (bit % 8)) != 0 {
                flags |= 1 << bit;
            }
        }
        Ok(KeyUsage(flags))
    }
}

/// One enumerated extension: OID, criticality, and the position of the
/// `extnValue` content inside the certificate image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtensionInfo {
    pub oid: String,
    pub critical: bool,
    pub off: usize,
    pub len: usize,
}

#[derive(Debug, Default)]
pub struct Certificate {
    tree: Option<ValueTree>,
}

impl Certificate {
    /// Creates an empty certificate object to be filled by [`read_der`].
    ///
    /// [`read_der`]: Certificate::read_der
    pub fn new() -> Certificate {
        Certificate { tree: None }
    }

    /// Reads exactly one DER certificate from `reader`. A stream positioned
    /// at its end yields [`CertError::Eof`]; re-filling an initialized
    /// object yields [`CertError::Conflict`].
    pub fn read_der(&mut self, reader: &mut dyn Read) -> Result<()> {
        if self.tree.is_some() {
            return Err(CertError::Conflict);
        }

        let header = read_tl_from(reader).map_err(|err| match err {
            Asn1Error::Eof => CertError::Eof,
            other => CertError::Asn1(other),
        })?;
        let len = match header.length {
            Length::Definite(len) => len,
            Length::Indefinite => return Err(CertError::InvalidData("certificate framing")),
        };

        let mut image = Vec::with_capacity(header.nhdr + len);
        write_tl(
            &mut image,
            header.class,
            header.number,
            header.constructed,
            Length::Definite(len),
        );
        let content_start = image.len();
        image.resize(content_start + len, 0);
        reader
            .read_exact(&mut image[content_start..])
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    CertError::Asn1(Asn1Error::Truncated)
                } else {
                    CertError::Asn1(Asn1Error::Io(err))
                }
            })?;

        self.tree = Some(decode(modules::x509(), "Certificate", image)?);
        Ok(())
    }

    /// Decodes a certificate from a byte slice.
    pub fn from_der(der: &[u8]) -> Result<Certificate> {
        let tree = decode(modules::x509(), "Certificate", der.to_vec())?;
        Ok(Certificate { tree: Some(tree) })
    }

    /// The raw DER image.
    pub fn image(&self) -> Result<&[u8]> {
        Ok(self.tree()?.image())
    }

    pub(crate) fn tree(&self) -> Result<&ValueTree> {
        self.tree.as_ref().ok_or(CertError::NoData)
    }

    fn mandatory(&self, path: &'static str) -> Result<NodeId> {
        let tree = self.tree()?;
        find(tree, tree.root(), path)
            .filter(|&n| tree.is_present(n))
            .ok_or(CertError::ValueNotFound(path))
    }

    /// Raw serial number: 4-byte big-endian length prefix followed by the
    /// INTEGER content octets as encoded.
    pub fn serial(&self) -> Result<Vec<u8>> {
        let node = self.mandatory("Certificate.tbsCertificate.serialNumber")?;
        let tree = self.tree()?;
        let content = tree.content(node).ok_or(CertError::ValueNotFound("serialNumber"))?;
        Ok(length_prefixed(content))
    }

    /// Index 0 is the RFC 2253 issuer DN; indices 1.. enumerate the
    /// IssuerAltName extension. Past the last name, `None`.
    pub fn issuer(&self, idx: usize) -> Result<Option<String>> {
        self.name_at("Certificate.tbsCertificate.issuer", oids::ISSUER_ALTERNATIVE_NAME, idx)
    }

    /// Like [`issuer`](Certificate::issuer) for the subject and the
    /// SubjectAltName extension.
    pub fn subject(&self, idx: usize) -> Result<Option<String>> {
        self.name_at(
            "Certificate.tbsCertificate.subject",
            oids::SUBJECT_ALTERNATIVE_NAME,
            idx,
        )
    }

    fn name_at(&self, dn_path: &'static str, alt_oid: &str, idx: usize) -> Result<Option<String>> {
        if idx == 0 {
            let tree = self.tree()?;
            let node = find(tree, tree.root(), dn_path)
                .filter(|&n| tree.is_present(n))
                .ok_or(CertError::ValueNotFound(dn_path))?;
            return Ok(Some(dn_to_string(tree, node)?));
        }

        let Some(content) = self.extension_content(alt_oid)? else {
            return Ok(None);
        };
        let names = decode(modules::x509(), "GeneralNames", content)
            .map_err(|_| CertError::InvalidData("alternative name extension"))?;
        let formatted = general_names_strings(&names, names.root())?;
        Ok(formatted.into_iter().nth(idx - 1))
    }

    /// `notBefore` as a 15-character ISO-like timestamp.
    pub fn valid_not_before(&self) -> Result<IsoTime> {
        self.validity_time("notBefore")
    }

    /// `notAfter` as a 15-character ISO-like timestamp.
    pub fn valid_not_after(&self) -> Result<IsoTime> {
        self.validity_time("notAfter")
    }

    fn validity_time(&self, field: &'static str) -> Result<IsoTime> {
        let tree = self.tree()?;
        let validity = find(tree, tree.root(), "Certificate.tbsCertificate.validity")
            .filter(|&n| tree.is_present(n))
            .ok_or(CertError::NoData)?;
        let time = tree
            .children(validity)
            .find(|&c| tree.name(c) == Some(field))
            .ok_or(CertError::ValueNotFound(field))?;

        for alt in tree.children(time) {
            if !tree.is_present(alt) {
                continue;
            }
            let content = tree.content(alt).ok_or(CertError::InvalidData("time value"))?;
            return Ok(match tree.name(alt) {
                Some("utcTime") => IsoTime::from_utc_time(content)?,
                Some("generalTime") => IsoTime::from_generalized_time(content)?,
                _ => return Err(CertError::InvalidData("time value")),
            });
        }
        Err(CertError::ValueNotFound(field))
    }

    /// The subject public key as a canonical `(public-key ...)` S-expression.
    pub fn public_key(&self) -> Result<Vec<u8>> {
        let node = self.mandatory("Certificate.tbsCertificate.subjectPublicKeyInfo")?;
        let tree = self.tree()?;
        let span = tree
            .tlv_span(node)
            .ok_or(CertError::ValueNotFound("subjectPublicKeyInfo"))?;
        Ok(keyinfo::spki_to_sexp(span)?)
    }

    /// The certificate signature as a canonical `(sig-val ...)` S-expression.
    pub fn sig_val(&self) -> Result<Vec<u8>> {
        let alg = self.mandatory("Certificate.signatureAlgorithm")?;
        let val = self.mandatory("Certificate.signatureValue")?;
        let tree = self.tree()?;

        let alg_off = tree.offset(alg).ok_or(CertError::ValueNotFound("signatureAlgorithm"))?;
        let val_off = tree.offset(val).ok_or(CertError::ValueNotFound("signatureValue"))?;
        let end = val_off + tree.header_len(val) + tree.content_len(val);
        let span = tree
            .image()
            .get(alg_off..end)
            .ok_or(CertError::InvalidData("signature"))?;
        Ok(keyinfo::sigval_to_sexp(span)?)
    }

    /// Enumerates extensions in certificate order; past the last one, `Eof`
    /// (and `Eof` again on every further call).
    pub fn extension(&self, idx: usize) -> Result<ExtensionInfo> {
        let tree = self.tree()?;
        let Some(exts) = self.extensions_node()? else {
            return Err(CertError::Eof);
        };
        let ext = tree.children(exts).nth(idx).ok_or(CertError::Eof)?;
        self.extension_info(ext)
    }

    fn extensions_node(&self) -> Result<Option<NodeId>> {
        let tree = self.tree()?;
        Ok(find(tree, tree.root(), "Certificate.tbsCertificate.extensions")
            .filter(|&n| tree.is_present(n)))
    }

    fn extension_info(&self, ext: NodeId) -> Result<ExtensionInfo> {
        let tree = self.tree()?;
        let mut kids = tree.children(ext);
        let id_node = kids.next().ok_or(CertError::InvalidData("extension"))?;
        let critical_node = kids.next().ok_or(CertError::InvalidData("extension"))?;
        let value_node = kids.next().ok_or(CertError::InvalidData("extension"))?;

        let oid = oids::from_der(
            tree.content(id_node)
                .ok_or(CertError::InvalidData("extension"))?,
        )
        .ok_or(CertError::InvalidData("extension"))?;

        let critical = match tree.content(critical_node) {
            Some(content) => content.first().copied().unwrap_or(0) != 0,
            None => false, // DEFAULT FALSE
        };

        let off = tree
            .offset(value_node)
            .ok_or(CertError::InvalidData("extension"))?;
        Ok(ExtensionInfo {
            oid,
            critical,
            off: off + tree.header_len(value_node),
            len: tree.content_len(value_node),
        })
    }

    /// Content octets of the first extension with the given OID, or `None`.
    fn extension_content(&self, oid: &str) -> Result<Option<Vec<u8>>> {
        let Some(exts) = self.extensions_node()? else {
            return Ok(None);
        };
        let tree = self.tree()?;
        for ext in tree.children(exts) {
            let info = self.extension_info(ext)?;
            if info.oid == oid {
                let content = tree
                    .image()
                    .get(info.off..info.off + info.len)
                    .ok_or(CertError::InvalidData("extension"))?;
                return Ok(Some(content.to_vec()));
            }
        }
        Ok(None)
    }

    /// BasicConstraints: `(is_ca, path_len)`, `(false, 0)` when the extension
    /// is absent, `path_len` 0 when unconstrained.
    pub fn is_ca(&self) -> Result<(bool, u64)> {
        let Some(content) = self.extension_content(oids::BASIC_CONSTRAINTS)? else {
            return Ok((false, 0));
        };
        let bc = decode(modules::x509(), "BasicConstraints", content)
            .map_err(|_| CertError::InvalidData("basic constraints"))?;
        let root = bc.root();

        let ca = bc
            .children(root)
            .find(|&c| bc.name(c) == Some("cA"))
            .and_then(|c| bc.content(c))
            .map(|content| content.first().copied().unwrap_or(0) != 0)
            .unwrap_or(false);

        let path_len = match bc
            .children(root)
            .find(|&c| bc.name(c) == Some("pathLenConstraint"))
            .and_then(|c| bc.content(c))
        {
            Some(content) => integer_to_u64(content).ok_or(CertError::InvalidData("basic constraints"))?,
            None => 0,
        };

        Ok((ca, path_len))
    }

    /// KeyUsage flags; `NoData` when the extension is absent.
    pub fn key_usage(&self) -> Result<KeyUsage> {
        let content = self
            .extension_content(oids::KEY_USAGE)?
            .ok_or(CertError::NoData)?;
        let ku = decode(modules::x509(), "KeyUsage", content)
            .map_err(|_| CertError::InvalidData("key usage"))?;
        let bits = ku
            .content(ku.root())
            .ok_or(CertError::InvalidData("key usage"))?;
        KeyUsage::from_bit_string(bits)
    }

    /// CertificatePolicies as newline-separated `OID [qualifier,...]` lines;
    /// `NoData` when absent.
    pub fn cert_policies(&self) -> Result<String> {
        let content = self
            .extension_content(oids::CERTIFICATE_POLICIES)?
            .ok_or(CertError::NoData)?;
        let policies = decode(modules::x509(), "CertificatePolicies", content)
            .map_err(|_| CertError::InvalidData("certificate policies"))?;
        let root = policies.root();

        let mut lines = Vec::new();
        for policy in policies.children(root) {
            let oid_node = policies
                .first_child(policy)
                .ok_or(CertError::InvalidData("certificate policies"))?;
            let oid = oids::from_der(
                policies
                    .content(oid_node)
                    .ok_or(CertError::InvalidData("certificate policies"))?,
            )
            .ok_or(CertError::InvalidData("certificate policies"))?;

            let mut line = oid;
            if let Some(qualifiers) = policies
                .children(policy)
                .find(|&c| policies.name(c) == Some("policyQualifiers"))
                .filter(|&c| policies.is_present(c))
            {
                let mut quals = Vec::new();
                for qual in policies.children(qualifiers) {
                    let qual_oid_node = policies
                        .first_child(qual)
                        .ok_or(CertError::InvalidData("certificate policies"))?;
                    let qual_oid = oids::from_der(
                        policies
                            .content(qual_oid_node)
                            .ok_or(CertError::InvalidData("certificate policies"))?,
                    )
                    .ok_or(CertError::InvalidData("certificate policies"))?;
                    quals.push(qual_oid);
                }
                if !quals.is_empty() {
                    line.push(' ');
                    line.push_str(&quals.join(","));
                }
            }
            lines.push(line);
        }

        Ok(lines.join("\n"))
    }

    /// AuthorityKeyIdentifier: `(key_identifier, issuer_names, serial)`;
    /// `NoData` when absent. The serial uses the same length-prefixed shape
    /// as [`serial`](Certificate::serial).
    #[allow(clippy::type_complexity)]
    pub fn auth_key_id(&self) -> Result<(Option<Vec<u8>>, Vec<String>, Option<Vec<u8>>)> {
        let content = self
            .extension_content(oids::AUTHORITY_KEY_IDENTIFIER)?
            .ok_or(CertError::NoData)?;
        let aki = decode(modules::x509(), "AuthorityKeyIdentifier", content)
            .map_err(|_| CertError::InvalidData("authority key identifier"))?;
        let root = aki.root();

        let key_id = aki
            .children(root)
            .find(|&c| aki.name(c) == Some("keyIdentifier"))
            .and_then(|c| aki.content(c))
            .map(|c| c.to_vec());

        let names = match aki
            .children(root)
            .find(|&c| aki.name(c) == Some("authorityCertIssuer"))
            .filter(|&c| aki.is_present(c))
        {
            Some(node) => general_names_strings(&aki, node)?,
            None => Vec::new(),
        };

        let serial = aki
            .children(root)
            .find(|&c| aki.name(c) == Some("authorityCertSerialNumber"))
            .and_then(|c| aki.content(c))
            .map(length_prefixed);

        Ok((key_id, names, serial))
    }

    /// SubjectKeyIdentifier content octets; `NoData` when absent.
    pub fn subject_key_identifier(&self) -> Result<Vec<u8>> {
        let content = self
            .extension_content(oids::SUBJECT_KEY_IDENTIFIER)?
            .ok_or(CertError::NoData)?;
        let ski = decode(modules::x509(), "SubjectKeyIdentifier", content)
            .map_err(|_| CertError::InvalidData("subject key identifier"))?;
        let octets = ski
            .content(ski.root())
            .ok_or(CertError::InvalidData("subject key identifier"))?;
        Ok(octets.to_vec())
    }

    /// Enumerates CRL distribution points: `(names, reason_flags,
    /// crl_issuer_names)`. `NoData` when the extension is absent, `Eof` past
    /// the last point. Reason flags use the RFC 5280 §5.3.1 layout, bit `n`
    /// mapping to `1 << n`.
    #[allow(clippy::type_complexity)]
    pub fn crl_dist_point(&self, idx: usize) -> Result<(Vec<String>, u32, Vec<String>)> {
        let content = self
            .extension_content(oids::CRL_DISTRIBUTION_POINTS)?
            .ok_or(CertError::NoData)?;
        let points = decode(modules::x509(), "CRLDistributionPoints", content)
            .map_err(|_| CertError::InvalidData("crl distribution points"))?;
        let root = points.root();
        let point = points.children(root).nth(idx).ok_or(CertError::Eof)?;

        let mut names = Vec::new();
        if let Some(dp_name) = points
            .children(point)
            .find(|&c| points.name(c) == Some("distributionPoint"))
            .filter(|&c| points.is_present(c))
        {
            for alt in points.children(dp_name) {
                if !points.is_present(alt) {
                    continue;
                }
                match points.name(alt) {
                    Some("fullName") => names.extend(general_names_strings(&points, alt)?),
                    Some("nameRelativeToCRLIssuer") => {
                        names.push(crate::name::rdn_to_string(&points, alt)?)
                    }
                    _ => {}
                }
            }
        }

        let reasons = match points
            .children(point)
            .find(|&c| points.name(c) == Some("reasons"))
            .and_then(|c| points.content(c))
        {
            Some(bits) => KeyUsage::from_bit_string(bits)?.bits(),
            None => 0,
        };

        let issuer_names = match points
            .children(point)
            .find(|&c| points.name(c) == Some("cRLIssuer"))
            .filter(|&c| points.is_present(c))
        {
            Some(node) => general_names_strings(&points, node)?,
            None => Vec::new(),
        };

        Ok((names, reasons, issuer_names))
    }
}

fn length_prefixed(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + content.len());
    out.extend_from_slice(&(content.len() as u32).to_be_bytes());
    out.extend_from_slice(content);
    out
}

/// Big-endian unsigned value of INTEGER content octets.
fn integer_to_u64(content: &[u8]) -> Option<u64> {
    let stripped = match content.split_first() {
        Some((0, rest)) if !rest.is_empty() => rest,
        _ => content,
    };
    if stripped.len() > 8 || stripped.first().is_some_and(|&b| b & 0x80 != 0) {
        return None;
    }
    let mut value = 0u64;
    for &b in stripped {
        value = value << 8 | u64::from(b);
    }
    Some(value)
}

/// Formats the representable members of a GeneralNames subtree in order.
pub(crate) fn general_names_strings(tree: &ValueTree, node: NodeId) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for general_name in tree.children(node) {
        for alt in tree.children(general_name) {
            if !tree.is_present(alt) {
                continue;
            }
            let formatted = match tree.name(alt) {
                Some("rfc822Name") => {
                    let text = text_content(tree, alt)?;
                    Some(format!("<{text}>"))
                }
                Some("dNSName") | Some("uniformResourceIdentifier") => {
                    Some(text_content(tree, alt)?)
                }
                Some("directoryName") => Some(dn_to_string(tree, alt)?),
                Some("iPAddress") => {
                    let octets = tree.content(alt).ok_or(CertError::InvalidData("general name"))?;
                    Some(format_ip(octets))
                }
                Some("registeredID") => {
                    let content =
                        tree.content(alt).ok_or(CertError::InvalidData("general name"))?;
                    Some(oids::from_der(content).ok_or(CertError::InvalidData("general name"))?)
                }
                // otherName, x400Address, ediPartyName have no string form
                _ => None,
            };
            if let Some(formatted) = formatted {
                out.push(formatted);
            }
        }
    }
    Ok(out)
}

fn text_content(tree: &ValueTree, id: NodeId) -> Result<String> {
    let content = tree.content(id).ok_or(CertError::InvalidData("general name"))?;
    String::from_utf8(content.to_vec()).map_err(|_| CertError::InvalidData("general name"))
}

fn format_ip(octets: &[u8]) -> String {
    if octets.len() == 4 {
        format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
    } else {
        octets.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
    }
}
