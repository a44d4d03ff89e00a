//! CMS `SignedData` engine (RFC 2630).
//!
//! A [`CmsContext`] drives either a parse or a build of a `SignedData`
//! stream as a resumable state machine: each call to [`parse`] or [`build`]
//! performs one step and yields a [`StopReason`] telling the caller what to
//! do before re-entering (install a hash function, write the payload, sign
//! the attributes). The context never hashes or signs by itself.
//!
//! [`parse`]: CmsContext::parse
//! [`build`]: CmsContext::build

use crate::cert::{Certificate, CertError};
use crate::keyinfo::{self, KeyInfoError};
use crate::name::dn_to_string;
use crate::{modules, oids};
use rasna_asn1::ber::{read_tl_from, write_tl, write_end_tag, Length, TlHeader};
use rasna_asn1::decode::decode;
use rasna_asn1::encode::{copy_tree, encode, store_any_raw, store_integer, store_octet_string, store_oid};
use rasna_asn1::path::{find, find_type_value};
use rasna_asn1::schema::SchemaType;
use rasna_asn1::tree::{NodeId, ValueTree};
use rasna_asn1::{Asn1Error, Tag, TagClass};
use std::io::{Read, Write};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CmsError>;

#[derive(Debug, Error)]
pub enum CmsError {
    #[error("unknown CMS object")]
    UnknownCmsObject,

    #[error("unsupported CMS object")]
    UnsupportedCmsObject,

    #[error("not implemented")]
    NotImplemented,

    #[error("invalid state for this operation")]
    InvalidState,

    /// A collaborator (writer, hash function, digest, signature...) required by
    /// the next transition has not been supplied.
    #[error("missing action")]
    MissingAction,

    #[error("already set")]
    Conflict,

    #[error("invalid value")]
    InvalidValue,

    #[error("invalid index")]
    InvalidIndex,

    /// No parsed data is available yet.
    #[error("no data")]
    NoData,

    /// The requested element was not selected or produced.
    #[error("no value")]
    NoValue,

    #[error("mandatory element `{0}` not found")]
    ValueNotFound(&'static str),

    #[error("duplicate value")]
    DuplicateValue,

    #[error("invalid CMS object")]
    InvalidCmsObject,

    /// An invariant that holds for well-formed input was violated.
    #[error("internal consistency failure")]
    Bug,

    #[error(transparent)]
    Asn1(#[from] Asn1Error),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    KeyInfo(#[from] KeyInfoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the machine stopped and what the caller must do to resume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    Running,
    GotContent,
    /// Detached signature: hash the external content at your leisure.
    NeedHash,
    BeginData,
    EndData,
    NeedSig,
    Ready,
}

/// CMS content types the engine recognizes by OID.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Data,
    SignedData,
    EnvelopedData,
    DigestedData,
    EncryptedData,
    AuthData,
}

/// Whether handlers exist for a content type. Only `SignedData` is driven;
/// the other registered types are recognized but yield `NotImplemented`
/// (handler present, empty) or `UnsupportedCmsObject` (no handler).
struct ContentEntry {
    oid: &'static str,
    ty: ContentType,
    has_handlers: bool,
}

const CONTENT_TABLE: &[ContentEntry] = &[
    ContentEntry { oid: oids::DATA, ty: ContentType::Data, has_handlers: true },
    ContentEntry { oid: oids::SIGNED_DATA, ty: ContentType::SignedData, has_handlers: true },
    ContentEntry { oid: oids::ENVELOPED_DATA, ty: ContentType::EnvelopedData, has_handlers: true },
    ContentEntry { oid: oids::DIGESTED_DATA, ty: ContentType::DigestedData, has_handlers: true },
    ContentEntry { oid: oids::ENCRYPTED_DATA, ty: ContentType::EncryptedData, has_handlers: true },
    ContentEntry { oid: oids::AUTH_DATA, ty: ContentType::AuthData, has_handlers: false },
];

fn entry_by_oid(oid: &str) -> Option<&'static ContentEntry> {
    CONTENT_TABLE.iter().find(|e| e.oid == oid)
}

fn entry_by_type(ty: ContentType) -> &'static ContentEntry {
    CONTENT_TABLE
        .iter()
        .find(|e| e.ty == ty)
        .expect("every content type is registered")
}

/// Caller-supplied hash capability; fed zero or more chunks per operation.
pub trait DigestSink {
    fn update(&mut self, data: &[u8]);
}

impl<F: FnMut(&[u8])> DigestSink for F {
    fn update(&mut self, data: &[u8]) {
        self(data)
    }
}

/// One signer being assembled for a build.
struct Signer {
    cert: Certificate,
    message_digest: Option<Vec<u8>>,
    signature: Option<(keyinfo::Algorithm, Vec<u8>)>,
    /// Partial `SignerInfos` tree carrying this signer's signedAttrs,
    /// encoded so the attributes can be hashed before the final emit.
    attrs: Option<ValueTree>,
}

/// State the parser carries across invocations.
struct ParseState {
    src: BerStream,
    /// Attached eContent still to be streamed through the hash.
    econtent_pending: bool,
    /// The `encapContentInfo` SEQUENCE used an indefinite length.
    encap_indefinite: bool,
}

#[derive(Default)]
pub struct CmsContext {
    reader: Option<Box<dyn Read>>,
    writer: Option<Box<dyn Write>>,
    hash: Option<Box<dyn DigestSink>>,

    content_type: Option<ContentType>,
    content_oid: Option<String>,
    encap_type: Option<String>,
    digest_algos: Vec<String>,

    signers: Vec<Signer>,
    parsed_certs: Vec<Option<Certificate>>,
    signer_info: Option<ValueTree>,
    signer_digest_algo: std::cell::OnceCell<String>,

    detached_signature: bool,
    stop_reason: Option<StopReason>,
    parse_state: Option<ParseState>,
}

impl CmsContext {
    pub fn new() -> CmsContext {
        CmsContext::default()
    }

    /// Attaches the input stream. `Conflict` when already attached.
    pub fn set_reader(&mut self, reader: impl Read + 'static) -> Result<()> {
        if self.reader.is_some() || self.parse_state.is_some() {
            return Err(CmsError::Conflict);
        }
        self.reader = Some(Box::new(reader));
        Ok(())
    }

    /// Attaches the output stream. `Conflict` when already attached.
    pub fn set_writer(&mut self, writer: impl Write + 'static) -> Result<()> {
        if self.writer.is_some() {
            return Err(CmsError::Conflict);
        }
        self.writer = Some(Box::new(writer));
        Ok(())
    }

    /// Installs the hash capability used for content hashing and
    /// [`hash_signed_attrs`](CmsContext::hash_signed_attrs).
    pub fn set_hash_function(&mut self, sink: impl DigestSink + 'static) {
        self.hash = Some(Box::new(sink));
    }

    /// Sets the outer (`what == 0`) or encapsulated (`what == 1`) content
    /// type for a build.
    pub fn set_content_type(&mut self, what: usize, ty: ContentType) -> Result<()> {
        if what > 1 {
            return Err(CmsError::InvalidValue);
        }
        let entry = entry_by_type(ty);
        if !entry.has_handlers {
            return Err(CmsError::UnsupportedCmsObject);
        }
        if what == 0 {
            self.content_type = Some(ty);
            self.content_oid = Some(entry.oid.to_owned());
        } else {
            self.encap_type = Some(entry.oid.to_owned());
        }
        Ok(())
    }

    /// Appends a digest algorithm OID (dotted string) for a build.
    pub fn add_digest_algo(&mut self, oid: &str) -> Result<()> {
        if oids::to_der(oid).is_none() {
            return Err(CmsError::InvalidValue);
        }
        self.digest_algos.push(oid.to_owned());
        Ok(())
    }

    /// Adds a signer certificate. Signers are indexed in insertion order.
    pub fn add_signer(&mut self, cert: Certificate) -> Result<()> {
        cert.tree()?; // must be initialized
        self.signers.push(Signer {
            cert,
            message_digest: None,
            signature: None,
            attrs: None,
        });
        Ok(())
    }

    /// Deposits the precomputed content digest of signer `idx`.
    pub fn set_message_digest(&mut self, idx: usize, digest: &[u8]) -> Result<()> {
        if digest.is_empty() {
            return Err(CmsError::InvalidValue);
        }
        let signer = self.signers.get_mut(idx).ok_or(CmsError::InvalidIndex)?;
        signer.message_digest = Some(digest.to_vec());
        Ok(())
    }

    /// Deposits the signature of signer `idx` as a `(sig-val ...)`
    /// S-expression, replacing any previous value.
    pub fn set_sig_val(&mut self, idx: usize, sexp: &[u8]) -> Result<()> {
        let parsed = keyinfo::sexp_to_sigval(sexp)?;
        let signer = self.signers.get_mut(idx).ok_or(CmsError::InvalidIndex)?;
        signer.signature = Some(parsed);
        Ok(())
    }

    /// Outer (`what == 0`) or encapsulated (`what == 1`) content type.
    pub fn content_type(&self, what: usize) -> Option<ContentType> {
        match what {
            0 => self.content_type,
            1 => self
                .encap_type
                .as_deref()
                .and_then(entry_by_oid)
                .map(|e| e.ty),
            _ => None,
        }
    }

    /// Outer or encapsulated content OID as a dotted string.
    pub fn content_oid(&self, what: usize) -> Option<&str> {
        match what {
            0 => self.content_oid.as_deref(),
            1 => self.encap_type.as_deref(),
            _ => None,
        }
    }

    /// Enumerates the digest algorithm OIDs seen or added so far.
    pub fn digest_algo_list(&self, idx: usize) -> Option<&str> {
        self.digest_algos.get(idx).map(String::as_str)
    }

    /// Digest algorithm of signer 0 (cached). Only the first signer is
    /// addressable here, matching the engine's single-signer read surface.
    pub fn signer_digest_algo(&self, idx: usize) -> Result<String> {
        if idx != 0 {
            return Err(CmsError::InvalidIndex);
        }
        if let Some(cached) = self.signer_digest_algo.get() {
            return Ok(cached.clone());
        }
        let tree = self.signer_info.as_ref().ok_or(CmsError::NoData)?;
        let node = find(tree, tree.root(), "SignerInfos..digestAlgorithm.algorithm")
            .filter(|&n| tree.is_present(n))
            .ok_or(CmsError::NoValue)?;
        let oid = oids::from_der(tree.content(node).ok_or(CmsError::NoValue)?)
            .ok_or(CmsError::InvalidCmsObject)?;
        let _ = self.signer_digest_algo.set(oid.clone());
        Ok(oid)
    }

    /// Issuer DN and length-prefixed serial of the first signer.
    pub fn issuer_serial(&self, idx: usize) -> Result<(String, Vec<u8>)> {
        if idx != 0 {
            return Err(CmsError::InvalidIndex);
        }
        let tree = self.signer_info.as_ref().ok_or(CmsError::NoData)?;

        let issuer = find(tree, tree.root(), "SignerInfos..sid.issuerAndSerialNumber.issuer")
            .filter(|&n| tree.is_present(n))
            .ok_or(CmsError::NoValue)?;
        let dn = dn_to_string(tree, issuer).map_err(|_| CmsError::InvalidCmsObject)?;

        let serial = find(
            tree,
            tree.root(),
            "SignerInfos..sid.issuerAndSerialNumber.serialNumber",
        )
        .filter(|&n| tree.is_present(n))
        .ok_or(CmsError::NoValue)?;
        let content = tree.content(serial).ok_or(CmsError::NoValue)?;

        Ok((dn, length_prefixed(content)))
    }

    /// The messageDigest attribute of signer 0, or `None` when the signer
    /// carries no signed attributes.
    pub fn message_digest(&self, idx: usize) -> Result<Option<Vec<u8>>> {
        if idx != 0 {
            return Err(CmsError::NotImplemented);
        }
        let tree = self.signer_info.as_ref().ok_or(CmsError::NoData)?;
        let Some(attrs) = find(tree, tree.root(), "SignerInfos..signedAttrs")
            .filter(|&n| tree.is_present(n))
        else {
            return Ok(None);
        };

        let md_oid = oids::der_bytes(oids::message_digest());
        let attr = find_type_value(tree, attrs, 0, &md_oid)
            .ok_or(CmsError::ValueNotFound("messageDigest attribute"))?;
        if find_type_value(tree, attrs, 1, &md_oid).is_some() {
            return Err(CmsError::DuplicateValue);
        }

        // the value is a SET OF holding exactly one OCTET STRING (RFC 2630 11.2)
        let values = tree
            .first_child(attr)
            .and_then(|first| tree.next_sibling(first))
            .ok_or(CmsError::InvalidCmsObject)?;
        if tree.ty(values) != SchemaType::SetOf {
            return Err(CmsError::InvalidCmsObject);
        }
        let mut items = tree.children(values);
        let value = items.next().ok_or(CmsError::InvalidCmsObject)?;
        if items.next().is_some() || tree.value_type(value) != Some(Tag::OCTET_STRING) {
            return Err(CmsError::InvalidCmsObject);
        }
        let content = tree.content(value).ok_or(CmsError::Bug)?;
        Ok(Some(content.to_vec()))
    }

    /// The signature of signer 0 as a `(sig-val ...)` S-expression.
    pub fn sig_val(&self, idx: usize) -> Result<Vec<u8>> {
        if idx != 0 {
            return Err(CmsError::InvalidIndex);
        }
        let tree = self.signer_info.as_ref().ok_or(CmsError::NoData)?;

        let alg = find(tree, tree.root(), "SignerInfos..signatureAlgorithm")
            .filter(|&n| tree.is_present(n))
            .ok_or(CmsError::NoValue)?;
        let sig = find(tree, tree.root(), "SignerInfos..signature")
            .filter(|&n| tree.is_present(n))
            .ok_or(CmsError::NoValue)?;

        let alg_off = tree.offset(alg).ok_or(CmsError::Bug)?;
        let sig_off = tree.offset(sig).ok_or(CmsError::Bug)?;
        let end = sig_off + tree.header_len(sig) + tree.content_len(sig);
        let span = tree.image().get(alg_off..end).ok_or(CmsError::Bug)?;
        Ok(keyinfo::sigval_to_sexp(span)?)
    }

    /// Hands out certificate `idx` gathered during a parse. Each certificate
    /// can be taken once.
    pub fn take_cert(&mut self, idx: usize) -> Option<Certificate> {
        self.parsed_certs.get_mut(idx)?.take()
    }

    /// Hashes the DER of signer `idx`'s signed attributes through the
    /// installed hash function, with the leading implicit `[0]` tag replaced
    /// by the SET tag `0x31` (RFC 2630 §5.4). Exactly one callback is made.
    pub fn hash_signed_attrs(&mut self, idx: usize) -> Result<()> {
        let hash = self.hash.as_mut().ok_or(CmsError::MissingAction)?;

        let tree = match &self.signer_info {
            Some(tree) => {
                if idx != 0 {
                    return Err(CmsError::InvalidIndex);
                }
                tree
            }
            None => self
                .signers
                .get(idx)
                .ok_or(CmsError::InvalidIndex)?
                .attrs
                .as_ref()
                .ok_or(CmsError::NoValue)?,
        };

        let node = find(tree, tree.root(), "SignerInfos..signedAttrs")
            .filter(|&n| tree.is_present(n))
            .ok_or(CmsError::NoValue)?;
        let off = tree.offset(node).ok_or(CmsError::NoValue)?;
        let total = tree.header_len(node) + tree.content_len(node);
        let rest = tree
            .image()
            .get(off + 1..off + total)
            .ok_or(CmsError::Bug)?;

        let mut buf = Vec::with_capacity(total);
        buf.push(0x31);
        buf.extend_from_slice(rest);
        hash.update(&buf);
        Ok(())
    }

    /// Whether the message carries no encapsulated content.
    pub fn detached_signature(&self) -> bool {
        self.detached_signature
    }

    // -- parsing ---------------------------------------------------------

    /// Performs one parse step and returns the new stop reason.
    pub fn parse(&mut self) -> Result<StopReason> {
        match self.stop_reason {
            None => {
                let reader = self.reader.take().ok_or(CmsError::MissingAction)?;
                let mut src = BerStream::new(reader);
                self.parse_content_info(&mut src)?;
                self.parse_state = Some(ParseState {
                    src,
                    econtent_pending: false,
                    encap_indefinite: false,
                });
                self.stop_reason = Some(StopReason::GotContent);
            }
            Some(_) => match self.content_type {
                Some(ContentType::SignedData) => self.parse_signed_data_step()?,
                Some(ContentType::AuthData) | None => return Err(CmsError::UnsupportedCmsObject),
                Some(_) => return Err(CmsError::NotImplemented),
            },
        }
        Ok(self.stop_reason.unwrap_or(StopReason::Running))
    }

    /// Outer `ContentInfo` up to and including the `[0]` wrapper.
    fn parse_content_info(&mut self, src: &mut BerStream) -> Result<()> {
        let h = src.read_tl()?;
        if h.tag() != Tag::SEQUENCE || !h.constructed {
            return Err(CmsError::InvalidCmsObject);
        }

        let (oid_h, oid_tlv, _) = src.read_tlv()?;
        if oid_h.tag() != Tag::OID || oid_h.constructed {
            return Err(CmsError::InvalidCmsObject);
        }
        let oid_len = oid_h.length.definite().map_err(CmsError::Asn1)?;
        let oid = oids::from_der(&oid_tlv[oid_tlv.len() - oid_len..])
            .ok_or(CmsError::InvalidCmsObject)?;

        let entry = entry_by_oid(&oid).ok_or(CmsError::UnknownCmsObject)?;
        if !entry.has_handlers {
            return Err(CmsError::UnsupportedCmsObject);
        }
        self.content_oid = Some(oid);
        self.content_type = Some(entry.ty);

        let h = src.read_tl()?;
        if h.tag() != Tag::context(0) || !h.constructed {
            return Err(CmsError::InvalidCmsObject);
        }
        Ok(())
    }

    fn parse_signed_data_step(&mut self) -> Result<()> {
        let prev = self.stop_reason.replace(StopReason::Running).ok_or(CmsError::Bug)?;

        enum Step {
            Start,
            InData,
            GotHash,
        }
        let step = match prev {
            StopReason::GotContent => Step::Start,
            StopReason::NeedHash => Step::GotHash,
            StopReason::BeginData => {
                if self.hash.is_none() {
                    return Err(CmsError::MissingAction);
                }
                Step::InData
            }
            StopReason::EndData => Step::GotHash,
            StopReason::Running => return Err(CmsError::InvalidState),
            _ => return Err(CmsError::Bug),
        };

        match step {
            Step::Start => {
                self.parse_signed_data_part1()?;
                self.stop_reason = Some(if self.detached_signature {
                    StopReason::NeedHash
                } else {
                    StopReason::BeginData
                });
            }
            Step::InData => {
                self.parse_stream_econtent()?;
                self.stop_reason = Some(StopReason::EndData);
            }
            Step::GotHash => {
                self.parse_signed_data_part2()?;
                self.stop_reason = Some(StopReason::Ready);
            }
        }
        Ok(())
    }

    /// `version`, `digestAlgorithms`, and `encapContentInfo` headers.
    fn parse_signed_data_part1(&mut self) -> Result<()> {
        let state = self.parse_state.as_mut().ok_or(CmsError::Bug)?;
        let src = &mut state.src;

        let h = src.read_tl()?;
        if h.tag() != Tag::SEQUENCE || !h.constructed {
            return Err(CmsError::InvalidCmsObject);
        }

        let (version_h, _, _) = src.read_tlv()?;
        if version_h.tag() != Tag::INTEGER {
            return Err(CmsError::InvalidCmsObject);
        }

        let (algos_h, algos_tlv, _) = src.read_tlv()?;
        if algos_h.tag() != Tag::SET {
            return Err(CmsError::InvalidCmsObject);
        }
        let algos = decode(modules::cms(), "DigestAlgorithmIdentifiers", algos_tlv)
            .map_err(|_| CmsError::InvalidCmsObject)?;
        for item in algos.children(algos.root()) {
            let oid_node = algos.first_child(item).ok_or(CmsError::InvalidCmsObject)?;
            let oid = oids::from_der(algos.content(oid_node).ok_or(CmsError::InvalidCmsObject)?)
                .ok_or(CmsError::InvalidCmsObject)?;
            self.digest_algos.push(oid);
        }

        // encapContentInfo
        let encap_h = src.read_tl()?;
        if encap_h.tag() != Tag::SEQUENCE || !encap_h.constructed {
            return Err(CmsError::InvalidCmsObject);
        }
        let (etype_h, etype_tlv, etype_consumed) = src.read_tlv()?;
        if etype_h.tag() != Tag::OID || etype_h.constructed {
            return Err(CmsError::InvalidCmsObject);
        }
        let etype_len = etype_h.length.definite().map_err(CmsError::Asn1)?;
        self.encap_type = Some(
            oids::from_der(&etype_tlv[etype_tlv.len() - etype_len..])
                .ok_or(CmsError::InvalidCmsObject)?,
        );

        let has_econtent = match encap_h.length {
            Length::Definite(len) => len > etype_consumed,
            Length::Indefinite => {
                let next = src.peek_tl()?;
                if next.is_end_of_contents() {
                    src.skip(2)?;
                    false
                } else {
                    true
                }
            }
        };

        state.encap_indefinite = encap_h.length == Length::Indefinite && has_econtent;
        state.econtent_pending = has_econtent;
        self.detached_signature = !has_econtent;
        Ok(())
    }

    /// Streams the attached eContent octets through the hash function.
    fn parse_stream_econtent(&mut self) -> Result<()> {
        let state = self.parse_state.as_mut().ok_or(CmsError::Bug)?;
        if !state.econtent_pending {
            return Err(CmsError::Bug);
        }
        let hash = self.hash.as_mut().ok_or(CmsError::MissingAction)?;
        let src = &mut state.src;

        let wrapper = src.read_tl()?;
        if wrapper.tag() != Tag::context(0) || !wrapper.constructed {
            return Err(CmsError::InvalidCmsObject);
        }
        hash_octet_region(src, hash.as_mut(), wrapper.length)?;

        if state.encap_indefinite {
            let h = src.read_tl()?;
            if !h.is_end_of_contents() {
                return Err(CmsError::InvalidCmsObject);
            }
        }
        state.econtent_pending = false;
        Ok(())
    }

    /// `certificates`, `crls`, and `signerInfos`.
    fn parse_signed_data_part2(&mut self) -> Result<()> {
        let state = self.parse_state.as_mut().ok_or(CmsError::Bug)?;
        let src = &mut state.src;

        let mut next = src.peek_tl()?;

        if next.tag() == Tag::context(0) && next.constructed {
            let h = src.read_tl()?;
            let mut remaining = h.length;
            loop {
                if region_done(src, &mut remaining)? {
                    break;
                }
                let (_, tlv, consumed) = src.read_tlv()?;
                let cert = Certificate::from_der(&tlv)?;
                self.parsed_certs.push(Some(cert));
                consume_from_region(&mut remaining, consumed);
            }
            next = src.peek_tl()?;
        }

        if next.tag() == Tag::context(1) && next.constructed {
            let h = src.read_tl()?;
            let mut remaining = h.length;
            loop {
                if region_done(src, &mut remaining)? {
                    break;
                }
                let (_, _, consumed) = src.read_tlv()?;
                consume_from_region(&mut remaining, consumed);
            }
            next = src.peek_tl()?;
        }

        if next.tag() != Tag::SET || !next.constructed {
            return Err(CmsError::InvalidCmsObject);
        }
        let (_, infos_tlv, _) = src.read_tlv()?;
        let tree = decode(modules::cms(), "SignerInfos", infos_tlv)
            .map_err(|_| CmsError::InvalidCmsObject)?;
        self.signer_info = Some(tree);
        Ok(())
    }

    // -- building --------------------------------------------------------

    /// Performs one build step and returns the new stop reason.
    pub fn build(&mut self) -> Result<StopReason> {
        match self.stop_reason {
            None => {
                if self.writer.is_none() {
                    return Err(CmsError::MissingAction);
                }
                if self.content_type.is_none() || self.encap_type.is_none() {
                    return Err(CmsError::MissingAction);
                }
                self.stop_reason = Some(StopReason::GotContent);
            }
            Some(_) => match self.content_type {
                Some(ContentType::SignedData) => self.build_signed_data_step()?,
                Some(ContentType::AuthData) | None => return Err(CmsError::UnsupportedCmsObject),
                Some(_) => return Err(CmsError::NotImplemented),
            },
        }
        Ok(self.stop_reason.unwrap_or(StopReason::Running))
    }

    fn build_signed_data_step(&mut self) -> Result<()> {
        let prev = self.stop_reason.replace(StopReason::Running).ok_or(CmsError::Bug)?;

        enum Step {
            Start,
            DataReady,
            GotSig,
        }
        let step = match prev {
            StopReason::GotContent => Step::Start,
            StopReason::BeginData | StopReason::EndData => Step::DataReady,
            StopReason::NeedSig => Step::GotSig,
            StopReason::Running => return Err(CmsError::InvalidState),
            _ => return Err(CmsError::Bug),
        };

        match step {
            Step::Start => {
                // a presupplied digest means nothing is streamed: detached
                self.detached_signature = self
                    .signers
                    .first()
                    .is_some_and(|s| s.message_digest.is_some());
                self.build_signed_data_header()?;
                self.stop_reason = Some(if self.detached_signature {
                    StopReason::EndData
                } else {
                    StopReason::BeginData
                });
            }
            Step::DataReady => {
                self.build_signed_data_attributes()?;
                self.stop_reason = Some(StopReason::NeedSig);
            }
            Step::GotSig => {
                self.build_signed_data_rest()?;
                self.stop_reason = Some(StopReason::Ready);
            }
        }
        Ok(())
    }

    /// Everything up to the encapsulated content: the caller streams the
    /// payload (as OCTET STRING TLVs) right after this step.
    fn build_signed_data_header(&mut self) -> Result<()> {
        let mut out = Vec::new();

        // outer ContentInfo
        write_tl(&mut out, TagClass::Universal, 0x10, true, Length::Indefinite);
        let oid = self
            .content_oid
            .as_deref()
            .and_then(oids::to_der)
            .ok_or(CmsError::Bug)?;
        write_tl(&mut out, TagClass::Universal, 0x06, false, Length::Definite(oid.len()));
        out.extend_from_slice(&oid);
        write_tl(&mut out, TagClass::Context, 0, true, Length::Indefinite);

        // SignedData
        write_tl(&mut out, TagClass::Universal, 0x10, true, Length::Indefinite);
        write_tl(&mut out, TagClass::Universal, 0x02, false, Length::Definite(1));
        out.push(0x03); // CMSVersion 3: certificates and v1 signer infos

        // SET OF DigestAlgorithmIdentifier
        let mut algos = Vec::new();
        for oid_str in &self.digest_algos {
            algos.extend_from_slice(&algorithm_identifier_der(oid_str).ok_or(CmsError::Bug)?);
        }
        write_tl(&mut out, TagClass::Universal, 0x11, true, Length::Definite(algos.len()));
        out.extend_from_slice(&algos);

        // encapsulatedContentInfo
        write_tl(&mut out, TagClass::Universal, 0x10, true, Length::Indefinite);
        let encap_oid = self
            .encap_type
            .as_deref()
            .and_then(oids::to_der)
            .ok_or(CmsError::Bug)?;
        write_tl(&mut out, TagClass::Universal, 0x06, false, Length::Definite(encap_oid.len()));
        out.extend_from_slice(&encap_oid);
        if !self.detached_signature {
            write_tl(&mut out, TagClass::Context, 0, true, Length::Indefinite);
        }

        self.write_out(&out)
    }

    /// Closes the data part and materializes each signer's signedAttrs so
    /// the caller can hash and sign them.
    fn build_signed_data_attributes(&mut self) -> Result<()> {
        let mut out = Vec::new();
        if !self.detached_signature {
            write_end_tag(&mut out); // eContent [0]
        }
        write_end_tag(&mut out); // encapContentInfo SEQUENCE
        self.write_out(&out)?;

        if self.signers.is_empty() || self.digest_algos.is_empty() {
            return Err(CmsError::MissingAction);
        }
        if self.digest_algos.len() < self.signers.len() {
            return Err(CmsError::MissingAction);
        }

        let schema = modules::cms();
        let md_oid = oids::der_bytes(oids::message_digest());

        for signer in &mut self.signers {
            let digest = signer.message_digest.as_deref().ok_or(CmsError::MissingAction)?;

            // the messageDigest attribute
            let mut attr = ValueTree::expand(schema, "Attribute")?;
            let attr_root = attr.root();
            let attr_type = find(&attr, attr_root, "Attribute.attrType").ok_or(CmsError::Bug)?;
            store_oid(&mut attr, attr_type, &md_oid)?;
            let attr_values = find(&attr, attr_root, "Attribute.attrValues").ok_or(CmsError::Bug)?;
            let value = attr.append(attr_values)?;
            store_octet_string(&mut attr, value, digest)?;
            encode(&mut attr)?;

            // partial SignerInfos carrying just the signedAttrs, encoded so
            // that hash_signed_attrs can address it
            let mut partial = ValueTree::expand(schema, "SignerInfos")?;
            let item = partial.append(partial.root())?;
            let signed_attrs = partial
                .children(item)
                .find(|&c| partial.name(c) == Some("signedAttrs"))
                .ok_or(CmsError::Bug)?;
            let slot = partial.append(signed_attrs)?;
            copy_tree(&mut partial, slot, &attr, attr_root)?;
            encode(&mut partial)?;

            signer.attrs = Some(partial);
        }
        Ok(())
    }

    /// Emits `signerInfos` with the caller's signatures and closes every
    /// remaining container.
    fn build_signed_data_rest(&mut self) -> Result<()> {
        if self.digest_algos.len() < self.signers.len() {
            return Err(CmsError::MissingAction);
        }

        let schema = modules::cms();
        let mut infos = Vec::new();

        for (signer, digest_oid) in self.signers.iter().zip(self.digest_algos.clone()) {
            let (sig_algorithm, sig_bytes) = signer
                .signature
                .as_ref()
                .ok_or(CmsError::MissingAction)?
                .clone();

            let mut tree = ValueTree::expand(schema, "SignerInfos")?;
            let root = tree.root();
            tree.append(root)?;

            // version 1: the signer is identified by issuerAndSerialNumber
            let version = find(&tree, root, "SignerInfos..version").ok_or(CmsError::Bug)?;
            store_integer(&mut tree, version, &[0x01])?;

            let sid = find(&tree, root, "SignerInfos..sid").ok_or(CmsError::Bug)?;
            set_issuer_serial(&mut tree, sid, &signer.cert)?;

            let algo = find(&tree, root, "SignerInfos..digestAlgorithm.algorithm")
                .ok_or(CmsError::Bug)?;
            store_oid(&mut tree, algo, &oids::to_der(&digest_oid).ok_or(CmsError::Bug)?)?;
            let params = find(&tree, root, "SignerInfos..digestAlgorithm.parameters")
                .ok_or(CmsError::Bug)?;
            store_any_raw(&mut tree, params, &[0x05, 0x00])?;

            // carry over the attributes built (and hashed) earlier
            let attrs_tree = signer.attrs.as_ref().ok_or(CmsError::Bug)?;
            let src_attrs = find(attrs_tree, attrs_tree.root(), "SignerInfos..signedAttrs")
                .and_then(|n| attrs_tree.first_child(n))
                .ok_or(CmsError::Bug)?;
            let dst_attrs = find(&tree, root, "SignerInfos..signedAttrs").ok_or(CmsError::Bug)?;
            let slot = tree.append(dst_attrs)?;
            copy_tree(&mut tree, slot, attrs_tree, src_attrs)?;

            let sig_algo = find(&tree, root, "SignerInfos..signatureAlgorithm.algorithm")
                .ok_or(CmsError::Bug)?;
            store_oid(
                &mut tree,
                sig_algo,
                &oids::to_der(keyinfo::signature_oid(sig_algorithm)).ok_or(CmsError::Bug)?,
            )?;
            let sig_params = find(&tree, root, "SignerInfos..signatureAlgorithm.parameters")
                .ok_or(CmsError::Bug)?;
            store_any_raw(&mut tree, sig_params, &[0x05, 0x00])?;

            let sig_node = find(&tree, root, "SignerInfos..signature").ok_or(CmsError::Bug)?;
            store_octet_string(&mut tree, sig_node, &sig_bytes)?;

            encode(&mut tree)?;
            let item = tree.first_child(root).ok_or(CmsError::Bug)?;
            let off = tree.offset(item).ok_or(CmsError::Bug)?;
            let total = tree.header_len(item) + tree.content_len(item);
            infos.extend_from_slice(&tree.image()[off..off + total]);
        }

        let mut out = Vec::new();
        write_tl(&mut out, TagClass::Universal, 0x11, true, Length::Definite(infos.len()));
        out.extend_from_slice(&infos);
        write_end_tag(&mut out); // SignedData SEQUENCE
        write_end_tag(&mut out); // ContentInfo [0]
        write_end_tag(&mut out); // ContentInfo SEQUENCE
        self.write_out(&out)
    }

    fn write_out(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(CmsError::MissingAction)?;
        writer.write_all(bytes)?;
        Ok(())
    }
}

/// Copies issuer and serial number from the signer certificate into the
/// `sid.issuerAndSerialNumber` subtree.
fn set_issuer_serial(tree: &mut ValueTree, sid: NodeId, cert: &Certificate) -> Result<()> {
    let cert_tree = cert.tree()?;
    let cert_root = cert_tree.root();

    let src_serial = find(cert_tree, cert_root, "Certificate.tbsCertificate.serialNumber")
        .ok_or(CmsError::ValueNotFound("serialNumber"))?;
    let dst_serial = find(tree, sid, "sid.issuerAndSerialNumber.serialNumber")
        .ok_or(CmsError::Bug)?;
    copy_tree(tree, dst_serial, cert_tree, src_serial)?;

    let src_issuer = find(cert_tree, cert_root, "Certificate.tbsCertificate.issuer")
        .ok_or(CmsError::ValueNotFound("issuer"))?;
    let dst_issuer =
        find(tree, sid, "sid.issuerAndSerialNumber.issuer").ok_or(CmsError::Bug)?;
    copy_tree(tree, dst_issuer, cert_tree, src_issuer)?;

    Ok(())
}

fn length_prefixed(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + content.len());
    out.extend_from_slice(&(content.len() as u32).to_be_bytes());
    out.extend_from_slice(content);
    out
}

/// `AlgorithmIdentifier { oid, NULL }` as DER.
fn algorithm_identifier_der(oid_str: &str) -> Option<Vec<u8>> {
    let oid = oids::to_der(oid_str)?;
    let mut out = Vec::with_capacity(oid.len() + 6);
    write_tl(
        &mut out,
        TagClass::Universal,
        0x10,
        true,
        Length::Definite(oid.len() + 4),
    );
    write_tl(&mut out, TagClass::Universal, 0x06, false, Length::Definite(oid.len()));
    out.extend_from_slice(&oid);
    write_tl(&mut out, TagClass::Universal, 0x05, false, Length::Definite(0));
    Some(out)
}

// -- streaming helpers ---------------------------------------------------

/// Buffered BER source over a reader with header pushback.
struct BerStream {
    reader: Box<dyn Read>,
    pending: Vec<u8>,
}

impl Read for BerStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        self.reader.read(buf)
    }
}

impl BerStream {
    fn new(reader: Box<dyn Read>) -> BerStream {
        BerStream {
            reader,
            pending: Vec::new(),
        }
    }

    fn read_tl(&mut self) -> Result<TlHeader> {
        Ok(read_tl_from(self)?)
    }

    /// Reads the next header and pushes its octets back for re-reading.
    fn peek_tl(&mut self) -> Result<TlHeader> {
        let mut capture = CaptureReader {
            inner: self,
            captured: Vec::new(),
        };
        let result = read_tl_from(&mut capture);
        let captured = capture.captured;
        self.pending.splice(0..0, captured);
        Ok(result?)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        let mut buf = [0u8; 64];
        let mut left = n;
        while left > 0 {
            let take = left.min(buf.len());
            self.read_exact(&mut buf[..take])
                .map_err(|_| CmsError::Asn1(Asn1Error::Truncated))?;
            left -= take;
        }
        Ok(())
    }

    /// Reads one complete TLV. Indefinite lengths are re-framed as definite
    /// in the returned bytes; the third element is the raw count consumed
    /// from the stream.
    fn read_tlv(&mut self) -> Result<(TlHeader, Vec<u8>, usize)> {
        let h = self.read_tl()?;
        match h.length {
            Length::Definite(len) => {
                let mut out = Vec::with_capacity(h.nhdr + len);
                write_tl(&mut out, h.class, h.number, h.constructed, Length::Definite(len));
                let start = out.len();
                out.resize(start + len, 0);
                self.read_exact(&mut out[start..])
                    .map_err(|_| CmsError::Asn1(Asn1Error::Truncated))?;
                Ok((h, out, h.nhdr + len))
            }
            Length::Indefinite => {
                let mut children = Vec::new();
                let mut consumed = h.nhdr;
                loop {
                    let next = self.peek_tl()?;
                    if next.is_end_of_contents() {
                        self.skip(2)?;
                        consumed += 2;
                        break;
                    }
                    let (_, tlv, used) = self.read_tlv()?;
                    children.extend_from_slice(&tlv);
                    consumed += used;
                }
                let mut out = Vec::with_capacity(children.len() + 4);
                write_tl(&mut out, h.class, h.number, true, Length::Definite(children.len()));
                out.extend_from_slice(&children);
                Ok((h, out, consumed))
            }
        }
    }
}

struct CaptureReader<'a> {
    inner: &'a mut BerStream,
    captured: Vec<u8>,
}

impl Read for CaptureReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.captured.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// True when the region (definite remaining count or indefinite) is fully
/// consumed; eats the end-of-contents marker of indefinite regions.
fn region_done(src: &mut BerStream, remaining: &mut Length) -> Result<bool> {
    match remaining {
        Length::Definite(0) => Ok(true),
        Length::Definite(_) => Ok(false),
        Length::Indefinite => {
            if src.peek_tl()?.is_end_of_contents() {
                src.skip(2)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

fn consume_from_region(remaining: &mut Length, consumed: usize) {
    if let Length::Definite(left) = remaining {
        *left = left.saturating_sub(consumed);
    }
}

/// Feeds the OCTET STRING chunks of an eContent region to the hash.
/// Returns the count of stream octets the region occupied, including its
/// end-of-contents marker when indefinite.
fn hash_octet_region(
    src: &mut BerStream,
    hash: &mut dyn DigestSink,
    region: Length,
) -> Result<usize> {
    let mut remaining = region;
    let mut total = 0usize;
    loop {
        match remaining {
            Length::Definite(0) => return Ok(total),
            Length::Definite(_) => {}
            Length::Indefinite => {
                if src.peek_tl()?.is_end_of_contents() {
                    src.skip(2)?;
                    return Ok(total + 2);
                }
            }
        }

        let h = src.read_tl()?;
        let mut consumed = h.nhdr;
        if h.tag() == Tag::OCTET_STRING && !h.constructed {
            let len = h.length.definite().map_err(CmsError::Asn1)?;
            let mut left = len;
            let mut buf = [0u8; 4096];
            while left > 0 {
                let take = left.min(buf.len());
                src.read_exact(&mut buf[..take])
                    .map_err(|_| CmsError::Asn1(Asn1Error::Truncated))?;
                hash.update(&buf[..take]);
                left -= take;
            }
            consumed += len;
        } else if h.tag() == Tag::OCTET_STRING && h.constructed {
            // BER-chunked content nests one level per wrapper
            consumed += hash_octet_region(src, hash, h.length)?;
        } else {
            return Err(CmsError::InvalidCmsObject);
        }
        total += consumed;
        consume_from_region(&mut remaining, consumed);
    }
}
