use crate::tag::Tag;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Asn1Error>;

#[derive(Debug, Error)]
pub enum Asn1Error {
    /// Input ended in the middle of a TLV header or content.
    #[error("truncated data")]
    Truncated,

    /// Clean end of stream at a TLV boundary.
    #[error("end of stream")]
    Eof,

    #[error("invalid length encoding")]
    InvalidLengthEncoding,

    /// Tag number uses a reserved or non-minimal encoding.
    #[error("reserved tag encoding")]
    ReservedTag,

    #[error("unexpected tag {found} (expected {expected})")]
    UnexpectedTag { expected: Tag, found: Tag },

    /// Content lengths of an element and its container disagree.
    #[error("length mismatch inside constructed element")]
    LengthMismatch,

    #[error("premature end of content")]
    PrematureEof,

    #[error("unsupported ASN.1 construct")]
    UnsupportedType,

    #[error("no CHOICE alternative matches tag {found}")]
    ChoiceNoMatch { found: Tag },

    #[error("schema syntax error at line {line}: {reason}")]
    SchemaSyntax { line: usize, reason: &'static str },

    #[error("unresolved type reference `{0}`")]
    SchemaReference(String),

    #[error("invalid value for store operation")]
    InvalidValue,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Asn1Error {
    /// Maps `UnexpectedEof` from a reader to the framing-level error.
    pub(crate) fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Asn1Error::Truncated
        } else {
            Asn1Error::Io(err)
        }
    }
}
