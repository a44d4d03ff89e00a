//! X.509 certificates and CMS `SignedData` over a runtime ASN.1 schema.
//!
//! The crate reads and writes raw DER. Decoded objects keep byte-accurate
//! offsets into their image, so callers can hash or extract exact spans.
//! All cryptography is supplied by the caller: hashing goes through the
//! [`DigestSink`] capability, keys and signatures cross the API border as
//! canonical S-expressions (see [`keyinfo`]).
//!
//! ```no_run
//! use rasna::Certificate;
//!
//! let der = std::fs::read("cert.der").unwrap();
//! let cert = Certificate::from_der(&der).unwrap();
//! println!("issuer:  {}", cert.issuer(0).unwrap().unwrap());
//! println!("expires: {}", cert.valid_not_after().unwrap());
//! ```

pub mod cert;
pub mod cms;
pub mod keyinfo;
pub mod modules;
mod name;
pub mod oids;
pub mod time;

pub use cert::{CertError, Certificate, ExtensionInfo, KeyUsage};
pub use cms::{CmsContext, CmsError, ContentType, DigestSink, StopReason};
pub use time::IsoTime;
