//! The ASN.1 modules the crate ships, parsed once and shared.

use rasna_asn1::schema::Schema;
use std::sync::{Arc, OnceLock};

const X509_MODULE: &str = include_str!("modules/x509.asn1");
const CMS_MODULE: &str = include_str!("modules/cms.asn1");

/// X.509 certificate module, including the extension types.
pub fn x509() -> &'static Arc<Schema> {
    static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
    SCHEMA.get_or_init(|| Arc::new(Schema::parse(X509_MODULE).expect("embedded X.509 module is well-formed")))
}

/// CMS module restricted to `SignedData`.
pub fn cms() -> &'static Arc<Schema> {
    static SCHEMA: OnceLock<Arc<Schema>> = OnceLock::new();
    SCHEMA.get_or_init(|| Arc::new(Schema::parse(CMS_MODULE).expect("embedded CMS module is well-formed")))
}
