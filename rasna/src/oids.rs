//! Registry of the object identifiers the crate knows by name.

use oid::ObjectIdentifier;
use std::convert::TryFrom;
use std::sync::OnceLock;

macro_rules! define_oid {
    ($uppercase:ident => $lowercase:ident => $str_value:literal) => {
        pub const $uppercase: &str = $str_value;

        pub fn $lowercase() -> &'static ObjectIdentifier {
            static OID: OnceLock<ObjectIdentifier> = OnceLock::new();
            OID.get_or_init(|| ObjectIdentifier::try_from($uppercase).unwrap())
        }
    };
    ( $( $uppercase:ident => $lowercase:ident => $str_value:literal, )+ ) => {
        $( define_oid! { $uppercase => $lowercase => $str_value } )+
    };
}

define_oid! {
    // CMS content types
    DATA => data => "1.2.840.113549.1.7.1",
    SIGNED_DATA => signed_data => "1.2.840.113549.1.7.2",
    ENVELOPED_DATA => enveloped_data => "1.2.840.113549.1.7.3",
    DIGESTED_DATA => digested_data => "1.2.840.113549.1.7.5",
    ENCRYPTED_DATA => encrypted_data => "1.2.840.113549.1.7.6",
    AUTH_DATA => auth_data => "1.2.840.113549.1.9.16.1.2",

    // CMS attributes
    MESSAGE_DIGEST => message_digest => "1.2.840.113549.1.9.4",

    // signature and key algorithms
    RSA_ENCRYPTION => rsa_encryption => "1.2.840.113549.1.1.1",
    MD5_WITH_RSA_ENCRYPTION => md5_with_rsa_encryption => "1.2.840.113549.1.1.4",
    SHA1_WITH_RSA_ENCRYPTION => sha1_with_rsa_encryption => "1.2.840.113549.1.1.5",
    DSA => dsa => "1.2.840.10040.4.1",
    DSA_WITH_SHA1 => dsa_with_sha1 => "1.2.840.10040.4.3",
    SHA1 => sha1 => "1.3.14.3.2.26",

    // attribute types used in distinguished names
    AT_COMMON_NAME => at_common_name => "2.5.4.3",
    AT_SURNAME => at_surname => "2.5.4.4",
    AT_SERIAL_NUMBER => at_serial_number => "2.5.4.5",
    AT_COUNTRY_NAME => at_country_name => "2.5.4.6",
    AT_LOCALITY_NAME => at_locality_name => "2.5.4.7",
    AT_STATE_OR_PROVINCE_NAME => at_state_or_province_name => "2.5.4.8",
    AT_STREET_ADDRESS => at_street_address => "2.5.4.9",
    AT_ORGANIZATION_NAME => at_organization_name => "2.5.4.10",
    AT_ORGANIZATIONAL_UNIT_NAME => at_organizational_unit_name => "2.5.4.11",
    AT_TITLE => at_title => "2.5.4.12",
    AT_GIVEN_NAME => at_given_name => "2.5.4.42",
    AT_DOMAIN_COMPONENT => at_domain_component => "0.9.2342.19200300.100.1.25",
    AT_USER_ID => at_user_id => "0.9.2342.19200300.100.1.1",
    EMAIL_ADDRESS => email_address => "1.2.840.113549.1.9.1",

    // certificate extensions
    SUBJECT_KEY_IDENTIFIER => subject_key_identifier => "2.5.29.14",
    KEY_USAGE => key_usage => "2.5.29.15",
    SUBJECT_ALTERNATIVE_NAME => subject_alternative_name => "2.5.29.17",
    ISSUER_ALTERNATIVE_NAME => issuer_alternative_name => "2.5.29.18",
    BASIC_CONSTRAINTS => basic_constraints => "2.5.29.19",
    CRL_DISTRIBUTION_POINTS => crl_distribution_points => "2.5.29.31",
    CERTIFICATE_POLICIES => certificate_policies => "2.5.29.32",
    AUTHORITY_KEY_IDENTIFIER => authority_key_identifier => "2.5.29.35",
}

/// DER content octets of a dotted-string OID.
pub fn to_der(oid_str: &str) -> Option<Vec<u8>> {
    let oid = ObjectIdentifier::try_from(oid_str).ok()?;
    Some(oid.into())
}

/// Dotted string of DER content octets.
pub fn from_der(content: &[u8]) -> Option<String> {
    let oid = ObjectIdentifier::try_from(content).ok()?;
    Some(oid.into())
}

/// DER content octets of a known OID constant.
pub(crate) fn der_bytes(oid: &ObjectIdentifier) -> Vec<u8> {
    oid.clone().into()
}
