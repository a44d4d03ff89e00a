//! Shared fixtures and helpers for the integration tests.
#![allow(dead_code)]

use rasna::{modules, oids};
use rasna_asn1::encode::{
    encode, store_any_raw, store_bit_string, store_boolean, store_ia5_string, store_integer,
    store_octet_string, store_oid, store_printable_string, store_utc_time, store_utf8_string,
};
use rasna_asn1::path::find;
use rasna_asn1::tree::{NodeId, ValueTree};
use std::cell::RefCell;
use std::rc::Rc;

/// A `SignedData` with one certificate and an empty signer set, captured from
/// a real PKCS#7 exchange. Byte offsets below index into the decoded blob.
pub const PKCS7_B64: &str = concat!(
    "MIIGQgYJKoZIhvcNAQcCoIIGMzCCBi8CAQExADALBgkqhkiG9w0BBwGgggYVMIIG",
    "ETCCA/mgAwIBAgIUGWNpoUt5l2nRwfsGDY8Ta+nccpIwDQYJKoZIhvcNAQELBQAw",
    "gZcxCzAJBgNVBAYTAlVBMQ8wDQYDVQQIDAZEbmlwcm8xDzANBgNVBAcMBkRuaXBy",
    "bzERMA8GA1UECgwIQXByaW9yaXQxFzAVBgNVBAsMDklubm92YXRpb25UZWFtMQ0w",
    "CwYDVQQDDARBbGV4MSswKQYJKoZIhvcNAQkBFhxhbGVrc2FuZHIueXVzdWtAYXBy",
    "aW9yaXQuY29tMB4XDTIxMDQxMzA5MDM0M1oXDTIyMDQxMzA5MDM0M1owgZcxCzAJ",
    "BgNVBAYTAlVBMQ8wDQYDVQQIDAZEbmlwcm8xDzANBgNVBAcMBkRuaXBybzERMA8G",
    "A1UECgwIQXByaW9yaXQxFzAVBgNVBAsMDklubm92YXRpb25UZWFtMQ0wCwYDVQQD",
    "DARBbGV4MSswKQYJKoZIhvcNAQkBFhxhbGVrc2FuZHIueXVzdWtAYXByaW9yaXQu",
    "Y29tMIICIjANBgkqhkiG9w0BAQEFAAOCAg8AMIICCgKCAgEA4jYGtPkGlMXGGZGI",
    "2zE65KrqVxWlRGdOU7281RFnkzh/sGMeWb5EIbLBqfrzAorCFjLy7xDkuU9L5A59",
    "hN2AkuQeEYMeNoCTkgXy3CzyvtgYPvBnJi+Gnutu2R5gyeHGVssgJFNHhPKxPz+d",
    "sXV04WnMArGdemYMU58GtvK98Xk6xrlJPatGuULv1UTsEFmU0oBSPjc20+BYKXhd",
    "VvrY+Po6J5G6WttS+YPyqkkP8py3ckEW2GmpjcoRvkkhS5tWQfYD2pIHX6S4ZM4M",
    "w4sIsDTHB+yfplqVESpLqSAtZycbcc3KW8k9sooh2YpOi1U+EsbC1kK1/CH8v9cp",
    "k1h49Yc5DyrxWsmKWSkOTvNy60FKHEc8GR3MqmUdlB0uZt3WnQwfbq6lxj7eOOkV",
    "qax6cUSoO5idSDldCZAn15l5kqUvfGMaqWH/JsPTXaTXFoADxh4uwIynAsUYSxWG",
    "/uvR5GsZOy4DFOqKxd1vkfS6EtMq52VOO8Pwisax7m+9HtjybttbQSIBJE37jckx",
    "e2aN5+gPrGNLYvL3NAHUzizrkMI6c9kWUw7AynAVuDSU/bea5znDV+RzZEagcGAU",
    "ZysgD3x8Cn8UkDrpbDnhJM2OIzC5xvvVexvlrJ0fSZCyV6Ecj2mgopnV5uFpVIih",
    "oCDWLDuAtpBfNinPxiMsX7VOxPcCAwEAAaNTMFEwHQYDVR0OBBYEFFNl9vm07mLu",
    "MrLbz++XncV9NU2hMB8GA1UdIwQYMBaAFFNl9vm07mLuMrLbz++XncV9NU2hMA8G",
    "A1UdEwEB/wQFMAMBAf8wDQYJKoZIhvcNAQELBQADggIBAC07+hvXzVLbD6wxr40j",
    "A2p1flTNDmccNmrkX0gxW8K0ZywNFM3z93w0ZZvTTGj6DwbhPFSDSG+6pqI+gtPw",
    "uvBG/Wc32QhSBtWuFyTLNAgTM+uRwhGNowgoS4Rr/LdUOCzNE9/6ZqRNuLPy7uNE",
    "maTZFcgJsGHGrGrvLY/An0SlGVjbDanJn4v5pCeAZvru3QMsqKveKpPqe0tdSTHm",
    "O7aADBnOfeA2y9Q4nTaIs1ozwZjUUAbnAwMWic1U84DohgNAcf4WEgX+AAemvwmS",
    "kpjZUu1gAEFd6AtIGjXvFQ1wCec+sdoCcQDIFHZHaipRC6oJRLxF6XSSL+mISntS",
    "LoIWnwixCZLqRB1JOlwa9ppUihA2d5y2uUFAIpd2DUeC4Fhce3hvOUR5crHiV/We",
    "ffNprfZWEPBj3YwFXdGrfgLSqDySSfcjPZW+EqrREauL8ZZPNvZN+Al4cyE9J7YW",
    "qmSKgOfA4Vpda2+aQnT3B2TNmZiZZJ9c1LzTCxCOMS7fG6VUPqhd8eiqRV8eev0i",
    "4tB3coLBJtQlAew9wQnd9Nw9h/b7ODF76JEyrPs4tQvQ25lVNxKOkxfYUMG/QPdk",
    "6NmQ1uDSLknZfV9Gz9YV55v+Lz1jfe3+/Y4riuitT854fQnuj7xbRmqGJ5uWTOp9",
    "ZjHKF8y7QKjT1anRDivi9gkvoQAxAA==",
);

pub fn pkcs7_fixture() -> Vec<u8> {
    base64::decode(PKCS7_B64).expect("fixture decodes")
}

/// The embedded certificate's span inside the fixture.
pub const CERT_RANGE: std::ops::Range<usize> = 45..1602;
/// serialNumber INTEGER content.
pub const SERIAL_RANGE: std::ops::Range<usize> = 60..80;
/// RSA modulus INTEGER content.
pub const MODULUS_RANGE: std::ops::Range<usize> = 467..980;
/// RSA public exponent INTEGER content.
pub const EXPONENT_RANGE: std::ops::Range<usize> = 982..985;
/// SubjectPublicKeyInfo span.
pub const SPKI_RANGE: std::ops::Range<usize> = 435..985;
/// subjectKeyIdentifier content.
pub const SKI_RANGE: std::ops::Range<usize> = 1000..1020;
/// authorityKeyIdentifier keyIdentifier content.
pub const AKI_RANGE: std::ops::Range<usize> = 1033..1053;

pub fn node(tree: &ValueTree, path: &str) -> NodeId {
    find(tree, tree.root(), path).unwrap_or_else(|| panic!("path {path} not found"))
}

pub fn named_child(tree: &ValueTree, parent: NodeId, name: &str) -> NodeId {
    tree.children(parent)
        .find(|&c| tree.name(c) == Some(name))
        .unwrap_or_else(|| panic!("child {name} not found"))
}

/// Fills a `Name` CHOICE node with one single-valued RDN per `(oid, value,
/// printable)` triple.
pub fn fill_dn(tree: &mut ValueTree, name_node: NodeId, attrs: &[(&str, &str, bool)]) {
    let rdn_sequence = named_child(tree, name_node, "rdnSequence");
    for &(oid, value, printable) in attrs {
        let rdn = tree.append(rdn_sequence).unwrap();
        let atv = tree.append(rdn).unwrap();
        let type_node = tree.first_child(atv).unwrap();
        let value_node = tree.next_sibling(type_node).unwrap();
        store_oid(tree, type_node, &oids::to_der(oid).unwrap()).unwrap();
        if printable {
            store_printable_string(tree, value_node, value).unwrap();
        } else {
            store_utf8_string(tree, value_node, value).unwrap();
        }
    }
}

fn append_extension(tree: &mut ValueTree, extensions: NodeId, oid: &str, critical: bool, content: &[u8]) {
    let ext = tree.append(extensions).unwrap();
    let id_node = tree.first_child(ext).unwrap();
    let critical_node = tree.next_sibling(id_node).unwrap();
    let value_node = tree.next_sibling(critical_node).unwrap();
    store_oid(tree, id_node, &oids::to_der(oid).unwrap()).unwrap();
    if critical {
        store_boolean(tree, critical_node, true).unwrap();
    }
    store_octet_string(tree, value_node, content).unwrap();
}

/// OID of the deliberately unrecognized critical extension in the synthetic
/// certificate.
pub const UNKNOWN_CRITICAL_OID: &str = "1.3.6.1.4.1.55555.999";

pub const TEST_SERIAL: [u8; 2] = [0x05, 0x77];
pub const TEST_SIGNATURE: [u8; 64] = [0x5A; 64];

/// Builds a complete DER certificate through the schema engine: RSA subject
/// key, UTCTime validity, and the extension set the semantic accessors
/// understand, plus one unrecognized critical extension.
pub fn build_test_cert_der() -> Vec<u8> {
    let schema = modules::x509();
    let mut t = ValueTree::expand(schema, "Certificate").unwrap();

    let version = node(&t, "Certificate.tbsCertificate.version");
    store_integer(&mut t, version, &[0x02]).unwrap(); // v3

    let serial = node(&t, "Certificate.tbsCertificate.serialNumber");
    store_integer(&mut t, serial, &TEST_SERIAL).unwrap();

    for prefix in [
        "Certificate.tbsCertificate.signature",
        "Certificate.signatureAlgorithm",
    ] {
        let algorithm = node(&t, &format!("{prefix}.algorithm"));
        store_oid(&mut t, algorithm, &oids::to_der(oids::SHA1_WITH_RSA_ENCRYPTION).unwrap())
            .unwrap();
        let parameters = node(&t, &format!("{prefix}.parameters"));
        store_any_raw(&mut t, parameters, &[0x05, 0x00]).unwrap();
    }

    let issuer = node(&t, "Certificate.tbsCertificate.issuer");
    fill_dn(
        &mut t,
        issuer,
        &[
            (oids::AT_COUNTRY_NAME, "XX", true),
            (oids::AT_ORGANIZATION_NAME, "Test CA", false),
            (oids::AT_COMMON_NAME, "Root", false),
        ],
    );

    let not_before = node(&t, "Certificate.tbsCertificate.validity.notBefore");
    let utc = named_child(&t, not_before, "utcTime");
    store_utc_time(&mut t, utc, "260101000000Z").unwrap();
    let not_after = node(&t, "Certificate.tbsCertificate.validity.notAfter");
    let utc = named_child(&t, not_after, "utcTime");
    store_utc_time(&mut t, utc, "360101000000Z").unwrap();

    let subject = node(&t, "Certificate.tbsCertificate.subject");
    fill_dn(
        &mut t,
        subject,
        &[
            (oids::AT_COUNTRY_NAME, "XX", true),
            (oids::AT_ORGANIZATION_NAME, "Test Org", false),
            (oids::AT_COMMON_NAME, "Leaf", false),
        ],
    );

    // RSA subject public key
    let mut rsa = ValueTree::expand(schema, "RSAPublicKey").unwrap();
    let mut modulus = vec![0x00, 0xC3];
    modulus.extend((0..30).map(|i| i as u8 + 1));
    let n = node(&rsa, "RSAPublicKey.modulus");
    store_integer(&mut rsa, n, &modulus).unwrap();
    let e = node(&rsa, "RSAPublicKey.publicExponent");
    store_integer(&mut rsa, e, &[0x01, 0x00, 0x01]).unwrap();
    let rsa_der = encode(&mut rsa).unwrap();

    let spki_alg = node(&t, "Certificate.tbsCertificate.subjectPublicKeyInfo.algorithm.algorithm");
    store_oid(&mut t, spki_alg, &oids::to_der(oids::RSA_ENCRYPTION).unwrap()).unwrap();
    let spki_params =
        node(&t, "Certificate.tbsCertificate.subjectPublicKeyInfo.algorithm.parameters");
    store_any_raw(&mut t, spki_params, &[0x05, 0x00]).unwrap();
    let spki_key = node(&t, "Certificate.tbsCertificate.subjectPublicKeyInfo.subjectPublicKey");
    store_bit_string(&mut t, spki_key, 0, &rsa_der).unwrap();

    // extensions
    let extensions = node(&t, "Certificate.tbsCertificate.extensions");

    let mut key_usage = ValueTree::expand(schema, "KeyUsage").unwrap();
    let ku_root = key_usage.root();
    store_bit_string(&mut key_usage, ku_root, 5, &[0xA0]).unwrap();
    let ku_der = encode(&mut key_usage).unwrap();
    append_extension(&mut t, extensions, oids::KEY_USAGE, false, &ku_der);

    let mut san = ValueTree::expand(schema, "GeneralNames").unwrap();
    let san_root = san.root();
    let first = san.append(san_root).unwrap();
    let dns = named_child(&san, first, "dNSName");
    store_ia5_string(&mut san, dns, "example.org").unwrap();
    let second = san.append(san_root).unwrap();
    let email = named_child(&san, second, "rfc822Name");
    store_ia5_string(&mut san, email, "user@example.org").unwrap();
    let san_der = encode(&mut san).unwrap();
    append_extension(&mut t, extensions, oids::SUBJECT_ALTERNATIVE_NAME, false, &san_der);

    let mut policies = ValueTree::expand(schema, "CertificatePolicies").unwrap();
    let policies_root = policies.root();
    let policy = policies.append(policies_root).unwrap();
    let policy_oid = named_child(&policies, policy, "policyIdentifier");
    store_oid(&mut policies, policy_oid, &oids::to_der("1.3.6.1.4.1.5555.1.1").unwrap()).unwrap();
    let qualifiers = named_child(&policies, policy, "policyQualifiers");
    let qualifier = policies.append(qualifiers).unwrap();
    let qualifier_oid = named_child(&policies, qualifier, "policyQualifierId");
    store_oid(&mut policies, qualifier_oid, &oids::to_der("1.3.6.1.5.5.7.2.1").unwrap()).unwrap();
    let qualifier_value = named_child(&policies, qualifier, "qualifier");
    store_ia5_string(&mut policies, qualifier_value, "https://cps.example.org").unwrap();
    let policies_der = encode(&mut policies).unwrap();
    append_extension(&mut t, extensions, oids::CERTIFICATE_POLICIES, false, &policies_der);

    let mut crldp = ValueTree::expand(schema, "CRLDistributionPoints").unwrap();
    let crldp_root = crldp.root();
    let point = crldp.append(crldp_root).unwrap();
    let dp_name = named_child(&crldp, point, "distributionPoint");
    let full_name = named_child(&crldp, dp_name, "fullName");
    let uri_holder = crldp.append(full_name).unwrap();
    let uri = named_child(&crldp, uri_holder, "uniformResourceIdentifier");
    store_ia5_string(&mut crldp, uri, "http://crl.example.org/root.crl").unwrap();
    let reasons = named_child(&crldp, point, "reasons");
    store_bit_string(&mut crldp, reasons, 6, &[0x40]).unwrap(); // keyCompromise
    let crldp_der = encode(&mut crldp).unwrap();
    append_extension(&mut t, extensions, oids::CRL_DISTRIBUTION_POINTS, false, &crldp_der);

    let mut aki = ValueTree::expand(schema, "AuthorityKeyIdentifier").unwrap();
    let aki_root = aki.root();
    let key_id = named_child(&aki, aki_root, "keyIdentifier");
    store_octet_string(&mut aki, key_id, &[0xDE; 20]).unwrap();
    let aki_serial = named_child(&aki, aki_root, "authorityCertSerialNumber");
    store_integer(&mut aki, aki_serial, &[0x07]).unwrap();
    let aki_der = encode(&mut aki).unwrap();
    append_extension(&mut t, extensions, oids::AUTHORITY_KEY_IDENTIFIER, false, &aki_der);

    append_extension(&mut t, extensions, UNKNOWN_CRITICAL_OID, true, &[0x05, 0x00]);

    let sig_value = node(&t, "Certificate.signatureValue");
    store_bit_string(&mut t, sig_value, 0, &TEST_SIGNATURE).unwrap();

    encode(&mut t).unwrap()
}

/// `Write` implementation collecting into a shared buffer.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Rc<RefCell<Vec<u8>>>);

impl std::io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A digest sink recording every chunk it is fed, paired with the shared
/// record of calls.
pub fn recording_sink() -> (impl rasna::DigestSink + 'static, Rc<RefCell<Vec<Vec<u8>>>>) {
    let calls: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let sink_calls = Rc::clone(&calls);
    let sink = move |data: &[u8]| sink_calls.borrow_mut().push(data.to_vec());
    (sink, calls)
}
