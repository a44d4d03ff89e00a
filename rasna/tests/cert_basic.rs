//! Certificate accessor checks against a captured PKCS#7 fixture and a
//! certificate authored through the schema engine itself.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rasna::cert::KeyUsage;
use rasna::{modules, CertError, Certificate};
use rasna_asn1::decode::decode;
use rasna_asn1::encode::encode;

const FIXTURE_ISSUER: &str =
    "EMail=aleksandr.yusuk@apriorit.com,CN=Alex,OU=InnovationTeam,O=Apriorit,L=Dnipro,ST=Dnipro,C=UA";

fn fixture_cert() -> Certificate {
    let pkcs7 = pkcs7_fixture();
    Certificate::from_der(&pkcs7[CERT_RANGE]).unwrap()
}

#[test]
fn decode_encode_reproduces_certificate_bytes() {
    let pkcs7 = pkcs7_fixture();
    let der = pkcs7[CERT_RANGE].to_vec();
    let mut tree = decode(modules::x509(), "Certificate", der.clone()).unwrap();
    assert_eq!(encode(&mut tree).unwrap(), der);
}

#[test]
fn decode_encode_reproduces_signed_data_bytes() {
    // SignedData covers certificates as SET OF ANY and an empty signer set
    let pkcs7 = pkcs7_fixture();
    let der = pkcs7[19..1606].to_vec();
    let mut tree = decode(modules::cms(), "SignedData", der.clone()).unwrap();
    assert_eq!(encode(&mut tree).unwrap(), der);
}

#[test]
fn serial_is_length_prefixed() {
    let pkcs7 = pkcs7_fixture();
    let cert = fixture_cert();

    let serial = cert.serial().unwrap();
    assert_eq!(&serial[..4], &[0, 0, 0, 20]);
    assert_eq!(&serial[4..], &pkcs7[SERIAL_RANGE]);
}

#[test]
fn issuer_and_subject_format_as_rfc2253() {
    let cert = fixture_cert();
    assert_eq!(cert.issuer(0).unwrap().unwrap(), FIXTURE_ISSUER);
    // self-signed: same name on both ends
    assert_eq!(cert.subject(0).unwrap().unwrap(), FIXTURE_ISSUER);
    // no alternative name extensions
    assert_eq!(cert.issuer(1).unwrap(), None);
}

#[test]
fn validity_timestamps() {
    let cert = fixture_cert();
    assert_eq!(cert.valid_not_before().unwrap().as_str(), "20210413T090343");
    assert_eq!(cert.valid_not_after().unwrap().as_str(), "20220413T090343");
}

#[test]
fn public_key_as_sexp() {
    let pkcs7 = pkcs7_fixture();
    let cert = fixture_cert();

    let mut expected = Vec::new();
    expected.extend_from_slice(b"(10:public-key(3:rsa(1:n513:");
    expected.extend_from_slice(&pkcs7[MODULUS_RANGE]);
    expected.extend_from_slice(b")(1:e3:");
    expected.extend_from_slice(&pkcs7[EXPONENT_RANGE]);
    expected.extend_from_slice(b")))");
    assert_eq!(cert.public_key().unwrap(), expected);
}

#[test]
fn public_key_triple_round_trip() {
    let pkcs7 = pkcs7_fixture();
    let cert = fixture_cert();

    let sexp1 = cert.public_key().unwrap();
    let der1 = rasna::keyinfo::sexp_to_spki(&sexp1).unwrap();
    let sexp2 = rasna::keyinfo::spki_to_sexp(&der1).unwrap();
    let der2 = rasna::keyinfo::sexp_to_spki(&sexp2).unwrap();

    assert_eq!(der1, der2);
    assert_eq!(der1, &pkcs7[SPKI_RANGE]);
}

#[test]
fn fixture_signature_algorithm_is_not_bridged() {
    // sha256WithRSAEncryption is outside the bridge's algorithm table
    let cert = fixture_cert();
    let err = cert.sig_val().unwrap_err();
    assert!(matches!(
        err,
        CertError::KeyInfo(rasna::keyinfo::KeyInfoError::UnknownAlgorithm(oid))
            if oid == "1.2.840.113549.1.1.11"
    ));
}

#[test]
fn extensions_enumerate_in_source_order() {
    let pkcs7 = pkcs7_fixture();
    let cert = fixture_cert();

    let first = cert.extension(0).unwrap();
    assert_eq!(first.oid, rasna::oids::SUBJECT_KEY_IDENTIFIER);
    assert!(!first.critical);

    let second = cert.extension(1).unwrap();
    assert_eq!(second.oid, rasna::oids::AUTHORITY_KEY_IDENTIFIER);

    let third = cert.extension(2).unwrap();
    assert_eq!(third.oid, rasna::oids::BASIC_CONSTRAINTS);
    assert!(third.critical);

    // Eof exactly at the end, and again on a further read
    assert!(matches!(cert.extension(3), Err(CertError::Eof)));
    assert!(matches!(cert.extension(3), Err(CertError::Eof)));

    // the enumerated offsets address real image bytes
    let cert_der = &pkcs7[CERT_RANGE];
    let image = cert.image().unwrap();
    assert_eq!(image, cert_der);
    assert_eq!(
        &image[first.off..first.off + first.len],
        &pkcs7[998..1020] // inner OCTET STRING header + key identifier
    );
}

#[test]
fn semantic_extension_accessors() {
    let pkcs7 = pkcs7_fixture();
    let cert = fixture_cert();

    assert_eq!(cert.is_ca().unwrap(), (true, 0));
    assert!(matches!(cert.key_usage(), Err(CertError::NoData)));
    assert!(matches!(cert.cert_policies(), Err(CertError::NoData)));
    assert!(matches!(
        cert.crl_dist_point(0),
        Err(CertError::NoData)
    ));

    assert_eq!(cert.subject_key_identifier().unwrap(), &pkcs7[SKI_RANGE]);

    let (key_id, names, serial) = cert.auth_key_id().unwrap();
    assert_eq!(key_id.unwrap(), &pkcs7[AKI_RANGE]);
    assert!(names.is_empty());
    assert!(serial.is_none());
}

#[test]
fn second_certificate_read_yields_eof() {
    let pkcs7 = pkcs7_fixture();
    let mut stream = std::io::Cursor::new(pkcs7[CERT_RANGE].to_vec());

    let mut first = Certificate::new();
    first.read_der(&mut stream).unwrap();
    assert_eq!(first.serial().unwrap()[4..], pkcs7[SERIAL_RANGE]);

    let mut second = Certificate::new();
    assert!(matches!(second.read_der(&mut stream), Err(CertError::Eof)));

    // refilling an initialized object is a caller error
    let mut replay = std::io::Cursor::new(pkcs7[CERT_RANGE].to_vec());
    assert!(matches!(first.read_der(&mut replay), Err(CertError::Conflict)));
}

// -- synthetic certificate ------------------------------------------------

#[test]
fn synthetic_certificate_round_trips() {
    let der = build_test_cert_der();
    let mut tree = decode(modules::x509(), "Certificate", der.clone()).unwrap();
    assert_eq!(encode(&mut tree).unwrap(), der);
}

#[test]
fn synthetic_certificate_accessors() {
    let der = build_test_cert_der();
    let cert = Certificate::from_der(&der).unwrap();

    let serial = cert.serial().unwrap();
    assert_eq!(serial, vec![0, 0, 0, 2, 0x05, 0x77]);

    assert_eq!(cert.issuer(0).unwrap().unwrap(), "CN=Root,O=Test CA,C=XX");
    assert_eq!(cert.subject(0).unwrap().unwrap(), "CN=Leaf,O=Test Org,C=XX");

    assert_eq!(cert.valid_not_before().unwrap().as_str(), "20260101T000000");
    assert_eq!(cert.valid_not_after().unwrap().as_str(), "20360101T000000");

    // alternative names behind index 0
    assert_eq!(cert.subject(1).unwrap().unwrap(), "example.org");
    assert_eq!(cert.subject(2).unwrap().unwrap(), "<user@example.org>");
    assert_eq!(cert.subject(3).unwrap(), None);

    let usage = cert.key_usage().unwrap();
    assert_eq!(
        usage.bits(),
        KeyUsage::DIGITAL_SIGNATURE | KeyUsage::KEY_ENCIPHERMENT
    );

    assert_eq!(
        cert.cert_policies().unwrap(),
        "1.3.6.1.4.1.5555.1.1 1.3.6.1.5.5.7.2.1"
    );

    let (names, reasons, issuers) = cert.crl_dist_point(0).unwrap();
    assert_eq!(names, vec!["http://crl.example.org/root.crl".to_owned()]);
    assert_eq!(reasons, 2);
    assert!(issuers.is_empty());
    assert!(matches!(cert.crl_dist_point(1), Err(CertError::Eof)));

    let (key_id, aki_names, aki_serial) = cert.auth_key_id().unwrap();
    assert_eq!(key_id.unwrap(), vec![0xDE; 20]);
    assert!(aki_names.is_empty());
    assert_eq!(aki_serial.unwrap(), vec![0, 0, 0, 1, 0x07]);

    // no BasicConstraints extension at all
    assert_eq!(cert.is_ca().unwrap(), (false, 0));

    let mut expected_sig = Vec::new();
    expected_sig.extend_from_slice(b"(7:sig-val(3:rsa(1:s64:");
    expected_sig.extend_from_slice(&TEST_SIGNATURE);
    expected_sig.extend_from_slice(b")))");
    assert_eq!(cert.sig_val().unwrap(), expected_sig);
}

#[test]
fn unknown_critical_extension_is_carried_not_interpreted() {
    let der = build_test_cert_der();
    let cert = Certificate::from_der(&der).unwrap();

    let mut found = None;
    for idx in 0.. {
        match cert.extension(idx) {
            Ok(ext) => {
                if ext.oid == UNKNOWN_CRITICAL_OID {
                    found = Some(ext);
                }
            }
            Err(CertError::Eof) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    let ext = found.expect("critical extension is enumerated");
    assert!(ext.critical);

    // the generic accessors keep working; nothing interprets the extension
    assert!(cert.issuer(0).is_ok());
    assert!(cert.key_usage().is_ok());
}
