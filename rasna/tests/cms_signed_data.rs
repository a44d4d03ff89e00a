//! End-to-end drives of the SignedData state machine: detached build,
//! attached build, and parsing both our own output and a captured stream.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rasna::{oids, Certificate, CmsContext, CmsError, ContentType, StopReason};
use std::io::Cursor;

const DIGEST: [u8; 20] = [0xAB; 20];

fn sig_val_sexp(sig: &[u8]) -> Vec<u8> {
    let mut sexp = Vec::new();
    sexp.extend_from_slice(b"(7:sig-val(3:rsa(1:s");
    sexp.extend_from_slice(sig.len().to_string().as_bytes());
    sexp.push(b':');
    sexp.extend_from_slice(sig);
    sexp.extend_from_slice(b")))");
    sexp
}

/// Drives a detached build to completion and returns the emitted stream.
fn build_detached() -> Vec<u8> {
    let signer = Certificate::from_der(&build_test_cert_der()).unwrap();
    let writer = SharedWriter::default();
    let output = writer.0.clone();
    let (sink, calls) = recording_sink();

    let mut cms = CmsContext::new();
    cms.set_writer(writer).unwrap();
    cms.set_hash_function(sink);
    cms.set_content_type(0, ContentType::SignedData).unwrap();
    cms.set_content_type(1, ContentType::Data).unwrap();
    cms.add_digest_algo(oids::SHA1).unwrap();
    cms.add_signer(signer).unwrap();
    cms.set_message_digest(0, &DIGEST).unwrap();

    assert_eq!(cms.build().unwrap(), StopReason::GotContent);
    // the preset digest makes this a detached signature
    assert_eq!(cms.build().unwrap(), StopReason::EndData);
    assert!(cms.detached_signature());
    assert_eq!(cms.build().unwrap(), StopReason::NeedSig);

    // the hash callback fires exactly once, with a SET-tagged buffer
    cms.hash_signed_attrs(0).unwrap();
    {
        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], 0x31);
    }

    cms.set_sig_val(0, &sig_val_sexp(&[0x77; 64])).unwrap();
    assert_eq!(cms.build().unwrap(), StopReason::Ready);

    let stream = output.borrow().clone();
    stream
}

#[test]
fn detached_build_stop_reason_trace() {
    let stream = build_detached();
    // outer ContentInfo with indefinite framing and the SignedData OID
    assert_eq!(&stream[..2], &[0x30, 0x80]);
    assert_eq!(
        &stream[2..13],
        &[0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02]
    );
    // balanced end-of-contents markers close the stream
    assert_eq!(&stream[stream.len() - 6..], &[0, 0, 0, 0, 0, 0]);
}

#[test]
fn hash_signed_attrs_without_hash_function_is_missing_action() {
    let signer = Certificate::from_der(&build_test_cert_der()).unwrap();
    let mut cms = CmsContext::new();
    cms.set_writer(SharedWriter::default()).unwrap();
    cms.set_content_type(0, ContentType::SignedData).unwrap();
    cms.set_content_type(1, ContentType::Data).unwrap();
    cms.add_digest_algo(oids::SHA1).unwrap();
    cms.add_signer(signer).unwrap();
    cms.set_message_digest(0, &DIGEST).unwrap();

    cms.build().unwrap();
    cms.build().unwrap();
    cms.build().unwrap(); // NeedSig
    assert!(matches!(cms.hash_signed_attrs(0), Err(CmsError::MissingAction)));
}

#[test]
fn final_build_without_signature_is_missing_action() {
    let signer = Certificate::from_der(&build_test_cert_der()).unwrap();
    let mut cms = CmsContext::new();
    cms.set_writer(SharedWriter::default()).unwrap();
    cms.set_content_type(0, ContentType::SignedData).unwrap();
    cms.set_content_type(1, ContentType::Data).unwrap();
    cms.add_digest_algo(oids::SHA1).unwrap();
    cms.add_signer(signer).unwrap();
    cms.set_message_digest(0, &DIGEST).unwrap();

    cms.build().unwrap();
    cms.build().unwrap();
    cms.build().unwrap();
    assert!(matches!(cms.build(), Err(CmsError::MissingAction)));
}

#[test]
fn parse_of_detached_build_round_trips() {
    let stream = build_detached();

    let mut cms = CmsContext::new();
    cms.set_reader(Cursor::new(stream)).unwrap();

    assert_eq!(cms.parse().unwrap(), StopReason::GotContent);
    assert_eq!(cms.content_type(0), Some(ContentType::SignedData));
    assert_eq!(cms.content_oid(0), Some(oids::SIGNED_DATA));

    // no eContent was written: the signature is detached
    assert_eq!(cms.parse().unwrap(), StopReason::NeedHash);
    assert!(cms.detached_signature());
    assert_eq!(cms.content_oid(1), Some(oids::DATA));
    assert_eq!(cms.digest_algo_list(0), Some(oids::SHA1));
    assert_eq!(cms.digest_algo_list(1), None);

    assert_eq!(cms.parse().unwrap(), StopReason::Ready);

    let (issuer, serial) = cms.issuer_serial(0).unwrap();
    assert_eq!(issuer, "CN=Root,O=Test CA,C=XX");
    assert_eq!(serial, vec![0, 0, 0, 2, 0x05, 0x77]);

    assert_eq!(cms.signer_digest_algo(0).unwrap(), oids::SHA1);
    assert_eq!(cms.message_digest(0).unwrap().unwrap(), DIGEST.to_vec());
    assert_eq!(cms.sig_val(0).unwrap(), sig_val_sexp(&[0x77; 64]));

    // the parsed signed attributes hash to the same SET-tagged buffer
    let (sink, calls) = recording_sink();
    cms.set_hash_function(sink);
    cms.hash_signed_attrs(0).unwrap();
    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0], 0x31);
}

#[test]
fn attached_build_and_parse_streams_content_through_hash() {
    let signer = Certificate::from_der(&build_test_cert_der()).unwrap();
    let writer = SharedWriter::default();
    let output = writer.0.clone();

    let mut cms = CmsContext::new();
    cms.set_writer(writer.clone()).unwrap();
    cms.set_content_type(0, ContentType::SignedData).unwrap();
    cms.set_content_type(1, ContentType::Data).unwrap();
    cms.add_digest_algo(oids::SHA1).unwrap();
    cms.add_signer(signer).unwrap();

    assert_eq!(cms.build().unwrap(), StopReason::GotContent);
    // no digest preset: the machine expects the payload on the wire
    assert_eq!(cms.build().unwrap(), StopReason::BeginData);
    assert!(!cms.detached_signature());

    // the caller writes the payload as an OCTET STRING TLV and deposits the
    // digest it computed while doing so
    let payload = b"attached payload bytes";
    {
        use std::io::Write;
        let mut w = writer.clone();
        w.write_all(&[0x04, payload.len() as u8]).unwrap();
        w.write_all(payload).unwrap();
    }
    cms.set_message_digest(0, &DIGEST).unwrap();

    assert_eq!(cms.build().unwrap(), StopReason::NeedSig);
    let (sink, _) = recording_sink();
    cms.set_hash_function(sink);
    cms.hash_signed_attrs(0).unwrap();
    cms.set_sig_val(0, &sig_val_sexp(&[0x11; 16])).unwrap();
    assert_eq!(cms.build().unwrap(), StopReason::Ready);

    let stream = output.borrow().clone();

    // parse it back, hashing the attached content on the way
    let mut parser = CmsContext::new();
    parser.set_reader(Cursor::new(stream)).unwrap();
    assert_eq!(parser.parse().unwrap(), StopReason::GotContent);
    assert_eq!(parser.parse().unwrap(), StopReason::BeginData);
    assert!(!parser.detached_signature());

    // re-entering without a hash function is refused
    assert!(matches!(parser.parse(), Err(CmsError::MissingAction)));

    // the machine is now stuck in Running: only a fresh context can retry
    assert!(matches!(parser.parse(), Err(CmsError::InvalidState)));

    let mut parser = CmsContext::new();
    let stream = output.borrow().clone();
    parser.set_reader(Cursor::new(stream)).unwrap();
    let (sink, hashed) = recording_sink();
    parser.set_hash_function(sink);

    assert_eq!(parser.parse().unwrap(), StopReason::GotContent);
    assert_eq!(parser.parse().unwrap(), StopReason::BeginData);
    assert_eq!(parser.parse().unwrap(), StopReason::EndData);
    assert_eq!(parser.parse().unwrap(), StopReason::Ready);

    let fed: Vec<u8> = hashed.borrow().iter().flatten().copied().collect();
    assert_eq!(fed, payload.to_vec());

    assert_eq!(parser.message_digest(0).unwrap().unwrap(), DIGEST.to_vec());
}

#[test]
fn parse_captured_fixture_stream() {
    let pkcs7 = pkcs7_fixture();

    let mut cms = CmsContext::new();
    cms.set_reader(Cursor::new(pkcs7.clone())).unwrap();

    assert_eq!(cms.parse().unwrap(), StopReason::GotContent);
    assert_eq!(cms.content_type(0), Some(ContentType::SignedData));

    assert_eq!(cms.parse().unwrap(), StopReason::NeedHash);
    assert_eq!(cms.content_type(1), Some(ContentType::Data));
    // the digest algorithm set of this capture is empty
    assert_eq!(cms.digest_algo_list(0), None);

    assert_eq!(cms.parse().unwrap(), StopReason::Ready);

    // the embedded certificate comes out once
    let cert = cms.take_cert(0).expect("one certificate");
    assert_eq!(cert.serial().unwrap()[4..], pkcs7[SERIAL_RANGE]);
    assert!(cms.take_cert(0).is_none());
    assert!(cms.take_cert(1).is_none());

    // the signer set is empty: accessors report absence, not failure
    assert!(matches!(cms.issuer_serial(0), Err(CmsError::NoValue)));
    assert_eq!(cms.message_digest(0).unwrap(), None);
}

#[test]
fn driving_a_fresh_context_twice_from_running_fails() {
    let stream = build_detached();
    let mut cms = CmsContext::new();
    cms.set_reader(Cursor::new(stream)).unwrap();
    cms.parse().unwrap();
    cms.parse().unwrap();
    cms.parse().unwrap();

    // Ready is terminal: any further step is a caller bug
    assert!(matches!(cms.parse(), Err(CmsError::Bug)));
}
