//! Reads DER certificates given as arguments and prints what the accessors
//! see. Exits non-zero when any certificate fails to parse.

use rasna::{CertError, Certificate};

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn dump(path: &str) -> Result<(), CertError> {
    let der = std::fs::read(path).map_err(|err| {
        eprintln!("{path}: {err}");
        CertError::Eof
    })?;
    let cert = Certificate::from_der(&der)?;

    println!("Certificate {path}");
    println!("  serial:     {}", hex(&cert.serial()?[4..]));
    println!("  issuer:     {}", cert.issuer(0)?.unwrap_or_default());
    println!("  subject:    {}", cert.subject(0)?.unwrap_or_default());
    println!("  notBefore:  {}", cert.valid_not_before()?);
    println!("  notAfter:   {}", cert.valid_not_after()?);

    for idx in 1.. {
        match cert.subject(idx)? {
            Some(name) => println!("  altName:    {name}"),
            None => break,
        }
    }

    match cert.public_key() {
        Ok(sexp) => println!("  publicKey:  {}", String::from_utf8_lossy(&sexp)),
        Err(CertError::KeyInfo(err)) => println!("  publicKey:  [{err}]"),
        Err(err) => return Err(err),
    }
    match cert.sig_val() {
        Ok(sexp) => println!("  sigVal:     {}", String::from_utf8_lossy(&sexp)),
        Err(CertError::KeyInfo(err)) => println!("  sigVal:     [{err}]"),
        Err(err) => return Err(err),
    }

    for idx in 0.. {
        match cert.extension(idx) {
            Ok(ext) => println!(
                "  extn:       {} at {} length {}{}",
                ext.oid,
                ext.off,
                ext.len,
                if ext.critical { " (critical)" } else { "" }
            ),
            Err(CertError::Eof) => break,
            Err(err) => return Err(err),
        }
    }

    match cert.is_ca()? {
        (true, pathlen) => println!("  isCA:       yes, chain length {pathlen}"),
        (false, _) => println!("  isCA:       no"),
    }
    match cert.key_usage() {
        Ok(usage) => println!("  keyUsage:   {:#x}", usage.bits()),
        Err(CertError::NoData) => println!("  keyUsage:   none"),
        Err(err) => return Err(err),
    }
    match cert.cert_policies() {
        Ok(policies) => {
            for line in policies.lines() {
                println!("  policy:     {line}");
            }
        }
        Err(CertError::NoData) => println!("  policy:     none"),
        Err(err) => return Err(err),
    }
    match cert.auth_key_id() {
        Ok((key_id, names, serial)) => {
            if let Some(key_id) = key_id {
                println!("  authKeyId:  {}", hex(&key_id));
            }
            for name in names {
                println!("  authIssuer: {name}");
            }
            if let Some(serial) = serial {
                println!("  authSerial: {}", hex(&serial[4..]));
            }
        }
        Err(CertError::NoData) => println!("  authKeyId:  none"),
        Err(err) => return Err(err),
    }
    for idx in 0.. {
        match cert.crl_dist_point(idx) {
            Ok((names, reasons, issuers)) => {
                for name in names {
                    println!("  crlDistPoint: {name} (reasons {reasons:#x})");
                }
                for issuer in issuers {
                    println!("  crlIssuer:  {issuer}");
                }
            }
            Err(CertError::NoData) | Err(CertError::Eof) => break,
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: cert-dump FILE.der...");
        std::process::exit(2);
    }

    let mut failed = false;
    for path in &args {
        if let Err(err) = dump(path) {
            eprintln!("{path}: {err}");
            failed = true;
        }
    }
    std::process::exit(if failed { 1 } else { 0 });
}
