//! Test PKI generator
//!
//! Builds a small PKI for the test suites: a self-signed root CA, a client
//! certificate used for signature protection, a server certificate used by
//! the mock server, and the certificate the mock server hands out as newly
//! enrolled. Generated once per test binary and cloned for each test.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Name, X509NameRef, X509};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const X509_VERSION_3: i32 = 2;
const VALIDITY_DAYS: u32 = 365;

#[derive(Clone)]
pub struct TestPki {
    pub root_cert: X509,
    pub client_key: PKey<Private>,
    pub client_cert: X509,
    pub server_key: PKey<Private>,
    pub server_cert: X509,
    pub enrolled_key: PKey<Private>,
    pub enrolled_cert: X509,
}

/// Paths of the PKI written out as PEM files
pub struct TestFiles {
    pub root_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub enrolled_cert: PathBuf,
}

static PKI: OnceLock<TestPki> = OnceLock::new();

impl TestPki {
    pub fn generate() -> TestPki {
        PKI.get_or_init(|| {
            let root_key = generate_key();
            let root_cert = build_cert("/CN=Test Root CA", &root_key, None, true);
            let client_key = generate_key();
            let client_cert = build_cert("/CN=client", &client_key, Some((&root_cert, &root_key)), false);
            let server_key = generate_key();
            let server_cert = build_cert("/CN=server", &server_key, Some((&root_cert, &root_key)), false);
            let enrolled_key = generate_key();
            let enrolled_cert =
                build_cert("/CN=enrolled", &enrolled_key, Some((&root_cert, &root_key)), false);
            TestPki {
                root_cert,
                client_key,
                client_cert,
                server_key,
                server_cert,
                enrolled_key,
                enrolled_cert,
            }
        })
        .clone()
    }

    /// Client key and certificate with the root as companion, in a PKCS#12 container
    pub fn client_pkcs12(&self, pass: &str) -> Vec<u8> {
        let mut ca = Stack::new().unwrap();
        ca.push(self.root_cert.clone()).unwrap();
        Pkcs12::builder()
            .name("client")
            .pkey(&self.client_key)
            .cert(&self.client_cert)
            .ca(ca)
            .build2(pass)
            .unwrap()
            .to_der()
            .unwrap()
    }

    pub fn write_files(&self, dir: &Path) -> TestFiles {
        let write = |name: &str, bytes: Vec<u8>| {
            let path = dir.join(name);
            std::fs::write(&path, bytes).unwrap();
            path
        };
        TestFiles {
            root_cert: write("root.pem", self.root_cert.to_pem().unwrap()),
            client_cert: write("client.pem", self.client_cert.to_pem().unwrap()),
            client_key: write("client.key", self.client_key.private_key_to_pem_pkcs8().unwrap()),
            server_cert: write("server.pem", self.server_cert.to_pem().unwrap()),
            server_key: write("server.key", self.server_key.private_key_to_pem_pkcs8().unwrap()),
            enrolled_cert: write("enrolled.pem", self.enrolled_cert.to_pem().unwrap()),
        }
    }
}

fn generate_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn build_name(dn: &str) -> X509Name {
    let mut builder = X509Name::builder().unwrap();
    for part in dn.split('/').filter(|p| !p.is_empty()) {
        let (field, value) = part.split_once('=').unwrap();
        builder.append_entry_by_text(field, value).unwrap();
    }
    builder.build()
}

fn build_cert(
    subject: &str,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
    ca: bool,
) -> X509 {
    let mut builder = X509::builder().unwrap();
    builder.set_version(X509_VERSION_3).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();

    let name = build_name(subject);
    builder.set_subject_name(&name).unwrap();
    let issuer_name: &X509NameRef = match issuer {
        Some((cert, _)) => cert.subject_name(),
        None => &name,
    };
    builder.set_issuer_name(issuer_name).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(VALIDITY_DAYS).unwrap())
        .unwrap();
    builder.set_pubkey(key).unwrap();

    if ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .digital_signature()
                    .build()
                    .unwrap(),
            )
            .unwrap();
    } else {
        builder
            .append_extension(KeyUsage::new().critical().digital_signature().build().unwrap())
            .unwrap();
        let san = SubjectAlternativeName::new()
            .dns("localhost")
            .ip("127.0.0.1")
            .build(&builder.x509v3_context(issuer.map(|(c, _)| &**c), None))
            .unwrap();
        builder.append_extension(san).unwrap();
    }

    let signing_key = issuer.map(|(_, k)| k).unwrap_or(key);
    builder.sign(signing_key, MessageDigest::sha256()).unwrap();
    builder.build()
}
