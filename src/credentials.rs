//! Credential Loader
//!
//! Loads certificates, private/public keys and CSRs from local files or
//! `http(s)://` URIs in PEM, DER or PKCS#12 format.
//!
//! # Format resolution
//!
//! 1. `http://` / `https://` URIs are fetched over the network, `engine:`
//!    references go to a [`KeyProvider`]; neither uses the file heuristics.
//! 2. A `file:` prefix is stripped.
//! 3. The last four characters of the path select the format: `.crt` and
//!    `.pem` are PEM, `.cer` and `.der` are DER, `.p12` is PKCS#12. Any other
//!    extension keeps the declared format.
//! 4. If parsing fails, PEM and DER are retried once as each other. PKCS#12 is
//!    never retried as something else. Only the final failure is reported.
//!
//! PKCS#12 containers are opened with an empty password first; if the MAC
//! does not verify, a passphrase is obtained and the MAC is checked again.

use crate::error::{CmpError, Result};
use crate::passphrase::{self, Passphrase, SecretSource};
use crate::configs::split_list;
use openssl::asn1::Asn1Time;
use openssl::pkcs12::{ParsedPkcs12_2, Pkcs12};
use openssl::pkey::{PKey, Private, Public};
use openssl::x509::{X509NameRef, X509Req, X509VerifyResult, X509};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFormat {
    Pem,
    Der,
    Pkcs12,
    /// Fetched over the network
    Http,
    /// Held by a key store, referenced by identifier
    Engine,
}

impl CredentialFormat {
    /// Parse a format name as given in `certform`, `keyform` or `certsform`
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PEM" => Ok(CredentialFormat::Pem),
            "DER" => Ok(CredentialFormat::Der),
            "P12" | "PKCS12" => Ok(CredentialFormat::Pkcs12),
            "ENGINE" => Ok(CredentialFormat::Engine),
            _ => Err(CmpError::ProtocolConfig(format!(
                "unknown format '{}', use PEM, DER, P12 or ENGINE",
                name
            ))),
        }
    }

    /// The format to retry with after a parse failure
    fn complement(self) -> Option<Self> {
        match self {
            CredentialFormat::Pem => Some(CredentialFormat::Der),
            CredentialFormat::Der => Some(CredentialFormat::Pem),
            _ => None,
        }
    }
}

/// Resolve the effective format of a URI and strip its scheme prefix
pub fn adjust_format(uri: &str, declared: CredentialFormat) -> (&str, CredentialFormat) {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return (uri, CredentialFormat::Http);
    }
    if let Some(id) = uri.strip_prefix("engine:") {
        return (id, CredentialFormat::Engine);
    }
    let path = uri.strip_prefix("file:").unwrap_or(uri);
    let format = match path.get(path.len().saturating_sub(4)..) {
        Some(ext) if ext.eq_ignore_ascii_case(".crt") || ext.eq_ignore_ascii_case(".pem") => {
            CredentialFormat::Pem
        }
        Some(ext) if ext.eq_ignore_ascii_case(".cer") || ext.eq_ignore_ascii_case(".der") => {
            CredentialFormat::Der
        }
        Some(ext) if ext.eq_ignore_ascii_case(".p12") => CredentialFormat::Pkcs12,
        _ => declared,
    };
    (path, format)
}

/// Source of private keys referenced by identifier instead of a file path
pub trait KeyProvider: Send + Sync {
    fn load_private_key(&self, id: &str, pass: Option<&SecretSource>, desc: &str) -> Result<PKey<Private>>;
}

/// Key store directory holding PKCS#8 PEM keys named `<id>.pem`
///
/// Encrypted keys are opened with the passphrase of the option the key was
/// given for, prompting if none is configured.
pub struct KeyDirectory {
    root: PathBuf,
    batch: bool,
}

impl KeyDirectory {
    pub fn open(root: impl Into<PathBuf>, batch: bool) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CmpError::ProtocolConfig(format!(
                "key store '{}' is not a directory",
                root.display()
            )));
        }
        Ok(Self { root, batch })
    }
}

impl KeyProvider for KeyDirectory {
    fn load_private_key(&self, id: &str, pass: Option<&SecretSource>, desc: &str) -> Result<PKey<Private>> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(CmpError::ProtocolConfig(format!("invalid key identifier '{}' for {}", id, desc)));
        }
        let path = self.root.join(format!("{}.pem", id));
        let bytes = fs::read(&path).map_err(|e| CmpError::io(&path, e))?;
        let key = if bytes.windows(9).any(|w| w == b"ENCRYPTED") {
            let passphrase = passphrase::obtain(pass, desc, self.batch)?;
            PKey::private_key_from_pem_passphrase(&bytes, passphrase.as_bytes())
        } else {
            PKey::private_key_from_pem(&bytes)
        };
        log::debug!("loading {} '{}' from key store {}", desc, id, self.root.display());
        key.map_err(|e| CmpError::Format(format!("cannot load {} '{}' from key store: {}", desc, id, e)))
    }
}

/// An end-entity certificate, its key and companion certificates
#[derive(Clone, Default)]
pub struct Credential {
    pub cert: Option<X509>,
    pub key: Option<PKey<Private>>,
    pub chain: Vec<X509>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("cert", &self.cert.as_ref().map(|c| name_to_string(c.subject_name())))
            .field("key", &self.key.as_ref().map(|_| "<private key>"))
            .field("chain", &self.chain.len())
            .finish()
    }
}

impl Credential {
    /// Check that the private key corresponds to the certificate's public key
    pub fn check_key_matches(&self, desc: &str) -> Result<()> {
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => {
                let public = cert.public_key()?;
                if public.public_eq(key) {
                    Ok(())
                } else {
                    Err(CmpError::CredentialMismatch(format!(
                        "{} key does not match certificate '{}'",
                        desc,
                        name_to_string(cert.subject_name())
                    )))
                }
            }
            _ => Ok(()),
        }
    }
}

/// Duplicate and self-signed handling when merging certificate lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergePolicy {
    /// Skip certificates already present
    pub dedup: bool,
    pub exclude_self_signed: bool,
}

impl MergePolicy {
    pub const KEEP_ALL: MergePolicy = MergePolicy {
        dedup: false,
        exclude_self_signed: false,
    };
    pub const DEDUP: MergePolicy = MergePolicy {
        dedup: true,
        exclude_self_signed: false,
    };
}

/// Append `new` to `target` in order, honouring the merge policy
pub fn merge_certs(target: &mut Vec<X509>, new: Vec<X509>, policy: MergePolicy) -> Result<()> {
    for cert in new {
        if policy.exclude_self_signed && is_self_signed(&cert) {
            continue;
        }
        if policy.dedup {
            let der = cert.to_der()?;
            let mut present = false;
            for existing in target.iter() {
                if existing.to_der()? == der {
                    present = true;
                    break;
                }
            }
            if present {
                continue;
            }
        }
        target.push(cert);
    }
    Ok(())
}

pub fn is_self_signed(cert: &X509) -> bool {
    cert.issued(cert) == X509VerifyResult::OK
}

/// One-line DN in `/CN=.../O=...` form
pub fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let field = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .to_string()
                .unwrap_or_else(|_| String::from_utf8_lossy(entry.data().as_slice()).into_owned());
            format!("/{}={}", field, value)
        })
        .collect()
}

/// Loads credentials with shared passphrase, time-check and fetch settings
#[derive(Clone, Default)]
pub struct CredentialLoader {
    batch: bool,
    check_time: Option<i64>,
    fetch_timeout: Option<Duration>,
    key_provider: Option<Arc<dyn KeyProvider>>,
}

impl CredentialLoader {
    pub fn new(batch: bool) -> Self {
        Self {
            batch,
            ..Default::default()
        }
    }

    /// Check certificate validity at this Unix time instead of now
    pub fn with_check_time(mut self, check_time: Option<i64>) -> Self {
        self.check_time = check_time;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_key_provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.key_provider = Some(provider);
        self
    }

    fn read(&self, path: &str, format: CredentialFormat, desc: &str) -> Result<Vec<u8>> {
        match format {
            CredentialFormat::Http => crate::http_client::fetch(path, self.fetch_timeout)
                .map_err(|e| CmpError::Transport(format!("cannot fetch {} from '{}': {}", desc, path, e))),
            _ => fs::read(path).map_err(|e| CmpError::io(path, e)),
        }
    }

    /// Try `parse` with the resolved format, then once with its complement
    fn with_retry<T>(
        &self,
        bytes: &[u8],
        format: CredentialFormat,
        uri: &str,
        desc: &str,
        mut parse: impl FnMut(&[u8], CredentialFormat) -> Result<T>,
    ) -> Result<T> {
        match parse(bytes, format) {
            Ok(v) => Ok(v),
            Err(first) => match format.complement() {
                Some(other) => {
                    log::debug!("parsing {} as {:?} failed ({}), retrying as {:?}", desc, format, first, other);
                    parse(bytes, other).map_err(|e| {
                        CmpError::Format(format!("cannot load {} from '{}': {}", desc, uri, e))
                    })
                }
                None => Err(match first {
                    CmpError::Format(msg) => {
                        CmpError::Format(format!("cannot load {} from '{}': {}", desc, uri, msg))
                    }
                    other => other,
                }),
            },
        }
    }

    /// Open a PKCS#12 container, trying the empty password first
    fn open_pkcs12(&self, bytes: &[u8], pass: Option<&SecretSource>, desc: &str) -> Result<ParsedPkcs12_2> {
        let p12 = Pkcs12::from_der(bytes)
            .map_err(|e| CmpError::Format(format!("not a PKCS#12 container: {}", e)))?;
        if let Ok(parsed) = p12.parse2("") {
            return Ok(parsed);
        }
        let passphrase: Passphrase = passphrase::obtain(pass, desc, self.batch)?;
        p12.parse2(passphrase.expose()).map_err(|_| {
            CmpError::Format(format!("mac verify error (wrong password?) in PKCS#12 file for {}", desc))
        })
    }

    /// Load a certificate/key bundle
    ///
    /// PKCS#12 yields key, certificate and companions together; PEM files may
    /// also hold several certificates, the first being the end-entity one.
    ///
    /// # Arguments
    /// * `uri` - File path or URI
    /// * `declared` - Format to assume when the extension does not tell
    /// * `pass` - Passphrase source for encrypted content
    /// * `desc` - What is being loaded, used in messages
    pub fn load(
        &self,
        uri: &str,
        declared: CredentialFormat,
        pass: Option<&SecretSource>,
        desc: &str,
    ) -> Result<Credential> {
        let (path, format) = adjust_format(uri, declared);
        if format == CredentialFormat::Pkcs12 {
            let bytes = self.read(path, format, desc)?;
            let parsed = self.open_pkcs12(&bytes, pass, desc)?;
            let chain: Vec<X509> = parsed.ca.map(|s| s.into_iter().collect()).unwrap_or_default();
            let cred = Credential {
                cert: parsed.cert,
                key: parsed.pkey,
                chain,
            };
            let all: Vec<X509> = cred.cert.iter().chain(cred.chain.iter()).cloned().collect();
            self.warn_expired(&all, desc);
            return Ok(cred);
        }
        let mut certs = self.load_certs(uri, declared, pass, desc)?;
        let cert = certs.remove(0);
        Ok(Credential {
            cert: Some(cert),
            key: None,
            chain: certs,
        })
    }

    /// Load a single certificate
    pub fn load_cert(
        &self,
        uri: &str,
        declared: CredentialFormat,
        pass: Option<&SecretSource>,
        desc: &str,
    ) -> Result<X509> {
        let mut certs = self.load_certs(uri, declared, pass, desc)?;
        if certs.len() > 1 {
            log::warn!("{} file '{}' holds {} certificates, using the first", desc, uri, certs.len());
        }
        Ok(certs.remove(0))
    }

    /// Load all certificates of one file or URI
    pub fn load_certs(
        &self,
        uri: &str,
        declared: CredentialFormat,
        pass: Option<&SecretSource>,
        desc: &str,
    ) -> Result<Vec<X509>> {
        let (path, format) = adjust_format(uri, declared);
        if format == CredentialFormat::Engine {
            return Err(CmpError::ProtocolConfig(format!(
                "cannot load {} from key store reference '{}'",
                desc, uri
            )));
        }
        let bytes = self.read(path, format, desc)?;
        let format = match format {
            CredentialFormat::Http => sniff_format(&bytes),
            f => f,
        };
        let certs = self.with_retry(&bytes, format, uri, desc, |bytes, f| match f {
            CredentialFormat::Pkcs12 => {
                let parsed = self.open_pkcs12(bytes, pass, desc)?;
                let mut certs: Vec<X509> = parsed.cert.into_iter().collect();
                if let Some(ca) = parsed.ca {
                    certs.extend(ca);
                }
                Ok(certs)
            }
            CredentialFormat::Der => Ok(vec![X509::from_der(bytes)?]),
            _ => {
                let certs = X509::stack_from_pem(bytes)?;
                if certs.is_empty() {
                    return Err(CmpError::Format("no PEM certificate found".to_string()));
                }
                Ok(certs)
            }
        })?;
        if certs.is_empty() {
            return Err(CmpError::Format(format!("no certificate found for {} in '{}'", desc, uri)));
        }
        self.warn_expired(&certs, desc);
        Ok(certs)
    }

    /// Load certificates from a comma/whitespace separated list of files
    ///
    /// Files are processed in order, each with the usual format retry.
    pub fn load_cert_list(
        &self,
        list: &str,
        declared: CredentialFormat,
        pass: Option<&SecretSource>,
        desc: &str,
        policy: MergePolicy,
    ) -> Result<Vec<X509>> {
        let mut all = Vec::new();
        for item in split_list(list) {
            let certs = self.load_certs(&item, declared, pass, desc)?;
            merge_certs(&mut all, certs, policy)?;
        }
        Ok(all)
    }

    /// Load a private key
    pub fn load_key(
        &self,
        uri: &str,
        declared: CredentialFormat,
        pass: Option<&SecretSource>,
        desc: &str,
    ) -> Result<PKey<Private>> {
        let (path, format) = adjust_format(uri, declared);
        if format == CredentialFormat::Engine {
            let provider = self.key_provider.as_ref().ok_or_else(|| {
                CmpError::ProtocolConfig(format!("no key store available to load {} '{}'", desc, path))
            })?;
            return provider.load_private_key(path, pass, desc);
        }
        let bytes = self.read(path, format, desc)?;
        let format = match format {
            CredentialFormat::Http => sniff_format(&bytes),
            f => f,
        };
        self.with_retry(&bytes, format, uri, desc, |bytes, f| match f {
            CredentialFormat::Pkcs12 => self
                .open_pkcs12(bytes, pass, desc)?
                .pkey
                .ok_or_else(|| CmpError::Format("PKCS#12 container holds no private key".to_string())),
            CredentialFormat::Der => match PKey::private_key_from_der(bytes) {
                Ok(key) => Ok(key),
                Err(_) => {
                    let pw = passphrase::obtain(pass, desc, self.batch)?;
                    Ok(PKey::private_key_from_pkcs8_passphrase(bytes, pw.as_bytes())?)
                }
            },
            _ => {
                if pass.is_none() && !is_encrypted_pem(bytes) {
                    return Ok(PKey::private_key_from_pem(bytes)?);
                }
                let pw = passphrase::obtain(pass, desc, self.batch)?;
                PKey::private_key_from_pem_passphrase(bytes, pw.as_bytes()).map_err(|e| {
                    CmpError::Format(format!("cannot decrypt {} (wrong password?): {}", desc, e))
                })
            }
        })
    }

    /// Load a public key, PEM or DER SubjectPublicKeyInfo
    pub fn load_public_key(&self, uri: &str, declared: CredentialFormat, desc: &str) -> Result<PKey<Public>> {
        let (path, format) = adjust_format(uri, declared);
        let bytes = self.read(path, format, desc)?;
        let format = match format {
            CredentialFormat::Der => CredentialFormat::Der,
            _ => CredentialFormat::Pem,
        };
        self.with_retry(&bytes, format, uri, desc, |bytes, f| match f {
            CredentialFormat::Der => Ok(PKey::public_key_from_der(bytes)?),
            _ => Ok(PKey::public_key_from_pem(bytes)?),
        })
    }

    /// Load a PKCS#10 certificate signing request
    pub fn load_csr(&self, uri: &str, desc: &str) -> Result<X509Req> {
        let (path, format) = adjust_format(uri, CredentialFormat::Pem);
        let bytes = self.read(path, format, desc)?;
        let format = match format {
            CredentialFormat::Der => CredentialFormat::Der,
            _ => CredentialFormat::Pem,
        };
        self.with_retry(&bytes, format, uri, desc, |bytes, f| match f {
            CredentialFormat::Der => Ok(X509Req::from_der(bytes)?),
            _ => Ok(X509Req::from_pem(bytes)?),
        })
    }

    /// Warn about certificates outside their validity period
    ///
    /// # Returns
    /// * `usize` - Number of certificates reported
    pub fn warn_expired(&self, certs: &[X509], desc: &str) -> usize {
        let now = match self.check_time {
            Some(t) => Asn1Time::from_unix(t as _),
            None => Asn1Time::days_from_now(0),
        };
        let Ok(now) = now else {
            return 0;
        };
        let mut reported = 0;
        for cert in certs {
            let subject = name_to_string(cert.subject_name());
            if let Ok(Ordering::Greater) = now.compare(cert.not_after()) {
                log::warn!("certificate from {} with subject '{}' has expired", desc, subject);
                reported += 1;
            } else if let Ok(Ordering::Less) = now.compare(cert.not_before()) {
                log::warn!("certificate from {} with subject '{}' is not yet valid", desc, subject);
                reported += 1;
            }
        }
        reported
    }
}

fn is_encrypted_pem(bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(bytes);
    text.contains("ENCRYPTED")
}

fn sniff_format(bytes: &[u8]) -> CredentialFormat {
    if bytes.starts_with(b"-----BEGIN") {
        CredentialFormat::Pem
    } else {
        CredentialFormat::Der
    }
}

/// Save certificates to a file in PEM or DER
///
/// Nothing is written for an empty list. DER output of more than one
/// certificate is the plain concatenation and draws a warning.
///
/// # Returns
/// * `Result<usize>` - Number of certificates written
pub fn save_certs(certs: &[X509], path: &Path, format: CredentialFormat, desc: &str) -> Result<usize> {
    if certs.is_empty() {
        log::debug!("no {} to save to '{}'", desc, path.display());
        return Ok(0);
    }
    let mut out = Vec::new();
    match format {
        CredentialFormat::Pem => {
            for cert in certs {
                out.extend_from_slice(&cert.to_pem()?);
            }
        }
        CredentialFormat::Der => {
            if certs.len() > 1 {
                log::warn!(
                    "saving more than one certificate in non-PEM format to '{}'",
                    path.display()
                );
            }
            for cert in certs {
                out.extend_from_slice(&cert.to_der()?);
            }
        }
        other => {
            return Err(CmpError::ProtocolConfig(format!(
                "cannot save {} in {:?} format",
                desc, other
            )))
        }
    }
    fs::write(path, out).map_err(|e| CmpError::io(path, e))?;
    log::info!("received {} {} saved to '{}'", certs.len(), desc, path.display());
    Ok(certs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki_generator::TestPki;

    #[test]
    fn test_name_to_string_keeps_full_value() {
        use openssl::x509::X509NameBuilder;

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "client").unwrap();
        name.append_entry_by_text("O", "before\0after").unwrap();
        assert_eq!(name_to_string(&name.build()), "/CN=client/O=before\0after");
    }

    #[test]
    fn test_adjust_format_table() {
        use CredentialFormat::*;
        assert_eq!(adjust_format("a.crt", Der), ("a.crt", Pem));
        assert_eq!(adjust_format("a.PEM", Der), ("a.PEM", Pem));
        assert_eq!(adjust_format("file:a.cer", Pem), ("a.cer", Der));
        assert_eq!(adjust_format("a.der", Pem), ("a.der", Der));
        assert_eq!(adjust_format("a.p12", Pem), ("a.p12", Pkcs12));
        assert_eq!(adjust_format("a.key", Der), ("a.key", Der));
        assert_eq!(adjust_format("https://h/c.pem", Pem), ("https://h/c.pem", Http));
        assert_eq!(adjust_format("engine:id-1", Pem), ("id-1", Engine));
    }

    #[test]
    fn test_each_extension_loads() {
        let pki = TestPki::generate();
        let dir = tempfile::tempdir().unwrap();
        let loader = CredentialLoader::new(true);
        let pem = pki.client_cert.to_pem().unwrap();
        let der = pki.client_cert.to_der().unwrap();
        for (name, bytes, format, declared) in [
            ("c.pem", &pem, CredentialFormat::Pem, CredentialFormat::Der),
            ("c.crt", &pem, CredentialFormat::Pem, CredentialFormat::Der),
            ("c.der", &der, CredentialFormat::Der, CredentialFormat::Pem),
            ("c.cer", &der, CredentialFormat::Der, CredentialFormat::Pem),
        ] {
            let path = dir.path().join(name);
            fs::write(&path, bytes).unwrap();
            let path = path.to_str().unwrap();
            // the extension alone must pick the parser matching the content
            assert_eq!(adjust_format(path, declared), (path, format), "{}", name);
            let cert = loader.load_cert(path, declared, None, "test cert").unwrap();
            assert_eq!(cert.to_der().unwrap(), der);
        }
        let p12 = dir.path().join("c.p12");
        fs::write(&p12, pki.client_pkcs12("")).unwrap();
        assert_eq!(adjust_format(p12.to_str().unwrap(), CredentialFormat::Pem).1, CredentialFormat::Pkcs12);
        let cred = loader
            .load(p12.to_str().unwrap(), CredentialFormat::Pem, None, "test credential")
            .unwrap();
        assert_eq!(cred.cert.unwrap().to_der().unwrap(), der);
        assert!(cred.key.is_some());
        assert_eq!(cred.chain.len(), 1);
    }

    #[test]
    fn test_key_directory_provider() {
        use openssl::symm::Cipher;

        let pki = TestPki::generate();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("client.pem"), pki.client_key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        fs::write(
            dir.path().join("locked.pem"),
            pki.client_key
                .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), b"s3cret")
                .unwrap(),
        )
        .unwrap();

        let without_store = CredentialLoader::new(true);
        assert!(matches!(
            without_store.load_key("engine:client", CredentialFormat::Pem, None, "test key"),
            Err(CmpError::ProtocolConfig(_))
        ));

        let loader = CredentialLoader::new(true).with_key_provider(Arc::new(KeyDirectory::open(dir.path(), true).unwrap()));
        let key = loader.load_key("engine:client", CredentialFormat::Pem, None, "test key").unwrap();
        assert!(key.public_eq(&pki.client_key));

        // keyform ENGINE routes plain identifiers to the store
        let key = loader.load_key("client", CredentialFormat::Engine, None, "test key").unwrap();
        assert!(key.public_eq(&pki.client_key));

        let pass = SecretSource::new("pass:s3cret");
        let key = loader
            .load_key("engine:locked", CredentialFormat::Pem, Some(&pass), "test key")
            .unwrap();
        assert!(key.public_eq(&pki.client_key));
        assert!(matches!(
            loader.load_key("engine:locked", CredentialFormat::Pem, None, "test key"),
            Err(CmpError::CredentialMismatch(_))
        ));

        assert!(matches!(
            loader.load_key("engine:../client", CredentialFormat::Pem, None, "test key"),
            Err(CmpError::ProtocolConfig(_))
        ));
        assert!(matches!(
            loader.load_key("engine:missing", CredentialFormat::Pem, None, "test key"),
            Err(CmpError::Io { .. })
        ));
        assert!(KeyDirectory::open(dir.path().join("client.pem"), true).is_err());
    }

    #[test]
    fn test_pem_named_der_content_falls_back() {
        let pki = TestPki::generate();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actually-der.pem");
        fs::write(&path, pki.client_cert.to_der().unwrap()).unwrap();
        let cert = CredentialLoader::new(true)
            .load_cert(path.to_str().unwrap(), CredentialFormat::Pem, None, "test cert")
            .unwrap();
        assert_eq!(cert.to_der().unwrap(), pki.client_cert.to_der().unwrap());
    }

    #[test]
    fn test_pkcs12_password_handling() {
        let pki = TestPki::generate();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.p12");
        fs::write(&path, pki.client_pkcs12("s3cret")).unwrap();
        let loader = CredentialLoader::new(true);

        let good = SecretSource::new("pass:s3cret");
        let cred = loader
            .load(path.to_str().unwrap(), CredentialFormat::Pkcs12, Some(&good), "client credential")
            .unwrap();
        assert!(cred.key.is_some());

        let bad = SecretSource::new("pass:wrong");
        match loader.load(path.to_str().unwrap(), CredentialFormat::Pkcs12, Some(&bad), "client credential") {
            Err(CmpError::Format(msg)) => assert!(msg.contains("mac verify error")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        let missing = dir.path().join("missing.p12");
        assert!(matches!(
            loader.load(missing.to_str().unwrap(), CredentialFormat::Pkcs12, None, "x"),
            Err(CmpError::Io { .. })
        ));
    }

    #[test]
    fn test_garbage_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.pem");
        fs::write(&path, b"not a certificate").unwrap();
        assert!(matches!(
            CredentialLoader::new(true).load_certs(path.to_str().unwrap(), CredentialFormat::Pem, None, "junk"),
            Err(CmpError::Format(_))
        ));
    }

    #[test]
    fn test_save_reload_round_trip() {
        let pki = TestPki::generate();
        let dir = tempfile::tempdir().unwrap();
        let loader = CredentialLoader::new(true);
        for (name, format) in [("out.pem", CredentialFormat::Pem), ("out.der", CredentialFormat::Der)] {
            let path = dir.path().join(name);
            save_certs(&[pki.client_cert.clone()], &path, format, "certificate").unwrap();
            let first = fs::read(&path).unwrap();
            let reloaded = loader.load_cert(path.to_str().unwrap(), format, None, "saved").unwrap();
            assert_eq!(reloaded.to_der().unwrap(), pki.client_cert.to_der().unwrap());
            save_certs(&[reloaded], &path, format, "certificate").unwrap();
            assert_eq!(fs::read(&path).unwrap(), first);
        }
        let none = dir.path().join("none.pem");
        assert_eq!(save_certs(&[], &none, CredentialFormat::Pem, "nothing").unwrap(), 0);
        assert!(!none.exists());
    }

    #[test]
    fn test_cert_list_merge_policy() {
        let pki = TestPki::generate();
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pem");
        let b = dir.path().join("b.pem");
        save_certs(&[pki.root_cert.clone(), pki.client_cert.clone()], &a, CredentialFormat::Pem, "a").unwrap();
        save_certs(&[pki.client_cert.clone()], &b, CredentialFormat::Pem, "b").unwrap();
        let list = format!("{}, {}", a.display(), b.display());
        let loader = CredentialLoader::new(true);

        let all = loader.load_cert_list(&list, CredentialFormat::Pem, None, "certs", MergePolicy::KEEP_ALL).unwrap();
        assert_eq!(all.len(), 3);
        let dedup = loader.load_cert_list(&list, CredentialFormat::Pem, None, "certs", MergePolicy::DEDUP).unwrap();
        assert_eq!(dedup.len(), 2);
        let no_roots = MergePolicy { dedup: true, exclude_self_signed: true };
        let intermediates = loader.load_cert_list(&list, CredentialFormat::Pem, None, "certs", no_roots).unwrap();
        assert_eq!(intermediates.len(), 1);
        assert!(is_self_signed(&pki.root_cert));
    }

    #[test]
    fn test_expiry_warning_count_and_key_match() {
        let pki = TestPki::generate();
        // far in the future, all test certificates have expired by then
        let loader = CredentialLoader::new(true).with_check_time(Some(4_000_000_000));
        assert_eq!(loader.warn_expired(&[pki.root_cert.clone(), pki.client_cert.clone()], "test"), 2);
        assert_eq!(CredentialLoader::new(true).warn_expired(&[pki.client_cert.clone()], "test"), 0);

        let good = Credential { cert: Some(pki.client_cert.clone()), key: Some(pki.client_key.clone()), chain: vec![] };
        good.check_key_matches("client").unwrap();
        let bad = Credential { cert: Some(pki.client_cert.clone()), key: Some(pki.server_key.clone()), chain: vec![] };
        assert!(matches!(bad.check_key_matches("client"), Err(CmpError::CredentialMismatch(_))));
    }

    #[test]
    fn test_encrypted_key_needs_passphrase() {
        let pki = TestPki::generate();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        let pem = pki
            .client_key
            .private_key_to_pem_pkcs8_passphrase(openssl::symm::Cipher::aes_256_cbc(), b"pw")
            .unwrap();
        fs::write(&path, pem).unwrap();
        let loader = CredentialLoader::new(true);
        assert!(loader.load_key(path.to_str().unwrap(), CredentialFormat::Pem, None, "key").is_err());
        let key = loader
            .load_key(path.to_str().unwrap(), CredentialFormat::Pem, Some(&SecretSource::new("pass:pw")), "key")
            .unwrap();
        assert!(key.public_eq(&pki.client_key));
    }
}
