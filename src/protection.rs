//! Protection Configurator
//!
//! Outgoing messages are protected by a [`Protector`]: shared-secret MAC
//! (password-based MAC over the header, body and algorithm), signature with
//! a certificate and key, or no protection at all. Incoming messages are
//! checked by a [`MessageVerifier`], whose acceptance of unprotected messages
//! is a relaxation independent of how this side sends.
//!
//! The cryptographic primitives themselves are OpenSSL's; this module only
//! decides which one applies and wires the credentials in.

use crate::configs::AppConfig;
use crate::credentials::{name_to_string, Credential, CredentialFormat, CredentialLoader, MergePolicy};
use crate::error::{CmpError, Result};
use crate::passphrase::Passphrase;
use crate::protocol::{random_bytes, PkiMessage, ProtectionAlg};
use crate::truststore::{TrustStore, VerifyParams};
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;

/// Iteration count of the password-based MAC one-way function
pub const PBM_ITERATIONS: u32 = 500;
/// Upper bound on the iteration count accepted from a peer
pub const PBM_MAX_ITERATIONS: u32 = 100_000;
pub const PBM_SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionMode {
    SharedSecret,
    Signature,
    Unprotected,
}

pub(crate) fn digest_by_name(name: &str) -> Result<MessageDigest> {
    MessageDigest::from_name(name).ok_or_else(|| {
        CmpError::ProtocolConfig(format!("digest algorithm name not recognized: '{}'", name))
    })
}

fn mac_digest(mac: &str) -> Result<MessageDigest> {
    let name = mac.strip_prefix("hmac-").ok_or_else(|| {
        CmpError::ProtocolConfig(format!("MAC algorithm name not recognized: '{}'", mac))
    })?;
    digest_by_name(name)
}

fn uses_digest(key_id: Id) -> bool {
    !matches!(key_id, Id::ED25519 | Id::ED448)
}

/// Sign `data` with `key`, hashing with `digest` unless the key type signs raw messages
pub(crate) fn sign(key: &PKeyRef<Private>, digest: &str, data: &[u8]) -> Result<Vec<u8>> {
    if uses_digest(key.id()) {
        let mut signer = Signer::new(digest_by_name(digest)?, key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    } else {
        let mut signer = Signer::new_without_digest(key)?;
        Ok(signer.sign_oneshot_to_vec(data)?)
    }
}

pub(crate) fn verify_signature<T: HasPublic>(
    key: &PKeyRef<T>,
    digest: &str,
    data: &[u8],
    signature: &[u8],
) -> Result<bool> {
    if uses_digest(key.id()) {
        let mut verifier = Verifier::new(digest_by_name(digest)?, key)?;
        verifier.update(data)?;
        Ok(verifier.verify(signature).unwrap_or(false))
    } else {
        let mut verifier = Verifier::new_without_digest(key)?;
        Ok(verifier.verify_oneshot(signature, data).unwrap_or(false))
    }
}

/// Password-based MAC: iterated one-way function over secret and salt, then HMAC
pub(crate) fn compute_mac(
    secret: &[u8],
    salt: &[u8],
    iterations: u32,
    owf: &str,
    mac: &str,
    data: &[u8],
) -> Result<Vec<u8>> {
    if iterations > PBM_MAX_ITERATIONS {
        return Err(CmpError::MessageCheck(format!(
            "PBM iteration count {} exceeds maximum of {}",
            iterations, PBM_MAX_ITERATIONS
        )));
    }
    let owf_md = digest_by_name(owf)?;
    let mut base = Vec::with_capacity(secret.len() + salt.len());
    base.extend_from_slice(secret);
    base.extend_from_slice(salt);
    let mut key = hash(owf_md, &base)?.to_vec();
    for _ in 1..iterations.max(1) {
        key = hash(owf_md, &key)?.to_vec();
    }
    let pkey = PKey::hmac(&key)?;
    let mut signer = Signer::new(mac_digest(mac)?, &pkey)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

enum OutgoingMode {
    Unprotected,
    Mac {
        secret: Passphrase,
        owf: String,
        mac: String,
    },
    Signature {
        cert: X509,
        key: PKey<Private>,
        chain: Vec<X509>,
        digest: String,
    },
}

/// Protection applied to outgoing messages
pub struct Protector {
    sender: String,
    sender_kid: Option<Vec<u8>>,
    mode: OutgoingMode,
    extra_certs: Vec<X509>,
}

impl std::fmt::Debug for Protector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protector")
            .field("sender", &self.sender)
            .field("mode", &self.mode())
            .field("extra_certs", &self.extra_certs.len())
            .finish()
    }
}

impl Protector {
    pub fn unprotected(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            sender_kid: None,
            mode: OutgoingMode::Unprotected,
            extra_certs: Vec::new(),
        }
    }

    /// Shared-secret protection; `reference` identifies the secret to the peer
    pub fn mac(secret: Passphrase, reference: Option<&str>, sender: impl Into<String>, mac: &str) -> Result<Self> {
        mac_digest(mac)?;
        Ok(Self {
            sender: sender.into(),
            sender_kid: reference.map(|r| r.as_bytes().to_vec()),
            mode: OutgoingMode::Mac {
                secret,
                owf: "sha256".to_string(),
                mac: mac.to_string(),
            },
            extra_certs: Vec::new(),
        })
    }

    /// Signature protection; the sender is the certificate's subject
    pub fn signature(cert: X509, key: PKey<Private>, chain: Vec<X509>, digest: &str) -> Result<Self> {
        digest_by_name(digest)?;
        let public = cert.public_key()?;
        if !public.public_eq(&key) {
            return Err(CmpError::CredentialMismatch(format!(
                "private key does not match certificate '{}'",
                name_to_string(cert.subject_name())
            )));
        }
        Ok(Self {
            sender: name_to_string(cert.subject_name()),
            sender_kid: cert.subject_key_id().map(|id| id.as_slice().to_vec()),
            mode: OutgoingMode::Signature {
                cert,
                key,
                chain,
                digest: digest.to_string(),
            },
            extra_certs: Vec::new(),
        })
    }

    /// Certificates to place in the extraCerts of every protected message
    pub fn with_extra_certs(mut self, certs: Vec<X509>) -> Self {
        self.extra_certs = certs;
        self
    }

    pub fn mode(&self) -> ProtectionMode {
        match self.mode {
            OutgoingMode::Unprotected => ProtectionMode::Unprotected,
            OutgoingMode::Mac { .. } => ProtectionMode::SharedSecret,
            OutgoingMode::Signature { .. } => ProtectionMode::Signature,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn sender_kid(&self) -> Option<&[u8]> {
        self.sender_kid.as_deref()
    }

    /// Apply protection to a message whose header and body are final
    ///
    /// Any extraCerts already in the message stay, after the signer
    /// certificate, its chain and the configured extra certificates.
    pub fn protect(&self, msg: &mut PkiMessage) -> Result<()> {
        let mut extra = Vec::new();
        if let OutgoingMode::Signature { cert, chain, .. } = &self.mode {
            extra.push(cert.to_der()?);
            for c in chain {
                extra.push(c.to_der()?);
            }
        }
        for c in &self.extra_certs {
            extra.push(c.to_der()?);
        }
        extra.append(&mut msg.extra_certs);
        msg.extra_certs = extra;

        match &self.mode {
            OutgoingMode::Unprotected => {
                msg.protection_alg = None;
                msg.protection = None;
            }
            OutgoingMode::Mac { secret, owf, mac } => {
                let salt = random_bytes(PBM_SALT_LEN)?;
                msg.protection_alg = Some(ProtectionAlg::PasswordBasedMac {
                    salt: salt.clone(),
                    iterations: PBM_ITERATIONS,
                    owf: owf.clone(),
                    mac: mac.clone(),
                });
                let data = msg.protected_part()?;
                msg.protection = Some(compute_mac(secret.as_bytes(), &salt, PBM_ITERATIONS, owf, mac, &data)?);
            }
            OutgoingMode::Signature { key, digest, .. } => {
                msg.protection_alg = Some(ProtectionAlg::Signature { digest: digest.clone() });
                let data = msg.protected_part()?;
                msg.protection = Some(sign(key, digest, &data)?);
            }
        }
        Ok(())
    }
}

/// Checks applied to incoming messages
pub struct MessageVerifier {
    desc: &'static str,
    secret: Option<Passphrase>,
    pinned: Option<X509>,
    trust: Option<TrustStore>,
    untrusted: Vec<X509>,
    expected_sender: Option<String>,
    ignore_keyusage: bool,
    accept_unprotected: bool,
    accept_unprotected_errors: bool,
}

impl std::fmt::Debug for MessageVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageVerifier")
            .field("desc", &self.desc)
            .field("secret", &self.secret.is_some())
            .field("pinned", &self.pinned.is_some())
            .field("trust", &self.trust)
            .field("expected_sender", &self.expected_sender)
            .finish()
    }
}

impl MessageVerifier {
    /// A verifier with no credentials; `desc` names the checked messages
    pub fn new(desc: &'static str) -> Self {
        Self {
            desc,
            secret: None,
            pinned: None,
            trust: None,
            untrusted: Vec::new(),
            expected_sender: None,
            ignore_keyusage: false,
            accept_unprotected: false,
            accept_unprotected_errors: false,
        }
    }

    pub fn with_secret(mut self, secret: Option<Passphrase>) -> Self {
        self.secret = secret;
        self
    }

    /// Accept signatures only from this certificate, without chain validation
    pub fn with_pinned_cert(mut self, cert: Option<X509>) -> Self {
        self.pinned = cert;
        self
    }

    pub fn with_trust(mut self, trust: Option<TrustStore>) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_untrusted(mut self, certs: Vec<X509>) -> Self {
        self.untrusted = certs;
        self
    }

    pub fn expect_sender(mut self, sender: Option<String>) -> Self {
        self.expected_sender = sender;
        self
    }

    pub fn ignore_keyusage(mut self, ignore: bool) -> Self {
        self.ignore_keyusage = ignore;
        self
    }

    pub fn accept_unprotected(mut self, accept: bool) -> Self {
        self.accept_unprotected = accept;
        self
    }

    pub fn accept_unprotected_errors(mut self, accept: bool) -> Self {
        self.accept_unprotected_errors = accept;
        self
    }

    pub fn pinned_cert(&self) -> Option<&X509> {
        self.pinned.as_ref()
    }

    /// Check sender and protection of an incoming message
    pub fn verify(&self, msg: &PkiMessage) -> Result<()> {
        if let Some(expected) = &self.expected_sender {
            if &msg.header.sender != expected {
                return Err(CmpError::MessageCheck(format!(
                    "unexpected sender '{}' of {}, expected '{}'",
                    msg.header.sender, self.desc, expected
                )));
            }
        }

        let (alg, protection) = match (&msg.protection_alg, &msg.protection) {
            (Some(alg), Some(protection)) => (alg, protection),
            _ => {
                if self.accept_unprotected {
                    log::warn!("accepting unprotected {} ({})", self.desc, msg.body.name());
                    return Ok(());
                }
                if self.accept_unprotected_errors && msg.is_negative() {
                    log::warn!("accepting unprotected negative {} ({})", self.desc, msg.body.name());
                    return Ok(());
                }
                return Err(CmpError::MessageCheck(format!(
                    "{} ({}) is not protected",
                    self.desc,
                    msg.body.name()
                )));
            }
        };

        let data = msg.protected_part()?;
        match alg {
            ProtectionAlg::PasswordBasedMac { salt, iterations, owf, mac } => {
                let secret = self.secret.as_ref().ok_or_else(|| {
                    CmpError::MessageCheck(format!("no secret available to verify MAC-protected {}", self.desc))
                })?;
                let expected = compute_mac(secret.as_bytes(), salt, *iterations, owf, mac, &data)?;
                if expected.len() != protection.len() || !openssl::memcmp::eq(&expected, protection) {
                    return Err(CmpError::MessageCheck(format!("MAC verification of {} failed", self.desc)));
                }
            }
            ProtectionAlg::Signature { digest } => {
                let signer = self.signer_cert(msg)?;
                if !self.ignore_keyusage {
                    check_key_usage(&signer)?;
                }
                let public = signer.public_key()?;
                if !verify_signature(&public, digest, &data, protection)? {
                    return Err(CmpError::MessageCheck(format!(
                        "signature of {} by '{}' does not verify",
                        self.desc,
                        name_to_string(signer.subject_name())
                    )));
                }
            }
        }
        Ok(())
    }

    /// Determine and validate the certificate that signed `msg`
    fn signer_cert(&self, msg: &PkiMessage) -> Result<X509> {
        if let Some(pinned) = &self.pinned {
            return Ok(pinned.clone());
        }
        let trust = self.trust.as_ref().ok_or_else(|| {
            CmpError::MessageCheck(format!("no trust anchors available to verify signed {}", self.desc))
        })?;

        let mut extra = Vec::with_capacity(msg.extra_certs.len());
        for der in &msg.extra_certs {
            extra.push(X509::from_der(der).map_err(|e| {
                CmpError::Decode(format!("invalid certificate in extraCerts of {}: {}", self.desc, e))
            })?);
        }
        let candidate = extra
            .iter()
            .chain(self.untrusted.iter())
            .find(|c| name_to_string(c.subject_name()) == msg.header.sender)
            .cloned()
            .ok_or_else(|| {
                CmpError::MessageCheck(format!(
                    "no certificate for sender '{}' of {} found",
                    msg.header.sender, self.desc
                ))
            })?;

        let mut chain = extra.clone();
        chain.extend(self.untrusted.iter().cloned());
        trust.verify(&candidate, &chain)?;
        Ok(candidate)
    }
}

fn check_key_usage(cert: &X509) -> Result<()> {
    let der = cert.to_der()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| CmpError::MessageCheck(format!("cannot parse signer certificate: {}", e)))?;
    match parsed.key_usage() {
        Ok(Some(ku)) if !ku.value.digital_signature() => Err(CmpError::MessageCheck(format!(
            "keyUsage of signer certificate '{}' does not allow digitalSignature",
            name_to_string(cert.subject_name())
        ))),
        Ok(_) => Ok(()),
        Err(e) => Err(CmpError::MessageCheck(format!("invalid keyUsage extension: {}", e))),
    }
}

/// Outgoing protection of the client plus what its credentials contribute elsewhere
pub struct ClientProtection {
    pub protector: Protector,
    /// Shared secret, also used to verify MAC-protected responses
    pub secret: Option<Passphrase>,
    pub credential: Credential,
    /// Further certificates from the client certificate file
    pub untrusted: Vec<X509>,
}

/// Set up protection of outgoing requests
///
/// Rules:
/// - credentials are required unless requests are sent unprotected
/// - without `cert`, the sender must be identified by `ref` or `subject`
/// - `cert` and `key` go together unless `secret` is given
/// - `secret` takes precedence over signature protection
pub fn configure_client_protection(config: &AppConfig, loader: &CredentialLoader) -> Result<ClientProtection> {
    let opts = &config.protection;
    let certsform = CredentialFormat::from_name(&config.formats.certsform)?;
    let keyform = CredentialFormat::from_name(&config.formats.keyform)?;
    digest_by_name(&opts.digest)?;
    mac_digest(&opts.mac)?;

    if !opts.unprotected_requests && opts.secret.is_none() && opts.cert.is_none() && opts.key.is_none() {
        return Err(CmpError::CredentialMismatch(
            "must give -key or -secret unless -unprotected_requests is used".to_string(),
        ));
    }
    if !opts.unprotected_requests
        && opts.reference.is_none()
        && opts.cert.is_none()
        && config.request.subject.is_none()
    {
        return Err(CmpError::CredentialMismatch(
            "must give -ref if no -cert and no -subject given".to_string(),
        ));
    }
    if opts.secret.is_none() && (opts.cert.is_some() != opts.key.is_some()) {
        return Err(CmpError::CredentialMismatch(
            "must give both -cert and -key options or neither".to_string(),
        ));
    }

    let mut credential = Credential::default();
    let mut untrusted = Vec::new();
    if let Some(cert_uri) = &opts.cert {
        let pass = opts.keypass.as_ref().or(config.formats.otherpass.as_ref());
        credential = loader.load(cert_uri, certsform, pass, "CMP client certificate (optionally with chain)")?;
        untrusted = std::mem::take(&mut credential.chain);
    }
    if let Some(key_uri) = &opts.key {
        credential.key = Some(loader.load_key(
            key_uri,
            keyform,
            opts.keypass.as_ref(),
            "private key for CMP client certificate",
        )?);
    }
    credential.check_key_matches("CMP client")?;

    let extra = match &opts.extracerts {
        Some(list) => loader.load_cert_list(
            list,
            certsform,
            config.formats.otherpass.as_ref(),
            "extra certificates for CMP",
            MergePolicy::KEEP_ALL,
        )?,
        None => Vec::new(),
    };

    let secret = match &opts.secret {
        Some(source) => Some(source.resolve("-secret")?),
        None => None,
    };

    let subject_sender = config.request.subject.clone().unwrap_or_default();
    let protector = if opts.unprotected_requests {
        let sender = match &credential.cert {
            Some(cert) => name_to_string(cert.subject_name()),
            None => subject_sender,
        };
        Protector::unprotected(sender)
    } else if let Some(secret) = &secret {
        if opts.cert.is_some() || opts.key.is_some() {
            log::warn!("-cert and -key not used for protection since -secret is given");
        }
        Protector::mac(secret.clone(), opts.reference.as_deref(), subject_sender, &opts.mac)?
    } else {
        match (&credential.cert, &credential.key) {
            (Some(cert), Some(key)) => Protector::signature(cert.clone(), key.clone(), untrusted.clone(), &opts.digest)?,
            _ => {
                return Err(CmpError::CredentialMismatch(
                    "signature protection needs both a client certificate and its private key".to_string(),
                ))
            }
        }
    };

    Ok(ClientProtection {
        protector: protector.with_extra_certs(extra),
        secret,
        credential,
        untrusted,
    })
}

/// Set up verification of responses
///
/// `srvcert` pins the server certificate and makes `trusted` and
/// `recipient` irrelevant; otherwise responses signed by a certificate that
/// chains to `trusted` are accepted. The CMP server trust store never carries
/// a host name expectation.
pub fn configure_client_verifier(
    config: &AppConfig,
    loader: &CredentialLoader,
    params: &VerifyParams,
    secret: Option<Passphrase>,
    client_untrusted: Vec<X509>,
) -> Result<MessageVerifier> {
    let opts = &config.verify;
    let certsform = CredentialFormat::from_name(&config.formats.certsform)?;
    let otherpass = config.formats.otherpass.as_ref();

    if secret.is_none() && opts.srvcert.is_none() && opts.trusted.is_none() {
        return Err(CmpError::CredentialMismatch(
            "missing -secret, -srvcert or -trusted for verifying responses".to_string(),
        ));
    }

    let mut untrusted = Vec::new();
    if let Some(list) = &opts.untrusted {
        untrusted = loader.load_cert_list(list, certsform, otherpass, "untrusted certificates", MergePolicy::DEDUP)?;
    }
    crate::credentials::merge_certs(&mut untrusted, client_untrusted, MergePolicy::DEDUP)?;

    let mut pinned = None;
    let mut trust = None;
    if let Some(srvcert) = &opts.srvcert {
        if opts.trusted.is_some() {
            log::warn!("-trusted option is ignored since -srvcert option is present");
        }
        if opts.recipient.is_some() {
            log::warn!("-recipient option is ignored since -srvcert option is present");
        }
        pinned = Some(loader.load_cert(srvcert, certsform, otherpass, "directly trusted CMP server certificate")?);
    } else if let Some(list) = &opts.trusted {
        let certs = loader.load_cert_list(list, certsform, otherpass, "trusted certs for CMP server", MergePolicy::KEEP_ALL)?;
        let mut store = TrustStore::build(certs, params, "trust store for CMP server")?;
        store.set_identity(None);
        trust = Some(store);
    }

    Ok(MessageVerifier::new("response")
        .with_secret(secret)
        .with_pinned_cert(pinned)
        .with_trust(trust)
        .with_untrusted(untrusted)
        .expect_sender(opts.expect_sender.clone())
        .ignore_keyusage(opts.ignore_keyusage)
        .accept_unprotected_errors(opts.unprotected_errors))
}
