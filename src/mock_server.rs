//! Mock Server State Model
//!
//! A deterministic, configuration-driven stand-in for a CMP responder. The
//! [`MockServerConfig`] is fixed at construction; the only mutable state is
//! the bookkeeping of the transaction in progress (polls served, pending
//! certificate confirmation).
//!
//! # Behaviour per request
//!
//! - Request protection is checked against the server's accept policy; a
//!   failing request gets a negative response, never silence.
//! - A new transaction reusing the ID of the one in progress is rejected
//!   with `transactionIdInUse`.
//! - `ir`/`cr`/`kur`/`p10cr`: proof-of-possession is verified. With
//!   `poll_count = n > 0` the initial request and the following polls answer
//!   "waiting" until `n` of them have been served; the next poll returns the
//!   final result.
//! - `certConf` is answered with `pkiConf`, `rr` with `rp`, `genm` with a
//!   `genp` echoing the request's InfoTypeAndValues, and an error message
//!   from the client is acknowledged with `pkiConf`.
//! - With `send_error` every request is answered with an error message
//!   carrying the configured status.

use crate::configs::AppConfig;
use crate::credentials::{name_to_string, CredentialFormat, CredentialLoader, MergePolicy};
use crate::error::{CmpError, Result};
use crate::protection::{verify_signature, MessageVerifier, Protector};
use crate::protocol::{
    cert_hash, failure, popo_input, random_bytes, unix_now, CertRepMessage, CertRequest, CertResponse,
    PkiBody, PkiHeader, PkiMessage, PkiStatus, PkiStatusInfo, ProofOfPossession, FAILURE_INFO_MAX,
    FAILURE_INFO_MAX_BIT_PATTERN, NONCE_LEN,
};
use crate::request::cert_id_of;
use crate::truststore::{TrustStore, VerifyParams};
use openssl::pkey::PKey;
use openssl::x509::{X509Req, X509};

/// Immutable behaviour settings of the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockServerConfig {
    pub poll_count: u32,
    pub check_after: u64,
    pub grant_implicit_confirm: bool,
    /// Status, failure bits and status string placed in responses
    pub status: PkiStatusInfo,
    pub send_error: bool,
    pub send_unprotected: bool,
    pub send_unprot_err: bool,
    pub accept_unprotected: bool,
    pub accept_unprot_err: bool,
    pub accept_raverified: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            poll_count: 0,
            check_after: 1,
            grant_implicit_confirm: false,
            status: PkiStatusInfo::accepted(),
            send_error: false,
            send_unprotected: false,
            send_unprot_err: false,
            accept_unprotected: false,
            accept_unprot_err: false,
            accept_raverified: false,
        }
    }
}

impl MockServerConfig {
    /// Combine the failure index shorthand with an explicit bit pattern
    ///
    /// A failure index `k` becomes the single bit `1 << k` unless a bit
    /// pattern was given, which then wins with a warning.
    pub fn resolve_failure_bits(failure: Option<i64>, failurebits: Option<i64>) -> Result<u32> {
        if let Some(k) = failure {
            if !(0..=FAILURE_INFO_MAX as i64).contains(&k) {
                return Err(CmpError::ProtocolConfig(format!(
                    "-failure {} out of range, must be 0..{}",
                    k, FAILURE_INFO_MAX
                )));
            }
        }
        if let Some(bits) = failurebits {
            if !(0..=FAILURE_INFO_MAX_BIT_PATTERN as i64).contains(&bits) {
                return Err(CmpError::ProtocolConfig(format!(
                    "-failurebits {} out of range, must be 0..{}",
                    bits, FAILURE_INFO_MAX_BIT_PATTERN
                )));
            }
        }
        match (failure, failurebits) {
            (Some(_), Some(bits)) => {
                log::warn!("-failurebits overrides -failure");
                Ok(bits as u32)
            }
            (None, Some(bits)) => Ok(bits as u32),
            (Some(k), None) => Ok(1 << k),
            (None, None) => Ok(0),
        }
    }

    /// Build the configuration from the mock server options
    pub fn from_options(config: &AppConfig) -> Result<Self> {
        let m = &config.mock;
        let status = PkiStatus::from_code(m.pkistatus).ok_or_else(|| {
            CmpError::ProtocolConfig(format!("-pkistatus {} out of range, must be 0..6", m.pkistatus))
        })?;
        let failure_bits = Self::resolve_failure_bits(m.failure, m.failurebits)?;
        Ok(Self {
            poll_count: u32::try_from(m.poll_count)
                .map_err(|_| CmpError::ProtocolConfig("-poll_count out of range".to_string()))?,
            check_after: m.check_after.max(0) as u64,
            grant_implicit_confirm: m.grant_implicitconf,
            status: PkiStatusInfo::new(status, failure_bits, m.statusstring.clone()),
            send_error: m.send_error,
            send_unprotected: m.send_unprotected,
            send_unprot_err: m.send_unprot_err,
            accept_unprotected: m.accept_unprotected,
            accept_unprot_err: m.accept_unprot_err,
            accept_raverified: m.accept_raverified,
        })
    }
}

/// Certificates the mock server hands out
#[derive(Clone)]
pub struct MockResponses {
    pub rsp_cert: X509,
    pub rsp_extracerts: Vec<X509>,
    pub rsp_capubs: Vec<X509>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnrollKind {
    Ir,
    Cr,
    Kur,
    P10cr,
}

#[derive(Debug, Clone)]
struct PendingEnrollment {
    kind: EnrollKind,
    cert_req_id: i64,
    implicit_confirm: bool,
}

#[derive(Debug, Clone)]
struct ActiveTransaction {
    transaction_id: Vec<u8>,
    pending: Option<PendingEnrollment>,
    polls_served: u32,
    awaiting_confirm: bool,
}

/// A negative outcome of request processing
struct Refusal {
    status: PkiStatusInfo,
    /// False if the transaction in progress must survive this refusal
    end_transaction: bool,
}

impl Refusal {
    fn new(failure_bit: u32, text: impl Into<String>) -> Self {
        Self {
            status: PkiStatusInfo::rejection(failure_bit, text),
            end_transaction: true,
        }
    }
}

struct Reply {
    body: PkiBody,
    implicit_confirm: bool,
    extra_certs: Vec<X509>,
}

pub struct MockServer {
    config: MockServerConfig,
    responses: MockResponses,
    protector: Protector,
    verifier: MessageVerifier,
    active: Option<ActiveTransaction>,
}

impl MockServer {
    /// The verifier's unprotected-message policy is taken from `config`
    pub fn new(
        config: MockServerConfig,
        responses: MockResponses,
        protector: Protector,
        verifier: MessageVerifier,
    ) -> Self {
        let verifier = verifier
            .accept_unprotected(config.accept_unprotected)
            .accept_unprotected_errors(config.accept_unprot_err);
        Self {
            config,
            responses,
            protector,
            verifier,
            active: None,
        }
    }

    pub fn config(&self) -> &MockServerConfig {
        &self.config
    }

    /// Answer one request
    ///
    /// Protocol-level problems yield an error message; `Err` is returned only
    /// if the response itself cannot be produced.
    pub fn process(&mut self, request: &PkiMessage) -> Result<PkiMessage> {
        log::debug!("mock server received {}", request.body.name());
        let reply = match self.handle(request) {
            Ok(reply) => reply,
            Err(refusal) => {
                log::info!("mock server refuses {}: {}", request.body.name(), refusal.status);
                if refusal.end_transaction {
                    self.active = None;
                }
                Reply {
                    body: PkiBody::Error {
                        status: refusal.status,
                        details: None,
                    },
                    implicit_confirm: false,
                    extra_certs: Vec::new(),
                }
            }
        };
        self.respond(request, reply)
    }

    fn handle(&mut self, request: &PkiMessage) -> std::result::Result<Reply, Refusal> {
        self.verifier
            .verify(request)
            .map_err(|e| Refusal::new(failure::BAD_MESSAGE_CHECK, e.to_string()))?;

        let tid = &request.header.transaction_id;
        if request.body.starts_transaction() {
            if let Some(active) = &self.active {
                if &active.transaction_id == tid {
                    return Err(Refusal {
                        status: PkiStatusInfo::rejection(failure::TRANSACTION_ID_IN_USE, "transaction ID already in use"),
                        end_transaction: false,
                    });
                }
            }
            self.active = Some(ActiveTransaction {
                transaction_id: tid.clone(),
                pending: None,
                polls_served: 0,
                awaiting_confirm: false,
            });
        } else if self.active.as_ref().map(|a| &a.transaction_id) != Some(tid) {
            if let PkiBody::Error { status, .. } = &request.body {
                log::warn!("mock server received error outside a transaction: {}", status);
                return Ok(self.finish(PkiBody::PkiConf));
            }
            return Err(Refusal::new(failure::BAD_REQUEST, "no transaction with this ID in progress"));
        }

        if self.config.send_error {
            return Err(Refusal {
                status: self.config.status.clone(),
                end_transaction: true,
            });
        }

        match &request.body {
            PkiBody::Ir(req) => self.enroll(EnrollKind::Ir, req, request.header.implicit_confirm),
            PkiBody::Cr(req) => self.enroll(EnrollKind::Cr, req, request.header.implicit_confirm),
            PkiBody::Kur(req) => self.enroll(EnrollKind::Kur, req, request.header.implicit_confirm),
            PkiBody::P10cr { csr } => {
                self.check_csr(csr)?;
                self.start_enrollment(EnrollKind::P10cr, 0, request.header.implicit_confirm)
            }
            PkiBody::PollReq { cert_req_id } => self.poll(*cert_req_id),
            PkiBody::CertConf { statuses } => self.confirm(statuses),
            PkiBody::Rr(details) => {
                let expected = cert_id_of(&self.responses.rsp_cert)
                    .map_err(|e| Refusal::new(failure::SYSTEM_FAILURE, e.to_string()))?;
                if details.cert_id != expected {
                    return Err(Refusal::new(failure::BAD_CERT_ID, "certificate to revoke is unknown"));
                }
                Ok(self.finish(PkiBody::Rp {
                    status: self.config.status.clone(),
                }))
            }
            PkiBody::Genm { itavs } => Ok(self.finish(PkiBody::Genp { itavs: itavs.clone() })),
            PkiBody::Error { status, .. } => {
                log::warn!("mock server received error from client: {}", status);
                Ok(self.finish(PkiBody::PkiConf))
            }
            other => Err(Refusal::new(
                failure::BAD_REQUEST,
                format!("unexpected request type {}", other.name()),
            )),
        }
    }

    /// Reply that completes the transaction
    fn finish(&mut self, body: PkiBody) -> Reply {
        self.active = None;
        Reply {
            body,
            implicit_confirm: false,
            extra_certs: Vec::new(),
        }
    }

    fn enroll(&mut self, kind: EnrollKind, req: &CertRequest, implicit: bool) -> std::result::Result<Reply, Refusal> {
        self.check_popo(req)?;
        self.start_enrollment(kind, req.cert_req_id, implicit)
    }

    fn start_enrollment(&mut self, kind: EnrollKind, cert_req_id: i64, implicit: bool) -> std::result::Result<Reply, Refusal> {
        let pending = PendingEnrollment {
            kind,
            cert_req_id,
            implicit_confirm: implicit,
        };
        if self.config.poll_count > 0 {
            if let Some(active) = self.active.as_mut() {
                active.pending = Some(pending);
                active.polls_served = 1;
            }
            return Ok(Reply {
                body: rep_body(
                    kind,
                    CertRepMessage {
                        ca_pubs: Vec::new(),
                        responses: vec![CertResponse {
                            cert_req_id,
                            status: PkiStatusInfo::waiting(),
                            certificate: None,
                        }],
                    },
                ),
                implicit_confirm: false,
                extra_certs: Vec::new(),
            });
        }
        self.final_response(pending)
    }

    fn poll(&mut self, cert_req_id: i64) -> std::result::Result<Reply, Refusal> {
        let poll_count = self.config.poll_count;
        let check_after = self.config.check_after;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Refusal::new(failure::BAD_REQUEST, "no transaction in progress"))?;
        let pending = active
            .pending
            .clone()
            .ok_or_else(|| Refusal::new(failure::BAD_REQUEST, "no certificate request is waiting"))?;
        if pending.cert_req_id != cert_req_id {
            return Err(Refusal::new(failure::BAD_REQUEST, "unknown certReqId in pollReq"));
        }
        if active.polls_served < poll_count {
            active.polls_served += 1;
            return Ok(Reply {
                body: PkiBody::PollRep {
                    cert_req_id,
                    check_after,
                },
                implicit_confirm: false,
                extra_certs: Vec::new(),
            });
        }
        active.pending = None;
        self.final_response(pending)
    }

    fn final_response(&mut self, pending: PendingEnrollment) -> std::result::Result<Reply, Refusal> {
        let status = self.config.status.clone();
        let positive = status.status.is_positive();
        let der = |cert: &X509| cert.to_der().map_err(|e| Refusal::new(failure::SYSTEM_FAILURE, e.to_string()));

        let certificate = if positive { Some(der(&self.responses.rsp_cert)?) } else { None };
        let mut ca_pubs = Vec::new();
        if positive && pending.kind == EnrollKind::Ir {
            for cert in &self.responses.rsp_capubs {
                ca_pubs.push(der(cert)?);
            }
        }
        let implicit = positive && pending.implicit_confirm && self.config.grant_implicit_confirm;
        let awaiting_confirm = positive && !implicit;
        if awaiting_confirm {
            if let Some(active) = self.active.as_mut() {
                active.awaiting_confirm = true;
            }
        } else {
            self.active = None;
        }

        Ok(Reply {
            body: rep_body(
                pending.kind,
                CertRepMessage {
                    ca_pubs,
                    responses: vec![CertResponse {
                        cert_req_id: pending.cert_req_id,
                        status,
                        certificate,
                    }],
                },
            ),
            implicit_confirm: implicit,
            extra_certs: if positive { self.responses.rsp_extracerts.clone() } else { Vec::new() },
        })
    }

    fn confirm(&mut self, statuses: &[crate::protocol::CertStatus]) -> std::result::Result<Reply, Refusal> {
        let awaiting = self.active.as_ref().map(|a| a.awaiting_confirm).unwrap_or(false);
        if !awaiting {
            return Err(Refusal::new(failure::BAD_REQUEST, "no certificate confirmation expected"));
        }
        let status = statuses
            .first()
            .ok_or_else(|| Refusal::new(failure::BAD_REQUEST, "empty certConf"))?;
        let der = self
            .responses
            .rsp_cert
            .to_der()
            .map_err(|e| Refusal::new(failure::SYSTEM_FAILURE, e.to_string()))?;
        let expected = cert_hash(&der).map_err(|e| Refusal::new(failure::SYSTEM_FAILURE, e.to_string()))?;
        if status.cert_hash != expected {
            return Err(Refusal::new(failure::BAD_CERT_ID, "wrong certHash in certConf"));
        }
        if let Some(info) = &status.status {
            if info.status == PkiStatus::Rejection {
                log::warn!("client rejected the enrolled certificate: {}", info);
            }
        }
        Ok(self.finish(PkiBody::PkiConf))
    }

    fn check_popo(&self, req: &CertRequest) -> std::result::Result<(), Refusal> {
        match &req.popo {
            None => Err(Refusal::new(failure::BAD_POP, "proof-of-possession missing")),
            Some(ProofOfPossession::RaVerified) if self.config.accept_raverified => Ok(()),
            Some(ProofOfPossession::RaVerified) => {
                Err(Refusal::new(failure::BAD_POP, "RAVERIFIED is not accepted"))
            }
            Some(ProofOfPossession::Signature { digest, value }) => {
                let key_der = req
                    .template
                    .public_key
                    .as_ref()
                    .ok_or_else(|| Refusal::new(failure::BAD_CERT_TEMPLATE, "public key missing in template"))?;
                let key = PKey::public_key_from_der(key_der)
                    .map_err(|_| Refusal::new(failure::BAD_CERT_TEMPLATE, "invalid public key in template"))?;
                let data = popo_input(&req.template).map_err(|e| Refusal::new(failure::BAD_DATA_FORMAT, e.to_string()))?;
                match verify_signature(&key, digest, &data, value) {
                    Ok(true) => Ok(()),
                    _ => Err(Refusal::new(failure::BAD_POP, "proof-of-possession signature does not verify")),
                }
            }
            Some(_) => Err(Refusal::new(failure::BAD_POP, "unsupported proof-of-possession method")),
        }
    }

    fn check_csr(&self, csr: &[u8]) -> std::result::Result<(), Refusal> {
        let req = X509Req::from_der(csr).map_err(|_| Refusal::new(failure::BAD_DATA_FORMAT, "invalid PKCS#10 request"))?;
        let key = req
            .public_key()
            .map_err(|_| Refusal::new(failure::BAD_DATA_FORMAT, "invalid public key in PKCS#10 request"))?;
        match req.verify(&key) {
            Ok(true) => Ok(()),
            _ => Err(Refusal::new(failure::BAD_POP, "PKCS#10 request signature does not verify")),
        }
    }

    fn respond(&self, request: &PkiMessage, reply: Reply) -> Result<PkiMessage> {
        let header = PkiHeader {
            sender: self.protector.sender().to_string(),
            recipient: request.header.sender.clone(),
            sender_kid: self.protector.sender_kid().map(|k| k.to_vec()),
            transaction_id: request.header.transaction_id.clone(),
            sender_nonce: random_bytes(NONCE_LEN)?,
            recip_nonce: Some(request.header.sender_nonce.clone()),
            message_time: unix_now(),
            implicit_confirm: reply.implicit_confirm,
            general_info: Vec::new(),
        };
        let mut msg = PkiMessage::new(header, reply.body);
        for cert in &reply.extra_certs {
            msg.extra_certs.push(cert.to_der()?);
        }
        let negative = msg.is_negative();
        if (negative && self.config.send_unprot_err) || (!negative && self.config.send_unprotected) {
            log::debug!("mock server sends {} unprotected", msg.body.name());
        } else {
            self.protector.protect(&mut msg)?;
        }
        log::debug!("mock server answers with {}", msg.body.name());
        Ok(msg)
    }
}

fn rep_body(kind: EnrollKind, rep: CertRepMessage) -> PkiBody {
    match kind {
        EnrollKind::Ir => PkiBody::Ip(rep),
        EnrollKind::Cr | EnrollKind::P10cr => PkiBody::Cp(rep),
        EnrollKind::Kur => PkiBody::Kup(rep),
    }
}

/// Build the mock server from the `srv_*`, `rsp_*` and behaviour options
///
/// Rules:
/// - `srv_ref` is required without `srv_cert`
/// - the server needs `srv_secret` or `srv_cert` with `srv_key`
/// - `rsp_cert` is required
pub fn setup_mock_server(config: &AppConfig, loader: &CredentialLoader, params: &VerifyParams) -> Result<MockServer> {
    let m = &config.mock;
    let certsform = CredentialFormat::from_name(&config.formats.certsform)?;
    let keyform = CredentialFormat::from_name(&config.formats.keyform)?;
    let otherpass = config.formats.otherpass.as_ref();

    if m.srv_ref.is_none() && m.srv_cert.is_none() {
        return Err(CmpError::ProtocolConfig(
            "must give -srv_ref for mock server if no -srv_cert given".to_string(),
        ));
    }
    if m.srv_secret.is_none() && (m.srv_cert.is_some() != m.srv_key.is_some()) {
        return Err(CmpError::CredentialMismatch(
            "must give both -srv_cert and -srv_key options or neither".to_string(),
        ));
    }

    let secret = match &m.srv_secret {
        Some(source) => Some(source.resolve("-srv_secret")?),
        None => None,
    };
    let protector = match (&secret, &m.srv_cert, &m.srv_key) {
        (Some(secret), _, _) => {
            Protector::mac(secret.clone(), m.srv_ref.as_deref(), "", &config.protection.mac)?
        }
        (None, Some(cert_uri), Some(key_uri)) => {
            let cert = loader.load_cert(cert_uri, certsform, otherpass, "certificate of the mock server")?;
            let key = loader.load_key(key_uri, keyform, m.srv_keypass.as_ref(), "private key of the mock server")?;
            Protector::signature(cert, key, Vec::new(), &config.protection.digest)?
        }
        _ => {
            return Err(CmpError::CredentialMismatch(
                "mock server credentials must be given if -use_mock_srv or -port is used".to_string(),
            ))
        }
    };

    let trust = match &m.srv_trusted {
        Some(list) => {
            let certs = loader.load_cert_list(list, certsform, otherpass, "certs trusted by mock server", MergePolicy::KEEP_ALL)?;
            let mut store = TrustStore::build(certs, params, "trust store of the mock server")?;
            store.set_identity(None);
            Some(store)
        }
        None => None,
    };
    let untrusted = match &m.srv_untrusted {
        Some(list) => loader.load_cert_list(list, certsform, otherpass, "intermediate certs for mock server", MergePolicy::DEDUP)?,
        None => Vec::new(),
    };
    let verifier = MessageVerifier::new("request")
        .with_secret(secret)
        .with_trust(trust)
        .with_untrusted(untrusted);

    let rsp_cert_uri = m
        .rsp_cert
        .as_ref()
        .ok_or_else(|| CmpError::ProtocolConfig("must give -rsp_cert for mock server".to_string()))?;
    let rsp_cert = loader.load_cert(rsp_cert_uri, certsform, otherpass, "cert to be returned by the mock server")?;
    let rsp_extracerts = match &m.rsp_extracerts {
        Some(list) => loader.load_cert_list(list, certsform, otherpass, "CMP extra certificates for mock server", MergePolicy::KEEP_ALL)?,
        None => Vec::new(),
    };
    let rsp_capubs = match &m.rsp_capubs {
        Some(list) => loader.load_cert_list(list, certsform, otherpass, "caPubs certificates for mock server", MergePolicy::KEEP_ALL)?,
        None => Vec::new(),
    };
    log::debug!(
        "mock server returns certificate '{}'",
        name_to_string(rsp_cert.subject_name())
    );

    Ok(MockServer::new(
        MockServerConfig::from_options(config)?,
        MockResponses {
            rsp_cert,
            rsp_extracerts,
            rsp_capubs,
        },
        protector,
        verifier,
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::passphrase::Passphrase;
    use crate::pki_generator::TestPki;
    use crate::protocol::tests::sample_header;
    use crate::protocol::{CertStatus, CertTemplate, InfoTypeAndValue};

    pub(crate) const SECRET: &str = "mock-secret";

    pub(crate) fn mock_with(config: MockServerConfig) -> MockServer {
        let pki = TestPki::generate();
        MockServer::new(
            config,
            MockResponses {
                rsp_cert: pki.enrolled_cert.clone(),
                rsp_extracerts: vec![pki.root_cert.clone()],
                rsp_capubs: vec![pki.root_cert.clone()],
            },
            Protector::mac(Passphrase::new(SECRET), Some("srv"), "", "hmac-sha256").unwrap(),
            MessageVerifier::new("request").with_secret(Some(Passphrase::new(SECRET))),
        )
    }

    fn client_protector() -> Protector {
        Protector::mac(Passphrase::new(SECRET), Some("client"), "/CN=client", "hmac-sha256").unwrap()
    }

    fn ir(tid: u8) -> PkiMessage {
        let pki = TestPki::generate();
        let template = CertTemplate {
            subject: Some("/CN=enrolled".into()),
            public_key: Some(pki.enrolled_key.public_key_to_der().unwrap()),
            ..Default::default()
        };
        let value = crate::protection::sign(&pki.enrolled_key, "sha256", &popo_input(&template).unwrap()).unwrap();
        let mut header = sample_header();
        header.transaction_id = vec![tid; 16];
        let mut msg = PkiMessage::new(
            header,
            PkiBody::Ir(CertRequest {
                cert_req_id: 0,
                template,
                popo: Some(ProofOfPossession::Signature {
                    digest: "sha256".into(),
                    value,
                }),
            }),
        );
        client_protector().protect(&mut msg).unwrap();
        msg
    }

    fn follow_up(tid: u8, body: PkiBody) -> PkiMessage {
        let mut header = sample_header();
        header.transaction_id = vec![tid; 16];
        let mut msg = PkiMessage::new(header, body);
        client_protector().protect(&mut msg).unwrap();
        msg
    }

    fn first_status(msg: &PkiMessage) -> PkiStatusInfo {
        match &msg.body {
            PkiBody::Ip(rep) | PkiBody::Cp(rep) | PkiBody::Kup(rep) => rep.responses[0].status.clone(),
            PkiBody::Error { status, .. } | PkiBody::Rp { status } => status.clone(),
            other => panic!("no status in {}", other.name()),
        }
    }

    #[test]
    fn test_failure_index_and_bits() {
        for k in [0, 2, 26] {
            assert_eq!(MockServerConfig::resolve_failure_bits(Some(k), None).unwrap(), 1 << k);
        }
        assert_eq!(MockServerConfig::resolve_failure_bits(Some(3), Some(0b101)).unwrap(), 0b101);
        assert_eq!(MockServerConfig::resolve_failure_bits(None, None).unwrap(), 0);
        assert!(MockServerConfig::resolve_failure_bits(Some(27), None).is_err());
        assert!(MockServerConfig::resolve_failure_bits(None, Some(1 << 27)).is_err());
    }

    #[test]
    fn test_polling_three_times() {
        let mut server = mock_with(MockServerConfig {
            poll_count: 3,
            check_after: 0,
            ..Default::default()
        });
        let rsp = server.process(&ir(1)).unwrap();
        assert_eq!(first_status(&rsp).status, PkiStatus::Waiting);
        for _ in 0..2 {
            let rsp = server.process(&follow_up(1, PkiBody::PollReq { cert_req_id: 0 })).unwrap();
            assert!(matches!(rsp.body, PkiBody::PollRep { check_after: 0, .. }));
        }
        let rsp = server.process(&follow_up(1, PkiBody::PollReq { cert_req_id: 0 })).unwrap();
        match &rsp.body {
            PkiBody::Ip(rep) => assert!(rep.responses[0].certificate.is_some()),
            other => panic!("expected ip, got {}", other.name()),
        }
    }

    #[test]
    fn test_no_polling_and_confirmation() {
        let mut server = mock_with(MockServerConfig::default());
        let rsp = server.process(&ir(2)).unwrap();
        let der = match &rsp.body {
            PkiBody::Ip(rep) => {
                assert_eq!(rep.ca_pubs.len(), 1);
                rep.responses[0].certificate.clone().unwrap()
            }
            other => panic!("expected ip, got {}", other.name()),
        };
        assert_eq!(rsp.header.recip_nonce.as_deref(), Some(&sample_header().sender_nonce[..]));

        let conf = follow_up(
            2,
            PkiBody::CertConf {
                statuses: vec![CertStatus {
                    cert_hash: cert_hash(&der).unwrap(),
                    cert_req_id: 0,
                    status: None,
                }],
            },
        );
        let rsp = server.process(&conf).unwrap();
        assert!(matches!(rsp.body, PkiBody::PkiConf));
    }

    #[test]
    fn test_implicit_confirm_granted() {
        let mut server = mock_with(MockServerConfig {
            grant_implicit_confirm: true,
            ..Default::default()
        });
        let mut req = ir(3);
        req.header.implicit_confirm = true;
        client_protector().protect(&mut req).unwrap();
        let rsp = server.process(&req).unwrap();
        assert!(rsp.header.implicit_confirm);
        // the transaction is complete, so the ID may be used again
        let rsp = server.process(&ir(3)).unwrap();
        assert_eq!(first_status(&rsp).status, PkiStatus::Accepted);
    }

    #[test]
    fn test_transaction_id_in_use() {
        let mut server = mock_with(MockServerConfig {
            poll_count: 1,
            ..Default::default()
        });
        server.process(&ir(4)).unwrap();
        let rsp = server.process(&ir(4)).unwrap();
        assert!(first_status(&rsp).has_failure(failure::TRANSACTION_ID_IN_USE));
        // the original transaction is still alive
        let rsp = server.process(&follow_up(4, PkiBody::PollReq { cert_req_id: 0 })).unwrap();
        assert!(matches!(rsp.body, PkiBody::Ip(_)));
    }

    #[test]
    fn test_send_error_uses_configured_status() {
        let mut server = mock_with(MockServerConfig {
            send_error: true,
            status: PkiStatusInfo::new(PkiStatus::Rejection, 1 << 2, Some("forced".into())),
            ..Default::default()
        });
        let rsp = server.process(&ir(5)).unwrap();
        assert!(matches!(rsp.body, PkiBody::Error { .. }));
        let status = first_status(&rsp);
        assert_eq!(status.failure_bits, 1 << 2);
        assert!(rsp.is_protected());
    }

    #[test]
    fn test_protection_policy() {
        let mut server = mock_with(MockServerConfig::default());
        let mut unprotected = ir(6);
        unprotected.protection = None;
        unprotected.protection_alg = None;
        let rsp = server.process(&unprotected).unwrap();
        assert!(first_status(&rsp).has_failure(failure::BAD_MESSAGE_CHECK));

        let mut lenient = mock_with(MockServerConfig {
            accept_unprotected: true,
            send_unprot_err: true,
            send_unprotected: true,
            ..Default::default()
        });
        let rsp = lenient.process(&unprotected).unwrap();
        assert_eq!(first_status(&rsp).status, PkiStatus::Accepted);
        assert!(!rsp.is_protected());
    }

    #[test]
    fn test_unprotected_error_policy() {
        let client_error = PkiMessage::new(
            sample_header(),
            PkiBody::Error {
                status: PkiStatusInfo::rejection(failure::BAD_REQUEST, "client gives up"),
                details: None,
            },
        );

        let rsp = mock_with(MockServerConfig::default()).process(&client_error).unwrap();
        assert!(first_status(&rsp).has_failure(failure::BAD_MESSAGE_CHECK));

        let mut errors_only = mock_with(MockServerConfig {
            accept_unprot_err: true,
            ..Default::default()
        });
        let rsp = errors_only.process(&client_error).unwrap();
        assert!(matches!(rsp.body, PkiBody::PkiConf));

        // only error messages may come unprotected
        let mut unprotected = ir(8);
        unprotected.protection = None;
        unprotected.protection_alg = None;
        let rsp = errors_only.process(&unprotected).unwrap();
        assert!(first_status(&rsp).has_failure(failure::BAD_MESSAGE_CHECK));
    }

    #[test]
    fn test_raverified_policy() {
        let mut req = ir(7);
        if let PkiBody::Ir(cr) = &mut req.body {
            cr.popo = Some(ProofOfPossession::RaVerified);
        }
        client_protector().protect(&mut req).unwrap();

        let rsp = mock_with(MockServerConfig::default()).process(&req).unwrap();
        assert!(first_status(&rsp).has_failure(failure::BAD_POP));

        let rsp = mock_with(MockServerConfig {
            accept_raverified: true,
            ..Default::default()
        })
        .process(&req)
        .unwrap();
        assert_eq!(first_status(&rsp).status, PkiStatus::Accepted);
    }

    #[test]
    fn test_genm_echo_and_client_error() {
        let mut server = mock_with(MockServerConfig::default());
        let itavs = vec![InfoTypeAndValue {
            info_type: "id-it-signKeyPairTypes".into(),
            value: None,
        }];
        let rsp = server.process(&follow_up(8, PkiBody::Genm { itavs: itavs.clone() })).unwrap();
        assert_eq!(rsp.body, PkiBody::Genp { itavs });

        let err = follow_up(
            9,
            PkiBody::Error {
                status: PkiStatusInfo::rejection(failure::BAD_REQUEST, "client gave up"),
                details: None,
            },
        );
        assert!(matches!(server.process(&err).unwrap().body, PkiBody::PkiConf));
    }

    #[test]
    fn test_setup_rules() {
        let loader = CredentialLoader::new(true);
        let params = VerifyParams::default();
        let mut config = AppConfig::default();
        assert!(matches!(
            setup_mock_server(&config, &loader, &params),
            Err(CmpError::ProtocolConfig(_))
        ));
        config.mock.srv_ref = Some("srv".into());
        assert!(matches!(
            setup_mock_server(&config, &loader, &params),
            Err(CmpError::CredentialMismatch(_))
        ));
        config.mock.srv_secret = Some(crate::passphrase::SecretSource::new("pass:x"));
        assert!(matches!(
            setup_mock_server(&config, &loader, &params),
            Err(CmpError::ProtocolConfig(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let files = TestPki::generate().write_files(dir.path());
        config.mock.rsp_cert = Some(files.enrolled_cert.display().to_string());
        config.mock.failure = Some(2);
        config.mock.pkistatus = 2;
        let server = setup_mock_server(&config, &loader, &params).unwrap();
        assert_eq!(server.config().status.failure_bits, 1 << 2);
        assert_eq!(server.config().status.status, PkiStatus::Rejection);
    }
}
