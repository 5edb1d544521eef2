//! Session execution
//!
//! [`SessionExecutor`] is the per-command message sequence: enrollment
//! (request, optional polling, certificate confirmation), revocation and
//! general messages. [`CmpSessionExecutor`] implements it on top of a
//! [`Transport`], checking transaction ID, nonces and protection of every
//! response before looking at its body.

use crate::error::{CmpError, Result};
use crate::protection::{MessageVerifier, Protector};
use crate::protocol::{
    cert_hash, failure, unix_now, CertRepMessage, CertStatus, InfoTypeAndValue, PkiBody, PkiHeader, PkiMessage,
    PkiStatus, PkiStatusInfo,
};
use crate::request::{CommandKind, RequestTemplate};
use crate::transport::{TransactionContext, Transport};
use openssl::x509::X509;
use std::sync::Arc;
use std::time::Duration;

/// What a transaction produced
#[derive(Clone)]
pub struct SessionOutcome {
    pub status: PkiStatusInfo,
    pub new_cert: Option<X509>,
    pub ca_pubs: Vec<X509>,
    pub extra_certs_in: Vec<X509>,
    pub itavs: Vec<InfoTypeAndValue>,
}

impl SessionOutcome {
    fn with_status(status: PkiStatusInfo) -> Self {
        SessionOutcome {
            status,
            new_cert: None,
            ca_pubs: Vec::new(),
            extra_certs_in: Vec::new(),
            itavs: Vec::new(),
        }
    }
}

/// Per-command message sequences
pub trait SessionExecutor {
    /// ir, cr, kur or p10cr, including polling and confirmation
    fn execute_enrollment(&mut self, ctx: &mut TransactionContext, transport: &mut dyn Transport) -> Result<SessionOutcome>;

    fn execute_revocation(&mut self, ctx: &mut TransactionContext, transport: &mut dyn Transport) -> Result<SessionOutcome>;

    fn execute_generic_info(&mut self, ctx: &mut TransactionContext, transport: &mut dyn Transport) -> Result<SessionOutcome>;
}

pub struct CmpSessionExecutor {
    template: RequestTemplate,
    protector: Arc<Protector>,
    verifier: MessageVerifier,
    recipient: String,
    /// Untrusted certificates for chain building when checking a new certificate
    untrusted: Vec<X509>,
}

impl CmpSessionExecutor {
    pub fn new(
        template: RequestTemplate,
        protector: Arc<Protector>,
        verifier: MessageVerifier,
        recipient: impl Into<String>,
    ) -> Self {
        CmpSessionExecutor {
            template,
            protector,
            verifier,
            recipient: recipient.into(),
            untrusted: Vec::new(),
        }
    }

    pub fn with_untrusted(mut self, certs: Vec<X509>) -> Self {
        self.untrusted = certs;
        self
    }

    pub fn template(&self) -> &RequestTemplate {
        &self.template
    }

    /// Dispatch on the configured command
    pub fn execute(&mut self, ctx: &mut TransactionContext, transport: &mut dyn Transport) -> Result<SessionOutcome> {
        match self.template.kind {
            CommandKind::Ir | CommandKind::Cr | CommandKind::Kur | CommandKind::P10cr => {
                self.execute_enrollment(ctx, transport)
            }
            CommandKind::Rr => self.execute_revocation(ctx, transport),
            CommandKind::Genm => self.execute_generic_info(ctx, transport),
        }
    }

    fn build(&self, ctx: &mut TransactionContext, body: PkiBody, implicit_confirm: bool) -> Result<PkiMessage> {
        let header = PkiHeader {
            sender: self.protector.sender().to_string(),
            recipient: self.recipient.clone(),
            sender_kid: self.protector.sender_kid().map(|k| k.to_vec()),
            transaction_id: ctx.state.ensure_transaction_id()?,
            sender_nonce: ctx.state.fresh_sender_nonce()?,
            recip_nonce: ctx.state.recip_nonce.clone(),
            message_time: unix_now(),
            implicit_confirm,
            general_info: self.template.general_info.clone(),
        };
        let mut msg = PkiMessage::new(header, body);
        self.protector.protect(&mut msg)?;
        Ok(msg)
    }

    /// Send one request and check the response header and protection
    fn round_trip(
        &self,
        ctx: &mut TransactionContext,
        transport: &mut dyn Transport,
        body: PkiBody,
        implicit_confirm: bool,
    ) -> Result<PkiMessage> {
        let request = self.build(ctx, body, implicit_confirm)?;
        log::info!("sending {} via {} transport", request.body.name(), transport.name());
        let response = transport.exchange(ctx, &request)?;
        log::info!("received {}", response.body.name());

        if ctx.state.transaction_id.as_ref() != Some(&response.header.transaction_id) {
            return Err(CmpError::MessageCheck(format!(
                "transaction ID of {} does not match the request",
                response.body.name()
            )));
        }
        if response.header.recip_nonce.as_ref() != ctx.state.sender_nonce.as_ref() {
            return Err(CmpError::MessageCheck(format!(
                "recipNonce of {} does not match senderNonce of the request",
                response.body.name()
            )));
        }
        self.verifier.verify(&response)?;
        ctx.state.record_peer_nonce(&response.header);
        Ok(response)
    }

    fn expected_rep(&self) -> &'static str {
        match self.template.kind {
            CommandKind::Ir => "ip",
            CommandKind::Kur => "kup",
            _ => "cp",
        }
    }

    fn cert_rep<'a>(&self, msg: &'a PkiMessage) -> Option<&'a CertRepMessage> {
        match (&msg.body, self.template.kind) {
            (PkiBody::Ip(rep), CommandKind::Ir)
            | (PkiBody::Cp(rep), CommandKind::Cr | CommandKind::P10cr)
            | (PkiBody::Kup(rep), CommandKind::Kur) => Some(rep),
            _ => None,
        }
    }

    fn unexpected(&self, msg: &PkiMessage, wanted: &str) -> CmpError {
        CmpError::MessageCheck(format!(
            "unexpected {} in response to {}, expected {}",
            msg.body.name(),
            self.template.kind.name(),
            wanted
        ))
    }

    /// Poll until the certificate response is final
    fn poll(
        &self,
        ctx: &mut TransactionContext,
        transport: &mut dyn Transport,
        cert_req_id: i64,
    ) -> Result<PkiMessage> {
        loop {
            let response = self.round_trip(ctx, transport, PkiBody::PollReq { cert_req_id }, false)?;
            match &response.body {
                PkiBody::PollRep { check_after, .. } => {
                    let wait = Duration::from_secs(*check_after);
                    if let Some(left) = ctx.remaining()? {
                        if wait >= left {
                            return Err(CmpError::Transport(format!(
                                "checkAfter of {} seconds exceeds the total timeout",
                                check_after
                            )));
                        }
                    }
                    log::info!("waiting {} seconds before polling again", check_after);
                    std::thread::sleep(wait);
                }
                _ => return Ok(response),
            }
        }
    }

    /// Check a new certificate against `out_trusted`
    fn check_new_cert(&self, cert: &X509, response: &PkiMessage, extra: &[X509]) -> Result<()> {
        let Some(store) = &self.template.out_trusted else {
            return Ok(());
        };
        let mut untrusted = self.untrusted.clone();
        untrusted.extend(extra.iter().cloned());
        store.verify(cert, &untrusted).map_err(|e| {
            CmpError::MessageCheck(format!(
                "newly enrolled certificate from {} does not verify: {}",
                response.body.name(),
                e
            ))
        })
    }
}

fn decode_certs(ders: &[Vec<u8>]) -> Result<Vec<X509>> {
    ders.iter()
        .map(|der| X509::from_der(der).map_err(|e| CmpError::Decode(format!("invalid certificate: {}", e))))
        .collect()
}

impl SessionExecutor for CmpSessionExecutor {
    fn execute_enrollment(&mut self, ctx: &mut TransactionContext, transport: &mut dyn Transport) -> Result<SessionOutcome> {
        let body = self.template.body()?;
        let implicit_requested = self.template.implicit_confirm;
        let mut response = self.round_trip(ctx, transport, body, implicit_requested)?;

        loop {
            if let PkiBody::Error { status, details } = &response.body {
                if let Some(details) = details {
                    log::warn!("error details: {}", details);
                }
                return Ok(SessionOutcome::with_status(status.clone()));
            }
            let rep = self
                .cert_rep(&response)
                .ok_or_else(|| self.unexpected(&response, self.expected_rep()))?;
            let cert_resp = rep
                .responses
                .first()
                .ok_or_else(|| CmpError::MessageCheck("certificate response without entries".to_string()))?;
            if cert_resp.status.status == PkiStatus::Waiting {
                let cert_req_id = cert_resp.cert_req_id;
                log::info!("received waiting status, polling for certReqId {}", cert_req_id);
                response = self.poll(ctx, transport, cert_req_id)?;
                if matches!(response.body, PkiBody::PollRep { .. }) {
                    return Err(self.unexpected(&response, self.expected_rep()));
                }
                continue;
            }
            break;
        }

        let rep = self
            .cert_rep(&response)
            .ok_or_else(|| self.unexpected(&response, self.expected_rep()))?;
        let cert_resp = rep
            .responses
            .first()
            .ok_or_else(|| CmpError::MessageCheck("certificate response without entries".to_string()))?;
        let cert_req_id = cert_resp.cert_req_id;
        let mut outcome = SessionOutcome::with_status(cert_resp.status.clone());
        outcome.ca_pubs = decode_certs(&rep.ca_pubs)?;
        outcome.extra_certs_in = decode_certs(&response.extra_certs)?;
        if !cert_resp.status.status.is_positive() {
            return Ok(outcome);
        }

        let der = cert_resp.certificate.clone().ok_or_else(|| {
            CmpError::MessageCheck(format!("{} with positive status lacks a certificate", response.body.name()))
        })?;
        let cert = X509::from_der(&der).map_err(|e| CmpError::Decode(format!("invalid enrolled certificate: {}", e)))?;

        let mut chain_help = outcome.extra_certs_in.clone();
        chain_help.extend(outcome.ca_pubs.iter().cloned());
        let check = self.check_new_cert(&cert, &response, &chain_help);

        let implicit_granted = implicit_requested && response.header.implicit_confirm;
        if implicit_granted {
            log::info!("implicit confirmation granted by server");
        } else if self.template.disable_confirm {
            log::warn!("not sending certConf since confirmation is disabled");
        } else {
            let conf_status = match &check {
                Ok(()) => None,
                Err(e) => Some(PkiStatusInfo::rejection(failure::INCORRECT_DATA, e.to_string())),
            };
            let conf = PkiBody::CertConf {
                statuses: vec![CertStatus {
                    cert_hash: cert_hash(&der)?,
                    cert_req_id,
                    status: conf_status,
                }],
            };
            let ack = self.round_trip(ctx, transport, conf, false)?;
            match &ack.body {
                PkiBody::PkiConf => {}
                PkiBody::Error { status, .. } => {
                    return Err(CmpError::ProtocolStatus {
                        context: "server rejected certConf".to_string(),
                        status: status.clone(),
                    })
                }
                _ => return Err(self.unexpected(&ack, "pkiconf")),
            }
        }
        check?;
        outcome.new_cert = Some(cert);
        Ok(outcome)
    }

    fn execute_revocation(&mut self, ctx: &mut TransactionContext, transport: &mut dyn Transport) -> Result<SessionOutcome> {
        let body = self.template.body()?;
        let response = self.round_trip(ctx, transport, body, false)?;
        match &response.body {
            PkiBody::Rp { status } | PkiBody::Error { status, .. } => Ok(SessionOutcome::with_status(status.clone())),
            _ => Err(self.unexpected(&response, "rp")),
        }
    }

    fn execute_generic_info(&mut self, ctx: &mut TransactionContext, transport: &mut dyn Transport) -> Result<SessionOutcome> {
        let body = self.template.body()?;
        let response = self.round_trip(ctx, transport, body, false)?;
        match &response.body {
            PkiBody::Genp { itavs } => {
                let mut outcome = SessionOutcome::with_status(PkiStatusInfo::accepted());
                outcome.itavs = itavs.clone();
                Ok(outcome)
            }
            PkiBody::Error { status, .. } => Ok(SessionOutcome::with_status(status.clone())),
            _ => Err(self.unexpected(&response, "genp")),
        }
    }
}
