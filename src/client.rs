//! CMP client orchestration
//!
//! [`CmpClient::setup`] performs every configuration step before any message
//! is sent: credentials, trust stores, protection, request template, mock
//! server or HTTP client, and the transport. Any failure there aborts the run.
//! [`CmpClient::run`] then executes the configured command `repeat` times,
//! each time as a fresh transaction, reporting the resulting status and
//! saving received certificates.

use crate::configs::AppConfig;
use crate::credentials::{name_to_string, save_certs, CredentialFormat, CredentialLoader, KeyDirectory};
use crate::error::{CmpError, Result};
use crate::http_client::{configure_tls, parse_server, HttpClient};
use crate::mock_server::setup_mock_server;
use crate::protection::{configure_client_protection, configure_client_verifier};
use crate::protocol::PkiStatus;
use crate::request::{configure_request, parse_dn, CommandKind};
use crate::session::{CmpSessionExecutor, SessionOutcome};
use crate::transport::{select_transport, TransactionContext, Transport, TransportMode};
use crate::truststore::VerifyParams;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Verification parameters from `attime` and `verify_*`
pub fn verify_params(config: &AppConfig) -> Result<VerifyParams> {
    let opts = &config.verify;
    let ip = match &opts.verify_ip {
        Some(ip) => Some(
            ip.parse::<IpAddr>()
                .map_err(|_| CmpError::ProtocolConfig(format!("invalid -verify_ip '{}'", ip)))?,
        ),
        None => None,
    };
    Ok(VerifyParams {
        check_time: opts.attime,
        host: opts.verify_hostname.clone(),
        ip,
        email: opts.verify_email.clone(),
        always_check_subject: false,
        no_partial_wildcards: false,
    })
}

/// Credential loader honouring `batch`, `attime`, `msg_timeout` and the `engine` key store
pub fn credential_loader(config: &AppConfig) -> Result<CredentialLoader> {
    let mut loader = CredentialLoader::new(config.run.batch)
        .with_check_time(config.verify.attime)
        .with_fetch_timeout(seconds(config.server.msg_timeout));
    if let Some(dir) = &config.formats.engine {
        loader = loader.with_key_provider(Arc::new(KeyDirectory::open(dir, config.run.batch)?));
    }
    Ok(loader)
}

fn seconds(value: i64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value as u64))
}

pub struct CmpClient {
    config: Arc<AppConfig>,
    executor: CmpSessionExecutor,
    transport: Box<dyn Transport>,
    ctx: TransactionContext,
    cert_format: CredentialFormat,
}

impl CmpClient {
    /// Build everything needed for the configured command
    pub fn setup(config: Arc<AppConfig>) -> Result<Self> {
        let server = &config.server;
        let run = &config.run;
        if config.cmd.is_none() {
            return Err(CmpError::ProtocolConfig("no cmp command given, use -cmd".to_string()));
        }
        if server.server.is_some() && run.use_mock_srv {
            return Err(CmpError::ProtocolConfig(
                "cannot use both -server and -use_mock_srv options".to_string(),
            ));
        }
        if server.server.is_none() && !run.use_mock_srv && run.rspin.is_none() {
            return Err(CmpError::ProtocolConfig(
                "missing -server or -use_mock_srv option, or too few -rspin filename arguments".to_string(),
            ));
        }
        if run.use_mock_srv && (config.tls.tls_used || config.tls.any_set()) {
            return Err(CmpError::ProtocolConfig(
                "cannot use TLS options together with -use_mock_srv".to_string(),
            ));
        }
        if server.server.is_none() && (server.proxy.is_some() || server.no_proxy.is_some()) {
            log::warn!("-proxy and -no_proxy options are ignored since -server is not given");
        }
        if run.repeat < 1 {
            return Err(CmpError::ProtocolConfig(format!(
                "-repeat argument must be positive, got {}",
                run.repeat
            )));
        }
        let cert_format = CredentialFormat::from_name(&config.formats.certform)?;
        if !matches!(cert_format, CredentialFormat::Pem | CredentialFormat::Der) {
            return Err(CmpError::ProtocolConfig(format!(
                "unsupported -certform '{}', must be PEM or DER",
                config.formats.certform
            )));
        }

        let params = verify_params(&config)?;
        let loader = credential_loader(&config)?;

        let protection = configure_client_protection(&config, &loader)?;
        let verifier = configure_client_verifier(
            &config,
            &loader,
            &params,
            protection.secret.clone(),
            protection.untrusted.clone(),
        )?;
        let template = configure_request(&config, &loader, &protection.credential, &params)?;

        let recipient = match (&config.verify.recipient, verifier.pinned_cert()) {
            (_, Some(srvcert)) => name_to_string(srvcert.subject_name()),
            (Some(dn), None) => parse_dn(dn, "-recipient")?,
            (None, None) => match (&protection.credential.cert, &template.old_cert) {
                (Some(cert), _) | (None, Some(cert)) => name_to_string(cert.issuer_name()),
                (None, None) => String::new(),
            },
        };

        let mock = if run.use_mock_srv {
            Some(setup_mock_server(&config, &loader, &params)?)
        } else {
            None
        };
        let http = match &server.server {
            Some(spec) => {
                let address = parse_server(spec, server.path.as_deref())?;
                let tls = configure_tls(&config, &loader, &params, &address.host)?;
                Some(HttpClient::new(address, server.proxy.as_deref(), server.no_proxy.as_deref(), tls)?)
            }
            None => None,
        };

        let protector = Arc::new(protection.protector);
        let reprotect = run.reqin_new_tid.then(|| Arc::clone(&protector));
        let transport = select_transport(&config, mock, http, reprotect)?;
        log::debug!(
            "using {} transport ({:?})",
            transport.name(),
            TransportMode::of(&config)
        );

        let executor = CmpSessionExecutor::new(template, protector, verifier, recipient)
            .with_untrusted(protection.untrusted);
        let ctx = TransactionContext::new(seconds(server.msg_timeout), seconds(server.total_timeout));
        Ok(CmpClient {
            config,
            executor,
            transport,
            ctx,
            cert_format,
        })
    }

    pub fn command(&self) -> CommandKind {
        self.executor.template().kind
    }

    /// Run one transaction, report its status and save what it produced
    pub fn run_transaction(&mut self) -> Result<SessionOutcome> {
        self.ctx.start();
        let outcome = self.executor.execute(&mut self.ctx, self.transport.as_mut())?;
        report_status(&outcome, self.command());
        self.save_artifacts(&outcome)?;
        Ok(outcome)
    }

    /// Run the configured number of transactions
    ///
    /// A rejection or an unexpected waiting status ends the run with
    /// [`CmpError::ProtocolStatus`]; artifacts of earlier transactions stay saved.
    pub fn run(&mut self) -> Result<Vec<SessionOutcome>> {
        let repeat = self.config.run.repeat;
        let mut outcomes = Vec::new();
        for i in 1..=repeat {
            if repeat > 1 {
                log::info!("transaction {} of {}", i, repeat);
            }
            let outcome = self.run_transaction()?;
            match outcome.status.status {
                PkiStatus::Rejection => {
                    return Err(CmpError::ProtocolStatus {
                        context: format!("{} rejected by server", self.command().name()),
                        status: outcome.status,
                    })
                }
                PkiStatus::Waiting => {
                    return Err(CmpError::ProtocolStatus {
                        context: format!("{} ended with unexpected waiting status", self.command().name()),
                        status: outcome.status,
                    })
                }
                _ => outcomes.push(outcome),
            }
        }
        Ok(outcomes)
    }

    fn save_artifacts(&self, outcome: &SessionOutcome) -> Result<usize> {
        let verify = &self.config.verify;
        let mut saved = 0;
        if let Some(path) = &verify.extracertsout {
            saved += save_certs(&outcome.extra_certs_in, Path::new(path), self.cert_format, "extra certificates received")?;
        }
        if let Some(path) = &verify.cacertsout {
            saved += save_certs(&outcome.ca_pubs, Path::new(path), self.cert_format, "CA certificates received")?;
        }
        if let (Some(path), Some(cert)) = (&self.config.request.certout, &outcome.new_cert) {
            saved += save_certs(
                std::slice::from_ref(cert),
                Path::new(path),
                self.cert_format,
                "newly enrolled certificate",
            )?;
        }
        Ok(saved)
    }
}

/// Log the PKIStatusInfo of a finished transaction
pub fn report_status(outcome: &SessionOutcome, kind: CommandKind) {
    let status = &outcome.status;
    match status.status {
        PkiStatus::Accepted | PkiStatus::GrantedWithMods => log::info!("received {}", status),
        PkiStatus::Rejection => log::error!("server error: {}", status),
        PkiStatus::Waiting => log::error!("internal error: {}", status),
        _ => log::warn!("received {}", status),
    }
    if kind == CommandKind::Genm {
        if outcome.itavs.is_empty() {
            log::info!("genp contains no ITAV");
        }
        for itav in &outcome.itavs {
            match itav.value {
                Some(v) => log::info!("genp contains InfoType '{}' with value {}", itav.info_type, v),
                None => log::info!("genp contains InfoType '{}'", itav.info_type),
            }
        }
    }
}
