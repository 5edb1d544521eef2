//! Trust store builder
//!
//! A [`TrustStore`] is a set of trusted certificates together with the
//! verification parameters it was built with. Each purpose (CMP server
//! responses, TLS peer, newly enrolled certificates) gets its own instance, so
//! an identity expectation configured for one purpose is never visible to
//! another.

use crate::credentials::name_to_string;
use crate::error::{CmpError, Result};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::{X509CheckFlags, X509VerifyFlags, X509VerifyParam};
use openssl::x509::{X509StoreContext, X509};
use std::net::IpAddr;

/// Verification parameters copied into every trust store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyParams {
    /// Unix time to verify at instead of now
    pub check_time: Option<i64>,
    pub host: Option<String>,
    pub ip: Option<IpAddr>,
    pub email: Option<String>,
    pub always_check_subject: bool,
    pub no_partial_wildcards: bool,
}

impl VerifyParams {
    /// Clear any host/IP/email expectation, then expect `host` if given
    ///
    /// An IP literal selects an IP address check, anything else a host name
    /// check. `None` leaves no identity check configured.
    pub fn set_identity(&mut self, host: Option<&str>) {
        self.host = None;
        self.ip = None;
        self.email = None;
        if let Some(host) = host {
            match host.parse::<IpAddr>() {
                Ok(ip) => self.ip = Some(ip),
                Err(_) => self.host = Some(host.to_string()),
            }
            self.always_check_subject = true;
            self.no_partial_wildcards = true;
        }
    }

    pub fn has_identity(&self) -> bool {
        self.host.is_some() || self.ip.is_some() || self.email.is_some()
    }

    fn to_openssl(&self) -> Result<X509VerifyParam> {
        let mut param = X509VerifyParam::new().map_err(trust_err)?;
        if let Some(host) = &self.host {
            param.set_host(host).map_err(trust_err)?;
        }
        if let Some(ip) = &self.ip {
            param.set_ip(*ip).map_err(trust_err)?;
        }
        if let Some(email) = &self.email {
            param.set_email(email).map_err(trust_err)?;
        }
        let mut flags = X509CheckFlags::empty();
        if self.always_check_subject {
            flags |= X509CheckFlags::ALWAYS_CHECK_SUBJECT;
        }
        if self.no_partial_wildcards {
            flags |= X509CheckFlags::NO_PARTIAL_WILDCARDS;
        }
        param.set_hostflags(flags);
        if let Some(time) = self.check_time {
            param.set_time(time as _);
        } else {
            param.clear_flags(X509VerifyFlags::USE_CHECK_TIME).map_err(trust_err)?;
        }
        Ok(param)
    }
}

fn trust_err(e: openssl::error::ErrorStack) -> CmpError {
    CmpError::TrustConfig(e.to_string())
}

/// Trusted certificates plus verification parameters for one purpose
#[derive(Clone)]
pub struct TrustStore {
    desc: String,
    certs: Vec<X509>,
    params: VerifyParams,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("desc", &self.desc)
            .field("certs", &self.certs.len())
            .field("params", &self.params)
            .finish()
    }
}

impl TrustStore {
    /// Build a trust store from a certificate set
    ///
    /// The caller's parameters are copied as a whole. Building is atomic:
    /// if any certificate cannot be added, no store is returned.
    ///
    /// # Arguments
    /// * `certs` - Trusted certificates
    /// * `params` - Verification parameters to copy into the store
    /// * `desc` - Purpose of the store, used in messages
    pub fn build(certs: Vec<X509>, params: &VerifyParams, desc: &str) -> Result<Self> {
        let mut builder = X509StoreBuilder::new().map_err(trust_err)?;
        for cert in &certs {
            builder.add_cert(cert.clone()).map_err(|e| {
                CmpError::TrustConfig(format!(
                    "cannot add certificate '{}' to {}: {}",
                    name_to_string(cert.subject_name()),
                    desc,
                    e
                ))
            })?;
        }
        log::debug!("built {} with {} certificate(s)", desc, certs.len());
        Ok(Self {
            desc: desc.to_string(),
            certs,
            params: params.clone(),
        })
    }

    pub fn certs(&self) -> &[X509] {
        &self.certs
    }

    pub fn params(&self) -> &VerifyParams {
        &self.params
    }

    /// See [`VerifyParams::set_identity`]
    pub fn set_identity(&mut self, host: Option<&str>) {
        self.params.set_identity(host);
    }

    /// Stop verifying at a fixed time; validity is checked against now
    pub fn clear_check_time(&mut self) {
        self.params.check_time = None;
    }

    /// Materialize an OpenSSL store carrying these certificates and parameters
    pub fn to_x509_store(&self) -> Result<X509Store> {
        let mut builder = X509StoreBuilder::new().map_err(trust_err)?;
        for cert in &self.certs {
            builder.add_cert(cert.clone()).map_err(trust_err)?;
        }
        let param = self.params.to_openssl()?;
        builder.set_param(&param).map_err(trust_err)?;
        Ok(builder.build())
    }

    /// Verify `cert` against this store, using `untrusted` for chain building
    pub fn verify(&self, cert: &X509, untrusted: &[X509]) -> Result<()> {
        let store = self.to_x509_store()?;
        let mut chain = Stack::new().map_err(trust_err)?;
        for c in untrusted {
            chain.push(c.clone()).map_err(trust_err)?;
        }
        let mut ctx = X509StoreContext::new().map_err(trust_err)?;
        let outcome = ctx
            .init(&store, cert, &chain, |c| {
                let ok = c.verify_cert()?;
                Ok(if ok { None } else { Some(c.error()) })
            })
            .map_err(trust_err)?;
        match outcome {
            None => Ok(()),
            Some(err) => Err(CmpError::MessageCheck(format!(
                "certificate '{}' does not verify against {}: {}",
                name_to_string(cert.subject_name()),
                self.desc,
                err.error_string()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki_generator::TestPki;

    #[test]
    fn test_identity_isolation() {
        let pki = TestPki::generate();
        let params = VerifyParams::default();
        let mut tls = TrustStore::build(vec![pki.root_cert.clone()], &params, "TLS trust").unwrap();
        let cmp = TrustStore::build(vec![pki.root_cert.clone()], &params, "CMP trust").unwrap();

        tls.set_identity(Some("cmp.example.com"));
        assert_eq!(tls.params().host.as_deref(), Some("cmp.example.com"));
        assert!(tls.params().always_check_subject && tls.params().no_partial_wildcards);
        assert!(!cmp.params().has_identity());
    }

    #[test]
    fn test_set_identity_ip_or_host_never_both() {
        let mut params = VerifyParams {
            email: Some("a@b.c".into()),
            host: Some("old".into()),
            ..Default::default()
        };
        params.set_identity(Some("10.0.0.1"));
        assert_eq!(params.ip, Some("10.0.0.1".parse().unwrap()));
        assert!(params.host.is_none() && params.email.is_none());

        params.set_identity(Some("example.org"));
        assert!(params.ip.is_none());
        params.set_identity(None);
        assert!(!params.has_identity());
    }

    #[test]
    fn test_verify_chain() {
        let pki = TestPki::generate();
        let store =
            TrustStore::build(vec![pki.root_cert.clone()], &VerifyParams::default(), "trust").unwrap();
        store.verify(&pki.client_cert, &[]).unwrap();

        let empty = TrustStore::build(Vec::new(), &VerifyParams::default(), "empty trust").unwrap();
        assert!(matches!(
            empty.verify(&pki.client_cert, &[]),
            Err(CmpError::MessageCheck(_))
        ));
    }

    #[test]
    fn test_check_time_applies() {
        let pki = TestPki::generate();
        let params = VerifyParams {
            // 2001-09-09, long before the test certificates were issued
            check_time: Some(1_000_000_000),
            ..Default::default()
        };
        let mut store = TrustStore::build(vec![pki.root_cert.clone()], &params, "trust").unwrap();
        assert!(store.verify(&pki.client_cert, &[]).is_err());
        store.clear_check_time();
        store.verify(&pki.client_cert, &[]).unwrap();
    }
}
