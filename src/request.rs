//! Request template configuration
//!
//! Turns the request-related options into a [`RequestTemplate`]: which CMP
//! command to send, the certificate template contents (subject, SANs,
//! extensions, policies, public key), proof-of-possession, the certificate
//! to update or revoke, and header generalInfo. All option consistency rules
//! are checked here, before any message is sent.

use crate::configs::{split_list, AppConfig};
use crate::credentials::{name_to_string, Credential, CredentialFormat, CredentialLoader, MergePolicy};
use crate::error::{CmpError, Result};
use crate::protection::sign;
use crate::protocol::{
    popo_input, CertId, CertRequest, CertTemplate, ExtensionValue, InfoTypeAndValue, PkiBody,
    ProofOfPossession, RevDetails,
};
use crate::truststore::{TrustStore, VerifyParams};
use openssl::asn1::Asn1Object;
use openssl::pkey::{PKey, Private, Public};
use openssl::x509::{X509Name, X509Req, X509};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ir,
    Cr,
    Kur,
    P10cr,
    Rr,
    Genm,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "ir" => Ok(CommandKind::Ir),
            "cr" => Ok(CommandKind::Cr),
            "kur" => Ok(CommandKind::Kur),
            "p10cr" => Ok(CommandKind::P10cr),
            "rr" => Ok(CommandKind::Rr),
            "genm" => Ok(CommandKind::Genm),
            _ => Err(CmpError::ProtocolConfig(format!("unknown cmp command '{}'", name))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Ir => "ir",
            CommandKind::Cr => "cr",
            CommandKind::Kur => "kur",
            CommandKind::P10cr => "p10cr",
            CommandKind::Rr => "rr",
            CommandKind::Genm => "genm",
        }
    }

    /// Commands that yield a new certificate
    pub fn is_enrollment(self) -> bool {
        matches!(self, CommandKind::Ir | CommandKind::Cr | CommandKind::Kur | CommandKind::P10cr)
    }

    /// Commands carrying a CRMF certificate template
    fn uses_template(self) -> bool {
        matches!(self, CommandKind::Ir | CommandKind::Cr | CommandKind::Kur)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopoMethod {
    None,
    RaVerified,
    Signature,
    KeyEncipherment,
    KeyAgreement,
}

impl PopoMethod {
    /// Map the `popo` option; unset selects signature
    pub fn from_code(code: Option<i64>) -> Result<Self> {
        match code {
            None | Some(1) => Ok(PopoMethod::Signature),
            Some(-1) => Ok(PopoMethod::None),
            Some(0) => Ok(PopoMethod::RaVerified),
            Some(2) => Ok(PopoMethod::KeyEncipherment),
            Some(3) => Ok(PopoMethod::KeyAgreement),
            Some(other) => Err(CmpError::ProtocolConfig(format!(
                "invalid value '{}' for popo method (must be between -1 and 3)",
                other
            ))),
        }
    }
}

/// Key to be certified
#[derive(Clone)]
pub enum NewKey {
    Private(PKey<Private>),
    Public(PKey<Public>),
}

impl NewKey {
    pub fn public_der(&self) -> Result<Vec<u8>> {
        Ok(match self {
            NewKey::Private(k) => k.public_key_to_der()?,
            NewKey::Public(k) => k.public_key_to_der()?,
        })
    }
}

/// Everything needed to build the first request of a transaction
pub struct RequestTemplate {
    pub kind: CommandKind,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub days: Option<u32>,
    pub sans: Vec<String>,
    pub sans_critical: bool,
    pub extensions: Vec<ExtensionValue>,
    pub policies: Vec<String>,
    pub policies_critical: bool,
    pub popo: PopoMethod,
    pub digest: String,
    pub new_key: Option<NewKey>,
    pub csr: Option<X509Req>,
    pub old_cert: Option<X509>,
    pub revocation_reason: Option<i32>,
    pub implicit_confirm: bool,
    pub disable_confirm: bool,
    pub general_info: Vec<InfoTypeAndValue>,
    pub info_type: Option<String>,
    /// Trust store for verifying newly enrolled certificates before confirming them
    pub out_trusted: Option<TrustStore>,
}

impl RequestTemplate {
    /// Certificate request with template and proof-of-possession
    pub fn cert_request(&self, cert_req_id: i64) -> Result<CertRequest> {
        let public_key = match &self.new_key {
            Some(key) => Some(key.public_der()?),
            None => None,
        };
        let template = CertTemplate {
            subject: self.subject.clone(),
            issuer: self.issuer.clone(),
            public_key,
            validity_days: self.days,
            sans: self.sans.clone(),
            sans_critical: self.sans_critical,
            extensions: self.extensions.clone(),
            policies: self.policies.clone(),
            policies_critical: self.policies_critical,
            old_cert_id: match (&self.old_cert, self.kind) {
                (Some(cert), CommandKind::Kur) => Some(cert_id_of(cert)?),
                _ => None,
            },
        };
        let popo = match self.popo {
            PopoMethod::None => None,
            PopoMethod::RaVerified => Some(ProofOfPossession::RaVerified),
            PopoMethod::KeyEncipherment => Some(ProofOfPossession::KeyEncipherment),
            PopoMethod::KeyAgreement => Some(ProofOfPossession::KeyAgreement),
            PopoMethod::Signature => match &self.new_key {
                Some(NewKey::Private(key)) => Some(ProofOfPossession::Signature {
                    digest: self.digest.clone(),
                    value: sign(key, &self.digest, &popo_input(&template)?)?,
                }),
                _ => {
                    return Err(CmpError::CredentialMismatch(
                        "signature-based POPO needs the private key of the key to be certified".to_string(),
                    ))
                }
            },
        };
        Ok(CertRequest {
            cert_req_id,
            template,
            popo,
        })
    }

    /// Body of the first request of the transaction
    pub fn body(&self) -> Result<PkiBody> {
        match self.kind {
            CommandKind::Ir => Ok(PkiBody::Ir(self.cert_request(0)?)),
            CommandKind::Cr => Ok(PkiBody::Cr(self.cert_request(0)?)),
            CommandKind::Kur => Ok(PkiBody::Kur(self.cert_request(0)?)),
            CommandKind::P10cr => {
                let csr = self
                    .csr
                    .as_ref()
                    .ok_or_else(|| CmpError::ProtocolConfig("-csr option is missing for command 'p10cr'".to_string()))?;
                Ok(PkiBody::P10cr { csr: csr.to_der()? })
            }
            CommandKind::Rr => {
                let cert = self.old_cert.as_ref().ok_or_else(|| {
                    CmpError::ProtocolConfig("missing certificate to be revoked".to_string())
                })?;
                Ok(PkiBody::Rr(RevDetails {
                    cert_id: cert_id_of(cert)?,
                    reason: self.revocation_reason,
                }))
            }
            CommandKind::Genm => Ok(PkiBody::Genm {
                itavs: self
                    .info_type
                    .iter()
                    .map(|t| InfoTypeAndValue {
                        info_type: t.clone(),
                        value: None,
                    })
                    .collect(),
            }),
        }
    }
}

/// Issuer and serial number of a certificate
pub fn cert_id_of(cert: &X509) -> Result<CertId> {
    let serial = cert.serial_number().to_bn()?.to_hex_str()?.to_string();
    Ok(CertId {
        issuer: name_to_string(cert.issuer_name()),
        serial,
    })
}

/// Check a DN given as `/type0=value0/type1=value1...` and return it normalized
pub fn parse_dn(dn: &str, desc: &str) -> Result<String> {
    let rest = dn.strip_prefix('/').ok_or_else(|| {
        CmpError::ProtocolConfig(format!("{} '{}' must start with '/'", desc, dn))
    })?;
    let mut builder = X509Name::builder()?;
    for part in rest.split('/').filter(|p| !p.is_empty()) {
        let (field, value) = part.split_once('=').ok_or_else(|| {
            CmpError::ProtocolConfig(format!("missing '=' after '{}' in {} '{}'", part, desc, dn))
        })?;
        builder.append_entry_by_text(field, value).map_err(|_| {
            CmpError::ProtocolConfig(format!("invalid attribute '{}' in {} '{}'", field, desc, dn))
        })?;
    }
    Ok(name_to_string(&builder.build()))
}

/// Parse the `sans` list into `DNS:`, `IP:` and `URI:` entries
///
/// # Returns
/// * `(Vec<String>, bool)` - General names and whether `critical` was given
pub fn parse_sans(list: &str) -> (Vec<String>, bool) {
    let mut critical = false;
    let mut names = Vec::new();
    for item in split_list(list) {
        if item == "critical" {
            critical = true;
        } else if item.parse::<IpAddr>().is_ok() {
            names.push(format!("IP:{}", item));
        } else if item.contains(':') {
            names.push(format!("URI:{}", item));
        } else {
            names.push(format!("DNS:{}", item));
        }
    }
    (names, critical)
}

/// Parse `OID:int:N` into an InfoTypeAndValue
pub fn parse_geninfo(spec: &str) -> Result<InfoTypeAndValue> {
    let (oid, rest) = spec
        .split_once(':')
        .ok_or_else(|| CmpError::ProtocolConfig(format!("missing ':' in -geninfo option '{}'", spec)))?;
    Asn1Object::from_str(oid)
        .map_err(|_| CmpError::ProtocolConfig(format!("cannot parse OID '{}' in -geninfo option", oid)))?;
    let number = rest.strip_prefix("int:").ok_or_else(|| {
        CmpError::ProtocolConfig(format!("missing 'int:' in -geninfo option '{}'", spec))
    })?;
    let value: i64 = number.parse().map_err(|_| {
        CmpError::ProtocolConfig(format!("cannot parse int '{}' in -geninfo option", number))
    })?;
    Ok(InfoTypeAndValue {
        info_type: oid.to_string(),
        value: Some(value),
    })
}

fn table<'a>(config: &'a AppConfig, name: &str, option: &str) -> Result<&'a Vec<(String, String)>> {
    config.tables.get(name).ok_or_else(|| {
        CmpError::ProtocolConfig(format!("cannot load -{} section '{}' from config file", option, name))
    })
}

/// Build the request template from the options
///
/// # Arguments
/// * `config` - The frozen configuration
/// * `loader` - Credential loader for new key, CSR and reference certificates
/// * `client` - The client credential, default key and reference certificate
/// * `params` - Verification parameters for `out_trusted`
pub fn configure_request(
    config: &AppConfig,
    loader: &CredentialLoader,
    client: &Credential,
    params: &VerifyParams,
) -> Result<RequestTemplate> {
    let opts = &config.request;
    let cmd = config
        .cmd
        .as_deref()
        .ok_or_else(|| CmpError::ProtocolConfig("no cmp command given, use -cmd".to_string()))?;
    let kind = CommandKind::from_name(cmd)?;
    let keyform = CredentialFormat::from_name(&config.formats.keyform)?;
    let certsform = CredentialFormat::from_name(&config.formats.certsform)?;

    if !kind.is_enrollment() {
        let ignored = [
            ("issuer", opts.issuer.is_some()),
            ("days", opts.days != 0),
            ("sans", opts.sans.is_some()),
            ("reqexts", opts.reqexts.is_some()),
            ("policies", opts.policies.is_some()),
            ("policy_oids", opts.policy_oids.is_some()),
            ("popo", opts.popo.is_some()),
            ("newkey", opts.newkey.is_some()),
            ("certout", opts.certout.is_some()),
        ];
        for (name, set) in ignored {
            if set {
                log::warn!("-{} option is ignored for command '{}'", name, kind.name());
            }
        }
    }
    if kind != CommandKind::Genm && opts.infotype.is_some() {
        log::warn!("-infotype option is ignored for command '{}'", kind.name());
    }
    if kind != CommandKind::Rr && opts.revreason != -1 {
        log::warn!("-revreason option is ignored for command '{}'", kind.name());
    }

    if kind.uses_template() && opts.newkey.is_none() && client.key.is_none() {
        return Err(CmpError::ProtocolConfig(
            "missing -newkey (or -key) to be certified".to_string(),
        ));
    }
    if kind.is_enrollment() && opts.certout.is_none() {
        return Err(CmpError::ProtocolConfig(
            "-certout not given, nowhere to save newly enrolled certificate".to_string(),
        ));
    }

    let subject = match &opts.subject {
        Some(dn) => Some(parse_dn(dn, "-subject")?),
        None => None,
    };
    let issuer = match &opts.issuer {
        Some(dn) => Some(parse_dn(dn, "-issuer")?),
        None => None,
    };

    let mut extensions = Vec::new();
    if let Some(name) = &opts.reqexts {
        for (ext, value) in table(config, name, "reqexts")? {
            let (critical, value) = match value.strip_prefix("critical") {
                Some(rest) => (true, rest.trim_start_matches([',', ' ']).to_string()),
                None => (false, value.clone()),
            };
            extensions.push(ExtensionValue {
                name: ext.clone(),
                value,
                critical,
            });
        }
    }
    let (sans, sans_critical) = match &opts.sans {
        Some(list) => parse_sans(list),
        None => (Vec::new(), false),
    };
    if !sans.is_empty() && extensions.iter().any(|e| e.name == "subjectAltName") {
        return Err(CmpError::ProtocolConfig(
            "cannot have Subject Alternative Names both via -reqexts and via -sans".to_string(),
        ));
    }

    if opts.policies.is_some() && opts.policy_oids.is_some() {
        return Err(CmpError::ProtocolConfig(
            "cannot have policies both via -policies and via -policy_oids".to_string(),
        ));
    }
    let mut policies = Vec::new();
    if let Some(name) = &opts.policies {
        policies.extend(table(config, name, "policies")?.iter().map(|(_, oid)| oid.clone()));
    }
    if let Some(list) = &opts.policy_oids {
        for oid in split_list(list) {
            Asn1Object::from_str(&oid)
                .map_err(|_| CmpError::ProtocolConfig(format!("invalid -policy_oids arg '{}'", oid)))?;
            policies.push(oid);
        }
    } else if opts.policy_oids_critical {
        log::warn!("-policy_oids_critical option is ignored since -policy_oids is not given");
    }

    let popo = PopoMethod::from_code(opts.popo)?;

    let csr = match &opts.csr {
        Some(uri) if kind == CommandKind::P10cr => Some(loader.load_csr(uri, "PKCS#10 CSR for p10cr")?),
        Some(_) => {
            log::warn!("-csr option is ignored for command other than p10cr");
            None
        }
        None if kind == CommandKind::P10cr => {
            return Err(CmpError::ProtocolConfig("-csr option is missing for command 'p10cr'".to_string()))
        }
        None => None,
    };

    let new_key = if !kind.uses_template() {
        None
    } else if let Some(uri) = &opts.newkey {
        let desc = "new private key for cert to be enrolled";
        match loader.load_key(uri, keyform, opts.newkeypass.as_ref(), desc) {
            Ok(key) => Some(NewKey::Private(key)),
            Err(e) => {
                log::warn!("{} not loaded ({}), falling back to public key", desc, e);
                Some(NewKey::Public(loader.load_public_key(uri, keyform, "new public key for cert to be enrolled")?))
            }
        }
    } else {
        client.key.clone().map(NewKey::Private)
    };
    if kind.uses_template() && popo == PopoMethod::Signature && !matches!(new_key, Some(NewKey::Private(_))) {
        return Err(CmpError::CredentialMismatch(
            "signature-based POPO needs the private key of the key to be certified".to_string(),
        ));
    }

    let old_cert = match &opts.oldcert {
        Some(uri) => Some(loader.load_cert(uri, certsform, config.formats.otherpass.as_ref(), "certificate to be updated/revoked")?),
        None => client.cert.clone(),
    };
    if kind == CommandKind::Kur && old_cert.is_none() {
        return Err(CmpError::ProtocolConfig(
            "missing -oldcert for certificate to be updated and no -cert given".to_string(),
        ));
    }
    if kind == CommandKind::Rr && old_cert.is_none() {
        return Err(CmpError::ProtocolConfig(
            "missing -oldcert for certificate to be revoked and no -cert given".to_string(),
        ));
    }

    let subject = subject.or_else(|| match (kind, &old_cert) {
        (CommandKind::Kur, Some(cert)) => Some(name_to_string(cert.subject_name())),
        _ => client.cert.as_ref().map(|c| name_to_string(c.subject_name())),
    });

    let mut sans = sans;
    if sans.is_empty() && !opts.san_nodefault && kind == CommandKind::Kur {
        if let Some(cert) = &old_cert {
            sans = default_sans(cert);
        }
    }

    let revocation_reason = match opts.revreason {
        -1 => None,
        r if (0..=10).contains(&r) && r != 7 => Some(r as i32),
        r => {
            return Err(CmpError::ProtocolConfig(format!(
                "invalid revreason {}, valid values are -1 .. 6, 8 .. 10",
                r
            )))
        }
    };

    let info_type = match &opts.infotype {
        Some(name) if kind == CommandKind::Genm => {
            let full = if name.starts_with("id-it-") {
                name.clone()
            } else {
                format!("id-it-{}", name)
            };
            Asn1Object::from_str(&full)
                .map_err(|_| CmpError::ProtocolConfig(format!("unknown OID name '{}' in -infotype option", full)))?;
            Some(full)
        }
        _ => None,
    };

    let general_info = match &opts.geninfo {
        Some(spec) => vec![parse_geninfo(spec)?],
        None => Vec::new(),
    };

    let out_trusted = match &opts.out_trusted {
        Some(list) => {
            let certs = loader.load_cert_list(
                list,
                certsform,
                config.formats.otherpass.as_ref(),
                "trusted certs for verifying newly enrolled cert",
                MergePolicy::KEEP_ALL,
            )?;
            let mut store = TrustStore::build(certs, params, "trust store for newly enrolled certificates")?;
            store.clear_check_time();
            Some(store)
        }
        None => None,
    };

    Ok(RequestTemplate {
        kind,
        subject,
        issuer,
        days: if opts.days > 0 { u32::try_from(opts.days).ok() } else { None },
        sans,
        sans_critical,
        extensions,
        policies,
        policies_critical: opts.policy_oids_critical,
        popo,
        digest: config.protection.digest.clone(),
        new_key,
        csr,
        old_cert,
        revocation_reason,
        implicit_confirm: opts.implicit_confirm,
        disable_confirm: opts.disable_confirm,
        general_info,
        info_type,
        out_trusted,
    })
}

fn default_sans(cert: &X509) -> Vec<String> {
    let Some(names) = cert.subject_alt_names() else {
        return Vec::new();
    };
    names
        .iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                Some(format!("DNS:{}", dns))
            } else if let Some(uri) = name.uri() {
                Some(format!("URI:{}", uri))
            } else {
                name.ipaddress().and_then(|ip| match ip.len() {
                    4 => Some(format!("IP:{}", std::net::Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))),
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(ip);
                        Some(format!("IP:{}", std::net::Ipv6Addr::from(octets)))
                    }
                    _ => None,
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki_generator::TestPki;

    fn base_config(cmd: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.cmd = Some(cmd.to_string());
        config.request.certout = Some("out.pem".to_string());
        config
    }

    fn client() -> Credential {
        let pki = TestPki::generate();
        Credential {
            cert: Some(pki.client_cert.clone()),
            key: Some(pki.client_key.clone()),
            chain: Vec::new(),
        }
    }

    #[test]
    fn test_dn_and_sans_parsing() {
        assert_eq!(parse_dn("/CN=a/O=b", "-subject").unwrap(), "/CN=a/O=b");
        assert!(parse_dn("CN=a", "-subject").is_err());
        assert!(parse_dn("/CN", "-subject").is_err());

        let (names, critical) = parse_sans("example.com 10.1.2.3, critical https://x.org/");
        assert!(critical);
        assert_eq!(names, vec!["DNS:example.com", "IP:10.1.2.3", "URI:https://x.org/"]);
    }

    #[test]
    fn test_geninfo_parsing() {
        let itav = parse_geninfo("1.2.3:int:987").unwrap();
        assert_eq!(itav.info_type, "1.2.3");
        assert_eq!(itav.value, Some(987));
        assert!(parse_geninfo("1.2.3").is_err());
        assert!(parse_geninfo("1.2.3:987").is_err());
        assert!(parse_geninfo("1.2.3:int:x").is_err());
    }

    #[test]
    fn test_popo_and_revreason_ranges() {
        assert_eq!(PopoMethod::from_code(None).unwrap(), PopoMethod::Signature);
        assert_eq!(PopoMethod::from_code(Some(-1)).unwrap(), PopoMethod::None);
        assert!(PopoMethod::from_code(Some(4)).is_err());
        assert!(PopoMethod::from_code(Some(-2)).is_err());

        let loader = CredentialLoader::new(true);
        let params = VerifyParams::default();
        for (reason, ok) in [(-1, true), (0, true), (6, true), (7, false), (10, true), (11, false)] {
            let mut config = base_config("rr");
            config.request.certout = None;
            config.request.revreason = reason;
            assert_eq!(configure_request(&config, &loader, &client(), &params).is_ok(), ok, "revreason {}", reason);
        }
    }

    #[test]
    fn test_command_requirements() {
        let loader = CredentialLoader::new(true);
        let params = VerifyParams::default();
        let no_key = Credential::default();

        assert!(configure_request(&base_config("ir"), &loader, &no_key, &params).is_err());
        assert!(configure_request(&base_config("kur"), &loader, &no_key, &params).is_err());
        assert!(configure_request(&base_config("p10cr"), &loader, &client(), &params).is_err());
        assert!(configure_request(&base_config("xyz"), &loader, &client(), &params).is_err());

        let mut no_out = base_config("ir");
        no_out.request.certout = None;
        assert!(configure_request(&no_out, &loader, &client(), &params).is_err());

        let template = configure_request(&base_config("ir"), &loader, &client(), &params).unwrap();
        assert_eq!(template.subject.as_deref(), Some("/CN=client"));
        match template.body().unwrap() {
            PkiBody::Ir(req) => assert!(matches!(req.popo, Some(ProofOfPossession::Signature { .. }))),
            other => panic!("expected ir, got {}", other.name()),
        }
    }

    #[test]
    fn test_p10cr_carries_csr() {
        use openssl::hash::MessageDigest;
        use openssl::x509::{X509NameBuilder, X509ReqBuilder};

        let pki = TestPki::generate();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "p10").unwrap();
        let mut req = X509ReqBuilder::new().unwrap();
        req.set_subject_name(&name.build()).unwrap();
        req.set_pubkey(&pki.client_key).unwrap();
        req.sign(&pki.client_key, MessageDigest::sha256()).unwrap();
        let req = req.build();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.pem");
        std::fs::write(&path, req.to_pem().unwrap()).unwrap();

        let mut config = base_config("p10cr");
        config.request.csr = Some(path.to_string_lossy().into_owned());
        let template = configure_request(&config, &CredentialLoader::new(true), &client(), &VerifyParams::default()).unwrap();
        match template.body().unwrap() {
            PkiBody::P10cr { csr } => assert_eq!(csr, req.to_der().unwrap()),
            other => panic!("expected p10cr, got {}", other.name()),
        }
    }

    #[test]
    fn test_conflicting_sources() {
        let loader = CredentialLoader::new(true);
        let params = VerifyParams::default();

        let mut config = base_config("cr");
        config.request.policies = Some("pols".into());
        config.request.policy_oids = Some("1.2.3.4".into());
        config.tables.insert("pols".into(), vec![("p1".into(), "1.2.3.5".into())]);
        assert!(matches!(
            configure_request(&config, &loader, &client(), &params),
            Err(CmpError::ProtocolConfig(_))
        ));

        let mut config = base_config("cr");
        config.request.reqexts = Some("exts".into());
        config.request.sans = Some("example.com".into());
        config
            .tables
            .insert("exts".into(), vec![("subjectAltName".into(), "DNS:other.com".into())]);
        assert!(matches!(
            configure_request(&config, &loader, &client(), &params),
            Err(CmpError::ProtocolConfig(_))
        ));

        let mut config = base_config("cr");
        config.request.reqexts = Some("missing".into());
        assert!(configure_request(&config, &loader, &client(), &params).is_err());
    }

    #[test]
    fn test_kur_defaults_from_old_cert() {
        let loader = CredentialLoader::new(true);
        let template = configure_request(&base_config("kur"), &loader, &client(), &VerifyParams::default()).unwrap();
        assert_eq!(template.subject.as_deref(), Some("/CN=client"));
        assert_eq!(template.sans, vec!["DNS:localhost", "IP:127.0.0.1"]);
        let req = template.cert_request(0).unwrap();
        assert_eq!(
            req.template.old_cert_id,
            Some(cert_id_of(&TestPki::generate().client_cert).unwrap())
        );

        let mut config = base_config("kur");
        config.request.san_nodefault = true;
        let template = configure_request(&config, &loader, &client(), &VerifyParams::default()).unwrap();
        assert!(template.sans.is_empty());
    }

    #[test]
    fn test_genm_infotype() {
        let loader = CredentialLoader::new(true);
        let mut config = base_config("genm");
        config.request.certout = None;
        config.request.infotype = Some("signKeyPairTypes".into());
        let template = configure_request(&config, &loader, &client(), &VerifyParams::default()).unwrap();
        assert_eq!(template.info_type.as_deref(), Some("id-it-signKeyPairTypes"));

        config.request.infotype = Some("noSuchInfoType".into());
        assert!(configure_request(&config, &loader, &client(), &VerifyParams::default()).is_err());
    }
}
