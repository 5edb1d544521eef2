//! Option table
//!
//! Every configuration switch is one row of [`OPTIONS`]: its name, value kind,
//! help text and the function that stores the value into [`AppConfig`]. The
//! config file and the command line go through the same rows, so the two
//! sources cannot drift apart.

use crate::configs::{AppConfig, ConfigFile};
use crate::error::{CmpError, Result};
use crate::passphrase::SecretSource;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Boolean switch, takes no value on the command line
    Flag,
    Text,
    /// Signed integer
    Int,
    /// Non-negative integer
    Nat,
}

/// A parsed option value; `None` means the option was reset with an empty string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Text(Option<String>),
    Int(Option<i64>),
}

impl OptionValue {
    fn flag(self) -> bool {
        matches!(self, OptionValue::Flag(true))
    }

    fn text(self) -> Option<String> {
        match self {
            OptionValue::Text(t) => t,
            _ => None,
        }
    }

    fn int(self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => i,
            _ => None,
        }
    }
}

pub struct OptionDef {
    pub name: &'static str,
    pub kind: OptionKind,
    pub help: &'static str,
    pub apply: fn(&mut AppConfig, OptionValue),
}

macro_rules! flag {
    ($name:literal, $help:literal, $($field:ident).+) => {
        OptionDef {
            name: $name,
            kind: OptionKind::Flag,
            help: $help,
            apply: |c, v| c.$($field).+ = v.flag(),
        }
    };
}

macro_rules! text {
    ($name:literal, $help:literal, $($field:ident).+) => {
        OptionDef {
            name: $name,
            kind: OptionKind::Text,
            help: $help,
            apply: |c, v| c.$($field).+ = v.text(),
        }
    };
}

macro_rules! text_or {
    ($name:literal, $help:literal, $default:literal, $($field:ident).+) => {
        OptionDef {
            name: $name,
            kind: OptionKind::Text,
            help: $help,
            apply: |c, v| c.$($field).+ = v.text().unwrap_or_else(|| $default.to_string()),
        }
    };
}

macro_rules! secret {
    ($name:literal, $help:literal, $($field:ident).+) => {
        OptionDef {
            name: $name,
            kind: OptionKind::Text,
            help: $help,
            apply: |c, v| c.$($field).+ = v.text().map(SecretSource::new),
        }
    };
}

macro_rules! int {
    ($kind:ident, $name:literal, $help:literal, $default:expr, $($field:ident).+) => {
        OptionDef {
            name: $name,
            kind: OptionKind::$kind,
            help: $help,
            apply: |c, v| c.$($field).+ = v.int().unwrap_or($default),
        }
    };
}

macro_rules! int_opt {
    ($kind:ident, $name:literal, $help:literal, $($field:ident).+) => {
        OptionDef {
            name: $name,
            kind: OptionKind::$kind,
            help: $help,
            apply: |c, v| c.$($field).+ = v.int(),
        }
    };
}

pub static OPTIONS: &[OptionDef] = &[
    // generic
    OptionDef {
        name: "config",
        kind: OptionKind::Text,
        help: "TOML configuration file to use",
        apply: |c, v| c.config = v.text().map(PathBuf::from),
    },
    text!("section", "Section(s) of the config file to use, default [cmp]", section),
    int!(Nat, "verbosity", "Log level: 3 error, 4 warning, 6 info, 7 debug, 8 trace", 6, verbosity),
    flag!("help", "Print this summary", help),
    text!("cmd", "CMP request to send: ir, cr, kur, p10cr, rr or genm", cmd),
    text!("infotype", "InfoType name for genm, e.g. id-it-signKeyPairTypes", request.infotype),
    text!("geninfo", "generalInfo to place in request headers, format OID:int:N", request.geninfo),
    // certificate enrollment
    text!("newkey", "Private or public key for the requested certificate", request.newkey),
    secret!("newkeypass", "Passphrase source for the new key", request.newkeypass),
    text!("subject", "Subject DN of the requested certificate, e.g. /CN=a/O=b", request.subject),
    text!("issuer", "DN of the issuer to place in the request", request.issuer),
    int!(Nat, "days", "Requested validity in days, 0 for default", 0, request.days),
    text!("reqexts", "Config section with extensions to request", request.reqexts),
    text!("sans", "Subject Alternative Names: DNS names, IP addresses, URIs; 'critical' marks them critical", request.sans),
    flag!("san_nodefault", "Do not take SANs from the reference certificate", request.san_nodefault),
    text!("policies", "Config section with certificate policies to request", request.policies),
    text!("policy_oids", "Certificate policy OIDs to request", request.policy_oids),
    flag!("policy_oids_critical", "Mark the requested policies critical", request.policy_oids_critical),
    int_opt!(Int, "popo", "Proof-of-possession: -1 none, 0 RAVERIFIED, 1 signature, 2 KEYENC, 3 KEYAGREE", request.popo),
    text!("csr", "PKCS#10 CSR to use in a p10cr", request.csr),
    text!("out_trusted", "Certificates to verify newly enrolled certificates against", request.out_trusted),
    flag!("implicit_confirm", "Request implicit confirmation of enrolled certificates", request.implicit_confirm),
    flag!("disable_confirm", "Do not confirm enrolled certificates", request.disable_confirm),
    text!("certout", "File to save the newly enrolled certificate", request.certout),
    // certificate update and revocation
    text!("oldcert", "Certificate to update (kur) or revoke (rr)", request.oldcert),
    int!(Int, "revreason", "Revocation reason code 0..10 (except 7), -1 for none", -1, request.revreason),
    // message transfer
    text!("server", "[http[s]://]address[:port] of the CMP server", server.server),
    text!("path", "HTTP path of the CMP server, default /", server.path),
    text!("proxy", "[http[s]://]address[:port] of the HTTP proxy", server.proxy),
    text!("no_proxy", "Hosts not to use the proxy for", server.no_proxy),
    int!(Nat, "msg_timeout", "Seconds to wait per message, 0 for infinite", 120, server.msg_timeout),
    int!(Nat, "total_timeout", "Overall seconds per transaction, 0 for infinite", 0, server.total_timeout),
    // server authentication
    text!("trusted", "Trusted certificates for verifying CMP responses", verify.trusted),
    text!("untrusted", "Intermediate certificates for chain building", verify.untrusted),
    text!("srvcert", "Pinned server certificate, overrides -trusted", verify.srvcert),
    text!("recipient", "DN of the intended recipient", verify.recipient),
    text!("expect_sender", "DN of the expected sender of responses", verify.expect_sender),
    flag!("ignore_keyusage", "Ignore the keyUsage of the response signer certificate", verify.ignore_keyusage),
    flag!("unprotected_errors", "Accept unprotected error responses", verify.unprotected_errors),
    text!("extracertsout", "File to save extra certificates received", verify.extracertsout),
    text!("cacertsout", "File to save CA certificates received", verify.cacertsout),
    int_opt!(Int, "attime", "Unix time to use for certificate validity checks", verify.attime),
    text!("verify_hostname", "Expected host name of the verified certificate", verify.verify_hostname),
    text!("verify_ip", "Expected IP address of the verified certificate", verify.verify_ip),
    text!("verify_email", "Expected email address of the verified certificate", verify.verify_email),
    // client authentication
    text!("ref", "Reference value identifying the shared secret", protection.reference),
    secret!("secret", "Passphrase source of the shared secret for MAC protection", protection.secret),
    text!("cert", "Client certificate for signature protection", protection.cert),
    text!("key", "Private key for signature protection", protection.key),
    secret!("keypass", "Passphrase source of -key", protection.keypass),
    text_or!("digest", "Digest for signatures and POPO, default sha256", "sha256", protection.digest),
    text_or!("mac", "MAC algorithm for shared-secret protection, default hmac-sha256", "hmac-sha256", protection.mac),
    text!("extracerts", "Certificates to include in the extraCerts field", protection.extracerts),
    flag!("unprotected_requests", "Send requests without protection", protection.unprotected_requests),
    // credential formats
    text_or!("certform", "Format of saved certificates: PEM or DER", "PEM", formats.certform),
    text_or!("keyform", "Format of key files: PEM, DER, P12 or ENGINE", "PEM", formats.keyform),
    text_or!("certsform", "Format of certificate files: PEM, DER or P12", "PEM", formats.certsform),
    secret!("otherpass", "Passphrase source of certificate files", formats.otherpass),
    text!("engine", "Key store directory for keys given as engine:<id>", formats.engine),
    // TLS
    flag!("tls_used", "Use TLS towards the server", tls.tls_used),
    text!("tls_cert", "Client certificate for TLS", tls.tls_cert),
    text!("tls_key", "Private key for TLS", tls.tls_key),
    secret!("tls_keypass", "Passphrase source of -tls_key", tls.tls_keypass),
    text!("tls_extra", "Extra certificates to send in the TLS handshake", tls.tls_extra),
    text!("tls_trusted", "Trusted certificates for the TLS server", tls.tls_trusted),
    text!("tls_host", "Expected TLS server name, default the -server host", tls.tls_host),
    // client run control
    flag!("batch", "Never prompt for passphrases", run.batch),
    int!(Int, "repeat", "Number of transactions to run, default 1", 1, run.repeat),
    text!("reqin", "Files to read requests from instead of building them", run.reqin),
    flag!("reqin_new_tid", "Give requests read with -reqin a fresh transaction ID", run.reqin_new_tid),
    text!("reqout", "Files to write requests to", run.reqout),
    text!("rspin", "Files to read responses from instead of sending requests", run.rspin),
    text!("rspout", "Files to write responses to", run.rspout),
    flag!("use_mock_srv", "Use the internal mock server instead of a network", run.use_mock_srv),
    // mock server
    text!("port", "Act as HTTP mock server listening on this port", mock.port),
    int!(Nat, "max_msgs", "Messages to serve in server mode, 0 for unlimited", 0, mock.max_msgs),
    text!("srv_ref", "Reference value of the mock server's shared secret", mock.srv_ref),
    secret!("srv_secret", "Passphrase source of the mock server's shared secret", mock.srv_secret),
    text!("srv_cert", "Certificate of the mock server", mock.srv_cert),
    text!("srv_key", "Private key of the mock server", mock.srv_key),
    secret!("srv_keypass", "Passphrase source of -srv_key", mock.srv_keypass),
    text!("srv_trusted", "Trusted certificates for verifying requests", mock.srv_trusted),
    text!("srv_untrusted", "Intermediate certificates for verifying requests", mock.srv_untrusted),
    text!("rsp_cert", "Certificate the mock server returns as enrolled", mock.rsp_cert),
    text!("rsp_extracerts", "Extra certificates the mock server returns", mock.rsp_extracerts),
    text!("rsp_capubs", "CA certificates the mock server returns", mock.rsp_capubs),
    int!(Nat, "poll_count", "Number of polls before the certificate is returned", 0, mock.poll_count),
    int!(Nat, "check_after", "checkAfter seconds in pollRep, default 1", 1, mock.check_after),
    flag!("grant_implicitconf", "Grant implicit confirmation", mock.grant_implicitconf),
    int!(Nat, "pkistatus", "PKIStatus of responses, 0..6", 0, mock.pkistatus),
    int_opt!(Nat, "failure", "PKIFailureInfo bit index 0..26 to set in responses", mock.failure),
    int_opt!(Nat, "failurebits", "PKIFailureInfo bit pattern, overrides -failure", mock.failurebits),
    text!("statusstring", "Status string to place in responses", mock.statusstring),
    flag!("send_error", "Answer every request with an error message", mock.send_error),
    flag!("send_unprotected", "Send positive responses unprotected", mock.send_unprotected),
    flag!("send_unprot_err", "Send negative responses unprotected", mock.send_unprot_err),
    flag!("accept_unprotected", "Accept unprotected requests", mock.accept_unprotected),
    flag!("accept_unprot_err", "Accept unprotected error messages", mock.accept_unprot_err),
    flag!("accept_raverified", "Accept RAVERIFIED as proof-of-possession", mock.accept_raverified),
];

/// Look up an option row by name
pub fn find(name: &str) -> Option<&'static OptionDef> {
    OPTIONS.iter().find(|o| o.name == name)
}

/// Parse a raw value according to an option's kind
pub fn parse_value(def: &OptionDef, raw: &str) -> Result<OptionValue> {
    let raw = raw.trim();
    match def.kind {
        OptionKind::Flag => match raw.to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "no" | "off" => Ok(OptionValue::Flag(false)),
            "1" | "true" | "yes" | "on" => Ok(OptionValue::Flag(true)),
            _ => Err(CmpError::ProtocolConfig(format!(
                "invalid boolean value '{}' for option -{}",
                raw, def.name
            ))),
        },
        OptionKind::Text if raw.is_empty() => Ok(OptionValue::Text(None)),
        OptionKind::Text => Ok(OptionValue::Text(Some(raw.to_string()))),
        OptionKind::Int | OptionKind::Nat if raw.is_empty() => Ok(OptionValue::Int(None)),
        OptionKind::Int | OptionKind::Nat => {
            let n: i64 = raw.parse().map_err(|_| {
                CmpError::ProtocolConfig(format!(
                    "invalid number '{}' for option -{}",
                    raw, def.name
                ))
            })?;
            if def.kind == OptionKind::Nat && n < 0 {
                return Err(CmpError::ProtocolConfig(format!(
                    "option -{} must not be negative, got {}",
                    def.name, n
                )));
            }
            Ok(OptionValue::Int(Some(n)))
        }
    }
}

/// Apply one `name = value` assignment to the configuration
pub fn apply_option(config: &mut AppConfig, name: &str, raw: &str) -> Result<()> {
    let def = find(name)
        .ok_or_else(|| CmpError::ProtocolConfig(format!("unknown option '{}'", name)))?;
    let value = parse_value(def, raw)?;
    (def.apply)(config, value);
    Ok(())
}

/// Apply the selected sections of a config file
pub fn apply_config_file(config: &mut AppConfig, file: &ConfigFile, sections: Option<&str>) -> Result<()> {
    for (name, value) in file.entries(sections)? {
        if name == "config" || name == "section" {
            continue;
        }
        apply_option(config, &name, &value).map_err(|e| match e {
            CmpError::ProtocolConfig(msg) => CmpError::ProtocolConfig(format!("in config file: {}", msg)),
            other => other,
        })?;
    }
    config.tables = file.tables();
    Ok(())
}

/// Split command-line arguments into `(name, value)` pairs
///
/// Options are written `-name value` or `--name value`; flags take no value
/// and may be given as `-name=value` like every other option.
fn split_args(args: &[String]) -> Result<Vec<(&'static OptionDef, String)>> {
    let mut pairs = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let stripped = arg
            .strip_prefix("--")
            .or_else(|| arg.strip_prefix('-'))
            .ok_or_else(|| CmpError::ProtocolConfig(format!("unexpected argument '{}'", arg)))?;
        let (name, inline) = match stripped.split_once('=') {
            Some((n, v)) => (n, Some(v.to_string())),
            None => (stripped, None),
        };
        let def = find(name)
            .ok_or_else(|| CmpError::ProtocolConfig(format!("unknown option '-{}'", name)))?;
        let value = match (inline, def.kind) {
            (Some(v), _) => v,
            (None, OptionKind::Flag) => "true".to_string(),
            (None, _) => iter.next().cloned().ok_or_else(|| {
                CmpError::ProtocolConfig(format!("option -{} needs a value", name))
            })?,
        };
        pairs.push((def, value));
    }
    Ok(pairs)
}

/// Build the configuration from defaults, the config file and the command line
///
/// `config` and `section` are taken from the command line first so the file
/// can be applied before the remaining options override it.
pub fn parse_args(args: &[String]) -> Result<AppConfig> {
    let pairs = split_args(args)?;
    let mut config = AppConfig::default();

    for (def, value) in &pairs {
        if def.name == "config" || def.name == "section" {
            (def.apply)(&mut config, parse_value(def, value)?);
        }
    }
    if let Some(path) = config.config.clone() {
        let file = ConfigFile::from_file(&path)?;
        let sections = config.section.clone();
        apply_config_file(&mut config, &file, sections.as_deref())?;
    }

    for (def, value) in &pairs {
        (def.apply)(&mut config, parse_value(def, value)?);
    }
    Ok(config)
}

/// Help text listing every option
pub fn usage() -> String {
    let mut out = String::from("Usage: pki-cmp [options]\n\nValid options are:\n");
    for def in OPTIONS {
        let arg = match def.kind {
            OptionKind::Flag => "",
            OptionKind::Text => " val",
            OptionKind::Int => " int",
            OptionKind::Nat => " nonneg",
        };
        let left = format!(" -{}{}", def.name, arg);
        out.push_str(&format!("{:<26} {}\n", left, def.help));
    }
    out
}
