//! Application configuration
//!
//! [`AppConfig`] is assembled exactly once: defaults, then the TOML config
//! file, then command-line options, all applied through the same option table
//! in [`crate::options`]. After that it is frozen behind an `Arc` and handed to
//! every component.
//!
//! Config file layout:
//!
//! ```toml
//! # top-level keys form the unnamed default section
//! verbosity = 6
//!
//! [cmp]            # default named section
//! server = "localhost:8080"
//!
//! [ir-test]        # selected with section = "cmp, ir-test"
//! cmd = "ir"
//!
//! [my-exts]        # extension table referenced by reqexts = "my-exts"
//! keyUsage = "critical, digitalSignature"
//! ```

use crate::error::{CmpError, Result};
use crate::passphrase::SecretSource;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the config section applied when no `section` option is given
pub const DEFAULT_SECTION: &str = "cmp";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config: Option<PathBuf>,
    pub section: Option<String>,
    pub verbosity: i64,
    pub help: bool,
    pub cmd: Option<String>,
    pub server: ServerOptions,
    pub verify: VerificationOptions,
    pub protection: ProtectionOptions,
    pub request: RequestOptions,
    pub formats: FormatOptions,
    pub tls: TlsOptions,
    pub run: RunOptions,
    pub mock: MockOptions,
    /// Named config-file tables with string values, looked up by `reqexts` and `policies`
    pub tables: BTreeMap<String, Vec<(String, String)>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config: None,
            section: None,
            verbosity: default_verbosity(),
            help: false,
            cmd: None,
            server: ServerOptions::default(),
            verify: VerificationOptions::default(),
            protection: ProtectionOptions::default(),
            request: RequestOptions::default(),
            formats: FormatOptions::default(),
            tls: TlsOptions::default(),
            run: RunOptions::default(),
            mock: MockOptions::default(),
            tables: BTreeMap::new(),
        }
    }
}

fn default_verbosity() -> i64 {
    6
}

/// Where and how to reach the CMP server
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub server: Option<String>,
    pub path: Option<String>,
    pub proxy: Option<String>,
    pub no_proxy: Option<String>,
    /// Seconds, 0 = no limit
    pub msg_timeout: i64,
    /// Seconds, 0 = no limit
    pub total_timeout: i64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server: None,
            path: None,
            proxy: None,
            no_proxy: None,
            msg_timeout: default_msg_timeout(),
            total_timeout: 0,
        }
    }
}

fn default_msg_timeout() -> i64 {
    120
}

#[derive(Debug, Clone, Default)]
pub struct VerificationOptions {
    pub trusted: Option<String>,
    pub untrusted: Option<String>,
    pub srvcert: Option<String>,
    pub recipient: Option<String>,
    pub expect_sender: Option<String>,
    pub ignore_keyusage: bool,
    pub unprotected_errors: bool,
    pub extracertsout: Option<String>,
    pub cacertsout: Option<String>,
    /// Unix time used instead of the current time for validity checks
    pub attime: Option<i64>,
    pub verify_hostname: Option<String>,
    pub verify_ip: Option<String>,
    pub verify_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProtectionOptions {
    pub reference: Option<String>,
    pub secret: Option<SecretSource>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub keypass: Option<SecretSource>,
    pub digest: String,
    pub mac: String,
    pub extracerts: Option<String>,
    pub unprotected_requests: bool,
}

impl Default for ProtectionOptions {
    fn default() -> Self {
        Self {
            reference: None,
            secret: None,
            cert: None,
            key: None,
            keypass: None,
            digest: default_digest(),
            mac: default_mac(),
            extracerts: None,
            unprotected_requests: false,
        }
    }
}

fn default_digest() -> String {
    "sha256".to_string()
}

fn default_mac() -> String {
    "hmac-sha256".to_string()
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub newkey: Option<String>,
    pub newkeypass: Option<SecretSource>,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub days: i64,
    pub reqexts: Option<String>,
    pub sans: Option<String>,
    pub san_nodefault: bool,
    pub policies: Option<String>,
    pub policy_oids: Option<String>,
    pub policy_oids_critical: bool,
    /// Unset selects signature-based POPO
    pub popo: Option<i64>,
    pub csr: Option<String>,
    pub out_trusted: Option<String>,
    pub implicit_confirm: bool,
    pub disable_confirm: bool,
    pub certout: Option<String>,
    pub oldcert: Option<String>,
    /// -1 = no reason code
    pub revreason: i64,
    pub infotype: Option<String>,
    pub geninfo: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            newkey: None,
            newkeypass: None,
            subject: None,
            issuer: None,
            days: 0,
            reqexts: None,
            sans: None,
            san_nodefault: false,
            policies: None,
            policy_oids: None,
            policy_oids_critical: false,
            popo: None,
            csr: None,
            out_trusted: None,
            implicit_confirm: false,
            disable_confirm: false,
            certout: None,
            oldcert: None,
            revreason: -1,
            infotype: None,
            geninfo: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub certform: String,
    pub keyform: String,
    pub certsform: String,
    pub otherpass: Option<SecretSource>,
    /// Key store directory for keys given as `engine:<id>`
    pub engine: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            certform: default_format(),
            keyform: default_format(),
            certsform: default_format(),
            otherpass: None,
            engine: None,
        }
    }
}

fn default_format() -> String {
    "PEM".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub tls_used: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_keypass: Option<SecretSource>,
    pub tls_extra: Option<String>,
    pub tls_trusted: Option<String>,
    pub tls_host: Option<String>,
}

impl TlsOptions {
    /// True if any TLS option other than `tls_used` is set
    pub fn any_set(&self) -> bool {
        self.tls_cert.is_some()
            || self.tls_key.is_some()
            || self.tls_keypass.is_some()
            || self.tls_extra.is_some()
            || self.tls_trusted.is_some()
            || self.tls_host.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch: bool,
    pub repeat: i64,
    pub reqin: Option<String>,
    pub reqin_new_tid: bool,
    pub reqout: Option<String>,
    pub rspin: Option<String>,
    pub rspout: Option<String>,
    pub use_mock_srv: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch: false,
            repeat: 1,
            reqin: None,
            reqin_new_tid: false,
            reqout: None,
            rspin: None,
            rspout: None,
            use_mock_srv: false,
        }
    }
}

/// Mock server and stand-alone server mode options
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub port: Option<String>,
    pub max_msgs: i64,
    pub srv_ref: Option<String>,
    pub srv_secret: Option<SecretSource>,
    pub srv_cert: Option<String>,
    pub srv_key: Option<String>,
    pub srv_keypass: Option<SecretSource>,
    pub srv_trusted: Option<String>,
    pub srv_untrusted: Option<String>,
    pub rsp_cert: Option<String>,
    pub rsp_extracerts: Option<String>,
    pub rsp_capubs: Option<String>,
    pub poll_count: i64,
    pub check_after: i64,
    pub grant_implicitconf: bool,
    pub pkistatus: i64,
    pub failure: Option<i64>,
    pub failurebits: Option<i64>,
    pub statusstring: Option<String>,
    pub send_error: bool,
    pub send_unprotected: bool,
    pub send_unprot_err: bool,
    pub accept_unprotected: bool,
    pub accept_unprot_err: bool,
    pub accept_raverified: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            port: None,
            max_msgs: 0,
            srv_ref: None,
            srv_secret: None,
            srv_cert: None,
            srv_key: None,
            srv_keypass: None,
            srv_trusted: None,
            srv_untrusted: None,
            rsp_cert: None,
            rsp_extracerts: None,
            rsp_capubs: None,
            poll_count: 0,
            check_after: default_check_after(),
            grant_implicitconf: false,
            pkistatus: 0,
            failure: None,
            failurebits: None,
            statusstring: None,
            send_error: false,
            send_unprotected: false,
            send_unprot_err: false,
            accept_unprotected: false,
            accept_unprot_err: false,
            accept_raverified: false,
        }
    }
}

fn default_check_after() -> i64 {
    1
}

/// A parsed TOML config file
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    root: toml::Table,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|e| CmpError::io(path, e))?;
        Self::parse(path, &config_str)
    }

    pub fn parse(path: impl Into<PathBuf>, config_str: &str) -> Result<Self> {
        let path = path.into();
        let root: toml::Table = config_str.parse().map_err(|e| {
            CmpError::ProtocolConfig(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self { path, root })
    }

    /// Option assignments in application order
    ///
    /// Top-level keys come first, then each selected section in turn so that
    /// later sections override earlier ones. Without an explicit selection the
    /// `[cmp]` section is used if present.
    ///
    /// # Arguments
    /// * `sections` - Comma/whitespace separated section names, if given
    ///
    /// # Returns
    /// * `Result<Vec<(String, String)>>` - `(option name, raw value)` pairs
    pub fn entries(&self, sections: Option<&str>) -> Result<Vec<(String, String)>> {
        let mut entries = scalar_entries(&self.root);

        let selected: Vec<String> = match sections {
            Some(list) => split_list(list),
            None => vec![DEFAULT_SECTION.to_string()],
        };
        for name in selected {
            match self.root.get(&name) {
                Some(toml::Value::Table(table)) => entries.extend(scalar_entries(table)),
                Some(_) => {
                    return Err(CmpError::ProtocolConfig(format!(
                        "'{}' in config file '{}' is not a section",
                        name,
                        self.path.display()
                    )))
                }
                None if sections.is_some() => {
                    return Err(CmpError::ProtocolConfig(format!(
                        "no [{}] section found in config file '{}'",
                        name,
                        self.path.display()
                    )))
                }
                None => {}
            }
        }
        Ok(entries)
    }

    /// All tables of the file with their scalar entries, keyed by table name
    pub fn tables(&self) -> BTreeMap<String, Vec<(String, String)>> {
        self.root
            .iter()
            .filter_map(|(name, value)| match value {
                toml::Value::Table(table) => Some((name.clone(), scalar_entries(table))),
                _ => None,
            })
            .collect()
    }
}

fn scalar_entries(table: &toml::Table) -> Vec<(String, String)> {
    table
        .iter()
        .filter_map(|(key, value)| value_to_string(value).map(|v| (key.clone(), v)))
        .collect()
}

fn value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(value_to_string)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        toml::Value::Table(_) => None,
    }
}

/// Split a comma/whitespace separated list, honouring backslash escapes
pub fn split_list(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = list.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' | ' ' | '\t' | '\n' | '\r' => {
                if !current.is_empty() {
                    items.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        items.push(current);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
verbosity = 7
server = "top:1"

[cmp]
server = "cmp:2"
repeat = 2

[extra]
server = "extra:3"
trusted = ["a.pem", "b.pem"]

[my-exts]
keyUsage = "critical, digitalSignature"
"#;

    #[test]
    fn test_default_section_overrides_top_level() {
        let file = ConfigFile::parse("sample.toml", SAMPLE).unwrap();
        let entries = file.entries(None).unwrap();
        let servers: Vec<_> = entries
            .iter()
            .filter(|(k, _)| k == "server")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(servers, vec!["top:1", "cmp:2"]);
        assert!(entries.contains(&("verbosity".to_string(), "7".to_string())));
    }

    #[test]
    fn test_later_sections_win_and_arrays_join() {
        let file = ConfigFile::parse("sample.toml", SAMPLE).unwrap();
        let entries = file.entries(Some("cmp, extra")).unwrap();
        let last_server = entries.iter().rev().find(|(k, _)| k == "server").unwrap();
        assert_eq!(last_server.1, "extra:3");
        assert!(entries.contains(&("trusted".to_string(), "a.pem, b.pem".to_string())));
    }

    #[test]
    fn test_missing_named_section_is_error() {
        let file = ConfigFile::parse("sample.toml", SAMPLE).unwrap();
        assert!(matches!(
            file.entries(Some("nope")),
            Err(CmpError::ProtocolConfig(_))
        ));
        let tables = file.tables();
        assert_eq!(
            tables["my-exts"],
            vec![("keyUsage".to_string(), "critical, digitalSignature".to_string())]
        );
    }

    #[test]
    fn test_split_list_escapes() {
        assert_eq!(
            split_list("a.pem, b.pem  c\\ d.pem,,"),
            vec!["a.pem", "b.pem", "c d.pem"]
        );
        assert!(split_list(" , ").is_empty());
    }
}
