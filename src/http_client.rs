//! Blocking HTTP(S) client for CMP
//!
//! One POST per exchange with `Content-Type: application/pkixcmp`, sent with
//! `reqwest`'s blocking client. Supports an HTTP proxy with a `no_proxy` host
//! list and per-message timeouts bounded by the transaction deadline. TLS is
//! configured through `native-tls` with the client's own trust store and
//! optional client certificate.

use crate::configs::{split_list, AppConfig};
use crate::credentials::{name_to_string, CredentialFormat, CredentialLoader, MergePolicy};
use crate::error::{CmpError, Result};
use crate::truststore::{TrustStore, VerifyParams};
use openssl::x509::X509;
use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::header;
use std::io::Read;
use std::time::Duration;

pub const CONTENT_TYPE: &str = "application/pkixcmp";
const MAX_RESPONSE_LEN: u64 = 1 << 20;

/// Parsed `[http[s]://]host[:port][/path]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub tls: bool,
}

impl ServerAddress {
    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.authority(), self.path)
    }
}

/// Parse a server or proxy address
///
/// `https://` implies TLS and port 443, otherwise the default port is 80.
/// A path given in the address wins over `default_path`.
pub fn parse_server(spec: &str, default_path: Option<&str>) -> Result<ServerAddress> {
    let (tls, rest) = if let Some(rest) = spec.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = spec.strip_prefix("http://") {
        (false, rest)
    } else {
        (false, spec)
    };
    let (hostport, path) = match rest.find('/') {
        Some(i) => (&rest[..i], Some(&rest[i..])),
        None => (rest, None),
    };
    let (host, port) = if let Some(v6) = hostport.strip_prefix('[') {
        let (host, tail) = v6
            .split_once(']')
            .ok_or_else(|| CmpError::ProtocolConfig(format!("missing ']' in server address '{}'", spec)))?;
        (host, tail.strip_prefix(':'))
    } else {
        match hostport.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (hostport, None),
        }
    };
    if host.is_empty() {
        return Err(CmpError::ProtocolConfig(format!("missing host in server address '{}'", spec)));
    }
    let port = match port {
        Some(p) => match p.parse::<u16>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(CmpError::ProtocolConfig(format!(
                    "invalid port '{}' in server address '{}', must be 1..65535",
                    p, spec
                )))
            }
        },
        None if tls => 443,
        None => 80,
    };
    let path = match path.filter(|p| *p != "/").or(default_path) {
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{}", p),
        None => "/".to_string(),
    };
    Ok(ServerAddress {
        host: host.to_string(),
        port,
        path,
        tls,
    })
}

/// True if `host` matches an entry of the `no_proxy` list
pub fn bypass_proxy(host: &str, no_proxy: Option<&str>) -> bool {
    let Some(list) = no_proxy else {
        return false;
    };
    split_list(list).iter().any(|entry| {
        let entry = entry.trim_start_matches('.');
        host.eq_ignore_ascii_case(entry) || host.to_ascii_lowercase().ends_with(&format!(".{}", entry.to_ascii_lowercase()))
    })
}

/// TLS client setup
#[derive(Clone)]
pub struct TlsSettings {
    connector: native_tls::TlsConnector,
    /// Expected peer identity
    pub host: String,
    /// Store the peer certificate is checked against when the expected
    /// identity differs from the server host name
    pub peer_check: Option<TrustStore>,
}

fn tls_err(e: native_tls::Error) -> CmpError {
    CmpError::TrustConfig(format!("cannot set up TLS: {}", e))
}

/// Build TLS client settings from the `tls_*` options
///
/// The TLS trust store is an independent instance carrying the peer identity
/// `tls_host` (or the server host), so it never affects the CMP server store.
pub fn configure_tls(
    config: &AppConfig,
    loader: &CredentialLoader,
    params: &VerifyParams,
    server_host: &str,
) -> Result<Option<TlsSettings>> {
    let opts = &config.tls;
    if !opts.tls_used {
        if opts.any_set() {
            log::warn!("TLS options are ignored since -tls_used is not given");
        }
        return Ok(None);
    }
    let certsform = CredentialFormat::from_name(&config.formats.certsform)?;
    let keyform = CredentialFormat::from_name(&config.formats.keyform)?;
    let otherpass = config.formats.otherpass.as_ref();
    let host = opts.tls_host.clone().unwrap_or_else(|| server_host.to_string());

    let mut builder = native_tls::TlsConnector::builder();
    let peer_check = match &opts.tls_trusted {
        Some(list) => {
            let certs = loader.load_cert_list(list, certsform, otherpass, "trusted TLS certs", MergePolicy::KEEP_ALL)?;
            let mut store = TrustStore::build(certs, params, "trust store for TLS server")?;
            store.set_identity(Some(&host));
            builder.disable_built_in_roots(true);
            for cert in store.certs() {
                builder.add_root_certificate(native_tls::Certificate::from_der(&cert.to_der()?).map_err(tls_err)?);
            }
            if host.eq_ignore_ascii_case(server_host) {
                None
            } else {
                // the connector only knows the URL host, the expected name is checked after the handshake
                builder.danger_accept_invalid_hostnames(true);
                Some(store)
            }
        }
        None => {
            log::warn!("-tls_used given without -tls_trusted; will not authenticate the TLS server");
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
            None
        }
    };

    match (&opts.tls_cert, &opts.tls_key) {
        (Some(cert_uri), Some(key_uri)) => {
            let cred = loader.load(cert_uri, certsform, opts.tls_keypass.as_ref(), "TLS client certificate (optionally with chain)")?;
            let cert = cred
                .cert
                .ok_or_else(|| CmpError::CredentialMismatch("no TLS client certificate found".to_string()))?;
            let key = loader.load_key(key_uri, keyform, opts.tls_keypass.as_ref(), "private key for TLS client")?;
            if !cert.public_key()?.public_eq(&key) {
                return Err(CmpError::CredentialMismatch(
                    "TLS client certificate and key do not match".to_string(),
                ));
            }
            let mut chain_pem = cert.to_pem()?;
            let mut extra = cred.chain;
            if let Some(list) = &opts.tls_extra {
                extra.extend(loader.load_cert_list(list, certsform, otherpass, "extra certificates for TLS", MergePolicy::KEEP_ALL)?);
            }
            for cert in &extra {
                chain_pem.extend(cert.to_pem()?);
            }
            let identity =
                native_tls::Identity::from_pkcs8(&chain_pem, &key.private_key_to_pem_pkcs8()?).map_err(tls_err)?;
            builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(CmpError::CredentialMismatch(
                "must give both -tls_cert and -tls_key options or neither".to_string(),
            ))
        }
    }

    Ok(Some(TlsSettings {
        connector: builder.build().map_err(tls_err)?,
        host,
        peer_check,
    }))
}

fn transport_err(e: reqwest::Error) -> CmpError {
    if e.is_timeout() {
        CmpError::Transport("timeout waiting for HTTP response".to_string())
    } else {
        CmpError::Transport(format!("HTTP exchange failed: {}", e))
    }
}

fn read_body(response: Response) -> Result<Vec<u8>> {
    if response.content_length().is_some_and(|len| len > MAX_RESPONSE_LEN) {
        return Err(CmpError::Transport("HTTP response too long".to_string()));
    }
    let mut body = Vec::new();
    response
        .take(MAX_RESPONSE_LEN + 1)
        .read_to_end(&mut body)
        .map_err(|e| CmpError::Transport(format!("cannot read HTTP response: {}", e)))?;
    if body.len() as u64 > MAX_RESPONSE_LEN {
        return Err(CmpError::Transport("HTTP response too long".to_string()));
    }
    Ok(body)
}

#[derive(Clone)]
pub struct HttpClient {
    url: String,
    client: Client,
    peer_check: Option<TrustStore>,
}

impl HttpClient {
    /// # Arguments
    /// * `address` - The CMP server
    /// * `proxy` - Proxy address, `None` to fall back to the `http(s)_proxy` environment
    /// * `no_proxy` - Hosts reached directly, `None` to fall back to `no_proxy` in the environment
    /// * `tls` - TLS settings, required for `https://` servers
    pub fn new(
        address: ServerAddress,
        proxy: Option<&str>,
        no_proxy: Option<&str>,
        tls: Option<TlsSettings>,
    ) -> Result<Self> {
        if address.tls && tls.is_none() {
            return Err(CmpError::ProtocolConfig(format!(
                "server '{}' uses https but -tls_used is not given",
                address.host
            )));
        }
        let env_name = if tls.is_some() { "https_proxy" } else { "http_proxy" };
        let proxy = proxy
            .map(str::to_string)
            .or_else(|| std::env::var(env_name).ok())
            .or_else(|| std::env::var(env_name.to_ascii_uppercase()).ok())
            .filter(|p| !p.is_empty());
        let no_proxy = no_proxy
            .map(str::to_string)
            .or_else(|| std::env::var("no_proxy").ok())
            .or_else(|| std::env::var("NO_PROXY").ok());

        // one connection per message, like the server side expects
        let mut builder = Client::builder().pool_max_idle_per_host(0).no_proxy();
        match proxy {
            Some(p) if !bypass_proxy(&address.host, no_proxy.as_deref()) => {
                let proxy = parse_server(&p, None)?;
                log::debug!("using proxy {}", proxy.authority());
                let proxy = reqwest::Proxy::all(format!("http://{}", proxy.authority()))
                    .map_err(|e| CmpError::ProtocolConfig(format!("invalid proxy '{}': {}", p, e)))?;
                builder = builder.proxy(proxy);
            }
            _ => {}
        }
        let mut address = address;
        let mut peer_check = None;
        if let Some(tls) = tls {
            address.tls = true;
            builder = builder.use_preconfigured_tls(tls.connector);
            if let Some(store) = tls.peer_check {
                builder = builder.tls_info(true);
                peer_check = Some(store);
            }
        }
        Ok(HttpClient {
            url: address.url(),
            client: build_client(builder)?,
            peer_check,
        })
    }

    /// Send `body` and return the response body
    pub fn post(&self, body: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        log::debug!("sending {} bytes to {}", body.len(), self.url);
        let mut request = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, CONTENT_TYPE)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(body.to_vec());
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().map_err(transport_err)?;
        self.check_peer(&response)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CmpError::Transport(format!("server returned HTTP status {}", status.as_u16())));
        }
        if let Some(ct) = response.headers().get(header::CONTENT_TYPE) {
            let ct = ct.to_str().unwrap_or_default();
            if !ct.eq_ignore_ascii_case(CONTENT_TYPE) {
                return Err(CmpError::Transport(format!("unexpected content type '{}' in HTTP response", ct)));
            }
        }
        read_body(response)
    }

    fn check_peer(&self, response: &Response) -> Result<()> {
        let Some(store) = &self.peer_check else {
            return Ok(());
        };
        let der = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .ok_or_else(|| CmpError::Transport("TLS server did not present a certificate".to_string()))?;
        let cert = X509::from_der(der)?;
        log::debug!("checking TLS server certificate '{}'", name_to_string(cert.subject_name()));
        store
            .verify(&cert, &[])
            .map_err(|e| CmpError::Transport(format!("TLS server authentication failed: {}", e)))
    }
}

fn build_client(builder: ClientBuilder) -> Result<Client> {
    builder
        .build()
        .map_err(|e| CmpError::Transport(format!("cannot create HTTP client: {}", e)))
}

/// Fetch a resource with GET, used for credentials given as http(s) URIs
pub fn fetch(url: &str, timeout: Option<Duration>) -> Result<Vec<u8>> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let response = build_client(builder)?.get(url).send().map_err(transport_err)?;
    let status = response.status();
    if !status.is_success() {
        return Err(CmpError::Transport(format!("server returned HTTP status {}", status.as_u16())));
    }
    read_body(response)
}
