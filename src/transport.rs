//! Message transports
//!
//! Every request/response round trip goes through a [`Transport`]. Three
//! implementations exist:
//! - [`HttpTransport`]: encode, POST to the CMP server, decode
//! - [`MockTransport`]: hand the message to an in-process [`MockServer`]
//! - [`ReplayTransport`]: capture requests/responses to files and replay
//!   them from files, optionally wrapping one of the other two
//!
//! Replay keeps the transaction consistent: whenever a request or response
//! came from a file, the transaction ID and nonces of the context are taken
//! from the header of the response actually returned.

use crate::configs::{split_list, AppConfig};
use crate::error::{CmpError, Result};
use crate::http_client::HttpClient;
use crate::mock_server::MockServer;
use crate::protection::Protector;
use crate::protocol::{decode_message, encode_message, random_bytes, PkiMessage, TransactionState, TRANSACTION_ID_LEN};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-transaction state handed to every exchange
#[derive(Debug, Clone, Default)]
pub struct TransactionContext {
    pub state: TransactionState,
    pub msg_timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl TransactionContext {
    pub fn new(msg_timeout: Option<Duration>, total_timeout: Option<Duration>) -> Self {
        TransactionContext {
            state: TransactionState::new(),
            msg_timeout,
            total_timeout,
            deadline: None,
        }
    }

    /// Reset transaction ID and nonces and restart the total timeout
    pub fn start(&mut self) {
        self.state.reset();
        self.deadline = self.total_timeout.map(|t| Instant::now() + t);
    }

    /// Time left until the total timeout, `None` if unlimited
    pub fn remaining(&self) -> Result<Option<Duration>> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(CmpError::Transport("total timeout of transaction exceeded".to_string()))
                } else {
                    Ok(Some(left))
                }
            }
        }
    }

    /// Timeout for the next exchange: the message timeout bounded by the deadline
    pub fn exchange_timeout(&self) -> Result<Option<Duration>> {
        Ok(match (self.msg_timeout, self.remaining()?) {
            (Some(m), Some(r)) => Some(m.min(r)),
            (m, r) => m.or(r),
        })
    }
}

/// One request/response round trip
pub trait Transport: Send {
    fn exchange(&mut self, ctx: &mut TransactionContext, request: &PkiMessage) -> Result<PkiMessage>;

    fn name(&self) -> &'static str;
}

pub struct HttpTransport {
    client: HttpClient,
}

impl HttpTransport {
    pub fn new(client: HttpClient) -> Self {
        HttpTransport { client }
    }
}

impl Transport for HttpTransport {
    fn exchange(&mut self, ctx: &mut TransactionContext, request: &PkiMessage) -> Result<PkiMessage> {
        let bytes = encode_message(request)?;
        let response = self.client.post(&bytes, ctx.exchange_timeout()?)?;
        decode_message(&response)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// In-process mock server, no serialization involved
pub struct MockTransport {
    server: MockServer,
}

impl MockTransport {
    pub fn new(server: MockServer) -> Self {
        MockTransport { server }
    }
}

impl Transport for MockTransport {
    fn exchange(&mut self, _ctx: &mut TransactionContext, request: &PkiMessage) -> Result<PkiMessage> {
        self.server.process(request)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Ordered list of file names consumed one per exchange
#[derive(Debug, Clone)]
pub struct FileList {
    desc: &'static str,
    files: Vec<String>,
    next: usize,
}

impl FileList {
    pub fn parse(list: &str, desc: &'static str) -> Self {
        FileList {
            desc,
            files: split_list(list),
            next: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.files.len() - self.next
    }

    fn take(&mut self) -> Result<&str> {
        let idx = self.next;
        let file = self.files.get(idx).ok_or_else(|| {
            CmpError::Transport(format!(
                "not enough file names provided for reading/writing {}",
                self.desc
            ))
        })?;
        self.next += 1;
        Ok(file)
    }

    /// Read and decode the next file
    pub fn read_next(&mut self) -> Result<PkiMessage> {
        let desc = self.desc;
        let path = self.take()?;
        let bytes = fs::read(path)
            .map_err(|e| CmpError::Transport(format!("cannot read {} from '{}': {}", desc, path, e)))?;
        let msg = decode_message(&bytes)
            .map_err(|e| CmpError::Decode(format!("{} in '{}': {}", desc, path, e)))?;
        log::info!("{} read from '{}'", desc, path);
        Ok(msg)
    }

    /// Encode and write a message to the next file
    pub fn write_next(&mut self, msg: &PkiMessage) -> Result<()> {
        let desc = self.desc;
        let path = self.take()?;
        fs::write(path, encode_message(msg)?).map_err(|e| CmpError::io(path, e))?;
        log::info!("{} written to '{}'", desc, path);
        Ok(())
    }
}

/// File-based capture and replay around an optional inner transport
pub struct ReplayTransport {
    inner: Option<Box<dyn Transport>>,
    reqout: Option<FileList>,
    reqin: Option<FileList>,
    reqin_new_tid: bool,
    rspin: Option<FileList>,
    rspout: Option<FileList>,
    reprotect: Option<Arc<Protector>>,
}

impl ReplayTransport {
    pub fn new(inner: Option<Box<dyn Transport>>) -> Self {
        ReplayTransport {
            inner,
            reqout: None,
            reqin: None,
            reqin_new_tid: false,
            rspin: None,
            rspout: None,
            reprotect: None,
        }
    }

    pub fn with_reqout(mut self, list: Option<&str>) -> Self {
        self.reqout = list.map(|l| FileList::parse(l, "request message"));
        self
    }

    pub fn with_reqin(mut self, list: Option<&str>) -> Self {
        self.reqin = list.map(|l| FileList::parse(l, "request message"));
        self
    }

    /// Give replayed requests a fresh transaction ID, then protect them with `protector`
    pub fn with_reqin_new_tid(mut self, new_tid: bool, protector: Option<Arc<Protector>>) -> Self {
        self.reqin_new_tid = new_tid;
        self.reprotect = protector;
        self
    }

    pub fn with_rspin(mut self, list: Option<&str>) -> Self {
        self.rspin = list.map(|l| FileList::parse(l, "response message"));
        self
    }

    pub fn with_rspout(mut self, list: Option<&str>) -> Self {
        self.rspout = list.map(|l| FileList::parse(l, "response message"));
        self
    }

    fn replayed_request(&self, ctx: &mut TransactionContext, mut msg: PkiMessage) -> Result<PkiMessage> {
        if self.reqin_new_tid {
            let tid = random_bytes(TRANSACTION_ID_LEN)?;
            msg.header.transaction_id = tid.clone();
            ctx.state.transaction_id = Some(tid);
            msg.extra_certs.clear();
            msg.protection = None;
            msg.protection_alg = None;
            if let Some(protector) = &self.reprotect {
                protector.protect(&mut msg)?;
            }
        }
        Ok(msg)
    }
}

impl Transport for ReplayTransport {
    fn exchange(&mut self, ctx: &mut TransactionContext, request: &PkiMessage) -> Result<PkiMessage> {
        if let Some(list) = self.reqout.as_mut() {
            list.write_next(request)?;
        }

        let mut replayed = false;
        let response = match self.rspin.as_mut() {
            Some(list) => {
                replayed = true;
                list.read_next()?
            }
            _ => {
                let outgoing = match self.reqin.as_mut() {
                    Some(list) => {
                        replayed = true;
                        let msg = list.read_next()?;
                        self.replayed_request(ctx, msg)?
                    }
                    None => request.clone(),
                };
                let inner = self.inner.as_mut().ok_or_else(|| {
                    CmpError::Transport("no server to send the request to".to_string())
                })?;
                inner.exchange(ctx, &outgoing)?
            }
        };

        if replayed {
            ctx.state.adopt_response_header(&response.header);
        }

        if let Some(list) = self.rspout.as_mut() {
            list.write_next(&response)?;
        }
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// How exchanges are carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Live,
    MockInProcess,
    FileReplay,
}

impl TransportMode {
    pub fn of(config: &AppConfig) -> Self {
        let run = &config.run;
        if run.reqin.is_some() || run.reqout.is_some() || run.rspin.is_some() || run.rspout.is_some() {
            TransportMode::FileReplay
        } else if run.use_mock_srv {
            TransportMode::MockInProcess
        } else {
            TransportMode::Live
        }
    }
}

/// Assemble the transport for the configured mode
///
/// # Arguments
/// * `config` - The frozen configuration
/// * `mock` - Mock server, used with `use_mock_srv`
/// * `http` - HTTP client, used with `server`
/// * `reprotect` - Protection for requests replayed with a fresh transaction ID
pub fn select_transport(
    config: &AppConfig,
    mock: Option<MockServer>,
    http: Option<HttpClient>,
    reprotect: Option<Arc<Protector>>,
) -> Result<Box<dyn Transport>> {
    let run = &config.run;
    let inner: Option<Box<dyn Transport>> = match (mock, http) {
        (Some(server), _) => Some(Box::new(MockTransport::new(server))),
        (None, Some(client)) => Some(Box::new(HttpTransport::new(client))),
        (None, None) => None,
    };
    if run.reqin_new_tid && run.reqin.is_none() {
        log::warn!("-reqin_new_tid is ignored since -reqin is not given");
    }
    if run.reqin.is_some() && run.rspin.is_some() {
        log::warn!("-reqin is ignored since -rspin is present");
    }
    match TransportMode::of(config) {
        TransportMode::FileReplay => {
            if inner.is_none() && run.rspin.is_none() {
                return Err(CmpError::ProtocolConfig(
                    "missing -server or -use_mock_srv option, or too few -rspin filename arguments".to_string(),
                ));
            }
            Ok(Box::new(
                ReplayTransport::new(inner)
                    .with_reqout(run.reqout.as_deref())
                    .with_reqin(run.reqin.as_deref())
                    .with_reqin_new_tid(run.reqin_new_tid, reprotect)
                    .with_rspin(run.rspin.as_deref())
                    .with_rspout(run.rspout.as_deref()),
            ))
        }
        _ => inner.ok_or_else(|| {
            CmpError::ProtocolConfig("missing -server or -use_mock_srv option".to_string())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_server::tests::{mock_with, SECRET};
    use crate::mock_server::MockServerConfig;
    use crate::passphrase::Passphrase;
    use crate::protocol::{PkiBody, PkiHeader};
    use tempfile::TempDir;

    fn genm(ctx: &mut TransactionContext) -> PkiMessage {
        let header = PkiHeader {
            sender: "/CN=client".into(),
            recipient: String::new(),
            sender_kid: Some(b"ref".to_vec()),
            transaction_id: ctx.state.ensure_transaction_id().unwrap(),
            sender_nonce: ctx.state.fresh_sender_nonce().unwrap(),
            recip_nonce: None,
            message_time: 0,
            implicit_confirm: false,
            general_info: Vec::new(),
        };
        let mut msg = PkiMessage::new(header, PkiBody::Genm { itavs: Vec::new() });
        client_protector().protect(&mut msg).unwrap();
        msg
    }

    fn client_protector() -> Protector {
        Protector::mac(Passphrase::new(SECRET), Some("ref"), "/CN=client", "hmac-sha256").unwrap()
    }

    fn paths(dir: &TempDir, names: &[&str]) -> String {
        names
            .iter()
            .map(|n| dir.path().join(n).display().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    #[test]
    fn test_timeout_bounds() {
        let mut ctx = TransactionContext::new(Some(Duration::from_secs(120)), Some(Duration::from_secs(5)));
        ctx.start();
        let t = ctx.exchange_timeout().unwrap().unwrap();
        assert!(t <= Duration::from_secs(5));

        let ctx = TransactionContext::new(Some(Duration::from_secs(7)), None);
        assert_eq!(ctx.exchange_timeout().unwrap(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_capture_then_replay_adopts_response_header() {
        let dir = TempDir::new().unwrap();
        let reqs = paths(&dir, &["req1.der"]);
        let rsps = paths(&dir, &["rsp1.der"]);

        let mut capture = ReplayTransport::new(Some(Box::new(MockTransport::new(mock_with(MockServerConfig::default())))))
            .with_reqout(Some(&reqs))
            .with_rspout(Some(&rsps));
        let mut ctx = TransactionContext::default();
        let request = genm(&mut ctx);
        let captured = capture.exchange(&mut ctx, &request).unwrap();
        assert!(dir.path().join("req1.der").exists());

        let mut replay = ReplayTransport::new(None).with_rspin(Some(&rsps));
        let mut fresh = TransactionContext::default();
        let request = genm(&mut fresh);
        let before = fresh.state.clone();
        let response = replay.exchange(&mut fresh, &request).unwrap();
        assert_eq!(response, captured);
        assert_ne!(fresh.state, before);
        assert_eq!(fresh.state.transaction_id.as_ref(), Some(&response.header.transaction_id));
        assert_eq!(fresh.state.sender_nonce, response.header.recip_nonce);
        assert_eq!(fresh.state.recip_nonce.as_ref(), Some(&response.header.sender_nonce));
    }

    #[test]
    fn test_exhausted_list_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut ctx = TransactionContext::default();
        let request = genm(&mut ctx);

        let mut replay = ReplayTransport::new(None).with_rspin(Some(&paths(&dir, &["missing.der"])));
        assert!(matches!(replay.exchange(&mut ctx, &request), Err(CmpError::Transport(_))));
        assert!(matches!(replay.exchange(&mut ctx, &request), Err(CmpError::Transport(_))));
    }

    #[test]
    fn test_malformed_capture_is_decode_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.der"), b"not a message").unwrap();
        let mut ctx = TransactionContext::default();
        let request = genm(&mut ctx);
        let mut replay = ReplayTransport::new(None).with_rspin(Some(&paths(&dir, &["bad.der"])));
        assert!(matches!(replay.exchange(&mut ctx, &request), Err(CmpError::Decode(_))));
    }

    #[test]
    fn test_reqin_with_new_transaction_id() {
        let dir = TempDir::new().unwrap();
        let reqs = paths(&dir, &["req1.der"]);
        let mut first_ctx = TransactionContext::default();
        let original = genm(&mut first_ctx);
        FileList::parse(&reqs, "request message").write_next(&original).unwrap();

        let mut replay = ReplayTransport::new(Some(Box::new(MockTransport::new(mock_with(MockServerConfig::default())))))
            .with_reqin(Some(&reqs))
            .with_reqin_new_tid(true, Some(Arc::new(client_protector())));
        let mut ctx = TransactionContext::default();
        let request = genm(&mut ctx);
        let response = replay.exchange(&mut ctx, &request).unwrap();
        assert!(matches!(response.body, PkiBody::Genp { .. }));
        assert_ne!(response.header.transaction_id, original.header.transaction_id);
        assert_eq!(ctx.state.transaction_id.as_ref(), Some(&response.header.transaction_id));
        assert_eq!(ctx.state.sender_nonce.as_ref(), Some(&original.header.sender_nonce));
    }

    #[test]
    fn test_select_transport_modes() {
        let mut config = AppConfig::default();
        assert!(select_transport(&config, None, None, None).is_err());

        config.run.use_mock_srv = true;
        assert_eq!(TransportMode::of(&config), TransportMode::MockInProcess);
        let t = select_transport(&config, Some(mock_with(MockServerConfig::default())), None, None).unwrap();
        assert_eq!(t.name(), "mock");

        config.run.use_mock_srv = false;
        config.run.rspin = Some("a.der".into());
        assert_eq!(TransportMode::of(&config), TransportMode::FileReplay);
        let t = select_transport(&config, None, None, None).unwrap();
        assert_eq!(t.name(), "file");
    }
}
