//! Protocol Module
//!
//! Defines the CMP message model exchanged between client and responder:
//! header (transaction ID, nonces, sender/recipient), body (requested
//! operation and payload) and protection, together with the PKIStatus and
//! failure-info vocabulary and the [`TransactionState`] carried across the
//! round trips of one transaction.
//!
//! Messages are serialized as length-prefixed JSON:
//!
//! ```text
//! [Length (4 bytes, u32 LE)][JSON-encoded PkiMessage]
//! ```
//!
//! Certificates, keys and CSRs travel as DER byte strings inside the message.

use crate::error::{CmpError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of freshly generated transaction IDs (128 bits)
pub const TRANSACTION_ID_LEN: usize = 16;
/// Length of freshly generated nonces (128 bits)
pub const NONCE_LEN: usize = 16;
/// Size of the length prefix in the serialized format
pub const LENGTH_PREFIX_SIZE: usize = 4;
/// Highest defined PKIFailureInfo bit index
pub const FAILURE_INFO_MAX: u32 = 26;
/// All defined PKIFailureInfo bits set
pub const FAILURE_INFO_MAX_BIT_PATTERN: u32 = (1 << (FAILURE_INFO_MAX + 1)) - 1;

/// PKIFailureInfo bit indices
pub mod failure {
    pub const BAD_ALG: u32 = 0;
    pub const BAD_MESSAGE_CHECK: u32 = 1;
    pub const BAD_REQUEST: u32 = 2;
    pub const BAD_TIME: u32 = 3;
    pub const BAD_CERT_ID: u32 = 4;
    pub const BAD_DATA_FORMAT: u32 = 5;
    pub const WRONG_AUTHORITY: u32 = 6;
    pub const INCORRECT_DATA: u32 = 7;
    pub const MISSING_TIME_STAMP: u32 = 8;
    pub const BAD_POP: u32 = 9;
    pub const CERT_REVOKED: u32 = 10;
    pub const CERT_CONFIRMED: u32 = 11;
    pub const WRONG_INTEGRITY: u32 = 12;
    pub const BAD_RECIPIENT_NONCE: u32 = 13;
    pub const TIME_NOT_AVAILABLE: u32 = 14;
    pub const UNACCEPTED_POLICY: u32 = 15;
    pub const UNACCEPTED_EXTENSION: u32 = 16;
    pub const ADD_INFO_NOT_AVAILABLE: u32 = 17;
    pub const BAD_SENDER_NONCE: u32 = 18;
    pub const BAD_CERT_TEMPLATE: u32 = 19;
    pub const SIGNER_NOT_TRUSTED: u32 = 20;
    pub const TRANSACTION_ID_IN_USE: u32 = 21;
    pub const UNSUPPORTED_VERSION: u32 = 22;
    pub const NOT_AUTHORIZED: u32 = 23;
    pub const SYSTEM_UNAVAIL: u32 = 24;
    pub const SYSTEM_FAILURE: u32 = 25;
    pub const DUPLICATE_CERT_REQ: u32 = 26;
}

const FAILURE_INFO_NAMES: [&str; (FAILURE_INFO_MAX + 1) as usize] = [
    "badAlg",
    "badMessageCheck",
    "badRequest",
    "badTime",
    "badCertId",
    "badDataFormat",
    "wrongAuthority",
    "incorrectData",
    "missingTimeStamp",
    "badPOP",
    "certRevoked",
    "certConfirmed",
    "wrongIntegrity",
    "badRecipientNonce",
    "timeNotAvailable",
    "unacceptedPolicy",
    "unacceptedExtension",
    "addInfoNotAvailable",
    "badSenderNonce",
    "badCertTemplate",
    "signerNotTrusted",
    "transactionIdInUse",
    "unsupportedVersion",
    "notAuthorized",
    "systemUnavail",
    "systemFailure",
    "duplicateCertReq",
];

/// PKIStatus values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkiStatus {
    Accepted,
    GrantedWithMods,
    Rejection,
    Waiting,
    RevocationWarning,
    RevocationNotification,
    KeyUpdateWarning,
}

impl PkiStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(PkiStatus::Accepted),
            1 => Some(PkiStatus::GrantedWithMods),
            2 => Some(PkiStatus::Rejection),
            3 => Some(PkiStatus::Waiting),
            4 => Some(PkiStatus::RevocationWarning),
            5 => Some(PkiStatus::RevocationNotification),
            6 => Some(PkiStatus::KeyUpdateWarning),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            PkiStatus::Accepted => 0,
            PkiStatus::GrantedWithMods => 1,
            PkiStatus::Rejection => 2,
            PkiStatus::Waiting => 3,
            PkiStatus::RevocationWarning => 4,
            PkiStatus::RevocationNotification => 5,
            PkiStatus::KeyUpdateWarning => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PkiStatus::Accepted => "accepted",
            PkiStatus::GrantedWithMods => "grantedWithMods",
            PkiStatus::Rejection => "rejection",
            PkiStatus::Waiting => "waiting",
            PkiStatus::RevocationWarning => "revocationWarning",
            PkiStatus::RevocationNotification => "revocationNotification",
            PkiStatus::KeyUpdateWarning => "keyUpdateWarning",
        }
    }

    /// Accepted or granted with modifications
    pub fn is_positive(self) -> bool {
        matches!(self, PkiStatus::Accepted | PkiStatus::GrantedWithMods)
    }
}

/// PKIStatusInfo: status, failure bits and optional free text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiStatusInfo {
    pub status: PkiStatus,
    pub failure_bits: u32,
    pub status_string: Option<String>,
}

impl PkiStatusInfo {
    pub fn new(status: PkiStatus, failure_bits: u32, status_string: Option<String>) -> Self {
        Self {
            status,
            failure_bits,
            status_string,
        }
    }

    pub fn accepted() -> Self {
        Self::new(PkiStatus::Accepted, 0, None)
    }

    pub fn waiting() -> Self {
        Self::new(PkiStatus::Waiting, 0, None)
    }

    /// Rejection with exactly one failure bit set
    pub fn rejection(failure_bit: u32, text: impl Into<String>) -> Self {
        Self::new(PkiStatus::Rejection, 1 << failure_bit, Some(text.into()))
    }

    pub fn has_failure(&self, bit: u32) -> bool {
        bit <= FAILURE_INFO_MAX && self.failure_bits & (1 << bit) != 0
    }

    pub fn failure_names(&self) -> Vec<&'static str> {
        (0..=FAILURE_INFO_MAX)
            .filter(|bit| self.has_failure(*bit))
            .map(|bit| FAILURE_INFO_NAMES[bit as usize])
            .collect()
    }
}

impl fmt::Display for PkiStatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PKIStatus: {}", self.status.name())?;
        let names = self.failure_names();
        if !names.is_empty() {
            write!(f, "; PKIFailureInfo: {}", names.join(", "))?;
        }
        if let Some(text) = &self.status_string {
            write!(f, "; StatusString: \"{}\"", text)?;
        }
        Ok(())
    }
}

/// InfoTypeAndValue as used in generalInfo, genm and genp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoTypeAndValue {
    pub info_type: String,
    pub value: Option<i64>,
}

/// Message header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PkiHeader {
    /// Sender DN in `/CN=.../O=...` form, empty for NULL-DN
    pub sender: String,
    pub recipient: String,
    pub sender_kid: Option<Vec<u8>>,
    pub transaction_id: Vec<u8>,
    pub sender_nonce: Vec<u8>,
    pub recip_nonce: Option<Vec<u8>>,
    /// Seconds since the Unix epoch
    pub message_time: i64,
    pub implicit_confirm: bool,
    pub general_info: Vec<InfoTypeAndValue>,
}

/// Extension given as configuration strings (`name = value`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionValue {
    pub name: String,
    pub value: String,
    pub critical: bool,
}

/// Issuer and serial number identifying an existing certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertId {
    pub issuer: String,
    pub serial: String,
}

/// Certificate template of a CRMF request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertTemplate {
    pub subject: Option<String>,
    pub issuer: Option<String>,
    /// SubjectPublicKeyInfo, DER
    pub public_key: Option<Vec<u8>>,
    pub validity_days: Option<u32>,
    /// General names as `DNS:name`, `IP:addr` or `URI:uri`
    pub sans: Vec<String>,
    pub sans_critical: bool,
    pub extensions: Vec<ExtensionValue>,
    pub policies: Vec<String>,
    pub policies_critical: bool,
    /// Certificate being updated (kur)
    pub old_cert_id: Option<CertId>,
}

/// Proof-of-possession of the private key matching the template's public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofOfPossession {
    RaVerified,
    Signature { digest: String, value: Vec<u8> },
    KeyEncipherment,
    KeyAgreement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertRequest {
    pub cert_req_id: i64,
    pub template: CertTemplate,
    pub popo: Option<ProofOfPossession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertResponse {
    pub cert_req_id: i64,
    pub status: PkiStatusInfo,
    /// Issued certificate, DER
    pub certificate: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertRepMessage {
    pub ca_pubs: Vec<Vec<u8>>,
    pub responses: Vec<CertResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertStatus {
    pub cert_hash: Vec<u8>,
    pub cert_req_id: i64,
    pub status: Option<PkiStatusInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevDetails {
    pub cert_id: CertId,
    /// CRL reason code, absent for "none"
    pub reason: Option<i32>,
}

/// Message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PkiBody {
    Ir(CertRequest),
    Cr(CertRequest),
    Kur(CertRequest),
    P10cr { csr: Vec<u8> },
    Ip(CertRepMessage),
    Cp(CertRepMessage),
    Kup(CertRepMessage),
    PollReq { cert_req_id: i64 },
    PollRep { cert_req_id: i64, check_after: u64 },
    CertConf { statuses: Vec<CertStatus> },
    PkiConf,
    Rr(RevDetails),
    Rp { status: PkiStatusInfo },
    Genm { itavs: Vec<InfoTypeAndValue> },
    Genp { itavs: Vec<InfoTypeAndValue> },
    Error {
        status: PkiStatusInfo,
        details: Option<String>,
    },
}

impl PkiBody {
    pub fn name(&self) -> &'static str {
        match self {
            PkiBody::Ir(_) => "ir",
            PkiBody::Cr(_) => "cr",
            PkiBody::Kur(_) => "kur",
            PkiBody::P10cr { .. } => "p10cr",
            PkiBody::Ip(_) => "ip",
            PkiBody::Cp(_) => "cp",
            PkiBody::Kup(_) => "kup",
            PkiBody::PollReq { .. } => "pollReq",
            PkiBody::PollRep { .. } => "pollRep",
            PkiBody::CertConf { .. } => "certConf",
            PkiBody::PkiConf => "pkiConf",
            PkiBody::Rr(_) => "rr",
            PkiBody::Rp { .. } => "rp",
            PkiBody::Genm { .. } => "genm",
            PkiBody::Genp { .. } => "genp",
            PkiBody::Error { .. } => "error",
        }
    }

    /// Bodies that open a new transaction
    pub fn starts_transaction(&self) -> bool {
        matches!(
            self,
            PkiBody::Ir(_)
                | PkiBody::Cr(_)
                | PkiBody::Kur(_)
                | PkiBody::P10cr { .. }
                | PkiBody::Rr(_)
                | PkiBody::Genm { .. }
        )
    }
}

/// Protection algorithm, part of the protected header data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionAlg {
    PasswordBasedMac {
        salt: Vec<u8>,
        iterations: u32,
        owf: String,
        mac: String,
    },
    Signature {
        digest: String,
    },
}

/// A complete protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PkiMessage {
    pub header: PkiHeader,
    pub body: PkiBody,
    pub protection_alg: Option<ProtectionAlg>,
    pub protection: Option<Vec<u8>>,
    /// Extra certificates, DER; for signature protection the first one is the signer's
    pub extra_certs: Vec<Vec<u8>>,
}

impl PkiMessage {
    pub fn new(header: PkiHeader, body: PkiBody) -> Self {
        Self {
            header,
            body,
            protection_alg: None,
            protection: None,
            extra_certs: Vec::new(),
        }
    }

    pub fn is_protected(&self) -> bool {
        self.protection_alg.is_some() && self.protection.is_some()
    }

    /// Bytes covered by the protection: header, body and protection algorithm
    pub fn protected_part(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&(&self.header, &self.body, &self.protection_alg))
            .map_err(|e| CmpError::Decode(format!("cannot serialize protected part: {}", e)))
    }

    /// Error bodies and negative responses, which may be accepted unprotected
    pub fn is_negative(&self) -> bool {
        match &self.body {
            PkiBody::Error { .. } => true,
            PkiBody::Rp { status } => status.status == PkiStatus::Rejection,
            PkiBody::Ip(rep) | PkiBody::Cp(rep) | PkiBody::Kup(rep) => rep
                .responses
                .iter()
                .any(|r| r.status.status == PkiStatus::Rejection),
            _ => false,
        }
    }
}

/// Transaction ID and nonce chain of the active transaction
///
/// `sender_nonce` is the nonce of the last message sent by this side;
/// `recip_nonce` is the peer's last sender nonce, echoed in the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionState {
    pub transaction_id: Option<Vec<u8>>,
    pub sender_nonce: Option<Vec<u8>>,
    pub recip_nonce: Option<Vec<u8>>,
}

impl TransactionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything so the next request starts a fresh transaction
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Current transaction ID, generated on first use
    pub fn ensure_transaction_id(&mut self) -> Result<Vec<u8>> {
        if let Some(tid) = &self.transaction_id {
            return Ok(tid.clone());
        }
        let tid = random_bytes(TRANSACTION_ID_LEN)?;
        self.transaction_id = Some(tid.clone());
        Ok(tid)
    }

    /// Generate and remember the sender nonce for the next outgoing message
    pub fn fresh_sender_nonce(&mut self) -> Result<Vec<u8>> {
        let nonce = random_bytes(NONCE_LEN)?;
        self.sender_nonce = Some(nonce.clone());
        Ok(nonce)
    }

    /// Record the peer's nonce after a response passed all checks
    pub fn record_peer_nonce(&mut self, header: &PkiHeader) {
        self.recip_nonce = Some(header.sender_nonce.clone());
    }

    /// Overwrite transaction ID and nonces from the header of a response that
    /// was not produced from this state's nonce chain (replayed material)
    pub fn adopt_response_header(&mut self, header: &PkiHeader) {
        self.transaction_id = Some(header.transaction_id.clone());
        self.sender_nonce = header.recip_nonce.clone();
        self.recip_nonce = Some(header.sender_nonce.clone());
    }
}

/// SHA-256 hash of a DER certificate, as placed in certConf
pub fn cert_hash(cert_der: &[u8]) -> Result<Vec<u8>> {
    openssl::hash::hash(openssl::hash::MessageDigest::sha256(), cert_der)
        .map(|d| d.to_vec())
        .map_err(|e| CmpError::Format(format!("cannot hash certificate: {}", e)))
}

/// Bytes signed for signature-based proof-of-possession
pub fn popo_input(template: &CertTemplate) -> Result<Vec<u8>> {
    serde_json::to_vec(template)
        .map_err(|e| CmpError::Decode(format!("cannot serialize certificate template: {}", e)))
}

pub(crate) fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_bytes(&mut buf)
        .map_err(|e| CmpError::Transport(format!("random number generation failed: {}", e)))?;
    Ok(buf)
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Serialize a PkiMessage to a length-prefixed byte array
///
/// # Example
/// ```no_run
/// # use pki_cmp::protocol::{encode_message, PkiMessage};
/// # fn example(msg: &PkiMessage) -> pki_cmp::Result<()> {
/// let bytes = encode_message(msg)?;
/// // bytes = [4-byte length] + [JSON data]
/// # Ok(())
/// # }
/// ```
pub fn encode_message(msg: &PkiMessage) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)
        .map_err(|e| CmpError::Decode(format!("cannot serialize {} message: {}", msg.body.name(), e)))?;
    let length = u32::try_from(json.len())
        .map_err(|_| CmpError::Decode("message too large to encode".to_string()))?;

    let mut buffer = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buffer.extend_from_slice(&length.to_le_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Deserialize a length-prefixed byte array to a PkiMessage
pub fn decode_message(bytes: &[u8]) -> Result<PkiMessage> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(CmpError::Decode(format!(
            "message too short ({} bytes)",
            bytes.len()
        )));
    }
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    len_buf.copy_from_slice(&bytes[..LENGTH_PREFIX_SIZE]);
    let length = u32::from_le_bytes(len_buf) as usize;
    let payload = &bytes[LENGTH_PREFIX_SIZE..];
    if payload.len() != length {
        return Err(CmpError::Decode(format!(
            "length prefix says {} bytes but {} follow",
            length,
            payload.len()
        )));
    }
    serde_json::from_slice(payload)
        .map_err(|e| CmpError::Decode(format!("malformed protocol message: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_header() -> PkiHeader {
        PkiHeader {
            sender: "/CN=client".to_string(),
            recipient: "/CN=server".to_string(),
            sender_kid: None,
            transaction_id: vec![1; TRANSACTION_ID_LEN],
            sender_nonce: vec![2; NONCE_LEN],
            recip_nonce: None,
            message_time: 0,
            implicit_confirm: false,
            general_info: Vec::new(),
        }
    }

    #[test]
    fn test_encode_has_length_prefix() {
        let msg = PkiMessage::new(sample_header(), PkiBody::PkiConf);
        let bytes = encode_message(&msg).unwrap();
        let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(bytes.len(), length as usize + LENGTH_PREFIX_SIZE);
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_truncated_and_garbage() {
        assert!(matches!(decode_message(&[1, 0]), Err(CmpError::Decode(_))));
        let mut bytes = 5u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"hello");
        assert!(matches!(decode_message(&bytes), Err(CmpError::Decode(_))));
        let mut short = 10u32.to_le_bytes().to_vec();
        short.extend_from_slice(b"{}");
        assert!(matches!(decode_message(&short), Err(CmpError::Decode(_))));
    }

    #[test]
    fn test_status_display_lists_failure_names() {
        let info = PkiStatusInfo::new(PkiStatus::Rejection, 1 << 2 | 1 << 9, Some("no".into()));
        assert_eq!(info.failure_names(), vec!["badRequest", "badPOP"]);
        assert_eq!(
            info.to_string(),
            "PKIStatus: rejection; PKIFailureInfo: badRequest, badPOP; StatusString: \"no\""
        );
        assert_eq!(FAILURE_INFO_MAX_BIT_PATTERN, 0x07FF_FFFF);
    }

    #[test]
    fn test_adopt_response_header_overwrites_state() {
        let mut state = TransactionState::new();
        state.ensure_transaction_id().unwrap();
        state.fresh_sender_nonce().unwrap();

        let mut header = sample_header();
        header.recip_nonce = Some(vec![9; NONCE_LEN]);
        state.adopt_response_header(&header);

        assert_eq!(state.transaction_id.as_deref(), Some(&header.transaction_id[..]));
        assert_eq!(state.sender_nonce, header.recip_nonce);
        assert_eq!(state.recip_nonce.as_deref(), Some(&header.sender_nonce[..]));
    }

    #[test]
    fn test_reset_forgets_transaction() {
        let mut state = TransactionState::new();
        let tid = state.ensure_transaction_id().unwrap();
        assert_eq!(state.ensure_transaction_id().unwrap(), tid);
        state.reset();
        assert_eq!(state, TransactionState::default());
        assert_ne!(state.ensure_transaction_id().unwrap(), tid);
    }
}
