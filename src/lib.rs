//! PKI CMP - Certificate Management Protocol client and mock responder
//!
//! A CMP client that enrolls, updates and revokes certificates and queries
//! general information from a PKI, plus a configurable mock responder for
//! testing. Messages travel over HTTP(S), directly to an in-process mock
//! server, or through capture/replay files.
//!
//! # Overview
//!
//! ```text
//! AppConfig (defaults → config file → command line)
//!   ├── CredentialLoader   PEM / DER / PKCS#12 / http(s) with format fallback
//!   ├── TrustStore         isolated stores for CMP server, TLS, new certificates
//!   ├── Protector          MAC or signature protection of requests
//!   ├── MessageVerifier    transaction ID, nonces, sender and protection checks
//!   ├── RequestTemplate    ir / cr / kur / p10cr / rr / genm contents
//!   └── Transport          http | mock | file capture & replay
//!         └── CmpSessionExecutor → SessionOutcome → saved certificates
//! ```
//!
//! # Features
//!
//! - **Format auto-detection**: file extensions select the parser, with one
//!   retry in the complementary format for mislabelled files
//! - **Transaction continuity**: replayed messages rewrite the transaction ID
//!   and nonces of the running transaction so follow-up checks still hold
//! - **Mock PKI**: polling, implicit confirmation, forced errors and
//!   unprotected responses, all driven by configuration
//! - **Scoped secrets**: passphrases live in `secrecy` holders zeroed on drop
//!
//! # Quick Start
//!
//! ```bash
//! # Enroll against the in-process mock server
//! pki-cmp -cmd ir -use_mock_srv -ref 1234 -secret pass:1234 \
//!     -newkey new.key -subject /CN=test -certout new.pem \
//!     -srv_ref 1234 -srv_secret pass:1234 -rsp_cert issued.pem
//!
//! # Serve the mock responder on port 8080 for 10 messages
//! pki-cmp -port 8080 -max_msgs 10 -srv_ref 1234 -srv_secret pass:1234 -rsp_cert issued.pem
//! ```
//!
//! # As a Library
//!
//! ```no_run
//! use pki_cmp::client::CmpClient;
//! use pki_cmp::options::parse_args;
//! use std::sync::Arc;
//!
//! let args: Vec<String> = std::env::args().skip(1).collect();
//! let config = parse_args(&args)?;
//! let mut client = CmpClient::setup(Arc::new(config))?;
//! for outcome in client.run()? {
//!     println!("status: {}", outcome.status);
//! }
//! # Ok::<(), pki_cmp::error::CmpError>(())
//! ```
//!
//! # Module Overview
//!
//! ## [`configs`] and [`options`]
//!
//! One immutable [`configs::AppConfig`] built from defaults, a TOML config
//! file and the command line. Both sources go through the single option table
//! [`options::OPTIONS`].
//!
//! ## [`credentials`] and [`truststore`]
//!
//! Loading of keys, certificates, CSRs and certificate lists, saving of
//! received certificates, and atomic trust store construction with
//! per-store verification parameters.
//!
//! ## [`protection`]
//!
//! Outgoing MAC or signature protection and incoming message verification,
//! with the option consistency rules of the client.
//!
//! ## [`transport`], [`http_client`] and [`server`]
//!
//! The [`transport::Transport`] trait and its HTTP, mock and replay variants,
//! the blocking HTTP client, and the stand-alone responder served with axum.
//!
//! ## [`mock_server`]
//!
//! The deterministic mock PKI: enrollment with polling and confirmation,
//! revocation, general messages and failure injection.
//!
//! ## [`request`], [`session`] and [`client`]
//!
//! Request template configuration, the per-command message sequences, and
//! the orchestrator running transactions and saving their results.
//!
//! # Error Handling
//!
//! All library functions return [`error::Result`]. Setup errors
//! ([`error::CmpError::is_setup_error`]) abort before any message is sent;
//! transport and message check errors abort the current transaction and the
//! remaining repetitions.

pub mod client;
pub mod configs;
pub mod credentials;
pub mod error;
pub mod http_client;
pub mod mock_server;
pub mod options;
pub mod passphrase;
pub mod protection;
pub mod protocol;
pub mod request;
pub mod server;
pub mod session;
pub mod transport;
pub mod truststore;

#[cfg(test)]
mod pki_generator;

pub use client::CmpClient;
pub use configs::AppConfig;
pub use error::{CmpError, Result};
pub use protocol::{PkiMessage, PkiStatus, PkiStatusInfo};
