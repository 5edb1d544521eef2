//! Scoped secret holder for passphrases and shared secrets
//!
//! Passphrases reach the client through option values (`pass:`, `env:`,
//! `file:`, `stdin`) or an interactive prompt. Both the configured source
//! string and the resolved passphrase are kept inside `secrecy` wrappers so
//! that:
//! - they never show up in `Debug` output of the configuration
//! - the memory is zeroed when the holder is dropped, on every exit path
//! - access requires an explicit `expose()` call at the point of use

use crate::error::{CmpError, Result};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::io::BufRead;

/// A resolved passphrase
pub struct Passphrase {
    secret: SecretString,
}

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            secret: SecretString::from(value.into()),
        }
    }

    pub fn empty() -> Self {
        Self::new(String::new())
    }

    /// Borrow the passphrase for the duration of one operation
    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.expose().as_bytes()
    }
}

impl Clone for Passphrase {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_string())
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passphrase")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A passphrase source as given in an option value
///
/// Supported forms:
/// * `pass:<text>` - the passphrase itself
/// * `env:<var>` - read from an environment variable
/// * `file:<path>` - first line of a file
/// * `stdin` - first line of standard input
pub struct SecretSource {
    spec: SecretString,
}

impl SecretSource {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: SecretString::from(spec.into()),
        }
    }

    /// Resolve the source into the passphrase it designates
    ///
    /// # Arguments
    /// * `desc` - What the passphrase is for, used in error messages
    pub fn resolve(&self, desc: &str) -> Result<Passphrase> {
        let spec = self.spec.expose_secret();
        if let Some(text) = spec.strip_prefix("pass:") {
            return Ok(Passphrase::new(text));
        }
        if let Some(var) = spec.strip_prefix("env:") {
            let value = std::env::var(var).map_err(|_| {
                CmpError::ProtocolConfig(format!(
                    "environment variable '{}' for {} is not set",
                    var, desc
                ))
            })?;
            return Ok(Passphrase::new(value));
        }
        if let Some(path) = spec.strip_prefix("file:") {
            let file = std::fs::File::open(path).map_err(|e| CmpError::io(path, e))?;
            return first_line(std::io::BufReader::new(file), path);
        }
        if spec == "stdin" {
            return first_line(std::io::stdin().lock(), "<stdin>");
        }
        Err(CmpError::ProtocolConfig(format!(
            "invalid passphrase source for {}; use pass:, env:, file: or stdin",
            desc
        )))
    }
}

impl Clone for SecretSource {
    fn clone(&self) -> Self {
        Self::new(self.spec.expose_secret().to_string())
    }
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretSource(<redacted>)")
    }
}

/// First line of `reader`; `origin` names the file or stream in errors
fn first_line(mut reader: impl BufRead, origin: &str) -> Result<Passphrase> {
    let mut line = String::new();
    reader.read_line(&mut line).map_err(|e| CmpError::io(origin, e))?;
    let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
    secrecy::zeroize::Zeroize::zeroize(&mut line);
    Ok(Passphrase::new(trimmed))
}

/// Obtain a passphrase from its configured source or, failing that, by prompting
///
/// In batch mode no prompt is shown and a missing source is an error.
pub fn obtain(source: Option<&SecretSource>, desc: &str, batch: bool) -> Result<Passphrase> {
    if let Some(source) = source {
        return source.resolve(desc);
    }
    if batch {
        return Err(CmpError::CredentialMismatch(format!(
            "no passphrase given for {} and prompting is disabled in batch mode",
            desc
        )));
    }
    let value = rpassword::prompt_password(format!("Enter passphrase for {}: ", desc))
        .map_err(|e| CmpError::io("<terminal>", e))?;
    Ok(Passphrase::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_debug_no_leak() {
        let pass = Passphrase::new("hunter2");
        let source = SecretSource::new("pass:hunter2");
        let debug_str = format!("{:?} {:?}", pass, source);
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("redacted"));
    }

    #[test]
    fn test_resolve_sources() {
        assert_eq!(
            SecretSource::new("pass:abc").resolve("test").unwrap().expose(),
            "abc"
        );

        std::env::set_var("PKI_CMP_TEST_SECRET", "from-env");
        assert_eq!(
            SecretSource::new("env:PKI_CMP_TEST_SECRET")
                .resolve("test")
                .unwrap()
                .expose(),
            "from-env"
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        writeln!(file, "second line").unwrap();
        let spec = format!("file:{}", file.path().display());
        assert_eq!(
            SecretSource::new(spec).resolve("test").unwrap().expose(),
            "from-file"
        );
    }

    #[test]
    fn test_unreadable_file_is_io_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xff, 0xfe, b'\n']).unwrap();
        let spec = format!("file:{}", file.path().display());
        match SecretSource::new(spec).resolve("test") {
            Err(CmpError::Io { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("unexpected result {:?}", other.map(|p| p.expose().len())),
        }

        let missing = "file:/nonexistent/pki-cmp/secret.txt";
        assert!(matches!(SecretSource::new(missing).resolve("test"), Err(CmpError::Io { .. })));
    }

    #[test]
    fn test_invalid_source_and_batch() {
        assert!(matches!(
            SecretSource::new("abc").resolve("test"),
            Err(CmpError::ProtocolConfig(_))
        ));
        assert!(matches!(
            SecretSource::new("env:PKI_CMP_TEST_UNSET_VARIABLE").resolve("test"),
            Err(CmpError::ProtocolConfig(_))
        ));
        assert!(matches!(
            obtain(None, "test key", true),
            Err(CmpError::CredentialMismatch(_))
        ));
    }
}
