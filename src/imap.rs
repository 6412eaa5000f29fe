//! IMAP target client
//!
//! Talks IMAP4rev1 over TLS to the destination server: session setup,
//! hierarchy-separator discovery, folder creation, Message-ID search, and
//! APPEND. All connections are TLS with hostname verification against the
//! webpki root set; every command is bounded by the configured timeout.
//! `CREATE` tolerates `ALREADYEXISTS` and accepts a confirming `LIST` echo,
//! since either way the folder is there.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

/// Type alias for an authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Default hierarchy delimiter when the server reports none (Dovecot)
const DEFAULT_SEPARATOR: char = '.';

/// Client for one target IMAP server
///
/// Holds coordinates and timeouts; sessions are opened per folder work
/// unit and discarded on failure rather than reused. The separator is
/// discovered lazily and memoized for the client's lifetime.
pub struct ImapTarget {
    host: String,
    port: u16,
    command_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    separator: OnceLock<char>,
}

impl ImapTarget {
    pub fn new(
        host: &str,
        port: u16,
        command_timeout: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            host: host.to_owned(),
            port,
            command_timeout,
            max_retries,
            retry_delay,
            separator: OnceLock::new(),
        }
    }

    /// Connect and authenticate
    ///
    /// Performs the full sequence with timeouts: TCP connect, TLS handshake
    /// with hostname verification, IMAP greeting, `LOGIN`.
    ///
    /// # Errors
    ///
    /// - `Transport` for connect/handshake/greeting failures and timeouts
    /// - `AuthFailed` if the server rejects the credentials
    pub async fn connect(&self, user: &str, pass: &SecretString) -> AppResult<ImapSession> {
        let addr = (self.host.as_str(), self.port);
        debug!("connecting to imaps://{}:{}", self.host, self.port);

        let tcp = timeout(self.command_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AppError::transport("tcp connect timed out"))
            .and_then(|r| r.map_err(|e| AppError::transport(format!("tcp connect failed: {e}"))))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| AppError::ConfigInvalid("invalid IMAP host for TLS SNI".to_owned()))?;
        let tls_stream = timeout(self.command_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| AppError::transport("TLS handshake timed out"))
            .and_then(|r| r.map_err(|e| AppError::transport(format!("TLS handshake failed: {e}"))))?;

        let mut client = Client::new(tls_stream);
        let greeting = timeout(self.command_timeout, client.read_response())
            .await
            .map_err(|_| AppError::transport("IMAP greeting timed out"))
            .and_then(|r| r.map_err(|e| AppError::transport(format!("IMAP greeting failed: {e}"))))?;
        if greeting.is_none() {
            return Err(AppError::transport(
                "IMAP server closed connection before greeting",
            ));
        }

        let session = timeout(
            self.command_timeout,
            client.login(user, pass.expose_secret()),
        )
        .await
        .map_err(|_| AppError::transport("IMAP login timed out"))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if is_auth_error(&msg) {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::transport(msg)
                }
            })
        })?;

        Ok(session)
    }

    /// Issue `LOGOUT` and drop the session; failures are only logged
    pub async fn logout(&self, mut session: ImapSession) {
        if timeout(self.command_timeout, session.logout()).await.is_err() {
            warn!("LOGOUT timed out; dropping session");
        }
    }

    /// Hierarchy delimiter of the server, discovered via `LIST "" ""`
    ///
    /// Memoized after the first discovery. Defaults to `.` when the server
    /// reports no delimiter.
    pub async fn separator(&self, session: &mut ImapSession) -> AppResult<char> {
        if let Some(sep) = self.separator.get() {
            return Ok(*sep);
        }
        let names = self.list(session, Some(""), Some("")).await?;
        let sep = names
            .iter()
            .find_map(|name| name.delimiter().and_then(|d| d.chars().next()))
            .unwrap_or(DEFAULT_SEPARATOR);
        debug!("server hierarchy separator is '{sep}'");
        let _ = self.separator.set(sep);
        Ok(sep)
    }

    /// All folder paths visible on the server (`LIST "" "*"`)
    pub async fn list_folders(&self, session: &mut ImapSession) -> AppResult<Vec<String>> {
        let names = self.list(session, Some(""), Some("*")).await?;
        Ok(names.iter().map(|n| n.name().to_owned()).collect())
    }

    /// Whether the exact server path exists (`LIST` echo)
    pub async fn folder_exists(&self, session: &mut ImapSession, path: &str) -> AppResult<bool> {
        let names = self.list(session, Some(""), Some(path)).await?;
        Ok(names.iter().any(|n| n.name() == path))
    }

    /// Create the folder for a logical path, parents first
    ///
    /// Translates `/` in the logical path to the server separator and
    /// issues `CREATE` for every ancestor. Returns the server-side path.
    ///
    /// # Errors
    ///
    /// `Transport` once the retry budget for a `CREATE` is exhausted.
    pub async fn ensure_folder(
        &self,
        session: &mut ImapSession,
        logical: &str,
    ) -> AppResult<String> {
        let sep = self.separator(session).await?;
        let full = server_path(logical, sep);
        let mut prefix = String::new();
        for component in logical.split('/').filter(|c| !c.is_empty()) {
            if !prefix.is_empty() {
                prefix.push(sep);
            }
            prefix.push_str(component);
            self.create_folder(session, &prefix).await?;
        }
        Ok(full)
    }

    async fn create_folder(&self, session: &mut ImapSession, path: &str) -> AppResult<()> {
        let mut attempt = 0;
        loop {
            let failure = match timeout(self.command_timeout, session.create(path)).await {
                Ok(Ok(())) => {
                    debug!("created folder {path}");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    let text = e.to_string();
                    if text.to_ascii_uppercase().contains("ALREADYEXISTS") {
                        return Ok(());
                    }
                    text
                }
                Err(_) => "CREATE timed out".to_owned(),
            };
            // some servers reject the duplicate without the response code;
            // a LIST echo still proves the folder is there
            if self.folder_exists(session, path).await.unwrap_or(false) {
                return Ok(());
            }
            if attempt >= self.max_retries {
                return Err(AppError::transport(format!(
                    "CREATE {path} failed after {attempt} retries: {failure}"
                )));
            }
            attempt += 1;
            warn!("CREATE {path} failed ({failure}); retry {attempt}/{}", self.max_retries);
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// `SELECT` a folder by server path
    pub async fn select(&self, session: &mut ImapSession, path: &str) -> AppResult<()> {
        timeout(self.command_timeout, session.select(path))
            .await
            .map_err(|_| AppError::transport(format!("SELECT {path} timed out")))
            .and_then(|r| {
                r.map_err(|e| AppError::NotFound(format!("cannot select '{path}': {e}")))
            })?;
        Ok(())
    }

    /// Whether a message with this identity key exists in the folder
    ///
    /// `SELECT`s the folder, then runs `UID SEARCH HEADER Message-ID`.
    /// Existence is at least one UID in the search result. Messages whose
    /// identity is a content hash carry no `Message-ID`, so the search
    /// cannot match them; callers rely on the state cache for those.
    pub async fn message_exists(
        &self,
        session: &mut ImapSession,
        path: &str,
        key: &str,
    ) -> AppResult<bool> {
        self.select(session, path).await?;
        let query = format!("HEADER Message-ID \"{}\"", search_safe(key));
        let uids = timeout(self.command_timeout, session.uid_search(&query))
            .await
            .map_err(|_| AppError::transport("UID SEARCH timed out"))
            .and_then(|r| r.map_err(|e| AppError::transport(format!("UID SEARCH failed: {e}"))))?;
        Ok(!uids.is_empty())
    }

    /// Append raw RFC822 bytes to the folder as a seen message
    ///
    /// Single attempt; the upload pipeline owns the retry loop so it can
    /// re-check dedup between attempts.
    ///
    /// # Errors
    ///
    /// `Transport` on failure or timeout.
    pub async fn append(
        &self,
        session: &mut ImapSession,
        path: &str,
        raw: &[u8],
    ) -> AppResult<()> {
        timeout(
            self.command_timeout,
            session.append(path, Some("\\Seen"), None, raw),
        )
        .await
        .map_err(|_| AppError::transport(format!("APPEND to {path} timed out")))
        .and_then(|r| r.map_err(|e| AppError::transport(format!("APPEND to {path} failed: {e}"))))
    }

    async fn list(
        &self,
        session: &mut ImapSession,
        reference: Option<&str>,
        pattern: Option<&str>,
    ) -> AppResult<Vec<async_imap::types::Name>> {
        let stream = timeout(self.command_timeout, session.list(reference, pattern))
            .await
            .map_err(|_| AppError::transport("LIST timed out"))
            .and_then(|r| r.map_err(|e| AppError::transport(format!("LIST failed: {e}"))))?;
        timeout(self.command_timeout, stream.try_collect::<Vec<_>>())
            .await
            .map_err(|_| AppError::transport("LIST stream timed out"))
            .and_then(|r| r.map_err(|e| AppError::transport(format!("LIST stream failed: {e}"))))
    }
}

/// Translate a slash-separated logical path to the server's separator
fn server_path(logical: &str, sep: char) -> String {
    logical
        .split('/')
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(&sep.to_string())
}

/// Strip characters that would break out of a quoted SEARCH argument
fn search_safe(key: &str) -> String {
    key.chars().filter(|c| !matches!(c, '"' | '\\')).collect()
}

fn is_auth_error(msg: &str) -> bool {
    msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN")
}

#[cfg(test)]
mod tests {
    use super::{is_auth_error, search_safe, server_path};

    #[test]
    fn server_path_uses_discovered_separator() {
        assert_eq!(server_path("A/B/C", '.'), "A.B.C");
        assert_eq!(server_path("Inbox", '.'), "Inbox");
        assert_eq!(server_path("A//B/", '/'), "A/B");
    }

    #[test]
    fn search_argument_cannot_escape_quoting() {
        assert_eq!(search_safe("abc@x"), "abc@x");
        assert_eq!(search_safe("a\"b\\c"), "abc");
    }

    #[test]
    fn login_failures_classify_as_auth() {
        assert!(is_auth_error("No - AUTHENTICATIONFAILED"));
        assert!(is_auth_error("LOGIN rejected"));
        assert!(!is_auth_error("connection reset by peer"));
    }
}
