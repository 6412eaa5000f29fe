//! Graph mail API source client
//!
//! Lists mail folders, pages through messages, and downloads raw MIME for
//! one source mailbox. Every request carries a bearer token from the
//! configured [`TokenProvider`] and `ConsistencyLevel: eventual`; paging
//! follows `@odata.nextLink` until exhausted. Throttling is classified by
//! the `ApplicationThrottled` marker in the response body (with plain 429
//! honored as well) and retried with a fixed delay; authorization failures
//! are never retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{GraphSettings, TokenSettings};
use crate::errors::{AppError, AppResult};

/// Server-side page size; the Graph maximum
const PAGE_SIZE: u32 = 999;

/// Marker the service embeds in throttled response bodies
const THROTTLE_MARKER: &str = "ApplicationThrottled";

/// Source of bearer tokens for the mail API
///
/// Acquisition and refresh are external; implementations only read the
/// current token, on every request, so rotation is picked up mid-run.
pub trait TokenProvider: Send + Sync {
    /// The current bearer token
    ///
    /// # Errors
    ///
    /// `AuthFailed` if no token can be read.
    fn bearer_token(&self) -> AppResult<SecretString>;
}

/// Reads the token from an environment variable
pub struct EnvTokenProvider {
    var: String,
}

impl TokenProvider for EnvTokenProvider {
    fn bearer_token(&self) -> AppResult<SecretString> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => {
                Ok(SecretString::new(value.trim().to_owned().into()))
            }
            _ => Err(AppError::AuthFailed(format!(
                "bearer token variable {} is unset or empty",
                self.var
            ))),
        }
    }
}

/// Reads the token from a file, re-reading on every call
pub struct FileTokenProvider {
    path: PathBuf,
}

impl TokenProvider for FileTokenProvider {
    fn bearer_token(&self) -> AppResult<SecretString> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            AppError::AuthFailed(format!("cannot read token file {}: {e}", self.path.display()))
        })?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::AuthFailed(format!(
                "token file {} is empty",
                self.path.display()
            )));
        }
        Ok(SecretString::new(trimmed.to_owned().into()))
    }
}

/// Build the provider named by `graph.token` in the system config
pub fn token_provider(settings: &TokenSettings) -> AppResult<Arc<dyn TokenProvider>> {
    match (&settings.env, &settings.file) {
        (Some(var), None) => Ok(Arc::new(EnvTokenProvider { var: var.clone() })),
        (None, Some(path)) => Ok(Arc::new(FileTokenProvider { path: path.clone() })),
        _ => Err(AppError::ConfigInvalid(
            "graph.token must set exactly one of 'env' or 'file'".to_owned(),
        )),
    }
}

/// A mail folder as returned by the folder listing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailFolder {
    /// Opaque server identifier
    pub id: String,
    /// Human-visible folder name
    pub display_name: String,
    /// Number of direct children; zero means no descent needed
    #[serde(default)]
    pub child_folder_count: u32,
}

/// A message reference from the per-folder listing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    /// Opaque server identifier, used for the `$value` download
    pub id: String,
    /// RFC822 `Message-ID` as known to the server, when present
    #[serde(default)]
    pub internet_message_id: Option<String>,
}

/// One page of a paginated listing
#[derive(Debug, Deserialize)]
struct Page<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Client bound to one source mailbox
pub struct GraphClient {
    http: reqwest::Client,
    endpoint: String,
    mailbox: String,
    token: Arc<dyn TokenProvider>,
    max_retries: u32,
    retry_delay: Duration,
}

impl GraphClient {
    /// Build a client for `mailbox` (the account's email address)
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` for a bad token source, `Internal` if the HTTP
    /// client cannot be constructed.
    pub fn new(
        settings: &GraphSettings,
        mailbox: &str,
        request_timeout: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: settings.endpoint.trim_end_matches('/').to_owned(),
            mailbox: mailbox.to_owned(),
            token: token_provider(&settings.token)?,
            max_retries,
            retry_delay,
        })
    }

    /// Top-level folders of the mailbox
    pub async fn list_root_folders(&self) -> AppResult<Vec<MailFolder>> {
        self.collect_pages(self.folders_url(None)).await
    }

    /// Direct children of one folder
    pub async fn list_child_folders(&self, parent_id: &str) -> AppResult<Vec<MailFolder>> {
        self.collect_pages(self.folders_url(Some(parent_id))).await
    }

    /// All message references in one folder
    pub async fn list_messages(&self, folder_id: &str) -> AppResult<Vec<MessageRef>> {
        let url = format!(
            "{}/users/{}/mailFolders/{folder_id}/messages?$top={PAGE_SIZE}&$select=id,internetMessageId",
            self.endpoint, self.mailbox
        );
        self.collect_pages(url).await
    }

    /// Raw MIME bytes of one message
    pub async fn download_message(&self, message_id: &str) -> AppResult<Vec<u8>> {
        let url = format!(
            "{}/users/{}/messages/{message_id}/$value",
            self.endpoint, self.mailbox
        );
        self.get_with_retry(&url).await
    }

    /// Cheap reachability and authorization probe for the verify stage
    pub async fn probe(&self) -> AppResult<()> {
        let url = format!(
            "{}/users/{}/mailFolders?$top=1&$select=id,displayName,childFolderCount",
            self.endpoint, self.mailbox
        );
        let _: Page<MailFolder> = self.get_json(&url).await?;
        Ok(())
    }

    fn folders_url(&self, parent_id: Option<&str>) -> String {
        let segment = match parent_id {
            Some(id) => format!("mailFolders/{id}/childFolders"),
            None => "mailFolders".to_owned(),
        };
        format!(
            "{}/users/{}/{segment}?$top={PAGE_SIZE}&$select=id,displayName,childFolderCount",
            self.endpoint, self.mailbox
        )
    }

    /// Follow `@odata.nextLink` until the listing is exhausted
    async fn collect_pages<T: DeserializeOwned>(&self, first_url: String) -> AppResult<Vec<T>> {
        let mut url = Some(first_url);
        let mut items = Vec::new();
        while let Some(current) = url {
            let page: Page<T> = self.get_json(&current).await?;
            items.extend(page.value);
            url = page.next_link;
        }
        Ok(items)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> AppResult<T> {
        let body = self.get_with_retry(url).await?;
        serde_json::from_slice(&body)
            .map_err(|e| AppError::transport(format!("invalid Graph response from {url}: {e}")))
    }

    /// GET with the throttle/transport retry budget applied
    async fn get_with_retry(&self, url: &str) -> AppResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.get_once(url).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "{err}; retrying ({attempt}/{}) after {:?}",
                        self.max_retries, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once(&self, url: &str) -> AppResult<Vec<u8>> {
        let token = self.token.bearer_token()?;
        debug!("GET {url}");
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
            .header("ConsistencyLevel", "eventual")
            .send()
            .await
            .map_err(|e| AppError::transport(format!("GET {url}: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::transport(format!("reading body of {url}: {e}")))?;

        if status.is_success() {
            return Ok(body.to_vec());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AppError::AuthFailed(format!("{status} from {url}")));
        }
        if has_throttle_marker(&body) || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::Throttled(format!("{status} from {url}")));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("{url}")));
        }
        Err(AppError::transport(format!(
            "{status} from {url}: {}",
            truncate_body(&body)
        )))
    }
}

fn has_throttle_marker(body: &[u8]) -> bool {
    body.windows(THROTTLE_MARKER.len())
        .any(|window| window == THROTTLE_MARKER.as_bytes())
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::{FileTokenProvider, MailFolder, Page, TokenProvider, has_throttle_marker};
    use crate::config::TokenSettings;

    #[test]
    fn page_deserializes_next_link_and_camel_case() {
        let raw = r#"{
            "value": [
                {"id": "AAMk1", "displayName": "Inbox", "childFolderCount": 2}
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/next"
        }"#;
        let page: Page<MailFolder> = serde_json::from_str(raw).expect("parses");
        assert_eq!(page.value.len(), 1);
        assert_eq!(page.value[0].display_name, "Inbox");
        assert_eq!(page.value[0].child_folder_count, 2);
        assert!(page.next_link.is_some());
    }

    #[test]
    fn last_page_has_no_next_link() {
        let raw = r#"{"value": []}"#;
        let page: Page<MailFolder> = serde_json::from_str(raw).expect("parses");
        assert!(page.value.is_empty());
        assert!(page.next_link.is_none());
    }

    #[test]
    fn throttle_marker_is_detected_in_body() {
        assert!(has_throttle_marker(
            br#"{"error":{"code":"ApplicationThrottled","message":"..."}}"#
        ));
        assert!(!has_throttle_marker(br#"{"error":{"code":"Other"}}"#));
    }

    #[test]
    fn file_token_provider_trims_and_rereads() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "tok-1  ").expect("write");
        let provider = FileTokenProvider {
            path: file.path().to_path_buf(),
        };
        assert_eq!(provider.bearer_token().expect("token").expose_secret(), "tok-1");

        std::fs::write(file.path(), "tok-2\n").expect("rotate");
        assert_eq!(provider.bearer_token().expect("token").expose_secret(), "tok-2");
    }

    #[test]
    fn token_provider_requires_exactly_one_source() {
        let neither = TokenSettings {
            env: None,
            file: None,
        };
        assert!(super::token_provider(&neither).is_err());
    }

    #[test]
    fn missing_env_token_is_an_auth_failure() {
        let provider = super::EnvTokenProvider {
            var: "MAILFERRY_TEST_TOKEN_THAT_DOES_NOT_EXIST".to_owned(),
        };
        let err = provider.bearer_token().expect_err("unset var");
        assert!(matches!(err, crate::errors::AppError::AuthFailed(_)));
    }
}
