//! Per-message upload orchestration
//!
//! Each message runs the same state machine: derive identity, consult the
//! state cache, gate on integrity, ask the server whether the message is
//! already there, `APPEND`, then verify by searching for it. Dedup is
//! re-checked on every retry because a prior attempt may have succeeded at
//! the server while its response was lost. Every terminal transition
//! updates the state cache, emits a job status, and bumps the matching
//! counters.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::imap::{ImapSession, ImapTarget};
use crate::message;
use crate::state::{JobPhase, MessageState, StateStore};

/// Everything a message work unit needs, shared across one folder
pub struct UploadContext {
    pub store: StateStore,
    pub imap: Arc<ImapTarget>,
    pub user: String,
    pub pass: SecretString,
    /// Local relative folder path; the state-cache key space
    pub folder_rel: String,
    /// Folder path on the target server (separator already applied)
    pub server_folder: String,
    pub retry_budget: u32,
    pub retry_delay: Duration,
    /// Bypass cache and server dedup entirely
    pub force: bool,
}

/// Terminal disposition of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Appended and observed on the server
    Committed,
    /// Dedup hit; nothing was appended
    Skipped,
    /// Terminal failure, recorded and counted
    Failed,
}

/// What happened to one message, for the stage summary and account log
#[derive(Debug, Clone)]
pub struct MessageReport {
    pub key: String,
    pub disposition: Disposition,
    pub size: u64,
    /// Last-seen error text for failures
    pub detail: Option<String>,
    /// Failure classes that must abort the whole stage (auth)
    pub fatal: bool,
}

/// Run the upload state machine for one local `.eml` file
pub async fn upload_message(ctx: Arc<UploadContext>, path: PathBuf) -> MessageReport {
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(err) => {
            let key = fallback_key(&path);
            return fail(&ctx, key, 0, format!("unreadable file: {err}"), false).await;
        }
    };
    // a content-hash identity is invisible to HEADER searches, so server
    // dedup and search verification only apply to real Message-IDs
    let searchable = message::header_message_id(&raw).is_some();
    let key = message::identity_key(&raw);
    let size = raw.len() as u64;
    let job_id = Uuid::new_v4().to_string();
    let job_ref = format!("{}/{}", ctx.folder_rel, key);
    record_job(&ctx.store, &job_id, JobPhase::Start, &job_ref);

    if !ctx.force && cached_as_done(&ctx, &key) {
        debug!("{job_ref}: state cache hit");
        return skip(&ctx, &job_id, key, size).await;
    }

    if let Err(err) = message::check_integrity(&raw) {
        return fail_with_job(&ctx, &job_id, key, size, err.to_string(), false).await;
    }

    let mut session: Option<ImapSession> = None;
    let mut attempt: u32 = 0;
    loop {
        // dedup re-check on every pass through the loop
        if !ctx.force {
            if cached_as_done(&ctx, &key) {
                return skip(&ctx, &job_id, key, size).await;
            }
        }
        if !ctx.force && searchable {
            match exists_on_server(&ctx, &mut session, &key).await {
                Ok(true) => {
                    debug!("{job_ref}: already on server");
                    return skip(&ctx, &job_id, key, size).await;
                }
                Ok(false) => {}
                Err(err) => {
                    session = None;
                    if err.is_fatal() || attempt >= ctx.retry_budget {
                        let fatal = err.is_fatal();
                        return fail_with_job(
                            &ctx,
                            &job_id,
                            key,
                            size,
                            format!("dedup check: {err}"),
                            fatal,
                        )
                        .await;
                    }
                    attempt += 1;
                    warn!("{job_ref}: dedup check failed ({err}); retry {attempt}/{}", ctx.retry_budget);
                    tokio::time::sleep(ctx.retry_delay).await;
                    continue;
                }
            }
        }

        record_job(&ctx.store, &job_id, JobPhase::Uploading, &job_ref);
        match append_once(&ctx, &mut session, &raw).await {
            Ok(()) => {
                if !searchable {
                    return commit(&ctx, &job_id, key, size).await;
                }
                return match verify_upload(&ctx, &mut session, &key).await {
                    Ok(()) => commit(&ctx, &job_id, key, size).await,
                    Err(err) => {
                        fail_with_job(&ctx, &job_id, key, size, err.to_string(), false).await
                    }
                };
            }
            Err(err) => {
                session = None;
                if err.is_fatal() || attempt >= ctx.retry_budget {
                    let fatal = err.is_fatal();
                    return fail_with_job(&ctx, &job_id, key, size, err.to_string(), fatal).await;
                }
                attempt += 1;
                warn!("{job_ref}: APPEND failed ({err}); retry {attempt}/{}", ctx.retry_budget);
                tokio::time::sleep(ctx.retry_delay).await;
            }
        }
    }
}

fn cached_as_done(ctx: &UploadContext, key: &str) -> bool {
    matches!(
        ctx.store.get_message_state(&ctx.folder_rel, key),
        MessageState::Uploaded | MessageState::Skipped
    )
}

/// Get or open the work unit's session; failed sessions were dropped by
/// the caller, so `None` always means a fresh connect
async fn current_session<'a>(
    ctx: &UploadContext,
    session: &'a mut Option<ImapSession>,
) -> AppResult<&'a mut ImapSession> {
    if session.is_none() {
        *session = Some(ctx.imap.connect(&ctx.user, &ctx.pass).await?);
    }
    session
        .as_mut()
        .ok_or_else(|| AppError::Internal("session must exist after connect".to_owned()))
}

async fn exists_on_server(
    ctx: &UploadContext,
    session: &mut Option<ImapSession>,
    key: &str,
) -> AppResult<bool> {
    let live = current_session(ctx, session).await?;
    ctx.imap
        .message_exists(live, &ctx.server_folder, key)
        .await
}

async fn append_once(
    ctx: &UploadContext,
    session: &mut Option<ImapSession>,
    raw: &[u8],
) -> AppResult<()> {
    let live = current_session(ctx, session).await?;
    ctx.imap.append(live, &ctx.server_folder, raw).await
}

/// Search for the appended message until found or the budget runs out
async fn verify_upload(
    ctx: &UploadContext,
    session: &mut Option<ImapSession>,
    key: &str,
) -> AppResult<()> {
    let mut attempt: u32 = 0;
    loop {
        match exists_on_server(ctx, session, key).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => {
                *session = None;
                warn!("verify search failed: {err}");
            }
        }
        if attempt >= ctx.retry_budget {
            return Err(AppError::VerifyFailed(format!(
                "message {key} not observed after {attempt} retries"
            )));
        }
        attempt += 1;
        tokio::time::sleep(ctx.retry_delay).await;
    }
}

async fn commit(ctx: &UploadContext, job_id: &str, key: String, size: u64) -> MessageReport {
    put_state(ctx, &key, MessageState::Uploaded).await;
    record_job(&ctx.store, job_id, JobPhase::Completed, &key);
    bump(ctx, "total_messages", 1).await;
    bump(ctx, "total_size", size).await;
    bump(ctx, &format!("folders/{}/count", ctx.folder_rel), 1).await;
    bump(ctx, &format!("folders/{}/size", ctx.folder_rel), size).await;
    MessageReport {
        key,
        disposition: Disposition::Committed,
        size,
        detail: None,
        fatal: false,
    }
}

async fn skip(ctx: &UploadContext, job_id: &str, key: String, size: u64) -> MessageReport {
    put_state(ctx, &key, MessageState::Skipped).await;
    record_job(&ctx.store, job_id, JobPhase::Skipped, &key);
    bump(ctx, "total_skipped", 1).await;
    bump(ctx, "total_size", size).await;
    bump(ctx, &format!("folders/{}/skipped", ctx.folder_rel), 1).await;
    bump(ctx, &format!("folders/{}/size", ctx.folder_rel), size).await;
    MessageReport {
        key,
        disposition: Disposition::Skipped,
        size,
        detail: None,
        fatal: false,
    }
}

async fn fail_with_job(
    ctx: &UploadContext,
    job_id: &str,
    key: String,
    size: u64,
    detail: String,
    fatal: bool,
) -> MessageReport {
    record_job(&ctx.store, job_id, JobPhase::Failed, &detail);
    fail(ctx, key, size, detail, fatal).await
}

async fn fail(
    ctx: &UploadContext,
    key: String,
    size: u64,
    detail: String,
    fatal: bool,
) -> MessageReport {
    warn!("{}/{key}: {detail}", ctx.folder_rel);
    put_state(ctx, &key, MessageState::Failed).await;
    bump(ctx, "total_failed", 1).await;
    bump(ctx, &format!("folders/{}/failed", ctx.folder_rel), 1).await;
    MessageReport {
        key,
        disposition: Disposition::Failed,
        size,
        detail: Some(detail),
        fatal,
    }
}

async fn put_state(ctx: &UploadContext, key: &str, state: MessageState) {
    let mut attempt = 0;
    loop {
        match ctx.store.put_message_state(&ctx.folder_rel, key, state).await {
            Ok(()) => return,
            Err(err) if matches!(err, AppError::LockTimeout(_)) && attempt < ctx.retry_budget => {
                attempt += 1;
                warn!("state write for {key} timed out; retry {attempt}");
            }
            Err(err) => {
                warn!("state write for {key} failed: {err}");
                return;
            }
        }
    }
}

async fn bump(ctx: &UploadContext, counter: &str, delta: u64) {
    ctx.store.bump_counter(counter, delta, ctx.retry_budget).await;
}

fn record_job(store: &StateStore, job_id: &str, phase: JobPhase, message: &str) {
    if let Err(err) = store.mark_job_status(job_id, phase, message) {
        warn!("job status write failed: {err}");
    }
}

fn fallback_key(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;

    use super::{Disposition, UploadContext, upload_message};
    use crate::imap::ImapTarget;
    use crate::state::{MessageState, StateStore};

    const MESSAGE: &[u8] = b"Message-ID: <abc@x>\r\nContent-Type: text/plain\r\nFrom: a@b\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\nSubject: s\r\n\r\npadding padding padding padding padding padding\r\n";

    /// Context whose IMAP target is unreachable: any path that needs the
    /// server fails fast, so tests prove which paths never touch it.
    fn offline_ctx(dir: &std::path::Path, folder: &str) -> UploadContext {
        UploadContext {
            store: StateStore::open(
                dir.join("stats"),
                Duration::from_millis(200),
                Duration::from_millis(10),
            )
            .expect("store"),
            imap: Arc::new(ImapTarget::new(
                "127.0.0.1",
                1,
                Duration::from_millis(100),
                0,
                Duration::from_millis(1),
            )),
            user: "u".to_owned(),
            pass: SecretString::new("p".to_owned().into()),
            folder_rel: folder.to_owned(),
            server_folder: folder.to_owned(),
            retry_budget: 0,
            retry_delay: Duration::from_millis(1),
            force: false,
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_without_touching_the_server() {
        let dir = tempfile::tempdir().expect("tempdir");
        let eml = dir.path().join("abc@x.eml");
        std::fs::write(&eml, MESSAGE).expect("write eml");

        let ctx = offline_ctx(dir.path(), "Inbox");
        ctx.store
            .put_message_state("Inbox", "abc@x", MessageState::Uploaded)
            .await
            .expect("seed cache");

        let report = upload_message(Arc::new(ctx), eml).await;
        assert_eq!(report.disposition, Disposition::Skipped);
        assert_eq!(report.key, "abc@x");
    }

    #[tokio::test]
    async fn skip_updates_counters_and_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let eml = dir.path().join("abc@x.eml");
        std::fs::write(&eml, MESSAGE).expect("write eml");

        let ctx = offline_ctx(dir.path(), "Inbox");
        ctx.store
            .put_message_state("Inbox", "abc@x", MessageState::Skipped)
            .await
            .expect("seed cache");
        let store = ctx.store.clone();

        let report = upload_message(Arc::new(ctx), eml).await;
        assert_eq!(report.disposition, Disposition::Skipped);
        assert_eq!(store.read_counter("total_skipped"), 1);
        assert_eq!(store.read_counter("folders/Inbox/skipped"), 1);
        assert_eq!(store.read_counter("total_size"), MESSAGE.len() as u64);
        assert_eq!(store.read_counter("total_messages"), 0);
        assert_eq!(store.get_message_state("Inbox", "abc@x"), MessageState::Skipped);
    }

    #[tokio::test]
    async fn integrity_failure_is_terminal_and_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let eml = dir.path().join("short.eml");
        std::fs::write(&eml, b"too short").expect("write eml");

        let ctx = offline_ctx(dir.path(), "Inbox");
        let store = ctx.store.clone();

        let report = upload_message(Arc::new(ctx), eml).await;
        assert_eq!(report.disposition, Disposition::Failed);
        assert!(!report.fatal);
        assert!(report.detail.expect("detail").contains("minimum"));
        assert_eq!(store.read_counter("total_failed"), 1);
        assert_eq!(store.read_counter("folders/Inbox/failed"), 1);
        assert_eq!(store.read_counter("total_size"), 0);
    }

    #[tokio::test]
    async fn unreachable_server_fails_the_message_not_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let eml = dir.path().join("abc@x.eml");
        std::fs::write(&eml, MESSAGE).expect("write eml");

        let ctx = offline_ctx(dir.path(), "Inbox");
        let store = ctx.store.clone();

        let report = upload_message(Arc::new(ctx), eml).await;
        assert_eq!(report.disposition, Disposition::Failed);
        assert_eq!(store.get_message_state("Inbox", "abc@x"), MessageState::Failed);
        assert_eq!(store.read_counter("total_failed"), 1);
    }
}
