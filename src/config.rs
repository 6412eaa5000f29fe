//! Configuration for the migration tool
//!
//! Two YAML files live under the `--config` directory: `system_config.yaml`
//! (endpoints, timeouts, parallelism) and `accounts.yaml` (the mailboxes to
//! migrate). Both must be mode 0600 inside a 0700 directory; looser
//! permissions are rejected before any credentials are read. Passwords are
//! stored using `SecretString` to prevent accidental logging.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::{AppError, AppResult};

/// Hard ceiling on folder-tree depth, source and local side alike
pub const MAX_DEPTH: usize = 10;

/// System-wide settings (`system_config.yaml`)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// Graph API endpoint and token source
    pub graph: GraphSettings,
    /// Target IMAP server coordinates
    pub imap: ImapSettings,
    /// Pacing, retry, and parallelism knobs
    #[serde(default)]
    pub migration: MigrationSettings,
}

/// Source (Graph) settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSettings {
    /// API base URL, e.g. `https://graph.microsoft.com/v1.0`
    #[serde(default = "default_graph_endpoint")]
    pub endpoint: String,
    /// Where bearer tokens come from (env var or token file)
    pub token: TokenSettings,
}

/// Bearer-token source
///
/// Token *acquisition* is external; this only names where the current token
/// can be read. Exactly one of the two fields must be set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenSettings {
    /// Environment variable holding the bearer token
    #[serde(default)]
    pub env: Option<String>,
    /// File whose contents are the bearer token (re-read on every request)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Target IMAP server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImapSettings {
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (993 for implicit TLS)
    #[serde(default = "default_imap_port")]
    pub port: u16,
}

/// Pacing, retry, and parallelism settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationSettings {
    /// Concurrent download workers
    #[serde(default = "default_parallel_downloads")]
    pub max_parallel_downloads: usize,
    /// Concurrent upload workers
    #[serde(default = "default_parallel_uploads")]
    pub max_parallel_uploads: usize,
    /// Minimum delay inserted between dispatched requests (ms)
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    /// Delay between retries of a throttled or failed call (ms)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Retry budget for throttled/transport failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Folder recursion depth cap (never above [`MAX_DEPTH`])
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Per-request Graph timeout (seconds)
    #[serde(default = "default_rest_timeout_secs")]
    pub rest_timeout_secs: u64,
    /// Per-command IMAP timeout (seconds)
    #[serde(default = "default_imap_timeout_secs")]
    pub imap_timeout_secs: u64,
    /// Advisory-lock acquisition timeout (ms)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Advisory-lock poll interval (ms)
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            max_parallel_downloads: default_parallel_downloads(),
            max_parallel_uploads: default_parallel_uploads(),
            request_delay_ms: default_request_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
            max_depth: default_max_depth(),
            rest_timeout_secs: default_rest_timeout_secs(),
            imap_timeout_secs: default_imap_timeout_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_ms: default_lock_poll_ms(),
        }
    }
}

/// One mailbox to migrate (`accounts.yaml` entry)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    /// Source mailbox address; also names the local `messages/<email>` tree
    pub email: String,
    /// Disabled accounts are skipped with a log line
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Login name on the target IMAP server
    pub target_user: String,
    /// Password on the target IMAP server
    pub target_pass: SecretString,
    /// Ordered folder renames applied at upload time; first match wins
    #[serde(default)]
    pub folder_overrides: Vec<FolderOverride>,
    /// Per-account retry budget, overriding the system value
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// A single `source -> dest` folder rename
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FolderOverride {
    /// Leading path component to match (local relative form)
    pub source: String,
    /// Replacement component on the target server
    pub dest: String,
}

/// The parsed `accounts.yaml`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountsFile {
    /// All configured accounts in file order
    pub accounts: Vec<AccountConfig>,
}

impl SystemConfig {
    /// Load and validate `system_config.yaml`
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if the file is missing, unparseable, names an
    /// unknown key, sets `max_depth` outside `1..=10`, or the token
    /// source is not exactly one of `env`/`file`.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| AppError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        match (&self.graph.token.env, &self.graph.token.file) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(AppError::ConfigInvalid(
                    "graph.token must set exactly one of 'env' or 'file'".to_owned(),
                ));
            }
        }
        if self.imap.host.trim().is_empty() {
            return Err(AppError::ConfigInvalid("imap.host must not be empty".to_owned()));
        }
        let depth = self.migration.max_depth;
        if depth == 0 || depth > MAX_DEPTH {
            return Err(AppError::ConfigInvalid(format!(
                "migration.max_depth must be within 1..={MAX_DEPTH}, got {depth}"
            )));
        }
        if self.migration.max_parallel_downloads == 0 || self.migration.max_parallel_uploads == 0 {
            return Err(AppError::ConfigInvalid(
                "parallelism settings must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

impl AccountsFile {
    /// Load and validate `accounts.yaml`
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` on parse failure, empty identities, or duplicate
    /// source addresses.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: Self = serde_yaml::from_str(&raw)
            .map_err(|e| AppError::ConfigInvalid(format!("{}: {e}", path.display())))?;

        let mut seen = std::collections::BTreeSet::new();
        for account in &file.accounts {
            if account.email.trim().is_empty() || account.target_user.trim().is_empty() {
                return Err(AppError::ConfigInvalid(
                    "account email and target_user must not be empty".to_owned(),
                ));
            }
            if !seen.insert(account.email.to_ascii_lowercase()) {
                return Err(AppError::ConfigInvalid(format!(
                    "duplicate account '{}'",
                    account.email
                )));
            }
        }
        Ok(file)
    }

    /// Accounts with `enabled: true`, in file order
    pub fn enabled(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }
}

impl AccountConfig {
    /// Retry budget for this account (account override, else system value)
    pub fn retry_budget(&self, system: &MigrationSettings) -> u32 {
        self.max_retries.unwrap_or(system.max_retries)
    }

    /// Apply folder overrides to a local relative path
    ///
    /// Matches on the leading path component; the first matching override
    /// wins and replaces that component only.
    pub fn map_folder(&self, relative_path: &str) -> String {
        let (head, rest) = match relative_path.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (relative_path, None),
        };
        for rename in &self.folder_overrides {
            if rename.source == head {
                return match rest {
                    Some(rest) => format!("{}/{rest}", rename.dest),
                    None => rename.dest.clone(),
                };
            }
        }
        relative_path.to_owned()
    }
}

/// On-disk layout rooted next to the config directory
///
/// ```text
/// <base>/config/{system_config.yaml,accounts.yaml}
/// <base>/messages/<account>/<folder-path>/<id>.eml
/// <base>/stats/...
/// <base>/logs/...
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
    config_dir: PathBuf,
}

impl Layout {
    /// Derive the layout from the `--config` directory
    pub fn from_config_dir(config_dir: &Path) -> Self {
        let base = config_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        Self {
            base,
            config_dir: config_dir.to_path_buf(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn system_config_path(&self) -> PathBuf {
        self.config_dir.join("system_config.yaml")
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.config_dir.join("accounts.yaml")
    }

    /// Root of the downloaded message tree for one account
    pub fn messages_dir(&self, account: &str) -> PathBuf {
        self.base.join("messages").join(account)
    }

    /// Root of the durable state store
    pub fn stats_dir(&self) -> PathBuf {
        self.base.join("stats")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Per-stage, per-account outcome log (`logs/<stage>/<account>.log`)
    pub fn stage_log_path(&self, stage: &str, account: &str) -> PathBuf {
        self.logs_dir().join(stage).join(format!("{account}.log"))
    }
}

/// Reject config locations readable by anyone but the owner
///
/// The directory must deny group/other entirely (0700) and each YAML file
/// must carry no group/other bits (0600).
///
/// # Errors
///
/// `PermissionTooOpen` naming the offending path and its mode.
#[cfg(unix)]
pub fn check_config_permissions(layout: &Layout) -> AppResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let check = |path: &Path, what: &str| -> AppResult<()> {
        let meta = std::fs::metadata(path).map_err(|e| {
            AppError::ConfigInvalid(format!("cannot stat {}: {e}", path.display()))
        })?;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(AppError::PermissionTooOpen(format!(
                "{what} {} has mode {mode:04o}; group/other access must be removed",
                path.display()
            )));
        }
        Ok(())
    };

    check(layout.config_dir(), "config directory")?;
    check(&layout.system_config_path(), "config file")?;
    check(&layout.accounts_path(), "config file")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn check_config_permissions(_layout: &Layout) -> AppResult<()> {
    Ok(())
}

fn default_graph_endpoint() -> String {
    "https://graph.microsoft.com/v1.0".to_owned()
}

fn default_imap_port() -> u16 {
    993
}

fn default_parallel_downloads() -> usize {
    3
}

fn default_parallel_uploads() -> usize {
    1
}

fn default_request_delay_ms() -> u64 {
    500
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_depth() -> usize {
    MAX_DEPTH
}

fn default_rest_timeout_secs() -> u64 {
    30
}

fn default_imap_timeout_secs() -> u64 {
    30
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lock_poll_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}
