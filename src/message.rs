//! Message identity and integrity
//!
//! A message's identity key is the `Message-ID` header with angle brackets
//! and line breaks stripped; messages without one fall back to the MD5 of
//! their raw bytes, so identity is stable across retries either way. The
//! integrity check gates uploads: truncated or header-less files never
//! reach the target server.

use mailparse::MailHeaderMap;

use crate::errors::{AppError, AppResult};

/// Smallest plausible RFC822 message; anything below this is truncated
pub const MIN_MESSAGE_SIZE: usize = 100;

/// Headers every migrated message must carry
const REQUIRED_HEADERS: [&str; 4] = ["Content-Type", "From", "Date", "Subject"];

/// Derive the identity key for a raw message
///
/// Priority order: `Message-ID` header (brackets, CR, and LF stripped),
/// else the lowercase hex MD5 of the raw bytes. The fallback also covers
/// unparseable header blocks.
pub fn identity_key(raw: &[u8]) -> String {
    header_message_id(raw).unwrap_or_else(|| format!("{:x}", md5::compute(raw)))
}

/// The cleaned `Message-ID` header value, if the message carries one
///
/// `None` means the identity key is a content hash, which a server-side
/// `SEARCH HEADER Message-ID` can never match.
pub fn header_message_id(raw: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(raw).ok()?;
    let value = headers.get_first_value("Message-ID")?;
    let cleaned = clean_message_id(&value);
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

/// Normalize a `Message-ID` value: angle brackets, CR, and LF stripped
pub fn clean_message_id(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '\r' | '\n'))
        .collect();
    cleaned.trim().to_owned()
}

/// Filesystem-safe form of an identity key, used as the `.eml` file stem
///
/// Keys are mostly `local@domain` strings already; anything outside a
/// conservative character set becomes `_`.
pub fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-' | '=' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Validate a message before upload
///
/// Passes iff the raw bytes are at least [`MIN_MESSAGE_SIZE`], the four
/// required headers are present (case-insensitive), and, for multipart
/// messages, the closing `--<boundary>--` marker exists.
///
/// # Errors
///
/// `Integrity` naming the first violated condition.
pub fn check_integrity(raw: &[u8]) -> AppResult<()> {
    if raw.len() < MIN_MESSAGE_SIZE {
        return Err(AppError::Integrity(format!(
            "message is {} bytes, minimum is {MIN_MESSAGE_SIZE}",
            raw.len()
        )));
    }

    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Integrity(format!("unparseable message: {e}")))?;

    for header in REQUIRED_HEADERS {
        if parsed.headers.get_first_value(header).is_none() {
            return Err(AppError::Integrity(format!("missing {header} header")));
        }
    }

    if parsed.ctype.mimetype.starts_with("multipart/") {
        let boundary = parsed.ctype.params.get("boundary").ok_or_else(|| {
            AppError::Integrity("multipart message without boundary parameter".to_owned())
        })?;
        let closing = format!("--{boundary}--");
        if !contains_subslice(raw, closing.as_bytes()) {
            return Err(AppError::Integrity(format!(
                "multipart message missing closing boundary {closing}"
            )));
        }
    }

    Ok(())
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::{check_integrity, file_stem, identity_key, MIN_MESSAGE_SIZE};

    const PADDING: &str = "This body line only exists to push the message over the size floor.\r\n";

    fn simple_message(message_id: Option<&str>) -> Vec<u8> {
        let mut raw = String::new();
        if let Some(id) = message_id {
            raw.push_str(&format!("Message-ID: {id}\r\n"));
        }
        raw.push_str("Content-Type: text/plain\r\n");
        raw.push_str("From: sender@example.com\r\n");
        raw.push_str("Date: Wed, 1 Jan 2025 00:00:00 +0000\r\n");
        raw.push_str("Subject: Hi\r\n\r\n");
        raw.push_str(PADDING);
        raw.into_bytes()
    }

    #[test]
    fn identity_prefers_message_id_with_brackets_stripped() {
        let raw = simple_message(Some("<abc@x>"));
        assert_eq!(identity_key(&raw), "abc@x");
    }

    #[test]
    fn identity_falls_back_to_md5_of_raw_bytes() {
        let raw = simple_message(None);
        let key = identity_key(&raw);
        assert_eq!(key, format!("{:x}", md5::compute(&raw)));
        assert_eq!(key.len(), 32);
        // deterministic across calls
        assert_eq!(key, identity_key(&raw));
    }

    #[test]
    fn identity_treats_empty_message_id_as_absent() {
        let raw = simple_message(Some("<>"));
        assert!(super::header_message_id(&raw).is_none());
        assert_eq!(identity_key(&raw).len(), 32);
    }

    #[test]
    fn header_message_id_distinguishes_searchable_identities() {
        let with = simple_message(Some("<abc@x>"));
        assert_eq!(super::header_message_id(&with).as_deref(), Some("abc@x"));
        let without = simple_message(None);
        assert!(super::header_message_id(&without).is_none());
    }

    #[test]
    fn file_stem_preserves_typical_ids() {
        assert_eq!(file_stem("abc.123@mail.example.com"), "abc.123@mail.example.com");
        assert_eq!(file_stem("a b/c:d"), "a_b_c_d");
    }

    #[test]
    fn integrity_accepts_complete_plain_message() {
        check_integrity(&simple_message(Some("<abc@x>"))).expect("valid message");
    }

    #[test]
    fn integrity_rejects_short_messages() {
        let raw = b"From: a@b\r\n\r\nx";
        assert!(raw.len() < MIN_MESSAGE_SIZE);
        let err = check_integrity(raw).expect_err("too short");
        assert!(err.to_string().contains("minimum"));
    }

    #[test]
    fn integrity_rejects_missing_required_header() {
        let raw = format!(
            "Content-Type: text/plain\r\nFrom: a@b\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\n{PADDING}{PADDING}"
        );
        let err = check_integrity(raw.as_bytes()).expect_err("no subject");
        assert!(err.to_string().contains("Subject"));
    }

    #[test]
    fn integrity_requires_closing_multipart_boundary() {
        let head = "Content-Type: multipart/mixed; boundary=\"XYZ\"\r\nFrom: a@b\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\nSubject: s\r\n\r\n";
        let open_only = format!("{head}--XYZ\r\nContent-Type: text/plain\r\n\r\nbody\r\n");
        let err = check_integrity(open_only.as_bytes()).expect_err("unterminated");
        assert!(err.to_string().contains("closing boundary"));

        let complete = format!("{open_only}--XYZ--\r\n");
        check_integrity(complete.as_bytes()).expect("terminated multipart");
    }
}
