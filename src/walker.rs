//! Folder tree traversal
//!
//! Two walks share the same shape: the download stage descends the source
//! mailbox via the Graph client, the upload stage descends the local
//! `messages/<account>` tree. Both are depth-capped, visit each folder
//! before its children, and derive the folder's local relative path the
//! same way, so the path is a pure function of ancestor display names.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::errors::AppResult;
use crate::graph::{GraphClient, MailFolder};

/// One source folder in traversal order
#[derive(Debug, Clone)]
pub struct SourceFolder {
    /// Opaque Graph folder id
    pub id: String,
    /// Local relative path derived from ancestor display names
    pub rel_path: String,
}

/// One local folder in traversal order
#[derive(Debug, Clone)]
pub struct LocalFolder {
    /// Path relative to the account's message root
    pub rel_path: String,
    /// `.eml` files directly inside this folder, sorted by name
    pub messages: Vec<PathBuf>,
}

/// Depth-capped walk of the source mailbox
///
/// Lists the root folders once, then descends children only where the
/// expanded listing reported any, sleeping `request_delay` between sibling
/// listings. Folders past the depth cap are logged and not descended into.
pub async fn walk_source(
    graph: &GraphClient,
    max_depth: usize,
    request_delay: std::time::Duration,
) -> AppResult<Vec<SourceFolder>> {
    let mut out = Vec::new();
    let roots = graph.list_root_folders().await?;
    descend(graph, roots, "", 1, max_depth, request_delay, &mut out).await?;
    Ok(out)
}

async fn descend(
    graph: &GraphClient,
    folders: Vec<MailFolder>,
    prefix: &str,
    depth: usize,
    max_depth: usize,
    request_delay: std::time::Duration,
    out: &mut Vec<SourceFolder>,
) -> AppResult<()> {
    if depth > max_depth {
        warn!("folder depth {depth} exceeds limit {max_depth} under '{prefix}'; not descending");
        return Ok(());
    }
    for (index, folder) in folders.into_iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(request_delay).await;
        }
        let rel_path = join_rel_path(prefix, &folder.display_name);
        out.push(SourceFolder {
            id: folder.id.clone(),
            rel_path: rel_path.clone(),
        });
        if folder.child_folder_count > 0 {
            if depth + 1 > max_depth {
                warn!(
                    "skipping children of '{rel_path}': depth limit {max_depth} reached"
                );
                continue;
            }
            let children = graph.list_child_folders(&folder.id).await?;
            Box::pin(descend(
                graph,
                children,
                &rel_path,
                depth + 1,
                max_depth,
                request_delay,
                out,
            ))
            .await?;
        }
    }
    Ok(())
}

/// Depth-capped walk of a local message tree
///
/// Every directory under `root` is one folder; `.eml` files directly
/// inside are its messages. Entries are visited in name order so runs are
/// deterministic.
pub fn walk_local(root: &Path, max_depth: usize) -> AppResult<Vec<LocalFolder>> {
    let mut out = Vec::new();
    if root.is_dir() {
        descend_local(root, "", 1, max_depth, &mut out)?;
    }
    Ok(out)
}

fn descend_local(
    dir: &Path,
    prefix: &str,
    depth: usize,
    max_depth: usize,
    out: &mut Vec<LocalFolder>,
) -> AppResult<()> {
    if depth > max_depth {
        warn!("local depth {depth} exceeds limit {max_depth} under '{prefix}'; not descending");
        return Ok(());
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.flatten().collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel_path = join_rel_path(prefix, &name);
        let mut messages: Vec<PathBuf> = std::fs::read_dir(entry.path())?
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "eml"))
            .collect();
        messages.sort();
        out.push(LocalFolder {
            rel_path: rel_path.clone(),
            messages,
        });
        descend_local(&entry.path(), &rel_path, depth + 1, max_depth, out)?;
    }
    Ok(())
}

/// Extend a relative path by one folder display name
///
/// ASCII spaces in the name become underscores; duplicate slashes collapse
/// and leading/trailing slashes are removed, so the result is always a
/// clean `a/b/c` form. Dot-only names would escape the message root as
/// path components and are neutralized.
pub fn join_rel_path(prefix: &str, display_name: &str) -> String {
    let component = match display_name {
        "." | ".." => "_".repeat(display_name.len()),
        other => other.replace(' ', "_"),
    };
    let mut joined = format!("{prefix}/{component}");
    while joined.contains("//") {
        joined = joined.replace("//", "/");
    }
    joined.trim_matches('/').to_owned()
}

#[cfg(test)]
mod tests {
    use super::{join_rel_path, walk_local};

    #[test]
    fn rel_path_is_a_pure_function_of_ancestor_names() {
        assert_eq!(join_rel_path("", "Inbox"), "Inbox");
        assert_eq!(join_rel_path("Inbox", "Sent Items"), "Inbox/Sent_Items");
        assert_eq!(join_rel_path("A/B", "C"), "A/B/C");
        // hostile inputs still collapse to a clean form
        assert_eq!(join_rel_path("A/", "/B"), "A/B");
        assert_eq!(join_rel_path("", "Archive 2024 "), "Archive_2024_");
        assert_eq!(join_rel_path("A", ".."), "A/__");
    }

    #[test]
    fn local_walk_lists_parents_before_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("Inbox/Sub")).expect("mkdir");
        std::fs::create_dir_all(root.join("Archive")).expect("mkdir");
        std::fs::write(root.join("Inbox/a.eml"), b"x").expect("write");
        std::fs::write(root.join("Inbox/b.eml"), b"x").expect("write");
        std::fs::write(root.join("Inbox/notes.txt"), b"x").expect("write");
        std::fs::write(root.join("Inbox/Sub/c.eml"), b"x").expect("write");

        let folders = walk_local(root, 10).expect("walk");
        let paths: Vec<_> = folders.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, ["Archive", "Inbox", "Inbox/Sub"]);

        let inbox = folders.iter().find(|f| f.rel_path == "Inbox").expect("inbox");
        assert_eq!(inbox.messages.len(), 2, "non-eml files are ignored");
        let inbox_pos = paths.iter().position(|p| *p == "Inbox").expect("pos");
        let sub_pos = paths.iter().position(|p| *p == "Inbox/Sub").expect("pos");
        assert!(inbox_pos < sub_pos);
    }

    #[test]
    fn local_walk_respects_depth_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/b/c")).expect("mkdir");

        let folders = walk_local(root, 2).expect("walk");
        let paths: Vec<_> = folders.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, ["a", "a/b"]);
    }

    #[test]
    fn missing_root_yields_no_folders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let folders = walk_local(&dir.path().join("absent"), 10).expect("walk");
        assert!(folders.is_empty());
    }
}
