//! Directory listing over the execution channel.
//!
//! A single `find -printf` exchange produces one tab-separated record per
//! entry; the nested tree is assembled here in Rust. This replaces
//! per-directory generated shell loops, which were a standing source of
//! quoting and escaping bugs.

use std::collections::BTreeMap;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::exec::channel::{CommandSpec, ExecutionChannel};

/// Default recursion depth for directory listings
const DEFAULT_MAX_DEPTH: u32 = 6;

/// One file or directory in a listing tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Last-modified time as a Unix timestamp in seconds (None if unavailable)
    pub modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

/// List a directory tree on the target host.
///
/// Entries are sorted at every level: directories first, then files, both
/// alphabetically.
pub async fn list_tree(
    channel: &dyn ExecutionChannel,
    root: &str,
) -> Result<Vec<FileNode>, EngineError> {
    let spec = CommandSpec::new("find").args([
        root,
        "-mindepth",
        "1",
        "-maxdepth",
        &DEFAULT_MAX_DEPTH.to_string(),
        "-printf",
        "%y\\t%s\\t%T@\\t%p\\n",
    ]);

    let output = channel.exec(&spec, None).await?.into_result()?;
    Ok(parse_listing(root, &output.stdout))
}

/// Read a file on the target host, transported base64-encoded so binary
/// content survives the channel.
pub async fn read_file(
    channel: &dyn ExecutionChannel,
    path: &str,
) -> Result<Vec<u8>, EngineError> {
    let spec = CommandSpec::new("base64").arg(path);
    let output = channel.exec(&spec, None).await?.into_result()?;

    let encoded: String = output
        .stdout
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    BASE64
        .decode(encoded)
        .map_err(|e| EngineError::Internal(format!("invalid base64 from channel: {e}")))
}

#[derive(Debug, Clone)]
struct RawEntry {
    path: String,
    is_dir: bool,
    size: u64,
    modified: Option<u64>,
}

fn parse_listing(root: &str, stdout: &str) -> Vec<FileNode> {
    let mut by_parent: BTreeMap<String, Vec<RawEntry>> = BTreeMap::new();

    for line in stdout.lines() {
        let mut fields = line.splitn(4, '\t');
        let (Some(kind), Some(size), Some(mtime), Some(path)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };

        let entry = RawEntry {
            path: path.to_string(),
            is_dir: kind == "d",
            size: size.parse().unwrap_or(0),
            modified: mtime.split('.').next().and_then(|s| s.parse().ok()),
        };

        let parent = Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.to_string());
        by_parent.entry(parent).or_default().push(entry);
    }

    build_level(root, &by_parent)
}

fn build_level(parent: &str, by_parent: &BTreeMap<String, Vec<RawEntry>>) -> Vec<FileNode> {
    let Some(entries) = by_parent.get(parent) else {
        return Vec::new();
    };

    let mut nodes: Vec<FileNode> = entries
        .iter()
        .map(|entry| {
            let name = Path::new(&entry.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.path.clone());
            let children = if entry.is_dir {
                build_level(&entry.path, by_parent)
            } else {
                Vec::new()
            };

            FileNode {
                name,
                path: entry.path.clone(),
                is_dir: entry.is_dir,
                size: if entry.is_dir { 0 } else { entry.size },
                modified: entry.modified,
                children,
            }
        })
        .collect();

    nodes.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing_nesting_and_sort() {
        let stdout = "\
f\t120\t1700000000.123\t/srv/app/readme.md
d\t4096\t1700000001.000\t/srv/app/src
f\t45\t1700000002.000\t/srv/app/src/main.rs
d\t4096\t1700000003.000\t/srv/app/config
f\t10\t1700000004.000\t/srv/app/config/prod.toml
";
        let nodes = parse_listing("/srv/app", stdout);

        // Directories first, alphabetical
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].name, "config");
        assert!(nodes[0].is_dir);
        assert_eq!(nodes[1].name, "src");
        assert_eq!(nodes[2].name, "readme.md");
        assert!(!nodes[2].is_dir);

        assert_eq!(nodes[1].children.len(), 1);
        assert_eq!(nodes[1].children[0].name, "main.rs");
        assert_eq!(nodes[1].children[0].size, 45);
        assert_eq!(nodes[1].children[0].modified, Some(1700000002));
    }

    #[test]
    fn test_parse_listing_skips_malformed_lines() {
        let nodes = parse_listing("/srv", "garbage-without-tabs\n");
        assert!(nodes.is_empty());
    }
}
