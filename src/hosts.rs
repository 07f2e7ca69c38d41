//! Hosts file blocklist.
//!
//! Renders the controller's blocklist into a managed block in the system
//! hosts file. The block is bounded by markers carrying the blocklist
//! version, so re-applying an already-applied version is a no-op and a newer
//! version replaces the old block in place. Lines outside the block are
//! never touched.

use crate::controller::Blocklist;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BEGIN_PREFIX: &str = "# BEGIN outpost blocklist";
const END_MARKER: &str = "# END outpost blocklist";

/// Platform hosts file location.
pub fn hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

/// Write `blocklist` into the managed block of the hosts file at `path`.
///
/// Returns `Ok(true)` when the file changed, `Ok(false)` when this version
/// was already applied. A missing file is created.
pub fn apply_blocklist(path: &Path, blocklist: &Blocklist) -> Result<bool> {
    let content = if path.exists() {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read hosts file {}", path.display()))?
    } else {
        String::new()
    };

    let block = render_block(blocklist);
    let new_content = match find_managed_block(&content) {
        Some((start, end)) => {
            if parse_version(first_line(&content[start..end])) == Some(blocklist.version) {
                debug!(version = blocklist.version, "blocklist version already applied");
                return Ok(false);
            }
            let mut updated = content.clone();
            updated.replace_range(start..end, &block);
            updated
        }
        None => {
            let mut updated = content.clone();
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&block);
            updated.push('\n');
            updated
        }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create parent directories for {}", path.display())
        })?;
    }
    fs::write(path, &new_content)
        .with_context(|| format!("failed to write hosts file {}", path.display()))?;
    info!(
        version = blocklist.version,
        entries = blocklist.blocklist.len(),
        path = %path.display(),
        "applied blocklist"
    );
    Ok(true)
}

/// Version of the managed block currently in `content`, if any.
pub fn applied_version(content: &str) -> Option<u64> {
    let (start, end) = find_managed_block(content)?;
    parse_version(first_line(&content[start..end]))
}

fn render_block(blocklist: &Blocklist) -> String {
    let mut block = format!("{} v{}\n", BEGIN_PREFIX, blocklist.version);
    for site in &blocklist.blocklist {
        block.push_str(&site.redirect);
        block.push(' ');
        block.push_str(&site.url);
        block.push('\n');
    }
    block.push_str(END_MARKER);
    block
}

/// Byte span of the managed block, begin marker through end marker.
fn find_managed_block(content: &str) -> Option<(usize, usize)> {
    let start = content.find(BEGIN_PREFIX)?;
    let end = content[start..].find(END_MARKER)?;
    Some((start, start + end + END_MARKER.len()))
}

fn parse_version(begin_line: &str) -> Option<u64> {
    let rest = begin_line.strip_prefix(BEGIN_PREFIX)?;
    rest.trim().strip_prefix('v')?.parse().ok()
}

fn first_line(block: &str) -> &str {
    block.lines().next().unwrap_or("")
}
