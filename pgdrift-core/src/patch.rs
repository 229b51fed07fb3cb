//! Patch files: naming, discovery, rendering and block parsing.
//!
//! A patch is `{version}_{name}.sql` holding labeled statement blocks:
//!
//! ```text
//! --- BEGIN ALTER TABLE "public"."t" ---
//! ALTER TABLE "public"."t" ADD COLUMN "note" text NULL;
//! --- END ALTER TABLE "public"."t" ---
//! ```
//!
//! Text outside blocks (the header) is ignored when a patch is applied.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::change::ChangeBlock;
use crate::emit::render;
use crate::error::{DriftError, Result};

static PATCH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)_(.+)\.sql$").unwrap());

/// Width of the history table's `version` column.
pub const MAX_VERSION_LEN: usize = 17;

const BEGIN_PREFIX: &str = "--- BEGIN ";
const END_PREFIX: &str = "--- END ";
const MARKER_SUFFIX: &str = " ---";

/// A patch file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchFile {
    pub version: String,
    pub name: String,
    pub file_name: String,
    pub path: PathBuf,
}

impl PatchFile {
    /// Read the file and split it into blocks.
    pub fn read_blocks(&self) -> Result<Vec<PatchBlock>> {
        let content = std::fs::read_to_string(&self.path)?;
        parse_blocks(&content).map_err(|e| match e {
            DriftError::IntegrityError(reason) => {
                DriftError::IntegrityError(format!("{}: {}", self.file_name, reason))
            }
            other => other,
        })
    }
}

/// One labeled statement block, with its text exactly as written in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBlock {
    pub label: String,
    pub sql: String,
}

/// Split `{version}_{name}.sql` into its version and name.
pub fn parse_patch_filename(filename: &str) -> Result<(String, String)> {
    let caps = PATCH_RE.captures(filename).ok_or_else(|| {
        DriftError::IntegrityError(format!(
            "Patch file '{}' does not match the {{version}}_{{name}}.sql pattern",
            filename
        ))
    })?;
    let version = caps[1].to_string();
    if version.len() > MAX_VERSION_LEN {
        return Err(DriftError::IntegrityError(format!(
            "Patch file '{}' has a version longer than {} digits",
            filename, MAX_VERSION_LEN
        )));
    }
    Ok((version, caps[2].to_string()))
}

/// List the `.sql` files of `directory` in file name order.
pub fn scan_patches(directory: &Path) -> Result<Vec<PatchFile>> {
    if !directory.exists() {
        tracing::warn!(directory = %directory.display(), "Patch directory does not exist");
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(directory).map_err(|e| {
        DriftError::IoError(std::io::Error::new(
            e.kind(),
            format!(
                "Failed to read patch directory '{}': {}",
                directory.display(),
                e
            ),
        ))
    })?;

    let mut patches = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if !file_name.to_ascii_lowercase().ends_with(".sql") {
            continue;
        }

        let (version, name) = parse_patch_filename(&file_name)?;
        patches.push(PatchFile {
            version,
            name,
            file_name,
            path,
        });
    }

    patches.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(patches)
}

/// Split patch content into blocks.
///
/// Block text is copied byte for byte, line endings included. Inside a block
/// only the matching `END` marker closes it; other marker-looking lines are
/// content. A block left open at end of file is an error.
pub fn parse_blocks(content: &str) -> Result<Vec<PatchBlock>> {
    let mut blocks = Vec::new();
    let mut open: Option<(String, String)> = None;

    for line in content.split_inclusive('\n') {
        let bare = line.trim_end_matches(['\r', '\n']);
        match open.as_mut() {
            Some((label, sql)) => {
                if marker_label(bare, END_PREFIX) == Some(label.as_str()) {
                    if let Some((label, sql)) = open.take() {
                        blocks.push(PatchBlock { label, sql });
                    }
                } else {
                    sql.push_str(line);
                }
            }
            None => {
                if let Some(label) = marker_label(bare, BEGIN_PREFIX) {
                    open = Some((label.to_string(), String::new()));
                }
            }
        }
    }

    if let Some((label, _)) = open {
        return Err(DriftError::IntegrityError(format!(
            "Block '{}' has no END marker",
            label
        )));
    }
    Ok(blocks)
}

fn marker_label<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?.strip_suffix(MARKER_SUFFIX)
}

/// `{yyyyMMddHHmmssSSS}_{name}.sql`
pub fn patch_file_name(created: DateTime<Utc>, name: &str) -> String {
    format!("{}_{}.sql", created.format("%Y%m%d%H%M%S%3f"), name)
}

/// Render change blocks as patch text, headed by author and creation time.
pub fn render_patch(
    blocks: &[ChangeBlock],
    idempotent: bool,
    author: &str,
    created: DateTime<Utc>,
) -> String {
    let timestamp = created.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let width = author.len().max(timestamp.len());
    let rule = format!("/******************{}***/\n", "*".repeat(width + 2));

    let mut out = String::new();
    out.push_str(&rule);
    out.push_str(&format!("/*** SCRIPT AUTHOR: {:<width$} ***/\n", author, width = width));
    out.push_str(&format!("/***    CREATED ON: {:<width$} ***/\n", timestamp, width = width));
    out.push_str(&rule);

    for block in blocks.iter().filter(|b| !b.is_empty()) {
        out.push('\n');
        out.push_str(&format!("{}{}{}\n", BEGIN_PREFIX, block.label, MARKER_SUFFIX));
        for op in &block.operations {
            out.push_str(&render(op, idempotent));
            out.push('\n');
        }
        out.push_str(&format!("{}{}{}\n", END_PREFIX, block.label, MARKER_SUFFIX));
    }
    out
}
