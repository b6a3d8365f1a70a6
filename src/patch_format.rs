//! Archive layout shared by the patch writer and reader.
//!
//! Inner patch archive (a zip):
//! - `.patch-info`: the action index (see [`crate::patch::Patch::write`])
//! - `patch.properties`: old/new build descriptions
//! - one payload entry per action at the action's relative path; variants of
//!   a multi-action live under `.variant<N>/<path>`
//!
//! Distributable artifact (also a zip): the entries of the bootstrap
//! template copied verbatim, a top-level `patch.properties`, and the inner
//! archive stored as `patch-file.zip`.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};

pub const PATCH_INFO_ENTRY: &str = ".patch-info";
pub const PATCH_PROPERTIES_ENTRY: &str = "patch.properties";
pub const PATCH_FILE_ENTRY: &str = "patch-file.zip";

pub const OLD_BUILD_DESCRIPTION: &str = "old.build.description";
pub const NEW_BUILD_DESCRIPTION: &str = "new.build.description";

pub const INDEX_MAGIC: &[u8; 8] = b"UPDIDX01";
pub const FORMAT_VERSION: u32 = 1;

pub const VARIANT_PREFIX: &str = ".variant";

pub const ZSTD_LEVEL: i32 = 3;

/// Build descriptions carried by every patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildDescriptions {
    pub old: String,
    pub new: String,
}

impl BuildDescriptions {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        write_properties(
            out,
            &[
                (OLD_BUILD_DESCRIPTION, self.old.as_str()),
                (NEW_BUILD_DESCRIPTION, self.new.as_str()),
            ],
        )
    }

    pub fn read<R: Read>(input: R) -> Result<Self> {
        let props = read_properties(input)?;
        Ok(Self {
            old: props.get(OLD_BUILD_DESCRIPTION).cloned().unwrap_or_default(),
            new: props.get(NEW_BUILD_DESCRIPTION).cloned().unwrap_or_default(),
        })
    }
}

/// Write `key=value` lines with `\` escapes for separators and control characters.
pub fn write_properties<W: Write>(out: &mut W, entries: &[(&str, &str)]) -> Result<()> {
    writeln!(out, "#").context("Failed to write properties")?;
    for (key, value) in entries {
        writeln!(out, "{}={}", escape(key, true), escape(value, false))
            .context("Failed to write properties")?;
    }
    Ok(())
}

pub fn read_properties<R: Read>(input: R) -> Result<BTreeMap<String, String>> {
    let mut props = BTreeMap::new();
    for line in BufReader::new(input).lines() {
        let line = line.context("Failed to read properties")?;
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let (key, value) = split_property(line);
        props.insert(unescape(key), unescape(value.trim_start()));
    }
    Ok(props)
}

fn split_property(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '=' | ':' => return (&line[..i], &line[i + 1..]),
            _ => {}
        }
    }
    (line, "")
}

fn escape(text: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, c) in text.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Entry name of `path` inside the given variant namespace.
pub fn variant_path(path: &str, variant: Option<usize>) -> String {
    match variant {
        Some(n) => format!("{}{}/{}", VARIANT_PREFIX, n, path),
        None => path.to_string(),
    }
}
