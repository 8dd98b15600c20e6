//! Path normalization.
//!
//! Every path that reaches the redirection engine is first turned into a
//! [`VirtualPathKey`]: an absolute, separator-free sequence of segments whose
//! comparison form is case-folded the way NTFS folds names (a 1:1 upcase
//! table, no locale). The display form keeps the caller's spelling so
//! redirected paths preserve the case the application asked for.

use std::{
    cmp::Ordering,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use crate::error::{InvalidPathReason, Result, VfsError};

/// Longest single component, in UTF-16 code units.
pub const MAX_COMPONENT_LENGTH: usize = 255;
/// Longest total path, in UTF-16 code units.
pub const MAX_PATH_LENGTH: usize = 32_767;

const UNIX_ROOT: &str = "/";

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    /// Win32 path: trailing dots and spaces are dropped, device names reserved.
    Dos,
    /// `\\?\` or `\??\` path: taken as-is apart from `.`/`..` handling.
    Verbatim,
    /// Unix host path.
    Unix,
}

#[derive(Debug, Clone)]
pub struct VirtualPathKey {
    segments: Vec<String>,
    folded: Vec<String>,
}

/// Folds one name the way the host file system compares names.
pub fn fold_case(name: &str) -> String {
    name.chars()
        .map(|c| {
            let mut upper = c.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(u), None) => u,
                _ => c,
            }
        })
        .collect()
}

/// Equivalent to [`VirtualPathKey::parse`].
pub fn normalize(raw: &str) -> Result<VirtualPathKey> {
    VirtualPathKey::parse(raw)
}

impl VirtualPathKey {
    /// Parses an absolute DOS, UNC, NT (`\??\`), verbatim (`\\?\`) or, on Unix
    /// hosts, slash-rooted path.
    pub fn parse(raw: &str) -> Result<VirtualPathKey> {
        if raw.is_empty() {
            return Err(VfsError::invalid_path(raw, InvalidPathReason::Empty));
        }
        if raw.encode_utf16().count() > MAX_PATH_LENGTH {
            return Err(VfsError::invalid_path(raw, InvalidPathReason::PathTooLong));
        }

        let (root, rest, style) = split_root(raw)?;
        let mut segments = vec![root];
        let separators: &[char] = match style {
            Style::Unix => &['/'],
            _ => &['\\', '/'],
        };

        for component in rest.split(separators) {
            let component = match style {
                Style::Dos if component != "." && component != ".." => {
                    component.trim_end_matches(|c| c == '.' || c == ' ')
                }
                _ => component,
            };
            match component {
                "" | "." => continue,
                ".." => {
                    if segments.len() > 1 {
                        segments.pop();
                    } else if style == Style::Verbatim {
                        return Err(VfsError::invalid_path(raw, InvalidPathReason::EscapesRoot));
                    }
                }
                name => {
                    check_component(raw, name, style)?;
                    segments.push(name.to_owned());
                }
            }
        }

        Ok(VirtualPathKey::from_segments(segments))
    }

    pub fn from_path(path: &Path) -> Result<VirtualPathKey> {
        VirtualPathKey::parse(&path.to_string_lossy())
    }

    pub(crate) fn from_segments(segments: Vec<String>) -> VirtualPathKey {
        let folded = segments.iter().map(|s| fold_case(s)).collect();
        VirtualPathKey { segments, folded }
    }

    /// Segments including the root (drive, UNC share or `/`) at index 0.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn folded(&self) -> &[String] {
        &self.folded
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.segments.last().map(String::as_str)
        }
    }

    pub fn parent(&self) -> Option<VirtualPathKey> {
        if self.is_root() {
            return None;
        }
        Some(VirtualPathKey {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
            folded: self.folded[..self.folded.len() - 1].to_vec(),
        })
    }

    /// The ancestor made of the first `len` segments (at least the root).
    pub fn prefix(&self, len: usize) -> VirtualPathKey {
        let len = len.clamp(1, self.segments.len());
        VirtualPathKey {
            segments: self.segments[..len].to_vec(),
            folded: self.folded[..len].to_vec(),
        }
    }

    /// Appends a relative path (which may contain several components).
    pub fn join(&self, relative: &str) -> Result<VirtualPathKey> {
        let separator = if self.segments[0] == UNIX_ROOT { "/" } else { "\\" };
        VirtualPathKey::parse(&format!("{}{}{}", self, separator, relative))
    }

    pub fn starts_with(&self, base: &VirtualPathKey) -> bool {
        self.folded.len() >= base.folded.len() && self.folded[..base.folded.len()] == base.folded[..]
    }

    /// Remaining display segments below `base`, if `base` is an ancestor.
    pub fn strip_prefix(&self, base: &VirtualPathKey) -> Option<&[String]> {
        if self.starts_with(base) {
            Some(&self.segments[base.segments.len()..])
        } else {
            None
        }
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(self.to_string())
    }

    /// `\\?\C:\a` or `\\?\UNC\server\share\a`.
    pub fn to_verbatim(&self) -> String {
        let display = self.to_string();
        match display.strip_prefix("\\\\") {
            Some(unc) => format!("\\\\?\\UNC\\{}", unc),
            None if self.segments[0] == UNIX_ROOT => display,
            None => format!("\\\\?\\{}", display),
        }
    }

    /// The path below the volume, with a leading separator: `\a\b` for
    /// both `C:\a\b` and `\\server\share\a\b`.
    pub fn volume_relative(&self) -> String {
        let separator = if self.segments[0] == UNIX_ROOT { "/" } else { "\\" };
        format!("{}{}", separator, self.segments[1..].join(separator))
    }
}

impl std::fmt::Display for VirtualPathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = &self.segments[0];
        let rest = &self.segments[1..];
        if root == UNIX_ROOT {
            write!(f, "/{}", rest.join("/"))
        } else if root.starts_with("\\\\") {
            // UNC roots have no trailing separator of their own.
            f.write_str(root)?;
            for segment in rest {
                write!(f, "\\{}", segment)?;
            }
            Ok(())
        } else {
            write!(f, "{}\\{}", root, rest.join("\\"))
        }
    }
}

impl PartialEq for VirtualPathKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for VirtualPathKey {}

impl Hash for VirtualPathKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl PartialOrd for VirtualPathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualPathKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded.cmp(&other.folded)
    }
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn drive_prefix(s: &str) -> Option<(String, &str)> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let rest = &s[2..];
        if rest.is_empty() || rest.starts_with('\\') || rest.starts_with('/') {
            return Some((format!("{}:", (bytes[0] as char).to_ascii_uppercase()), rest));
        }
    }
    None
}

fn unc_prefix<'a>(raw: &str, s: &'a str) -> Result<(String, &'a str)> {
    let mut parts = s.splitn(3, |c| c == '\\' || c == '/');
    let server = parts.next().unwrap_or_default();
    let share = parts.next().unwrap_or_default();
    if server.is_empty() || share.is_empty() {
        return Err(VfsError::invalid_path(raw, InvalidPathReason::NotAbsolute));
    }
    let rest = parts.next().unwrap_or_default();
    Ok((format!("\\\\{}\\{}", server, share), rest))
}

fn split_root(raw: &str) -> Result<(String, &str, Style)> {
    for prefix in ["\\??\\", "\\\\?\\"] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            if starts_with_ignore_case(rest, "UNC\\") {
                let (root, rest) = unc_prefix(raw, &rest[4..])?;
                return Ok((root, rest, Style::Verbatim));
            }
            return match drive_prefix(rest) {
                Some((root, rest)) => Ok((root, rest, Style::Verbatim)),
                None => Err(VfsError::invalid_path(
                    raw,
                    InvalidPathReason::UnsupportedNamespace,
                )),
            };
        }
    }
    if let Some(rest) = raw.strip_prefix("\\\\.\\") {
        return match drive_prefix(rest) {
            Some((root, rest)) => Ok((root, rest, Style::Dos)),
            None => Err(VfsError::invalid_path(
                raw,
                InvalidPathReason::UnsupportedNamespace,
            )),
        };
    }
    if let Some((root, rest)) = drive_prefix(raw) {
        return Ok((root, rest, Style::Dos));
    }
    if let Some(rest) = raw
        .strip_prefix("\\\\")
        .or_else(|| raw.strip_prefix("//"))
    {
        let (root, rest) = unc_prefix(raw, rest)?;
        return Ok((root, rest, Style::Dos));
    }
    if cfg!(unix) && raw.starts_with('/') {
        return Ok((UNIX_ROOT.to_owned(), &raw[1..], Style::Unix));
    }
    Err(VfsError::invalid_path(raw, InvalidPathReason::NotAbsolute))
}

fn check_component(raw: &str, name: &str, style: Style) -> Result<()> {
    if name.encode_utf16().count() > MAX_COMPONENT_LENGTH {
        return Err(VfsError::invalid_path(
            raw,
            InvalidPathReason::ComponentTooLong,
        ));
    }
    if style == Style::Unix {
        return match name.contains('\0') {
            true => Err(VfsError::invalid_path(
                raw,
                InvalidPathReason::IllegalCharacter,
            )),
            false => Ok(()),
        };
    }
    if name
        .chars()
        .any(|c| (c as u32) < 0x20 || matches!(c, '<' | '>' | '"' | '|' | '?' | '*'))
    {
        return Err(VfsError::invalid_path(
            raw,
            InvalidPathReason::IllegalCharacter,
        ));
    }
    if style == Style::Dos {
        let stem = name.split('.').next().unwrap_or(name).trim_end();
        if RESERVED_DEVICE_NAMES
            .iter()
            .any(|device| device.eq_ignore_ascii_case(stem))
        {
            return Err(VfsError::invalid_path(raw, InvalidPathReason::ReservedName));
        }
    }
    Ok(())
}
