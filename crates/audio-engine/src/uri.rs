//! Source locator resolution.
//!
//! Turns the URI handed to `load` into something the decoder can open:
//! - `file://` URIs are percent-decoded (`+` is a space) into a filesystem path
//! - bare paths are used as-is
//! - `http(s)://` sources are fetched into memory up front

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use symphonia::core::io::MediaSource;

const FILE_SCHEME: &str = "file://";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A resolved, re-openable media source.
///
/// Re-openable matters: the decoder may probe the same source twice.
#[derive(Clone, Debug)]
pub enum SourceLocator {
    File(PathBuf),
    Memory {
        bytes: Arc<[u8]>,
        extension: Option<String>,
        label: String,
    },
}

impl SourceLocator {
    /// Open a fresh reader positioned at the start of the source.
    pub fn media_source(&self) -> Result<Box<dyn MediaSource>> {
        match self {
            Self::File(path) => {
                let file = File::open(path).with_context(|| format!("open {:?}", path))?;
                Ok(Box::new(file))
            }
            Self::Memory { bytes, .. } => Ok(Box::new(Cursor::new(bytes.clone()))),
        }
    }

    /// Container hint (lower-cased file extension), when one is known.
    pub fn extension(&self) -> Option<String> {
        match self {
            Self::File(path) => extension_of(path),
            Self::Memory { extension, .. } => extension.clone(),
        }
    }

    /// Human-readable label for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory { label, .. } => label.clone(),
        }
    }
}

/// Resolve a `load` URI into a [`SourceLocator`].
pub fn resolve(uri: &str) -> Result<SourceLocator> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(anyhow!("empty source uri"));
    }
    if let Some(rest) = strip_prefix_ignore_case(uri, FILE_SCHEME) {
        return Ok(SourceLocator::File(file_uri_to_path(rest)));
    }
    if strip_prefix_ignore_case(uri, "http://").is_some()
        || strip_prefix_ignore_case(uri, "https://").is_some()
    {
        return fetch_http(uri);
    }
    Ok(SourceLocator::File(PathBuf::from(uri)))
}

/// Percent-decode a URI component, treating `+` as a space.
///
/// Malformed escapes are passed through unchanged; invalid UTF-8 is replaced lossily.
pub fn percent_decode(encoded: &str) -> String {
    let spaced = encoded.replace('+', " ");
    let bytes = urlencoding::decode_binary(spaced.as_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}

fn file_uri_to_path(rest: &str) -> PathBuf {
    let rest = strip_prefix_ignore_case(rest, "localhost").unwrap_or(rest);
    let decoded = percent_decode(rest);
    PathBuf::from(windows_drive_fixup(&decoded))
}

/// `file:///C:/x` decodes to `/C:/x`; drop the leading slash before a drive letter.
#[cfg(windows)]
fn windows_drive_fixup(path: &str) -> String {
    let b = path.as_bytes();
    if b.len() >= 3 && b[0] == b'/' && b[1].is_ascii_alphabetic() && b[2] == b':' {
        path[1..].to_string()
    } else {
        path.to_string()
    }
}

#[cfg(not(windows))]
fn windows_drive_fixup(path: &str) -> String {
    path.to_string()
}

fn fetch_http(url: &str) -> Result<SourceLocator> {
    let start = std::time::Instant::now();
    let resp = ureq::get(url)
        .config()
        .timeout_per_call(Some(HTTP_TIMEOUT))
        .build()
        .call()
        .with_context(|| format!("http request {url}"))?;

    let mut buf = Vec::new();
    let (_, body) = resp.into_parts();
    body.into_reader()
        .read_to_end(&mut buf)
        .with_context(|| format!("http read {url}"))?;
    tracing::info!(
        url = url,
        bytes = buf.len(),
        took_ms = start.elapsed().as_millis() as u64,
        "fetched remote source"
    );

    let path_part = url.split(['?', '#']).next().unwrap_or(url);
    Ok(SourceLocator::Memory {
        bytes: Arc::from(buf),
        extension: extension_of(Path::new(path_part)),
        label: url.to_string(),
    })
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
