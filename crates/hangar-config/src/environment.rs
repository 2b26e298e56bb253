//! Job environment resolution.
//!
//! Declared variables are stored as an opaque blob: `key=value` strings
//! joined by NUL, then base64-encoded. Decoding is lenient: entries that do
//! not look like `key=value` are dropped without error, and existing blobs
//! rely on that.
//!
//! Precedence, lowest first:
//! - build-level variables
//! - job-level variables
//! - project secret variables (only for builds not triggered by a pull request)

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hangar_core::build::Build;
use hangar_core::job::Job;
use hangar_core::project::Project;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::warn;

// Key has no whitespace or '='; value runs to the end of the line.
static ENTRY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s=]+)=([^\n]*)\n?$").unwrap());

/// Resolved environment, ordered by name.
pub type Environment = BTreeMap<String, String>;

/// Encode a list of strings as a NUL-joined, base64-encoded blob.
pub fn pack_string_list<S: AsRef<str>>(items: &[S]) -> String {
    let joined = items
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join("\0");
    STANDARD.encode(joined.as_bytes())
}

/// Decode a blob into its strings. Missing or empty blobs decode to nothing.
pub fn unpack_string_list(blob: Option<&str>) -> Vec<String> {
    let blob = match blob {
        Some(b) if !b.is_empty() => b,
        _ => return Vec::new(),
    };

    let bytes = match STANDARD.decode(blob.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "discarding undecodable environment blob");
            return Vec::new();
        }
    };

    bytes
        .split(|b| *b == 0)
        .filter_map(|item| std::str::from_utf8(item).ok())
        .map(str::to_string)
        .collect()
}

/// Encode variables as a blob, in iteration order.
pub fn pack_env<'a, I>(vars: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let items: Vec<String> = vars
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    pack_string_list(&items)
}

/// Decode a blob into variables. Later duplicates win.
pub fn unpack_env(blob: Option<&str>) -> Environment {
    let mut env = Environment::new();
    for item in unpack_string_list(blob) {
        if let Some(caps) = ENTRY_REGEX.captures(&item) {
            env.insert(caps[1].to_string(), caps[2].to_string());
        }
    }
    env
}

/// Compute the effective environment for `job`.
pub fn resolve_env(project: &Project, build: &Build, job: &Job) -> Environment {
    let mut env = unpack_env(build.env.as_deref());
    env.extend(unpack_env(job.env.as_deref()));
    if !build.is_pull_request() {
        env.extend(unpack_env(project.secret_env.as_deref()));
    }
    env
}
