//! Resource resolution and preloading
//!
//! Maps relative media references to preloaded assets. A reference is a
//! semicolon-separated fallback list; each fallback may begin with `*` to
//! pick one match at random from a wildcard scan across installed app
//! bundles. Plain fallbacks are probed locale-first (`<app>/<type>/<locale>/
//! <file>` then `<app>/<type>/<file>`), first against the app named by the
//! reference, then across every installed app. Absolute paths are rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::hardware::AudioClip;

/// Errors from resource resolution
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("absolute resource path rejected: {0}")]
    AbsolutePath(String),

    #[error("no fallback matched for '{0}'")]
    NotFound(String),

    #[error("IO error reading '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// A preloaded opaque asset handle.
#[derive(Debug, Clone)]
pub struct Asset {
    pub name: String,
    pub data: Arc<Vec<u8>>,
}

impl Asset {
    /// View the asset as a playable clip, sniffing the duration from the
    /// WAV header when there is one.
    pub fn as_clip(&self) -> AudioClip {
        AudioClip {
            name: self.name.clone(),
            data: Arc::clone(&self.data),
            duration: wav_duration(&self.data).unwrap_or(Duration::from_secs(1)),
        }
    }
}

/// Locale-aware resolver over a media root of per-app asset bundles.
pub struct ResourceResolver {
    root: PathBuf,
    locale: RwLock<String>,
    rng: Mutex<StdRng>,
    cache: RwLock<HashMap<PathBuf, Arc<Vec<u8>>>>,
}

impl ResourceResolver {
    pub fn new(root: impl Into<PathBuf>, locale: impl Into<String>, seed: u64) -> Self {
        Self {
            root: root.into(),
            locale: RwLock::new(locale.into()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Swap the active locale (config-update service=locale).
    pub async fn set_locale(&self, locale: impl Into<String>) {
        let locale = locale.into();
        debug!("resolver locale set to {}", locale);
        *self.locale.write().await = locale;
    }

    pub async fn locale(&self) -> String {
        self.locale.read().await.clone()
    }

    /// Resolve one reference to a preloaded asset.
    pub async fn resolve(&self, reference: &str) -> Result<Asset, ResolveError> {
        for fallback in reference.split(';') {
            let fallback = fallback.trim();
            if fallback.is_empty() {
                continue;
            }
            if Path::new(fallback).is_absolute() {
                return Err(ResolveError::AbsolutePath(fallback.to_string()));
            }

            let path = if let Some(remainder) = fallback.strip_prefix('*') {
                self.pick_wildcard(remainder.trim_start_matches('/')).await
            } else {
                self.probe(fallback).await
            };

            if let Some(path) = path {
                return self.preload(&path, fallback).await;
            }
        }
        Err(ResolveError::NotFound(reference.to_string()))
    }

    /// Resolve an ordered audio list; every reference must land.
    pub async fn resolve_audio(&self, references: &[String]) -> Result<Vec<AudioClip>, ResolveError> {
        let mut clips = Vec::with_capacity(references.len());
        for reference in references {
            clips.push(self.resolve(reference).await?.as_clip());
        }
        Ok(clips)
    }

    /// Probe a plain fallback: locale-first inside the referenced app, then
    /// across every installed app bundle.
    async fn probe(&self, fallback: &str) -> Option<PathBuf> {
        let locale = self.locale.read().await.clone();

        for candidate in localized_candidates(fallback, &locale) {
            let path = self.root.join(&candidate);
            if fs::metadata(&path).await.is_ok() {
                return Some(path);
            }
        }

        // The reference's own app did not have it; scan the other bundles.
        let mut apps = fs::read_dir(&self.root).await.ok()?;
        while let Ok(Some(entry)) = apps.next_entry().await {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            for candidate in localized_candidates(fallback, &locale) {
                // Re-root the app-relative remainder under this bundle
                let remainder: PathBuf = Path::new(&candidate).components().skip(1).collect();
                let path = entry.path().join(&remainder);
                if fs::metadata(&path).await.is_ok() {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Expand a `*` fallback across app bundles and pick one match.
    async fn pick_wildcard(&self, remainder: &str) -> Option<PathBuf> {
        let (dir_part, file_pattern) = match remainder.rsplit_once('/') {
            Some((dir, file)) => (dir, file),
            None => ("", remainder),
        };

        let mut matches = Vec::new();
        let mut apps = fs::read_dir(&self.root).await.ok()?;
        while let Ok(Some(app)) = apps.next_entry().await {
            if !app.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dir = if dir_part.is_empty() { app.path() } else { app.path().join(dir_part) };
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                if is_file && wildcard_match(file_pattern, &name) {
                    matches.push(entry.path());
                }
            }
        }

        if matches.is_empty() {
            return None;
        }
        matches.sort();
        let index = self.rng.lock().await.gen_range(0..matches.len());
        Some(matches[index].clone())
    }

    async fn preload(&self, path: &Path, name: &str) -> Result<Asset, ResolveError> {
        if let Some(data) = self.cache.read().await.get(path) {
            return Ok(Asset { name: name.to_string(), data: Arc::clone(data) });
        }

        let bytes = fs::read(path).await.map_err(|source| ResolveError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let data = Arc::new(bytes);
        self.cache.write().await.insert(path.to_path_buf(), Arc::clone(&data));
        Ok(Asset { name: name.to_string(), data })
    }
}

/// `<app>/<type>/<locale>/<file>` then `<app>/<type>/<file>`.
fn localized_candidates(fallback: &str, locale: &str) -> Vec<String> {
    let mut candidates = Vec::with_capacity(2);
    if let Some((dir, file)) = fallback.rsplit_once('/') {
        candidates.push(format!("{}/{}/{}", dir, locale, file));
    }
    candidates.push(fallback.to_string());
    candidates
}

/// Minimal `*` glob over a single path component.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let mut rest = name;
    let mut segments = pattern.split('*').peekable();

    // First segment must anchor at the start unless the pattern opens with *
    if !pattern.starts_with('*') {
        let first = segments.next().unwrap_or("");
        if !rest.starts_with(first) {
            return false;
        }
        rest = &rest[first.len()..];
    }

    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            continue;
        }
        if segments.peek().is_none() && !pattern.ends_with('*') {
            // Last segment must anchor at the end
            return rest.ends_with(segment);
        }
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }
    true
}

/// Read the playback duration from a canonical RIFF/WAVE header.
fn wav_duration(data: &[u8]) -> Option<Duration> {
    if data.len() < 44 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return None;
    }
    let channels = u16::from_le_bytes([data[22], data[23]]) as u64;
    let sample_rate = u32::from_le_bytes([data[24], data[25], data[26], data[27]]) as u64;
    let bits = u16::from_le_bytes([data[34], data[35]]) as u64;
    if channels == 0 || sample_rate == 0 || bits == 0 {
        return None;
    }

    // Scan chunks for "data"
    let mut offset = 12;
    while offset + 8 <= data.len() {
        let id = &data[offset..offset + 4];
        let size = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as u64;
        if id == b"data" {
            let bytes_per_second = sample_rate * channels * bits / 8;
            if bytes_per_second == 0 {
                return None;
            }
            let micros = size.saturating_mul(1_000_000) / bytes_per_second;
            return Some(Duration::from_micros(micros));
        }
        offset += 8 + size as usize + (size as usize % 2);
    }
    warn!("WAV file without data chunk");
    None
}
