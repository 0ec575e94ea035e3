//! Persisted wallpaper selection.
//!
//! The store is the only place that knows which video is selected across
//! process restarts. It is passed explicitly to whoever needs it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use common::WallpaperSource;

/// Resolves and records which video should play.
pub trait WallpaperSelectionStore: Send + Sync {
    /// The active selection, or `None` meaning "use the bundled default".
    fn resolve_active_source(&self) -> Option<WallpaperSource>;

    /// Record a new selection. Called by the catalog side, never by the engine.
    fn persist(&self, source: &WallpaperSource) -> Result<()>;

    /// Report that `source` could not be opened.
    fn mark_unreachable(&self, source: &WallpaperSource);
}

/// Stores the selection as a small JSON file.
///
/// Unreachable sources are remembered in memory for the lifetime of the
/// process and skipped by [`resolve_active_source`](WallpaperSelectionStore::resolve_active_source)
/// until a new selection is persisted.
pub struct JsonSelectionStore {
    path: PathBuf,
    cached: RwLock<Option<WallpaperSource>>,
    unreachable: RwLock<HashSet<String>>,
}

impl JsonSelectionStore {
    /// Open the store, reading any existing selection.
    ///
    /// A missing or unreadable file is treated as "no selection".
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = match Self::read(&path) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("Ignoring selection file {}: {:#}", path.display(), e);
                None
            }
        };

        if let Some(ref source) = cached {
            log::info!("Restored selection '{}' ({})", source.name, source.locator);
        }

        Self {
            path,
            cached: RwLock::new(cached),
            unreachable: RwLock::new(HashSet::new()),
        }
    }

    fn read(path: &Path) -> Result<Option<WallpaperSource>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let source = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(source))
    }

    fn write(&self, source: &WallpaperSource) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Write then rename so a crash never leaves a torn file behind.
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(source)?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl WallpaperSelectionStore for JsonSelectionStore {
    fn resolve_active_source(&self) -> Option<WallpaperSource> {
        let source = self.cached.read().ok()?.clone()?;
        let unreachable = self.unreachable.read().ok()?;
        if unreachable.contains(&source.locator) {
            log::debug!("Selection {} is marked unreachable", source.locator);
            return None;
        }
        Some(source)
    }

    fn persist(&self, source: &WallpaperSource) -> Result<()> {
        self.write(source)?;

        if let Ok(mut unreachable) = self.unreachable.write() {
            unreachable.remove(&source.locator);
        }
        if let Ok(mut cached) = self.cached.write() {
            *cached = Some(source.clone());
        }

        log::info!("Persisted selection '{}' ({})", source.name, source.locator);
        Ok(())
    }

    fn mark_unreachable(&self, source: &WallpaperSource) {
        log::warn!(
            "Wallpaper '{}' is unreachable: {}",
            source.name,
            source.locator
        );
        if let Ok(mut unreachable) = self.unreachable.write() {
            unreachable.insert(source.locator.clone());
        }
    }
}
