//! Content-addressed store of resized/re-encoded image variants.
//!
//! Entries live in `cache_dir/objects/` named `<fp>-<w>x<h>-<fmt>` where
//! `<fp>` fingerprints the source file (path, mtime, size). Files are never
//! rewritten in place: writers encode into `tmp-*` files in the same
//! directory and atomically rename into place, so concurrent producers of
//! the same variant are idempotent and lookups never see partial data.

use crate::cache::optimizer::{self, CacheFormat};
use crate::id::fingerprint::source_fingerprint;
use crate::utils::{IkupError, Result};
use image::GenericImageView;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TranscodeEntry {
    pub source_fingerprint: String,
    pub width: u32,
    pub height: u32,
    pub format: CacheFormat,
    pub byte_size: u64,
    pub path: PathBuf,
    pub atime_us: i64,
}

/// What a conversion must satisfy. `max_bytes` excludes explicit
/// dimensions; everything absent falls back to the source.
#[derive(Debug, Clone, Default)]
pub struct Constraint {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub max_bytes: Option<u64>,
    pub format: Option<CacheFormat>,
    pub quality: Option<u8>,
}

impl Constraint {
    pub fn validate(&self) -> Result<()> {
        if self.width.is_none()
            && self.height.is_none()
            && self.max_bytes.is_none()
            && self.format.is_none()
        {
            return Err(IkupError::invalid_arg(
                "no conversion parameters specified (need width, height, size, format or max-bytes)",
            ));
        }
        if self.max_bytes.is_some() && (self.width.is_some() || self.height.is_some()) {
            return Err(IkupError::invalid_arg(
                "cannot combine max-bytes with explicit dimensions",
            ));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(IkupError::invalid_arg("dimensions must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CacheHit {
    pub entry: TranscodeEntry,
    /// The entry is the 1x1 minimum and still exceeds the requested cap.
    pub impossible: bool,
}

#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub directory: PathBuf,
    pub count: u64,
    pub total_bytes: u64,
    pub max_images: u64,
    pub max_total_bytes: u64,
}

pub struct TranscodeCache {
    objects_dir: PathBuf,
    tolerance: f64,
    max_images: u64,
    max_total_bytes: u64,
    cleanup_target: f64,
}

impl TranscodeCache {
    pub fn new(
        cache_dir: &Path,
        tolerance: f64,
        max_images: u64,
        max_total_bytes: u64,
        cleanup_target: f64,
    ) -> Result<Self> {
        let objects_dir = cache_dir.join("objects");
        std::fs::create_dir_all(&objects_dir)?;
        Ok(Self {
            objects_dir,
            tolerance,
            max_images,
            max_total_bytes,
            cleanup_target: cleanup_target.clamp(0.1, 1.0),
        })
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    fn entry_path(&self, fp: &str, width: u32, height: u32, format: CacheFormat) -> PathBuf {
        self.objects_dir
            .join(format!("{}-{}x{}-{}", fp, width, height, format.ext()))
    }

    fn parse_entry(&self, path: &Path) -> Option<TranscodeEntry> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with("tmp-") {
            return None;
        }
        // <fp>-<w>x<h>-<fmt>
        let mut parts = name.rsplitn(3, '-');
        let format: CacheFormat = parts.next()?.parse().ok()?;
        let dims = parts.next()?;
        let fp = parts.next()?;
        let (w, h) = dims.split_once('x')?;
        let width: u32 = w.parse().ok()?;
        let height: u32 = h.parse().ok()?;
        let meta = std::fs::metadata(path).ok()?;
        let atime = meta
            .accessed()
            .or_else(|_| meta.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Some(TranscodeEntry {
            source_fingerprint: fp.to_string(),
            width,
            height,
            format,
            byte_size: meta.len(),
            path: path.to_path_buf(),
            atime_us: atime,
        })
    }

    fn entries(&self, fp: Option<&str>) -> Result<Vec<TranscodeEntry>> {
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&self.objects_dir)? {
            let path = dirent?.path();
            if let Some(entry) = self.parse_entry(&path) {
                if fp.map(|fp| entry.source_fingerprint == fp).unwrap_or(true) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Resolve the concrete output dimensions a constraint asks for, given
    /// the source's pixel dimensions. One-sided constraints keep aspect.
    fn resolve_dims(&self, constraint: &Constraint, src: (u32, u32)) -> (u32, u32) {
        let (src_w, src_h) = src;
        match (constraint.width, constraint.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => (
                w,
                ((src_h as u64 * w as u64) / src_w.max(1) as u64).max(1) as u32,
            ),
            (None, Some(h)) => (
                ((src_w as u64 * h as u64) / src_h.max(1) as u64).max(1) as u32,
                h,
            ),
            (None, None) => (src_w, src_h),
        }
    }

    /// Verify an entry's file against its metadata; corrupt entries are
    /// deleted and reported with a warning.
    fn verify(&self, entry: &TranscodeEntry) -> bool {
        match image::image_dimensions(&entry.path) {
            Ok((w, h)) if (w, h) == (entry.width, entry.height) => true,
            Ok((w, h)) => {
                log::warn!(
                    "Corrupt cache entry {}: file is {}x{}, expected {}x{}",
                    entry.path.display(),
                    w,
                    h,
                    entry.width,
                    entry.height
                );
                let _ = std::fs::remove_file(&entry.path);
                false
            }
            Err(err) => {
                log::warn!("Corrupt cache entry {}: {}", entry.path.display(), err);
                let _ = std::fs::remove_file(&entry.path);
                false
            }
        }
    }

    /// Look up an entry satisfying `constraint` without ever encoding.
    ///
    /// Explicit dimensions match exactly; a `max_bytes` constraint matches
    /// the biggest entry under the cap that is either a full-source copy or
    /// was itself produced near the cap (within tolerance); the 1x1 entry
    /// matches any cap and carries the impossibility flag when it exceeds
    /// it.
    pub fn check(&self, source: &Path, constraint: &Constraint) -> Result<Option<CacheHit>> {
        constraint.validate()?;
        let fp = source_fingerprint(source).hex();
        let candidates = self.entries(Some(&fp))?;
        if candidates.is_empty() {
            return Ok(None);
        }
        let src_dims = image::image_dimensions(source).ok();
        let format = constraint
            .format
            .unwrap_or_else(|| CacheFormat::from_source(source));

        if let Some(max_bytes) = constraint.max_bytes {
            let floor = (max_bytes as f64 * (1.0 - self.tolerance)) as u64;
            let mut matching: Vec<TranscodeEntry> = candidates
                .into_iter()
                .filter(|e| e.format == format)
                .filter(|e| e.byte_size <= max_bytes || (e.width, e.height) == (1, 1))
                .filter(|e| {
                    let full = src_dims.map(|d| d == (e.width, e.height)).unwrap_or(false);
                    e.byte_size >= floor || full || (e.width, e.height) == (1, 1)
                })
                .collect();
            matching.sort_by(|a, b| {
                // Prefer anything under the cap, largest first; the 1x1
                // over-cap entry only wins when nothing else matches.
                let a_over = a.byte_size > max_bytes;
                let b_over = b.byte_size > max_bytes;
                a_over.cmp(&b_over).then(b.byte_size.cmp(&a.byte_size))
            });
            for entry in matching {
                if self.verify(&entry) {
                    let impossible =
                        (entry.width, entry.height) == (1, 1) && entry.byte_size > max_bytes;
                    return Ok(Some(CacheHit { entry, impossible }));
                }
            }
            return Ok(None);
        }

        // Dimension/format constraints: exact equality on what the caller
        // specified, other dimensions unconstrained.
        let mut matching: Vec<TranscodeEntry> = candidates
            .into_iter()
            .filter(|e| constraint.format.map(|f| e.format == f).unwrap_or(e.format == format))
            .filter(|e| constraint.width.map(|w| e.width == w).unwrap_or(true))
            .filter(|e| constraint.height.map(|h| e.height == h).unwrap_or(true))
            .filter(|e| {
                if constraint.width.is_none() && constraint.height.is_none() {
                    // Format-only conversions target the source dimensions.
                    src_dims.map(|d| d == (e.width, e.height)).unwrap_or(true)
                } else {
                    true
                }
            })
            .collect();
        matching.sort_by_key(|e| e.byte_size);
        for entry in matching {
            if self.verify(&entry) {
                return Ok(Some(CacheHit {
                    entry,
                    impossible: false,
                }));
            }
        }
        Ok(None)
    }

    /// Convert `source` so that `constraint` holds, reusing a cached
    /// variant when one exists. Many processes may convert the same pair
    /// concurrently; whoever renames last wins and the result is shared.
    pub fn convert(&self, source: &Path, constraint: &Constraint) -> Result<CacheHit> {
        constraint.validate()?;
        if !source.exists() {
            return Err(IkupError::path_gone(source.display().to_string()));
        }
        if let Some(hit) = self.check(source, constraint)? {
            log::debug!("Cache hit for {}: {}", source.display(), hit.entry.path.display());
            return Ok(hit);
        }

        let fp = source_fingerprint(source).hex();
        let format = constraint
            .format
            .unwrap_or_else(|| CacheFormat::from_source(source));

        let (data, width, height, impossible) = if let Some(max_bytes) = constraint.max_bytes {
            // A source already within budget and in the target format is
            // used as-is (scale = 1).
            let src_size = std::fs::metadata(source)?.len();
            if src_size <= max_bytes && format.matches_source(source) {
                let (w, h) = image::image_dimensions(source)?;
                (std::fs::read(source)?, w, h, false)
            } else {
                let img = image::open(source)?;
                let out = optimizer::optimize_to_size(
                    &img,
                    format,
                    constraint.quality,
                    max_bytes,
                    self.tolerance,
                )?;
                if out.impossible {
                    log::warn!(
                        "Cannot fit {} into {} bytes; keeping the 1x1 minimum",
                        source.display(),
                        max_bytes
                    );
                }
                (out.data, out.width, out.height, out.impossible)
            }
        } else {
            let img = image::open(source)?;
            let (w, h) = self.resolve_dims(constraint, img.dimensions());
            let data = if (w, h) == img.dimensions() && format.matches_source(source) {
                std::fs::read(source)?
            } else {
                optimizer::resize_encode(&img, w, h, format, constraint.quality)?
            };
            (data, w, h, false)
        };

        let final_path = self.entry_path(&fp, width, height, format);
        self.write_atomically(&final_path, &data)?;
        self.evict_if_needed()?;

        let entry = self.parse_entry(&final_path).ok_or_else(|| {
            IkupError::cache_corrupt(format!("just-written entry vanished: {}", final_path.display()))
        })?;
        Ok(CacheHit { entry, impossible })
    }

    fn write_atomically(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix("tmp-")
            .tempfile_in(&self.objects_dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| IkupError::Io(e.error))?;
        log::debug!("Cached {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    pub fn list(&self, source: Option<&Path>) -> Result<Vec<TranscodeEntry>> {
        let fp = source.map(|s| source_fingerprint(s).hex());
        let mut entries = self.entries(fp.as_deref())?;
        entries.sort_by_key(|e| e.atime_us);
        Ok(entries)
    }

    /// Remove entries for `source` matching the optional filters. Returns
    /// the number of removed files.
    pub fn remove(
        &self,
        source: &Path,
        width: Option<u32>,
        height: Option<u32>,
        format: Option<CacheFormat>,
    ) -> Result<usize> {
        let fp = source_fingerprint(source).hex();
        let mut removed = 0;
        for entry in self.entries(Some(&fp))? {
            if width.map(|w| entry.width == w).unwrap_or(true)
                && height.map(|h| entry.height == h).unwrap_or(true)
                && format.map(|f| entry.format == f).unwrap_or(true)
            {
                std::fs::remove_file(&entry.path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove every cached variant (and stray temp files).
    pub fn purge(&self) -> Result<usize> {
        let mut removed = 0;
        for dirent in std::fs::read_dir(&self.objects_dir)? {
            let path = dirent?.path();
            if path.is_file() && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let entries = self.entries(None)?;
        Ok(CacheStatus {
            directory: self.objects_dir.clone(),
            count: entries.len() as u64,
            total_bytes: entries.iter().map(|e| e.byte_size).sum(),
            max_images: self.max_images,
            max_total_bytes: self.max_total_bytes,
        })
    }

    /// Evict down to the cleanup target and sweep abandoned temp files.
    pub fn cleanup(&self) -> Result<usize> {
        let removed = self.evict_to(
            (self.max_images as f64 * self.cleanup_target) as u64,
            (self.max_total_bytes as f64 * self.cleanup_target) as u64,
        )?;
        let now = std::time::SystemTime::now();
        for dirent in std::fs::read_dir(&self.objects_dir)? {
            let path = dirent?.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("tmp-"))
                .unwrap_or(false);
            if !is_tmp {
                continue;
            }
            // Interrupted writers leave temp files behind; anything old
            // enough cannot still be in flight.
            let abandoned = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .map(|age| age > Duration::from_secs(3600))
                .unwrap_or(false);
            if abandoned {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(removed)
    }

    fn evict_if_needed(&self) -> Result<()> {
        let status = self.status()?;
        if status.count > self.max_images || status.total_bytes > self.max_total_bytes {
            self.evict_to(
                (self.max_images as f64 * self.cleanup_target) as u64,
                (self.max_total_bytes as f64 * self.cleanup_target) as u64,
            )?;
        }
        Ok(())
    }

    fn evict_to(&self, max_count: u64, max_bytes: u64) -> Result<usize> {
        let mut entries = self.entries(None)?;
        entries.sort_by_key(|e| e.atime_us);
        let mut count = entries.len() as u64;
        let mut total: u64 = entries.iter().map(|e| e.byte_size).sum();
        let mut removed = 0;
        for entry in entries {
            if count <= max_count && total <= max_bytes {
                break;
            }
            if std::fs::remove_file(&entry.path).is_ok() {
                log::debug!("Evicted cache entry {}", entry.path.display());
                count -= 1;
                total = total.saturating_sub(entry.byte_size);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn write_test_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            let v = x.wrapping_mul(2654435761).wrapping_add(y.wrapping_mul(40503));
            image::Rgba([(v & 0xFF) as u8, ((v >> 8) & 0xFF) as u8, ((v >> 16) & 0xFF) as u8, 255])
        });
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    fn cache(dir: &Path) -> TranscodeCache {
        TranscodeCache::new(dir, 0.2, 1000, 100 * 1024 * 1024, 0.8).unwrap()
    }

    #[test]
    fn test_convert_with_width_keeps_aspect() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_test_image(dir.path(), "src.png", 64, 32);
        let cache = cache(dir.path());
        let hit = cache
            .convert(
                &src,
                &Constraint {
                    width: Some(32),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!((hit.entry.width, hit.entry.height), (32, 16));
        assert!(hit.entry.path.exists());
        assert_eq!(hit.entry.format, CacheFormat::Png);
        assert_eq!(
            hit.entry.byte_size,
            std::fs::metadata(&hit.entry.path).unwrap().len()
        );
    }

    #[test]
    fn test_check_returns_converted_path() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_test_image(dir.path(), "src.png", 64, 64);
        let cache = cache(dir.path());
        let constraint = Constraint {
            width: Some(16),
            height: Some(16),
            ..Default::default()
        };
        assert!(cache.check(&src, &constraint).unwrap().is_none());
        let converted = cache.convert(&src, &constraint).unwrap();
        let checked = cache.check(&src, &constraint).unwrap().unwrap();
        assert_eq!(checked.entry.path, converted.entry.path);
        // A repeated convert short-circuits to the same file.
        let again = cache.convert(&src, &constraint).unwrap();
        assert_eq!(again.entry.path, converted.entry.path);
    }

    #[test]
    fn test_max_bytes_cap_and_impossible_flag() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_test_image(dir.path(), "src.png", 64, 64);
        let cache = cache(dir.path());

        // A generous cap keeps the source as-is.
        let big = cache
            .convert(
                &src,
                &Constraint {
                    max_bytes: Some(1_000_000),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!big.impossible);
        assert_eq!((big.entry.width, big.entry.height), (64, 64));
        let checked = cache
            .check(
                &src,
                &Constraint {
                    max_bytes: Some(1_000_000),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(checked.entry.path, big.entry.path);

        // No entry satisfies a much smaller cap.
        assert!(cache
            .check(
                &src,
                &Constraint {
                    max_bytes: Some(200),
                    ..Default::default()
                },
            )
            .unwrap()
            .is_none());

        // An impossible cap produces (and then finds) the 1x1 entry.
        let tiny = cache
            .convert(
                &src,
                &Constraint {
                    max_bytes: Some(20),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(tiny.impossible);
        assert_eq!((tiny.entry.width, tiny.entry.height), (1, 1));
        let found = cache
            .check(
                &src,
                &Constraint {
                    max_bytes: Some(20),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(found.impossible);
        assert_eq!(found.entry.path, tiny.entry.path);
    }

    #[test]
    fn test_constraint_validation() {
        assert!(Constraint::default().validate().is_err());
        assert!(Constraint {
            max_bytes: Some(10),
            width: Some(5),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(Constraint {
            width: Some(5),
            ..Default::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_corrupt_entry_is_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_test_image(dir.path(), "src.png", 32, 32);
        let cache = cache(dir.path());
        let constraint = Constraint {
            width: Some(16),
            height: Some(16),
            ..Default::default()
        };
        let hit = cache.convert(&src, &constraint).unwrap();
        std::fs::write(&hit.entry.path, b"not an image").unwrap();
        assert!(cache.check(&src, &constraint).unwrap().is_none());
        assert!(!hit.entry.path.exists());
        // The next convert recreates it.
        let again = cache.convert(&src, &constraint).unwrap();
        assert!(again.entry.path.exists());
    }

    #[test]
    fn test_remove_purge_status() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_test_image(dir.path(), "src.png", 32, 32);
        let cache = cache(dir.path());
        for w in [8u32, 12, 16] {
            cache
                .convert(
                    &src,
                    &Constraint {
                        width: Some(w),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        assert_eq!(cache.status().unwrap().count, 3);
        assert_eq!(cache.list(Some(&src)).unwrap().len(), 3);
        assert_eq!(cache.remove(&src, Some(8), None, None).unwrap(), 1);
        assert_eq!(cache.status().unwrap().count, 2);
        assert_eq!(cache.purge().unwrap(), 2);
        assert_eq!(cache.status().unwrap().count, 0);
    }

    #[test]
    fn test_eviction_bounds_count() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_test_image(dir.path(), "src.png", 48, 48);
        let cache = TranscodeCache::new(dir.path(), 0.2, 4, 100 * 1024 * 1024, 0.5).unwrap();
        for w in [8u32, 10, 12, 14, 16, 18, 20] {
            cache
                .convert(
                    &src,
                    &Constraint {
                        width: Some(w),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        assert!(cache.status().unwrap().count <= 4);
    }

    #[test]
    fn test_source_change_misses() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_test_image(dir.path(), "src.png", 32, 32);
        let cache = cache(dir.path());
        let constraint = Constraint {
            width: Some(16),
            height: Some(16),
            ..Default::default()
        };
        cache.convert(&src, &constraint).unwrap();
        // Rewriting the source changes its fingerprint.
        write_test_image(dir.path(), "src.png", 40, 40);
        assert!(cache.check(&src, &constraint).unwrap().is_none());
    }
}
