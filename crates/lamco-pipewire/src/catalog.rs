//! Format/modifier catalog
//!
//! Holds, per pixel format, the modifiers the local graphics stack can
//! import, in priority order. A modifier that fails to import is pruned and
//! never offered again for the lifetime of the table.

use drm_fourcc::DrmFourcc;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::format::{PixelFormat, DRM_FORMAT_MOD_INVALID};

/// Formats offered in render-surface mode, in preference order
pub const RENDER_SURFACE_FORMATS: [PixelFormat; 4] =
    [PixelFormat::BGRA, PixelFormat::RGBA, PixelFormat::BGRx, PixelFormat::RGBx];

/// Formats offered in raw-frame mode
pub const RAW_FRAME_FORMATS: [PixelFormat; 2] = [PixelFormat::RGBA, PixelFormat::YUY2];

/// Asks the graphics layer which modifiers it can import
pub trait ModifierQuery {
    /// Importable modifiers for `fourcc`, most specific first
    ///
    /// `None` when the query itself failed.
    fn query_modifiers(&self, fourcc: DrmFourcc) -> Option<Vec<u64>>;
}

/// One catalog row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub format: PixelFormat,
    pub fourcc: DrmFourcc,
    /// Remaining modifiers, priority order
    pub modifiers: Vec<u64>,
}

/// Per-session modifier table
///
/// Only ever shrinks.
#[derive(Debug, Clone, Default)]
pub struct ModifierTable {
    entries: Vec<CatalogEntry>,
    pruned: HashSet<(PixelFormat, u64)>,
}

impl ModifierTable {
    /// Build a table for `formats`
    ///
    /// Without a query every format is modifier-less. A successful query is
    /// de-duplicated and gets [`DRM_FORMAT_MOD_INVALID`] appended so the
    /// producer may also pick an implicit layout. A failed query yields only
    /// the sentinel.
    pub fn new(formats: &[PixelFormat], query: Option<&dyn ModifierQuery>) -> Self {
        let entries = formats
            .iter()
            .map(|&format| {
                let fourcc = format.drm_fourcc();
                let modifiers = match query {
                    None => Vec::new(),
                    Some(query) => query_one(query, format, fourcc),
                };
                CatalogEntry { format, fourcc, modifiers }
            })
            .collect();

        Self { entries, pruned: HashSet::new() }
    }

    /// Table for render-surface mode
    pub fn for_render_surface(query: &dyn ModifierQuery) -> Self {
        let table = Self::new(&RENDER_SURFACE_FORMATS, Some(query));
        info!("Modifier catalog: {}", table.summary());
        table
    }

    /// Table for raw-frame mode, memory buffers only
    pub fn for_raw_frames() -> Self {
        Self::new(&RAW_FRAME_FORMATS, None)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Modifiers still offered for `format`
    pub fn modifiers_for(&self, format: PixelFormat) -> &[u64] {
        self.entries
            .iter()
            .find(|e| e.format == format)
            .map_or(&[], |e| e.modifiers.as_slice())
    }

    pub fn contains(&self, format: PixelFormat) -> bool {
        self.entries.iter().any(|e| e.format == format)
    }

    pub fn is_pruned(&self, format: PixelFormat, modifier: u64) -> bool {
        self.pruned.contains(&(format, modifier))
    }

    /// Permanently remove `modifier` for `format`
    ///
    /// Returns `true` if the modifier was still offered.
    pub fn prune(&mut self, format: PixelFormat, modifier: u64) -> bool {
        self.pruned.insert((format, modifier));

        let Some(entry) = self.entries.iter_mut().find(|e| e.format == format) else {
            return false;
        };

        let before = entry.modifiers.len();
        entry.modifiers.retain(|&m| m != modifier);
        let removed = entry.modifiers.len() != before;

        if removed {
            warn!(
                "Pruned modifier {:#x} for {} ({} left)",
                modifier,
                format,
                entry.modifiers.len()
            );
        }
        removed
    }

    fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}={}", e.format, e.modifiers.len()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn query_one(query: &dyn ModifierQuery, format: PixelFormat, fourcc: DrmFourcc) -> Vec<u64> {
    match query.query_modifiers(fourcc) {
        Some(found) => {
            let mut modifiers = Vec::with_capacity(found.len() + 1);
            for modifier in found {
                if modifier != DRM_FORMAT_MOD_INVALID && !modifiers.contains(&modifier) {
                    modifiers.push(modifier);
                }
            }
            modifiers.push(DRM_FORMAT_MOD_INVALID);
            debug!("{}: {} modifiers", format, modifiers.len());
            modifiers
        }
        None => {
            warn!("Modifier query failed for {}, offering implicit layout only", format);
            vec![DRM_FORMAT_MOD_INVALID]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedQuery;

    impl ModifierQuery for FixedQuery {
        fn query_modifiers(&self, fourcc: DrmFourcc) -> Option<Vec<u64>> {
            match fourcc {
                DrmFourcc::Argb8888 => Some(vec![0x100, 0x200, 0x100]),
                DrmFourcc::Abgr8888 => Some(Vec::new()),
                _ => None,
            }
        }
    }

    #[test]
    fn test_render_surface_table() {
        let table = ModifierTable::for_render_surface(&FixedQuery);

        assert_eq!(table.entries().len(), 4);
        assert_eq!(
            table.modifiers_for(PixelFormat::BGRA),
            &[0x100, 0x200, DRM_FORMAT_MOD_INVALID]
        );
        assert_eq!(table.modifiers_for(PixelFormat::RGBA), &[DRM_FORMAT_MOD_INVALID]);
        // Query failure
        assert_eq!(table.modifiers_for(PixelFormat::BGRx), &[DRM_FORMAT_MOD_INVALID]);
    }

    #[test]
    fn test_raw_table() {
        let table = ModifierTable::for_raw_frames();

        assert!(table.contains(PixelFormat::RGBA));
        assert!(table.contains(PixelFormat::YUY2));
        assert!(!table.contains(PixelFormat::BGRA));
        assert!(table.entries().iter().all(|e| e.modifiers.is_empty()));
    }

    #[test]
    fn test_prune_is_permanent() {
        let mut table = ModifierTable::for_render_surface(&FixedQuery);

        assert!(table.prune(PixelFormat::BGRA, 0x100));
        assert!(!table.prune(PixelFormat::BGRA, 0x100));
        assert_eq!(table.modifiers_for(PixelFormat::BGRA), &[0x200, DRM_FORMAT_MOD_INVALID]);

        assert!(table.is_pruned(PixelFormat::BGRA, 0x100));
        assert!(!table.modifiers_for(PixelFormat::BGRA).contains(&0x100));
    }

    #[test]
    fn test_prune_to_empty() {
        let mut table = ModifierTable::for_render_surface(&FixedQuery);

        table.prune(PixelFormat::RGBA, DRM_FORMAT_MOD_INVALID);
        assert!(table.modifiers_for(PixelFormat::RGBA).is_empty());
        assert!(table.contains(PixelFormat::RGBA));
    }

    #[test]
    fn test_sentinel_stays_last_after_prune() {
        let mut table = ModifierTable::for_render_surface(&FixedQuery);

        table.prune(PixelFormat::BGRA, 0x200);
        table.prune(PixelFormat::BGRx, 0x100);

        assert_eq!(table.modifiers_for(PixelFormat::BGRA), &[0x100, DRM_FORMAT_MOD_INVALID]);
        assert!(table
            .entries()
            .iter()
            .filter(|e| !e.modifiers.is_empty())
            .all(|e| e.modifiers.last() == Some(&DRM_FORMAT_MOD_INVALID)));
    }
}
