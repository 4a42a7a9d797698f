//! Seeding of segments and scorings shipped as JSON files.
//!
//! Layout: `<root>/segments/*.json` and `<root>/scoring/*.json`, one
//! definition per file. A file that fails to parse or save is logged and
//! skipped.

use std::fs;
use std::path::{Path, PathBuf};

use audience_core::error::AudienceResult;
use audience_core::types::{Item, Scoring, Segment, SYSTEM_SCOPE};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::service::SegmentService;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub segments: usize,
    pub scorings: usize,
}

pub fn load_predefined_definitions(service: &SegmentService, root: &Path) -> LoadSummary {
    let segments = load_dir::<Segment>(&root.join("segments"), |segment| {
        service.set_segment_definition(segment)
    });
    let scorings = load_dir::<Scoring>(&root.join("scoring"), |scoring| {
        service.set_scoring_definition(scoring)
    });
    info!(segments, scorings, root = %root.display(), "predefined definitions loaded");
    LoadSummary { segments, scorings }
}

/// Parse one definition, defaulting a missing scope to the system scope.
pub fn parse_definition<T: Item + DeserializeOwned>(text: &str) -> serde_json::Result<T> {
    let mut item: T = serde_json::from_str(text)?;
    let metadata = item.metadata_mut();
    if metadata.scope.is_none() {
        metadata.scope = Some(SYSTEM_SCOPE.to_string());
    }
    Ok(item)
}

fn load_dir<T: Item + DeserializeOwned>(
    dir: &Path,
    mut register: impl FnMut(T) -> AudienceResult<()>,
) -> usize {
    let mut loaded = 0;
    for path in json_files(dir) {
        debug!(path = %path.display(), kind = T::ITEM_TYPE, "loading predefined definition");
        let item = match fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| parse_definition::<T>(&text).map_err(|e| e.to_string()))
        {
            Ok(item) => item,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot read predefined definition");
                continue;
            }
        };
        let id = item.item_id().to_string();
        match register(item) {
            Ok(()) => {
                info!(id, kind = T::ITEM_TYPE, "predefined definition registered");
                loaded += 1;
            }
            Err(e) => error!(id, kind = T::ITEM_TYPE, error = %e, "cannot register predefined definition"),
        }
    }
    loaded
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}
