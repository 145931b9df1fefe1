//! Remote key layout for published assets.
//!
//! Every remote key the pipeline reads or writes is derived here, so callers
//! never build or strip prefixes by hand.

use thiserror::Error;

/// Name of the top-level manifest inside an asset prefix.
pub const MASTER_PLAYLIST: &str = "master.m3u8";
/// Name of each rendition's own playlist.
pub const RENDITION_PLAYLIST: &str = "playlist.m3u8";

#[derive(Debug, Error, PartialEq)]
pub enum PathError {
    #[error("Invalid asset id: {0:?}")]
    InvalidAssetId(String),
}

/// Maps an asset id to its canonical location in the object store.
///
/// Layout: `{root}/{asset}/hls/master.m3u8`,
/// `{root}/{asset}/hls/{rendition}/playlist.m3u8` and
/// `{root}/{asset}/hls/{rendition}/segment_NNN.ts`.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetPathPolicy {
    root: String,
}

impl AssetPathPolicy {
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Check that an asset id can be used as a single path component.
    pub fn validate_asset_id(asset_id: &str) -> Result<(), PathError> {
        let bad = asset_id.is_empty()
            || asset_id.contains('/')
            || asset_id.contains('\\')
            || asset_id == "."
            || asset_id.contains("..")
            || asset_id.chars().any(|c| c.is_control() || c.is_whitespace());
        if bad {
            Err(PathError::InvalidAssetId(asset_id.to_string()))
        } else {
            Ok(())
        }
    }

    /// Prefix under which everything for `asset_id` lives, without a trailing slash.
    pub fn prefix(&self, asset_id: &str) -> Result<String, PathError> {
        Self::validate_asset_id(asset_id)?;
        if self.root.is_empty() {
            Ok(format!("{}/hls", asset_id))
        } else {
            Ok(format!("{}/{}/hls", self.root, asset_id))
        }
    }

    pub fn master_key(&self, asset_id: &str) -> Result<String, PathError> {
        Ok(format!("{}/{}", self.prefix(asset_id)?, MASTER_PLAYLIST))
    }

    pub fn rendition_prefix(&self, asset_id: &str, rendition: &str) -> Result<String, PathError> {
        Ok(format!("{}/{}", self.prefix(asset_id)?, rendition))
    }

    pub fn rendition_playlist_key(
        &self,
        asset_id: &str,
        rendition: &str,
    ) -> Result<String, PathError> {
        Ok(format!(
            "{}/{}",
            self.rendition_prefix(asset_id, rendition)?,
            RENDITION_PLAYLIST
        ))
    }

    pub fn segment_key(
        &self,
        asset_id: &str,
        rendition: &str,
        segment_file: &str,
    ) -> Result<String, PathError> {
        Ok(format!(
            "{}/{}",
            self.rendition_prefix(asset_id, rendition)?,
            segment_file
        ))
    }
}
