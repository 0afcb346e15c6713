// ============================================================
// Layer 4 — Episode Loader
// ============================================================
// Reads recorded demonstrations from a directory of JSON files.
//
// File layout:
//   dataset_dir/
//     episode_0.json
//     episode_1.json
//     ...
//
// Each file deserialises straight into a domain Episode:
//   {
//     "qpos":   [[f32; state_dim]; T],
//     "action": [[f32; action_dim]; T],
//     "images": { "<camera>": { "height": H, "width": W,
//                               "frames": [[u8; H*W*3]; T] } }
//   }
//
// Files are loaded in episode-number order so episode ids are
// stable between runs (the train/val split is seeded by id).

use anyhow::{Context, Result};
use std::{fs, path::{Path, PathBuf}};

use crate::domain::episode::Episode;
use crate::domain::traits::EpisodeSource;

/// Loads every `episode_*.json` file in a directory.
pub struct EpisodeLoader {
    dir: String,
}

impl EpisodeLoader {
    pub fn new(dir: impl Into<String>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load one episode file.
    pub fn load_file(path: &Path) -> Result<Episode> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        let mut episode: Episode = serde_json::from_str(&json)
            .with_context(|| format!("Malformed episode file '{}'", path.display()))?;
        episode.source = path.display().to_string();
        Ok(episode)
    }

    /// Paths of the episode files in the directory, in episode order.
    fn episode_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<(usize, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Cannot read directory '{}'", self.dir))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = episode_id(&path) else {
                tracing::debug!("Ignoring non-episode file '{}'", path.display());
                continue;
            };
            paths.push((id, path));
        }
        paths.sort_by_key(|(id, _)| *id);
        Ok(paths.into_iter().map(|(_, p)| p).collect())
    }
}

impl EpisodeSource for EpisodeLoader {
    fn load_all(&self) -> Result<Vec<Episode>> {
        if !Path::new(&self.dir).exists() {
            tracing::warn!("Dataset directory '{}' does not exist", self.dir);
            return Ok(Vec::new());
        }

        let mut episodes = Vec::new();
        for path in self.episode_paths()? {
            let episode = Self::load_file(&path)?;
            tracing::debug!("Loaded {} ({} steps)", episode.source, episode.len());
            episodes.push(episode);
        }

        tracing::info!("Loaded {} episodes from '{}'", episodes.len(), self.dir);
        Ok(episodes)
    }
}

/// `episode_12.json` → 12
fn episode_id(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("episode_")?
        .parse()
        .ok()
}
