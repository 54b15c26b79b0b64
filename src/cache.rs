use std::{
    collections::HashSet,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

const DEFAULT_CACHE_DIR: &str = ".";
const CACHE_FILENAME: &str = "assetline_cache.json";

/// Hex digests of task inputs whose outputs were produced successfully.
pub type Cache = HashSet<String>;

pub fn load_cache(cache_dir: Option<&str>, root: &Path) -> Cache {
    let cache_path = get_cache_path(cache_dir, root);

    let file = match File::open(&cache_path) {
        Ok(file) => file,
        Err(_) => return Cache::default(),
    };

    let reader = BufReader::new(file);
    serde_json::from_reader(reader).unwrap_or_else(|e| {
        warn!("Ignoring unreadable cache '{}': {}", cache_path.display(), e);
        Cache::default()
    })
}

pub fn save_cache(cache: &Cache, cache_dir: Option<&str>, root: &Path) {
    let cache_path = get_cache_path(cache_dir, root);

    if let Some(parent) = cache_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("Failed to create cache directory: {}", e);
            return;
        }
    }

    match File::create(&cache_path) {
        Ok(file) => {
            let writer = BufWriter::new(file);
            match serde_json::to_writer_pretty(writer, cache) {
                Ok(()) => debug!("Cache saved to {}", cache_path.display()),
                Err(e) => warn!("Failed to write cache file: {}", e),
            }
        }
        Err(e) => {
            warn!("Failed to open cache file for writing: {}", e);
        }
    }
}

fn get_cache_path(cache_dir: Option<&str>, root: &Path) -> PathBuf {
    let cache_dir = cache_dir.unwrap_or(DEFAULT_CACHE_DIR);

    let cache_dir_path = if Path::new(cache_dir).is_absolute() {
        PathBuf::from(cache_dir)
    } else {
        root.join(cache_dir)
    };

    cache_dir_path.join(CACHE_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::default();
        cache.insert("abc".to_string());

        save_cache(&cache, Some(".cache"), dir.path());
        assert!(dir.path().join(".cache").join(CACHE_FILENAME).exists());
        assert_eq!(load_cache(Some(".cache"), dir.path()), cache);
    }

    #[test]
    fn missing_or_corrupt_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_cache(None, dir.path()).is_empty());

        fs::write(dir.path().join(CACHE_FILENAME), "not json").unwrap();
        assert!(load_cache(None, dir.path()).is_empty());
    }
}
