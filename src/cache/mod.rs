pub mod index;
pub mod response_file;
pub mod store;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub use index::{EntryStatus, IndexError, MemoryIndex};
pub use response_file::ResponseFile;
pub use store::LocalStore;

pub const SUFFIX_META_FILE: &str = ".meta.json";
pub const SUFFIX_LAYER_FILE: &str = ".layer";
pub const SUFFIX_MANIFEST_FILE: &str = ".manifest";
pub const SUFFIX_PARTIAL_FILE: &str = ".partial";

pub const DEFAULT_PROTO: &str = "HTTP/1.1";

/// Hex SHA-256 digest identifying one content-addressed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Layer,
    Manifest,
}

impl ItemType {
    pub fn suffix(self) -> &'static str {
        match self {
            ItemType::Layer => SUFFIX_LAYER_FILE,
            ItemType::Manifest => SUFFIX_MANIFEST_FILE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Layer => "layer",
            ItemType::Manifest => "manifest",
        }
    }
}

/// `<datadir>/<digest><suffix>` for a content-addressed object.
pub fn data_file_path(data_dir: &Path, digest: &str, item: ItemType) -> PathBuf {
    data_dir.join(format!("{digest}{}", item.suffix()))
}

/// Sidecar path for a data file: the same name with `.meta.json` appended.
pub fn meta_file_path(datafile: &Path) -> PathBuf {
    append_suffix(datafile, SUFFIX_META_FILE)
}

/// Transient write target for a data file: the same name with `.partial` appended.
pub fn partial_file_path(datafile: &Path) -> PathBuf {
    append_suffix(datafile, SUFFIX_PARTIAL_FILE)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Current time as epoch seconds, the unit both timestamps in the index use.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_file_paths_carry_item_suffix() {
        let dir = Path::new("/data");
        assert_eq!(
            data_file_path(dir, "abc", ItemType::Layer),
            PathBuf::from("/data/abc.layer")
        );
        assert_eq!(
            data_file_path(dir, "abc", ItemType::Manifest),
            PathBuf::from("/data/abc.manifest")
        );
    }

    #[test]
    fn sidecar_and_partial_paths_extend_the_data_file_name() {
        let df = PathBuf::from("/data/abc.layer");
        assert_eq!(
            meta_file_path(&df),
            PathBuf::from("/data/abc.layer.meta.json")
        );
        assert_eq!(
            partial_file_path(&df),
            PathBuf::from("/data/abc.layer.partial")
        );
    }
}
