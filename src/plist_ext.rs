use crate::error::Result;
use plist::Value;
use std::path::{Path, PathBuf};

/// A parsed `Info.plist` (or any dictionary-rooted plist) plus the path it
/// was read from, so mutations can be written back in place.
pub struct PlistFile {
    pub path: PathBuf,
    pub data: plist::Dictionary,
}

impl PlistFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = plist::from_file::<_, plist::Dictionary>(&path)?;
        Ok(Self { path, data })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_string())
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.data
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn save(&self) -> Result<()> {
        plist::to_file_xml(&self.path, &self.data)?;
        Ok(())
    }
}
