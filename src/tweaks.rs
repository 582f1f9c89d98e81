use crate::error::Result;
use crate::ipa::copy_dir_all;
use crate::macho;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Copies operator-configured default tweaks into a target bundle's
/// `Frameworks/` directory and fixes up their substrate linkage.
pub struct TweakInjector {
    tweaks_dir: PathBuf,
    default_tweaks: Vec<String>,
}

impl TweakInjector {
    pub fn new<P: AsRef<Path>>(tweaks_dir: P, default_tweaks: Vec<String>) -> Self {
        Self {
            tweaks_dir: tweaks_dir.as_ref().to_path_buf(),
            default_tweaks,
        }
    }

    /// Injects every configured default tweak. Missing tweak files and
    /// per-tweak copy failures are warnings, never fatal; returns how many
    /// tweaks landed.
    pub fn inject_defaults<P: AsRef<Path>>(&self, app_dir: P) -> usize {
        if self.default_tweaks.is_empty() {
            log::debug!("no default tweaks to inject");
            return 0;
        }

        let app_dir = app_dir.as_ref();
        let mut injected = 0;

        for name in &self.default_tweaks {
            let Some(file) = self.find_tweak_file(name) else {
                log::warn!("default tweak not found: {name}");
                continue;
            };
            match inject_file(app_dir, &file) {
                Ok(dest) => {
                    injected += 1;
                    log::info!("injected default tweak {name} -> {}", dest.display());
                }
                Err(e) => log::warn!("failed to inject tweak {name}: {e}"),
            }
        }

        injected
    }

    /// Imported tweaks keep their original base name, or are prefixed with a
    /// numbering token (`3_TweakName.dylib`) when the import had to
    /// de-duplicate; both spellings resolve.
    fn find_tweak_file(&self, tweak_name: &str) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.tweaks_dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|path| {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                stem == tweak_name || stem.ends_with(&format!("_{tweak_name}"))
            })
    }
}

/// Copies one tweak (dylib file or framework directory) into the app's
/// `Frameworks/` directory, replacing any previous copy, then repairs its
/// substrate load commands.
pub fn inject_file<P: AsRef<Path>, Q: AsRef<Path>>(app_dir: P, tweak: Q) -> Result<PathBuf> {
    let tweak = tweak.as_ref();
    let frameworks_dir = app_dir.as_ref().join("Frameworks");
    fs::create_dir_all(&frameworks_dir)?;

    let file_name = tweak
        .file_name()
        .ok_or_else(|| crate::error::SidesignError::FileNotFound(tweak.to_path_buf()))?;
    let dest = frameworks_dir.join(file_name);

    if dest.exists() {
        if dest.is_dir() {
            fs::remove_dir_all(&dest)?;
        } else {
            fs::remove_file(&dest)?;
        }
    }

    if tweak.is_dir() {
        copy_dir_all(tweak, &dest)?;
    } else {
        fs::copy(tweak, &dest)?;
        if let Err(e) = macho::fix_substrate(&dest) {
            // not every injected file is a Mach-O; linkage repair is advisory
            log::debug!("substrate fixup skipped for {}: {e}", dest.display());
        }
    }

    Ok(dest)
}

/// How many items the signing tool will touch: every dylib and framework in
/// the bundle plus the main executable. Feeds the per-item progress total.
pub fn count_signable_items<P: AsRef<Path>>(app_dir: P) -> usize {
    let mut dylibs = 0;
    let mut frameworks = 0;

    for entry in WalkDir::new(app_dir.as_ref()).into_iter().filter_map(|e| e.ok()) {
        match entry.path().extension().and_then(|e| e.to_str()) {
            Some("dylib") => dylibs += 1,
            Some("framework") => frameworks += 1,
            _ => {}
        }
    }

    dylibs + frameworks + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_tweak_resolution_accepts_numbered_imports() {
        let dir = TempDir::new().unwrap();
        let tweaks = dir.path().join("tweaks");
        fs::create_dir_all(&tweaks).unwrap();
        fs::write(tweaks.join("3_Flex.dylib"), b"tweak").unwrap();
        fs::write(tweaks.join("Watusi.dylib"), b"tweak").unwrap();

        let injector = TweakInjector::new(&tweaks, vec!["Flex".into(), "Watusi".into()]);
        assert_eq!(
            injector.find_tweak_file("Flex").unwrap().file_name().unwrap(),
            "3_Flex.dylib"
        );
        assert_eq!(
            injector
                .find_tweak_file("Watusi")
                .unwrap()
                .file_name()
                .unwrap(),
            "Watusi.dylib"
        );
        assert!(injector.find_tweak_file("Missing").is_none());
    }

    #[test]
    fn injection_replaces_previous_copy() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Test.app");
        fs::create_dir_all(app.join("Frameworks")).unwrap();
        fs::write(app.join("Frameworks/mod.dylib"), b"old").unwrap();

        let tweak = dir.path().join("mod.dylib");
        fs::write(&tweak, b"new").unwrap();

        let dest = inject_file(&app, &tweak).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn missing_default_tweaks_are_skipped() {
        let dir = TempDir::new().unwrap();
        let tweaks = dir.path().join("tweaks");
        fs::create_dir_all(&tweaks).unwrap();
        let app = dir.path().join("Test.app");
        fs::create_dir_all(&app).unwrap();

        let injector = TweakInjector::new(&tweaks, vec!["Ghost".into()]);
        assert_eq!(injector.inject_defaults(&app), 0);
    }

    #[test]
    fn signable_items_counts_dylibs_frameworks_and_main() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Test.app");
        fs::create_dir_all(app.join("Frameworks/A.framework")).unwrap();
        fs::create_dir_all(app.join("Frameworks/B.framework")).unwrap();
        fs::write(app.join("Frameworks/c.dylib"), b"x").unwrap();
        fs::write(app.join("Test"), b"main").unwrap();

        assert_eq!(count_signable_items(&app), 4);
    }
}
