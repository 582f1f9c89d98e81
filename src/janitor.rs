use crate::layout::{Layout, LEGACY_CERT_FILES};
use std::fs;
use std::path::Path;

/// Removes the fixed-name artifacts a sideload run leaves behind. Every
/// removal is best-effort: a file the OS already reclaimed, or one that never
/// existed, is not an error.
pub struct Janitor {
    layout: Layout,
}

impl Janitor {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Full sweep before a run starts, so stale output from an interrupted
    /// run can never be served as if it were fresh. Imported team
    /// certificates always survive; the opt-in flag only removes the two
    /// loose files left behind by the old single-certificate workflow.
    pub fn clear_before_run(&self, delete_certificates: bool) {
        self.clear_signing_artifacts();
        self.sweep_scratch();

        if delete_certificates {
            for name in LEGACY_CERT_FILES {
                self.remove(&self.layout.documents().join(name));
            }
        }
    }

    /// Post-install sweep, identical in coverage minus the certificate
    /// option. Runs after the grace period so the device has finished
    /// downloading the signed archive.
    pub fn clear_after_install(&self) {
        self.clear_signing_artifacts();
        self.sweep_scratch();
    }

    fn clear_signing_artifacts(&self) {
        self.remove(&self.layout.signed_ipa());
        self.remove(&self.layout.manifest());
        self.remove(&self.layout.payload_dir());
        // AppleDouble sibling some archive tools leave next to Payload/
        self.remove(&self.layout.documents().join("__MACOSX"));
        self.remove(&self.layout.downloaded_ipa());
        self.remove_contents(&self.layout.temp_files_dir());
    }

    /// Scratch-space staging (`PayloadTemp*` trees, orphaned archives and
    /// app bundles) accumulates when a run is killed mid-stage.
    fn sweep_scratch(&self) {
        let Ok(entries) = fs::read_dir(self.layout.scratch()) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let is_stale = name.starts_with("PayloadTemp")
                || name.ends_with(".ipa")
                || name.ends_with(".app");
            if is_stale {
                self.remove(&path);
            }
        }
    }

    fn remove_contents(&self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            self.remove(&entry.path());
        }
    }

    fn remove(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => log::debug!("removed {}", path.display()),
            Err(e) => log::warn!("could not remove {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_layout(dir: &TempDir) -> Layout {
        let documents = dir.path().join("documents");
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&documents).unwrap();
        fs::create_dir_all(&scratch).unwrap();

        let layout = Layout::new(&documents).with_scratch(&scratch);

        fs::write(layout.signed_ipa(), b"ipa").unwrap();
        fs::write(layout.manifest(), b"plist").unwrap();
        fs::create_dir_all(layout.payload_dir().join("Test.app")).unwrap();
        fs::write(layout.downloaded_ipa(), b"download").unwrap();
        fs::create_dir_all(layout.temp_files_dir()).unwrap();
        fs::write(layout.temp_files_dir().join("scratch.bin"), b"x").unwrap();

        fs::create_dir_all(documents.join("__MACOSX")).unwrap();
        fs::create_dir_all(scratch.join("PayloadTemp12345")).unwrap();
        fs::write(scratch.join("orphan.ipa"), b"x").unwrap();
        fs::create_dir_all(scratch.join("Orphan.app")).unwrap();
        fs::write(scratch.join("unrelated.txt"), b"keep").unwrap();

        layout
    }

    #[test]
    fn pre_run_sweep_removes_fixed_artifacts_and_scratch() {
        let dir = TempDir::new().unwrap();
        let layout = seeded_layout(&dir);

        Janitor::new(layout.clone()).clear_before_run(false);

        assert!(!layout.signed_ipa().exists());
        assert!(!layout.manifest().exists());
        assert!(!layout.payload_dir().exists());
        assert!(!layout.documents().join("__MACOSX").exists());
        assert!(!layout.downloaded_ipa().exists());
        // the temp-files folder survives, emptied
        assert!(layout.temp_files_dir().exists());
        assert!(!layout.temp_files_dir().join("scratch.bin").exists());

        assert!(!layout.scratch().join("PayloadTemp12345").exists());
        assert!(!layout.scratch().join("orphan.ipa").exists());
        assert!(!layout.scratch().join("Orphan.app").exists());
        assert!(layout.scratch().join("unrelated.txt").exists());
    }

    #[test]
    fn certificate_sweep_touches_only_legacy_files() {
        let dir = TempDir::new().unwrap();
        let layout = seeded_layout(&dir);
        let team = layout.certificates_dir().join("Acme");
        fs::create_dir_all(&team).unwrap();
        fs::write(team.join("dev.p12"), b"p12").unwrap();
        fs::write(layout.certificates_dir().join(".default-team"), "Acme").unwrap();
        fs::write(layout.documents().join("sidesign-cert.p12"), b"legacy").unwrap();
        fs::write(
            layout.documents().join("sidesign-cert.mobileprovision"),
            b"legacy",
        )
        .unwrap();

        let janitor = Janitor::new(layout.clone());
        janitor.clear_before_run(false);
        assert!(layout.documents().join("sidesign-cert.p12").exists());

        janitor.clear_before_run(true);
        // imported team folders and the stored default survive the sweep;
        // only the old single-certificate leftovers go
        assert!(team.join("dev.p12").exists());
        assert!(layout.certificates_dir().join(".default-team").exists());
        assert!(!layout.documents().join("sidesign-cert.p12").exists());
        assert!(!layout.documents().join("sidesign-cert.mobileprovision").exists());
    }

    #[test]
    fn sweeping_an_empty_tree_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let documents = dir.path().join("documents");
        fs::create_dir_all(&documents).unwrap();
        let layout = Layout::new(&documents).with_scratch(dir.path().join("missing-scratch"));

        // nothing to remove, nothing to panic about, twice in a row
        let janitor = Janitor::new(layout);
        janitor.clear_before_run(false);
        janitor.clear_before_run(false);
        janitor.clear_after_install();
    }
}
