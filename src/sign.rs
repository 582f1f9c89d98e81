use crate::error::{Result, SidesignError};
use crate::macho;
use crate::plist_ext::PlistFile;
use crate::tweaks;
use apple_codesign::{SigningSettings, UnifiedSigner};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Everything the native signing primitive needs for one run.
#[derive(Debug, Clone)]
pub struct SignInputs {
    pub app_dir: PathBuf,
    pub p12: PathBuf,
    pub provisioning_profile: PathBuf,
    pub password: String,
    pub bundle_id: String,
    pub bundle_version: String,
    pub display_name: String,
    pub tweak: Option<PathBuf>,
}

/// The native signing primitive, zsign-shaped: `0` means the bundle now
/// carries a valid signature, anything else means no usable signature was
/// produced. `on_item_signed` fires once per embedded item the tool
/// processes and drives per-item progress.
pub trait Signer: Send + Sync {
    fn sign(&self, inputs: &SignInputs, on_item_signed: &(dyn Fn() + Send + Sync)) -> i32;
}

/// Interpretation of a signer return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningOutcome {
    Success,
    /// Generic tool failure (-1).
    ToolFailure,
    /// Certificate / signing asset could not be initialized (-2).
    BadAsset,
    /// Provisioning profile not found (-3).
    MissingProfile,
    /// A code outside the documented space.
    Unknown(i32),
}

impl SigningOutcome {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::ToolFailure,
            -2 => Self::BadAsset,
            -3 => Self::MissingProfile,
            other => Self::Unknown(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for SigningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "app signed successfully"),
            Self::ToolFailure => {
                write!(f, "signing failed - check certificate and provisioning profile")
            }
            Self::BadAsset => write!(
                f,
                "failed to initialize signing asset - check certificate and provisioning profile"
            ),
            Self::MissingProfile => write!(f, "provisioning profile not found"),
            Self::Unknown(code) => write!(f, "unknown signer code {code}"),
        }
    }
}

/// Bundled fallback signer: applies the identity rewrite the native tool
/// would perform, injects the ad-hoc tweak, and ad-hoc signs every Mach-O in
/// the bundle. Stands behind the same seam as a real zsign build; it cannot
/// produce certificate-backed signatures (the assets are only validated for
/// presence).
pub struct AdhocSigner;

impl Signer for AdhocSigner {
    fn sign(&self, inputs: &SignInputs, on_item_signed: &(dyn Fn() + Send + Sync)) -> i32 {
        if !inputs.app_dir.exists() {
            log::error!("app folder not found: {}", inputs.app_dir.display());
            return -1;
        }
        if !inputs.p12.exists() {
            log::error!("P12 certificate not found: {}", inputs.p12.display());
            return -2;
        }
        if !inputs.provisioning_profile.exists() {
            log::error!(
                "provisioning profile not found: {}",
                inputs.provisioning_profile.display()
            );
            return -3;
        }

        match self.sign_bundle(inputs, on_item_signed) {
            Ok(()) => 0,
            Err(e) => {
                log::error!("ad-hoc signing failed: {e}");
                -1
            }
        }
    }
}

impl AdhocSigner {
    fn sign_bundle(
        &self,
        inputs: &SignInputs,
        on_item_signed: &(dyn Fn() + Send + Sync),
    ) -> Result<()> {
        let app_dir = &inputs.app_dir;
        let main_executable = self.rewrite_identity(inputs)?;

        if let Some(tweak) = &inputs.tweak {
            let dest = tweaks::inject_file(app_dir, tweak)?;
            let name = dest
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            macho::add_weak_dylib(&main_executable, &format!("@rpath/{name}"))?;
        }

        // Embedded items first, main executable last, the order the native
        // tool reports them. Individual embedded failures (e.g. signature
        // stubs with no __LINKEDIT) are tolerated.
        for item in embedded_machos(app_dir) {
            match adhoc_sign_macho(&item) {
                Ok(()) => on_item_signed(),
                Err(e) => log::warn!("skipping embedded item {}: {e}", item.display()),
            }
        }

        adhoc_sign_macho(&main_executable)?;
        on_item_signed();
        Ok(())
    }

    /// Mirrors the identity rewrite the native wrapper performs before
    /// signing: bundle id and version always, display name into
    /// `CFBundleDisplayName` when the key exists, `CFBundleName` otherwise.
    fn rewrite_identity(&self, inputs: &SignInputs) -> Result<PathBuf> {
        let plist_path = inputs.app_dir.join("Info.plist");
        let mut plist = PlistFile::open(&plist_path)?;

        let executable = plist
            .get_string("CFBundleExecutable")
            .map(|s| s.to_string())
            .ok_or_else(|| {
                SidesignError::InvalidAppBundle("No CFBundleExecutable".to_string())
            })?;

        let mut dirty = false;
        if plist.get_string("CFBundleIdentifier") != Some(inputs.bundle_id.as_str()) {
            plist.set_string("CFBundleIdentifier", &inputs.bundle_id);
            dirty = true;
        }
        if plist.get_string("CFBundleVersion") != Some(inputs.bundle_version.as_str()) {
            plist.set_string("CFBundleVersion", &inputs.bundle_version);
            dirty = true;
        }
        let name_key = if plist.contains("CFBundleDisplayName") {
            "CFBundleDisplayName"
        } else {
            "CFBundleName"
        };
        if plist.get_string(name_key) != Some(inputs.display_name.as_str()) {
            plist.set_string(name_key, &inputs.display_name);
            dirty = true;
        }
        if dirty {
            plist.save()?;
        }

        Ok(inputs.app_dir.join(executable))
    }
}

fn embedded_machos(app_dir: &Path) -> Vec<PathBuf> {
    let mut items = Vec::new();
    let frameworks_dir = app_dir.join("Frameworks");
    let Ok(entries) = fs::read_dir(&frameworks_dir) else {
        return items;
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("dylib") => items.push(path),
            Some("framework") => {
                if let Some(stem) = path.file_stem() {
                    let executable = path.join(stem);
                    if executable.is_file() {
                        items.push(executable);
                    }
                }
            }
            _ => {}
        }
    }
    items
}

/// Ad-hoc signs one Mach-O in place through a temp file, the only write path
/// `UnifiedSigner` offers.
fn adhoc_sign_macho(path: &Path) -> Result<()> {
    let settings = SigningSettings::default();
    let signer = UnifiedSigner::new(settings);

    let temp_file = NamedTempFile::new()?;
    signer
        .sign_macho(path, temp_file.path())
        .map_err(|e| SidesignError::Sign(format!("Failed to sign: {e}")))?;

    fs::copy(temp_file.path(), path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn signer_codes_map_exhaustively() {
        assert_eq!(SigningOutcome::from_code(0), SigningOutcome::Success);
        assert_eq!(SigningOutcome::from_code(-1), SigningOutcome::ToolFailure);
        assert_eq!(SigningOutcome::from_code(-2), SigningOutcome::BadAsset);
        assert_eq!(SigningOutcome::from_code(-3), SigningOutcome::MissingProfile);
        assert_eq!(SigningOutcome::from_code(7), SigningOutcome::Unknown(7));

        assert!(SigningOutcome::from_code(0).is_success());
        assert!(!SigningOutcome::from_code(-1).is_success());
        assert!(SigningOutcome::Unknown(7).to_string().contains('7'));
    }

    fn inputs(dir: &Path) -> SignInputs {
        SignInputs {
            app_dir: dir.join("Test.app"),
            p12: dir.join("cert.p12"),
            provisioning_profile: dir.join("profile.mobileprovision"),
            password: String::new(),
            bundle_id: "com.example.app".into(),
            bundle_version: "1".into(),
            display_name: "Test".into(),
            tweak: None,
        }
    }

    #[test]
    fn preflight_reports_missing_assets_in_order() {
        let dir = TempDir::new().unwrap();
        let signer = AdhocSigner;
        let noop = || {};

        // no app folder
        assert_eq!(signer.sign(&inputs(dir.path()), &noop), -1);

        std::fs::create_dir_all(dir.path().join("Test.app")).unwrap();
        assert_eq!(signer.sign(&inputs(dir.path()), &noop), -2);

        std::fs::write(dir.path().join("cert.p12"), b"p12").unwrap();
        assert_eq!(signer.sign(&inputs(dir.path()), &noop), -3);
    }

    #[test]
    fn identity_rewrite_respects_display_name_key() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Test.app");
        std::fs::create_dir_all(&app).unwrap();

        let mut dict = plist::Dictionary::new();
        dict.insert("CFBundleExecutable".into(), plist::Value::String("Test".into()));
        dict.insert("CFBundleIdentifier".into(), plist::Value::String("com.old".into()));
        dict.insert("CFBundleName".into(), plist::Value::String("Old".into()));
        plist::to_file_xml(app.join("Info.plist"), &dict).unwrap();

        let mut i = inputs(dir.path());
        i.display_name = "Shiny".into();
        let exec = AdhocSigner.rewrite_identity(&i).unwrap();
        assert_eq!(exec, app.join("Test"));

        let plist = PlistFile::open(app.join("Info.plist")).unwrap();
        assert_eq!(plist.get_string("CFBundleIdentifier"), Some("com.example.app"));
        // no CFBundleDisplayName key: the name lands in CFBundleName
        assert_eq!(plist.get_string("CFBundleName"), Some("Shiny"));
        assert!(!plist.contains("CFBundleDisplayName"));
    }
}
