use crate::error::{Result, SidesignError};
use crate::plist_ext::PlistFile;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read-only snapshot of the identity recovered from the main bundle's
/// `Info.plist`. Recomputed fresh on every run, never cached across runs.
#[derive(Debug, Clone)]
pub struct BundleIdentity {
    pub bundle_id: String,
    pub display_name: String,
    pub bundle_version: String,
    pub icon_path: Option<PathBuf>,
}

/// Finds the primary `.app` directory in an extracted payload, skipping app
/// extensions, embedded frameworks and companion watch apps.
pub fn locate_main_app_bundle<P: AsRef<Path>>(payload_dir: P) -> Option<PathBuf> {
    WalkDir::new(payload_dir.as_ref())
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .find(|path| {
            path.is_dir()
                && path.extension().map(|e| e == "app").unwrap_or(false)
                && !path.components().any(|c| {
                    matches!(c.as_os_str().to_str(), Some("Frameworks" | "PlugIns" | "Watch"))
                })
        })
}

fn main_bundle_plist<P: AsRef<Path>>(payload_dir: P) -> Result<(PathBuf, PlistFile)> {
    let app = locate_main_app_bundle(payload_dir).ok_or(SidesignError::AppBundleNotFound)?;
    let plist = PlistFile::open(app.join("Info.plist"))?;
    Ok((app, plist))
}

pub fn read_bundle_identifier<P: AsRef<Path>>(payload_dir: P) -> Result<String> {
    let (_, plist) = main_bundle_plist(payload_dir)?;
    match plist.get_string("CFBundleIdentifier") {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(SidesignError::MissingBundleId),
    }
}

/// `CFBundleDisplayName`, falling back to `CFBundleName`, falling back to the
/// `.app` folder name.
pub fn read_display_name<P: AsRef<Path>>(payload_dir: P) -> Result<String> {
    let app = locate_main_app_bundle(&payload_dir).ok_or(SidesignError::AppBundleNotFound)?;
    let folder_name = app
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let plist = match PlistFile::open(app.join("Info.plist")) {
        Ok(p) => p,
        Err(_) => return Ok(folder_name),
    };

    if let Some(name) = plist.get_string("CFBundleDisplayName").filter(|s| !s.is_empty()) {
        return Ok(name.to_string());
    }
    if let Some(name) = plist.get_string("CFBundleName").filter(|s| !s.is_empty()) {
        return Ok(name.to_string());
    }
    Ok(folder_name)
}

/// `CFBundleVersion`, defaulting to `"1"` when missing or unreadable.
/// Version is never allowed to block the pipeline.
pub fn read_bundle_version<P: AsRef<Path>>(payload_dir: P) -> String {
    main_bundle_plist(payload_dir)
        .ok()
        .and_then(|(_, plist)| {
            plist
                .get_string("CFBundleVersion")
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "1".to_string())
}

/// Picks the highest-resolution `AppIcon*` asset in the main bundle root, or
/// None when the app ships no flat icon files (caller falls back to the
/// synthesized placeholder).
pub fn locate_app_icon<P: AsRef<Path>>(payload_dir: P) -> Option<PathBuf> {
    let app = locate_main_app_bundle(payload_dir)?;
    let entries = fs::read_dir(&app).ok()?;

    let mut icons: Vec<(u32, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("AppIcon"))
                    .unwrap_or(false)
        })
        .map(|p| (icon_resolution(&p), p))
        .collect();

    icons.sort_by(|a, b| b.0.cmp(&a.0));
    icons.into_iter().map(|(_, p)| p).next()
}

/// Parses the `<width>x<height>` token out of an icon filename, e.g.
/// `AppIcon60x60@2x.png` -> 60. Unparseable names sort last.
fn icon_resolution(path: &Path) -> u32 {
    let stem = match path.file_stem() {
        Some(s) => s.to_string_lossy().to_string(),
        None => return 0,
    };
    let before_x = match stem.split('x').next() {
        Some(s) => s,
        None => return 0,
    };
    let digits: String = before_x
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

/// Gathers the full identity snapshot in one pass. An explicit bundle-id
/// override wins over the plist value and rescues a bundle that ships
/// without one; a missing id is fatal only when no override is supplied.
pub fn read_identity<P: AsRef<Path>>(
    payload_dir: P,
    bundle_id_override: Option<&str>,
) -> Result<BundleIdentity> {
    let payload_dir = payload_dir.as_ref();
    let bundle_id = match (bundle_id_override, read_bundle_identifier(payload_dir)) {
        (Some(id), _) => id.to_string(),
        (None, Ok(id)) => id,
        (None, Err(e)) => return Err(e),
    };
    Ok(BundleIdentity {
        bundle_id,
        display_name: read_display_name(payload_dir)?,
        bundle_version: read_bundle_version(payload_dir),
        icon_path: locate_app_icon(payload_dir),
    })
}
