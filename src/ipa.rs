use crate::error::{Result, SidesignError};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

/// Unpacks an IPA into `<dest>/Payload/`, removing any payload tree left over
/// from a previous run first. Returns the payload directory.
pub fn extract_payload<P: AsRef<Path>, Q: AsRef<Path>>(ipa_path: P, dest: Q) -> Result<PathBuf> {
    let ipa_path = ipa_path.as_ref();
    let dest = dest.as_ref();

    let file = File::open(ipa_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    // Check for valid IPA structure before touching the destination
    let has_payload = archive.file_names().any(|name| name.starts_with("Payload/"));
    if !has_payload {
        return Err(SidesignError::InvalidIpa(
            "No Payload folder found".to_string(),
        ));
    }

    let has_info_plist = archive
        .file_names()
        .any(|name| name.ends_with(".app/Info.plist"));
    if !has_info_plist {
        return Err(SidesignError::InvalidIpa(
            "No Info.plist found, invalid app".to_string(),
        ));
    }

    let payload = dest.join("Payload");
    if payload.exists() {
        fs::remove_dir_all(&payload)?;
        log::debug!("cleaned existing Payload folder");
    }

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        // entries with parent/absolute components must never escape dest
        let outpath = match file.enclosed_name() {
            Some(rel) => dest.join(rel),
            None => {
                return Err(SidesignError::InvalidIpa(format!(
                    "unsafe entry path: {}",
                    file.name()
                )))
            }
        };

        if file.name().ends_with('/') {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(p) = outpath.parent() {
                if !p.exists() {
                    fs::create_dir_all(p)?;
                }
            }
            let mut outfile = File::create(&outpath)?;
            std::io::copy(&mut file, &mut outfile)?;

            // Preserve Unix permissions
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = file.unix_mode() {
                    fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
                }
            }
        }
    }

    Ok(payload)
}

/// Zips the `Payload/` tree under `tree_root` into an IPA at `output`,
/// overwriting it if present.
pub fn build_archive<P: AsRef<Path>, Q: AsRef<Path>>(tree_root: P, output: Q) -> Result<()> {
    let tree_root = tree_root.as_ref();
    let output = output.as_ref();

    let file = File::create(output)?;
    let mut zip = zip::ZipWriter::new(file);

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let payload = tree_root.join("Payload");

    for entry in WalkDir::new(&payload) {
        let entry = entry?;
        let path = entry.path();
        let name = path.strip_prefix(tree_root).expect("path is within tree root");

        // Skip hidden files (fixes installd errors)
        if name
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            continue;
        }

        if path.is_file() {
            let name_str = name.to_string_lossy().replace('\\', "/");
            zip.start_file(&name_str, options)?;
            let mut f = File::open(path)?;
            let mut buffer = Vec::new();
            f.read_to_end(&mut buffer)?;
            zip.write_all(&buffer)?;
        } else if path.is_dir() && path != payload {
            let name_str = format!("{}/", name.to_string_lossy().replace('\\', "/"));
            zip.add_directory(&name_str, options)?;
        }
    }

    zip.finish()?;

    Ok(())
}

/// Wraps a raw `.app` bundle dropped in by the user into an IPA, staging a
/// `PayloadTemp/Payload/<Name>.app` tree under `staging_dir` and zipping it.
/// Used at import time only, never during signing.
pub fn convert_app_bundle_to_ipa<P: AsRef<Path>, Q: AsRef<Path>, R: AsRef<Path>>(
    app_path: P,
    dest_dir: Q,
    staging_dir: R,
) -> Result<PathBuf> {
    let app_path = app_path.as_ref();
    let dest_dir = dest_dir.as_ref();

    if !app_path.join("Info.plist").exists() {
        return Err(SidesignError::InvalidAppBundle(
            "No Info.plist found".to_string(),
        ));
    }

    let app_name = app_path
        .file_name()
        .ok_or_else(|| SidesignError::InvalidAppBundle("Invalid app path".to_string()))?;

    let temp_root = staging_dir.as_ref().join("PayloadTemp");
    if temp_root.exists() {
        fs::remove_dir_all(&temp_root)?;
    }
    let payload = temp_root.join("Payload");
    fs::create_dir_all(&payload)?;
    copy_dir_all(app_path, &payload.join(app_name))?;

    let stem = app_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "app".to_string());
    let ipa_path = dest_dir.join(format!("{stem}.ipa"));
    if ipa_path.exists() {
        fs::remove_file(&ipa_path)?;
    }

    build_archive(&temp_root, &ipa_path)?;

    if let Err(e) = fs::remove_dir_all(&temp_root) {
        log::warn!("could not remove staging tree {}: {e}", temp_root.display());
    }

    Ok(ipa_path)
}

pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else if ty.is_symlink() {
            let target = fs::read_link(&src_path)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(target, &dst_path)?;
            #[cfg(windows)]
            std::os::windows::fs::symlink_file(target, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn make_app_tree(root: &Path) {
        let app = root.join("Payload/Test.app");
        fs::create_dir_all(app.join("Frameworks")).unwrap();
        fs::write(app.join("Info.plist"), b"plist-bytes").unwrap();
        fs::write(app.join("Test"), b"\xcf\xfa\xed\xfemain").unwrap();
        fs::write(app.join("Frameworks/libswift.dylib"), b"dylib-bytes").unwrap();
    }

    fn collect_files(root: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        for entry in WalkDir::new(root) {
            let entry = entry.unwrap();
            if entry.path().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/");
                out.insert(rel, fs::read(entry.path()).unwrap());
            }
        }
        out
    }

    #[test]
    fn archive_round_trip_preserves_file_set() {
        let src = TempDir::new().unwrap();
        make_app_tree(src.path());

        let ipa = src.path().join("out.ipa");
        build_archive(src.path(), &ipa).unwrap();

        let dest = TempDir::new().unwrap();
        let payload = extract_payload(&ipa, dest.path()).unwrap();
        assert!(payload.ends_with("Payload"));

        let before = collect_files(&src.path().join("Payload"));
        let after = collect_files(&payload);
        assert_eq!(before, after);
    }

    #[test]
    fn extract_rejects_archive_without_payload() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("bogus.ipa");
        let file = File::create(&bogus).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("README.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"not an ipa").unwrap();
        zip.finish().unwrap();

        let err = extract_payload(&bogus, dir.path()).unwrap_err();
        assert!(matches!(err, SidesignError::InvalidIpa(_)));
    }

    #[test]
    fn extract_rejects_entries_escaping_the_destination() {
        let dir = TempDir::new().unwrap();
        let evil = dir.path().join("evil.ipa");
        let file = File::create(&evil).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        zip.start_file("Payload/Test.app/Info.plist", options).unwrap();
        zip.write_all(b"plist").unwrap();
        zip.start_file("../escape.txt", options).unwrap();
        zip.write_all(b"outside").unwrap();
        zip.finish().unwrap();

        let dest = dir.path().join("dest");
        fs::create_dir_all(&dest).unwrap();

        let err = extract_payload(&evil, &dest).unwrap_err();
        assert!(matches!(err, SidesignError::InvalidIpa(_)));
        // nothing landed above the destination root
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn extract_replaces_stale_payload() {
        let src = TempDir::new().unwrap();
        make_app_tree(src.path());
        let ipa = src.path().join("out.ipa");
        build_archive(src.path(), &ipa).unwrap();

        let dest = TempDir::new().unwrap();
        let stale = dest.path().join("Payload/Old.app");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("junk"), b"junk").unwrap();

        let payload = extract_payload(&ipa, dest.path()).unwrap();
        assert!(!payload.join("Old.app").exists());
        assert!(payload.join("Test.app/Info.plist").exists());
    }

    #[test]
    fn hidden_files_are_not_repacked() {
        let src = TempDir::new().unwrap();
        make_app_tree(src.path());
        fs::write(src.path().join("Payload/Test.app/.DS_Store"), b"x").unwrap();

        let ipa = src.path().join("out.ipa");
        build_archive(src.path(), &ipa).unwrap();

        let archive = zip::ZipArchive::new(File::open(&ipa).unwrap()).unwrap();
        assert!(!archive.file_names().any(|n| n.contains(".DS_Store")));
    }

    #[test]
    fn app_bundle_converts_to_ipa() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Demo.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("Info.plist"), b"plist").unwrap();

        let staging = dir.path().join("temp-files");
        fs::create_dir_all(&staging).unwrap();

        let ipa = convert_app_bundle_to_ipa(&app, dir.path(), &staging).unwrap();
        assert_eq!(ipa.file_name().unwrap(), "Demo.ipa");
        assert!(!staging.join("PayloadTemp").exists());

        let out = TempDir::new().unwrap();
        let payload = extract_payload(&ipa, out.path()).unwrap();
        assert!(payload.join("Demo.app/Info.plist").exists());
    }
}
