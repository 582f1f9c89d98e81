use crate::macho;
use std::fs;
use std::path::Path;

/// Frameworks that historically cannot be re-signed in place: their shipped
/// executables leave no room for a fresh code signature. Matched by
/// substring on the framework name.
pub const PROBLEMATIC_FRAMEWORKS: [&str; 4] = ["OpenSSL", "libssl", "libcrypto", "OpenSSL-Universal"];

/// What the sanitization pass did. Individual failures are recorded, never
/// propagated: partial cleanup must not abort a run.
#[derive(Debug, Default)]
pub struct SanitizeReport {
    pub stripped_signatures: usize,
    pub replaced_stubs: usize,
    pub errors: Vec<String>,
}

pub fn is_problematic(framework_name: &str) -> bool {
    PROBLEMATIC_FRAMEWORKS
        .iter()
        .any(|known| framework_name.contains(known))
}

/// Strips stale signing state from the app bundle and every framework under
/// `Frameworks/`, and replaces the executables of deny-listed frameworks
/// with synthesized signature stubs. Best-effort throughout.
///
/// Stub replacement is deliberately irreversible: a retry after a failed
/// signing run converges on the same tree.
pub fn sanitize_app_bundle<P: AsRef<Path>>(app_dir: P) -> SanitizeReport {
    let app_dir = app_dir.as_ref();
    let mut report = SanitizeReport::default();

    for stale in [
        app_dir.join("_CodeSignature"),
        app_dir.join("embedded.mobileprovision"),
    ] {
        if stale.exists() {
            match remove_any(&stale) {
                Ok(()) => {
                    report.stripped_signatures += 1;
                    log::debug!("removed {}", stale.display());
                }
                Err(e) => report.errors.push(format!("{}: {e}", stale.display())),
            }
        }
    }

    let frameworks_dir = app_dir.join("Frameworks");
    if !frameworks_dir.is_dir() {
        log::debug!("no Frameworks folder, skipping sanitization");
        return report;
    }

    let entries = match fs::read_dir(&frameworks_dir) {
        Ok(entries) => entries,
        Err(e) => {
            report.errors.push(format!("{}: {e}", frameworks_dir.display()));
            return report;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let framework = entry.path();
        if framework.extension().map(|e| e != "framework").unwrap_or(true) {
            continue;
        }
        let name = framework
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let signature = framework.join("_CodeSignature");
        if signature.exists() {
            match fs::remove_dir_all(&signature) {
                Ok(()) => report.stripped_signatures += 1,
                Err(e) => report.errors.push(format!("{}: {e}", signature.display())),
            }
        }

        if is_problematic(&name) {
            let executable = framework.join(&name);
            match fs::write(&executable, macho::replacement_stub()) {
                Ok(()) => {
                    report.replaced_stubs += 1;
                    log::info!("replaced {name} executable with a signature stub");
                }
                Err(e) => report.errors.push(format!("{}: {e}", executable.display())),
            }
        }
    }

    for err in &report.errors {
        log::warn!("framework sanitization: {err}");
    }
    report
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_framework(app: &Path, name: &str) -> std::path::PathBuf {
        let fw = app.join("Frameworks").join(format!("{name}.framework"));
        fs::create_dir_all(fw.join("_CodeSignature")).unwrap();
        fs::write(fw.join("_CodeSignature/CodeResources"), b"stale").unwrap();
        fs::write(fw.join(name), b"original-executable").unwrap();
        fw
    }

    #[test]
    fn strips_signatures_and_stubs_denied_frameworks() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Test.app");
        fs::create_dir_all(app.join("_CodeSignature")).unwrap();
        fs::write(app.join("embedded.mobileprovision"), b"old").unwrap();

        let openssl = make_framework(&app, "OpenSSL");
        let swift = make_framework(&app, "libswiftCore");

        let report = sanitize_app_bundle(&app);
        assert!(report.errors.is_empty());
        assert_eq!(report.replaced_stubs, 1);

        assert!(!app.join("_CodeSignature").exists());
        assert!(!app.join("embedded.mobileprovision").exists());
        assert!(!openssl.join("_CodeSignature").exists());
        assert!(!swift.join("_CodeSignature").exists());

        // deny-listed executable replaced by the stub, others untouched
        let stub = fs::read(openssl.join("OpenSSL")).unwrap();
        assert_eq!(stub.len(), 48 + 8192);
        assert_eq!(
            fs::read(swift.join("libswiftCore")).unwrap(),
            b"original-executable"
        );
    }

    #[test]
    fn app_without_frameworks_is_fine() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Bare.app");
        fs::create_dir_all(&app).unwrap();

        let report = sanitize_app_bundle(&app);
        assert!(report.errors.is_empty());
        assert_eq!(report.replaced_stubs, 0);
    }

    #[test]
    fn sanitization_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("Test.app");
        make_framework(&app, "libcrypto");

        let first = sanitize_app_bundle(&app);
        let second = sanitize_app_bundle(&app);
        assert!(second.errors.is_empty());
        assert_eq!(first.replaced_stubs, 1);
        // re-stubbing an already stubbed framework converges on the same bytes
        assert_eq!(second.replaced_stubs, 1);
        let stub = fs::read(app.join("Frameworks/libcrypto.framework/libcrypto")).unwrap();
        assert_eq!(stub, macho::replacement_stub());
    }
}
