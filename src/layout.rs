use std::path::{Path, PathBuf};

/// Well-known filenames under the documents root. The pipeline deliberately
/// uses fixed, non-unique paths so the janitor always knows what to clean;
/// the cost is that only one sideload run may be active at a time.
pub const SIGNED_IPA_NAME: &str = "debugger.ipa";
pub const MANIFEST_NAME: &str = "install.plist";
pub const PAYLOAD_DIR_NAME: &str = "Payload";
pub const DOWNLOADED_IPA_NAME: &str = "downloaded-file.ipa";
pub const CERTIFICATES_DIR_NAME: &str = "certificates";
pub const TWEAKS_DIR_NAME: &str = "tweaks";
pub const TEMP_FILES_DIR_NAME: &str = "temp-files";

/// Leftovers from the old single-certificate workflow, removed only when the
/// janitor is told to delete certificates.
pub const LEGACY_CERT_FILES: [&str; 2] = ["sidesign-cert.p12", "sidesign-cert.mobileprovision"];

/// Fixed filesystem layout rooted at the app's documents directory.
#[derive(Debug, Clone)]
pub struct Layout {
    documents: PathBuf,
    scratch: PathBuf,
}

impl Layout {
    pub fn new<P: AsRef<Path>>(documents: P) -> Self {
        Self {
            documents: documents.as_ref().to_path_buf(),
            scratch: std::env::temp_dir(),
        }
    }

    /// Redirect the OS scratch directory, used by tests.
    pub fn with_scratch<P: AsRef<Path>>(mut self, scratch: P) -> Self {
        self.scratch = scratch.as_ref().to_path_buf();
        self
    }

    pub fn documents(&self) -> &Path {
        &self.documents
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn signed_ipa(&self) -> PathBuf {
        self.documents.join(SIGNED_IPA_NAME)
    }

    pub fn manifest(&self) -> PathBuf {
        self.documents.join(MANIFEST_NAME)
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.documents.join(PAYLOAD_DIR_NAME)
    }

    pub fn downloaded_ipa(&self) -> PathBuf {
        self.documents.join(DOWNLOADED_IPA_NAME)
    }

    pub fn certificates_dir(&self) -> PathBuf {
        self.documents.join(CERTIFICATES_DIR_NAME)
    }

    pub fn tweaks_dir(&self) -> PathBuf {
        self.documents.join(TWEAKS_DIR_NAME)
    }

    pub fn temp_files_dir(&self) -> PathBuf {
        self.documents.join(TEMP_FILES_DIR_NAME)
    }
}
