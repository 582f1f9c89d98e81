use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// A resolved certificate/profile pair. Read-only: the pipeline never
/// mutates certificate folders.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub p12: PathBuf,
    pub provisioning_profile: PathBuf,
    pub password: Option<String>,
}

/// Resolves the certificate to use when the caller did not pick one
/// explicitly. Layout: one folder per team name under the certificates
/// root, holding a `.p12`, a `.mobileprovision`, and an optional
/// `password.txt`. The default team name is a single persisted string.
pub struct DefaultCertificateStore {
    certificates_dir: PathBuf,
}

const DEFAULT_TEAM_FILE: &str = ".default-team";

impl DefaultCertificateStore {
    pub fn new<P: AsRef<Path>>(certificates_dir: P) -> Self {
        Self {
            certificates_dir: certificates_dir.as_ref().to_path_buf(),
        }
    }

    pub fn default_team(&self) -> Option<String> {
        let name = fs::read_to_string(self.certificates_dir.join(DEFAULT_TEAM_FILE)).ok()?;
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    pub fn set_default_team(&self, team_name: &str) -> Result<()> {
        fs::create_dir_all(&self.certificates_dir)?;
        fs::write(self.certificates_dir.join(DEFAULT_TEAM_FILE), team_name)?;
        Ok(())
    }

    pub fn clear_default_team(&self) -> Result<()> {
        let path = self.certificates_dir.join(DEFAULT_TEAM_FILE);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// An unset or broken default means "no certificate", never "pick any":
    /// there is deliberately no fallback search across other team folders.
    pub fn resolve(&self) -> Option<CertificateBundle> {
        let team = self.default_team()?;
        self.resolve_team(&team)
    }

    pub fn resolve_team(&self, team_name: &str) -> Option<CertificateBundle> {
        let folder = self.certificates_dir.join(team_name);
        if !folder.is_dir() {
            log::warn!("certificate folder missing for team {team_name}");
            return None;
        }

        let entries: Vec<PathBuf> = fs::read_dir(&folder)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();

        let by_extension = |ext: &str| {
            entries.iter().find(|p| {
                p.extension()
                    .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
                    .unwrap_or(false)
            })
        };

        let p12 = by_extension("p12")?.clone();
        let provisioning_profile = by_extension("mobileprovision")?.clone();

        let password = entries
            .iter()
            .find(|p| p.file_name().map(|n| n == "password.txt").unwrap_or(false))
            .and_then(|p| fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Some(CertificateBundle {
            p12,
            provisioning_profile,
            password,
        })
    }
}
