use crate::sign::SigningOutcome;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SidesignError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Goblin error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("WalkDir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid IPA: {0}")]
    InvalidIpa(String),

    #[error("Invalid app bundle: {0}")]
    InvalidAppBundle(String),

    #[error(".app folder not found in extracted payload")]
    AppBundleNotFound,

    #[error("bundle identifier is required for signing")]
    MissingBundleId,

    #[error("app name is required for signing")]
    MissingAppName,

    #[error("no certificate available; import one or set a default team")]
    MissingCertificate,

    #[error("signing failed: {0}")]
    Signing(SigningOutcome),

    #[error("Signing error: {0}")]
    Sign(String),

    // Post-sign zip failure is its own variant so a successfully signed
    // bundle that failed to ship is distinguishable from extraction errors.
    #[error("failed to package signed IPA: {0}")]
    Packaging(String),

    #[error("failed to bind installation server on {addr}: {source}")]
    ServerBind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Mach-O manipulation error: {0}")]
    MachO(String),

    #[error("sideload cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SidesignError>;
