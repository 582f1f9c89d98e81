use crate::error::Result;
use crate::layout::{MANIFEST_NAME, SIGNED_IPA_NAME};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Base URL the installation server answers on. Loopback only: the manifest
/// is consumed by the browser on the same device.
pub const BASE_URL: &str = "http://127.0.0.1:8080";

/// OTA installation manifest, the plist Mobile Safari fetches through an
/// `itms-services` link to drive the install sheet.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallationManifest {
    pub items: Vec<ManifestItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestItem {
    pub assets: Vec<Asset>,
    pub metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Asset {
    pub kind: String,
    #[serde(rename = "needs-shine", skip_serializing_if = "Option::is_none")]
    pub needs_shine: Option<bool>,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "bundle-identifier")]
    pub bundle_identifier: String,
    #[serde(rename = "bundle-version")]
    pub bundle_version: String,
    pub kind: String,
    pub title: String,
}

impl InstallationManifest {
    /// Builds the manifest for one signed app. Icon assets are listed only
    /// when the app actually ships an icon the server can fetch.
    pub fn for_app(bundle_id: &str, bundle_version: &str, title: &str, has_icon: bool) -> Self {
        let mut assets = vec![Asset {
            kind: "software-package".to_string(),
            needs_shine: None,
            url: format!("{BASE_URL}/{SIGNED_IPA_NAME}"),
        }];
        if has_icon {
            let icon_url = format!("{BASE_URL}/appIcon.png");
            assets.push(Asset {
                kind: "display-image".to_string(),
                needs_shine: Some(false),
                url: icon_url.clone(),
            });
            assets.push(Asset {
                kind: "full-size-image".to_string(),
                needs_shine: Some(false),
                url: icon_url,
            });
        }

        Self {
            items: vec![ManifestItem {
                assets,
                metadata: Metadata {
                    bundle_identifier: bundle_id.to_string(),
                    bundle_version: bundle_version.to_string(),
                    kind: "software".to_string(),
                    title: title.to_string(),
                },
            }],
        }
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        plist::to_file_xml(path, self)?;
        Ok(())
    }
}

/// The link the device opens to start the OTA install.
pub fn install_url() -> String {
    format!("itms-services://?action=download-manifest&url={BASE_URL}/{MANIFEST_NAME}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn manifest_with_icon_lists_three_assets() {
        let manifest = InstallationManifest::for_app("com.example.app", "2.1", "Example", true);
        let item = &manifest.items[0];
        assert_eq!(item.assets.len(), 3);
        assert_eq!(item.assets[0].kind, "software-package");
        assert_eq!(item.assets[0].url, "http://127.0.0.1:8080/debugger.ipa");
        assert!(item.assets[0].needs_shine.is_none());
        assert_eq!(item.assets[1].kind, "display-image");
        assert_eq!(item.assets[1].needs_shine, Some(false));
        assert_eq!(item.assets[2].kind, "full-size-image");
        assert_eq!(item.metadata.kind, "software");
        assert_eq!(item.metadata.title, "Example");
    }

    #[test]
    fn manifest_without_icon_omits_image_assets() {
        let manifest = InstallationManifest::for_app("com.example.app", "1", "Example", false);
        assert_eq!(manifest.items[0].assets.len(), 1);
    }

    #[test]
    fn manifest_round_trips_through_xml_plist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("install.plist");

        InstallationManifest::for_app("com.example.app", "1", "Example", true)
            .write_to(&path)
            .unwrap();

        let read: InstallationManifest = plist::from_file(&path).unwrap();
        assert_eq!(read.items[0].metadata.bundle_identifier, "com.example.app");
        assert_eq!(read.items[0].assets[1].needs_shine, Some(false));

        // serde renames land as the kebab-case keys the install sheet expects
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("<key>bundle-identifier</key>"));
        assert!(raw.contains("<key>needs-shine</key>"));
    }

    #[test]
    fn install_link_points_at_the_manifest() {
        assert_eq!(
            install_url(),
            "itms-services://?action=download-manifest&url=http://127.0.0.1:8080/install.plist"
        );
    }
}
