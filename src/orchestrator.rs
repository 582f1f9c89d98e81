use crate::bundle::{self, BundleIdentity};
use crate::certificates::CertificateBundle;
use crate::error::{Result, SidesignError};
use crate::frameworks;
use crate::ipa;
use crate::janitor::Janitor;
use crate::layout::Layout;
use crate::manifest::{self, InstallationManifest};
use crate::progress::{self, SigningSession, SigningTimer, Stage};
use crate::server::InstallationServer;
use crate::sign::{SignInputs, Signer, SigningOutcome};
use crate::tweaks::{self, TweakInjector};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long the signed archive stays served after the install link is
/// published, so the device finishes downloading before cleanup.
pub const INSTALL_GRACE: Duration = Duration::from_secs(60);

/// One sideload request, fully resolved: the certificate has already been
/// picked (explicitly or via the default store) before this is built.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub ipa: PathBuf,
    pub certificate: CertificateBundle,
    /// Overrides for the signing identity; `None` keeps the app's own values.
    pub bundle_id: Option<String>,
    pub display_name: Option<String>,
    pub bundle_version: Option<String>,
    pub tweak: Option<PathBuf>,
    pub default_tweaks: Vec<String>,
    pub delete_certificates: bool,
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct SideloadReport {
    pub identity: BundleIdentity,
    pub install_url: String,
    pub elapsed: Duration,
}

/// Drives one IPA through the full pipeline: sweep, extract, sanitize,
/// inject, sign, repackage, publish. Stages run strictly in order; the
/// cancellation token is honored at every stage boundary.
pub struct Orchestrator {
    layout: Layout,
    signer: Arc<dyn Signer>,
    session: SigningSession,
    server: Arc<InstallationServer>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        layout: Layout,
        signer: Arc<dyn Signer>,
        session: SigningSession,
        server: Arc<InstallationServer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            layout,
            signer,
            session,
            server,
            cancel,
        }
    }

    pub async fn run(&self, request: SigningRequest) -> Result<SideloadReport> {
        match self.run_inner(&request).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.session.fail(e.to_string());
                // leave nothing half-signed behind; certificates always survive
                Janitor::new(self.layout.clone()).clear_before_run(false);
                Err(e)
            }
        }
    }

    async fn run_inner(&self, request: &SigningRequest) -> Result<SideloadReport> {
        validate_overrides(request)?;

        self.checkpoint()?;
        self.session.update(Stage::Idle, 0.0, "preparing");
        Janitor::new(self.layout.clone()).clear_before_run(request.delete_certificates);

        let source = request.ipa.clone();
        if !source.exists() {
            return Err(SidesignError::FileNotFound(source));
        }
        let staged = self.layout.downloaded_ipa();
        let stage_to = staged.clone();
        tokio::task::spawn_blocking(move || std::fs::copy(&source, &stage_to).map(|_| ()))
            .await
            .map_err(join_error)??;

        let timer = SigningTimer::start(&staged);

        // extract
        self.checkpoint()?;
        self.session.update(Stage::Extracting, 10.0, "extracting app");
        let documents = self.layout.documents().to_path_buf();
        let extract_from = staged.clone();
        let payload = tokio::task::spawn_blocking(move || {
            ipa::extract_payload(&extract_from, &documents)
        })
        .await
        .map_err(join_error)??;

        let identity = bundle::read_identity(&payload, request.bundle_id.as_deref())?;
        let app_dir = bundle::locate_main_app_bundle(&payload).ok_or(SidesignError::AppBundleNotFound)?;
        self.session.update(
            Stage::Extracting,
            30.0,
            format!("extracted {}", identity.display_name),
        );

        // sanitize and inject before the signer sees the bundle
        self.checkpoint()?;
        let report = frameworks::sanitize_app_bundle(&app_dir);
        if report.replaced_stubs > 0 {
            log::info!("replaced {} problematic framework executable(s)", report.replaced_stubs);
        }
        TweakInjector::new(self.layout.tweaks_dir(), request.default_tweaks.clone())
            .inject_defaults(&app_dir);

        // sign
        self.checkpoint()?;
        self.session.update(Stage::Signing, 50.0, "signing app");
        // the override, when present, is already folded into the identity
        let bundle_id = identity.bundle_id.clone();
        let display_name = request
            .display_name
            .clone()
            .unwrap_or_else(|| identity.display_name.clone());
        let bundle_version = request
            .bundle_version
            .clone()
            .unwrap_or_else(|| identity.bundle_version.clone());
        let inputs = SignInputs {
            app_dir: app_dir.clone(),
            p12: request.certificate.p12.clone(),
            provisioning_profile: request.certificate.provisioning_profile.clone(),
            password: request.certificate.password.clone().unwrap_or_default(),
            bundle_id: bundle_id.clone(),
            bundle_version: bundle_version.clone(),
            display_name,
            tweak: request.tweak.clone(),
        };

        let total = tweaks::count_signable_items(&app_dir);
        let signed = Arc::new(AtomicUsize::new(0));
        let signer = Arc::clone(&self.signer);
        let session = self.session.clone();
        let counter = Arc::clone(&signed);
        let code = tokio::task::spawn_blocking(move || {
            let on_item_signed = move || {
                let done = counter.fetch_add(1, Ordering::SeqCst) + 1;
                session.update(
                    Stage::Signing,
                    progress::tweak_percent(done, total),
                    format!("signed {done}/{total} items"),
                );
            };
            signer.sign(&inputs, &on_item_signed)
        })
        .await
        .map_err(join_error)?;

        let outcome = SigningOutcome::from_code(code);
        if !outcome.is_success() {
            timer.stop();
            warn_if_wrapped(&bundle_id, outcome);
            return Err(SidesignError::Signing(outcome));
        }

        // repackage; the bundle is signed by now, so zip failures get their
        // own error variant
        self.checkpoint()?;
        self.session.update(Stage::Packaging, 60.0, "packaging signed app");
        let tree_root = self.layout.documents().to_path_buf();
        let output = self.layout.signed_ipa();
        tokio::task::spawn_blocking(move || ipa::build_archive(&tree_root, &output))
            .await
            .map_err(|e| SidesignError::Packaging(e.to_string()))?
            .map_err(|e| SidesignError::Packaging(e.to_string()))?;

        // publish
        self.checkpoint()?;
        self.session
            .update(Stage::PublishingManifest, 80.0, "writing install manifest");
        InstallationManifest::for_app(
            &bundle_id,
            &bundle_version,
            &identity.display_name,
            identity.icon_path.is_some(),
        )
        .write_to(self.layout.manifest())?;

        self.checkpoint()?;
        self.server.start(identity.icon_path.clone()).await?;

        let elapsed = timer.stop();
        self.session.update(Stage::Succeeded, 100.0, "ready to install");
        log::info!(
            "signed {} in {:.1}s (estimated {:.1}s)",
            identity.display_name,
            elapsed.as_secs_f64(),
            timer.estimate().as_secs_f64(),
        );

        Ok(SideloadReport {
            identity,
            install_url: manifest::install_url(),
            elapsed,
        })
    }

    /// Waits out the grace period, then sweeps the served artifacts. Returns
    /// early without cleaning if the run is being torn down already.
    pub async fn cleanup_after_install(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(INSTALL_GRACE) => {}
        }
        self.server.stop().await;
        Janitor::new(self.layout.clone()).clear_after_install();
        log::info!("post-install cleanup complete");
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SidesignError::Cancelled);
        }
        Ok(())
    }
}

fn join_error(e: tokio::task::JoinError) -> SidesignError {
    SidesignError::Io(std::io::Error::other(e))
}

fn validate_overrides(request: &SigningRequest) -> Result<()> {
    if matches!(&request.bundle_id, Some(id) if id.trim().is_empty()) {
        return Err(SidesignError::MissingBundleId);
    }
    if matches!(&request.display_name, Some(name) if name.trim().is_empty()) {
        return Err(SidesignError::MissingAppName);
    }
    Ok(())
}

/// Apps that went through a third-party wrapper service often ship
/// executables the signer cannot rewrite. Advisory only.
fn warn_if_wrapped(bundle_id: &str, outcome: SigningOutcome) {
    if outcome == SigningOutcome::ToolFailure && bundle_id.to_ascii_lowercase().contains("circlefy")
    {
        log::warn!("app appears to have been repackaged by a wrapper service; re-export it from a clean IPA and try again");
    }
}
