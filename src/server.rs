use crate::error::{Result, SidesignError};
use crate::layout::Layout;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Loopback HTTP server the OTA install sheet downloads from. Serves exactly
/// the three artifacts the manifest references; everything else is a 404.
pub struct InstallationServer {
    layout: Layout,
    addr: SocketAddr,
    shutdown: Mutex<Option<CancellationToken>>,
}

pub const ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 8080);

#[derive(Clone)]
struct ServeState {
    signed_ipa: PathBuf,
    manifest: PathBuf,
    icon: Option<PathBuf>,
}

impl InstallationServer {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            addr: SocketAddr::from(ADDR),
            shutdown: Mutex::new(None),
        }
    }

    /// Bind somewhere other than the fixed loopback port, used by tests.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Starts (or restarts) the server for the current run. A previous
    /// instance is shut down first so the rebind cannot race it; repeated
    /// calls converge on one listener serving the freshest artifacts.
    pub async fn start(&self, icon: Option<PathBuf>) -> Result<()> {
        let mut shutdown = self.shutdown.lock().await;
        if let Some(previous) = shutdown.take() {
            previous.cancel();
            // give the old listener a beat to release the port
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let addr = self.addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| SidesignError::ServerBind { addr, source })?;

        let token = CancellationToken::new();
        let app = router(ServeState {
            signed_ipa: self.layout.signed_ipa(),
            manifest: self.layout.manifest(),
            icon,
        });

        let serve_token = token.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            if let Err(e) = result {
                log::error!("installation server stopped: {e}");
            }
        });

        log::info!("installation server listening on {addr}");
        *shutdown = Some(token);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().await.take() {
            token.cancel();
        }
    }
}

fn router(state: ServeState) -> Router {
    Router::new()
        .route("/debugger.ipa", get(serve_ipa))
        .route("/install.plist", get(serve_manifest))
        .route("/appIcon.png", get(serve_icon))
        .with_state(Arc::new(state))
}

/// Artifacts are read from disk per request, never cached: the janitor and
/// the next signing run rewrite them underneath the server.
async fn serve_ipa(State(state): State<Arc<ServeState>>) -> Response {
    serve_file(&state.signed_ipa, "application/octet-stream").await
}

async fn serve_manifest(State(state): State<Arc<ServeState>>) -> Response {
    serve_file(&state.manifest, "text/xml").await
}

/// Falls back to a synthesized placeholder so the install sheet always has
/// an image to show, even for apps that ship no icon.
async fn serve_icon(State(state): State<Arc<ServeState>>) -> Response {
    if let Some(icon) = &state.icon {
        if let Ok(bytes) = tokio::fs::read(icon).await {
            return ([(header::CONTENT_TYPE, "image/png")], bytes).into_response();
        }
        log::warn!("app icon unreadable, serving placeholder: {}", icon.display());
    }
    match placeholder_icon() {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(e) => {
            log::error!("failed to encode placeholder icon: {e}");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn serve_file(path: &PathBuf, content_type: &'static str) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Err(e) => {
            log::warn!("request for missing artifact {}: {e}", path.display());
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Solid 120x120 PNG, the size the install sheet requests for display icons.
fn placeholder_icon() -> Result<Vec<u8>> {
    let image = image::RgbaImage::from_pixel(120, 120, image::Rgba([58, 58, 60, 255]));
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}
