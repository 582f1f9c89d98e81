use clap::{Parser, Subcommand};
use sidesign::certificates::DefaultCertificateStore;
use sidesign::ipa::convert_app_bundle_to_ipa;
use sidesign::server::InstallationServer;
use sidesign::{
    AdhocSigner, Layout, Orchestrator, Result, SidesignError, Signer, SigningRequest,
};
use sidesign::progress::SigningSession;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "sidesign")]
#[command(about = "on-device iOS app signer and OTA installer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// The app to sign and install (.app/.ipa/.tipa)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Documents root for artifacts, certificates and tweaks
    #[arg(long, default_value = ".")]
    documents: PathBuf,

    /// Certificate team folder to use (defaults to the stored default team)
    #[arg(short, long)]
    team: Option<String>,

    /// Override the app's bundle id
    #[arg(short = 'b')]
    bundle_id: Option<String>,

    /// Override the app's display name
    #[arg(short = 'n')]
    name: Option<String>,

    /// Override the app's version
    #[arg(short = 'v')]
    version: Option<String>,

    /// Explicit P12 certificate (bypasses the certificate store)
    #[arg(long, requires = "profile")]
    p12: Option<PathBuf>,

    /// Explicit provisioning profile
    #[arg(long, requires = "p12")]
    profile: Option<PathBuf>,

    /// Password for the explicit P12
    #[arg(long)]
    password: Option<String>,

    /// A tweak dylib/framework to inject and link
    #[arg(short = 'f', long)]
    tweak: Option<PathBuf>,

    /// Default tweaks (by name, from the tweaks folder) to inject
    #[arg(long = "default-tweak")]
    default_tweaks: Vec<String>,

    /// Also wipe imported certificates during the pre-run sweep
    #[arg(long)]
    delete_certificates: bool,

    /// Exit right after publishing instead of waiting out the install window
    #[arg(long)]
    no_wait: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set the default certificate team
    SetTeam {
        /// Folder name under certificates/
        name: String,
    },

    /// Forget the default certificate team
    ClearTeam,
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let layout = Layout::new(&cli.documents);
    let store = DefaultCertificateStore::new(layout.certificates_dir());

    match cli.command {
        Some(Commands::SetTeam { name }) => {
            store.set_default_team(&name)?;
            println!("[*] default team set to {}", name);
            Ok(())
        }
        Some(Commands::ClearTeam) => {
            store.clear_default_team()?;
            println!("[*] default team cleared");
            Ok(())
        }
        None => {
            let input = cli
                .input
                .clone()
                .ok_or_else(|| SidesignError::InvalidIpa("Input is required".to_string()))?;
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(sideload(cli, layout, store, input))
        }
    }
}

async fn sideload(
    cli: Cli,
    layout: Layout,
    store: DefaultCertificateStore,
    input: PathBuf,
) -> Result<()> {
    let input_ext = input
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    if !matches!(input_ext.as_deref(), Some("app" | "ipa" | "tipa")) {
        return Err(SidesignError::InvalidIpa(
            "Input must be an .ipa, .tipa, or .app".to_string(),
        ));
    }
    if !input.exists() {
        return Err(SidesignError::FileNotFound(input));
    }

    // a raw .app bundle gets wrapped into an IPA first
    let ipa = if input_ext.as_deref() == Some("app") {
        println!("[*] converting app bundle to ipa...");
        fs::create_dir_all(layout.temp_files_dir())?;
        convert_app_bundle_to_ipa(&input, layout.documents(), layout.temp_files_dir())?
    } else {
        input
    };

    let certificate = match (&cli.p12, &cli.profile) {
        (Some(p12), Some(profile)) => Some(sidesign::certificates::CertificateBundle {
            p12: p12.clone(),
            provisioning_profile: profile.clone(),
            password: cli.password.clone(),
        }),
        _ => match &cli.team {
            Some(team) => store.resolve_team(team),
            None => store.resolve(),
        },
    }
    .ok_or(SidesignError::MissingCertificate)?;

    let session = SigningSession::new();
    let server = Arc::new(InstallationServer::new(layout.clone()));
    let cancel = CancellationToken::new();
    let signer: Arc<dyn Signer> = Arc::new(AdhocSigner);

    // progress printer
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let update = rx.borrow_and_update().clone();
            if !update.message.is_empty() {
                println!("[*] {:>3.0}% {}", update.percent, update.message);
            }
        }
    });

    let ctrlc_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n[>] cancelling...");
            ctrlc_cancel.cancel();
        }
    });

    let orchestrator = Orchestrator::new(layout, signer, session, server, cancel);
    let report = orchestrator
        .run(SigningRequest {
            ipa,
            certificate,
            bundle_id: cli.bundle_id,
            display_name: cli.name,
            bundle_version: cli.version,
            tweak: cli.tweak,
            default_tweaks: cli.default_tweaks,
            delete_certificates: cli.delete_certificates,
        })
        .await?;

    println!("[*] open this link on the device to install:");
    println!("[*]   {}", report.install_url);

    if !cli.no_wait {
        println!("[*] serving for the install window, ctrl-c to stop early");
        orchestrator.cleanup_after_install().await;
    }

    Ok(())
}
