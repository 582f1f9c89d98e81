pub mod bundle;
pub mod certificates;
pub mod error;
pub mod frameworks;
pub mod ipa;
pub mod janitor;
pub mod layout;
pub mod macho;
pub mod manifest;
pub mod orchestrator;
pub mod plist_ext;
pub mod progress;
pub mod server;
pub mod sign;
pub mod tweaks;

pub use error::{Result, SidesignError};
pub use layout::Layout;
pub use orchestrator::{Orchestrator, SideloadReport, SigningRequest};
pub use sign::{AdhocSigner, Signer, SigningOutcome};
