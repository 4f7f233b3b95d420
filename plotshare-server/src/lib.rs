pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod repository;
pub mod service;

pub use error::{ChatError, ErrorKind, LifecycleError, ServiceError};
pub use service::{OpenChannel, PendingCount, PlotShareService};

pub fn get_service_version() -> String {
    // Prefer a commit hash stamped in by the release build.
    if let Some(git_hash) = option_env!("PLOTSHARE_GIT_HASH") {
        if git_hash.len() >= 8 {
            return git_hash[..8].to_string();
        }
        return git_hash.to_string();
    }
    env!("CARGO_PKG_VERSION").to_string()
}

pub struct AppState {
    pub service: PlotShareService,
    /// Shared secret the fronting gateway must present. `None` disables the check.
    pub api_auth_token: Option<String>,
}
