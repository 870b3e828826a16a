//! Service errors, serializable so they can cross an RPC boundary.

use serde::{Deserialize, Serialize};

use capstan_engine::RenderError;
use capstan_manifests::SortError;
use capstan_names::NameError;
use capstan_store::StoreError;

#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum ServiceError {
    #[error("no chart provided")]
    MissingChart,
    #[error("no release provided")]
    MissingRelease,
    #[error("client version is incompatible")]
    IncompatibleVersion,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("cannot re-use a name that is still in use: {0}")]
    InUse(String),
    #[error("release name too long: {0}")]
    TooLong(String),
    #[error("no available release name found")]
    Exhausted,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("manifest kind error: {0}")]
    KindParse(String),
    #[error("unknown api version: {0}")]
    UnknownApiVersion(String),
    #[error("unknown hook event: {0}")]
    UnknownHookEvent(String),
    #[error("render failed: {0}")]
    Render(String),
    #[error("storage failed: {0}")]
    Storage(String),
    #[error("orchestrator failed: {0}")]
    Orchestrator(String),
    #[error("hook failed: {0}")]
    HookFailed(String),
}

impl ServiceError {
    /// Stable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::MissingChart => "missing_chart",
            ServiceError::MissingRelease => "missing_release",
            ServiceError::IncompatibleVersion => "incompatible_version",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::AlreadyExists(_) => "already_exists",
            ServiceError::InUse(_) => "in_use",
            ServiceError::TooLong(_) => "too_long",
            ServiceError::Exhausted => "exhausted",
            ServiceError::InvalidArgument(_) => "invalid_argument",
            ServiceError::KindParse(_) => "kind_parse_error",
            ServiceError::UnknownApiVersion(_) => "unknown_api_version",
            ServiceError::UnknownHookEvent(_) => "unknown_hook_event",
            ServiceError::Render(_) => "render_error",
            ServiceError::Storage(_) => "storage_error",
            ServiceError::Orchestrator(_) => "orchestrator_error",
            ServiceError::HookFailed(_) => "hook_failed",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { name } => ServiceError::NotFound(name),
            StoreError::AlreadyExists { name, version } => {
                ServiceError::AlreadyExists(format!("{} (v{})", name, version))
            }
            StoreError::Driver(msg) => ServiceError::Storage(msg),
        }
    }
}

impl From<NameError> for ServiceError {
    fn from(e: NameError) -> Self {
        match e {
            NameError::TooLong(n) => ServiceError::TooLong(n),
            NameError::InvalidName(n) => ServiceError::InvalidArgument(format!("bad name {:?}", n)),
            NameError::AlreadyExists(n) => ServiceError::AlreadyExists(n),
            NameError::InUse(n) => ServiceError::InUse(n),
            NameError::Exhausted => ServiceError::Exhausted,
            NameError::Store(e) => e.into(),
        }
    }
}

impl From<SortError> for ServiceError {
    fn from(e: SortError) -> Self {
        match e {
            SortError::HeadParse { .. } | SortError::MissingKind { .. } => {
                ServiceError::KindParse(e.to_string())
            }
            SortError::UnknownApiVersion { .. } => ServiceError::UnknownApiVersion(e.to_string()),
            SortError::UnknownHookEvent { .. } => ServiceError::UnknownHookEvent(e.to_string()),
        }
    }
}

impl From<RenderError> for ServiceError {
    fn from(e: RenderError) -> Self {
        ServiceError::Render(e.to_string())
    }
}

impl From<capstan_core::ValueError> for ServiceError {
    fn from(e: capstan_core::ValueError) -> Self {
        ServiceError::Render(e.to_string())
    }
}
