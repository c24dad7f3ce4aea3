use thiserror::Error;

/// Validation failures for the entry URL. All of them are raised before the
/// crawl starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("no protocol information found in {0}")]
    NoProtocolInformation(String),
    #[error("please remove port information from {0}")]
    UnsupportedPortSpecifier(String),
    #[error("malformed url: {0}")]
    MalformedUrl(String),
}

/// Outcome of a failed platform upload.
///
/// The two "already uploaded" variants are soft: they carry the remote
/// identifier of the existing upload so callers can memoize them as success.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload attempted without an active session")]
    NotLoggedIn,
    #[error("already uploaded in this session: {remote}")]
    AlreadyUploadedInSession { remote: String },
    #[error("file already uploaded: {remote}")]
    FileAlreadyUploaded { remote: String },
    #[error("upload rejected by platform: {message}")]
    Rejected { message: String },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl UploadError {
    /// Remote identifier for the soft outcomes, `None` for real failures.
    pub fn memoized_remote(&self) -> Option<&str> {
        match self {
            Self::AlreadyUploadedInSession { remote } | Self::FileAlreadyUploaded { remote } => {
                Some(remote)
            }
            _ => None,
        }
    }
}
