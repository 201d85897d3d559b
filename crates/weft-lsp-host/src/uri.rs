//! Conversion from project roots to `file://` URIs.

use std::path::Path;

use lsp_types::Uri;
use url::Url;

use crate::errors::LspHostError;

/// Converts an absolute path to a `file://` URI, percent-encoding as needed.
///
/// # Errors
///
/// Returns [`LspHostError::InvalidRoot`] for relative paths or paths the
/// URI grammar cannot represent.
pub fn path_to_uri(path: &Path) -> Result<Uri, LspHostError> {
    let invalid = || LspHostError::InvalidRoot {
        path: path.to_path_buf(),
    };
    let url = Url::from_file_path(path).map_err(|()| invalid())?;
    url.as_str().parse().map_err(|_| invalid())
}
