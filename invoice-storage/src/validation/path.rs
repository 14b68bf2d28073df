//! Path-safety checks shared by every backend

use crate::storage::types::{StorageError, StorageResult};

/// Rejects backend-relative paths that could escape the storage root
///
/// Every path-taking backend operation calls this before any I/O. A valid
/// path is relative, uses `/` separators, and has no `..` segment, NUL byte,
/// or control character.
///
/// ```rust
/// use invoice_storage::validation::validate_storage_path;
///
/// assert!(validate_storage_path("invoices/2024/one-time/Mar/a.pdf").is_ok());
/// assert!(validate_storage_path("../etc/passwd").is_err());
/// assert!(validate_storage_path("/etc/passwd").is_err());
/// ```
pub fn validate_storage_path(path: &str) -> StorageResult<()> {
    let reject = |reason: &str| -> StorageResult<()> {
        Err(StorageError::InvalidPath(format!("{reason}: {path:?}")))
    };

    if path.trim().is_empty() {
        return reject("empty path");
    }
    if path.contains('\0') {
        return reject("path contains a null byte");
    }
    if path.chars().any(char::is_control) {
        return reject("path contains control characters");
    }
    if path.contains('\\') {
        return reject("path contains a backslash");
    }
    if path.starts_with('/') {
        return reject("absolute path");
    }
    if has_drive_prefix(path) {
        return reject("path has a drive prefix");
    }
    if path.split('/').any(|segment| segment == "..") {
        return reject("path escapes the storage root");
    }

    Ok(())
}

fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_relative_paths() {
        for path in [
            "a.pdf",
            "invoices/2024/Recurring/Monthly_Rent/1700000000000_deadbeef_lease.pdf",
            "Invoice Attachments/Invoices/2024/03/42/scan.png",
            "dir/./file.txt",
            "name..with..dots.txt",
        ] {
            assert!(validate_storage_path(path).is_ok(), "{path}");
        }
    }

    #[test]
    fn test_rejects_escapes() {
        for path in [
            "",
            "  ",
            "..",
            "../secret",
            "invoices/../../secret",
            "invoices/..",
            "/etc/passwd",
            "\\\\server\\share",
            "invoices\\..\\x",
            "C:/Windows/system32",
            "c:file",
            "bad\0name",
            "line\nbreak",
        ] {
            let err = validate_storage_path(path).unwrap_err();
            assert_eq!(err.code().as_str(), "INVALID_PATH", "{path:?}");
        }
    }
}
