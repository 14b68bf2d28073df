//! Upload validation
//!
//! Pure, synchronous checks run before any bytes reach a backend:
//!
//! - filename rules ([`filename_violations`]) and sanitization ([`sanitize_filename`])
//! - extension allow-list ([`ALLOWED_KINDS`], optionally narrowed by configuration)
//! - size bounds ([`validate_size`])
//! - declared MIME type vs. magic bytes ([`ContentVerifier`])
//!
//! [`validate_file_upload`] runs all of them and reports every violated rule
//! at once.
//!
//! # Examples
//!
//! ```rust
//! use invoice_storage::validation::{validate_file_upload, UploadRules, ValidationError};
//!
//! let rules = UploadRules::default();
//!
//! assert!(validate_file_upload(b"%PDF-1.7 ...", "invoice.pdf", "application/pdf", &rules).is_ok());
//!
//! let errors = validate_file_upload(b"MZ", "report.exe", "application/pdf", &rules).unwrap_err();
//! assert!(errors.contains(&ValidationError::ExtensionNotAllowed { extension: "exe".into() }));
//! ```

mod filename;
mod path;
mod signature;

pub use filename::{
    extension_of, filename_violations, sanitize_filename, sanitize_path_segment, split_extension,
    validate_filename,
    MAX_FILENAME_LENGTH, MAX_STEM_LENGTH,
};
pub use path::validate_storage_path;
pub use signature::{
    is_allowed_mime, kind_for_extension, looks_like_text, mime_for_extension, normalize_mime,
    ContentVerifier, FileKind, ALLOWED_KINDS, TEXT_SNIFF_LEN,
};

use crate::config::StorageSettings;

/// Default upper bound for a single attachment (10 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// A single violated upload rule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Filename is empty or whitespace
    #[error("Filename is empty")]
    EmptyFilename,

    /// Filename exceeds the length limit
    #[error("Filename is {length} characters long (maximum {max})")]
    FilenameTooLong {
        /// Actual length in characters
        length: usize,
        /// Permitted maximum
        max: usize,
    },

    /// Filename contains `/` or `\`
    #[error("Filename must not contain path separators")]
    PathSeparator,

    /// Filename contains `..`
    #[error("Filename must not contain '..'")]
    ParentReference,

    /// Filename contains a NUL byte
    #[error("Filename must not contain null bytes")]
    NullByte,

    /// Filename contains a control character
    #[error("Filename must not contain control characters")]
    ControlCharacter,

    /// Filename has no extension
    #[error("File has no extension")]
    MissingExtension,

    /// Extension is not allow-listed
    #[error("File type '.{extension}' is not allowed")]
    ExtensionNotAllowed {
        /// Lower-cased extension
        extension: String,
    },

    /// Payload is empty
    #[error("File is empty")]
    EmptyFile,

    /// Payload exceeds the configured maximum
    #[error("File is {size} bytes (maximum {max})")]
    FileTooLarge {
        /// Actual size in bytes
        size: u64,
        /// Configured maximum in bytes
        max: u64,
    },

    /// Declared MIME type is not allow-listed
    #[error("Content type '{mime}' is not allowed")]
    MimeTypeNotAllowed {
        /// Normalized declared MIME type
        mime: String,
    },

    /// Declared MIME type does not belong to the file's extension
    #[error("Content type '{mime}' does not match extension '.{extension}'")]
    MimeExtensionMismatch {
        /// Normalized declared MIME type
        mime: String,
        /// Lower-cased extension
        extension: String,
    },

    /// Content does not start with a signature of the declared type
    #[error("File content does not match declared type '{mime}'{}", detected_suffix(.detected))]
    SignatureMismatch {
        /// Normalized declared MIME type
        mime: String,
        /// What the content appears to be, when recognisable
        detected: Option<String>,
    },
}

fn detected_suffix(detected: &Option<String>) -> String {
    detected
        .as_ref()
        .map(|d| format!(" (looks like {d})"))
        .unwrap_or_default()
}

/// Limits applied by [`validate_file_upload`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRules {
    /// Largest accepted payload in bytes
    pub max_file_size: u64,
    /// Narrower extension allow-list; `None` allows every [`ALLOWED_KINDS`] entry
    pub allowed_extensions: Option<Vec<String>>,
}

impl Default for UploadRules {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: None,
        }
    }
}

impl UploadRules {
    /// Builds rules from storage settings
    #[must_use]
    pub fn from_settings(settings: &StorageSettings) -> Self {
        Self {
            max_file_size: settings.max_file_size,
            allowed_extensions: settings.allowed_extensions.as_ref().map(|list| {
                list.iter()
                    .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect()
            }),
        }
    }

    /// Whether `extension` (lower-case, no dot) may be uploaded
    ///
    /// An override can only narrow the built-in list, since content of an
    /// unknown kind cannot be verified.
    #[must_use]
    pub fn allows_extension(&self, extension: &str) -> bool {
        kind_for_extension(extension).is_some()
            && self
                .allowed_extensions
                .as_ref()
                .is_none_or(|list| list.iter().any(|e| e == extension))
    }
}

/// Checks a payload size against `max`
pub const fn validate_size(size: u64, max: u64) -> Result<(), ValidationError> {
    if size == 0 {
        Err(ValidationError::EmptyFile)
    } else if size > max {
        Err(ValidationError::FileTooLarge { size, max })
    } else {
        Ok(())
    }
}

/// Validates an upload, returning every violated rule
///
/// Checks run in order (filename, extension, size, declared type, content)
/// but none short-circuits the others, except that content is only sniffed
/// once the declared type is known to be allow-listed and the payload is
/// non-empty.
pub fn validate_file_upload(
    data: &[u8],
    filename: &str,
    declared_mime: &str,
    rules: &UploadRules,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = filename_violations(filename);

    let extension = extension_of(filename);
    match extension.as_deref() {
        None if !filename.trim().is_empty() => errors.push(ValidationError::MissingExtension),
        Some(ext) if !rules.allows_extension(ext) => {
            errors.push(ValidationError::ExtensionNotAllowed {
                extension: ext.to_string(),
            });
        }
        _ => {}
    }

    if let Err(e) = validate_size(data.len() as u64, rules.max_file_size) {
        errors.push(e);
    }

    let mime = normalize_mime(declared_mime);
    if is_allowed_mime(&mime) {
        if let Some(kind) = extension.as_deref().and_then(kind_for_extension) {
            if !kind.accepts_mime(&mime) {
                errors.push(ValidationError::MimeExtensionMismatch {
                    mime: mime.clone(),
                    extension: kind.extension.to_string(),
                });
            }
        }
        if !data.is_empty() {
            if let Err(e) = ContentVerifier::new().verify(data, &mime) {
                errors.push(e);
            }
        }
    } else {
        errors.push(ValidationError::MimeTypeNotAllowed { mime });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n";

    #[test]
    fn test_valid_pdf_passes() {
        assert!(validate_file_upload(PDF, "invoice.pdf", "application/pdf", &UploadRules::default()).is_ok());
    }

    #[test]
    fn test_uppercase_extension_passes() {
        assert!(validate_file_upload(PDF, "INVOICE.PDF", "Application/PDF", &UploadRules::default()).is_ok());
    }

    #[test]
    fn test_exe_rejected_regardless_of_declared_type() {
        for mime in ["application/pdf", "application/x-msdownload", "text/plain"] {
            let errors = validate_file_upload(b"MZ\x90\x00\x03", "report.exe", mime, &UploadRules::default())
                .unwrap_err();
            assert!(errors.contains(&ValidationError::ExtensionNotAllowed {
                extension: "exe".to_string()
            }));
        }
    }

    #[test]
    fn test_spoofed_pdf_rejected() {
        let errors = validate_file_upload(
            b"this is plain text",
            "invoice.pdf",
            "application/pdf",
            &UploadRules::default(),
        )
        .unwrap_err();

        assert_eq!(
            errors,
            vec![ValidationError::SignatureMismatch {
                mime: "application/pdf".to_string(),
                detected: None,
            }]
        );
    }

    #[test]
    fn test_reports_every_violation() {
        let rules = UploadRules {
            max_file_size: 4,
            allowed_extensions: None,
        };
        let errors = validate_file_upload(b"not a png", "../x.exe", "image/png", &rules).unwrap_err();

        assert!(errors.contains(&ValidationError::PathSeparator));
        assert!(errors.contains(&ValidationError::ParentReference));
        assert!(errors.contains(&ValidationError::ExtensionNotAllowed {
            extension: "exe".to_string()
        }));
        assert!(errors.contains(&ValidationError::FileTooLarge { size: 9, max: 4 }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::SignatureMismatch { .. })));
    }

    #[test]
    fn test_empty_payload() {
        let errors = validate_file_upload(b"", "a.pdf", "application/pdf", &UploadRules::default()).unwrap_err();
        assert_eq!(errors, vec![ValidationError::EmptyFile]);
    }

    #[test]
    fn test_missing_extension() {
        let errors = validate_file_upload(PDF, "invoice", "application/pdf", &UploadRules::default()).unwrap_err();
        assert_eq!(errors, vec![ValidationError::MissingExtension]);
    }

    #[test]
    fn test_mime_extension_mismatch() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        let errors = validate_file_upload(&png, "scan.pdf", "image/png", &UploadRules::default()).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::MimeExtensionMismatch {
                mime: "image/png".to_string(),
                extension: "pdf".to_string(),
            }]
        );
    }

    #[test]
    fn test_override_narrows_allow_list() {
        let rules = UploadRules {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: Some(vec!["pdf".to_string(), "exe".to_string()]),
        };

        assert!(rules.allows_extension("pdf"));
        assert!(!rules.allows_extension("png"));
        assert!(!rules.allows_extension("exe"));
    }

    #[test]
    fn test_rules_from_settings() {
        let settings = StorageSettings {
            max_file_size: 1024,
            allowed_extensions: Some(vec![" .PDF ".to_string(), String::new(), "csv".to_string()]),
            ..StorageSettings::default()
        };
        let rules = UploadRules::from_settings(&settings);

        assert_eq!(rules.max_file_size, 1024);
        assert_eq!(
            rules.allowed_extensions,
            Some(vec!["pdf".to_string(), "csv".to_string()])
        );
    }

    #[test]
    fn test_size_bounds() {
        assert_eq!(validate_size(0, 10), Err(ValidationError::EmptyFile));
        assert!(validate_size(10, 10).is_ok());
        assert_eq!(
            validate_size(11, 10),
            Err(ValidationError::FileTooLarge { size: 11, max: 10 })
        );
    }

    #[test]
    fn test_error_messages() {
        let err = ValidationError::SignatureMismatch {
            mime: "application/pdf".to_string(),
            detected: Some("image/png".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "File content does not match declared type 'application/pdf' (looks like image/png)"
        );
        assert_eq!(
            ValidationError::ExtensionNotAllowed { extension: "exe".to_string() }.to_string(),
            "File type '.exe' is not allowed"
        );
    }
}
