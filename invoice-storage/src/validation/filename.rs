//! Filename validation and sanitization

use once_cell::sync::Lazy;
use regex::Regex;

use super::ValidationError;

/// Longest filename accepted from a client
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Longest stem kept by [`sanitize_filename`]
pub const MAX_STEM_LENGTH: usize = 100;

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("Invalid regex"));
static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{2,}").expect("Invalid regex"));

/// Returns every rule a client-supplied filename violates
///
/// An empty vector means the name is acceptable. Names are checked as given;
/// no trimming or decoding happens first.
#[must_use]
pub fn filename_violations(name: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if name.trim().is_empty() {
        errors.push(ValidationError::EmptyFilename);
        return errors;
    }

    let length = name.chars().count();
    if length > MAX_FILENAME_LENGTH {
        errors.push(ValidationError::FilenameTooLong {
            length,
            max: MAX_FILENAME_LENGTH,
        });
    }
    if name.contains('/') || name.contains('\\') {
        errors.push(ValidationError::PathSeparator);
    }
    if name.contains("..") {
        errors.push(ValidationError::ParentReference);
    }
    if name.contains('\0') {
        errors.push(ValidationError::NullByte);
    }
    if name.chars().any(|c| c.is_control() && c != '\0') {
        errors.push(ValidationError::ControlCharacter);
    }

    errors
}

/// Validates a filename, returning the first violated rule
pub fn validate_filename(name: &str) -> Result<(), ValidationError> {
    filename_violations(name)
        .into_iter()
        .next()
        .map_or(Ok(()), Err)
}

/// Splits a filename into stem and extension
///
/// The extension is whatever follows the last dot, provided it is non-empty.
/// `"archive.tar.gz"` yields `("archive.tar", Some("gz"))`.
#[must_use]
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// Lower-cased extension of a filename, if any
#[must_use]
pub fn extension_of(name: &str) -> Option<String> {
    split_extension(name).1.map(str::to_ascii_lowercase)
}

/// Produces a storage-safe filename
///
/// The stem keeps only `[A-Za-z0-9_-]`, with every other character replaced by
/// `_`, underscore runs collapsed, leading/trailing `_`/`-` trimmed and the
/// result capped at [`MAX_STEM_LENGTH`]. An empty stem becomes `file`. The
/// original extension is re-attached lower-cased.
///
/// ```rust
/// use invoice_storage::validation::sanitize_filename;
///
/// assert_eq!(sanitize_filename("My Invoice #1 (Final).PDF"), "My_Invoice_1_Final.pdf");
/// assert_eq!(sanitize_filename("###.txt"), "file.txt");
/// ```
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let (stem, ext) = split_extension(name);
    let stem = sanitize_path_segment(stem);

    let ext: Option<String> = ext
        .map(|e| {
            e.chars()
                .filter(char::is_ascii_alphanumeric)
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|e| !e.is_empty());

    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}

/// Applies the stem rules of [`sanitize_filename`] to a whole string
///
/// Used for directory names such as recurring profile names, where a dot is
/// not an extension separator.
#[must_use]
pub fn sanitize_path_segment(value: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(value, "_");
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches(|c: char| c == '_' || c == '-');

    let capped: String = trimmed.chars().take(MAX_STEM_LENGTH).collect();
    let capped = capped.trim_end_matches(|c: char| c == '_' || c == '-');
    if capped.is_empty() {
        "file".to_string()
    } else {
        capped.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_accepts_plain_names() {
        assert!(validate_filename("invoice-2024_03.pdf").is_ok());
        assert!(validate_filename("scan (1).png").is_ok());
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(validate_filename(""), Err(ValidationError::EmptyFilename));
        assert_eq!(validate_filename("   "), Err(ValidationError::EmptyFilename));
    }

    #[test]
    fn test_rejects_traversal_and_separators() {
        let errors = filename_violations("../etc/passwd");
        assert!(errors.contains(&ValidationError::PathSeparator));
        assert!(errors.contains(&ValidationError::ParentReference));

        assert_eq!(
            validate_filename("dir\\file.txt"),
            Err(ValidationError::PathSeparator)
        );
    }

    #[test]
    fn test_rejects_null_and_control_characters() {
        assert!(filename_violations("evil\0.pdf").contains(&ValidationError::NullByte));
        assert!(filename_violations("bell\u{7}.pdf").contains(&ValidationError::ControlCharacter));
    }

    #[test]
    fn test_rejects_overlong_names() {
        let name = format!("{}.pdf", "a".repeat(300));
        assert!(matches!(
            validate_filename(&name),
            Err(ValidationError::FilenameTooLong { length: 304, max: 255 })
        ));
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", Some("gz")));
        assert_eq!(split_extension("README"), ("README", None));
        assert_eq!(split_extension("trailing."), ("trailing.", None));
        assert_eq!(extension_of("Photo.JPG").as_deref(), Some("jpg"));
    }

    #[test]
    fn test_sanitize_examples() {
        assert_eq!(
            sanitize_filename("My Invoice #1 (Final).PDF"),
            "My_Invoice_1_Final.pdf"
        );
        assert_eq!(sanitize_filename("__--report--__.csv"), "report.csv");
        assert_eq!(sanitize_filename("日本語.docx"), "file.docx");
        assert_eq!(sanitize_filename("no_extension"), "no_extension");
    }

    #[test]
    fn test_sanitize_path_segment() {
        assert_eq!(sanitize_path_segment("Monthly Rent v1.2"), "Monthly_Rent_v1_2");
        assert_eq!(sanitize_path_segment("../.."), "file");
    }

    #[test]
    fn test_sanitize_caps_stem() {
        let long = format!("{}.pdf", "x".repeat(250));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.len(), MAX_STEM_LENGTH + ".pdf".len());
        assert!(sanitized.ends_with(".pdf"));
    }

    proptest! {
        #[test]
        fn sanitize_is_deterministic(name in ".{0,300}") {
            prop_assert_eq!(sanitize_filename(&name), sanitize_filename(&name));
        }

        #[test]
        fn sanitize_output_alphabet(name in ".{0,300}") {
            let sanitized = sanitize_filename(&name);
            let (stem, ext) = split_extension(&sanitized);

            prop_assert!(!stem.is_empty());
            prop_assert!(stem.chars().count() <= MAX_STEM_LENGTH);
            prop_assert!(stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
            prop_assert!(!stem.contains("__"));
            if let Some(ext) = ext {
                prop_assert!(ext.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
            }
            prop_assert!(sanitized.matches('.').count() <= 1);
        }
    }
}
