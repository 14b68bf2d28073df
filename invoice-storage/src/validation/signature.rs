//! Allow-listed file kinds and magic number verification
//!
//! A client-provided Content-Type is never trusted on its own. Every
//! allow-listed kind carries the leading byte signatures its content must
//! start with, and an upload declaring that kind is rejected unless the buffer
//! matches one of them.
//!
//! Plain text kinds (`txt`, `csv`) have no signature. They are accepted when
//! the first [`TEXT_SNIFF_LEN`] bytes contain no NUL byte and `infer` does not
//! recognise a binary format in the buffer.

use super::ValidationError;

/// Number of leading bytes inspected by the text heuristic
pub const TEXT_SNIFF_LEN: usize = 8 * 1024;

const PDF: &[u8] = b"%PDF";
const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
// FF D8 FF followed by a marker byte that varies by encoder (E0 JFIF, E1 Exif, DB raw, EE Adobe)
const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF];
const GIF87A: &[u8] = b"GIF87a";
const GIF89A: &[u8] = b"GIF89a";
const ZIP: &[u8] = &[0x50, 0x4B, 0x03, 0x04];
const OLE2: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// An allow-listed attachment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileKind {
    /// Lower-case extension without the dot
    pub extension: &'static str,
    /// Canonical MIME type
    pub mime_type: &'static str,
    /// Other MIME types clients commonly declare for this kind
    pub aliases: &'static [&'static str],
    /// Accepted leading byte sequences; empty for text kinds
    pub signatures: &'static [&'static [u8]],
}

impl FileKind {
    /// Whether this kind is verified by the text heuristic instead of a signature
    #[must_use]
    pub const fn is_text(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Whether `mime` names this kind
    #[must_use]
    pub fn accepts_mime(&self, mime: &str) -> bool {
        self.mime_type == mime || self.aliases.contains(&mime)
    }

    /// Whether `data` starts with one of this kind's signatures
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        if self.is_text() {
            looks_like_text(data)
        } else {
            self.signatures.iter().any(|sig| data.starts_with(sig))
        }
    }
}

/// Every kind an invoice attachment may be
pub static ALLOWED_KINDS: &[FileKind] = &[
    FileKind {
        extension: "pdf",
        mime_type: "application/pdf",
        aliases: &[],
        signatures: &[PDF],
    },
    FileKind {
        extension: "png",
        mime_type: "image/png",
        aliases: &[],
        signatures: &[PNG],
    },
    FileKind {
        extension: "jpg",
        mime_type: "image/jpeg",
        aliases: &["image/jpg", "image/pjpeg"],
        signatures: &[JPEG],
    },
    FileKind {
        extension: "jpeg",
        mime_type: "image/jpeg",
        aliases: &["image/jpg", "image/pjpeg"],
        signatures: &[JPEG],
    },
    FileKind {
        extension: "gif",
        mime_type: "image/gif",
        aliases: &[],
        signatures: &[GIF87A, GIF89A],
    },
    FileKind {
        extension: "docx",
        mime_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        aliases: &[],
        signatures: &[ZIP],
    },
    FileKind {
        extension: "xlsx",
        mime_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        aliases: &[],
        signatures: &[ZIP],
    },
    FileKind {
        extension: "xls",
        mime_type: "application/vnd.ms-excel",
        aliases: &[],
        signatures: &[OLE2],
    },
    FileKind {
        extension: "doc",
        mime_type: "application/msword",
        aliases: &[],
        signatures: &[OLE2],
    },
    FileKind {
        extension: "txt",
        mime_type: "text/plain",
        aliases: &[],
        signatures: &[],
    },
    FileKind {
        extension: "csv",
        mime_type: "text/csv",
        aliases: &["application/csv", "text/plain"],
        signatures: &[],
    },
];

/// Looks up an allow-listed kind by extension (case-insensitive)
#[must_use]
pub fn kind_for_extension(extension: &str) -> Option<&'static FileKind> {
    let extension = extension.trim_start_matches('.');
    ALLOWED_KINDS
        .iter()
        .find(|kind| kind.extension.eq_ignore_ascii_case(extension))
}

/// Canonical MIME type for an extension, if the extension is allow-listed
#[must_use]
pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    kind_for_extension(extension).map(|kind| kind.mime_type)
}

/// Whether any allow-listed kind accepts `mime`
#[must_use]
pub fn is_allowed_mime(mime: &str) -> bool {
    ALLOWED_KINDS.iter().any(|kind| kind.accepts_mime(mime))
}

/// Lower-cases a Content-Type and drops parameters such as `charset`
#[must_use]
pub fn normalize_mime(declared: &str) -> String {
    declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Text heuristic used for kinds without a signature
#[must_use]
pub fn looks_like_text(data: &[u8]) -> bool {
    let head = &data[..data.len().min(TEXT_SNIFF_LEN)];
    if head.contains(&0) {
        return false;
    }
    infer::get(head).is_none_or(|t| t.matcher_type() == infer::MatcherType::Text)
}

/// Verifies that content matches the MIME type a client declared
///
/// ```rust
/// use invoice_storage::validation::ContentVerifier;
///
/// let verifier = ContentVerifier::new();
/// assert!(verifier.verify(b"%PDF-1.7\n...", "application/pdf").is_ok());
/// assert!(verifier.verify(b"just some text", "application/pdf").is_err());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentVerifier {
    _private: (),
}

impl ContentVerifier {
    /// Creates a verifier over [`ALLOWED_KINDS`]
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Detects the MIME type of `data` from its content
    ///
    /// The allow-list signatures are consulted first, then `infer` for
    /// anything else. Text content yields `None` because it has no signature.
    #[must_use]
    pub fn detect(&self, data: &[u8]) -> Option<&'static str> {
        ALLOWED_KINDS
            .iter()
            .filter(|kind| !kind.is_text())
            .find(|kind| kind.signatures.iter().any(|sig| data.starts_with(sig)))
            .map(|kind| kind.mime_type)
            .or_else(|| infer::get(data).map(|t| t.mime_type()))
    }

    /// Checks `data` against the signatures of every kind declaring `mime`
    ///
    /// `mime` is normalized first. A MIME type outside the allow-list fails with
    /// [`ValidationError::MimeTypeNotAllowed`]; content that matches none of the
    /// kind's signatures fails with [`ValidationError::SignatureMismatch`].
    pub fn verify(&self, data: &[u8], mime: &str) -> Result<(), ValidationError> {
        let mime = normalize_mime(mime);
        let mut kinds = ALLOWED_KINDS
            .iter()
            .filter(|kind| kind.accepts_mime(&mime))
            .peekable();

        if kinds.peek().is_none() {
            return Err(ValidationError::MimeTypeNotAllowed { mime });
        }

        if kinds.any(|kind| kind.matches(data)) {
            Ok(())
        } else {
            Err(ValidationError::SignatureMismatch {
                mime,
                detected: self.detect(data).map(str::to_string),
            })
        }
    }
}
