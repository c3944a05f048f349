//! Extension / MIME / magic-byte policy applied to every finalized upload.
//!
//! The table is static: an upload is only acceptable when its extension is
//! listed, the client-declared MIME matches what the extension allows, the
//! sniffed MIME is plausible for the extension, and (where defined) one of
//! the magic prefixes matches the leading bytes.

use serde_json::json;

pub const DEFAULT_MAX_SIZE_BYTES: i64 = 50 * 1024 * 1024;
pub const DEMO_MAX_SIZE_BYTES: i64 = 10 * 1024 * 1024;

/// Undetected samples shorter than this are too ambiguous to call text.
const TEXT_SNIFF_MIN_LEN: usize = 16;

const OFFICE_SNIFF_MIMES: &[&str] = &[
    "application/zip",
    "application/octet-stream",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

const ZIP_MAGIC: &[&[u8]] = &[b"PK\x03\x04"];

#[derive(Debug)]
pub struct TypeRule {
    pub expected_mimes: &'static [&'static str],
    pub sniff_mimes: &'static [&'static str],
    pub magic_prefixes: &'static [&'static [u8]],
    pub max_size_bytes: Option<i64>,
}

static PDF: TypeRule = TypeRule {
    expected_mimes: &["application/pdf"],
    sniff_mimes: &["application/pdf"],
    magic_prefixes: &[b"%PDF-"],
    max_size_bytes: None,
};

static TXT: TypeRule = TypeRule {
    expected_mimes: &["text/plain"],
    sniff_mimes: &["text/plain"],
    magic_prefixes: &[],
    max_size_bytes: None,
};

static CSV: TypeRule = TypeRule {
    expected_mimes: &["text/csv", "application/csv"],
    sniff_mimes: &["text/plain", "text/csv"],
    magic_prefixes: &[],
    max_size_bytes: None,
};

static PNG: TypeRule = TypeRule {
    expected_mimes: &["image/png"],
    sniff_mimes: &["image/png"],
    magic_prefixes: &[b"\x89PNG\r\n\x1a\n"],
    max_size_bytes: None,
};

static JPEG: TypeRule = TypeRule {
    expected_mimes: &["image/jpeg"],
    sniff_mimes: &["image/jpeg"],
    magic_prefixes: &[b"\xff\xd8\xff"],
    max_size_bytes: None,
};

static GIF: TypeRule = TypeRule {
    expected_mimes: &["image/gif"],
    sniff_mimes: &["image/gif"],
    magic_prefixes: &[b"GIF87a", b"GIF89a"],
    max_size_bytes: None,
};

// Office OpenXML files are ZIP containers; accept zip-like sniff values but
// require extension + declared MIME + ZIP magic.
static DOCX: TypeRule = TypeRule {
    expected_mimes: &[
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/zip",
        "application/octet-stream",
    ],
    sniff_mimes: OFFICE_SNIFF_MIMES,
    magic_prefixes: ZIP_MAGIC,
    max_size_bytes: None,
};

static XLSX: TypeRule = TypeRule {
    expected_mimes: &[
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "application/zip",
        "application/octet-stream",
    ],
    sniff_mimes: OFFICE_SNIFF_MIMES,
    magic_prefixes: ZIP_MAGIC,
    max_size_bytes: None,
};

static PPTX: TypeRule = TypeRule {
    expected_mimes: &[
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "application/zip",
        "application/octet-stream",
    ],
    sniff_mimes: OFFICE_SNIFF_MIMES,
    magic_prefixes: ZIP_MAGIC,
    max_size_bytes: None,
};

pub fn rule_for_extension(ext: &str) -> Option<&'static TypeRule> {
    match ext {
        "pdf" => Some(&PDF),
        "txt" => Some(&TXT),
        "csv" => Some(&CSV),
        "png" => Some(&PNG),
        "jpg" | "jpeg" => Some(&JPEG),
        "gif" => Some(&GIF),
        "docx" => Some(&DOCX),
        "xlsx" => Some(&XLSX),
        "pptx" => Some(&PPTX),
        _ => None,
    }
}

/// Lower-cased extension of `filename`, without the dot.
pub fn extension_of(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// MIME value with parameters stripped, trimmed, lower-cased.
pub fn base_mime(value: &str) -> String {
    value.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Best-effort MIME detection over the leading bytes of an object.
///
/// Magic-number matching first; samples that match nothing but hold
/// printable text of at least `TEXT_SNIFF_MIN_LEN` bytes sniff as
/// `text/plain`, remaining non-empty samples as `application/octet-stream`.
pub fn sniff_mime(sample: &[u8]) -> Option<String> {
    if sample.is_empty() {
        return None;
    }
    if let Some(kind) = infer::get(sample) {
        return Some(kind.mime_type().to_owned());
    }
    if sample.len() >= TEXT_SNIFF_MIN_LEN && looks_like_text(sample) {
        return Some("text/plain".to_owned());
    }
    Some("application/octet-stream".to_owned())
}

fn looks_like_text(sample: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(sample) else {
        return false;
    };
    text.chars().all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyReason {
    DisallowedExtension,
    TooLarge,
    TypeSizeLimit,
    DeclaredMimeMismatch,
    SniffMissing,
    SniffMismatch,
    MagicMissing,
    MagicMismatch,
}

impl PolicyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyReason::DisallowedExtension => "disallowed_extension",
            PolicyReason::TooLarge => "too_large",
            PolicyReason::TypeSizeLimit => "type_size_limit",
            PolicyReason::DeclaredMimeMismatch => "declared_mime_mismatch",
            PolicyReason::SniffMissing => "sniff_missing",
            PolicyReason::SniffMismatch => "sniff_mismatch",
            PolicyReason::MagicMissing => "magic_missing",
            PolicyReason::MagicMismatch => "magic_mismatch",
        }
    }
}

#[derive(Debug)]
pub struct PolicyViolation {
    pub reason: PolicyReason,
    pub details: serde_json::Value,
}

#[derive(Debug)]
pub struct PolicyInput<'a> {
    pub original_filename: &'a str,
    pub declared_content_type: &'a str,
    pub sniffed_content_type: Option<&'a str>,
    pub size_bytes: Option<i64>,
    pub sample: Option<&'a [u8]>,
    /// Global cap; `None` disables it. Demo uploads pass 10 MiB here.
    pub max_size_bytes: Option<i64>,
}

pub fn validate_upload(input: &PolicyInput<'_>) -> Result<(), PolicyViolation> {
    let Some(ext) = extension_of(input.original_filename) else {
        return Err(PolicyViolation {
            reason: PolicyReason::DisallowedExtension,
            details: json!({ "filename": input.original_filename }),
        });
    };
    let Some(rule) = rule_for_extension(&ext) else {
        return Err(PolicyViolation {
            reason: PolicyReason::DisallowedExtension,
            details: json!({ "filename": input.original_filename, "ext": ext }),
        });
    };

    if let (Some(max), Some(size)) = (input.max_size_bytes, input.size_bytes) {
        if size > max {
            return Err(PolicyViolation {
                reason: PolicyReason::TooLarge,
                details: json!({ "size": size, "max": max }),
            });
        }
    }
    if let (Some(max), Some(size)) = (rule.max_size_bytes, input.size_bytes) {
        if size > max {
            return Err(PolicyViolation {
                reason: PolicyReason::TypeSizeLimit,
                details: json!({ "size": size, "max": max, "ext": ext }),
            });
        }
    }

    let declared = base_mime(input.declared_content_type);
    if !rule.expected_mimes.contains(&declared.as_str()) {
        return Err(PolicyViolation {
            reason: PolicyReason::DeclaredMimeMismatch,
            details: json!({ "declared": declared, "ext": ext }),
        });
    }

    let Some(sniffed) = input.sniffed_content_type else {
        return Err(PolicyViolation {
            reason: PolicyReason::SniffMissing,
            details: json!({ "ext": ext }),
        });
    };
    let sniffed = base_mime(sniffed);
    if !rule.sniff_mimes.contains(&sniffed.as_str()) {
        return Err(PolicyViolation {
            reason: PolicyReason::SniffMismatch,
            details: json!({ "sniffed": sniffed, "declared": declared, "ext": ext }),
        });
    }

    if !rule.magic_prefixes.is_empty() {
        let Some(sample) = input.sample.filter(|s| !s.is_empty()) else {
            return Err(PolicyViolation {
                reason: PolicyReason::MagicMissing,
                details: json!({ "ext": ext }),
            });
        };
        if !rule.magic_prefixes.iter().any(|prefix| sample.starts_with(prefix)) {
            return Err(PolicyViolation {
                reason: PolicyReason::MagicMismatch,
                details: json!({ "ext": ext, "sniffed": sniffed }),
            });
        }
    }

    Ok(())
}
