//! Core domain model for cohort recovery: path classification heuristics
//! and the TAAS school registry. Everything here is pure and deterministic.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cohort-core";

/// Cohort classification derived from a storage path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomerType {
    Taas,
    B2b,
    B2c,
}

impl CustomerType {
    pub fn as_str(self) -> &'static str {
        match self {
            CustomerType::Taas => "taas",
            CustomerType::B2b => "b2b",
            CustomerType::B2c => "b2c",
        }
    }
}

impl std::fmt::Display for CustomerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Course language detected in a path, one of the five codes we teach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CourseLanguage {
    It,
    Es,
    En,
    Fr,
    De,
}

impl CourseLanguage {
    pub const ALL: [CourseLanguage; 5] = [
        CourseLanguage::It,
        CourseLanguage::Es,
        CourseLanguage::En,
        CourseLanguage::Fr,
        CourseLanguage::De,
    ];

    pub fn code(self) -> &'static str {
        match self {
            CourseLanguage::It => "IT",
            CourseLanguage::Es => "ES",
            CourseLanguage::En => "EN",
            CourseLanguage::Fr => "FR",
            CourseLanguage::De => "DE",
        }
    }
}

/// Attributes derived from one path.
///
/// An empty `filename` means the path was unparsable and must be skipped.
/// `taas_school` is `Some` only when `customer_type` is `Some(Taas)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub filename: String,
    pub customer_type: Option<CustomerType>,
    pub company: String,
    pub course_language: Option<CourseLanguage>,
    pub taas_school: Option<String>,
    pub is_2on1: bool,
}

/// Ordered substring -> canonical label lookup for TAAS schools.
///
/// Matching is case-insensitive on the path side; iteration order is
/// registration order, first match wins.
#[derive(Debug, Clone)]
pub struct SchoolRegistry {
    entries: Vec<(String, String)>,
}

impl SchoolRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, needle: impl Into<String>, label: impl Into<String>) {
        self.entries.push((needle.into().to_lowercase(), label.into()));
    }

    pub fn detect(&self, path: &str) -> Option<&str> {
        let s = path.to_lowercase();
        self.entries
            .iter()
            .find(|(needle, _)| s.contains(needle))
            .map(|(_, label)| label.as_str())
    }
}

impl Default for SchoolRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        for (needle, label) in [
            ("babbel", "BABBEL"),
            ("eureka", "EUREKA"),
            ("au pays des langues", "AU PAYS DES LANGUES"),
            ("pro english courses", "PRO ENGLISH COURSES"),
            ("pronto english", "PRONTO ENGLISH"),
            ("intellecto", "INTELLECTO"),
            ("salt idiomes", "SALT IDIOMES"),
            ("language link", "LANGUAGE LINK"),
            ("lic formation", "LIC FORMATION"),
            ("instituto europeo de formación", "INSTITUTO EUROPEO DE FORMACIÓN"),
            ("international travel advisor", "INTERNATIONAL TRAVEL ADVISOR"),
            ("academy aziendali", "ACADEMY AZIENDALI"),
            ("altissa", "ALTISSA"),
        ] {
            registry.register(needle, label);
        }
        registry
    }
}

/// Spreadsheet name from a path: last `/` segment, last `___` segment,
/// trailing `.tsv[.done|.empty]` stripped case-insensitively, trimmed.
/// Returns an empty string for empty or whitespace-only input.
pub fn extract_filename(path: &str) -> String {
    let s = path.trim().trim_end_matches('\r');
    if s.is_empty() {
        return String::new();
    }
    let tail = s.rsplit('/').next().unwrap_or(s);
    let tail = tail.rsplit("___").next().unwrap_or(tail);
    strip_sheet_suffix(tail).trim().to_string()
}

fn strip_sheet_suffix(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for suffix in [".tsv.done", ".tsv.empty", ".tsv"] {
        if lower.ends_with(suffix) {
            return &name[..name.len() - suffix.len()];
        }
    }
    name
}

/// Cohort inference: TAAS beats B2B; `None` means the path carries no
/// cohort marker at all (callers decide the default per mode).
pub fn infer_customer_type(path: &str, registry: &SchoolRegistry) -> Option<CustomerType> {
    let s = path.to_lowercase();
    if s.contains("taas") || registry.detect(path).is_some() {
        Some(CustomerType::Taas)
    } else if s.contains("b2b") || s.contains("companies") {
        Some(CustomerType::B2b)
    } else {
        None
    }
}

/// Company name from the `Companies` marker convention: the `___` segment
/// after one ending in "companies", with any `" - "` prefix dropped,
/// upper-cased. Empty when the convention is absent.
pub fn extract_company(path: &str) -> String {
    let leaf = path.rsplit('/').next().unwrap_or(path);
    let segments: Vec<&str> = leaf.split("___").collect();
    let marker = segments
        .iter()
        .position(|seg| seg.trim().to_lowercase().ends_with("companies"));
    let Some(idx) = marker else {
        return String::new();
    };
    let Some(raw) = segments.get(idx + 1) else {
        return String::new();
    };
    let raw = match raw.rfind(" - ") {
        Some(pos) => &raw[pos + 3..],
        None => raw,
    };
    raw.trim().to_uppercase()
}

/// Course language from the path. Bracketed `[...]` groups are scanned
/// first, left to right; the full path is only consulted when no bracketed
/// group carries a code. A code only counts when no ASCII letter is
/// immediately adjacent on either side ("DE" in "[DE-Babbel]", not in
/// "ABCDEF").
pub fn extract_course_language(path: &str) -> Option<CourseLanguage> {
    let mut rest = path;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            break;
        };
        if let Some(lang) = scan_for_code(&after[..close]) {
            return Some(lang);
        }
        rest = &after[close + 1..];
    }
    scan_for_code(path)
}

fn scan_for_code(hay: &str) -> Option<CourseLanguage> {
    let bytes = hay.as_bytes();
    for i in 0..bytes.len() {
        for lang in CourseLanguage::ALL {
            let code = lang.code().as_bytes();
            if bytes.len() - i < code.len() || &bytes[i..i + code.len()] != code {
                continue;
            }
            let left_ok = i == 0 || !bytes[i - 1].is_ascii_alphabetic();
            let right_ok =
                i + code.len() >= bytes.len() || !bytes[i + code.len()].is_ascii_alphabetic();
            if left_ok && right_ok {
                return Some(lang);
            }
        }
    }
    None
}

/// 2-on-1 cohort marker.
pub fn detect_is_2on1(path: &str) -> bool {
    path.contains("2-1")
}

/// Full classification of one path.
pub fn classify(path: &str, registry: &SchoolRegistry) -> Classification {
    let customer_type = infer_customer_type(path, registry);
    let taas_school = match customer_type {
        Some(CustomerType::Taas) => registry.detect(path).map(str::to_string),
        _ => None,
    };
    Classification {
        filename: extract_filename(path),
        customer_type,
        company: extract_company(path),
        course_language: extract_course_language(path),
        taas_school,
        is_2on1: detect_is_2on1(path),
    }
}
