//! Image identifier formats and what can be read from a storage URL.

use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;

/// `<24-hex exam id>-<N>`: index into an import-time ordering.
static POSITIONAL_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-f0-9]{24})-(\d+)$").expect("valid regex"));

/// Generated ids of the old uploader. No positional meaning.
static GENERATED_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^cm[lk][a-z0-9]+$").expect("valid regex"));

static STABLE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^img-[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}\.jpg$").expect("valid regex")
});

static FILE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12})(?:\.jpg)?")
        .expect("valid regex")
});

static OWNER_FOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)_([a-f0-9]{8,24})$").expect("valid regex"));

/// Identifier format of a stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    /// `img-<uuid>.jpg`
    Stable,
    /// `<examId>-<N>`
    Positional,
    /// `cml…` / `cmk…`
    Generated,
    Other,
}

impl IdFormat {
    pub fn of(id: &str) -> Self {
        if STABLE_ID.is_match(id) {
            IdFormat::Stable
        } else if POSITIONAL_ID.is_match(id) {
            IdFormat::Positional
        } else if GENERATED_ID.is_match(id) {
            IdFormat::Generated
        } else {
            IdFormat::Other
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, IdFormat::Positional | IdFormat::Generated)
    }
}

pub fn is_legacy_id(id: &str) -> bool {
    IdFormat::of(id).is_legacy()
}

/// Split a positional id into its exam prefix and index.
pub fn parse_positional(id: &str) -> Option<(&str, usize)> {
    let caps = POSITIONAL_ID.captures(id)?;
    let prefix = caps.get(1)?.as_str();
    let index = caps.get(2)?.as_str().parse().ok()?;
    Some((prefix, index))
}

/// Last path segment of a URL, query and fragment removed, percent-decoded.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next().filter(|s| !s.is_empty())?;
    Some(percent_decode_str(segment).decode_utf8_lossy().into_owned())
}

/// Content-derived id `img-<uuid>.jpg` from the URL's file name.
pub fn stable_image_id(url: &str) -> Option<String> {
    let file_name = file_name_from_url(url)?;
    let uuid = FILE_UUID.captures(&file_name)?.get(1)?.as_str().to_ascii_lowercase();
    Some(format!("img-{uuid}.jpg"))
}

/// Owner name encoded in `…/patients/<Owner_Name>_<hex>/<file>` URLs.
pub fn owner_name_from_url(url: &str) -> Option<String> {
    let decoded = percent_decode_str(url).decode_utf8_lossy();
    let mut segments = decoded.split('/');
    segments.find(|s| *s == "patients")?;
    let folder = segments.next()?;
    // The folder must be followed by a file name.
    segments.next()?;
    let caps = OWNER_FOLDER.captures(folder)?;
    let name = caps.get(1)?.as_str().replace('_', " ");
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://upcdn.io/W142hJk/raw/patients/Maria_Jose_da_Silva_697001ce4e429636ed944c10/\
                       0d9c5d1e-6b7a-4c4e-9d51-2f8a3c7b9e10.jpg?w=800";

    #[test]
    fn test_id_formats() {
        assert_eq!(IdFormat::of("697001ce4e429636ed944c10-3"), IdFormat::Positional);
        assert_eq!(IdFormat::of("cmlz1x2y3000008l4abcd"), IdFormat::Generated);
        assert_eq!(
            IdFormat::of("img-0d9c5d1e-6b7a-4c4e-9d51-2f8a3c7b9e10.jpg"),
            IdFormat::Stable
        );
        assert_eq!(IdFormat::of("3f1c2e"), IdFormat::Other);
        assert!(is_legacy_id("cmkabc"));
        assert!(!is_legacy_id("img-0d9c5d1e-6b7a-4c4e-9d51-2f8a3c7b9e10.jpg"));
    }

    #[test]
    fn test_parse_positional_reads_full_number() {
        assert_eq!(
            parse_positional("697001ce4e429636ed944c10-11"),
            Some(("697001ce4e429636ed944c10", 11))
        );
        assert_eq!(parse_positional("cmkabc"), None);
        assert_eq!(parse_positional("697001ce4e429636ed944c10-"), None);
    }

    #[test]
    fn test_stable_id_from_url() {
        assert_eq!(
            stable_image_id(URL).as_deref(),
            Some("img-0d9c5d1e-6b7a-4c4e-9d51-2f8a3c7b9e10.jpg")
        );
        // Upper case, no extension
        assert_eq!(
            stable_image_id("https://cdn/x/0D9C5D1E-6B7A-4C4E-9D51-2F8A3C7B9E10").as_deref(),
            Some("img-0d9c5d1e-6b7a-4c4e-9d51-2f8a3c7b9e10.jpg")
        );
        assert_eq!(stable_image_id("https://cdn/x/photo.jpg"), None);
        assert_eq!(stable_image_id("https://cdn/x/"), None);
    }

    #[test]
    fn test_file_name_is_decoded() {
        assert_eq!(
            file_name_from_url("https://cdn/x/OD%20retina.jpg?x=1").as_deref(),
            Some("OD retina.jpg")
        );
    }

    #[test]
    fn test_owner_name_from_url() {
        assert_eq!(owner_name_from_url(URL).as_deref(), Some("Maria Jose da Silva"));
        assert_eq!(
            owner_name_from_url("https://cdn/patients/Jo%C3%A3o_Lima_abcdef12/a.jpg").as_deref(),
            Some("João Lima")
        );
        assert_eq!(owner_name_from_url("https://cdn/exams/x/a.jpg"), None);
        assert_eq!(owner_name_from_url("https://cdn/patients/NoHexSuffix/a.jpg"), None);
    }
}
