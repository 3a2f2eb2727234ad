//! Name, path and content checks shared by ingestion and retrieval.

use image::ImageFormat;

/// Number of leading bytes needed to sniff every supported media type
pub const SNIFF_LEN: usize = 16;

/// Longest extension kept in a stored name
pub const MAX_EXTENSION_LEN: usize = 16;

/// Extension of a client-declared filename
///
/// Taken from the last `.`-delimited segment. A name without a dot, or with
/// a trailing dot, has no extension; so does one longer than
/// [`MAX_EXTENSION_LEN`] characters. Characters that could escape the shard
/// directory are replaced.
pub fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() || ext.chars().count() > MAX_EXTENSION_LEN {
        return None;
    }
    Some(sanitize_extension(ext))
}

/// Replace anything outside `[A-Za-z0-9_-]` with `_`
pub fn sanitize_extension(ext: &str) -> String {
    ext.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// A shard directory name is exactly two lower-case hex digits
pub fn is_valid_shard(shard: &str) -> bool {
    shard.len() == 2 && shard.bytes().all(is_lower_hex)
}

/// A stored leaf is `<32 hex>` optionally followed by `.<sanitized ext>`
///
/// Temporary `.part` files never match because they start with a dot.
pub fn is_valid_object_name(name: &str) -> bool {
    let (id, ext) = match name.split_once('.') {
        Some((id, ext)) => (id, Some(ext)),
        None => (name, None),
    };

    let id_ok = id.len() == 32 && id.bytes().all(is_lower_hex);
    let ext_ok = ext.map_or(true, |e| {
        !e.is_empty()
            && e.len() <= MAX_EXTENSION_LEN
            && e.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });

    id_ok && ext_ok
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// Identify the media type of an upload from its leading bytes
pub fn detect_media_type(head: &[u8]) -> Option<&'static str> {
    if let Ok(format) = image::guess_format(head) {
        match format {
            ImageFormat::Png => return Some("image/png"),
            ImageFormat::Jpeg => return Some("image/jpeg"),
            ImageFormat::Gif => return Some("image/gif"),
            _ => {}
        }
    }

    // ISO base media: 4-byte box size followed by "ftyp" and the major brand
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"qt  " => Some("video/quicktime"),
            _ => Some("video/mp4"),
        };
    }

    // EBML magic, used by WebM and Matroska
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("video/webm");
    }

    None
}

/// Content type served for a stored extension
pub fn content_type_for(extension: Option<&str>) -> &'static str {
    let ext = extension.map(str::to_ascii_lowercase).unwrap_or_default();

    match ext.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" | "qt" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Whether content sniffed as `detected` may be served as `declared`
///
/// Extensions without a specific type are served as octet streams and
/// accept anything. MP4 and QuickTime share the ISO base media container.
pub fn is_compatible_type(declared: &str, detected: &str) -> bool {
    const ISO_BMFF: [&str; 2] = ["video/mp4", "video/quicktime"];

    declared == "application/octet-stream"
        || declared == detected
        || (ISO_BMFF.contains(&declared) && ISO_BMFF.contains(&detected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("cat.PNG").as_deref(), Some("PNG"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of("trailing."), None);
        assert_eq!(extension_of(".hidden").as_deref(), Some("hidden"));
    }

    #[test]
    fn test_extension_cannot_traverse() {
        assert_eq!(extension_of("x.a/../b").as_deref(), Some("_b"));
        assert_eq!(extension_of("clip.mp4/../../etc").as_deref(), Some("_etc"));
        assert_eq!(sanitize_extension("we ird"), "we_ird");
    }

    #[test]
    fn test_overlong_extension_is_dropped() {
        let sixteen = "a".repeat(MAX_EXTENSION_LEN);
        assert_eq!(extension_of(&format!("clip.{sixteen}")), Some(sixteen.clone()));
        assert_eq!(extension_of(&format!("clip.{sixteen}x")), None);
        assert_eq!(extension_of(&format!("clip.{}", "m".repeat(300))), None);

        let id = "0123456789abcdef0123456789abcdef";
        assert!(is_valid_object_name(&format!("{id}.{sixteen}")));
        assert!(!is_valid_object_name(&format!("{id}.{sixteen}x")));
    }

    #[test]
    fn test_compatible_types() {
        assert!(is_compatible_type("image/png", "image/png"));
        assert!(is_compatible_type("application/octet-stream", "video/webm"));
        assert!(is_compatible_type("video/quicktime", "video/mp4"));
        assert!(!is_compatible_type("image/png", "video/mp4"));
        assert!(!is_compatible_type("image/gif", "image/jpeg"));
    }

    #[test]
    fn test_shard_validation() {
        assert!(is_valid_shard("0f"));
        assert!(!is_valid_shard("0F"));
        assert!(!is_valid_shard("abc"));
        assert!(!is_valid_shard(".."));
    }

    #[test]
    fn test_object_name_validation() {
        let id = "0123456789abcdef0123456789abcdef";
        assert!(is_valid_object_name(id));
        assert!(is_valid_object_name(&format!("{id}.png")));
        assert!(is_valid_object_name(&format!("{id}.JPG")));
        assert!(!is_valid_object_name(&format!("{id}.")));
        assert!(!is_valid_object_name(&format!(".{id}.part")));
        assert!(!is_valid_object_name("../secret.txt"));
        assert!(!is_valid_object_name(&format!("{id}.a.b")));
    }

    #[test]
    fn test_detect_media_type() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(detect_media_type(&png), Some("image/png"));

        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];
        assert_eq!(detect_media_type(&jpeg), Some("image/jpeg"));

        assert_eq!(detect_media_type(b"GIF89a\x01\x00\x01\x00"), Some("image/gif"));
        assert_eq!(
            detect_media_type(b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00"),
            Some("video/mp4")
        );
        assert_eq!(
            detect_media_type(b"\x00\x00\x00\x14ftypqt  \x00\x00\x00\x00"),
            Some("video/quicktime")
        );
        assert_eq!(
            detect_media_type(&[0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42, 0x86, 0x81]),
            Some("video/webm")
        );
        assert_eq!(detect_media_type(b"<html><script>"), None);
        assert_eq!(detect_media_type(b""), None);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Some("JPG")), "image/jpeg");
        assert_eq!(content_type_for(Some("png")), "image/png");
        assert_eq!(content_type_for(Some("mov")), "video/quicktime");
        assert_eq!(content_type_for(Some("exe")), "application/octet-stream");
        assert_eq!(content_type_for(None), "application/octet-stream");
    }
}
