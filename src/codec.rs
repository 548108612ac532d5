/// Audio container labels accepted from capture, in preference order.
///
/// Opus-in-WebM is preferred when the capture side supports it; the plain
/// container labels are fallbacks for older capture stacks.
pub const SUPPORTED_MIME_TYPES: [&str; 4] = [
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/ogg",
];

/// Label used when the capture side reports support for none of the above.
pub const FALLBACK_MIME: &str = "audio/webm";

/// Pick the first supported encoding label, probing with `is_supported`.
pub fn preferred_mime(is_supported: impl Fn(&str) -> bool) -> &'static str {
    SUPPORTED_MIME_TYPES
        .iter()
        .copied()
        .find(|m| is_supported(m))
        .unwrap_or(FALLBACK_MIME)
}
