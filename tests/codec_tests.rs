// Encoding selection tests: preference order over the supported labels and
// the fallback when the capture side supports none of them.

use audioscribe::codec::{preferred_mime, FALLBACK_MIME, SUPPORTED_MIME_TYPES};

#[test]
fn test_prefers_opus_in_webm_when_supported() {
    assert_eq!(preferred_mime(|_| true), "audio/webm;codecs=opus");
}

#[test]
fn test_falls_through_preference_order() {
    // Capture stack without opus-in-webm lands on the next supported label.
    assert_eq!(
        preferred_mime(|m| m != "audio/webm;codecs=opus"),
        "audio/webm"
    );
    assert_eq!(
        preferred_mime(|m| m == "audio/ogg"),
        "audio/ogg"
    );
}

#[test]
fn test_falls_back_when_nothing_is_supported() {
    assert_eq!(preferred_mime(|_| false), FALLBACK_MIME);
    // The fallback itself is one of the supported labels.
    assert!(SUPPORTED_MIME_TYPES.contains(&FALLBACK_MIME));
}
