// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic cache keys over normalized request inputs.

use sha2::{Digest, Sha256};

/// A 256-bit content fingerprint, rendered as lowercase hex.
///
/// Two requests with the same normalized inputs always produce the same
/// fingerprint; the hash domain is separated by operation kind so a
/// translation and a transcription can never collide on key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint for a text translation request.
    ///
    /// Normalization: text is trimmed, language codes are trimmed and
    /// lowercased. `"  Hello "` from `EN` to `es` keys the same as
    /// `"Hello"` from `en` to `es`.
    #[must_use]
    pub fn translation(text: &str, source_lang: &str, target_lang: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"translate\x00");
        hasher.update(normalize_lang(source_lang).as_bytes());
        hasher.update(b"\x00");
        hasher.update(normalize_lang(target_lang).as_bytes());
        hasher.update(b"\x00");
        hasher.update(text.trim().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Fingerprint for an audio transcription request.
    ///
    /// Audio is fingerprinted by a hash of its raw bytes rather than the
    /// bytes themselves appearing in the key.
    #[must_use]
    pub fn transcription(audio: &[u8], language_hint: Option<&str>) -> Self {
        let audio_digest = Sha256::digest(audio);
        let mut hasher = Sha256::new();
        hasher.update(b"transcribe\x00");
        hasher.update(normalize_lang(language_hint.unwrap_or("auto")).as_bytes());
        hasher.update(b"\x00");
        hasher.update(audio_digest);
        Self(hex::encode(hasher.finalize()))
    }

    /// The hex digest, used as the store key.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_lang(lang: &str) -> String {
    lang.trim().to_ascii_lowercase()
}
