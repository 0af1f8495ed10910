//! Image reference normalization (spec §3 "Image Reference (`IR`)", R1).
//!
//! Equality between two refs is string equality after normalization: a
//! missing tag defaults to `latest`, but a digest reference is left alone
//! (it is already maximally specific and carries no tag).

const DEFAULT_TAG: &str = "latest";

/// A parsed image reference: `registry/repo[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub repo: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a raw ref string, without filling in the default tag.
    pub fn parse(raw: &str) -> Self {
        let (without_digest, digest) = match raw.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (raw, None),
        };

        // The tag separator is the LAST colon after the last slash, so a
        // registry port (`localhost:5000/repo`) isn't mistaken for a tag.
        let last_slash = without_digest.rfind('/');
        let tag_colon = without_digest.rfind(':').filter(|&i| match last_slash {
            Some(slash) => i > slash,
            None => true,
        });

        let (repo, tag) = match tag_colon {
            Some(i) => (
                without_digest[..i].to_string(),
                Some(without_digest[i + 1..].to_string()),
            ),
            None => (without_digest.to_string(), None),
        };

        Self { repo, tag, digest }
    }

    /// Normalize: fill in `latest` when neither tag nor digest is present.
    pub fn normalized(raw: &str) -> Self {
        let mut parsed = Self::parse(raw);
        if parsed.tag.is_none() && parsed.digest.is_none() {
            parsed.tag = Some(DEFAULT_TAG.to_string());
        }
        parsed
    }

    /// Render back to the canonical string form.
    pub fn format(&self) -> String {
        let mut s = self.repo.clone();
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

/// Normalize a ref for use as an Image Coordinator map key: two refs that
/// name the same image (module default tag) compare equal.
pub fn normalize_key(raw: &str) -> String {
    ImageReference::normalized(raw).format()
}
