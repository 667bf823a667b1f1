//! Glyph substitution applied to uploaded notes before conversion.
//!
//! Every emoji or pictographic symbol in the text is replaced by an inline
//! image reference pointing at a locally cached asset, because the document
//! converter cannot render colour glyphs from the default fonts.
//!
//! The rewrite is a whole-document textual substitution. It does not know
//! about fenced code or inline code spans, so glyphs inside those regions are
//! rewritten too.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::{error::ConvertError, glyph_cache::GlyphCache};

static GLYPH_RE: Lazy<Regex> = Lazy::new(|| {
    let pictograph = r"(?:\p{Extended_Pictographic}|\p{Emoji_Presentation})\x{FE0F}?\p{Emoji_Modifier}?";
    let pattern = format!(
        r"\p{{Regional_Indicator}}{{2}}|[0-9#*]\x{{FE0F}}?\x{{20E3}}|{pictograph}(?:\x{{200D}}{pictograph})*"
    );
    Regex::new(&pattern).expect("glyph pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreprocessOutcome {
    pub text: String,
    pub substituted: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Preprocessor {
    cache: GlyphCache,
    glyph_size: String,
}

impl Preprocessor {
    pub fn new(cache: GlyphCache, glyph_size: impl Into<String>) -> Self {
        Self {
            cache,
            glyph_size: glyph_size.into(),
        }
    }

    /// Rewrites every glyph occurrence into an image reference.
    ///
    /// Each distinct glyph is resolved once. Glyphs whose asset cannot be
    /// fetched stay literal; any other cache failure aborts the rewrite so
    /// the caller can fall back to the untouched input.
    pub async fn rewrite(&self, text: &str) -> Result<PreprocessOutcome, ConvertError> {
        let tokens = distinct_tokens(text);
        if tokens.is_empty() {
            return Ok(PreprocessOutcome {
                text: text.to_string(),
                ..Default::default()
            });
        }

        let mut resolved: HashMap<String, PathBuf> = HashMap::with_capacity(tokens.len());
        let mut skipped = 0usize;
        for token in tokens {
            match self.cache.resolve(&token).await {
                Ok(path) => {
                    resolved.insert(token, path);
                }
                Err(err @ ConvertError::Network { .. }) => {
                    warn!(glyph = %token, "Leaving glyph literal: {err}");
                    skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let mut substituted = 0usize;
        let rewritten = GLYPH_RE.replace_all(text, |caps: &Captures| {
            let token = &caps[0];
            match resolved.get(token) {
                Some(path) => {
                    substituted += 1;
                    image_reference(path, &self.glyph_size)
                }
                None => token.to_string(),
            }
        });

        debug!(substituted, skipped, "Glyph substitution finished");
        Ok(PreprocessOutcome {
            text: rewritten.into_owned(),
            substituted,
            skipped,
        })
    }
}

/// Distinct glyph tokens in first-occurrence order.
pub fn distinct_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    GLYPH_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|token| seen.insert(*token))
        .map(str::to_string)
        .collect()
}

fn image_reference(path: &std::path::Path, size: &str) -> String {
    format!("![](<{}>){{height={size}}}", path.display())
}
