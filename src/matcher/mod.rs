//! Catalog Matcher
//!
//! Resolves OCR text to the best scoring catalog product and embeds the
//! product image for the response.

pub mod fetch;
pub mod similarity;

pub use fetch::{HttpImageFetcher, ImageFetcher};
pub use similarity::normalize;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::{Catalog, ImageCache, Product};
use crate::config::MatcherConfig;

/// Fuzzy matcher over an immutable catalog snapshot
pub struct Matcher {
    catalog: Catalog,
    /// Normalized product names, parallel to the catalog
    normalized_names: Vec<String>,
    cache: ImageCache,
    fetcher: Arc<dyn ImageFetcher>,
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(catalog: Catalog, fetcher: Arc<dyn ImageFetcher>, config: MatcherConfig) -> Self {
        let normalized_names = catalog
            .products()
            .iter()
            .map(|p| normalize(&p.name))
            .collect();

        Self {
            catalog,
            normalized_names,
            cache: ImageCache::new(),
            fetcher,
            config,
        }
    }

    /// Catalog position and score of the best match for `text`
    ///
    /// A product must score strictly above `min_score` and above every
    /// earlier product, so the first of equally scoring products wins.
    pub fn best_match(&self, text: &str) -> Option<(usize, u8)> {
        let query = normalize(text);

        let mut best: Option<(usize, u8)> = None;
        let mut best_score = self.config.min_score;

        for (index, name) in self.normalized_names.iter().enumerate() {
            let score = similarity::score(self.config.algorithm, &query, name);
            if score > best_score {
                best_score = score;
                best = Some((index, score));
            }
        }

        best
    }

    /// Best matching product with its image embedded
    ///
    /// A failed image download leaves `image_base64` empty instead of
    /// failing the match.
    pub async fn resolve(&self, text: &str) -> Option<Product> {
        let (index, score) = self.best_match(text)?;
        let mut product = self.catalog.get(index)?.clone();

        debug!("Matched {:?} to {:?} (score {})", text, product.name, score);

        product.image_base64 = match self.cache.get(index) {
            Some(cached) => Some(cached),
            None => match self.fetcher.fetch_base64(&product.image_url).await {
                Ok(encoded) => {
                    self.cache.insert(index, encoded.clone());
                    debug!("Cached image for {:?} ({} cached)", product.name, self.cache.len());
                    Some(encoded)
                }
                Err(e) => {
                    warn!("Failed to fetch image for {:?}: {}", product.name, e);
                    None
                }
            },
        };

        Some(product)
    }
}
