//! Product Catalog
//!
//! Read-only product list loaded once at startup, plus the cache of embedded
//! product images filled in as products get matched.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A known product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Display name matched against label text
    pub name: String,
    /// Remote product image
    pub image_url: String,
    /// Base64 of the product image, present on matched results
    #[serde(default)]
    pub image_base64: Option<String>,
    /// Any other fields carried by the catalog file
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
impl Product {
    /// Create a product with no extra fields
    pub fn new(name: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_url: image_url.into(),
            image_base64: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Immutable snapshot of the product list
///
/// Products are identified by their position in the list.
#[derive(Debug, Clone)]
pub struct Catalog {
    products: Arc<[Product]>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Catalog {
    /// Build a catalog from an in-memory product list
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products: products.into(),
        }
    }

    /// Load the catalog from a JSON array on disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {:?}", path))?;
        let catalog = Self::from_json(&content)
            .with_context(|| format!("Failed to parse catalog {:?}", path))?;

        info!("Loaded {} products from {:?}", catalog.len(), path);
        Ok(catalog)
    }

    /// Parse the catalog from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let products: Vec<Product> = serde_json::from_str(json)?;
        Ok(Self::new(products))
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn get(&self, index: usize) -> Option<&Product> {
        self.products.get(index)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// Embedded product images keyed by catalog position
///
/// Only successful fetches are stored, so a failed download is retried the
/// next time the product wins a match.
#[derive(Debug, Default)]
pub struct ImageCache {
    entries: RwLock<HashMap<usize, String>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached payload for a product
    pub fn get(&self, index: usize) -> Option<String> {
        self.entries.read().get(&index).cloned()
    }

    /// Store a fetched payload
    pub fn insert(&self, index: usize, image_base64: String) {
        self.entries.write().insert(index, image_base64);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_catalog() {
        let json = r#"[
            {"name": "Coca Cola Zero", "image_url": "http://x/1.jpg"},
            {"name": "Fanta", "image_url": "http://x/2.jpg", "volume": "0.5l"}
        ]"#;

        let catalog = Catalog::from_json(json).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.products()[0].name, "Coca Cola Zero");
        assert!(catalog.products()[0].image_base64.is_none());
        assert_eq!(
            catalog.get(1).unwrap().extra.get("volume"),
            Some(&serde_json::json!("0.5l"))
        );
    }

    #[test]
    fn test_product_serializes_extra_fields_and_image() {
        let mut product = Catalog::from_json(
            r#"[{"name": "Fanta", "image_url": "http://x/2.jpg", "volume": "0.5l"}]"#,
        )
        .unwrap()
        .products()[0]
            .clone();
        product.image_base64 = Some("AAAA".to_string());

        let value = serde_json::to_value(&product).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "name": "Fanta",
                "image_url": "http://x/2.jpg",
                "image_base64": "AAAA",
                "volume": "0.5l"
            })
        );
    }

    #[test]
    fn test_unmatched_product_serializes_null_image() {
        let value = serde_json::to_value(Product::new("A", "http://x/a.jpg")).unwrap();
        assert_eq!(value["image_base64"], serde_json::Value::Null);
    }

    #[test]
    fn test_load_catalog_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "Sprite", "image_url": "http://x/3.jpg"}}]"#).unwrap();

        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_load_catalog_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not a list").unwrap();

        assert!(Catalog::load(file.path()).is_err());
    }

    #[test]
    fn test_image_cache() {
        let cache = ImageCache::new();
        assert_eq!(cache.len(), 0);

        cache.insert(3, "abc".to_string());
        cache.insert(3, "abc".to_string());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(3).as_deref(), Some("abc"));
        assert!(cache.get(0).is_none());
    }
}
