//! JSON product documents.
//!
//! The CLI reads and writes products as JSON: the serde form of
//! [`Product`], with variables carrying their dimension list, typed data
//! buffer and metadata. The `source_product` defaults to the file stem so
//! collocation filters can match the product against pair tables.

use std::path::Path;

use anyhow::{Context, Result};
use tropo_pipeline::{DatasetResolver, PipelineError};
use tropo_product::Product;

/// Load a product document, defaulting `source_product` to the file stem.
pub fn load_product(path: &Path) -> Result<Product> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read '{}'", path.display()))?;
    let mut product: Product = serde_json::from_str(&text)
        .with_context(|| format!("'{}' is not a valid product document", path.display()))?;
    product.reindex();
    if product.source_product.is_none() {
        product.source_product = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string());
    }
    product
        .verify()
        .with_context(|| format!("'{}' is not dimensionally consistent", path.display()))?;
    Ok(product)
}

pub fn save_product(product: &Product, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(product)?;
    std::fs::write(path, text)
        .with_context(|| format!("could not write '{}'", path.display()))?;
    Ok(())
}

/// Dataset resolver that imports collocated products from JSON documents.
#[derive(Debug, Clone, Default)]
pub struct JsonDatasetResolver;

impl DatasetResolver for JsonDatasetResolver {
    fn import(&self, filename: &str) -> tropo_pipeline::Result<Product> {
        load_product(Path::new(filename))
            .map_err(|e| PipelineError::import(format!("{e:#}")))
    }

    fn import_from_dir(
        &self,
        dataset_dir: &str,
        source_product: &str,
    ) -> tropo_pipeline::Result<Product> {
        let path = Path::new(dataset_dir).join(format!("{source_product}.json"));
        load_product(&path).map_err(|e| PipelineError::import(format!("{e:#}")))
    }
}
