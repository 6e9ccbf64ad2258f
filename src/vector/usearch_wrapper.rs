use anyhow::{anyhow, Result};
use std::path::Path;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// Cosine f32 usearch index with file persistence
pub struct UsearchWrapper {
    index: Index,
    dimensions: usize,
}

impl UsearchWrapper {
    pub fn new(dimensions: usize) -> Result<Self> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            ..Default::default()
        };
        let index = Index::new(&options)
            .map_err(|e| anyhow!("Failed to create usearch index: {}", e))?;
        Ok(Self { index, dimensions })
    }

    /// Open an index previously written with [`UsearchWrapper::save`]
    pub fn load(path: &Path, dimensions: usize) -> Result<Self> {
        let wrapper = Self::new(dimensions)?;
        wrapper
            .index
            .load(&path.to_string_lossy())
            .map_err(|e| anyhow!("Failed to load index from {}: {}", path.display(), e))?;
        Ok(wrapper)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.index
            .save(&path.to_string_lossy())
            .map_err(|e| anyhow!("Failed to save index to {}: {}", path.display(), e))
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn size(&self) -> usize {
        self.index.size()
    }

    pub fn reserve(&self, capacity: usize) -> Result<()> {
        self.index
            .reserve(capacity)
            .map_err(|e| anyhow!("Failed to reserve index capacity: {}", e))
    }

    pub fn add(&self, id: u64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            anyhow::bail!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            );
        }
        if self.index.size() >= self.index.capacity() {
            self.reserve((self.index.capacity() * 2).max(64))?;
        }
        self.index
            .add(id, vector)
            .map_err(|e| anyhow!("Failed to add vector {}: {}", id, e))
    }

    /// Nearest neighbours as `(id, cosine distance)`, closest first
    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        if vector.len() != self.dimensions {
            anyhow::bail!(
                "query has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            );
        }
        let matches = self
            .index
            .search(vector, k)
            .map_err(|e| anyhow!("Failed to search index: {}", e))?;
        Ok(matches.keys.into_iter().zip(matches.distances).collect())
    }
}
