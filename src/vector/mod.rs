pub mod store;

#[cfg(feature = "vector")]
mod usearch_wrapper;

#[cfg(feature = "vector")]
pub use usearch_wrapper::UsearchWrapper;

pub use store::{split_passages, Document, LocalVectorStore, ScoredPassage, SimilaritySearch};

#[cfg(not(feature = "vector"))]
pub struct UsearchWrapper;

#[cfg(not(feature = "vector"))]
impl UsearchWrapper {
    pub fn new(_dimensions: usize) -> anyhow::Result<Self> { Ok(Self) }
    pub fn load(_path: &std::path::Path, _dimensions: usize) -> anyhow::Result<Self> {
        anyhow::bail!("vector feature is disabled")
    }
    pub fn save(&self, _path: &std::path::Path) -> anyhow::Result<()> { Ok(()) }
    pub fn dimensions(&self) -> usize { 0 }
    pub fn size(&self) -> usize { 0 }
    pub fn add(&self, _id: u64, _vector: &[f32]) -> anyhow::Result<()> {
        anyhow::bail!("vector feature is disabled")
    }
    pub fn search(&self, _vector: &[f32], _k: usize) -> anyhow::Result<Vec<(u64, f32)>> {
        anyhow::bail!("vector feature is disabled")
    }
}
