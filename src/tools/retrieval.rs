//! Per knowledge base retrieval tools
//!
//! Each tool runs a similarity query against one knowledge base and answers
//! with a JSON object of the best passages, best first:
//! `{"match 1": "...", "match 2": "..."}`. No hit above the threshold gives
//! `{}`.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;

use super::{query_schema, ToolDescriptor, ToolSet, ToolSpec};
use crate::core::naming::{disambiguated_tool_name, tool_name};
use crate::core::KnowledgeBaseStore;
use crate::error::{KbError, KbResult};
use crate::vector::{ScoredPassage, SimilaritySearch};

/// How many passages a tool returns and how close they must be
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, Deserialize)]
pub struct RetrievalSettings {
    pub k: usize,
    /// Passages scoring strictly below this similarity are dropped
    pub score_threshold: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            k: 3,
            score_threshold: 0.15,
        }
    }
}

/// Passage texts in rank order, serialized as `"match N"` keys
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RankedMatches(Vec<String>);

impl RankedMatches {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn texts(&self) -> &[String] {
        &self.0
    }
}

impl Serialize for RankedMatches {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (i, text) in self.0.iter().enumerate() {
            map.serialize_entry(&format!("match {}", i + 1), text)?;
        }
        map.end()
    }
}

/// Drop weak hits, order by descending similarity, keep `k`, strip source headers
pub fn rank_passages(mut passages: Vec<ScoredPassage>, settings: &RetrievalSettings) -> RankedMatches {
    passages.retain(|p| p.score >= settings.score_threshold);
    passages.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    passages.truncate(settings.k);
    RankedMatches(passages.into_iter().map(strip_source_header).collect())
}

fn strip_source_header(passage: ScoredPassage) -> String {
    if let Some(source) = &passage.source {
        let header = format!("{}\n\n", source);
        if let Some(body) = passage.text.strip_prefix(&header) {
            return body.to_string();
        }
    }
    passage.text
}

/// Builds retrieval tools over a knowledge base store
#[derive(Clone)]
pub struct RetrievalToolFactory {
    store: Arc<KnowledgeBaseStore>,
    searcher: Arc<dyn SimilaritySearch>,
    settings: RetrievalSettings,
}

impl RetrievalToolFactory {
    pub fn new(store: Arc<KnowledgeBaseStore>, searcher: Arc<dyn SimilaritySearch>) -> Self {
        Self {
            store,
            searcher,
            settings: RetrievalSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RetrievalSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the retrieval tool for one knowledge base
    pub fn create(&self, kb_name: &str) -> KbResult<ToolDescriptor> {
        self.create_named(kb_name, tool_name(kb_name))
    }

    fn create_named(&self, kb_name: &str, name: String) -> KbResult<ToolDescriptor> {
        let kb = self.store.knowledge_base(kb_name)?;
        let spec = ToolSpec::new(
            &name,
            &format!("search and return information about {}", kb_name),
            query_schema(),
        );

        let store = self.store.clone();
        let searcher = self.searcher.clone();
        let settings = self.settings;
        let execute = Arc::new(move |query: String| {
            let store = store.clone();
            let searcher = searcher.clone();
            let kb = kb.clone();
            let tool = name.clone();
            async move {
                let _guard = store.read_guard().await;
                let passages = searcher
                    .search(&kb, &query, settings.k)
                    .await
                    .map_err(|e| KbError::ToolExecution {
                        tool: tool.clone(),
                        message: e.to_string(),
                    })?;
                let found = passages.len();
                let ranked = rank_passages(passages, &settings);
                tracing::debug!(tool = %tool, found, kept = ranked.len(), "retrieval finished");
                Ok(serde_json::to_string(&ranked)?)
            }
            .boxed()
        });

        Ok(ToolDescriptor::new(spec, execute))
    }

    /// Build tools for several knowledge bases.
    ///
    /// A knowledge base whose tool name is already bound gets a hash-tagged
    /// name instead. Names that cannot be bound are skipped with a warning.
    pub fn create_all<S: AsRef<str>>(&self, kb_names: &[S]) -> KbResult<ToolSet> {
        let mut set = ToolSet::new();
        for kb_name in kb_names {
            let kb_name = kb_name.as_ref();
            let mut name = tool_name(kb_name);
            if set.contains(&name) {
                name = disambiguated_tool_name(kb_name);
                tracing::debug!(kb = kb_name, tool = %name, "tool name taken, using tagged name");
            }
            match self.create_named(kb_name, name) {
                Ok(tool) => {
                    set.insert(tool);
                }
                Err(e) => tracing::warn!(kb = kb_name, error = %e, "skipping knowledge base"),
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KnowledgeBase;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    struct FixedSearch(Vec<ScoredPassage>);

    #[async_trait]
    impl SimilaritySearch for FixedSearch {
        async fn search(&self, _kb: &KnowledgeBase, _query: &str, _k: usize) -> KbResult<Vec<ScoredPassage>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSearch;

    #[async_trait]
    impl SimilaritySearch for BrokenSearch {
        async fn search(&self, _kb: &KnowledgeBase, _query: &str, _k: usize) -> KbResult<Vec<ScoredPassage>> {
            Err(KbError::Storage(anyhow::anyhow!("index corrupted")))
        }
    }

    fn passage(text: &str, source: Option<&str>, score: f32) -> ScoredPassage {
        ScoredPassage {
            text: text.to_string(),
            source: source.map(str::to_string),
            score,
        }
    }

    fn factory(root: &std::path::Path, searcher: Arc<dyn SimilaritySearch>) -> RetrievalToolFactory {
        RetrievalToolFactory::new(Arc::new(KnowledgeBaseStore::new(root)), searcher)
    }

    #[test]
    fn test_rank_orders_filters_and_truncates() {
        let ranked = rank_passages(
            vec![
                passage("low", None, 0.2),
                passage("weak", None, 0.149),
                passage("best", None, 0.9),
                passage("edge", None, 0.15),
                passage("mid", None, 0.5),
            ],
            &RetrievalSettings::default(),
        );
        assert_eq!(ranked.texts(), ["best", "mid", "low"]);

        let ranked = rank_passages(
            vec![passage("edge", None, 0.15), passage("weak", None, 0.1)],
            &RetrievalSettings::default(),
        );
        assert_eq!(ranked.texts(), ["edge"]);
    }

    #[test]
    fn test_rank_serializes_in_order() {
        let ranked = RankedMatches(vec!["b".into(), "a".into()]);
        assert_eq!(serde_json::to_string(&ranked).unwrap(), r#"{"match 1":"b","match 2":"a"}"#);
        assert_eq!(serde_json::to_string(&RankedMatches::default()).unwrap(), "{}");
    }

    #[test]
    fn test_source_header_stripped() {
        let ranked = rank_passages(
            vec![
                passage("guide.md\n\nReset the router.", Some("guide.md"), 0.8),
                passage("no header here", Some("faq.md"), 0.7),
            ],
            &RetrievalSettings::default(),
        );
        assert_eq!(ranked.texts(), ["Reset the router.", "no header here"]);
    }

    #[tokio::test]
    async fn test_tool_identity() {
        let dir = tempdir().unwrap();
        let tool = factory(dir.path(), Arc::new(FixedSearch(vec![])))
            .create("Acme Corp 客服")
            .unwrap();
        assert_eq!(tool.name(), "Acme_Corp_knowledge_base_tool");
        assert!(tool.spec().description.contains("Acme Corp 客服"));
        assert_eq!(tool.spec().input_schema["required"], json!(["query"]));
    }

    #[tokio::test]
    async fn test_empty_result_is_empty_object() {
        let dir = tempdir().unwrap();
        let tool = factory(dir.path(), Arc::new(FixedSearch(vec![]))).create("docs").unwrap();
        assert_eq!(tool.run("anything".into()).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_non_ascii_preserved() {
        let dir = tempdir().unwrap();
        let searcher = Arc::new(FixedSearch(vec![passage("退货政策：七天无理由", None, 0.6)]));
        let tool = factory(dir.path(), searcher).create("客服").unwrap();
        let payload = tool.call(&json!({ "query": "退货" })).await.unwrap();
        assert_eq!(payload, r#"{"match 1":"退货政策：七天无理由"}"#);
    }

    #[tokio::test]
    async fn test_search_failure_is_tool_execution_error() {
        let dir = tempdir().unwrap();
        let tool = factory(dir.path(), Arc::new(BrokenSearch)).create("docs").unwrap();
        let err = tool.run("q".into()).await.unwrap_err();
        assert!(matches!(err, KbError::ToolExecution { ref tool, .. } if tool == "docs_knowledge_base_tool"));
        assert!(err.is_tool_recoverable());
    }

    #[tokio::test]
    async fn test_create_all_binds_each_kb() {
        let dir = tempdir().unwrap();
        let set = factory(dir.path(), Arc::new(FixedSearch(vec![])))
            .create_all(&["alpha", "beta"])
            .unwrap();
        let names: Vec<&str> = set.names().collect();
        assert_eq!(names, ["alpha_knowledge_base_tool", "beta_knowledge_base_tool"]);
    }

    #[tokio::test]
    async fn test_create_all_keeps_colliding_names_apart() {
        let dir = tempdir().unwrap();
        let set = factory(dir.path(), Arc::new(FixedSearch(vec![])))
            .create_all(&["Acme Corp", "Acme Corp 客服"])
            .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("Acme_Corp_knowledge_base_tool"));

        let tagged = disambiguated_tool_name("Acme Corp 客服");
        let tool = set.resolve(&tagged).unwrap();
        assert!(tool.spec().description.contains("Acme Corp 客服"));
    }

    #[tokio::test]
    async fn test_create_all_binds_blank_and_skips_unbindable() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("support")).unwrap();
        std::fs::create_dir_all(dir.path().join("  ")).unwrap();

        let factory = factory(dir.path(), Arc::new(FixedSearch(vec![])));
        let names = factory.store.list().unwrap();
        assert_eq!(names, ["  ", "support"]);

        let set = factory.create_all(&names).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("support_knowledge_base_tool"));
        assert!(set.contains(&tool_name("  ")));

        let set = factory.create_all(&["support", "..", ""]).unwrap();
        let bound: Vec<&str> = set.names().collect();
        assert_eq!(bound, ["support_knowledge_base_tool"]);
    }
}
