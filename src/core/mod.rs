mod fjall_wrapper;
pub mod fs;
pub mod kb_store;
pub mod naming;

pub use fjall_wrapper::FjallWrapper;
pub use fs::{force_remove_dir, FileSystem, RealFs, RetryPolicy};
pub use kb_store::{EngineCache, KnowledgeBase, KnowledgeBaseStore, PurgeReport};
pub use naming::{disambiguated_tool_name, to_storage_id, to_tool_id, tool_name};
