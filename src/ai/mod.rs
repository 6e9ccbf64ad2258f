pub mod embedding;
pub mod gateway;
pub mod mock;
pub mod openai;

pub use embedding::Embedder;
#[cfg(feature = "embedding")]
pub use embedding::FastEmbedder;
pub use gateway::{AssistantReply, GatewaySettings, ModelGateway};
pub use mock::ScriptedGateway;
pub use openai::OpenAiClient;
