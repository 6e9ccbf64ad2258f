//! kbchat - knowledge base chat agent
//!
//! Answers questions by letting a language model query per knowledge base
//! retrieval tools, and manages the knowledge bases on disk.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use kbchat::agent::{CheckpointStore, FjallCheckpointStore};
use kbchat::ai::gateway::{DEFAULT_BASE_URL, DEFAULT_EMBEDDING_MODEL, DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use kbchat::cli::{console, format_history, stream_turn};
use kbchat::vector::Document;
use kbchat::{Config, GatewaySettings, KbChat, KbError, KnowledgeBaseStore, RetryPolicy};

/// kbchat - chat with your knowledge bases
#[derive(Parser)]
#[command(
    name = "kbchat",
    author,
    version,
    about = "Chat agent that answers from per knowledge base retrieval tools",
    long_about = r#"
kbchat answers questions with an OpenAI-compatible model that can search
your knowledge bases. Every directory under the knowledge base root is one
knowledge base.

Examples:
  kbchat kb create support         Create a knowledge base
  kbchat kb add support faq.md     Ingest documents
  kbchat chat                      Start the interactive console
  kbchat ask "How do I reset?"     Ask a single question
  kbchat kb purge --force          Delete every knowledge base
"#
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Knowledge base root directory
    #[arg(long, global = true, env = "KBCHAT_KB_ROOT", default_value = "./knowledge_base")]
    kb_root: PathBuf,

    /// Data directory for conversation checkpoints
    #[arg(short, long, global = true, env = "KBCHAT_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args)]
struct ModelArgs {
    /// OpenAI-compatible API base url
    #[arg(long, global = true, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// API key for the provider
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true, default_value = "")]
    api_key: String,

    /// Chat model
    #[arg(long, global = true, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Embedding model
    #[arg(long, global = true, env = "OPENAI_EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Sampling temperature
    #[arg(long, global = true, default_value_t = DEFAULT_TEMPERATURE)]
    temperature: f32,

    /// Wait for complete responses instead of streaming
    #[arg(long, global = true)]
    no_stream: bool,

    /// System prompt sent ahead of every conversation
    #[arg(long, global = true, env = "KBCHAT_SYSTEM_PROMPT")]
    system_prompt: Option<String>,

    /// Maximum tool-call rounds per turn
    #[arg(long, global = true, default_value_t = kbchat::agent::DEFAULT_MAX_TOOL_ROUNDS)]
    max_tool_rounds: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive console (default)
    #[command(alias = "console", alias = "repl")]
    Chat(ChatArgs),

    /// Ask a single question and exit
    Ask(AskArgs),

    /// Print a conversation's history
    History(HistoryArgs),

    /// Manage knowledge bases
    Kb(KbArgs),

    /// Display version and build information
    Info,
}

#[derive(Args)]
struct ChatArgs {
    /// Conversation id
    #[arg(short, long, default_value = "default")]
    conversation: String,

    /// Bind only these knowledge bases (repeatable); all when omitted
    #[arg(long = "kb")]
    kbs: Vec<String>,
}

#[derive(Args)]
struct AskArgs {
    /// The question
    question: String,

    #[command(flatten)]
    chat: ChatArgs,
}

#[derive(Args)]
struct HistoryArgs {
    /// Conversation id; lists conversations when omitted
    conversation: Option<String>,
}

#[derive(Args)]
struct KbArgs {
    #[command(subcommand)]
    action: KbAction,
}

#[derive(Subcommand)]
enum KbAction {
    /// List knowledge bases
    List,

    /// Create a knowledge base
    Create {
        /// Knowledge base name (any text, used as the directory name)
        name: String,
    },

    /// Ingest text files into a knowledge base
    Add {
        name: String,

        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Delete every knowledge base
    Purge {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            kb_root: self.kb_root.clone(),
            data_dir: self.data_dir.clone(),
            gateway: GatewaySettings {
                base_url: self.model.base_url.clone(),
                api_key: self.model.api_key.clone(),
                model: self.model.model.clone(),
                embedding_model: self.model.embedding_model.clone(),
                temperature: self.model.temperature,
                stream: !self.model.no_stream,
                system_prompt: self.model.system_prompt.clone(),
            },
            max_tool_rounds: self.model.max_tool_rounds,
            purge: RetryPolicy::default(),
            ..Default::default()
        }
    }
}

fn open(config: Config) -> Result<KbChat> {
    match KbChat::new(config) {
        Ok(chat) => Ok(chat),
        Err(e @ KbError::Configuration(_)) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

fn bound_kbs(chat: &KbChat, args: &ChatArgs) -> Result<Option<Vec<String>>> {
    if args.kbs.is_empty() {
        return Ok(None);
    }
    let known = chat.store().list()?;
    for name in &args.kbs {
        if !known.contains(name) {
            eprintln!("Warning: knowledge base '{}' does not exist yet", name);
        }
    }
    Ok(Some(args.kbs.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging only when RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        None => {
            let chat = open(config)?;
            let agent = chat.orchestrator(None)?;
            console::run(agent, "default".to_string()).await?;
        }

        Some(Commands::Chat(args)) => {
            let chat = open(config)?;
            let kbs = bound_kbs(&chat, &args)?;
            let agent = chat.orchestrator(kbs.as_deref())?;
            console::run(agent, args.conversation).await?;
        }

        Some(Commands::Ask(args)) => {
            let chat = open(config)?;
            let kbs = bound_kbs(&chat, &args.chat)?;
            let agent = chat.orchestrator(kbs.as_deref())?;
            match stream_turn(&agent, &args.chat.conversation, Some(&args.question)).await {
                Ok(outcome) if outcome.truncated => {
                    eprintln!("Warning: the turn hit the tool round limit");
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Some(Commands::History(args)) => {
            let checkpoints = FjallCheckpointStore::open(config.data_dir.join("checkpoints"))?;
            match args.conversation {
                Some(id) => {
                    let state = checkpoints.load(&id).await?.unwrap_or_default();
                    print!("{}", format_history(&state));
                }
                None => {
                    let ids = checkpoints.list().await?;
                    if ids.is_empty() {
                        println!("No conversations found.");
                    }
                    for id in ids {
                        println!("  - {}", id);
                    }
                }
            }
        }

        Some(Commands::Kb(kb_args)) => {
            let store = KnowledgeBaseStore::new(&config.kb_root).with_retry_policy(config.purge);
            match kb_args.action {
                KbAction::List => {
                    let names = store.list()?;
                    if names.is_empty() {
                        println!("No knowledge bases found.");
                    } else {
                        println!("Knowledge bases:");
                        for name in names {
                            let kb = store.knowledge_base(&name)?;
                            println!("  - {} (collection {})", name, kb.collection_id());
                        }
                    }
                }

                KbAction::Create { name } => {
                    let kb = store.create(&name)?;
                    println!("Created knowledge base '{}' at {}", name, kb.dir().display());
                }

                KbAction::Add { name, files } => {
                    let mut documents = Vec::with_capacity(files.len());
                    for file in &files {
                        let text = std::fs::read_to_string(file)
                            .with_context(|| format!("Failed to read {}", file.display()))?;
                        let source = file
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| file.display().to_string());
                        documents.push(Document::new(source, text));
                    }
                    let chat = open(config)?;
                    let count = chat.add_documents(&name, &documents).await?;
                    println!("Indexed {} passages from {} files into '{}'", count, files.len(), name);
                }

                KbAction::Purge { force } => {
                    if !force {
                        println!(
                            "Delete every knowledge base under {}? [y/N]",
                            store.root().display()
                        );
                        let mut input = String::new();
                        std::io::stdin().read_line(&mut input)?;
                        if !input.trim().eq_ignore_ascii_case("y") {
                            println!("Aborted.");
                            return Ok(());
                        }
                    }
                    let report = store.purge().await?;
                    println!("Removed {} knowledge bases", report.removed);
                    if let Err(e) = report.into_result() {
                        eprintln!("Warning: {}", e);
                    }
                }
            }
        }

        Some(Commands::Info) => {
            println!("kbchat - knowledge base chat agent");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Features:");
            #[cfg(feature = "vector")]
            println!("  - Vector search (usearch)");
            #[cfg(not(feature = "vector"))]
            println!("  - Vector search: disabled");
            #[cfg(feature = "embedding")]
            println!("  - Local embeddings (fastembed)");
            #[cfg(not(feature = "embedding"))]
            println!("  - Local embeddings: disabled");
            println!();
            println!("Knowledge base root: {}", config.kb_root.display());
            println!("Data directory: {}", config.data_dir.display());
            println!("Model: {} at {}", config.gateway.model, config.gateway.base_url);
        }
    }

    Ok(())
}
