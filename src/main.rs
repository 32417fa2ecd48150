//! # note-rags CLI (`nrag`)
//!
//! The `nrag` binary is the primary interface for note-rags. It provides
//! commands for database initialization, note ingestion and deletion,
//! question answering, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! nrag --config ./config/nrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nrag init` | Create the SQLite database and run schema migrations |
//! | `nrag ingest <file>` | Chunk, embed, and index a note file |
//! | `nrag delete <file>` | Remove a note and its chunks from the index |
//! | `nrag ask "<question>"` | Answer a question from the indexed notes |
//! | `nrag serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! nrag init --config ./config/nrag.toml
//!
//! # Index a note
//! nrag ingest ./notes/meeting.md
//!
//! # Streamed answer (default)
//! nrag ask "what did we decide about the launch date?"
//!
//! # Full answer in one piece
//! nrag ask "what did we decide?" --no-stream
//!
//! # Start the HTTP server
//! nrag serve
//! ```

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use note_rags::config::{self, Config};
use note_rags::context::ContextAssembler;
use note_rags::db;
use note_rags::embedding::{create_provider, Embedder};
use note_rags::generate::create_generator;
use note_rags::ingest::IngestionCoordinator;
use note_rags::migrate;
use note_rags::models::{ChangeType, FileChangeEvent, IngestState, QueryRequest, StreamEvent};
use note_rags::query::QueryPipeline;
use note_rags::retrieve::Retriever;
use note_rags::server;
use note_rags::store::VectorStore;

/// note-rags CLI — retrieval-augmented question answering over local notes.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/nrag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "nrag",
    about = "note-rags — retrieval-augmented question answering over local notes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks). This command is idempotent — running it
    /// multiple times is safe.
    Init,

    /// Ingest a note file.
    ///
    /// Reads the file, chunks and embeds it, and stores the result.
    /// Re-ingesting an unchanged file is a no-op; modified content
    /// replaces the previous chunk set atomically.
    Ingest {
        /// Path to the note file.
        file: PathBuf,
    },

    /// Delete a note from the index.
    ///
    /// Removes the document and all of its chunks. Deleting a file that
    /// was never indexed is not an error.
    Delete {
        /// Path of the note file as it was ingested.
        file: PathBuf,
    },

    /// Answer a question from the indexed notes.
    ///
    /// Retrieves the most relevant chunks, then streams the generated
    /// answer to stdout as it is produced.
    Ask {
        /// The question to answer.
        question: String,

        /// Print the full answer at once instead of streaming.
        #[arg(long)]
        no_stream: bool,

        /// Override the configured number of chunks to retrieve.
        #[arg(long)]
        top_k: Option<i64>,
    },

    /// Start the HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// file-event ingestion and query endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file } => {
            run_file_event(&cfg, &file, ChangeType::Modified).await?;
        }
        Commands::Delete { file } => {
            run_file_event(&cfg, &file, ChangeType::Deleted).await?;
        }
        Commands::Ask {
            question,
            no_stream,
            top_k,
        } => {
            run_ask(&cfg, &question, no_stream, top_k).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn build_coordinator(cfg: &Config) -> Result<IngestionCoordinator> {
    let pool = db::connect(&cfg.db).await?;
    migrate::run_migrations(&pool).await?;

    let provider = create_provider(&cfg.embedding)?;
    let embedder = Embedder::new(provider, &cfg.embedding);
    let store = VectorStore::new(pool, cfg.embedding.dims);

    Ok(IngestionCoordinator::new(
        store,
        embedder,
        cfg.chunking.clone(),
    ))
}

async fn run_file_event(cfg: &Config, file: &std::path::Path, change: ChangeType) -> Result<()> {
    let coordinator = build_coordinator(cfg).await?;
    let event = FileChangeEvent {
        file_path: file.display().to_string(),
        change_type: change,
    };

    let outcome = coordinator.process_event(&event).await;
    match outcome.state {
        IngestState::Complete => {
            println!("{} ({} chunks)", outcome.detail, outcome.chunks_written);
            Ok(())
        }
        IngestState::Failed => anyhow::bail!("ingestion failed: {}", outcome.detail),
    }
}

async fn run_ask(cfg: &Config, question: &str, no_stream: bool, top_k: Option<i64>) -> Result<()> {
    let pool = db::connect(&cfg.db).await?;
    migrate::run_migrations(&pool).await?;

    let provider = create_provider(&cfg.embedding)?;
    let embedder = Embedder::new(provider, &cfg.embedding);
    let store = VectorStore::new(pool, cfg.embedding.dims);

    let retriever = Retriever::new(store, embedder, cfg.retrieval.clone());
    let assembler = ContextAssembler::new(cfg.context.clone(), cfg.chunking.clone());
    let generator = create_generator(&cfg.generation)?;
    let pipeline = QueryPipeline::new(retriever, assembler, Arc::clone(&generator));

    let request = QueryRequest {
        text: question.to_string(),
        session_id: None,
        history: Vec::new(),
        top_k,
        threshold: None,
    };

    if no_stream {
        let answer = pipeline.answer(&request).await?;
        println!("{}", answer.answer);
        println!(
            "\n({} context chunks, ~{} tokens)",
            answer.context_count, answer.token_count
        );
        return Ok(());
    }

    let mut events = pipeline.stream(&request).await?;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Context { snippets } => {
                eprintln!("Found {} relevant chunks.\n", snippets.len());
            }
            StreamEvent::Answer { text } => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            StreamEvent::Complete(payload) => {
                println!(
                    "\n\n({} context chunks, ~{} tokens)",
                    payload.context_count, payload.token_count
                );
            }
            StreamEvent::Error { message, .. } => {
                anyhow::bail!("generation failed: {}", message);
            }
        }
    }

    Ok(())
}
