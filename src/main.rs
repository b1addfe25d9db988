mod answer;
mod chat;
mod chunker;
mod config;
mod document_store;
mod embedder;
mod error;
mod hosted;
mod llm;
mod models;
mod pdf_generator;
mod pipeline;
mod prompt;
mod rate_limit;
mod scraper;
mod uploader;
mod vector_store;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::chat::ChatSession;
use crate::chunker::{chunk_markdown, RecursiveSplitter, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::config::Settings;
use crate::document_store::DocumentStore;
use crate::embedder::OpenAiEmbedder;
use crate::pipeline::{AdvisorBackend, Reply};
use crate::rate_limit::ThrottlePolicy;
use crate::uploader::{BackoffPolicy, OpenAiVectorStore, ATTACH_BATCH_SIZE};
use crate::vector_store::VectorIndex;

#[derive(Parser)]
#[command(name = "chatadv")]
#[command(about = "ChatAdv - retrieval-augmented advising assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape the curated and bulletin pages into the data directory
    Scrape,
    /// Chunk and embed the scraped corpus into the local vector index
    BuildIndex {
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, default_value_t = DEFAULT_CHUNK_OVERLAP)]
        chunk_overlap: usize,
    },
    /// Answer one question and exit
    Ask {
        /// The question to ask
        question: String,
        /// Number of chunks to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Answer with file search over the hosted vector store
        #[arg(long)]
        hosted: bool,
    },
    /// Interactive chat in the terminal
    Chat {
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(long)]
        hosted: bool,
    },
    /// Serve the JSON chat API
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<SocketAddr>,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(long)]
        hosted: bool,
    },
    /// Replace the contents of the hosted vector store with the scraped pages
    Upload {
        /// Detach old files from the store without deleting them
        #[arg(long)]
        keep_files: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env().context("Invalid configuration")?;

    match cli.command {
        Commands::Scrape => scrape(&settings).await?,
        Commands::BuildIndex {
            chunk_size,
            chunk_overlap,
        } => build_index(&settings, chunk_size, chunk_overlap).await?,
        Commands::Ask {
            question,
            top_k,
            hosted,
        } => {
            settings.top_k = top_k.unwrap_or(settings.top_k);
            let backend = AdvisorBackend::from_settings(&settings, hosted)?;
            ask(&backend, &question).await;
        }
        Commands::Chat { top_k, hosted } => {
            settings.top_k = top_k.unwrap_or(settings.top_k);
            let backend = AdvisorBackend::from_settings(&settings, hosted)?;
            chat_loop(&backend).await?;
        }
        Commands::Serve { bind, top_k, hosted } => {
            settings.top_k = top_k.unwrap_or(settings.top_k);
            let backend = AdvisorBackend::from_settings(&settings, hosted)?;
            let state = Arc::new(web::AppState::new(backend));
            web::serve(state, bind.unwrap_or(settings.bind_addr)).await?;
        }
        Commands::Upload { keep_files } => upload(&settings, keep_files).await?,
    }

    Ok(())
}

async fn scrape(settings: &Settings) -> Result<()> {
    let client = scraper::build_client()?;

    tracing::info!("Collecting URLs...");
    let urls = scraper::collect_urls(&client, &settings.urls_path).await?;
    tracing::info!("✓ {} URLs to scrape", urls.len());

    let report = scraper::scrape_pages(&client, &urls).await;

    let store = DocumentStore::new(&settings.data_dir);
    store
        .save(&urls, &report.documents)
        .with_context(|| format!("Failed to write corpus to {}", settings.data_dir.display()))?;

    println!(
        "Scraped {} of {} pages into {}",
        report.documents.len(),
        urls.len(),
        settings.data_dir.display()
    );
    for (url, reason) in &report.failures {
        println!("  skipped {}: {}", url, reason);
    }
    Ok(())
}

async fn ask(backend: &AdvisorBackend, question: &str) {
    let result = match backend {
        AdvisorBackend::Local(advisor) => advisor.answer(question).await.map(|answer| {
            for (idx, source) in answer.sources.iter().enumerate() {
                tracing::info!(
                    "[{}] score {:.4} {}",
                    idx + 1,
                    source.score,
                    source.chunk.source
                );
            }
            answer.text
        }),
        AdvisorBackend::Hosted(_) => backend.reply(question, None).await.map(|Reply { text, response_id }| {
            if let Some(id) = response_id {
                tracing::info!("Response id {}", id);
            }
            text
        }),
    };

    match result {
        Ok(text) => println!("{}", text),
        Err(e) => {
            tracing::error!("{}", e);
            println!("{}", e.user_message());
        }
    }
}

async fn build_index(settings: &Settings, chunk_size: usize, chunk_overlap: usize) -> Result<()> {
    let store = DocumentStore::new(&settings.data_dir);
    let corpus = store.load_markdown_corpus()?;
    tracing::info!("Loaded corpus scraped from {} URLs", store.load_urls()?.len());

    tracing::info!("Chunking corpus...");
    let splitter = RecursiveSplitter::new(chunk_size, chunk_overlap)?;
    let chunks = chunk_markdown(&corpus, &splitter)?;
    tracing::info!("✓ Created {} chunks", chunks.len());

    let embedder = OpenAiEmbedder::new(
        settings.require_api_key()?,
        &settings.base_url,
        &settings.embedding_model,
    )?;
    let index = VectorIndex::build(&embedder, &chunks).await?;

    index
        .save(&settings.index_dir)
        .with_context(|| format!("Failed to write index to {}", settings.index_dir.display()))?;
    tracing::info!(
        "✓ Index of {} vectors ({} dimensions) saved to {}",
        index.len(),
        index.dimension(),
        settings.index_dir.display()
    );
    Ok(())
}

async fn chat_loop(backend: &AdvisorBackend) -> Result<()> {
    let mut session = ChatSession::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Ask an advising question. Commands: /export <name>, /clear, /quit");
    loop {
        print!("\nYou: ");
        std::io::Write::flush(&mut std::io::stdout())?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        if line == "/quit" {
            break;
        } else if line == "/clear" {
            session.clear();
            println!("History cleared.");
        } else if let Some(name) = line.strip_prefix("/export") {
            export_session(&session, name.trim())?;
        } else if line.is_empty() {
            continue;
        } else {
            match session.ask(backend, line).await {
                Ok(answer) => println!("\nChatAdv: {}", answer),
                Err(e) => {
                    tracing::warn!("{}", e);
                    println!("\nChatAdv: {}", e.user_message());
                }
            }
        }
    }

    Ok(())
}

fn export_session(session: &ChatSession, name: &str) -> Result<()> {
    let file_name = match pdf_generator::export_file_name(name) {
        Ok(file_name) => file_name,
        Err(e) => {
            println!("{}", e.user_message());
            return Ok(());
        }
    };

    let today = chrono::Local::now().date_naive();
    let bytes = pdf_generator::render_chat_pdf(session.history(), name, today)?;
    std::fs::write(&file_name, bytes).with_context(|| format!("Failed to write {}", file_name))?;
    println!("Saved {}", file_name);
    Ok(())
}

async fn upload(settings: &Settings, keep_files: bool) -> Result<()> {
    let store_id = settings.require_vector_store_id()?;
    let remote = OpenAiVectorStore::new(settings.require_api_key()?, &settings.base_url)?;
    let store = DocumentStore::new(&settings.data_dir);
    let documents = store.load_documents()?;
    tracing::info!(
        "Loaded {} documents scraped from {} URLs",
        documents.len(),
        store.load_urls()?.len()
    );

    tracing::info!("Clearing vector store {}...", store_id);
    uploader::clear_vector_store(&remote, store_id, !keep_files).await?;

    tracing::info!("Uploading {} documents...", documents.len());
    let file_ids = uploader::upload_documents(
        &remote,
        &documents,
        &BackoffPolicy::default(),
        ThrottlePolicy::default(),
    )
    .await?;

    let batches = uploader::attach_files_in_batches(
        &remote,
        store_id,
        &file_ids,
        ATTACH_BATCH_SIZE,
        Duration::from_secs(1),
    )
    .await?;

    let failed: u64 = batches.iter().map(|b| b.file_counts.failed).sum();
    println!(
        "Attached {} files to {} in {} batches ({} failed)",
        file_ids.len(),
        store_id,
        batches.len(),
        failed
    );
    Ok(())
}
