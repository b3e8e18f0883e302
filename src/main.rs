//! # RAG Harness CLI (`qe`)
//!
//! The `qe` binary builds query engines from document collections and runs
//! searches and LLM queries against them.
//!
//! ## Usage
//!
//! ```bash
//! qe --config ./config/qe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qe init` | Create the SQLite database and run schema migrations |
//! | `qe build <name>` | Build a query engine from `--doc-url` |
//! | `qe deploy <name>` | Retry the deploy step of an indexed engine |
//! | `qe search <name> "<prompt>"` | Print matching references |
//! | `qe query <name> "<prompt>"` | Answer a prompt with an LLM over the references |
//! | `qe list` | List engines |
//! | `qe show <name>` | Print one engine with its documents |
//! | `qe delete <name>` | Delete an engine (`--hard` removes its records) |
//!
//! ## Examples
//!
//! ```bash
//! # Text engine over a bucket, filterable by manifest fields
//! qe build movies --doc-url gs://my-docs/movies \
//!     --param manifest_url=gs://my-docs/manifest.json
//!
//! # Search with a metadata filter
//! qe search movies "space horror" --filter 'genre: ANY("horror", "thriller") AND year >= 1979'
//!
//! # Composite engine over two existing engines
//! qe build everything --type integrated --associated movies,books
//!
//! # Continue a conversation
//! qe query movies "and the sequel?" --conversation <user-query-id>
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rag_harness::config::{self, Config};
use rag_harness::orchestrator::{self, BuildRequest};
use rag_harness::{migrate, query, AppContext};
use rag_harness_core::models::{BuildParams, QueryEngineType, QueryReference};
use tracing_subscriber::EnvFilter;

/// RAG Harness CLI: build, search, and query retrieval-augmented generation
/// engines.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/qe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "qe",
    about = "Build, search, and query retrieval-augmented generation engines",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qe.toml")]
    config: PathBuf,

    /// Log at debug level. `RUST_LOG` takes precedence.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Build a query engine.
    ///
    /// Downloads the documents under `--doc-url`, chunks and embeds them,
    /// and writes the vectors to the engine's vector store. On failure the
    /// partially built engine is removed.
    Build {
        /// Engine name; must not be in use by a live engine.
        name: String,

        /// `llm_service`, `integrated`, or `managed_search`.
        #[arg(long = "type", default_value = "llm_service")]
        engine_type: QueryEngineType,

        /// Document collection: `gs://bucket/prefix`, `https://site`, or
        /// `shpt://site/drive/folder`.
        #[arg(long)]
        doc_url: Option<String>,

        #[arg(long, default_value = "cli")]
        user: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Embedding model id from `[embedding.models]`.
        #[arg(long)]
        embedding: Option<String>,

        /// LLM id from `[llm.models]`.
        #[arg(long)]
        llm: Option<String>,

        /// Vector store backend: `sqlite_vector` or `matching_engine`.
        #[arg(long)]
        vector_store: Option<String>,

        /// Child engines of an integrated engine, comma-separated.
        #[arg(long)]
        associated: Option<String>,

        /// Index page images instead of text.
        #[arg(long)]
        multimodal: bool,

        /// Hide the engine from other users.
        #[arg(long)]
        private: bool,

        /// Extra build parameters as `key=value` pairs.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },

    /// Re-run the deploy step for an engine whose index is already built.
    Deploy { name: String },

    /// Print the references an engine returns for a prompt.
    Search {
        name: String,
        prompt: String,

        /// Metadata filter, e.g. `genre: ANY("horror") AND year < 2000`.
        #[arg(long)]
        filter: Option<String>,

        /// Narrow each text reference to its most relevant sentences.
        #[arg(long)]
        rank_sentences: bool,

        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Answer a prompt with an LLM over the engine's references.
    Query {
        name: String,
        prompt: String,

        /// LLM id overriding the engine's model.
        #[arg(long)]
        llm: Option<String>,

        /// User query id of a conversation to continue.
        #[arg(long)]
        conversation: Option<String>,

        #[arg(long)]
        rank_sentences: bool,

        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// List live engines.
    List,

    /// Show one engine and its documents.
    Show { name: String },

    /// Delete an engine and its vector store resources.
    Delete {
        name: String,

        /// Remove records instead of marking them deleted.
        #[arg(long)]
        hard: bool,
    },
}

/// Parse a `key=value` pair for `--param` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg: Config = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let app = AppContext::open(cfg).await?;
    let outcome = run(&app, cli.command).await;
    app.close().await;
    outcome
}

async fn run(app: &AppContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {}
        Commands::Build {
            name,
            engine_type,
            doc_url,
            user,
            description,
            embedding,
            llm,
            vector_store,
            associated,
            multimodal,
            private,
            params,
        } => {
            let mut build_params = BuildParams(params.into_iter().collect());
            if multimodal {
                build_params = build_params.with("is_multimodal", "true");
            }
            if let Some(children) = associated {
                build_params = build_params.with("associated_engines", children);
            }

            let mut request = BuildRequest::new(&name, engine_type, &user);
            request.doc_url = doc_url;
            request.description = description;
            request.embedding_type = embedding;
            request.llm_type = llm;
            request.vector_store = vector_store;
            request.is_public = Some(!private);
            request.params = build_params;

            let outcome = orchestrator::query_engine_build(app, request).await?;
            println!("Built {} ({})", outcome.engine.name, outcome.engine.id);
            println!("  type:          {}", outcome.engine.engine_type);
            if let Some(store) = &outcome.engine.vector_store {
                println!("  vector store:  {}", store);
            }
            println!("  processed:     {}", outcome.docs_processed.len());
            for url in &outcome.docs_not_processed {
                println!("  not processed: {}", url);
            }
        }
        Commands::Deploy { name } => {
            let engine = orchestrator::deploy_engine(app, &name).await?;
            match (&engine.endpoint, &engine.deployed_index_name) {
                (Some(endpoint), Some(deployed)) => {
                    println!("Deployed {} as {} on {}", engine.name, deployed, endpoint)
                }
                _ => println!("{} needs no deployment.", engine.name),
            }
        }
        Commands::Search {
            name,
            prompt,
            filter,
            rank_sentences,
            user,
        } => {
            let engine = orchestrator::find_engine(app, &name).await?;
            let refs = query::query_search(
                app,
                &prompt,
                &engine,
                &user,
                filter.as_deref(),
                rank_sentences,
            )
            .await?;
            if refs.is_empty() {
                println!("No results.");
            }
            print_references(&refs);
        }
        Commands::Query {
            name,
            prompt,
            llm,
            conversation,
            rank_sentences,
            user,
        } => {
            let engine = orchestrator::find_engine(app, &name).await?;
            let user_query = match conversation {
                Some(id) => Some(query::find_user_query(app, &id).await?),
                None => None,
            };
            let generation = query::query_generate(
                app,
                &user,
                &prompt,
                &engine,
                llm.as_deref(),
                user_query,
                rank_sentences,
            )
            .await?;
            println!("{}", generation.result.response);
            println!();
            print_references(&generation.references);
            println!("conversation: {}", generation.user_query.id);
        }
        Commands::List => {
            let engines = app.store.list_engines().await?;
            if engines.is_empty() {
                println!("No query engines.");
            }
            for engine in engines {
                println!(
                    "{:<24} {:<15} {:<16} {}",
                    engine.name,
                    engine.engine_type,
                    engine.vector_store.as_deref().unwrap_or("-"),
                    engine.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Show { name } => {
            let engine = orchestrator::find_engine(app, &name).await?;
            let docs = app.store.documents_for_engine(&engine.id).await?;
            let json = serde_json::to_string_pretty(&engine).context("serializing engine")?;
            println!("{}", json);
            println!("documents: {}", docs.len());
            for doc in docs {
                println!(
                    "  [{:>6}, {:>6})  {}",
                    doc.index_start, doc.index_end, doc.doc_url
                );
            }
            let children = app.store.child_engines(&engine.id).await?;
            for child in children {
                println!("child: {}", child.name);
            }
        }
        Commands::Delete { name, hard } => {
            let engine = orchestrator::find_engine(app, &name).await?;
            orchestrator::delete_engine(app, &engine, hard).await?;
            println!(
                "Deleted {} ({})",
                engine.name,
                if hard { "hard" } else { "soft" }
            );
        }
    }
    Ok(())
}

fn print_references(refs: &[QueryReference]) {
    for (i, r) in refs.iter().enumerate() {
        let page = r.page.map(|p| format!(" p.{}", p + 1)).unwrap_or_default();
        println!(
            "{}. [{}] {}{}",
            i + 1,
            r.engine_name,
            r.document_url,
            page
        );
        println!("    {}", r.text());
    }
}
