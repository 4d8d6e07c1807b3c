use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use ta_knowledge::bootstrap::{build_service, BootOptions};
use ta_knowledge::config::Config;
use ta_knowledge::extract::FileKind;
use ta_knowledge::processor::DocumentMetadata;
use ta_knowledge::service::{
    AskRequest, DeleteKnowledgeRequest, SearchRequest, SearchScope, TemplateFillRequest,
};
use ta_knowledge::store::Payload;
use ta_knowledge::template;

#[derive(Parser, Debug)]
#[command(author, version, about = "Course knowledge extraction and template filling", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Extract a file or every supported file under a directory
    Ingest {
        path: PathBuf,
        #[arg(short, long)]
        user_id: i64,
        /// Id of the first document; later files get consecutive ids
        #[arg(short, long, default_value_t = 1)]
        document_id: i64,
        /// Extra chunk metadata as key=value
        #[arg(short, long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },
    /// Search stored knowledge
    Search {
        query: String,
        #[arg(short, long)]
        user_id: i64,
        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
        /// Search the global partition instead of the user's
        #[arg(long)]
        global: bool,
    },
    /// Answer a question from the user's knowledge
    Ask {
        question: String,
        #[arg(short, long)]
        user_id: i64,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Fill a catalog template
    Fill {
        #[arg(short, long)]
        template_id: i64,
        #[arg(short, long)]
        user_id: i64,
        question: String,
        #[arg(long)]
        no_rag: bool,
    },
    /// Report the variables and problems of a template
    Analyze {
        /// Template text; read from --file when omitted
        content: Option<String>,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Show a user's knowledge statistics
    Stats {
        #[arg(short, long)]
        user_id: i64,
    },
    /// Delete a user's knowledge
    Delete {
        #[arg(short, long)]
        user_id: i64,
        /// Only these documents; everything when omitted
        #[arg(short, long)]
        document_id: Vec<i64>,
        #[arg(long)]
        yes: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn collect_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }

    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| FileKind::from_path(p).is_some())
        .collect();
    files.sort();
    files
}

fn template_text(content: Option<&String>, file: Option<&PathBuf>) -> Result<String> {
    match (content, file) {
        (Some(content), _) => Ok(content.clone()),
        (None, Some(file)) => std::fs::read_to_string(file)
            .with_context(|| format!("reading template {}", file.display())),
        (None, None) => bail!("pass the template text or --file"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let mut config = Config::from_env()?;
    init_tracing(&config.processing.log_level);

    // Analysis is pure and must not wait on Ollama or the catalog.
    if let Command::Analyze { content, file } = &args.command {
        let content = template_text(content.as_ref(), file.as_ref())?;
        return print_json(&template::analyze(&content, None));
    }

    let service = build_service(&config, BootOptions { load_models: true }).await?;

    match args.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            ta_knowledge::api::serve(service, &config.server).await?;
        }
        Command::Ingest {
            path,
            user_id,
            document_id,
            meta,
        } => {
            let files = collect_files(&path);
            if files.is_empty() {
                println!("No supported documents found under {}", path.display());
                return Ok(());
            }

            let items = files
                .into_iter()
                .zip(document_id..)
                .map(|(file, id)| {
                    let metadata = meta
                        .iter()
                        .fold(DocumentMetadata::new(id), |m, (k, v)| m.with(k, v.clone()));
                    (file, metadata)
                })
                .collect();

            let report = service.processor().process_batch(items, user_id).await;
            for item in &report.details {
                match &item.error {
                    None => println!("✓ {} (document {}): {} chunks", item.file_path, item.document_id, item.chunks),
                    Some(e) => println!("✗ {} (document {}): {}", item.file_path, item.document_id, e),
                }
            }
            println!(
                "\nProcessed {} documents: {} succeeded, {} failed.",
                report.total, report.successful, report.failed
            );
        }
        Command::Search {
            query,
            user_id,
            top_k,
            global,
        } => {
            let response = service
                .search(SearchRequest {
                    user_id,
                    query,
                    top_k,
                    search_scope: if global { SearchScope::Global } else { SearchScope::User },
                    filters: Payload::new(),
                })
                .await?;
            print_json(&response)?;
        }
        Command::Ask {
            question,
            user_id,
            top_k,
        } => {
            let answer = service
                .ask(AskRequest {
                    user_id,
                    question,
                    top_k,
                })
                .await?;
            println!("{}", answer.answer);
            if !answer.sources.is_empty() {
                println!("\nSources: {}", answer.sources.join(", "));
            }
        }
        Command::Fill {
            template_id,
            user_id,
            question,
            no_rag,
        } => {
            let filled = service
                .fill_template(TemplateFillRequest {
                    user_id,
                    template_id,
                    question,
                    context: Payload::new(),
                    use_rag: !no_rag,
                })
                .await?;
            print_json(&filled)?;
        }
        Command::Stats { user_id } => {
            print_json(&service.stats(user_id).await?)?;
        }
        Command::Delete {
            user_id,
            document_id,
            yes,
        } => {
            let response = service
                .delete_knowledge(DeleteKnowledgeRequest {
                    user_id,
                    document_ids: (!document_id.is_empty()).then_some(document_id),
                    confirm: yes,
                })
                .await?;
            println!("{}", response.message);
        }
        Command::Analyze { content, file } => {
            let content = template_text(content.as_ref(), file.as_ref())?;
            print_json(&service.analyze_template(&content))?;
        }
    }

    Ok(())
}
