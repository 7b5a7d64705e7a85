//! SPARQ CLI
//!
//! Command-line interface for:
//! - Answering natural-language questions against a knowledge graph (`ask`)
//! - Inspecting the parser's n-best skeletons for a question (`parse`)
//! - Inspecting linker candidates for a single mention (`link`)
//! - Running a textual graph query directly, bypassing the parser (`query`)
//! - Training a translation-model artifact from aligned pairs (`train`)
//! - Summarizing a loaded knowledge graph (`stats`)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use sparq_kg::{snapshot, InMemoryBackend, KnowledgeGraph, TermKind};
use sparq_linker::{LinkContext, Linker, LinkerConfig};
use sparq_parser::{Question, SemanticParser, TranslationModel};
use sparq_pipeline::{Pipeline, PipelineConfig, PipelineFailure};

#[derive(Parser)]
#[command(name = "sparq")]
#[command(author, version, about = "SPARQ: question answering over knowledge graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the knowledge graph comes from: a binary snapshot, or a TSV pair
/// (labels + triples) that gets indexed on load.
#[derive(Args)]
struct KgArgs {
    /// Binary KG snapshot (as written by `sparq stats --save`).
    #[arg(long, conflicts_with_all = ["labels", "triples"])]
    kg: Option<PathBuf>,

    /// Label TSV: `id<TAB>kind<TAB>label[<TAB>alias|alias]`.
    #[arg(long, requires = "triples")]
    labels: Option<PathBuf>,

    /// Triple TSV: `subject<TAB>relation<TAB>object`.
    #[arg(long, requires = "labels")]
    triples: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question end to end.
    Ask {
        #[command(flatten)]
        kg: KgArgs,

        /// Trained translation-model artifact.
        #[arg(long)]
        model: PathBuf,

        /// Optional pipeline config (JSON; missing fields use defaults).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Emit the answer as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,

        /// The question text.
        question: Vec<String>,
    },

    /// Show the n-best skeletons the parser produces for a question.
    Parse {
        /// Trained translation-model artifact.
        #[arg(long)]
        model: PathBuf,

        /// The question text.
        question: Vec<String>,
    },

    /// Show ranked linker candidates for one mention.
    Link {
        #[command(flatten)]
        kg: KgArgs,

        /// Expected kind: entity, relation, or literal.
        #[arg(long, default_value = "entity")]
        kind: String,

        /// Candidate cap.
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// The mention text.
        mention: Vec<String>,
    },

    /// Execute a textual graph query, e.g. `select ?x where { kg:Q42 kg:P57 ?x . }`.
    Query {
        #[command(flatten)]
        kg: KgArgs,

        /// The query text.
        query: Vec<String>,
    },

    /// Estimate a translation model from aligned pairs and save it.
    Train {
        /// TSV of `question<TAB>encoded skeleton` pairs.
        #[arg(long)]
        pairs: PathBuf,

        /// Output artifact path.
        #[arg(long)]
        out: PathBuf,
    },

    /// Summarize a knowledge graph, optionally re-saving it as a snapshot.
    Stats {
        #[command(flatten)]
        kg: KgArgs,

        /// Save the loaded graph as a binary snapshot.
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

fn load_graph(args: &KgArgs) -> Result<KnowledgeGraph> {
    match (&args.kg, &args.labels, &args.triples) {
        (Some(path), _, _) => snapshot::load(path)
            .with_context(|| format!("loading KG snapshot {}", path.display())),
        (None, Some(labels), Some(triples)) => snapshot::load_tsv(labels, triples)
            .with_context(|| format!("loading KG from {}", labels.display())),
        _ => Err(anyhow!("provide either --kg or both --labels and --triples")),
    }
}

fn load_model(path: &Path) -> Result<TranslationModel> {
    TranslationModel::load(path)
        .with_context(|| format!("loading model artifact {}", path.display()))
}

fn joined(words: &[String]) -> Result<String> {
    let text = words.join(" ");
    if text.trim().is_empty() {
        return Err(anyhow!("empty text argument"));
    }
    Ok(text)
}

fn parse_kind(s: &str) -> Result<TermKind> {
    match s.to_lowercase().as_str() {
        "entity" => Ok(TermKind::Entity),
        "relation" => Ok(TermKind::Relation),
        "literal" => Ok(TermKind::Literal),
        other => Err(anyhow!("unknown kind `{other}`; use entity, relation, or literal")),
    }
}

async fn cmd_ask(
    kg: &KgArgs,
    model: &Path,
    config: Option<&Path>,
    json: bool,
    question: &str,
) -> Result<()> {
    let graph = Arc::new(load_graph(kg)?);
    let backend = Arc::new(InMemoryBackend::new(graph));
    let model = Arc::new(load_model(model)?);
    let config = match config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };

    let pipeline = Pipeline::new(model, backend, config);
    match pipeline.answer(question).await {
        Ok(answer) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
                return Ok(());
            }
            if answer.is_no_answer() {
                println!("{} (confidence {:.3})", "no answer".yellow(), answer.confidence);
                return Ok(());
            }
            for entry in &answer.entries {
                println!(
                    "{}  {}  [{}]",
                    entry.kg_id.as_str().cyan(),
                    entry.label,
                    entry.kind
                );
            }
            println!("confidence: {:.3}", answer.confidence);
            Ok(())
        }
        Err(failure) => {
            let code = failure.reason_code();
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "code": code, "detail": failure.to_string() })
                );
            } else {
                eprintln!("{}: {}", code.red(), failure);
            }
            // Distinguish pipeline outcomes from CLI usage errors.
            match failure {
                PipelineFailure::Execution { .. } | PipelineFailure::Timeout(_) => {
                    Err(failure.into())
                }
                _ => Ok(()),
            }
        }
    }
}

fn cmd_parse(model: &Path, question: &str) -> Result<()> {
    let model = Arc::new(load_model(model)?);
    let parser = SemanticParser::new(model);
    let question = Question::new(question)?;
    let parsed = parser.parse(&question, None)?;
    for (rank, p) in parsed.iter().enumerate() {
        println!(
            "{} {:.3}  {}",
            format!("#{rank}").bold(),
            p.confidence,
            p.skeleton.encoded()
        );
        for slot in p.skeleton.slots() {
            println!(
                "    {} {} -> \"{}\"",
                slot.id,
                slot.expected_type,
                question.span_text(slot.source_span)
            );
        }
    }
    Ok(())
}

async fn cmd_link(kg: &KgArgs, kind: TermKind, limit: usize, mention: &str) -> Result<()> {
    let graph = Arc::new(load_graph(kg)?);
    let backend = Arc::new(InMemoryBackend::new(graph));
    let linker = Linker::with_config(
        backend,
        LinkerConfig {
            max_candidates: limit,
            ..LinkerConfig::default()
        },
    );
    let candidates = linker.link(mention, kind, &LinkContext::default()).await?;
    if candidates.is_empty() {
        println!("{}", "no candidates".yellow());
        return Ok(());
    }
    for c in &candidates {
        println!(
            "{:.3}  {}  {}  (sim {:.3}, prior {:.3})",
            c.score,
            c.id.as_str().cyan(),
            c.label,
            c.sim,
            c.prior
        );
    }
    Ok(())
}

fn cmd_query(kg: &KgArgs, text: &str) -> Result<()> {
    let graph = load_graph(kg)?;
    let query = sparq_kg::parse_query(text)?;
    let results = sparq_kg::execute(&graph, &query)?;
    if results.is_empty() {
        println!("{}", "no results".yellow());
        return Ok(());
    }
    for entry in &results.entries {
        println!("{}  {}  [{}]", entry.kg_id.as_str().cyan(), entry.label, entry.kind);
    }
    Ok(())
}

fn cmd_train(pairs_path: &Path, out: &Path) -> Result<()> {
    let raw = fs::read_to_string(pairs_path)
        .with_context(|| format!("reading pairs {}", pairs_path.display()))?;
    let mut pairs = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (question, target) = line
            .split_once('\t')
            .ok_or_else(|| anyhow!("{}:{}: expected two tab-separated fields", pairs_path.display(), lineno + 1))?;
        pairs.push((question, target));
    }
    if pairs.is_empty() {
        return Err(anyhow!("no training pairs in {}", pairs_path.display()));
    }
    let model = TranslationModel::from_aligned_pairs(&pairs);
    model.save(out)?;
    println!("trained on {} pairs -> {}", pairs.len(), out.display());
    Ok(())
}

fn cmd_stats(kg: &KgArgs, save: Option<&Path>) -> Result<()> {
    let graph = load_graph(kg)?;
    let snap = snapshot::KgSnapshot::capture(&graph);
    println!("entities:  {}", snap.entities.len());
    println!("literals:  {}", snap.literals.len());
    println!("relations: {}", snap.relations.len());
    println!("triples:   {}", snap.triples.len());
    if let Some(path) = save {
        snapshot::save(&graph, path)?;
        println!("snapshot saved -> {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ask {
            kg,
            model,
            config,
            json,
            question,
        } => {
            let question = joined(&question)?;
            cmd_ask(&kg, &model, config.as_deref(), json, &question).await
        }
        Commands::Parse { model, question } => {
            let question = joined(&question)?;
            cmd_parse(&model, &question)
        }
        Commands::Link {
            kg,
            kind,
            limit,
            mention,
        } => {
            let mention = joined(&mention)?;
            cmd_link(&kg, parse_kind(&kind)?, limit, &mention).await
        }
        Commands::Query { kg, query } => {
            let text = joined(&query)?;
            cmd_query(&kg, &text)
        }
        Commands::Train { pairs, out } => cmd_train(&pairs, &out),
        Commands::Stats { kg, save } => cmd_stats(&kg, save.as_deref()),
    }
}
