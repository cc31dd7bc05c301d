use std::{
    collections::HashSet,
    io::Read as _,
    path::PathBuf,
};

use clap::Parser;
use kdam::{BarExt, tqdm};
use knowbase::{
    AnswerGenerator,
    DataDir,
    Document,
    DocumentId,
    FileExtractor,
    KnowledgeBase,
    Settings,
    SettingsDb,
    TextExtractor,
    error::{self, Error},
    knowledge_base::IngestOutcome,
    mcp,
    settings,
    walker,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("KNOWBASE_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let settings_db = SettingsDb::open(&data_dir.settings_db())?;

    if let Command::Config { action } = &cli.command {
        return cmd_config(&settings_db, action);
    }

    let mut settings = Settings::load(&settings_db)?;
    if let Some(embedder) = &cli.embedder {
        settings.embedder = embedder.parse()?;
    }
    if let Some(model) = &cli.model {
        settings.model = Some(model.clone());
    }

    let kb = settings.open_knowledge_base(&data_dir)?;
    if let Some(warning) = kb.load_warning() {
        eprintln!("Warning: stored knowledge base could not be loaded: {warning}");
    }

    match cli.command {
        Command::Add(args) => cmd_add(&kb, &args)?,
        Command::AddText(args) => cmd_add_text(&kb, &args)?,
        Command::Remove(args) => {
            let doc_id: DocumentId = args.doc_id.parse()?;
            kb.remove_document(doc_id)?;
            println!("Removed {doc_id}");
        }
        Command::List(args) => cmd_list(&kb, args.json)?,
        Command::Show(args) => cmd_show(&kb, &args)?,
        Command::Search(args) => {
            let k = args.count.unwrap_or(settings.top_k);
            let filter = parse_filter(&args.docs)?;
            let results = kb.search(&args.query, k, filter.as_ref())?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results found for \"{}\"", args.query);
            } else {
                for (rank, r) in results.iter().enumerate() {
                    println!(
                        "{}. {} {:.4} {} / {}",
                        rank + 1,
                        r.metadata.doc_id,
                        r.score,
                        r.metadata.doc_name,
                        r.metadata.title
                    );
                    println!("{}\n", r.content);
                }
            }
        }
        Command::Ask(args) => {
            let k = args.count.unwrap_or(settings.top_k);
            let filter = parse_filter(&args.docs)?;
            let passages = kb.search(&args.query, k, filter.as_ref())?;
            let answer = settings.build_generator().generate(&args.query, &passages)?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}", answer.response);
                if !answer.sources.is_empty() {
                    println!("\nSources:");
                    for s in &answer.sources {
                        println!(
                            "  {} {} / {} ({:.4})",
                            s.doc_id, s.doc_name, s.title, s.score
                        );
                    }
                }
            }
        }
        Command::Rebuild => {
            let count = kb.rebuild()?;
            eprintln!("Rebuilt index with {count} chunk(s).");
        }
        Command::Status(args) => {
            let stats = kb.stats();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Data directory: {}", data_dir.root().display());
                println!("Knowledge base: {}", stats.path.display());
                println!(
                    "Model: {}",
                    stats.model_id.as_deref().unwrap_or(kb.embedder().model_id())
                );
                println!("Documents: {}", stats.documents);
                println!("Chunks: {}", stats.chunks);
                println!("Vectors: {}", stats.vectors);
                match stats.dimension {
                    Some(dim) => println!("Dimension: {dim}"),
                    None => println!("Dimension: -"),
                }
            }
        }
        Command::Mcp => mcp::run_mcp(kb, settings.top_k)?,
        Command::Config { .. } | Command::Completions(_) => {}
    }

    Ok(())
}

fn parse_filter(raw: &[String]) -> error::Result<Option<HashSet<DocumentId>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.iter()
        .map(|s| s.parse())
        .collect::<error::Result<HashSet<_>>>()
        .map(Some)
}

fn cmd_add(kb: &KnowledgeBase, args: &cli::AddArgs) -> error::Result<()> {
    let extractor = FileExtractor;
    let glob = args.glob.as_deref().map(walker::compile_glob).transpose()?;
    let files = walker::collect_inputs(&args.paths, &extractor, glob.as_ref())?;

    if files.is_empty() {
        eprintln!("No supported files found.");
        return Ok(());
    }

    if let Some(name) = &args.name {
        let [file] = files.as_slice() else {
            return Err(Error::Config(
                "--name can only be used with a single file".to_string(),
            ));
        };
        let text = extractor.extract(file)?;
        print_added(&kb.add(name, &text)?);
        return Ok(());
    }

    let outcomes = ingest_with_progress(kb, &files, &extractor);
    report_outcomes(&outcomes)
}

fn ingest_with_progress(
    kb: &KnowledgeBase,
    files: &[PathBuf],
    extractor: &FileExtractor,
) -> Vec<IngestOutcome> {
    let mut pb = tqdm!(total = files.len(), desc = "Adding", unit = " docs");
    let mut progress = |i: usize, _total: usize, name: &str| {
        pb.set_description(name);
        let _ = pb.update_to(i);
    };
    let outcomes = kb.ingest_files(files, extractor, Some(&mut progress));
    let _ = pb.update_to(files.len());
    eprintln!();
    outcomes
}

fn report_outcomes(outcomes: &[IngestOutcome]) -> error::Result<()> {
    let mut failed = 0;
    for outcome in outcomes {
        match &outcome.result {
            Ok(doc) => print_added(doc),
            Err(e) => {
                failed += 1;
                eprintln!("Failed: {}: {e}", outcome.name);
            }
        }
    }

    eprintln!(
        "Added {} of {} document(s).",
        outcomes.len() - failed,
        outcomes.len()
    );
    if failed == outcomes.len() {
        return Err(Error::Config("no documents were added".to_string()));
    }
    Ok(())
}

fn print_added(doc: &Document) {
    println!("{}\t{}\t{} chunk(s)", doc.doc_id, doc.name, doc.chunk_count);
}

fn cmd_add_text(kb: &KnowledgeBase, args: &cli::AddTextArgs) -> error::Result<()> {
    let text = if args.text == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        args.text.clone()
    };

    print_added(&kb.add(&args.name, &text)?);
    Ok(())
}

fn cmd_list(kb: &KnowledgeBase, json: bool) -> error::Result<()> {
    let documents = kb.list_documents();

    if json {
        let docs: Vec<_> = documents
            .values()
            .map(|d| {
                serde_json::json!({
                    "doc_id": d.doc_id.to_string(),
                    "name": d.name,
                    "added_at": d.added_at,
                    "chunk_count": d.chunk_count,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&docs)?);
    } else if documents.is_empty() {
        println!("No documents.");
    } else {
        for doc in documents.values() {
            println!("{}\t{}\t{} chunk(s)", doc.doc_id, doc.name, doc.chunk_count);
        }
    }
    Ok(())
}

fn cmd_show(kb: &KnowledgeBase, args: &cli::ShowArgs) -> error::Result<()> {
    let doc_id: DocumentId = args.doc_id.parse()?;
    let doc = kb.document(doc_id).ok_or(Error::UnknownDocument(doc_id))?;
    let chunks = kb.chunks(doc_id)?;

    if args.json {
        let value = serde_json::json!({
            "doc_id": doc.doc_id.to_string(),
            "name": doc.name,
            "added_at": doc.added_at,
            "chunk_count": doc.chunk_count,
            "chunks": chunks,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("id: {}", doc.doc_id);
        println!("name: {}", doc.name);
        println!("added_at: {}", doc.added_at);
        println!("chunks: {}", doc.chunk_count);
        for chunk in &chunks {
            println!(
                "\n--- {} ({} tokens, offset {}) ---",
                chunk.title, chunk.token_count, chunk.start_offset
            );
            println!("{}", chunk.content);
        }
    }
    Ok(())
}

fn cmd_config(db: &SettingsDb, action: &ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let resolved = Settings::load(db)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&resolved)?);
            } else {
                let stored = db.list()?;
                for (key, description) in settings::KEYS {
                    let value = stored
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v.as_str());
                    match value {
                        Some(v) => println!("{key} = {v}"),
                        None => println!("{key} (default)  # {description}"),
                    }
                }
                println!("\nembedder in use: {}", resolved.embedder);
            }
        }
        ConfigAction::Set { key, value } => {
            db.set(key, value)?;
            println!("Set {key} = {value}");
            if key == "embedder" || key == "model" {
                eprintln!("The index is rebuilt on next use if the embedding model changed.");
            }
        }
        ConfigAction::Unset { key } => {
            if !db.unset(key)? {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key.clone(),
                });
            }
            println!("Cleared {key}");
        }
    }
    Ok(())
}
