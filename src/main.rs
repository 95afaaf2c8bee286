use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use photodedup::services::ScannerService;
use photodedup::{
    DedupConfig, DedupProgress, DedupReport, DuplicateDetector, EmbeddingProvider, Item, ItemId,
    PerceptualHashEmbedder, PrecomputedEmbedder, ThumbnailEmbedder,
};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Serialize, Deserialize, Debug)]
struct CullHistoryRecord {
    timestamp: String,
    group: String,
    retained: String,
    culled: Vec<String>,
    action: String,
}

/// An item from an `--items` file, optionally carrying its embedding.
#[derive(Serialize, Deserialize, Debug)]
struct ItemRecord {
    #[serde(flatten)]
    item: Item,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
}

#[derive(Serialize, Debug)]
struct PairRecord {
    score: f32,
    first: ItemId,
    second: ItemId,
}

#[derive(Parser, Debug)]
#[command(name = "photodedup", version, about = "Find and cull near-duplicate photos")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a directory and list duplicate groups
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = EmbedderKind::Thumbnail)]
        embedder: EmbedderKind,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Group items that carry precomputed embeddings
    Group {
        /// JSON array of items with an `embedding` field
        #[arg(long, value_name = "FILE")]
        items: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Print the most similar pairs
    Pairs {
        #[arg(short, long, value_name = "DIR", required_unless_present = "items", conflicts_with = "items")]
        path: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        items: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = EmbedderKind::Thumbnail)]
        embedder: EmbedderKind,
        /// Number of pairs to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Move duplicates from a report into `<dir>/duplicates`
    Cull {
        /// Directory the report was produced from
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Report written by `scan --output`
        #[arg(long, value_name = "FILE")]
        report: PathBuf,
        /// Only show what would be moved
        #[arg(long)]
        dry_run: bool,
        /// Directory to move duplicates into (default: `<dir>/duplicates`)
        #[arg(long, value_name = "DIR")]
        target_dir: Option<PathBuf>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EmbedderKind {
    Thumbnail,
    Hash,
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Similarity at or above which photos are duplicates
    #[arg(long)]
    threshold: Option<f32>,
    #[arg(long)]
    min_community_size: Option<usize>,
    /// Process items in chunks of this size on disk
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long)]
    max_pairs: Option<usize>,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long, value_name = "DIR")]
    chunk_dir: Option<PathBuf>,
    #[arg(long)]
    keep_chunks: bool,
    /// Reuse chunks left by an interrupted run
    #[arg(long)]
    resume: bool,
    /// JSON config file; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Write the JSON result here
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

impl EngineArgs {
    fn to_config(&self) -> Result<DedupConfig> {
        let mut config = match &self.config {
            Some(path) => DedupConfig::load(path)
                .with_context(|| format!("Failed to load config {:?}", path))?,
            None => DedupConfig::default(),
        };
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(size) = self.min_community_size {
            config.min_community_size = size;
        }
        if self.chunk_size.is_some() {
            config.chunk_size = self.chunk_size;
        }
        if let Some(max_pairs) = self.max_pairs {
            config.max_pairs = max_pairs;
        }
        if let Some(top_k) = self.top_k {
            config.top_k = top_k;
        }
        if self.chunk_dir.is_some() {
            config.chunk_dir = self.chunk_dir.clone();
        }
        config.keep_chunks |= self.keep_chunks;
        config.resume |= self.resume;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Scan {
            path,
            embedder,
            engine,
        } => {
            println!("▶ Scanning for duplicates in: {}", path.display());
            let config = engine.to_config()?;
            let items = ScannerService::new().scan(&path)?;
            let report = match embedder {
                EmbedderKind::Thumbnail => detect(ThumbnailEmbedder::default(), &items, config)?,
                EmbedderKind::Hash => detect(PerceptualHashEmbedder::default(), &items, config)?,
            };
            print_report(&report);
            write_json(engine.output.as_deref(), &report)?;
        }

        Commands::Group { items, engine } => {
            let config = engine.to_config()?;
            let (items, embedder) = load_items(&items)?;
            let report = detect(embedder, &items, config)?;
            print_report(&report);
            write_json(engine.output.as_deref(), &report)?;
        }

        Commands::Pairs {
            path,
            items,
            embedder,
            limit,
            engine,
        } => {
            let config = engine.to_config()?;
            let pairs = match (path, items) {
                (_, Some(items_file)) => {
                    let (items, precomputed) = load_items(&items_file)?;
                    top_pairs(precomputed, &items, config, limit)?
                }
                (Some(dir), None) => {
                    let items = ScannerService::new().scan(&dir)?;
                    match embedder {
                        EmbedderKind::Thumbnail => {
                            top_pairs(ThumbnailEmbedder::default(), &items, config, limit)?
                        }
                        EmbedderKind::Hash => {
                            top_pairs(PerceptualHashEmbedder::default(), &items, config, limit)?
                        }
                    }
                }
                (None, None) => anyhow::bail!("Either --path or --items is required"),
            };

            if pairs.is_empty() {
                println!("No pairs found.");
            }
            for (rank, pair) in pairs.iter().enumerate() {
                println!("{:>4}. {:.4}  {} ↔ {}", rank + 1, pair.score, pair.first, pair.second);
            }
            write_json(engine.output.as_deref(), &pairs)?;
        }

        Commands::Cull {
            path,
            report,
            dry_run,
            target_dir,
            yes,
        } => cull(&path, &report, dry_run, target_dir, yes)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "photodedup=debug" } else { "photodedup=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn progress_bar() -> Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
    )?);
    Ok(bar)
}

fn detector<P: EmbeddingProvider>(
    provider: P,
    config: DedupConfig,
) -> Result<(DuplicateDetector<P>, ProgressBar)> {
    let bar = progress_bar()?;
    let observer = bar.clone();
    let detector = DuplicateDetector::new(config, provider)?.with_observer(move |p: &DedupProgress| {
        observer.set_length(p.total as u64);
        observer.set_position(p.completed as u64);
        observer.set_message(p.message.clone());
    });
    Ok((detector, bar))
}

fn detect<P: EmbeddingProvider>(provider: P, items: &[Item], config: DedupConfig) -> Result<DedupReport> {
    let (detector, bar) = detector(provider, config)?;
    let report = benchmark("duplicate detection", || detector.run(items));
    bar.finish_and_clear();
    Ok(report?)
}

fn top_pairs<P: EmbeddingProvider>(
    provider: P,
    items: &[Item],
    config: DedupConfig,
    limit: usize,
) -> Result<Vec<PairRecord>> {
    let (detector, bar) = detector(provider, config)?;
    let (store, skipped) = detector.embed_all(items)?;
    let pairs = benchmark("pair mining", || detector.mine_pairs(&store));
    bar.finish_and_clear();
    if !skipped.is_empty() {
        println!("⚠️  Skipped {} item(s) that could not be embedded", skipped.len());
    }

    let store_items = store.items();
    Ok(pairs?
        .into_iter()
        .take(limit)
        .map(|pair| PairRecord {
            score: pair.score,
            first: store_items[pair.first].id.clone(),
            second: store_items[pair.second].id.clone(),
        })
        .collect())
}

/// Read an `--items` file into items and an embedder over their `embedding` arrays.
fn load_items(path: &Path) -> Result<(Vec<Item>, PrecomputedEmbedder)> {
    let file = File::open(path).with_context(|| format!("Could not open items file {:?}", path))?;
    let records: Vec<ItemRecord> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid items file {:?}", path))?;

    let mut items = Vec::with_capacity(records.len());
    let mut entries = Vec::new();
    for record in records {
        if let Some(embedding) = record.embedding {
            entries.push((record.item.id.clone(), embedding));
        }
        items.push(record.item);
    }
    if entries.is_empty() {
        anyhow::bail!("No item in {:?} carries an embedding", path);
    }
    let embedder = PrecomputedEmbedder::from_entries(entries)
        .with_context(|| format!("Embeddings in {:?} do not share one dimension", path))?;
    Ok((items, embedder))
}

fn print_report(report: &DedupReport) {
    if !report.skipped.is_empty() {
        println!("⚠️  Skipped {} item(s):", report.skipped.len());
        for skipped in &report.skipped {
            println!("   ✗ {}: {}", skipped.id, skipped.reason);
        }
    }
    if report.groups.is_empty() {
        println!("No duplicates found.");
        return;
    }

    println!("Found {} duplicate group(s):", report.groups.len());
    for group in &report.groups {
        println!("\n✨ Group {}:", group.id);
        println!("   🏆 Original → {}", group.original_media_item_id);
        for duplicate in group.duplicates() {
            let best = report
                .similarity_map
                .neighbors(duplicate)
                .filter(|(other, _)| group.media_item_ids.contains(*other))
                .map(|(_, score)| score)
                .reduce(f32::max);
            match best {
                Some(score) => println!("   ▶ {} ({:.4})", duplicate, score),
                None => println!("   ▶ {}", duplicate),
            }
        }
    }
}

fn write_json<T: Serialize + ?Sized>(output: Option<&Path>, value: &T) -> Result<()> {
    let Some(output) = output else {
        return Ok(());
    };
    let file = File::create(output).with_context(|| format!("Failed to create {:?}", output))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    println!("📝 Wrote {}", output.display());
    Ok(())
}

fn cull(
    path: &Path,
    report_path: &Path,
    dry_run: bool,
    target_dir: Option<PathBuf>,
    yes: bool,
) -> Result<()> {
    let file = File::open(report_path)
        .with_context(|| format!("Could not open report {:?}", report_path))?;
    let report: DedupReport = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid report {:?}", report_path))?;

    if report.groups.is_empty() {
        println!("No duplicates found.");
        return Ok(());
    }

    // Ids come from a report file; none may point outside `path` or the target.
    for group in &report.groups {
        for duplicate in group.duplicates() {
            relative_id_path(duplicate)?;
        }
    }

    let dup_dir = target_dir.unwrap_or_else(|| path.join("duplicates"));
    let to_move: usize = report.groups.iter().map(|g| g.len() - 1).sum();
    println!(
        "▶ Culling {} duplicate(s) from {} group(s) in: {}",
        to_move,
        report.groups.len(),
        path.display()
    );

    if !dry_run && !yes {
        let proceed = Confirm::new()
            .with_prompt(format!("Move {} file(s) into {}?", to_move, dup_dir.display()))
            .default(false)
            .interact()?;
        if !proceed {
            println!("Aborted; no files were changed.");
            return Ok(());
        }
    }

    let history_file = path.join(".history.jsonl");
    let mut history_out = if dry_run {
        None
    } else {
        fs::create_dir_all(&dup_dir)
            .with_context(|| format!("Failed to create directory {:?}", dup_dir))?;
        Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&history_file)
                .with_context(|| format!("Failed to open history file {:?}", history_file))?,
        )
    };

    for group in &report.groups {
        println!("\n✨ Group {}:", group.id);
        println!("   🏆 Keeping → {}", group.original_media_item_id);
        let mut culled = Vec::new();

        for duplicate in group.duplicates() {
            let relative = relative_id_path(duplicate)?;
            let src = path.join(&relative);
            let dest = dup_dir.join(&relative);
            if dry_run {
                println!("   📦 [dry-run] MOVE {} → {}", src.display(), dest.display());
                continue;
            }
            if !src.exists() {
                eprintln!("⚠️  {} does not exist; skipping", src.display());
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
            fs::rename(&src, &dest)
                .with_context(|| format!("Failed to move {:?} → {:?}", src, dest))?;
            println!("   📦 Moved {} → {}", src.display(), dest.display());
            culled.push(duplicate.to_string());
        }

        if let Some(out) = history_out.as_mut() {
            let record = CullHistoryRecord {
                timestamp: Utc::now().to_rfc3339(),
                group: group.id.clone(),
                retained: group.original_media_item_id.to_string(),
                culled,
                action: "moved".to_string(),
            };
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        }
    }

    if dry_run {
        println!("\n⚠️  Dry-run only; no files were changed.");
    } else {
        println!("\n✅ Recorded cull history in {}", history_file.display());
    }
    Ok(())
}

/// `id` as a path relative to the library root. Absolute paths and `..` or `.`
/// components are rejected.
fn relative_id_path(id: &ItemId) -> Result<PathBuf> {
    let path = Path::new(id.as_str());
    if id.as_str().is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("Refusing to move {:?}: item ids must be relative paths inside the library", id.as_str());
    }
    Ok(path.to_path_buf())
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
