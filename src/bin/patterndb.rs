use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use patterndb::codec::preview_jpeg;
use patterndb::search::{default_radius, DEFAULT_LIMIT};
use patterndb::{
    Catalog, CatalogOptions, Pattern, Query, Reference, SearchControl, SearchOptions,
    StoreOptions,
};

#[derive(Debug, Parser)]
#[command(name = "patterndb")]
#[command(about = "Artwork similarity catalogue tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[arg(long)]
    db: PathBuf,
    /// Skip fsync after each stored pattern.
    #[arg(long)]
    no_sync: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Encode an image file and store its pattern.
    Put {
        #[command(flatten)]
        db: DbArgs,
        #[arg(long)]
        id: u64,
        #[arg(long)]
        image: PathBuf,
    },
    /// Store a pattern given in text form.
    PutPattern {
        #[command(flatten)]
        db: DbArgs,
        #[arg(long)]
        id: u64,
        #[arg(long)]
        text: String,
    },
    Get {
        #[command(flatten)]
        db: DbArgs,
        #[arg(long)]
        id: u64,
        /// Write a JPEG preview of the pattern to this path.
        #[arg(long)]
        preview: Option<PathBuf>,
        /// Print the pattern in text form.
        #[arg(long)]
        text: bool,
    },
    Search {
        #[command(flatten)]
        db: DbArgs,
        #[arg(long, conflicts_with = "image", required_unless_present = "image")]
        artwork: Option<u64>,
        #[arg(long)]
        image: Option<PathBuf>,
        /// Defaults to a tenth of the maximum pattern distance.
        #[arg(long)]
        radius: Option<f32>,
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
        /// Stop after examining this many candidates.
        #[arg(long)]
        budget: Option<u64>,
        /// Scan every record even when pivots are installed.
        #[arg(long)]
        no_prune: bool,
        #[arg(long)]
        json: bool,
    },
    /// Select pivots from the stored patterns and persist them.
    BuildPivots {
        #[command(flatten)]
        db: DbArgs,
        #[arg(long, default_value_t = 16)]
        count: usize,
    },
    /// List installed pivots with their previews.
    Pivots {
        #[command(flatten)]
        db: DbArgs,
        #[arg(long)]
        json: bool,
    },
    Scrub {
        #[command(flatten)]
        db: DbArgs,
        #[arg(long)]
        json: bool,
    },
    Stats {
        #[command(flatten)]
        db: DbArgs,
    },
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Put { db, id, image } => put(&db, id, &image),
        Command::PutPattern { db, id, text } => put_pattern(&db, id, &text),
        Command::Get {
            db,
            id,
            preview,
            text,
        } => get(&db, id, preview.as_deref(), text),
        Command::Search {
            db,
            artwork,
            image,
            radius,
            limit,
            budget,
            no_prune,
            json,
        } => {
            let reference = match (artwork, image) {
                (Some(id), _) => Reference::Artwork(id),
                (None, Some(path)) => Reference::Image(
                    std::fs::read(&path).with_context(|| format!("read {}", path.display()))?,
                ),
                (None, None) => anyhow::bail!("either --artwork or --image is required"),
            };
            let query = Query {
                reference,
                radius: radius.unwrap_or_else(default_radius),
                limit,
            };
            search(&db, &query, budget, no_prune, json)
        }
        Command::BuildPivots { db, count } => build_pivots(&db, count),
        Command::Pivots { db, json } => pivots(&db, json),
        Command::Scrub { db, json } => scrub(&db, json),
        Command::Stats { db } => stats(&db),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open(args: &DbArgs, search: SearchOptions) -> anyhow::Result<Catalog> {
    let options = CatalogOptions {
        store: StoreOptions {
            fsync_writes: !args.no_sync,
            ..StoreOptions::default()
        },
        search,
    };
    Catalog::open(&args.db, options).with_context(|| format!("open catalog {}", args.db.display()))
}

fn put(args: &DbArgs, id: u64, image: &Path) -> anyhow::Result<()> {
    let catalog = open(args, SearchOptions::default())?;
    let raw = std::fs::read(image).with_context(|| format!("read {}", image.display()))?;
    catalog
        .put_image(id, &raw)
        .with_context(|| format!("store pattern for artwork {id}"))?;
    println!("stored artwork={id}");
    Ok(())
}

fn put_pattern(args: &DbArgs, id: u64, text: &str) -> anyhow::Result<()> {
    let catalog = open(args, SearchOptions::default())?;
    let pattern = Pattern::parse(text).context("parse pattern text")?;
    catalog
        .put_pattern(id, &pattern)
        .with_context(|| format!("store pattern for artwork {id}"))?;
    println!("stored artwork={id}");
    Ok(())
}

fn get(args: &DbArgs, id: u64, preview: Option<&Path>, text: bool) -> anyhow::Result<()> {
    let catalog = open(args, SearchOptions::default())?;
    let pattern = catalog
        .pattern(id)
        .with_context(|| format!("load pattern for artwork {id}"))?;
    if let Some(path) = preview {
        let jpeg = preview_jpeg(&pattern)?;
        std::fs::write(path, jpeg).with_context(|| format!("write {}", path.display()))?;
        println!("preview written to {}", path.display());
    }
    if text {
        println!("{}", pattern.to_text());
    } else if preview.is_none() {
        println!("artwork={id} values={}", pattern.values().len());
    }
    Ok(())
}

fn search(
    args: &DbArgs,
    query: &Query,
    budget: Option<u64>,
    no_prune: bool,
    json: bool,
) -> anyhow::Result<()> {
    let catalog = open(
        args,
        SearchOptions {
            prune_with_pivots: !no_prune,
            ..SearchOptions::default()
        },
    )?;
    let control = SearchControl {
        budget,
        ..SearchControl::default()
    };
    let report = catalog.search(query, &control).context("search")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for m in &report.matches {
        println!(
            "artwork={} distance={:.3} level={} similarity={:.2}%",
            m.artwork_id, m.distance, m.discrete_distance_level, m.percentage_similarity
        );
    }
    println!(
        "matches={} scanned={} corrupt_skipped={} complete={}",
        report.matches.len(),
        report.scanned,
        report.corrupt_skipped,
        report.complete
    );
    Ok(())
}

fn build_pivots(args: &DbArgs, count: usize) -> anyhow::Result<()> {
    let catalog = open(args, SearchOptions::default())?;
    let index = catalog
        .build_pivots(count)
        .with_context(|| format!("build {count} pivots"))?;
    println!(
        "pivots={} levels={} fingerprint={:016x}",
        index.len(),
        index.levels().len(),
        index.fingerprint()
    );
    Ok(())
}

fn pivots(args: &DbArgs, json: bool) -> anyhow::Result<()> {
    let catalog = open(args, SearchOptions::default())?;
    let previews = catalog.pivot_previews()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&previews)?);
        return Ok(());
    }
    if previews.is_empty() {
        println!("no pivots installed");
    }
    for pivot in previews {
        println!("level={} preview={}", pivot.level, pivot.preview);
    }
    Ok(())
}

fn scrub(args: &DbArgs, json: bool) -> anyhow::Result<()> {
    let catalog = open(args, SearchOptions::default())?;
    let report = catalog.store().scrub();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (level, records) in &report.records_by_level {
            println!("scrub: level={level} records={records}");
        }
        println!(
            "scrub: checked={} untagged={} corrupt={}",
            report.records_checked,
            report.untagged,
            report.corrupt.len()
        );
    }
    if !report.corrupt.is_empty() {
        anyhow::bail!("scrub found corrupt patterns: {:?}", report.corrupt);
    }
    Ok(())
}

fn stats(args: &DbArgs) -> anyhow::Result<()> {
    let catalog = open(args, SearchOptions::default())?;
    let stats = catalog.store().stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if let Some(index) = catalog.engine().pivots() {
        println!("pivots={} fingerprint={:016x}", index.len(), index.fingerprint());
    }
    Ok(())
}
