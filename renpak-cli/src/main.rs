//! renpak CLI Tool
//!
//! Command-line interface for repacking Ren'Py RPA archives with
//! AVIF/AVIS-compressed images.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use renpak_build::{BuildOptions, Builder, ProgressEvent, ProgressSink};
use renpak_core::RpaReader;
use renpak_encoder::{Av1Encoder, EncoderConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "renpak")]
#[command(about = "Ren'Py asset compression toolkit - JPG/PNG -> AVIF/AVIS transcoding")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build compressed RPA archives with AVIF-encoded images
    Build {
        /// Game directory containing .rpa files
        game_dir: PathBuf,

        /// Output directory (default: "<game_dir>_compressed")
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Max images to encode per archive (0 = all)
        #[arg(long, default_value = "0")]
        limit: usize,

        /// AVIF quality 1-63 (lower = smaller file, more loss)
        #[arg(long, default_value = "50")]
        quality: u8,

        /// Encoder speed 0-10 (higher = faster, slightly larger)
        #[arg(long, default_value = "6")]
        speed: u8,

        /// Worker threads (0 = number of logical CPUs)
        #[arg(long, default_value = "0")]
        workers: usize,
    },

    /// Analyze RPA contents without encoding
    Analyze {
        /// Game directory containing .rpa files
        game_dir: PathBuf,
    },

    /// Show RPA header and index information
    Info {
        /// Path to .rpa file
        rpa_file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            game_dir,
            output,
            limit,
            quality,
            speed,
            workers,
        } => build(game_dir, output, limit, quality, speed, workers),
        Commands::Analyze { game_dir } => analyze(&game_dir),
        Commands::Info { rpa_file } => info(&rpa_file),
    }
}

fn build(
    game_dir: PathBuf,
    output: Option<PathBuf>,
    limit: usize,
    quality: u8,
    speed: u8,
    workers: usize,
) -> Result<()> {
    let output_dir =
        output.unwrap_or_else(|| PathBuf::from(format!("{}_compressed", game_dir.display())));

    let rpa_files = find_rpa_files(&game_dir)?;
    if rpa_files.is_empty() {
        bail!("no .rpa files found in {}", game_dir.display());
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::Relaxed) {
                eprintln!("still draining in-flight encodes...");
            } else {
                eprintln!("received Ctrl+C, finishing in-flight encodes and stopping");
            }
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let encoder = Av1Encoder::probe(EncoderConfig {
        quality: quality.clamp(1, 63),
        speed: speed.min(10),
    });
    match encoder.avis_backend() {
        Some(backend) => println!("AV1 sequence backend: {backend}"),
        None => println!("No AV1 sequence backend; sequences will be encoded as single images"),
    }

    let builder = Builder::new(
        encoder,
        BuildOptions {
            limit,
            workers,
            ..BuildOptions::default()
        },
    );

    let out_game_dir = output_dir.join("game");
    for rpa_path in &rpa_files {
        let name = rpa_path
            .file_name()
            .context("rpa path has no file name")?;
        println!("\n=== Processing {} ===", name.to_string_lossy());

        let out_path = out_game_dir.join(name);
        let started = Instant::now();
        let mut sink = ConsoleSink::new();

        match builder.build(rpa_path, &out_path, &mut sink, &stop) {
            Ok(report) => {
                let elapsed = started.elapsed().as_secs_f64();
                if report.original_bytes > 0 {
                    let ratio =
                        report.original_bytes as f64 / report.compressed_bytes.max(1) as f64;
                    println!(
                        "\n  Images: {:.1} MB -> {:.1} MB ({ratio:.1}x)",
                        mib(report.original_bytes),
                        mib(report.compressed_bytes),
                    );
                }
                println!(
                    "  Entries: {} ({} images), sequences: {}, scatter AVIF: {}, copied: {}",
                    report.entries,
                    report.images,
                    report.sequences_written,
                    report.avif_written,
                    report.copied,
                );
                println!("  Output: {}", out_path.display());
                println!("  Time: {}", format_duration(elapsed));
            }
            Err(renpak_build::Error::Cancelled) => {
                eprintln!("build cancelled; partial output removed");
                std::process::exit(130);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to build {}", rpa_path.display()));
            }
        }
    }

    Ok(())
}

fn analyze(game_dir: &Path) -> Result<()> {
    let rpa_files = find_rpa_files(game_dir)?;
    if rpa_files.is_empty() {
        bail!("no .rpa files found in {}", game_dir.display());
    }

    for rpa_path in rpa_files {
        let size = std::fs::metadata(&rpa_path)
            .with_context(|| format!("failed to stat {}", rpa_path.display()))?
            .len();
        println!(
            "\n=== {} ({:.1} MB) ===",
            rpa_path.file_name().unwrap_or_default().to_string_lossy(),
            mib(size)
        );

        let mut reader = RpaReader::open(&rpa_path)
            .with_context(|| format!("failed to open {}", rpa_path.display()))?;
        let index = reader.read_index().context("failed to read index")?;

        // Per-extension counts with one example name each
        let mut by_ext: BTreeMap<String, (usize, String)> = BTreeMap::new();
        let mut names: Vec<&str> = index.names().collect();
        names.sort();
        for name in names {
            let ext = extension_of(name);
            let slot = by_ext.entry(ext).or_insert_with(|| (0, name.to_string()));
            slot.0 += 1;
        }

        println!("  Total entries: {}", index.len());
        println!("  {:<12} {:>8}  Examples", "Extension", "Count");
        println!("  {:-<12} {:-<8}  {:-<40}", "", "", "");
        let mut rows: Vec<(&String, &(usize, String))> = by_ext.iter().collect();
        rows.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(b.0)));
        for (ext, (count, example)) in rows {
            println!("  {ext:<12} {count:>8}  {example}");
        }
    }

    Ok(())
}

fn info(rpa_file: &Path) -> Result<()> {
    let size = std::fs::metadata(rpa_file)
        .with_context(|| format!("failed to stat {}", rpa_file.display()))?
        .len();
    println!(
        "=== {} ===",
        rpa_file.file_name().unwrap_or_default().to_string_lossy()
    );
    println!("Size: {:.1} MB", mib(size));

    let mut reader = RpaReader::open(rpa_file)
        .with_context(|| format!("failed to open {}", rpa_file.display()))?;
    println!("Index offset: {:#x}", reader.index_offset());
    println!("Key: {:08x}", reader.key());

    let index = reader.read_index().context("failed to read index")?;
    println!("Entries: {}", index.len());

    println!("\n{:<60} {:>12} {:>12}", "Name", "Offset", "Length");
    println!("{:-<60} {:-<12} {:-<12}", "", "", "");
    let mut names: Vec<&str> = index.names().collect();
    names.sort();
    for name in names.iter().take(50) {
        if let Some(entry) = index.get(name) {
            println!("{:<60} {:>12} {:>12}", entry.name, entry.offset, entry.length);
        }
    }
    if names.len() > 50 {
        println!("  ... and {} more entries", names.len() - 50);
    }

    Ok(())
}

/// Collects `*.rpa` files from `dir`, falling back to `dir/game`.
fn find_rpa_files(dir: &Path) -> Result<Vec<PathBuf>> {
    for candidate in [dir.to_path_buf(), dir.join("game")] {
        if !candidate.is_dir() {
            continue;
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&candidate)
            .with_context(|| format!("failed to read {}", candidate.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("rpa"))
            })
            .collect();
        files.sort();
        if !files.is_empty() {
            return Ok(files);
        }
    }
    Ok(Vec::new())
}

fn extension_of(name: &str) -> String {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rfind('.') {
        Some(dot) if dot > 0 => file[dot..].to_lowercase(),
        _ => "(no ext)".to_string(),
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

/// Renders build progress with elapsed time and a per-phase ETA.
struct ConsoleSink {
    start: Instant,
    phase_start: Instant,
}

impl ConsoleSink {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            phase_start: now,
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn event(&mut self, event: &ProgressEvent) {
        let elapsed = self.start.elapsed().as_secs_f64();
        match event {
            ProgressEvent::PhaseStart { phase } => {
                self.phase_start = Instant::now();
                println!("[{elapsed:7.1}s] === {phase} ===");
            }
            ProgressEvent::TaskDone {
                done,
                total,
                original_bytes,
                compressed_bytes,
                message,
            } => {
                let percent = if *total > 0 {
                    *done as f64 / *total as f64 * 100.0
                } else {
                    100.0
                };
                let phase_elapsed = self.phase_start.elapsed().as_secs_f64();
                let eta = if *done > 0 && done < total {
                    let rate = *done as f64 / phase_elapsed.max(0.001);
                    format!(" - ETA {}", format_duration((*total - *done) as f64 / rate))
                } else {
                    String::new()
                };
                println!(
                    "  [{elapsed:7.1}s] {done}/{total} ({percent:.0}%) {:.1}MB->{:.1}MB{eta}  {message}",
                    mib(*original_bytes),
                    mib(*compressed_bytes),
                );
            }
            ProgressEvent::PhaseEnd { phase } => {
                println!("[{elapsed:7.1}s] === {phase} done ===");
            }
            ProgressEvent::Warning { message } => {
                eprintln!("  [{elapsed:7.1}s] WARNING: {message}");
            }
        }
    }
}

/// Formats seconds into a human-readable duration string.
fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor() as u64;
        format!("{}m {:.0}s", mins, secs - (mins as f64 * 60.0))
    } else {
        let hours = (secs / 3600.0).floor() as u64;
        let remaining = secs - (hours as f64 * 3600.0);
        let mins = (remaining / 60.0).floor() as u64;
        format!("{}h {}m {:.0}s", hours, mins, remaining - (mins as f64 * 60.0))
    }
}
