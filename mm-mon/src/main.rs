//! Command-line front end for the Malloc Monitor offline analysis engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use mm_core::{NoopProgress, Op, ProgressSink, Trace, TraceOptions};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod verify;

#[derive(Parser)]
#[command(name = "mm-mon", about = "Offline analysis of Malloc Monitor capture files")]
struct Args {
    /// Path to a Malloc Monitor capture file.
    path: PathBuf,

    /// Suppress the progress bar (useful when piping output, or in CI).
    #[arg(long, global = true)]
    no_progress: bool,

    /// Operations between automatic snapshots. Lower values trade memory
    /// and open-time for faster random-access seeks.
    #[arg(long, global = true, default_value_t = mm_core::SNAPSHOT_THRESHOLD)]
    snapshot_threshold: usize,

    /// Reject any callstack claiming at least this many frames.
    #[arg(long, global = true, default_value_t = mm_core::DEFAULT_FRAME_CAP)]
    frame_cap: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print header metadata and high-level trace statistics.
    Summary,
    /// List every distinct interned callstack, one per line, in hex.
    Callstacks,
    /// Print the live-allocation set at a given operation index.
    Snapshot {
        /// Operation index to seek to (clamped to the last operation).
        index: usize,
    },
    /// Check that replaying from any snapshot agrees with a full replay
    /// from index 0 (Testable Property 6).
    Verify,
}

/// Bridges `indicatif`'s progress bar to [`mm_core::ProgressSink`].
struct IndicatifProgress(ProgressBar);

impl ProgressSink for IndicatifProgress {
    fn update(&mut self, status: &str, percent: u8) {
        self.0.set_position(percent as u64);
        self.0.set_message(status.to_string());
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()
                .context("parsing RUST_LOG")?,
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!(path = %args.path.display(), "opening capture file");

    let options = TraceOptions {
        frame_cap: args.frame_cap,
        snapshot_threshold: args.snapshot_threshold,
    };

    let mut trace = if args.no_progress {
        Trace::open_with_options(&args.path, NoopProgress, options)
            .with_context(|| format!("opening {}", args.path.display()))?
    } else {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40}] {pos}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        let trace = Trace::open_with_options(&args.path, IndicatifProgress(bar.clone()), options)
            .with_context(|| format!("opening {}", args.path.display()))?;
        bar.finish_and_clear();
        trace
    };

    match args.command {
        Command::Summary => print_summary(&trace),
        Command::Callstacks => print_callstacks(&trace),
        Command::Snapshot { index } => print_snapshot(&mut trace, index),
        Command::Verify => verify::run(trace),
    }
}

fn print_summary(trace: &Trace) -> Result<()> {
    let header = trace.header();
    println!("id:              {}", header.id());
    println!("binary:          {}", header.binary_path());
    println!("pid:             {}", header.process_id());
    println!("format version:  {}", header.format_version());
    println!(
        "byte order:      {}",
        if header.producer_is_bigendian() { "big-endian" } else { "little-endian" }
    );
    println!("pointer width:   {} bytes", header.pointer_width());
    println!("operations:      {}", trace.operation_count());

    let trie = trace.trie();
    let total = trie.total_frames();
    let unique = trie.unique_frames();
    let ratio = if total == 0 { 0.0 } else { 100.0 * (1.0 - unique as f64 / total as f64) };
    println!("total frames:    {total}");
    println!("unique frames:   {unique}");
    println!("sharing ratio:   {ratio:.1}% of interned frames were shared with an existing node");

    let mut counts = std::collections::BTreeMap::new();
    for i in 0..trace.operation_count() {
        *counts.entry(operation_kind(trace.operation(i))).or_insert(0usize) += 1;
    }
    for (kind, count) in counts {
        println!("  {kind:<10} {count}");
    }

    let stats = trace.bucket_stats();
    let empty_buckets = stats.bucket_count - stats.occupied_buckets;
    println!("live allocations: {}", stats.live_count);
    println!(
        "bucket occupancy:  {} / {} buckets used, empty buckets: {}, longest chain: {}",
        stats.occupied_buckets, stats.bucket_count, empty_buckets, stats.max_chain_len
    );

    Ok(())
}

fn print_callstacks(trace: &Trace) -> Result<()> {
    use std::collections::BTreeSet;

    let mut seen = BTreeSet::new();
    for i in 0..trace.operation_count() {
        let id = trace.callstack_for(i);
        if !seen.insert(id) {
            continue;
        }
        let depth = trace.trie().depth(id);
        let mut frames = vec![0u64; depth];
        trace.reify_callstack(i, &mut frames);
        let rendered: Vec<String> = frames.iter().map(|f| format!("{f:#x}")).collect();
        println!("{}", rendered.join(" "));
    }
    Ok(())
}

fn print_snapshot(trace: &mut Trace, index: usize) -> Result<()> {
    let entries = trace.snapshot_at(index);
    for e in entries {
        println!("{:#018x} {}", e.ptr, e.size);
    }
    Ok(())
}

fn operation_kind(op: Op) -> &'static str {
    match op {
        Op::Malloc { .. } => "malloc",
        Op::Realloc { .. } => "realloc",
        Op::Memalign { .. } => "memalign",
        Op::Free { .. } => "free",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_kind_names_every_variant() {
        assert_eq!(operation_kind(Op::Malloc { timestamp: 0, size: 0, result: 0 }), "malloc");
        assert_eq!(operation_kind(Op::Free { timestamp: 0, ptr: 0 }), "free");
    }
}
