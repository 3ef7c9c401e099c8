#![forbid(unsafe_code)]
//! `cascadeadm`: administration CLI for Cascade cache devices.
//!
//! Every command loads the cache instance from the image file, applies the
//! operation, and stops the instance again so the metadata region stays
//! authoritative between invocations. Core volumes are addressed by their
//! file path, which doubles as the persisted volume uuid.

use anyhow::{bail, Context, Result};
use cascade_block::{ByteDevice, FileByteDevice};
use cascade_engine::{Cache, FileVolumeOpener};
use cascade_stats::StatsFilter;
use cascade_types::{CacheMode, CleaningPolicy, CoreId, SeqCutOffConfig, SeqCutOffPolicy};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        print_usage();
        return Ok(());
    };

    match command {
        "start" => {
            let path = required(&args, 1, "start requires <cache-image>")?;
            let mode = flag_value(&args, "--mode").unwrap_or("wt");
            let mode: CacheMode = mode
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown cache mode: {mode}"))?;
            let force = args.iter().any(|a| a == "--force");
            start_cmd(Path::new(path), mode, force)
        }
        "add-core" => {
            let cache = required(&args, 1, "add-core requires <cache-image> <core-image>")?;
            let core = required(&args, 2, "add-core requires <cache-image> <core-image>")?;
            add_core_cmd(Path::new(cache), core)
        }
        "set-mode" => {
            let cache = required(&args, 1, "set-mode requires <cache-image> <mode>")?;
            let mode = required(&args, 2, "set-mode requires <cache-image> <mode>")?;
            let flush = !args.iter().any(|a| a == "--no-flush");
            with_cache(Path::new(cache), |instance| {
                instance.set_cache_mode_by_name(mode, flush)?;
                println!("cache mode set to {}", instance.get_cache_mode());
                Ok(())
            })
        }
        "set-cleaning" => {
            let cache = required(&args, 1, "set-cleaning requires <cache-image> <policy>")?;
            let policy = required(&args, 2, "set-cleaning requires <cache-image> <policy>")?;
            let policy: CleaningPolicy = policy
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown cleaning policy: {policy}"))?;
            with_cache(Path::new(cache), |instance| {
                instance.set_cleaning_policy(policy)?;
                println!("cleaning policy set to {policy}");
                Ok(())
            })
        }
        "set-seq-cutoff" => {
            let cache = required(&args, 1, "set-seq-cutoff requires <cache-image> <core-id>")?;
            let core_id: u32 = required(&args, 2, "set-seq-cutoff requires <cache-image> <core-id>")?
                .parse()
                .context("core id must be an integer")?;
            let policy = flag_value(&args, "--policy");
            let threshold = flag_value(&args, "--threshold");
            let promotion = flag_value(&args, "--promotion");
            with_cache(Path::new(cache), |instance| {
                let core = instance.core(CoreId(core_id))?;
                if let Some(policy) = policy {
                    let policy: SeqCutOffPolicy = policy
                        .parse()
                        .map_err(|_| anyhow::anyhow!("unknown seq-cutoff policy: {policy}"))?;
                    core.set_seq_cutoff_policy(policy)?;
                }
                if let Some(threshold) = threshold {
                    let threshold: u64 =
                        threshold.parse().context("threshold must be bytes")?;
                    core.set_seq_cutoff_threshold(threshold)?;
                }
                if let Some(promotion) = promotion {
                    let promotion: u32 =
                        promotion.parse().context("promotion count must be an integer")?;
                    core.set_seq_cutoff_promotion_count(promotion)?;
                }
                println!("{:?}", core.get_seq_cutoff_config());
                Ok(())
            })
        }
        "stats" => {
            let cache = required(&args, 1, "stats requires <cache-image>")?;
            let json = args.iter().any(|a| a == "--json");
            stats_cmd(Path::new(cache), json)
        }
        "inspect" => {
            let cache = required(&args, 1, "inspect requires <cache-image>")?;
            let json = args.iter().any(|a| a == "--json");
            inspect_cmd(Path::new(cache), json)
        }
        "flush" => {
            let cache = required(&args, 1, "flush requires <cache-image>")?;
            with_cache(Path::new(cache), |instance| {
                let cleaned = instance.flush_cache()?;
                println!("flushed {cleaned} dirty blocks");
                Ok(())
            })
        }
        "purge" => {
            let cache = required(&args, 1, "purge requires <cache-image>")?;
            with_cache(Path::new(cache), |instance| {
                instance.purge_cache()?;
                println!("cache purged");
                Ok(())
            })
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("cascadeadm\n");
    println!("USAGE:");
    println!("  cascadeadm start <cache-image> [--mode wt|wb|wa|wo|pt] [--force]");
    println!("  cascadeadm add-core <cache-image> <core-image>");
    println!("  cascadeadm set-mode <cache-image> <mode> [--no-flush]");
    println!("  cascadeadm set-cleaning <cache-image> <nop|alru|acp>");
    println!(
        "  cascadeadm set-seq-cutoff <cache-image> <core-id> [--policy P] [--threshold BYTES] [--promotion N]"
    );
    println!("  cascadeadm stats <cache-image> [--json]");
    println!("  cascadeadm inspect <cache-image> [--json]");
    println!("  cascadeadm flush <cache-image>");
    println!("  cascadeadm purge <cache-image>");
}

fn required<'a>(args: &'a [String], index: usize, message: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .filter(|a| !a.starts_with("--"))
        .with_context(|| message.to_owned())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn open_device(path: &Path) -> Result<Arc<dyn ByteDevice>> {
    let device = FileByteDevice::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(device))
}

fn load_cache(path: &Path) -> Result<Cache> {
    let device = open_device(path)?;
    Cache::load(device, &FileVolumeOpener)
        .with_context(|| format!("failed to load cache from {}", path.display()))
}

/// Load, run the operation, stop: every invocation leaves the on-device
/// metadata authoritative.
fn with_cache(path: &Path, op: impl FnOnce(&Cache) -> Result<()>) -> Result<()> {
    let instance = load_cache(path)?;
    let result = op(&instance);
    instance.stop().context("failed to stop cache")?;
    result
}

fn start_cmd(path: &Path, mode: CacheMode, force: bool) -> Result<()> {
    let device = open_device(path)?;
    let instance = Cache::start(device, mode, force)
        .with_context(|| format!("failed to start cache on {}", path.display()))?;
    instance.stop().context("failed to stop cache")?;
    println!("cache started on {} in {mode} mode", path.display());
    Ok(())
}

fn add_core_cmd(cache_path: &Path, core_path: &str) -> Result<()> {
    with_cache(cache_path, |instance| {
        let core_device = open_device(Path::new(core_path))?;
        let core = instance.add_core(core_path, core_device)?;
        println!("core {} added as {}", core_path, core.id());
        Ok(())
    })
}

fn stats_cmd(path: &Path, json: bool) -> Result<()> {
    let instance = load_cache(path)?;
    let stats = instance.get_statistics(&[StatsFilter::All]);
    instance.stop().context("failed to stop cache")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{stats}");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    cache_mode: CacheMode,
    cleaning_policy: CleaningPolicy,
    cache_line_size_bytes: u32,
    cores: Vec<InspectCore>,
}

#[derive(Debug, Serialize)]
struct InspectCore {
    id: u32,
    uuid: String,
    seq_cutoff: SeqCutOffConfig,
}

fn inspect_cmd(path: &Path, json: bool) -> Result<()> {
    let instance = load_cache(path)?;
    let config = instance.get_cache_config();
    let cores = instance
        .core_ids()
        .into_iter()
        .map(|id| {
            let core = instance.core(id)?;
            Ok(InspectCore {
                id: id.0,
                uuid: core.uuid().to_owned(),
                seq_cutoff: core.get_seq_cutoff_config(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    instance.stop().context("failed to stop cache")?;

    let output = InspectOutput {
        cache_mode: config.cache_mode,
        cleaning_policy: config.cleaning_policy,
        cache_line_size_bytes: config.cache_line_size.bytes(),
        cores,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Write Policy: {}", output.cache_mode);
        println!("Cleaning Policy: {}", output.cleaning_policy);
        println!("Cache line size: {} KiB", output.cache_line_size_bytes / 1024);
        for core in &output.cores {
            println!(
                "Core {}: {} (seq cutoff: {} / {} bytes / promotion {})",
                core.id,
                core.uuid,
                core.seq_cutoff.policy,
                core.seq_cutoff.threshold_bytes,
                core.seq_cutoff.promotion_count
            );
        }
    }
    Ok(())
}
