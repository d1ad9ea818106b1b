mod cli;

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use owo_colors::OwoColorize;

use cli::{Cli, Command};
use ptrscan::{
    DumpOptions, PointerIndex, PtrWidth, ScanControl, ScanOutcome, ScanParams, default_scan_path,
};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Dump { pid, out, all, width } => {
            let width = PtrWidth::from_bytes(width)
                .ok_or_else(|| anyhow::anyhow!("pointer width must be 4 or 8"))?;
            let out = out.unwrap_or_else(|| PathBuf::from(format!("{pid}.ptrmap")));
            let opts = DumpOptions { width, align_only: !all };
            run_dump(pid, &out, &opts)
        }
        Command::Modules { map } => {
            let index = PointerIndex::load(&map)?;
            // Group by path: one module may span several regions.
            let mut modules: BTreeMap<&str, (u64, usize)> = BTreeMap::new();
            for region in index.regions() {
                let entry = modules.entry(region.path.as_str()).or_insert((region.start, 0));
                entry.1 += 1;
            }
            for (path, (base, regions)) in modules {
                println!(
                    "{:016x}  {} {}",
                    base,
                    path.bright_green(),
                    format!("({regions} regions)").bright_black()
                );
            }
            println!(
                "{} {} regions, {} pairs",
                "[info]".bright_cyan(),
                index.regions().len(),
                index.pair_count()
            );
            Ok(())
        }
        Command::Scan { map, target, anchors, depth, node, ahead, behind, threads, out, eager } => {
            println!("{} loading pointer map {}", "[info]".bright_cyan(), map.display());
            let index = if eager { PointerIndex::load_eager(&map)? } else { PointerIndex::load(&map)? };
            println!(
                "{} {} regions, {} pairs, {}-bit",
                "[info]".bright_cyan(),
                index.regions().len(),
                index.pair_count(),
                index.width().bytes() * 8
            );

            let params = ScanParams {
                target,
                depth,
                min_len: node,
                range_ahead: ahead,
                range_behind: behind,
                anchors,
                threads,
            };
            let out = default_scan_path(&out.unwrap_or_else(|| format!("{target:x}")));
            println!(
                "{} searching for {:#x}, depth {}..{}, window +{:#x}/-{:#x}",
                "[info]".bright_cyan(),
                target,
                node,
                depth,
                ahead,
                behind
            );

            let ctl = ScanControl::new();
            let stats = ptrscan::scan_to_file(&index, &params, &out, &ctl)?;
            match stats.outcome {
                ScanOutcome::Completed => println!(
                    "{} {} chains -> {}",
                    "[done]".bright_cyan(),
                    stats.chains.bright_green(),
                    out.display()
                ),
                ScanOutcome::Cancelled => println!(
                    "{} cancelled after {} chains -> {}",
                    "[warn]".yellow(),
                    stats.chains,
                    out.display()
                ),
            }
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
fn run_dump(pid: i32, out: &std::path::Path, opts: &DumpOptions) -> anyhow::Result<()> {
    use ptrscan::{ProcReader, dump_to_file};

    println!("{} attaching to pid {}", "[info]".bright_cyan(), pid);
    let reader = ProcReader::attach(pid)?;
    let stats = dump_to_file(&reader, opts, out)?;
    println!(
        "{} scanned {} regions (~{} KiB), {} pairs -> {}{}",
        "[done]".bright_cyan(),
        stats.regions_scanned,
        stats.bytes_scanned / 1024,
        stats.pairs.bright_green(),
        out.display(),
        if stats.regions_skipped > 0 {
            format!(" ({} regions skipped)", stats.regions_skipped)
        } else {
            String::new()
        }
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_dump(_pid: i32, _out: &std::path::Path, _opts: &DumpOptions) -> anyhow::Result<()> {
    anyhow::bail!("process dumping is only supported on Linux; scan works on any host")
}
