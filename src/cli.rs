use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint, builder::styling::AnsiColor};

/// PtrScan – find pointer chains from stable module bases to a target address.
#[derive(Parser, Debug)]
#[command(
    name = "ptrscan",
    bin_name = "ptrscan",
    about = "A two-phase pointer-chain scanner: dump a process's pointer map, then search it",
    version,
    propagate_version = true,
    arg_required_else_help = true,
    styles = clap::builder::Styles::styled()
        .header(AnsiColor::BrightYellow.on_default())
        .usage(AnsiColor::BrightYellow.on_default())
        .literal(AnsiColor::BrightGreen.on_default())
        .placeholder(AnsiColor::BrightCyan.on_default())
)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Dump a process's pointer map to disk
    Dump {
        /// Target process id
        pid: i32,

        /// Output file (defaults to <pid>.ptrmap)
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        out: Option<PathBuf>,

        /// Scan every readable region for sources, not only data-like ones
        #[arg(long)]
        all: bool,

        /// Pointer width of the target process in bytes (4 or 8)
        #[arg(long, default_value_t = 8)]
        width: u8,
    },

    /// List the modules recorded in a pointer map
    Modules {
        /// Pointer map produced by `dump`
        map: PathBuf,
    },

    /// Search a pointer map for chains reaching a target address
    Scan {
        /// Pointer map produced by `dump`
        map: PathBuf,

        /// Target address, hex with 0x prefix or decimal
        #[arg(short, long, value_parser = parse_address)]
        target: u64,

        /// Anchor module path; repeat for several anchors
        #[arg(short, long = "anchor", required = true)]
        anchors: Vec<String>,

        /// Maximum chain depth
        #[arg(short, long, default_value_t = 7)]
        depth: u32,

        /// Minimum chain length worth reporting
        #[arg(short, long, default_value_t = 1)]
        node: u32,

        /// Positive per-step offset window
        #[arg(long, default_value = "0x600", value_parser = parse_address)]
        ahead: u64,

        /// Negative per-step offset window
        #[arg(long, default_value = "0", value_parser = parse_address)]
        behind: u64,

        /// Worker threads; 0 uses all cores, 1 gives deterministic order
        #[arg(long, default_value_t = 0)]
        threads: usize,

        /// Output name prefix (writes <prefix>.scandata; defaults to the
        /// target address in hex)
        #[arg(short, long)]
        out: Option<String>,

        /// Read the whole map into memory instead of memory-mapping it
        #[arg(long)]
        eager: bool,
    },
}

/// Parse `0x`-prefixed hex or plain decimal into a u64.
pub fn parse_address(s: &str) -> Result<u64, String> {
    let t = s.trim();
    match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => t.parse(),
    }
    .map_err(|e| format!("invalid address {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x3088").unwrap(), 0x3088);
        assert_eq!(parse_address("0XDEAD").unwrap(), 0xDEAD);
    }

    #[test]
    fn test_parse_address_decimal() {
        assert_eq!(parse_address("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("0xZZ").is_err());
        assert!(parse_address("banana").is_err());
    }
}
