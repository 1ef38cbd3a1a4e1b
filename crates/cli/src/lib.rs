use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ember_core::{RegionManager, RuntimeConfig};
use std::fmt::Write;
use std::path::PathBuf;
use tracing::{info, warn};

pub mod tracing_config;

use crate::tracing_config::{OperationContext, TracingConfig};

const DEFAULT_REGION_SIZE: &str = "64M";

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage persistent memory regions", long_about = None)]
pub struct Args {
    /// Directory holding region files and the region table
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Use JSON format for logs
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a region
    Create {
        name: String,
        /// Region size in bytes; K, M and G suffixes are accepted
        #[arg(long, default_value = DEFAULT_REGION_SIZE, value_parser = parse_size)]
        size: u64,
    },
    /// List the regions in the directory
    List,
    /// Print a region's header without opening it
    Inspect { name: String },
    /// Open a region, recovering it if it was not closed cleanly, and close it
    Recover { name: String },
    /// Check a region's heap and free lists
    Audit { name: String },
    /// Delete a region and its file
    Remove { name: String },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::List => "list",
            Command::Inspect { .. } => "inspect",
            Command::Recover { .. } => "recover",
            Command::Audit { .. } => "audit",
            Command::Remove { .. } => "remove",
        }
    }

    fn region(&self) -> Option<&str> {
        match self {
            Command::Create { name, .. }
            | Command::Inspect { name }
            | Command::Recover { name }
            | Command::Audit { name }
            | Command::Remove { name } => Some(name.as_str()),
            Command::List => None,
        }
    }
}

/// Parse `4096`, `64K`, `16M` or `1G`
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 10),
        Some('M') => (&s[..s.len() - 1], 20),
        Some('G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", s))?;
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Build the runtime configuration from the file, environment and flags
pub fn load_config(args: &Args) -> Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => RuntimeConfig::default().with_env_overrides()?,
    };
    if let Some(dir) = &args.dir {
        config.dir = dir.clone();
    }
    Ok(config)
}

pub fn run() -> Result<()> {
    let args = Args::parse();

    TracingConfig {
        level: TracingConfig::parse_level(&args.log_level),
        json_format: args.log_json,
        ..TracingConfig::default()
    }
    .init();

    let config = load_config(&args)?;
    let output = execute(config, args.command)?;
    print!("{}", output);
    Ok(())
}

/// Run one command and return what it prints
pub fn execute(config: RuntimeConfig, command: Command) -> Result<String> {
    let mut ctx = OperationContext::new().with_command(command.name());
    if let Some(region) = command.region() {
        ctx = ctx.with_region(region);
    }
    let span = ctx.span();
    let _guard = span.enter();

    let dir = config.dir.clone();
    let manager = RegionManager::new(config)
        .with_context(|| format!("opening region directory {}", dir.display()))?;
    let mut out = String::new();

    match command {
        Command::Create { name, size } => {
            let region = manager.create_region(&name, size)?;
            let geometry = region.geometry();
            manager.close_region(region.id())?;
            writeln!(
                out,
                "Created region {} (id {}): {} bytes, heap {} bytes, {} lanes of {} bytes",
                name,
                region.id(),
                size,
                geometry.heap_size,
                geometry.lane_count,
                geometry.lane_size
            )?;
        }
        Command::List => {
            let regions = manager.list_regions();
            if regions.is_empty() {
                writeln!(out, "No regions in {}", dir.display())?;
            }
            for info in regions {
                writeln!(
                    out,
                    "{:>4}  {:<24} {:>12}  {}  {}",
                    info.id,
                    info.name,
                    info.size,
                    info.uuid,
                    info.path.display()
                )?;
            }
        }
        Command::Inspect { name } => {
            let summary = manager.inspect_region(&name)?;
            let g = summary.geometry;
            writeln!(out, "region:      {} (id {})", summary.info.name, summary.info.id)?;
            writeln!(out, "file:        {}", summary.info.path.display())?;
            writeln!(out, "uuid:        {}", summary.info.uuid)?;
            writeln!(out, "size:        {}", g.size)?;
            writeln!(
                out,
                "log:         {} lanes of {} bytes at {:#x}",
                g.lane_count, g.lane_size, g.log_offset
            )?;
            writeln!(out, "heap:        {} bytes at {:#x}", g.heap_size, g.heap_offset)?;
            writeln!(out, "clean:       {}", summary.clean)?;
            writeln!(out, "session:     {}", summary.session)?;
            writeln!(out, "root:        {:#x}", summary.root)?;
        }
        Command::Recover { name } => {
            let region = manager.open_region(&name)?;
            match region.stats().last_recovery {
                Some(report) => writeln!(out, "{}", report.summary())?,
                None => writeln!(out, "Region {} was closed cleanly, nothing to recover", name)?,
            }
            manager.close_region(region.id())?;
            info!("Region {} is clean", name);
        }
        Command::Audit { name } => {
            let region = manager.open_region(&name)?;
            let audit = region.audit();
            manager.close_region(region.id())?;
            let audit = audit?;
            writeln!(out, "heap:        {} bytes", audit.heap_bytes)?;
            writeln!(
                out,
                "allocated:   {} bytes in {} blocks",
                audit.allocated_bytes, audit.allocated_blocks
            )?;
            writeln!(
                out,
                "free:        {} bytes in {} blocks ({} listed)",
                audit.free_bytes, audit.free_blocks, audit.free_listed_blocks
            )?;
            writeln!(out, "unformatted: {} bytes", audit.unformatted_bytes)?;
            writeln!(out, "consistent:  {}", audit.consistent)?;
            if !audit.consistent {
                warn!("Region {} failed its heap audit", name);
                bail!("free lists of region {} are inconsistent", name);
            }
        }
        Command::Remove { name } => {
            manager.remove_region(&name)?;
            writeln!(out, "Removed region {}", name)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> RuntimeConfig {
        RuntimeConfig::with_dir(dir)
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64K"), Ok(64 << 10));
        assert_eq!(parse_size("16m"), Ok(16 << 20));
        assert_eq!(parse_size("1G"), Ok(1 << 30));
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999G").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "ember", "--dir", "/tmp/r", "create", "notes", "--size", "2M",
        ])
        .unwrap();
        assert_eq!(args.dir, Some(PathBuf::from("/tmp/r")));
        match args.command {
            Command::Create { name, size } => {
                assert_eq!(name, "notes");
                assert_eq!(size, 2 << 20);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_region_lifecycle() -> Result<()> {
        let dir = tempdir()?;
        let out = execute(
            config(dir.path()),
            Command::Create {
                name: "notes".into(),
                size: 1 << 20,
            },
        )?;
        assert!(out.starts_with("Created region notes (id 1)"));

        let out = execute(config(dir.path()), Command::List)?;
        assert!(out.contains("notes"));

        let out = execute(config(dir.path()), Command::Inspect { name: "notes".into() })?;
        assert!(out.contains("clean:       true"));

        let out = execute(config(dir.path()), Command::Recover { name: "notes".into() })?;
        assert!(out.contains("nothing to recover"));

        let out = execute(config(dir.path()), Command::Audit { name: "notes".into() })?;
        assert!(out.contains("consistent:  true"));

        execute(config(dir.path()), Command::Remove { name: "notes".into() })?;
        let out = execute(config(dir.path()), Command::List)?;
        assert!(out.starts_with("No regions"));
        Ok(())
    }

    #[test]
    fn test_recover_after_unclean_shutdown() -> Result<()> {
        let dir = tempdir()?;
        {
            let manager = RegionManager::new(config(dir.path()))?;
            let region = manager.create_region("r", 1 << 20)?;
            region.allocate(128)?;
            // dropped without close_region
        }
        let out = execute(config(dir.path()), Command::Recover { name: "r".into() })?;
        assert!(out.starts_with("Recovery:"));

        let out = execute(config(dir.path()), Command::Inspect { name: "r".into() })?;
        assert!(out.contains("clean:       true"));
        Ok(())
    }

    #[test]
    fn test_missing_region() -> Result<()> {
        let dir = tempdir()?;
        assert!(execute(config(dir.path()), Command::Audit { name: "nope".into() }).is_err());
        Ok(())
    }
}
