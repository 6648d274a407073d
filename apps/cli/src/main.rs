use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use usbpos_core::{
    ChannelObserver, DeviceLocator, Job, JobEncoder, NusbBackend, PRINTER_CLASS, PrintService,
    PrinterConfig, PrinterEvent, TracingObserver,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB receipt printer tool (Pure Rust)", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Vendor id in hex, overrides the config file
    #[arg(long, global = true, value_parser = parse_hex)]
    vid: Option<u16>,

    /// Product id in hex, overrides the config file
    #[arg(long, global = true, value_parser = parse_hex)]
    pid: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached USB devices
    List {
        /// Include devices without a printer interface
        #[arg(long)]
        all: bool,
    },
    /// Print one text job and wait for it
    Print {
        /// Text to print; words are joined with spaces
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Print every line read from stdin until EOF
    Serve,
    /// Write a config file with default values
    InitConfig {
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_hex(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{s}': {e}"))
}

fn load_config(args: &Args) -> Result<PrinterConfig> {
    let mut config = match &args.config {
        Some(path) => PrinterConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PrinterConfig::default(),
    };
    if args.vid.is_some() {
        config.vendor_id = args.vid;
    }
    if args.pid.is_some() {
        config.product_id = args.pid;
    }
    Ok(config)
}

fn list(all: bool) -> Result<()> {
    let locator = DeviceLocator::new(Arc::new(NusbBackend));
    let devices = if all {
        locator.list_all()?
    } else {
        locator.find_candidates()?
    };

    if devices.is_empty() {
        info!("No devices found");
        return Ok(());
    }
    for device in devices {
        let classes: Vec<String> = device
            .interfaces
            .iter()
            .map(|i| {
                let marker = if i.class == PRINTER_CLASS { "*" } else { "" };
                format!("{}:{:02x}{marker}", i.number, i.class)
            })
            .collect();
        println!("{device}  interfaces [{}]", classes.join(" "));
    }
    Ok(())
}

fn print(config: &PrinterConfig, text: String) -> Result<()> {
    let service = PrintService::start(
        config,
        Arc::new(NusbBackend),
        JobEncoder::default(),
        Arc::new(TracingObserver),
    )?;
    let (tx, events) = mpsc::channel();
    service.connection().subscribe(Arc::new(ChannelObserver::new(tx)));

    let id = service.enqueue(Job::Text(text))?;
    service.drain()?;

    let failure = events.try_iter().find_map(|event| match event {
        PrinterEvent::JobFailed { id: failed, error } if failed == id => Some(error),
        _ => None,
    });
    if let Some(error) = failure {
        bail!("{id} failed: {error}");
    }
    Ok(())
}

fn serve(config: &PrinterConfig) -> Result<()> {
    let service = PrintService::start(
        config,
        Arc::new(NusbBackend),
        JobEncoder::default(),
        Arc::new(TracingObserver),
    )?;
    info!("Reading jobs from stdin, one per line");

    for line in std::io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = service.enqueue(Job::Text(line)) {
            warn!(error = %e, "Job rejected");
        }
    }

    info!(pending = service.queue().len(), "EOF, draining queue");
    service.drain()
}

fn init_config(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    PrinterConfig::default().save_to_file(&path)?;
    info!(path = %path.display(), "Config written");
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    match args.command {
        Command::List { all } => list(all),
        Command::Print { text } => print(&config, text.join(" ")),
        Command::Serve => serve(&config),
        Command::InitConfig { path, force } => init_config(path, force),
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x0493"), Ok(0x0493));
        assert_eq!(parse_hex("8760"), Ok(0x8760));
        assert!(parse_hex("xyz").is_err());
        assert!(parse_hex("10000").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from(["usbpos", "--vid", "0493", "--pid", "0x8760", "serve"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.vendor_id, Some(0x0493));
        assert_eq!(config.product_id, Some(0x8760));
    }

    #[test]
    fn test_print_joins_words() {
        let args = Args::parse_from(["usbpos", "print", "Hello", "World"]);
        match args.command {
            Command::Print { text } => assert_eq!(text.join(" "), "Hello World"),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
