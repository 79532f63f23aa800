use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use mfdbg::engine::{ConnectionSource, RebootKind};
use mfdbg::symbols::{DirectorySymbols, NoSymbols, SymbolResolver};
use mfdbg::transport::TcpTransport;
use mfdbg::{Engine, EngineConfig, Process};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device address (host:port)
    #[arg(long, env = "MFDBG_TCP")]
    tcp: SocketAddr,

    /// Path to config file, `~/.config/mfdbg/config.toml` by default
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory with `<assembly>.sym.json` symbol maps
    #[arg(long)]
    symbols: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Ping device
    Ping,
    /// Print device capabilities
    Caps,
    /// List threads of the running program
    Threads,
    /// List loaded assemblies
    Assemblies,
    /// List app-domains
    Appdomains,
    /// Reboot device
    Reboot {
        /// Restart CLR only
        #[arg(long)]
        clr_only: bool,
        /// Wait until device reaches initialize state
        #[arg(long)]
        wait: bool,
    },
    /// Write deployment image into device storage
    Deploy { image: PathBuf },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref());
    let engine = Engine::new(Box::new(TcpTransport::new(args.tcp)), config);
    engine.start().context("start engine")?;

    let result = run(&engine, &args);
    engine.stop()?;
    engine.dispose()?;
    result
}

fn connect(engine: &Engine) -> anyhow::Result<ConnectionSource> {
    let config = engine.config();
    if !engine.connect(config.retries, config.timeout_ms, false, None)? {
        bail!("device {} does not answer", engine.name());
    }
    engine
        .connection()
        .source
        .context("connection lost right after ping")
}

fn run(engine: &Engine, args: &Args) -> anyhow::Result<()> {
    match &args.command {
        Cmd::Ping => {
            let source = connect(engine)?;
            let connection = engine.connection();
            println!("{source} ({:?}, {:?})", connection.flags, connection.endian);
        }
        Cmd::Caps => {
            connect(engine)?;
            let Some(caps) = engine.capabilities() else {
                bail!("device is not running CLR");
            };
            println!("flags: {:?}", caps.flags);
            if let Some(clr) = caps.clr {
                println!("clr: {}, target framework: {}", clr.clr_version, clr.target_framework);
            }
            if let Some(hal) = caps.hal {
                println!("hal: {} {}", hal.vendor, hal.version);
            }
            if let Some(solution) = caps.solution {
                println!("solution: {} {}", solution.vendor, solution.version);
            }
        }
        Cmd::Threads | Cmd::Assemblies | Cmd::Appdomains => {
            let symbols: Arc<dyn SymbolResolver> = match &args.symbols {
                Some(dir) => Arc::new(DirectorySymbols::new(dir)),
                None => Arc::new(NoSymbols),
            };
            let process = Process::attach(engine, symbols)?;
            match args.command {
                Cmd::Threads => {
                    for pid in process.threads() {
                        println!("{pid}");
                    }
                }
                Cmd::Assemblies => {
                    for (idx, name, version) in process.assemblies() {
                        println!("{idx:>4} {name} {version}");
                    }
                }
                _ => {
                    for domain in process.app_domains() {
                        println!("{:>4} {} ({} assemblies)", domain.id, domain.name, domain.assemblies.len());
                    }
                }
            }
            process.detach()?;
        }
        Cmd::Reboot { clr_only, wait } => {
            connect(engine)?;
            let kind = if *clr_only {
                RebootKind::ClrOnly
            } else {
                RebootKind::Hard
            };
            engine.reboot(kind, *wait)?;
            info!("device is back");
        }
        Cmd::Deploy { image } => {
            let data = std::fs::read(image).with_context(|| format!("read {}", image.display()))?;
            connect(engine)?;
            let report = engine.deploy(&data)?;
            println!(
                "{} bytes written, {} sectors erased, {} skipped{}",
                report.bytes_written,
                report.sectors_erased,
                report.sectors_skipped,
                if report.incremental { " (incremental)" } else { "" }
            );
        }
    }
    Ok(())
}
