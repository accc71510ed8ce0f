//! `troll` - command line front end for Black Magic Probe and Blackstrike targets.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::path::{Path, PathBuf};
use troll_core::{
    BreakpointManager, CorefileTarget, DebugManager, FlashManager, FlashProgress, FlashingProgress, ProbeConfig,
    ProbeType, Target,
};

#[derive(Parser)]
#[command(name = "troll", author, version, about, long_about = None)]
struct Cli {
    /// Serial port of the probe (default: first probe found)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Probe firmware; required to pick the protocol when --port is given
    #[arg(long, value_enum, global = true)]
    probe: Option<ProbeKind>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the memory read chunk size
    #[arg(long, global = true)]
    read_chunk: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProbeKind {
    Blackmagic,
    Blackstrike,
}

impl From<ProbeKind> for ProbeType {
    fn from(kind: ProbeKind) -> Self {
        match kind {
            ProbeKind::Blackmagic => Self::Blackmagic,
            ProbeKind::Blackstrike => Self::Blackstrike,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List connected probes
    List,
    /// Connect and print the target memory map
    Info,
    /// Read registers
    Regs {
        #[arg(short, long)]
        num: Option<u32>,
    },
    /// Read memory
    Read {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        length: u32,
    },
    /// Halt the core
    Halt,
    /// Resume the core
    Resume {
        /// Block until the target halts again
        #[arg(long)]
        wait: bool,
    },
    /// Step one instruction
    Step,
    /// Reset the target
    Reset,
    /// Set a hardware breakpoint
    Break {
        #[arg(value_parser = parse_number)]
        address: u32,
    },
    /// Clear a hardware breakpoint
    Clear {
        #[arg(value_parser = parse_number)]
        address: u32,
    },
    /// Program a raw binary into flash
    Flash {
        file: PathBuf,
        #[arg(short, long, value_parser = parse_number, default_value = "0x08000000")]
        address: u32,
    },
    /// Inspect a corefile made of ROM, RAM and register dumps
    Core {
        rom: PathBuf,
        ram: PathBuf,
        regs: PathBuf,
        #[command(subcommand)]
        action: CoreAction,
    },
}

#[derive(Subcommand)]
enum CoreAction {
    /// Print the saved registers
    Regs,
    /// Read saved memory
    Read {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        length: u32,
    },
}

fn parse_number(s: &str) -> Result<u32, String> {
    parse_int::parse::<u32>(s).map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn load_config(cli: &Cli) -> Result<ProbeConfig> {
    let mut config = match &cli.config {
        Some(path) => ProbeConfig::load(path)?,
        None => ProbeConfig::default(),
    };
    if let Some(chunk) = cli.read_chunk {
        config.packets.memory_read_chunk = chunk;
    }
    Ok(config)
}

#[cfg(feature = "hardware")]
fn open_target(cli: &Cli, config: ProbeConfig) -> Result<Box<dyn Target>> {
    use troll_core::{Diagnostics, ProbeManager, SerialTransport};

    let manager = ProbeManager::new(config, Diagnostics::default());
    if let Some(port) = &cli.port {
        let probe_type = cli.probe.map_or(ProbeType::Blackmagic, ProbeType::from);
        let transport = SerialTransport::open(port, 115_200, &config.timeouts, &Diagnostics::default())
            .with_context(|| format!("Failed to open {port}"))?;
        return manager.attach(probe_type, Box::new(transport));
    }
    let wanted = cli.probe.map(ProbeType::from);
    let info = manager
        .list_probes()?
        .into_iter()
        .find(|info| wanted.map_or(true, |t| t == info.probe_type))
        .context("No debug probes found")?;
    info!("Using {}", info.name());
    manager.open(&info)
}

#[cfg(not(feature = "hardware"))]
fn open_target(_cli: &Cli, _config: ProbeConfig) -> Result<Box<dyn Target>> {
    bail!("built without serial port support; only `core` is available")
}

fn print_memory(target: &mut dyn Target, address: u32, length: u32) -> Result<()> {
    let data = target
        .read_bytes(address, length as usize, false)?
        .with_context(|| format!("Failed to read {length} bytes at 0x{address:08X}"))?;
    for (i, row) in data.chunks(16).enumerate() {
        println!("0x{:08X}: {}", address as usize + i * 16, hex::encode(row));
    }
    Ok(())
}

fn print_registers(debug: &DebugManager, target: &mut dyn Target, num: Option<u32>) -> Result<()> {
    if let Some(n) = num {
        println!("R{}: 0x{:08X}", n, debug.read_core_reg(target, n)?);
    } else {
        for (i, value) in debug.read_core_regs(target)?.iter().enumerate() {
            println!("R{i}: 0x{value:08X}");
        }
    }
    Ok(())
}

fn flash(target: &mut dyn Target, file: &Path, address: u32) -> Result<()> {
    let mut total = 0u32;
    let mut done = 0u32;
    let mut progress = FlashProgress::new(move |event| match event {
        FlashingProgress::Erasing { address, size } => println!("Erasing 0x{size:X} bytes at 0x{address:08X}"),
        FlashingProgress::Programming { total: bytes } => {
            total = bytes;
            println!("Programming 0x{bytes:X} bytes");
        }
        FlashingProgress::Progress { bytes } => {
            done += bytes;
            if total > 0 {
                info!("{}%", u64::from(done) * 100 / u64::from(total));
            }
        }
        FlashingProgress::Verifying => println!("Verifying"),
        FlashingProgress::Message(text) => println!("{text}"),
        FlashingProgress::Started | FlashingProgress::Finished | FlashingProgress::Failed => {}
    });
    let report = FlashManager::new()
        .flash_bin(target, file, address, &mut progress)
        .with_context(|| format!("Failed to flash {}", file.display()))?;
    println!("{}", report.message());
    if !report.is_success() {
        bail!("flashing failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let debug = DebugManager::default();

    match &cli.command {
        Commands::List => list_probes(config)?,
        Commands::Core { rom, ram, regs, action } => {
            let mut core = CorefileTarget::open(rom, ram, regs, config.corefile)
                .context("Failed to load corefile")?;
            match action {
                CoreAction::Regs => print_registers(&debug, &mut core, None)?,
                CoreAction::Read { address, length } => print_memory(&mut core, *address, *length)?,
            }
        }
        command => {
            let mut target = open_target(&cli, config)?;
            let target = target.as_mut();
            match command {
                Commands::Info => {
                    println!("Target: {}", target.kind());
                    println!("{}", target.memory_map()?);
                }
                Commands::Regs { num } => print_registers(&debug, target, *num)?,
                Commands::Read { address, length } => print_memory(target, *address, *length)?,
                Commands::Halt => {
                    debug.halt(target)?.context("Target did not halt")?;
                    println!("Halted at 0x{:08X}", debug.pc(target)?);
                }
                Commands::Resume { wait } => {
                    debug.resume(target)?;
                    println!("Resumed.");
                    if *wait {
                        let reason = loop {
                            if let Some(reason) = target.poll_halt()? {
                                break reason;
                            }
                            std::thread::sleep(config.timeouts.poll_interval());
                        };
                        println!("Halted ({reason:?}) at 0x{:08X}", debug.pc(target)?);
                    }
                }
                Commands::Step => {
                    debug.step(target)?.context("Target did not stop after the step")?;
                    println!("Stepped to 0x{:08X}", debug.pc(target)?);
                }
                Commands::Reset => {
                    target.reset()?;
                    println!("Reset.");
                }
                Commands::Break { address } => {
                    BreakpointManager::new().set_breakpoint(target, *address)?;
                    println!("Breakpoint set at 0x{address:08X}");
                }
                Commands::Clear { address } => {
                    BreakpointManager::new().clear_breakpoint(target, *address)?;
                    println!("Breakpoint cleared at 0x{address:08X}");
                }
                Commands::Flash { file, address } => flash(target, file, *address)?,
                Commands::List | Commands::Core { .. } => unreachable!(),
            }
        }
    }
    Ok(())
}

#[cfg(feature = "hardware")]
fn list_probes(config: ProbeConfig) -> Result<()> {
    let probes = troll_core::ProbeManager::new(config, troll_core::Diagnostics::default()).list_probes()?;
    println!("Found {} probes:", probes.len());
    for (i, probe) in probes.iter().enumerate() {
        println!("{}: {} (Serial: {:?})", i, probe.name(), probe.serial_number);
    }
    Ok(())
}

#[cfg(not(feature = "hardware"))]
fn list_probes(_config: ProbeConfig) -> Result<()> {
    bail!("built without serial port support")
}
