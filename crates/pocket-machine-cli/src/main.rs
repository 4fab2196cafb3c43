//! Headless machine runner: boot a ROM directory and execute a number of
//! frames, reporting why execution stopped and the final register state.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use pocket_machine::{Machine, MachineConfig, RunExit};

#[derive(Parser)]
#[command(name = "pocket-machine", about = "Game & Watch machine emulator")]
struct Args {
    /// ROM directory (or a bare internal_flash.bin image).
    rom: PathBuf,

    /// Number of frames to run.
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Cycle budget per frame.
    #[arg(long, default_value_t = 1_000_000)]
    cycles_per_frame: u64,

    /// Stop when the PC reaches this address (hex accepted).
    #[arg(long, value_parser = parse_u32)]
    breakpoint: Option<u32>,

    /// Dump registers after every frame instead of only at the end.
    #[arg(long)]
    trace_frames: bool,
}

fn parse_u32(value: &str) -> Result<u32, String> {
    let trimmed = value.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        trimmed.parse()
    };
    parsed.map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut machine = Machine::new(MachineConfig {
        cycles_per_frame: args.cycles_per_frame,
        ..Default::default()
    });
    machine
        .boot_rom_path(&args.rom)
        .with_context(|| format!("booting {}", args.rom.display()))?;
    if let Some(addr) = args.breakpoint {
        machine.add_breakpoint(addr);
    }

    for frame in 0..args.frames {
        match machine.run_frame() {
            RunExit::Completed { .. } => {}
            RunExit::Halted { .. } => {
                // Halted with the timer still ticking: keep going, the next
                // frame re-checks for wake-ups.
            }
            RunExit::Bkpt { pc, comment } => {
                tracing::info!("frame {frame}: stopped at BKPT #{comment} ({pc:#010x})");
                break;
            }
            RunExit::Breakpoint { pc } => {
                tracing::info!("frame {frame}: breakpoint hit at {pc:#010x}");
                break;
            }
            RunExit::FaultLimit { pc } => {
                tracing::error!("frame {frame}: too many consecutive faults near {pc:#010x}");
                break;
            }
        }
        if args.trace_frames {
            println!("--- frame {frame} ({} cycles) ---", machine.cycles());
            println!("{}", machine.cpu.state.dump());
        }
    }

    println!(
        "executed {} cycles over at most {} frames",
        machine.cycles(),
        args.frames
    );
    println!("{}", machine.cpu.state.dump());
    Ok(())
}
