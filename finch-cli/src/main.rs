use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use finch_vm::{rgb332_to_rgb, Machine, Ram, SCREEN_SIZE};

/// Finch fantasy console
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Assemble a source file into a flat binary image
    Asm {
        /// Assembly source file
        input: PathBuf,

        /// Output image (defaults to the input with a `.bin` extension)
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Load and run an image (or assemble a `.asm` file first)
    Run {
        /// Binary image or assembly source
        input: PathBuf,

        /// Emulated clock rate in cycles per second
        #[clap(long, default_value_t = 1_000_000)]
        hz: u64,

        /// Stop after this many cycles even if the program has not halted
        #[clap(long)]
        max_cycles: Option<u64>,

        /// Write the latest presented frame to this PNG on exit
        #[clap(long)]
        screenshot: Option<PathBuf>,

        /// Run flat out instead of pacing to wall-clock time
        #[clap(long)]
        turbo: bool,
    },
}

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("FINCH_LOG", "info")
        .write_style_or("FINCH_LOG", "always");
    env_logger::init_from_env(env);

    match Args::parse().cmd {
        Cmd::Asm { input, output } => {
            let image = assemble_file(&input)?;
            let output =
                output.unwrap_or_else(|| input.with_extension("bin"));
            std::fs::write(&output, &image)
                .with_context(|| format!("failed to write {output:?}"))?;
            info!("wrote {} bytes to {output:?}", image.len());
            Ok(())
        }
        Cmd::Run {
            input,
            hz,
            max_cycles,
            screenshot,
            turbo,
        } => run(&input, hz, max_cycles, screenshot.as_deref(), turbo),
    }
}

/// Assembles a source file, rendering diagnostics to stderr on failure
fn assemble_file(path: &Path) -> Result<Vec<u8>> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {path:?}"))?;
    match finch_asm::assemble(&source) {
        Ok(image) => Ok(image),
        Err(errors) => {
            for e in &errors {
                eprintln!("{}: {e}", path.display());
            }
            bail!("assembly failed with {} error(s)", errors.len());
        }
    }
}

/// Loads an image (assembling first if needed) and drives the machine
fn run(
    input: &Path,
    hz: u64,
    max_cycles: Option<u64>,
    screenshot: Option<&Path>,
    turbo: bool,
) -> Result<()> {
    let is_source = matches!(
        input.extension().and_then(|e| e.to_str()),
        Some("asm") | Some("s")
    );
    let image = if is_source {
        assemble_file(input)?
    } else {
        std::fs::read(input)
            .with_context(|| format!("failed to read {input:?}"))?
    };

    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    info!("loaded {} bytes", image.len());

    // nominal 60 Hz frames
    let frame = Duration::from_micros(16_667);
    let budget = (hz / 60).max(1);
    let mut console_pos = 0u16;
    let mut last = Instant::now();
    let mut presented = false;

    loop {
        let now = Instant::now();
        let delta = now.duration_since(last);
        last = now;
        vm.tick_timers(delta.as_millis() as u16);

        vm.step(budget);

        if vm.consume_console_update() {
            console_pos = drain_console(&vm, console_pos)?;
        }
        if vm.consume_display() {
            presented = true;
            if let Some(path) = screenshot {
                save_frame(&vm, path)?;
            }
        }
        if vm.is_halted() {
            info!("halted after {} cycles", vm.cycles());
            break;
        }
        if let Some(max) = max_cycles {
            if vm.cycles() >= max {
                info!("cycle limit reached ({max})");
                break;
            }
        }
        if !turbo {
            let elapsed = last.elapsed();
            if elapsed < frame {
                std::thread::sleep(frame - elapsed);
            }
        }
    }

    // a final frame for programs that halt without presenting
    if let Some(path) = screenshot {
        if !presented || vm.display_requested() {
            save_frame(&vm, path)?;
        }
    }
    Ok(())
}

/// Prints console bytes written since `from`, returning the new position
///
/// The console is a ring; everything between the previous and current write
/// positions is new output, wrapping through the end of the buffer.
fn drain_console(vm: &Machine, from: u16) -> Result<u16> {
    let to = vm.console_write_pos();
    let buf = vm.console_bytes();
    let mut out = std::io::stdout().lock();
    if from <= to {
        out.write_all(&buf[usize::from(from)..usize::from(to)])?;
    } else {
        out.write_all(&buf[usize::from(from)..])?;
        out.write_all(&buf[..usize::from(to)])?;
    }
    out.flush()?;
    Ok(to)
}

/// Converts the RGB332 framebuffer to a PNG
fn save_frame(vm: &Machine, path: &Path) -> Result<()> {
    let fb = vm.framebuffer();
    let size = u32::from(SCREEN_SIZE);
    let img = image::RgbImage::from_fn(size, size, |x, y| {
        let px = fb[(y * size + x) as usize];
        image::Rgb(rgb332_to_rgb(px))
    });
    img.save(path)
        .with_context(|| format!("failed to write {path:?}"))?;
    info!("saved frame to {path:?}");
    Ok(())
}
