//! `dpu`: command-line interface for the DPU host runtime.
//!
//! ```text
//! USAGE:
//!   dpu dmem <file> [--region R]              Print a binary file in dmem format
//!   dpu interleave <in> <out> --shape B,H,W,C Standard NHWC to hardware layout
//!   dpu reorg <in> <out> --out-size N         Hardware result to standard NHWC
//!   dpu verify <actual> <golden>              Compare against a golden file
//!   dpu simulate --shape B,H,W,C              Full controller pass, simulated device
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dpu_driver::layout::{
    batch_interleave, dmem_encode, output_reorg, render_dmem, DmemRegion, InterleaveConfig, InterleaveMode,
    PaddingPolicy,
};
use dpu_driver::{
    BackendSelection, Controller, ControllerConfig, GoldenReference, ProgramImage, ProgramMode, TensorShape,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dpu", about = "DPU accelerator host runtime CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum Pad {
    Zero,
    Max,
    Random,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print a binary file in dmem format.
    Dmem {
        /// Input file.
        file: PathBuf,
        /// Region selecting the base address (input, interleaved, params, output).
        #[arg(long, default_value = "output")]
        region: DmemRegion,
    },
    /// Convert a standard NHWC int8 file to the hardware layout.
    Interleave {
        /// Standard-layout input file.
        input: PathBuf,
        /// Hardware-layout output file.
        output: PathBuf,
        /// Tensor shape as B,H,W,C.
        #[arg(long, value_parser = parse_shape)]
        shape: TensorShape,
        /// Encoding (wide or narrow).
        #[arg(long, default_value = "wide")]
        mode: InterleaveMode,
        /// Padding channel fill.
        #[arg(long, value_enum, default_value = "zero")]
        pad: Pad,
        /// Seed for random padding.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Convert a hardware result file to standard NHWC.
    Reorg {
        /// Hardware-layout result file.
        input: PathBuf,
        /// Standard-layout output file.
        output: PathBuf,
        /// Output bytes per batch item.
        #[arg(long)]
        out_size: usize,
        /// Batch size.
        #[arg(long, default_value_t = 4)]
        batch: usize,
    },
    /// Compare a standard-layout output against a golden file.
    Verify {
        /// Output file.
        actual: PathBuf,
        /// Golden reference file.
        golden: PathBuf,
    },
    /// Run the full controller flow on the simulated device with a loop-back kernel.
    Simulate {
        /// Tensor shape as B,H,W,C.
        #[arg(long, value_parser = parse_shape)]
        shape: TensorShape,
        /// Number of passes.
        #[arg(long, default_value_t = 1)]
        runs: usize,
        /// Worker threads.
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Encoding (wide or narrow).
        #[arg(long, default_value = "wide")]
        mode: InterleaveMode,
        /// Use the on-chip data-reorg unit instead of host interleave.
        #[arg(long)]
        dru: bool,
        /// Write debug dumps into this directory.
        #[arg(long)]
        dump: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Dmem { file, region } => cmd_dmem(&file, region)?,
        Cmd::Interleave {
            input,
            output,
            shape,
            mode,
            pad,
            seed,
        } => cmd_interleave(&input, &output, shape, mode, padding(pad, seed))?,
        Cmd::Reorg {
            input,
            output,
            out_size,
            batch,
        } => cmd_reorg(&input, &output, out_size, batch)?,
        Cmd::Verify { actual, golden } => cmd_verify(&actual, &golden)?,
        Cmd::Simulate {
            shape,
            runs,
            workers,
            mode,
            dru,
            dump,
        } => cmd_simulate(shape, runs, workers, mode, dru, dump)?,
    }

    Ok(())
}

fn parse_shape(s: &str) -> Result<TensorShape, String> {
    let dims = s
        .split(',')
        .map(|d| d.trim().parse::<usize>().map_err(|e| format!("bad dimension '{d}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match dims.as_slice() {
        &[b, h, w, c] => Ok(TensorShape::int8(b, h, w, c)),
        _ => Err(format!("expected B,H,W,C, got '{s}'")),
    }
}

const fn padding(pad: Pad, seed: u64) -> PaddingPolicy {
    match pad {
        Pad::Zero => PaddingPolicy::Zero,
        Pad::Max => PaddingPolicy::Max,
        Pad::Random => PaddingPolicy::Random { seed },
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn write(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

fn label(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned())
}

fn cmd_dmem(file: &Path, region: DmemRegion) -> Result<()> {
    let data = read(file)?;
    print!("{}", render_dmem(&label(file), &dmem_encode(&data, region)));
    Ok(())
}

fn cmd_interleave(
    input: &Path,
    output: &Path,
    shape: TensorShape,
    mode: InterleaveMode,
    padding: PaddingPolicy,
) -> Result<()> {
    let data = read(input)?;
    let config = InterleaveConfig::default().with_mode(mode).with_padding(padding);
    let hw = batch_interleave(&data, &shape, &config)?;
    write(output, &hw)?;
    println!("{shape} ({mode}, padding {padding}): {} -> {} bytes", data.len(), hw.len());
    Ok(())
}

fn cmd_reorg(input: &Path, output: &Path, out_size: usize, batch: usize) -> Result<()> {
    let hw = read(input)?;
    let std_out = output_reorg(&hw, out_size, batch)?;
    write(output, &std_out)?;
    println!("{} hardware bytes -> {batch} x {out_size} standard bytes", hw.len());
    Ok(())
}

fn cmd_verify(actual: &Path, golden: &Path) -> Result<()> {
    let golden = GoldenReference::load(golden)?;
    let report = golden.compare(&read(actual)?)?;
    print!("{}", report.render());
    if !report.passed() {
        bail!("{report}");
    }
    Ok(())
}

fn cmd_simulate(
    shape: TensorShape,
    runs: usize,
    workers: usize,
    mode: InterleaveMode,
    dru: bool,
    dump: Option<PathBuf>,
) -> Result<()> {
    let interleave = InterleaveConfig::default().with_mode(mode);
    let out_size = shape.height * shape.width * interleave.padded_channels(shape.channels);
    let mut config = ControllerConfig::new(shape, out_size)
        .with_backend(BackendSelection::Simulated, "")
        .with_workers(workers)
        .with_interleave_mode(mode)
        .with_mode(ProgramMode { single_pool: false, dru })
        .with_wait(15, Duration::from_millis(10))
        .with_env_overrides();
    if let Some(dir) = dump {
        config = config.with_dump_dir(dir);
    }

    let program = ProgramImage::new(vec![0u8; 4096], vec![0u8; 4096]);
    let controller = Controller::open(config, &program)?;

    let input: Vec<u8> = (0..shape.element_count()?).map(|i| (i % 251) as u8).collect();
    // host interleave + output reorg invert each other for full wide batches
    let round_trip = !dru
        && mode == InterleaveMode::Wide
        && shape.batch == 4
        && shape.channels == interleave.padded_channels(shape.channels);

    let start = Instant::now();
    for run in 0..runs {
        let out = controller.run(&input)?;
        println!(
            "run {run}: CU {} in {:?} ({} attempt(s)), {} output bytes",
            out.exec.compute_unit,
            out.exec.elapsed,
            out.exec.attempts,
            out.output.len()
        );
        if round_trip {
            let report = GoldenReference::from_bytes(input.clone()).compare(&out.output)?;
            println!("  round trip: {report}");
            if !report.passed() {
                bail!("loop-back round trip failed: {report}");
            }
        }
    }
    println!("{runs} run(s) in {:?}", start.elapsed());
    Ok(())
}
