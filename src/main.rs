//! Wirecut command-line host.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use wirecut::report::TickReport;
use wirecut::session::{parse_frame_arg, read_file, write_file, Session};

#[derive(Parser)]
#[command(name = "wirecut")]
#[command(about = "Steady-state vehicle wiring simulator", long_about = None)]
#[command(version)]
struct Cli {
    /// Circuit file (.ckt)
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Number of ticks to run
    #[arg(short = 'n', long, default_value_t = 10)]
    ticks: usize,

    /// Override the file's tick length in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Frame to send before the first tick, as BUS:ID:DATA in hex
    /// (repeatable)
    #[arg(long = "frame", value_name = "BUS:ID:DATA")]
    frames: Vec<String>,

    /// Write the circuit with its final component states here
    #[arg(short, long, value_name = "FILE")]
    save: Option<PathBuf>,

    /// Print wire and net voltages, and debug logs
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wirecut: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let file = read_file(&cli.input)?;
    let mut session = Session::new(file);
    if let Some(tick_ms) = cli.tick_ms {
        session.set_tick_ms(tick_ms);
    }
    for arg in &cli.frames {
        let (bus, frame) = parse_frame_arg(arg)?;
        session.inject_frame(bus, frame);
    }

    for _ in 0..cli.ticks {
        let now = session.now_ms();
        let out = session.step();
        let report = TickReport {
            out: &out,
            circuit: session.circuit(),
            now_ms: now,
            verbose: cli.verbose,
        };
        print!("{report}");
    }

    if let Some(path) = &cli.save {
        write_file(&session.into_file(), path)?;
        log::info!("saved {}", path.display());
    }
    Ok(())
}
