use std::fs;
use std::process;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

use jprog_hal::xilinx::{device_name, XilinxProgrammer};
use jprog_hal::{list_probes, Adapter, CancelToken, LogLevel, Reporter, TapEngine};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let matches = Command::new("jprog")
        .about("Program FPGAs over JTAG through USB-Blaster or FTDI MPSSE cables")
        .version(clap::crate_version!())
        .subcommand_required(true)
        .arg(
            Arg::new("probe")
                .long("probe")
                .short('p')
                .help("Probe index, as printed by `jprog list`")
                .global(true)
                .value_parser(value_parser!(usize))
                .default_value("0"),
        )
        .arg(
            Arg::new("freq")
                .long("freq")
                .help("TCK frequency in Hz (MPSSE cables only)")
                .global(true)
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .help("Only report warnings and errors")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(Command::new("list").about("List connected probes"))
        .subcommand(Command::new("idcode").about("Read and decode the device IDCODE"))
        .subcommand(
            Command::new("svf").about("Play an SVF file").arg(
                Arg::new("file")
                    .help("SVF file to play")
                    .required(true),
            ),
        )
        .subcommand(
            Command::new("bit")
                .about("Load a Xilinx 7-series .bit file into SRAM")
                .arg(Arg::new("file").help(".bit file to load").required(true)),
        )
        .get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let quiet = matches.get_flag("quiet");
    match matches.subcommand() {
        Some(("list", _)) => {
            let probes = list_probes()?;
            if probes.is_empty() {
                println!("no supported probes connected");
            }
            for (i, probe) in probes.iter().enumerate() {
                println!("{i}: {}", probe.describe());
            }
            Ok(())
        }
        Some(("idcode", sub)) => {
            let mut tap = open_tap(sub)?;
            let mut reporter = make_reporter(quiet);
            let cancel = CancelToken::new();
            tap.reset()?;
            let mut programmer = XilinxProgrammer::new(&mut tap, &mut reporter, &cancel);
            match programmer.read_idcode()? {
                Some(idcode) => match device_name(idcode) {
                    Some(name) => println!("{idcode:#010x} {name}"),
                    None => println!("{idcode:#010x} (unknown device)"),
                },
                None => bail!("this adapter cannot read IDCODE"),
            }
            Ok(())
        }
        Some(("svf", sub)) => {
            let path = sub.get_one::<String>("file").context("missing file")?;
            let source =
                fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            let mut tap = open_tap(sub)?;
            let mut reporter = make_reporter(quiet);
            let cancel = CancelToken::new();
            jprog_hal::svf::play(&mut tap, &source, &mut reporter, &cancel)?;
            Ok(())
        }
        Some(("bit", sub)) => {
            let path = sub.get_one::<String>("file").context("missing file")?;
            let raw = fs::read(path).with_context(|| format!("reading {path}"))?;
            let mut tap = open_tap(sub)?;
            let mut reporter = make_reporter(quiet);
            let cancel = CancelToken::new();
            jprog_hal::xilinx::program_bitstream(&mut tap, &raw, &mut reporter, &cancel)?;
            Ok(())
        }
        _ => unreachable!("subcommand required"),
    }
}

fn open_tap(matches: &ArgMatches) -> anyhow::Result<TapEngine<Box<dyn Adapter>>> {
    let index = *matches.get_one::<usize>("probe").context("missing probe")?;
    let probes = list_probes()?;
    if probes.is_empty() {
        bail!("no supported probes connected");
    }
    let probe = probes
        .get(index)
        .with_context(|| format!("probe index {index} out of range, found {}", probes.len()))?;
    let mut adapter = probe.open()?;
    if let Some(freq) = matches.get_one::<u32>("freq") {
        adapter.set_frequency(*freq)?;
    }
    Ok(TapEngine::new(adapter))
}

fn make_reporter(quiet: bool) -> Reporter {
    Reporter::new()
        .on_log(move |level, msg| match level {
            LogLevel::Error => eprintln!("error: {msg}"),
            LogLevel::Warning => eprintln!("warning: {msg}"),
            LogLevel::Success => eprintln!("{msg}"),
            LogLevel::Info => {
                if !quiet {
                    eprintln!("{msg}");
                }
            }
        })
        .on_progress(move |pct| {
            if !quiet {
                eprint!("\r{pct:3}%");
                if pct == 100 {
                    eprintln!();
                }
            }
        })
}
