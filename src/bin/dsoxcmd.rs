#![deny(clippy::unwrap_used)]

use clap::builder::{BoolishValueParser, NonEmptyStringValueParser};
use clap::{arg, command, value_parser};
use dsoxctrl::device::Device;
use dsoxctrl::measurement::MeasurementRecord;
use dsoxctrl::proto::block::TruncationPolicy;
use dsoxctrl::proto::command::{
    Channel, Coupling, LevelSource, MeasurementKind, MeasurementSource, Palette, ProbeUnit, Slope,
    TriggerMode, TriggerSource, VoltUnit, WaveFunction,
};
use dsoxctrl::proto::Result;
use dsoxctrl::{proto, Address, ADDRESS_ENV, DEFAULT_ADDRESS};
use env_logger::Env;
use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

#[derive(Debug, Copy, Clone)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
            Self::Csv => f.write_str("csv"),
        }
    }
}

impl clap::ValueEnum for OutputFormat {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Text, Self::Json, Self::Csv]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Text => clap::builder::PossibleValue::new("text"),
            Self::Json => clap::builder::PossibleValue::new("json"),
            Self::Csv => clap::builder::PossibleValue::new("csv"),
        })
    }
}

fn cli() -> clap::Command {
    command!() // requires `cargo` feature
        .arg(
            arg!(
                -a --address <ADDRESS> "Instrument address, e.g. TCPIP0::192.168.1.20::5025::SOCKET or /dev/usbtmc0"
            )
            .default_value(DEFAULT_ADDRESS)
            .env(ADDRESS_ENV)
            .required(false)
            .value_parser(value_parser!(Address)),
        )
        .arg(arg!(
            -d --debug ... "Turn debugging information on"
        ))
        .arg(arg!(
            --strict "Fail on truncated binary blocks instead of returning the partial data"
        ))
        .subcommand(
            clap::Command::new("ident")
                .about("Device identification")
                .arg(
                    arg!(--expect <IDN> "Fail unless the identification matches")
                        .value_parser(NonEmptyStringValueParser::new()),
                ),
        )
        .subcommand(clap::Command::new("run").about("Start acquisition"))
        .subcommand(clap::Command::new("stop").about("Stop acquisition"))
        .subcommand(clap::Command::new("single").about("Single acquisition"))
        .subcommand(
            clap::Command::new("channel")
                .about("Analog channel settings")
                .arg(
                    arg!(<channel> "Channel number")
                        .value_parser(clap::value_parser!(u8).range(1..=4)),
                )
                .arg(arg!(--coupling <COUPLING> "Input coupling").value_parser(value_parser!(Coupling)))
                .arg(arg!(--display <STATE> "Show channel").value_parser(BoolishValueParser::new()))
                .arg(arg!(--invert <STATE> "Invert input signal").value_parser(BoolishValueParser::new()))
                .arg(
                    arg!(--label <LABEL> "Channel label, up to 10 characters")
                        .value_parser(NonEmptyStringValueParser::new()),
                )
                .arg(
                    arg!(--offset <VALUE> "Value at center screen")
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64)),
                )
                .arg(arg!(--probe <FACTOR> "Probe attenuation, 0.1 .. 10000").value_parser(value_parser!(f64)))
                .arg(arg!(--range <VALUE> "Full-scale vertical range").value_parser(value_parser!(f64)))
                .arg(arg!(--scale <VALUE> "Vertical units per division").value_parser(value_parser!(f64)))
                .arg(
                    arg!(--unit <UNIT> "Suffix for offset, range and scale")
                        .default_value("V")
                        .value_parser(value_parser!(VoltUnit)),
                )
                .arg(arg!(--"probe-unit" <UNIT> "Probe measurement unit").value_parser(value_parser!(ProbeUnit))),
        )
        .subcommand(
            clap::Command::new("labels")
                .about("Show or hide channel labels")
                .arg(arg!(<state> "Label display").value_parser(BoolishValueParser::new())),
        )
        .subcommand(
            clap::Command::new("screenshot")
                .about("Save screen image as PNG")
                .arg(arg!(<output> "Output path").value_parser(value_parser!(PathBuf)))
                .arg(
                    arg!(--palette <PALETTE> "Color palette")
                        .default_value("color")
                        .value_parser(value_parser!(Palette)),
                )
                .arg(arg!(
                    --"keep-malformed" "Save the whole reply if the image header is malformed"
                )),
        )
        .subcommand(
            clap::Command::new("measure")
                .about("Install a measurement and print its value")
                .alias("mea")
                .arg(arg!(<kind> "Measurement").value_parser(value_parser!(MeasurementKind)))
                .arg(
                    arg!(<source> "chan<n>, func, math, wmem<r> or ext")
                        .value_parser(value_parser!(MeasurementSource)),
                )
                .arg(arg!(
                    --"loop" "Repeat measurement every second"
                ))
                .arg(arg!(--format <fmt> "Output format").value_parser(value_parser!(OutputFormat))),
        )
        .subcommand(clap::Command::new("clear-measurements").about("Clear all measurements from screen"))
        .subcommand(
            clap::Command::new("timebase")
                .about("Horizontal scale")
                .arg(arg!(<seconds> "Time per division").value_parser(value_parser!(f64))),
        )
        .subcommand(
            clap::Command::new("trigger")
                .about("Trigger settings")
                .arg(arg!(--mode <MODE> "Trigger mode").value_parser(value_parser!(TriggerMode)))
                .arg(arg!(--holdoff <SECONDS> "Holdoff time").value_parser(value_parser!(f64)))
                .arg(
                    arg!(--"noise-reject" <STATE> "Noise reject filter")
                        .value_parser(BoolishValueParser::new()),
                )
                .arg(
                    arg!(--level <VOLTS> "Trigger level")
                        .allow_negative_numbers(true)
                        .requires("level-source")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    arg!(--"level-source" <SOURCE> "chan<n> or ext")
                        .value_parser(value_parser!(LevelSource)),
                )
                .arg(arg!(--slope <SLOPE> "Edge slope").value_parser(value_parser!(Slope)))
                .arg(
                    arg!(--source <SOURCE> "chan<n>, ext, line or wgen")
                        .value_parser(value_parser!(TriggerSource)),
                ),
        )
        .subcommand(
            clap::Command::new("wgen")
                .about("Waveform generator settings")
                .arg(arg!(--output <STATE> "Output on/off").value_parser(BoolishValueParser::new()))
                .arg(arg!(--function <FUNCTION> "Waveform").value_parser(value_parser!(WaveFunction)))
                .arg(arg!(--frequency <HZ> "Frequency").value_parser(value_parser!(f64)))
                .arg(arg!(--amplitude <VOLTS> "Amplitude").value_parser(value_parser!(f64)))
                .arg(
                    arg!(--offset <VOLTS> "Offset or DC level")
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64)),
                )
                .arg(arg!(--"pulse-width" <SECONDS> "Pulse width").value_parser(value_parser!(f64)))
                .arg(arg!(--"ramp-symmetry" <PERCENT> "Ramp symmetry, 0 .. 100").value_parser(value_parser!(f64)))
                .arg(
                    arg!(--"duty-cycle" <PERCENT> "Square duty cycle, 1 .. 99")
                        .value_parser(value_parser!(f64)),
                ),
        )
        .subcommand_required(true)
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let filter = match matches.get_count("debug") {
        0 => "warn",
        1 => "dsoxctrl=debug",
        _ => "debug",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter)).init();

    match handle_args(&matches).await {
        Ok(()) => {}
        Err(e) => {
            let address = matches
                .get_one::<Address>("address")
                .map(|a| a.to_string())
                .unwrap_or_default();
            match e {
                proto::ProtoError::Io(err) if err.kind() == ErrorKind::NotFound => {
                    eprintln!("{}: File not found", address);
                    exit(-1);
                }
                proto::ProtoError::Io(err) => {
                    eprintln!("I/O Error: {} [device: {}]", err, address);
                    exit(-1);
                }
                proto::ProtoError::Connection(msg) => {
                    eprintln!("Failed to connect to {}: {}", address, msg);
                    exit(-1);
                }
                proto::ProtoError::InvalidArgument(msg) | proto::ProtoError::InvalidAddress(msg) => {
                    eprintln!("{}", msg);
                    exit(-2);
                }
                proto::ProtoError::Format(err) => {
                    eprintln!("Received a malformed binary block: {}", err);
                    exit(-1);
                }
                err @ proto::ProtoError::Truncated { .. } => {
                    eprintln!("{}", err);
                    exit(-1);
                }
                proto::ProtoError::Abort => {
                    eprintln!("Instrument closed the connection, aborting!");
                    exit(-1);
                }
                proto::ProtoError::Unexpected(response) => {
                    eprintln!(
                        "Received an unexpected response from device, aborting!: {:?}",
                        response
                    );
                    exit(-1);
                }
            }
        }
    }
}

async fn handle_args(matches: &clap::ArgMatches) -> Result<()> {
    let policy = if matches.get_flag("strict") {
        TruncationPolicy::Strict
    } else {
        TruncationPolicy::Lenient
    };

    let address = match matches.get_one::<Address>("address") {
        Some(address) => address.clone(),
        None => DEFAULT_ADDRESS.parse()?,
    };
    let mut device = Device::connect_with(&address, policy).await?;
    log::info!("connected to {}", address);

    match matches.subcommand() {
        Some(("ident", args)) => {
            let ident = match args.get_one::<String>("expect") {
                Some(expected) => device.check_ident(expected).await?,
                None => device.ident().await?,
            };
            println!("Manufacturer: {}", ident.manufacturer);
            println!("Model: {}", ident.model);
            println!("Serial: {}", ident.serial);
            println!("Firmware: {}", ident.firmware);
        }
        Some(("run", _)) => {
            device.run().await?;
            println!("OK");
        }
        Some(("stop", _)) => {
            device.stop().await?;
            println!("OK");
        }
        Some(("single", _)) => {
            device.single().await?;
            println!("OK");
        }
        Some(("channel", args)) => {
            let n = *args.get_one::<u8>("channel").unwrap_or(&1);
            let ch = Channel::new(n)?;
            let unit = *args.get_one::<VoltUnit>("unit").unwrap_or(&VoltUnit::Volt);

            if let Some(coupling) = args.get_one::<Coupling>("coupling") {
                device.set_channel_coupling(ch, *coupling).await?;
            }
            if let Some(state) = args.get_one::<bool>("display") {
                device.set_channel_display(ch, *state).await?;
            }
            if let Some(state) = args.get_one::<bool>("invert") {
                device.set_channel_invert(ch, *state).await?;
            }
            if let Some(label) = args.get_one::<String>("label") {
                device.set_channel_label(ch, label).await?;
            }
            if let Some(offset) = args.get_one::<f64>("offset") {
                device.set_channel_offset(ch, *offset, unit).await?;
            }
            if let Some(att) = args.get_one::<f64>("probe") {
                device.set_channel_probe(ch, *att).await?;
            }
            if let Some(range) = args.get_one::<f64>("range") {
                device.set_channel_range(ch, *range, unit).await?;
            }
            if let Some(scale) = args.get_one::<f64>("scale") {
                device.set_channel_scale(ch, *scale, unit).await?;
            }
            if let Some(probe_unit) = args.get_one::<ProbeUnit>("probe-unit") {
                device.set_channel_units(ch, *probe_unit).await?;
            }
            println!("OK");
        }
        Some(("labels", args)) => {
            let state = *args.get_one::<bool>("state").unwrap_or(&true);
            device.set_display_labels(state).await?;
            println!("OK");
        }
        Some(("screenshot", args)) => {
            let palette = *args.get_one::<Palette>("palette").unwrap_or(&Palette::Color);
            if let Some(path) = args.get_one::<PathBuf>("output") {
                let n = if args.get_flag("keep-malformed") {
                    let image = device.screen_image_or_raw(palette).await?;
                    tokio::fs::write(path, &image).await?;
                    image.len()
                } else {
                    device.save_image(path, palette).await?
                };
                println!("Saved {} bytes to {}", n, path.display());
            }
        }
        Some(("measure", args)) => {
            let kind = args.get_one::<MeasurementKind>("kind").copied();
            let source = args.get_one::<MeasurementSource>("source").copied();
            let endless_loop = args.get_flag("loop");
            let format = args
                .get_one::<OutputFormat>("format")
                .unwrap_or(&OutputFormat::Text);

            if let (Some(kind), Some(source)) = (kind, source) {
                let mut csv_output = None;
                let mut c = 1;
                loop {
                    let value = device.measure(kind, source).await?;
                    let record = MeasurementRecord::new(kind, source, value);
                    let mut output = std::io::stdout();
                    match format {
                        OutputFormat::Text => {
                            if endless_loop {
                                println!("#{:0>4} {:#}", c, record);
                            } else {
                                println!("{}: {}", kind, record);
                            }
                        }
                        OutputFormat::Json => {
                            output.write_all(
                                serde_json::to_string_pretty(&record)
                                    .map_err(std::io::Error::from)?
                                    .as_bytes(),
                            )?;
                            output.write_fmt(format_args!("\n"))?;
                        }
                        OutputFormat::Csv => {
                            let writer = csv_output.get_or_insert_with(|| csv::Writer::from_writer(output));
                            writer.serialize(&record).map_err(std::io::Error::from)?;
                            writer.flush()?;
                        }
                    }

                    if !endless_loop {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                    c += 1;
                }
            }
        }
        Some(("clear-measurements", _)) => {
            device.clear_measurements().await?;
            println!("OK");
        }
        Some(("timebase", args)) => {
            if let Some(seconds) = args.get_one::<f64>("seconds") {
                device.set_timebase_scale(*seconds).await?;
                println!("OK");
            }
        }
        Some(("trigger", args)) => {
            if let Some(mode) = args.get_one::<TriggerMode>("mode") {
                device.set_trigger_mode(*mode).await?;
            }
            if let Some(holdoff) = args.get_one::<f64>("holdoff") {
                device.set_trigger_holdoff(*holdoff).await?;
            }
            if let Some(state) = args.get_one::<bool>("noise-reject") {
                device.set_trigger_noise_reject(*state).await?;
            }
            if let (Some(level), Some(source)) = (
                args.get_one::<f64>("level"),
                args.get_one::<LevelSource>("level-source"),
            ) {
                device.set_trigger_level(*level, *source).await?;
            }
            if let Some(slope) = args.get_one::<Slope>("slope") {
                device.set_trigger_slope(*slope).await?;
            }
            if let Some(source) = args.get_one::<TriggerSource>("source") {
                device.set_trigger_source(*source).await?;
            }
            println!("OK");
        }
        Some(("wgen", args)) => {
            if let Some(function) = args.get_one::<WaveFunction>("function") {
                device.set_wgen_function(*function).await?;
            }
            if let Some(hz) = args.get_one::<f64>("frequency") {
                device.set_wgen_frequency(*hz).await?;
            }
            if let Some(volts) = args.get_one::<f64>("amplitude") {
                device.set_wgen_amplitude(*volts).await?;
            }
            if let Some(volts) = args.get_one::<f64>("offset") {
                device.set_wgen_offset(*volts).await?;
            }
            if let Some(width) = args.get_one::<f64>("pulse-width") {
                device.set_wgen_pulse_width(*width).await?;
            }
            if let Some(percent) = args.get_one::<f64>("ramp-symmetry") {
                device.set_wgen_ramp_symmetry(*percent).await?;
            }
            if let Some(percent) = args.get_one::<f64>("duty-cycle") {
                device.set_wgen_square_duty_cycle(*percent).await?;
            }
            // Output last, so the signal appears with its final settings.
            if let Some(state) = args.get_one::<bool>("output") {
                device.set_wgen_output(*state).await?;
            }
            println!("OK");
        }
        _ => {
            return Err(std::io::Error::new(
                ErrorKind::Unsupported,
                "Unsupported command line argument",
            )
            .into());
        }
    }

    device.close().await
}
