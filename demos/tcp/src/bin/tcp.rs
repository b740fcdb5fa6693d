use clap::{value_parser, Arg, ArgAction, Command};
use commonware_tcp::{simulate, Config};
use std::{fs::File, io::BufWriter, path::PathBuf, str::FromStr};
use tracing::{error, info, Level};

fn main() {
    // Parse arguments
    let matches = Command::new("tcp")
        .about("pace a bulk transfer over a simulated two-hop path")
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("packets")
                .long("packets")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("payload-size")
                .long("payload-size")
                .value_parser(value_parser!(usize)),
        )
        .arg(Arg::new("rate").long("rate"))
        .arg(
            Arg::new("error-rate")
                .long("error-rate")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("trace")
                .long("trace")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info"),
        )
        .arg(Arg::new("json").long("json").action(ArgAction::SetTrue))
        .get_matches();

    // Create logger
    let level = matches.get_one::<String>("log-level").unwrap();
    let level = Level::from_str(level).expect("Invalid log level");
    let logger = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_line_number(true)
        .with_file(true);
    if matches.get_flag("json") {
        logger.json().init();
    } else {
        logger.init();
    }

    // Load config
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => {
            let file = std::fs::read_to_string(path).expect("Could not read config file");
            serde_yaml::from_str(&file).expect("Could not parse config file")
        }
        None => Config::default(),
    };
    if let Some(packets) = matches.get_one::<u64>("packets") {
        config.packets = *packets;
    }
    if let Some(payload_size) = matches.get_one::<usize>("payload-size") {
        config.payload_size = *payload_size;
    }
    if let Some(rate) = matches.get_one::<String>("rate") {
        config.rate = rate.clone();
    }
    if let Some(error_rate) = matches.get_one::<f64>("error-rate") {
        config.set_error_rate(*error_rate);
    }
    if let Some(seed) = matches.get_one::<u64>("seed") {
        config.seed = *seed;
    }
    if let Some(trace) = matches.get_one::<PathBuf>("trace") {
        config.trace = Some(trace.clone());
    }
    info!(
        packets = config.packets,
        payload_size = config.payload_size,
        rate = %config.rate,
        hops = config.hops.len(),
        seed = config.seed,
        "loaded config"
    );

    // Run simulation
    let report = match simulate(&config) {
        Ok(report) => report,
        Err(err) => {
            error!(?err, "simulation failed");
            std::process::exit(1);
        }
    };

    // Write window trace
    if let Some(path) = &config.trace {
        let file = File::create(path).expect("Could not create trace file");
        report
            .window
            .write(BufWriter::new(file))
            .expect("Could not write trace file");
        info!(
            path = %path.display(),
            samples = report.window.samples().len(),
            "wrote window trace"
        );
    }

    info!(
        sent = report.sent,
        delivered = report.delivered,
        delivered_bytes = report.delivered_bytes,
        dropped = report.dropped,
        corrupted = report.corrupted,
        "sink totals"
    );
    info!(auditor = %report.auditor, "auditor state");
    println!("{}", report.metrics);
}
