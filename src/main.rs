use clap::{Arg, ArgAction, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::Body;
use exhume_indx::NtfsVolume;
use exhume_indx::driver::{RipOptions, rip};
use exhume_indx::output::OutputFormat;
use log::{debug, error};
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::process::exit;

fn build_command() -> Command {
    Command::new("exhume_indx")
        .version(env!("CARGO_PKG_VERSION"))
        .author("ForensicXlab")
        .about("Exhume file metadata from the slack space of NTFS $I30 indexes.")
        .arg(
            Arg::new("image")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The image or device to exhume."),
        )
        .arg(
            Arg::new("outfile")
                .value_parser(value_parser!(String))
                .required(true)
                .help("Output file path; output is appended if the file exists."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .default_value("0")
                .help("The NTFS partition starts at this sector (decimal or hex)."),
        )
        .arg(
            Arg::new("sector_size")
                .short('b')
                .long("sector-size")
                .value_parser(maybe_hex::<u64>)
                .default_value("512")
                .help("Sector size in bytes."),
        )
        .arg(
            Arg::new("mount_point")
                .short('m')
                .long("mount-point")
                .value_parser(value_parser!(String))
                .default_value("")
                .help("A string to prepend to every emitted path, such as \"C:\"."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(["csv", "bodyfile", "jsonl"])
                .default_value("csv")
                .help("Output format."),
        )
        .arg(
            Arg::new("image_format")
                .long("image-format")
                .value_parser(["auto", "raw", "ewf"])
                .default_value("auto")
                .help("The format of the image, either 'raw' or 'ewf'."),
        )
        .arg(
            Arg::new("no_active_files")
                .long("no-active-files")
                .action(ArgAction::SetTrue)
                .help("Filter out entries of files whose MFT records are still in use."),
        )
        .arg(
            Arg::new("skip_deleted_dirs")
                .long("skip-deleted-dirs")
                .action(ArgAction::SetTrue)
                .help("Don't search for entries in deleted directories."),
        )
        .arg(
            Arg::new("dedup")
                .long("dedup")
                .action(ArgAction::SetTrue)
                .help("Deduplicate output lines."),
        )
        .arg(
            Arg::new("pbs")
                .long("pbs")
                .action(ArgAction::SetTrue)
                .help("Display the partition boot sector information."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Display the partition boot sector in JSON format."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
}

fn main() {
    let matches = match build_command().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            use clap::error::ErrorKind;
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit(0),
                _ => exit(1),
            }
        }
    };

    // Initialize logger.
    let log_level_str = matches.get_one::<String>("log_level").unwrap();
    let level_filter = match log_level_str.as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    let image = matches.get_one::<String>("image").unwrap();
    let outfile = matches.get_one::<String>("outfile").unwrap();
    let offset = *matches.get_one::<u64>("offset").unwrap();
    let sector_size = *matches.get_one::<u64>("sector_size").unwrap();
    let image_format = matches.get_one::<String>("image_format").unwrap();
    let format = OutputFormat::from_name(matches.get_one::<String>("format").unwrap()).unwrap();

    let body = Body::new(image.to_owned(), image_format);
    debug!("Created Body from '{}'", image);

    let mut volume = match NtfsVolume::new(body, offset * sector_size, sector_size) {
        Ok(volume) => volume,
        Err(e) => {
            error!("Couldn't open the NTFS volume: {e}");
            eprintln!("exhume_indx: error: {e}");
            exit(2);
        }
    };

    if matches.get_flag("pbs") {
        if matches.get_flag("json") {
            match serde_json::to_string_pretty(&volume.pbs.to_json()) {
                Ok(s) => println!("{}", s),
                Err(e) => error!("Error serializing the boot sector to JSON: {e}"),
            }
        } else {
            println!("{}", volume.pbs.to_string());
        }
    }

    let out = match OpenOptions::new().create(true).append(true).open(outfile) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("exhume_indx: error: could not open '{outfile}': {e}");
            exit(2);
        }
    };

    let opts = RipOptions {
        mount_point: matches.get_one::<String>("mount_point").unwrap().clone(),
        format,
        no_active_files: matches.get_flag("no_active_files"),
        skip_deleted_dirs: matches.get_flag("skip_deleted_dirs"),
        dedup: matches.get_flag("dedup"),
    };

    if let Err(e) = rip(&mut volume, &opts, BufWriter::new(out)) {
        error!("{e}");
        eprintln!("exhume_indx: error: {e}");
        exit(2);
    }
}
