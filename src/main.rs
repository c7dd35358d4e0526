use clap::{Arg, ArgAction, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::{Body, BodySlice};
use exhume_timeline::mbr::{ChsAddress, partitions_to_string};
use exhume_timeline::{
    NTFS, ParseOptions, PartitionDescriptor, PartitionType, parse_partition, read_partition_table,
};
use log::{debug, error, info};
use serde_json::{Value, json};
use std::io::{Read, Seek};

/// What to do once the volumes are known.
struct Request {
    partition: Option<usize>,
    show_partitions: bool,
    record: Option<u64>,
    list_dir: Option<u64>,
    json_output: bool,
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => error!("Error serializing to JSON: {}", e),
    }
}

/// Single-record inspection, NTFS only.
fn inspect_ntfs<T: Read + Seek>(
    body: &mut T,
    partition: &PartitionDescriptor,
    options: &ParseOptions,
    req: &Request,
) {
    let mut filesystem = match NTFS::new(body, partition.first_byte_offset, options) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Couldn't open NTFS: {}", e);
            return;
        }
    };

    if let Some(file_id) = req.record {
        match filesystem.get_file_id(file_id) {
            Ok(file) if req.json_output => print_json(&file.to_json()),
            Ok(file) => println!("{}", file.to_string()),
            Err(e) => error!("Could not read MFT record {}: {}", file_id, e),
        }
    }

    if let Some(dir_id) = req.list_dir {
        match filesystem.list_dir(dir_id) {
            Ok(entries) if req.json_output => {
                let arr: Vec<Value> = entries.iter().map(|de| de.to_json()).collect();
                print_json(&json!({ "dir_entries": arr }));
            }
            Ok(entries) => {
                for file in entries {
                    let mark = if file.deleted { " (deleted)" } else { "" };
                    println!("{}  {}{}", file.file_id, file.name, mark);
                }
            }
            Err(e) => error!("Could not list directory entries of record {}: {}", dir_id, e),
        }
    }
}

fn exhume<T: Read + Seek>(
    body: &mut T,
    partitions: Vec<PartitionDescriptor>,
    options: &ParseOptions,
    req: &Request,
) {
    if req.show_partitions {
        if req.json_output {
            let arr: Vec<Value> = partitions.iter().map(|p| p.to_json()).collect();
            print_json(&json!({ "partitions": arr }));
        } else {
            println!("{}", partitions_to_string(&partitions));
        }
        return;
    }

    let selected: Vec<&PartitionDescriptor> = match req.partition {
        Some(index) => match partitions.get(index) {
            Some(p) => vec![p],
            None => {
                error!(
                    "Partition {} does not exist ({} found).",
                    index,
                    partitions.len()
                );
                return;
            }
        },
        None => partitions.iter().collect(),
    };

    if req.record.is_some() || req.list_dir.is_some() {
        match selected.as_slice() {
            [p] if p.kind == PartitionType::Ntfs => inspect_ntfs(body, p, options, req),
            [p] => error!("--record and --list-dir need an NTFS partition, not {:?}", p.kind),
            _ => error!("--record and --list-dir need a single partition (use --partition)."),
        }
        return;
    }

    for (i, partition) in selected.into_iter().enumerate() {
        if !matches!(partition.kind, PartitionType::Fat32 | PartitionType::Ntfs) {
            info!("Skipping {:?} partition #{}", partition.kind, i);
            continue;
        }
        match parse_partition(body, partition, options) {
            Ok(table) if req.json_output => print_json(&table.to_json()),
            Ok(table) => println!("{}", table.to_string()),
            Err(e) => error!("Could not parse partition #{}: {}", i, e),
        }
    }
}

fn main() {
    let matches = Command::new("exhume_timeline")
        .version("0.1.0")
        .author("ForensicXlab")
        .about("Rebuild the file and directory timeline of FAT32 and NTFS volumes.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the body to exhume."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The format of the file, either 'raw' or 'ewf'."),
        )
        .arg(
            Arg::new("partitions")
                .long("partitions")
                .action(ArgAction::SetTrue)
                .help("Display the partition table and exit."),
        )
        .arg(
            Arg::new("partition")
                .short('p')
                .long("partition")
                .value_parser(value_parser!(usize))
                .conflicts_with("offset")
                .help("Only exhume the partition with this index in the table."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .requires_all(["size", "type"])
                .help("Skip the partition table: the volume starts at address (decimal or hex)."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .requires("offset")
                .help("The size of the volume in sectors (decimal or hex)."),
        )
        .arg(
            Arg::new("type")
                .short('t')
                .long("type")
                .value_parser(maybe_hex::<u8>)
                .requires("offset")
                .help("The MBR partition type of the volume (0x07 NTFS, 0x0B/0x0C FAT32)."),
        )
        .arg(
            Arg::new("record")
                .long("record")
                .value_parser(maybe_hex::<u64>)
                .help("Display the metadata of a specific MFT record."),
        )
        .arg(
            Arg::new("list_dir")
                .long("list-dir")
                .value_parser(maybe_hex::<u64>)
                .help("List the index entries of the directory with this MFT record."),
        )
        .arg(
            Arg::new("read_fat2")
                .long("read-fat2")
                .action(ArgAction::SetTrue)
                .help("Cross-check the first FAT against the second copy."),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_parser(value_parser!(String))
                .help("JSON file with parsing options."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output the tables and records in JSON format."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    // Initialize logger.
    let level_filter = match matches.get_one::<String>("log_level").map(String::as_str) {
        Some("error") => log::LevelFilter::Error,
        Some("warn") => log::LevelFilter::Warn,
        Some("debug") => log::LevelFilter::Debug,
        Some("trace") => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    let mut options = match matches.get_one::<String>("config") {
        Some(path) => match ParseOptions::from_json_file(path) {
            Ok(opts) => opts,
            Err(e) => {
                error!("Could not load options from '{}': {}", path, e);
                return;
            }
        },
        None => ParseOptions::default(),
    };
    if matches.get_flag("read_fat2") {
        options.read_fat2 = true;
    }

    let Some(file_path) = matches.get_one::<String>("body") else {
        return;
    };
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);
    let req = Request {
        partition: matches.get_one::<usize>("partition").copied(),
        show_partitions: matches.get_flag("partitions"),
        record: matches.get_one::<u64>("record").copied(),
        list_dir: matches.get_one::<u64>("list_dir").copied(),
        json_output: matches.get_flag("json"),
    };

    let mut body = Body::new(file_path.to_owned(), format);
    debug!("Created Body from '{}'", file_path);

    match (
        matches.get_one::<u64>("offset"),
        matches.get_one::<u64>("size"),
        matches.get_one::<u8>("type"),
    ) {
        (Some(offset), Some(size), Some(raw_type)) => {
            let sector_count = *size;
            let partition_size = sector_count * body.get_sector_size() as u64;
            let mut slice = match BodySlice::new(&mut body, *offset, partition_size) {
                Ok(sl) => sl,
                Err(e) => {
                    error!("Could not create BodySlice: {}", e);
                    return;
                }
            };
            let chs = ChsAddress::from_bytes(&[0, 0, 0]);
            let volume = PartitionDescriptor {
                kind: PartitionType::from(*raw_type),
                raw_type: *raw_type,
                bootable: false,
                start_chs: chs,
                end_chs: chs,
                first_sector: 0,
                first_byte_offset: 0,
                sector_count: sector_count.min(u32::MAX as u64) as u32,
            };
            exhume(&mut slice, vec![volume], &options, &req);
        }
        _ => {
            let partitions = match read_partition_table(&mut body, &options) {
                Ok(p) => p,
                Err(e) => {
                    error!("Could not read the partition table: {}", e);
                    return;
                }
            };
            exhume(&mut body, partitions, &options, &req);
        }
    }
}
