use std::fs;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use osdemu_proto::build::CdbBuilder;
use osdemu_proto::defs::{ROOT_INFO_PG, USER_INFO_PG, riap, status, uiap};
use osdemu_proto::endian::get_u64;
use osdemu_proto::list::parse_retrieved;
use osdemu_proto::sense::{sense_asc, sense_key};
use osdemu_target::{SubmitResult, Target, TargetOptions};

#[derive(Debug, Clone, Parser)]
#[command(name = "osdutil", about = "Exercise and inspect an osdemu target root")]
pub struct Args {
    /// Target root directory
    #[arg(short, long)]
    root: PathBuf,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Command {
    /// Format the OSD (wipes everything under the root)
    Format,
    /// Print the root information page
    Info,
    /// Create a partition
    Mkpart {
        /// Requested partition id; 0 lets the target choose
        #[arg(default_value_t = 0x10000)]
        pid: u64,
    },
    /// Create an empty user object
    Create { pid: u64, oid: u64 },
    /// Write a local file into an object (creates it)
    Write {
        pid: u64,
        oid: u64,
        input: PathBuf,
    },
    /// Read an object into a local file
    Read {
        pid: u64,
        oid: u64,
        output: PathBuf,
    },
    /// List partitions (pid 0) or the objects of a partition
    Ls {
        #[arg(default_value_t = 0)]
        pid: u64,
    },
    /// Remove a user object
    Rm { pid: u64, oid: u64 },
    /// Set one attribute from a string value
    Setattr {
        pid: u64,
        oid: u64,
        page: u32,
        number: u32,
        value: String,
    },
    /// Print one attribute
    Getattr {
        pid: u64,
        oid: u64,
        page: u32,
        number: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Warn
        })
        .init()
        .unwrap();

    let target = Target::open(TargetOptions::new(&args.root))
        .with_context(|| format!("opening target root {}", args.root.display()))?;

    match args.cmd {
        Command::Format => {
            check(target.submit_built(CdbBuilder::format_osd(0)))?;
            println!("formatted {}", args.root.display());
        }
        Command::Info => {
            let data_in = check(target.submit_built(
                CdbBuilder::get_attributes(0, 0).get_attr_list(
                    &[
                        (ROOT_INFO_PG, riap::VENDOR_IDENTIFICATION),
                        (ROOT_INFO_PG, riap::PRODUCT_IDENTIFICATION),
                        (ROOT_INFO_PG, riap::PRODUCT_MODEL),
                        (ROOT_INFO_PG, riap::TOTAL_CAPACITY),
                        (ROOT_INFO_PG, riap::USED_CAPACITY),
                        (ROOT_INFO_PG, riap::NUMBER_OF_PARTITIONS),
                    ],
                    4096,
                ),
            ))?;
            for entry in parse_retrieved(&data_in)? {
                match entry.number {
                    riap::TOTAL_CAPACITY | riap::USED_CAPACITY | riap::NUMBER_OF_PARTITIONS => {
                        println!("attr {:#x}: {}", entry.number, get_u64(entry.value, 0));
                    }
                    _ => println!(
                        "attr {:#x}: {}",
                        entry.number,
                        String::from_utf8_lossy(entry.value).trim_end_matches('\0')
                    ),
                }
            }
        }
        Command::Mkpart { pid } => {
            check(target.submit_built(CdbBuilder::create_partition(pid)))?;
            println!("created partition {pid:#x}");
        }
        Command::Create { pid, oid } => {
            check(target.submit_built(CdbBuilder::create(pid, oid, 1)))?;
            println!("created object ({pid:#x}, {oid:#x})");
        }
        Command::Write { pid, oid, input } => {
            let data = fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let len = data.len();
            check(target.submit_built(CdbBuilder::create_and_write(pid, oid, 0, data)))?;
            println!("wrote {len} bytes to ({pid:#x}, {oid:#x})");
        }
        Command::Read { pid, oid, output } => {
            let data_in = check(target.submit_built(
                CdbBuilder::get_attributes(pid, oid)
                    .get_attr_list(&[(USER_INFO_PG, uiap::LOGICAL_LEN)], 64),
            ))?;
            let len = get_u64(parse_retrieved(&data_in)?[0].value, 0);
            let data_in = check(target.submit_built(CdbBuilder::read(pid, oid, 0, len)))?;
            fs::write(&output, &data_in)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("read {len} bytes from ({pid:#x}, {oid:#x})");
        }
        Command::Ls { pid } => {
            let data_in = check(target.submit_built(CdbBuilder::list(pid, 0, 1 << 20, 0)))?;
            let count = (data_in.len() - 24) / 8;
            for i in 0..count {
                println!("{:#x}", get_u64(&data_in, 24 + i * 8));
            }
            log::debug!("{count} ids, continuation {:#x}", get_u64(&data_in, 8));
        }
        Command::Rm { pid, oid } => {
            check(target.submit_built(CdbBuilder::remove(pid, oid)))?;
            println!("removed ({pid:#x}, {oid:#x})");
        }
        Command::Setattr {
            pid,
            oid,
            page,
            number,
            value,
        } => {
            check(target.submit_built(
                CdbBuilder::set_attributes(pid, oid)
                    .set_attr_list(&[(page, number, value.as_bytes())]),
            ))?;
        }
        Command::Getattr {
            pid,
            oid,
            page,
            number,
        } => {
            let data_in = check(target.submit_built(
                CdbBuilder::get_attributes(pid, oid).get_attr_list(&[(page, number)], 1 << 16),
            ))?;
            for entry in parse_retrieved(&data_in)? {
                println!("{:02x?}", entry.value);
            }
        }
    }

    target.close()?;
    Ok(())
}

/// Turn a CHECK CONDITION response into an error; recovered errors pass
/// with their data.
fn check(result: SubmitResult) -> anyhow::Result<Vec<u8>> {
    if result.status == status::GOOD || sense_key(&result.sense) == Some(0x01) {
        return Ok(result.data_in);
    }
    bail!(
        "command failed: sense key {:#04x?} asc {:#06x?}",
        sense_key(&result.sense),
        sense_asc(&result.sense)
    )
}

/// Small convenience so every subcommand reads as one line.
trait SubmitBuilt {
    fn submit_built(&self, builder: CdbBuilder) -> SubmitResult;
}

impl SubmitBuilt for Target {
    fn submit_built(&self, builder: CdbBuilder) -> SubmitResult {
        let (cdb, data_out) = builder.finish();
        self.submit(&cdb, &data_out)
    }
}
