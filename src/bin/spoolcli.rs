//! Interactive shell over a sealpool secure object pool: allocate, read,
//! write and free objects, run transactional batches and inspect stats.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;
use nom::branch::alt;
use nom::character::complete::{digit1, multispace0, multispace1};
use nom::combinator::{all_consuming, map, map_res, rest};
use nom::bytes::complete::tag;
use nom::sequence::preceded;
use nom::{IResult, Parser as NomParser};

use sealpool::{PoolConfig, PoolPaths, SecurePool};

#[derive(Parser)]
#[command(
    name = "spoolcli",
    about = "Interactive data store over a sealpool secure object pool"
)]
struct Cli {
    /// Pool file path; manifest, counter and metadata-log files derive
    /// their names from it
    pool: PathBuf,

    /// Create a fresh pool instead of opening an existing one
    #[arg(long)]
    create: bool,

    /// Pool size in MiB when creating
    #[arg(long, default_value_t = 64)]
    pool_size_mb: u64,

    /// Hex-encoded 16-byte AEAD key. The default is a benchmark key;
    /// production deployments should source it from an attestation channel.
    #[arg(long, default_value = "30313233343536373839303132333435")]
    key: String,
}

#[derive(Debug)]
enum Command {
    Alloc(u64),
    Put(u64, Vec<u8>),
    Get(u64),
    Free(u64),
    Root(u64),
    TxPut(u64, Vec<u8>),
    Stats,
    Objects,
    Help,
    Quit,
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>()).parse(input)
}

fn arg_number<'a>(keyword: &'static str) -> impl NomParser<&'a str, Output = u64, Error = nom::error::Error<&'a str>> {
    preceded((tag(keyword), multispace1), number)
}

fn payload(input: &str) -> IResult<&str, Vec<u8>> {
    map(preceded(multispace1, rest), |s: &str| s.as_bytes().to_vec()).parse(input)
}

fn parse_command(input: &str) -> Result<Command, String> {
    let result: IResult<&str, Command> = all_consuming(preceded(
        multispace0,
        alt((
            map((tag("txput"), multispace1, number, payload), |(_, _, off, data)| {
                Command::TxPut(off, data)
            }),
            map((tag("put"), multispace1, number, payload), |(_, _, off, data)| {
                Command::Put(off, data)
            }),
            map(arg_number("alloc"), Command::Alloc),
            map(arg_number("get"), Command::Get),
            map(arg_number("free"), Command::Free),
            map(arg_number("root"), Command::Root),
            map(tag("stats"), |_| Command::Stats),
            map(tag("objects"), |_| Command::Objects),
            map(tag("help"), |_| Command::Help),
            map(tag("quit"), |_| Command::Quit),
        )),
    ))
    .parse(input.trim());
    match result {
        Ok((_, cmd)) => Ok(cmd),
        Err(_) => Err(format!("unrecognized command: {}", input.trim())),
    }
}

fn parse_key(hex: &str) -> Result<[u8; 16], String> {
    if hex.len() != 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("key must be 32 hex characters (16 bytes)".to_string());
    }
    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).expect("validated hex");
    }
    Ok(key)
}

fn print_help() {
    println!("commands:");
    println!("  alloc <size>        allocate a zeroed object, print its offset");
    println!("  put <off> <bytes>   overwrite an object with the given bytes");
    println!("  txput <off> <bytes> same, but transactionally with an undo snapshot");
    println!("  get <off>           read and print an object");
    println!("  free <off>          free an object");
    println!("  root <size>         get or create the root object");
    println!("  objects             count of live objects");
    println!("  stats               operation statistics as JSON");
    println!("  help | quit");
}

fn execute(pool: &SecurePool, cmd: Command) -> Result<bool, sealpool::Error> {
    match cmd {
        Command::Alloc(size) => {
            let oid = pool.zalloc(size)?;
            println!("allocated {} bytes at {:#x}", size, oid.offset);
        }
        Command::Put(off, data) => {
            let oid = pool.oid(off);
            let size = pool
                .object_size(oid)
                .ok_or_else(|| sealpool::Error::Other(format!("no object at {off:#x}")))?;
            let mut image = vec![0u8; size as usize];
            let n = data.len().min(image.len());
            image[..n].copy_from_slice(&data[..n]);
            pool.write(oid, &image)?;
            println!("wrote {n} bytes at {off:#x}");
        }
        Command::TxPut(off, data) => {
            let oid = pool.oid(off);
            let size = pool
                .object_size(oid)
                .ok_or_else(|| sealpool::Error::Other(format!("no object at {off:#x}")))?;
            let n = data.len().min(size as usize);
            let mut tx = pool.tx_begin()?;
            tx.add_range(oid, 0, n)?;
            tx.write_part(oid, 0, &data[..n])?;
            tx.commit()?;
            println!("committed {n} bytes at {off:#x}");
        }
        Command::Get(off) => match pool.read(pool.oid(off))? {
            Some(data) => {
                println!("{} bytes: {}", data.len(), String::from_utf8_lossy(&data));
            }
            None => println!("no object at {off:#x}"),
        },
        Command::Free(off) => {
            pool.free(pool.oid(off))?;
            println!("freed {off:#x}");
        }
        Command::Root(size) => {
            let oid = pool.root(size)?;
            println!("root object at {:#x}", oid.offset);
        }
        Command::Objects => println!("{} live objects", pool.live_objects()),
        Command::Stats => println!(
            "{}",
            serde_json::to_string_pretty(&pool.stats_json()).expect("stats render")
        ),
        Command::Help => print_help(),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn main() {
    let cli = Cli::parse();
    let key = match parse_key(&cli.key) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let paths = PoolPaths::derive(&cli.pool);
    let config = PoolConfig {
        pool_size: cli.pool_size_mb * 1024 * 1024,
        ..PoolConfig::default()
    };
    let pool = if cli.create {
        SecurePool::create(&paths, &config, &key)
    } else {
        SecurePool::open(&paths, &config, &key)
    };
    let pool = match pool {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    println!("pool {:#x} ready; type 'help' for commands", pool.pool_id());
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("error: {e}");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(cmd) => match execute(&pool, cmd) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => eprintln!("error: {e}"),
            },
            Err(e) => eprintln!("{e}"),
        }
    }

    if let Err(e) = pool.close() {
        eprintln!("error closing pool: {e}");
        process::exit(1);
    }
}
