//! Point and range lookups against an existing index file.
//!
//! Grounded on `bin/bkfind.rs`'s `StructOpt` CLI shape (file argument plus
//! a query), trimmed to this engine's two query forms instead of
//! similarity search.

use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use byteorder::{ByteOrder, NativeEndian};
use structopt::StructOpt;

use bptreefs::layout::MASTER_NODE_SIZE_OFFSET;
use bptreefs::{IntegerKey, MmapCache, Tree};

#[derive(Debug, StructOpt)]
#[structopt(name = "bptree_find", about = "Look up keys in an index file")]
struct CommandLineArgs {
    #[structopt(parse(from_os_str))]
    filename: PathBuf,

    /// Single key to look up. Mutually exclusive with --from/--to.
    #[structopt(long = "key")]
    key: Option<u64>,

    #[structopt(long = "from")]
    from: Option<u64>,

    #[structopt(long = "to")]
    to: Option<u64>,
}

fn peek_cluster_size(path: &PathBuf) -> Result<usize, Box<dyn Error + 'static>> {
    let mut probe = File::open(path)?;
    probe.seek(SeekFrom::Start(MASTER_NODE_SIZE_OFFSET as u64))?;
    let mut buf = [0u8; 4];
    probe.read_exact(&mut buf)?;
    Ok(NativeEndian::read_u32(&buf) as usize)
}

fn main() -> Result<(), Box<dyn Error + 'static>> {
    env_logger::init();
    let opts = CommandLineArgs::from_args();

    let cluster_size = peek_cluster_size(&opts.filename)?;
    let backing = OpenOptions::new().read(true).write(true).open(&opts.filename)?;
    let cache = MmapCache::on(backing, cluster_size)?;
    let mut tree = Tree::<_, IntegerKey>::open(cache)?;

    match (opts.key, opts.from, opts.to) {
        (Some(key), None, None) => match tree.search(IntegerKey(key))? {
            Some(item) => println!("{}\t{}", key, item),
            None => {
                eprintln!("not found: {}", key);
                std::process::exit(1);
            }
        },
        (None, Some(from), Some(to)) => {
            let mut found = 0u64;
            for entry in tree.range(IntegerKey(from), IntegerKey(to))? {
                let (key, item) = entry?;
                println!("{}\t{}", key.0, item);
                found += 1;
            }
            eprintln!("{} entries in [{}, {}]", found, from, to);
        }
        _ => {
            eprintln!("specify either --key, or both --from and --to");
            std::process::exit(2);
        }
    }

    Ok(())
}
