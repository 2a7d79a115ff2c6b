//! Builds a fresh index file from newline-delimited `key,item` pairs.
//!
//! Grounded on `bin/bktree_from_ints.rs`'s line-oriented stdin-style
//! ingestion and `bin/bkfile_from_ints.rs`'s "build in RAM, render to a
//! fresh backing file" shape, adapted to build directly against the
//! on-disk tree rather than staging an in-RAM structure first.

use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use log::info;
use structopt::StructOpt;

use bptreefs::{IntegerKey, MmapCache, Tree, TreeConfig, UpdatePolicy};

#[derive(Debug, StructOpt)]
#[structopt(name = "bptree_build", about = "Build an index file from key,item lines")]
struct CommandLineArgs {
    #[structopt(parse(from_os_str))]
    input_filename: PathBuf,

    #[structopt(parse(from_os_str))]
    output_filename: PathBuf,

    #[structopt(long = "cluster-size", default_value = "4096")]
    cluster_size: usize,

    #[structopt(long = "fail-on-duplicate")]
    fail_on_duplicate: bool,
}

fn main() -> Result<(), Box<dyn Error + 'static>> {
    env_logger::init();
    let opts = CommandLineArgs::from_args();

    let backing = File::create(&opts.output_filename)?;
    let cache = MmapCache::on(backing, opts.cluster_size)?;
    let mut tree = Tree::<_, IntegerKey>::create(
        cache,
        TreeConfig {
            cluster_size: opts.cluster_size,
            ..Default::default()
        },
    )?;

    let policy = if opts.fail_on_duplicate {
        UpdatePolicy::FailIfExists
    } else {
        UpdatePolicy::Replace
    };

    let lines = BufReader::new(File::open(&opts.input_filename)?).lines();
    let mut count = 0u64;
    for line in lines {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ',');
        let key: u64 = parts
            .next()
            .ok_or("missing key field")?
            .trim()
            .parse()?;
        let item: u32 = parts
            .next()
            .ok_or("missing item field")?
            .trim()
            .parse()?;
        let outcome = tree.insert(IntegerKey(key), item, policy)?;
        if outcome == bptreefs::InsertOutcome::Duplicate {
            return Err(format!("duplicate key {} at input line {}", key, count + 1).into());
        }
        count += 1;
    }

    tree.close()?;
    info!(
        "built {} with {} entries (cluster_size={})",
        opts.output_filename.display(),
        count,
        opts.cluster_size
    );
    Ok(())
}
