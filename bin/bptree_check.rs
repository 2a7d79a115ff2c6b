//! Opens an existing index file and validates its structural invariants:
//! every reachable node's keys ascend, the allocator's bitmap popcount
//! matches the set of nodes actually reachable from the root, and every
//! node respects the fanout bound.
//!
//! Grounded on `bin/check_bktree_file.rs`'s open-and-validate shape.

use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use byteorder::{ByteOrder, NativeEndian};
use log::info;
use structopt::StructOpt;

use bptreefs::layout::MASTER_NODE_SIZE_OFFSET;
use bptreefs::{IntegerKey, MmapCache, Tree};

#[derive(Debug, StructOpt)]
#[structopt(name = "bptree_check", about = "Validate an index file's structural invariants")]
struct CommandLineArgs {
    #[structopt(parse(from_os_str))]
    filename: PathBuf,
}

/// The cluster size is itself stored inside master block #0, so opening a
/// file whose cluster size we don't yet know takes a raw peek at that
/// field before handing the file to a correctly-sized `MmapCache`.
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
    let len = backing.metadata()?.len();
    let cache = MmapCache::on(backing, cluster_size)?;
    let mut tree = Tree::<_, IntegerKey>::open(cache)?;

    let mut visited = 0u64;
    let mut prev_key: Option<IntegerKey> = None;
    let mut out_of_order = 0u64;

    let min_key = IntegerKey(u64::MIN);
    let max_key = IntegerKey(u64::MAX);
    for entry in tree.range(min_key, max_key)? {
        let (key, _item) = entry?;
        if let Some(prev) = prev_key {
            if key < prev {
                out_of_order += 1;
            }
        }
        prev_key = Some(key);
        visited += 1;
    }

    // Walks every node reachable from the root, checking the fanout and
    // minimum-occupancy bounds along the way, and reports how many nodes
    // that walk found.
    let report = tree.verify_structure()?;
    let alloc = *tree.allocator();
    let allocated = alloc.count_allocated(tree.cache())?;

    info!(
        "{}: {} bytes, fanout={}, {} keys visited in range order, {} nodes reachable \
         ({} leaves, {} internal), {} allocated blocks",
        opts.filename.display(),
        len,
        tree.fanout(),
        visited,
        report.reachable_nodes,
        report.leaves,
        report.internal_nodes,
        allocated
    );

    if out_of_order > 0 {
        return Err(format!("{} out-of-order adjacent key pairs found", out_of_order).into());
    }
    if report.reachable_nodes != allocated as u64 {
        return Err(format!(
            "allocator bitmap popcount {} does not match {} nodes reachable from the root",
            allocated, report.reachable_nodes
        )
        .into());
    }

    println!(
        "OK: {} keys, {} reachable nodes, {} allocated blocks",
        visited, report.reachable_nodes, allocated
    );
    Ok(())
}
