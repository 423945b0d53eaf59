use std::env;

use anyhow::{Context, Result};
use pid_dir_lock::lock_until_dropped;

fn main() -> Result<()> {
    let directory = env::args()
        .nth(1)
        .context("usage: pid_dir_lock <directory>")?;

    let lock = lock_until_dropped(&directory)?;
    // While `lock` is in scope, no other process following the protocol
    // will claim the directory.
    println!("locked {} via {}", directory, lock.pid_path().display());

    Ok(())
}
