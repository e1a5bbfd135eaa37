/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use log::*;
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

/**
 * The newest modification time of a file, or of anything beneath a
 * directory.  None if the path does not exist or cannot be read.
 */
pub fn newest_mtime<P: AsRef<Path>>(p: P) -> Option<SystemTime> {
    let p = p.as_ref();

    let md = std::fs::metadata(p).ok()?;
    if !md.is_dir() {
        return md.modified().ok();
    }

    WalkDir::new(p)
        .into_iter()
        .filter_map(|ent| ent.ok())
        .filter_map(|ent| ent.metadata().ok())
        .filter_map(|md| md.modified().ok())
        .max()
}

/**
 * Decide whether the stage producing "target" can be skipped: it can if we
 * are not forced to rebuild, the target exists, and nothing it was built from
 * has changed since.  Dependencies that do not exist are never newer.
 */
pub fn should_skip_step<P, D>(force: bool, target: P, dependencies: &[D]) -> bool
where
    P: AsRef<Path>,
    D: AsRef<Path>,
{
    let target = target.as_ref();

    if force {
        return false;
    }

    let target_mtime = match std::fs::metadata(target).and_then(|md| md.modified()) {
        Ok(t) => t,
        Err(_) => return false,
    };

    for dep in dependencies.iter() {
        let dep = dep.as_ref();
        if let Some(t) = newest_mtime(dep) {
            if t > target_mtime {
                info!("{:?} is newer than {:?}", dep, target);
                return false;
            }
        }
    }

    true
}
