/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, Context, Result};
use log::*;
use std::fs::{self, Metadata};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/**
 * Return the metadata for a path, or None if nothing exists there.  Symbolic
 * links are not followed.
 */
pub fn check<P: AsRef<Path>>(p: P) -> Result<Option<Metadata>> {
    let p = p.as_ref();

    match fs::symlink_metadata(p) {
        Ok(md) => Ok(Some(md)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow!("checking {:?}: {}", p, e)),
    }
}

/**
 * Make sure a file is not present.  Returns true if something was removed.
 */
pub fn removed<P: AsRef<Path>>(p: P) -> Result<bool> {
    let p = p.as_ref();

    match fs::remove_file(p) {
        Ok(()) => {
            info!("removed {:?}", p);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(anyhow!("removing {:?}: {}", p, e)),
    }
}

/**
 * Make sure an empty directory is not present.  A directory that still has
 * contents is an error, as it likely means something is still mounted there.
 */
pub fn removed_dir<P: AsRef<Path>>(p: P) -> Result<bool> {
    let p = p.as_ref();

    match fs::remove_dir(p) {
        Ok(()) => {
            info!("removed directory {:?}", p);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(anyhow!("removing directory {:?}: {}", p, e)),
    }
}

pub fn directory<P: AsRef<Path>>(p: P, mode: u32) -> Result<()> {
    let p = p.as_ref();

    fs::create_dir_all(p).with_context(|| anyhow!("creating directory {:?}", p))?;
    perms(p, mode)
}

pub fn perms<P: AsRef<Path>>(p: P, mode: u32) -> Result<()> {
    let p = p.as_ref();

    let md = fs::metadata(p).with_context(|| anyhow!("stat {:?}", p))?;
    if md.permissions().mode() & 0o7777 != mode {
        info!("chmod {:?} {:o}", p, mode);
        fs::set_permissions(p, fs::Permissions::from_mode(mode))
            .with_context(|| anyhow!("chmod {:?}", p))?;
    }
    Ok(())
}

/**
 * Write a file with exactly these contents and this mode, creating any
 * missing parent directories.
 */
pub fn filestr<P: AsRef<Path>>(contents: &str, dst: P, mode: u32) -> Result<()> {
    let dst = dst.as_ref();

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| anyhow!("creating directory {:?}", parent))?;
    }

    let same = match fs::read(dst) {
        Ok(existing) => existing == contents.as_bytes(),
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(anyhow!("reading {:?}: {}", dst, e)),
    };
    if !same {
        info!("writing {:?}", dst);
        fs::write(dst, contents).with_context(|| anyhow!("writing {:?}", dst))?;
    }

    perms(dst, mode)
}
