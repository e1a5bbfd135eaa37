/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, Context, Result};
use log::*;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub mod builder;
pub mod cleanup;
pub mod ensure;
pub mod exec;
pub mod install;
pub mod loopback;
pub mod mount;
pub mod partition;
pub mod pipeline;
pub mod profile;
pub mod size;
pub mod skip;
pub mod state;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use builder::{BuildArgs, ImageBuilder};
pub use cleanup::Cleanup;
pub use exec::{Executor, HostExecutor, Invocation};
pub use profile::Profile;
pub use size::{DiskOffset, DiskSize};
pub use state::{BuildState, Label};

use state::path_str;

/**
 * Append a suffix to the final component of a path, keeping any existing
 * extension: "x.img" becomes "x.img.temp".
 */
pub fn with_suffix<P: AsRef<Path>>(p: P, suffix: &str) -> PathBuf {
    let mut s = p.as_ref().as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/**
 * Where the artifact of a failed build is left, so that it never takes the
 * place of a good image from an earlier run.
 */
pub fn failed_path<P: AsRef<Path>>(p: P) -> PathBuf {
    with_suffix(p, ".failed")
}

fn destination(state: &BuildState, to: &Path) -> PathBuf {
    if state.success {
        to.to_path_buf()
    } else {
        failed_path(to)
    }
}

/**
 * Create an empty sparse raw image and make it the image being built.  Loop
 * devices and files left over from an earlier, killed run are removed first.
 */
pub fn create_image<P: AsRef<Path>>(state: &mut BuildState, image: P, size: DiskSize) -> Result<()> {
    let image = image.as_ref();

    let stale = loopback::teardown_stale(state, image)?;
    if stale > 0 {
        warn!("released {} stale loop devices for {:?}", stale, image);
    }
    if ensure::removed(image)? {
        warn!("removed stale image {:?}", image);
    }

    info!("creating image {:?} of size {}", image, size);
    state.run(&["qemu-img", "create", "-f", "raw", path_str(image)?, &size.to_string()])?;
    state.image_file = Some(image.to_path_buf());
    Ok(())
}

/**
 * Build next to the final image, under a temporary name.  Teardown moves the
 * result into place once everything else has been released.
 */
pub fn create_temp_image<P: AsRef<Path>>(state: &mut BuildState, image: P, size: DiskSize) -> Result<()> {
    let image = image.as_ref();
    let temp = with_suffix(image, ".temp");

    create_image(state, &temp, size)?;
    state.schedule_cleanup(Cleanup::MoveImage {
        from: temp,
        to: image.to_path_buf(),
    });
    Ok(())
}

/**
 * Build inside a tmpfs sized to hold the image and anything created next to
 * it.  Teardown copies the result out, then releases the tmpfs.
 */
pub fn create_ram_directory_image<P: AsRef<Path>>(
    state: &mut BuildState,
    image: P,
    size: DiskSize,
    tmpfs_size: DiskSize,
) -> Result<()> {
    let image = image.as_ref();
    let name = image
        .file_name()
        .ok_or_else(|| anyhow!("image path {:?} has no file name", image))?;

    let dir = state.temp_root.join(format!(
        "image-builder-ram-{}",
        &Uuid::new_v4().as_hyphenated().to_string()[0..8]
    ));
    std::fs::create_dir(&dir).with_context(|| anyhow!("creating {:?}", dir))?;
    state.schedule_cleanup(Cleanup::RemoveDirectory(dir.clone()));

    info!("building in RAM: tmpfs of size {} at {:?}", tmpfs_size, dir);
    state.run(&[
        "mount",
        "-o",
        &format!("size={}", tmpfs_size),
        "-t",
        "tmpfs",
        "tmpfs",
        path_str(&dir)?,
    ])?;
    state.schedule_cleanup(Cleanup::Unmount {
        device: Some("tmpfs".to_string()),
        mount_point: dir.clone(),
        ignore_fail: false,
    });

    let ram_image = dir.join(name);
    create_image(state, &ram_image, size)?;
    state.schedule_cleanup(Cleanup::CopyImage {
        from: ram_image,
        to: image.to_path_buf(),
    });
    Ok(())
}

pub fn move_image<P: AsRef<Path>>(state: &BuildState, from: P, to: P) -> Result<()> {
    let from = from.as_ref();
    let to = destination(state, to.as_ref());

    info!("moving {:?} -> {:?}", from, to);
    state.run(&["mv", path_str(from)?, path_str(&to)?])?;
    Ok(())
}

pub fn copy_image<P: AsRef<Path>>(state: &BuildState, from: P, to: P) -> Result<()> {
    let from = from.as_ref();
    let to = destination(state, to.as_ref());

    info!("copying {:?} -> {:?}", from, to);
    state.run(&["cp", "--sparse=always", path_str(from)?, path_str(&to)?])?;
    Ok(())
}
