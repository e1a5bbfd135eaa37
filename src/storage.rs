/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{bail, Result};
use log::*;
use std::path::{Path, PathBuf};

use crate::cleanup::Cleanup;
use crate::size::DiskSize;
use crate::state::{path_str, BuildState};

/*
 * Usage thresholds for the rebalance passes, lowest first so that nearly
 * empty chunks are reclaimed cheaply before the more expensive passes.
 */
const BALANCE_THRESHOLDS: &[u32] = &[0, 20, 40, 60, 80];

pub fn extra_storage_file<P: AsRef<Path>>(image: P) -> PathBuf {
    let mut s = image.as_ref().as_os_str().to_owned();
    s.push(".extra");
    PathBuf::from(s)
}

/**
 * Give a btrfs root some room to breathe during the bulk package install by
 * adding a temporary, file-backed second device to it.  Other filesystems are
 * left alone.
 */
pub fn setup_extra_storage(state: &mut BuildState, fstype: &str, size: DiskSize) -> Result<()> {
    if fstype != "btrfs" {
        info!("no extra storage needed for {} root", fstype);
        return Ok(());
    }

    let mount_point = state.mount_point()?.to_path_buf();
    let file = extra_storage_file(state.image_file()?);
    let f = path_str(&file)?;
    info!("adding {} of extra storage from {}", size, f);

    state.run(&["qemu-img", "create", "-f", "raw", f, &size.to_string()])?;
    state.schedule_cleanup(Cleanup::RemoveFile(file.clone()));

    let out = state.run(&["losetup", "--show", "--find", f])?;
    let loop_device = out.trim();
    if loop_device.is_empty() {
        bail!("losetup did not report a loop device for {}", f);
    }
    let loop_device = PathBuf::from(loop_device);
    state.schedule_cleanup(Cleanup::ReleaseLoopDevice(loop_device.clone()));

    state.run(&[
        "btrfs",
        "device",
        "add",
        path_str(&loop_device)?,
        path_str(&mount_point)?,
    ])?;

    state.schedule_cleanup(Cleanup::DetachExtraStorage {
        mount_point,
        loop_device,
    });
    Ok(())
}

fn balance(state: &BuildState, mount_point: &str) -> Result<()> {
    for usage in BALANCE_THRESHOLDS.iter() {
        for kind in ["-musage", "-dusage"].iter() {
            state.run_ignore_fail(&[
                "btrfs",
                "balance",
                "start",
                &format!("{}={}", kind, usage),
                mount_point,
            ])?;
        }
    }
    Ok(())
}

/**
 * Move everything off the extra device, drop it from the filesystem, and
 * compact what is left.  The loop device and its backing file are released
 * by the cleanups registered when they were created, which run next.
 */
pub fn cleanup_extra_storage<P: AsRef<Path>>(
    state: &BuildState,
    mount_point: P,
    loop_device: P,
) -> Result<()> {
    let mount_point = path_str(mount_point.as_ref())?;
    let loop_device = path_str(loop_device.as_ref())?;

    info!("removing extra storage {} from {}", loop_device, mount_point);
    balance(state, mount_point)?;
    state.run_ignore_fail(&["btrfs", "balance", "start", "-mconvert=dup", mount_point])?;
    state.run(&["btrfs", "device", "remove", loop_device, mount_point])?;
    balance(state, mount_point)
}
