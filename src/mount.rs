/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Context, Result};
use log::*;
use std::path::Path;
use uuid::Uuid;

use crate::cleanup::Cleanup;
use crate::profile::Profile;
use crate::state::{path_str, BuildState, Label};

/*
 * Host filesystems made visible inside the target while it is configured,
 * with the path each appears at relative to the root mount point.
 */
const BIND_MOUNTS: &[(&str, &str)] = &[
    ("/dev", "dev"),
    ("/dev/pts", "dev/pts"),
    ("/proc", "proc"),
    ("/sys", "sys"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSource<'s> {
    Partition(Label),
    Bind(&'s str),
}

pub fn create_filesystem<P: AsRef<Path>>(state: &BuildState, device: P, fstype: &str) -> Result<()> {
    let device = path_str(device.as_ref())?;

    info!("creating {} filesystem on {}", fstype, device);
    state.run(&["mkfs", "-t", fstype, device])?;

    /*
     * Make sure udev has seen the new filesystem before anything asks blkid
     * for its UUID.
     */
    state.run(&["udevadm", "trigger", device])?;
    state.run(&["udevadm", "settle"])?;
    Ok(())
}

/**
 * Create a filesystem on every mapped partition, using the type the profile
 * asks for.
 */
pub fn create_filesystems(state: &BuildState, profile: &Profile) -> Result<()> {
    for label in state.partitions.iter() {
        let fstype = profile
            .filesystem(*label)
            .ok_or_else(|| anyhow!("no filesystem type for partition {}", label))?;
        create_filesystem(state, state.device(*label)?, fstype)?;
    }
    Ok(())
}

/**
 * Mount a partition or bind-mount a host path.  With no sub-path this is the
 * root mount, which goes on a fresh directory under the temporary root;
 * everything else is mounted beneath it.
 */
pub fn mount_filesystem(
    state: &mut BuildState,
    source: MountSource,
    sub: Option<&str>,
) -> Result<()> {
    let (key, device, bind) = match source {
        MountSource::Partition(label) => (
            label.as_str().to_string(),
            path_str(state.device(label)?)?.to_string(),
            false,
        ),
        MountSource::Bind(src) => (src.to_string(), src.to_string(), true),
    };

    let mount_point = match sub {
        None => {
            if state.mount_point.is_some() {
                bail!("root filesystem is already mounted");
            }

            let dir = state.temp_root.join(format!(
                "image-builder-{}",
                &Uuid::new_v4().as_hyphenated().to_string()[0..8]
            ));
            std::fs::create_dir(&dir).with_context(|| anyhow!("creating {:?}", dir))?;
            state.schedule_cleanup(Cleanup::RemoveDirectory(dir.clone()));
            dir
        }
        Some(sub) => {
            let mp = state.path_in_mount(sub)?;
            std::fs::create_dir_all(&mp).with_context(|| anyhow!("creating {:?}", mp))?;
            mp
        }
    };

    info!("mounting {} on {:?}", device, mount_point);
    let mut args = vec![
        "mount".to_string(),
        device.clone(),
        path_str(&mount_point)?.to_string(),
    ];
    if bind {
        args.push("-o".to_string());
        args.push("bind".to_string());
    }
    state.run(&args)?;

    if sub.is_none() {
        state.mount_point = Some(mount_point.clone());
    }
    state
        .sub_mount_points
        .insert(key, sub.map(str::to_string));
    state.schedule_cleanup(Cleanup::Unmount {
        device: Some(device),
        mount_point,
        ignore_fail: false,
    });
    Ok(())
}

/**
 * Mount root, then boot, then the firmware or EFI partition, so that each
 * lands inside the one before it.
 */
pub fn mount_partitions(state: &mut BuildState) -> Result<()> {
    let order = [Label::Root, Label::Boot, Label::Firmware, Label::Efi];
    for label in order.iter() {
        if state.partitions.contains(label) {
            mount_filesystem(state, MountSource::Partition(*label), label.mount_subdir())?;
        }
    }
    Ok(())
}

/**
 * Bind-mount the host's device and kernel filesystems into the target so
 * that package scripts run in the chroot work.
 */
pub fn mount_additional_filesystems(state: &mut BuildState) -> Result<()> {
    for (src, sub) in BIND_MOUNTS.iter() {
        mount_filesystem(state, MountSource::Bind(src), Some(sub))?;
    }

    /*
     * Runs before any of the bind mounts are released, as processes left
     * behind by package scripts keep /dev/pts busy.
     */
    let mp = state.mount_point()?.to_path_buf();
    state.schedule_cleanup(Cleanup::KillProcesses(mp));
    Ok(())
}

pub fn unmount_filesystem<P: AsRef<Path>>(
    state: &BuildState,
    device: Option<&str>,
    mount_point: P,
    ignore_fail: bool,
) -> Result<()> {
    let mount_point = path_str(mount_point.as_ref())?;

    info!(
        "unmounting {} from {}",
        device.unwrap_or("filesystem"),
        mount_point
    );
    if ignore_fail {
        state.run_ignore_fail(&["umount", mount_point])?;
    } else {
        state.run(&["umount", mount_point])?;
    }
    Ok(())
}

/**
 * Kill anything still using the mounted target.  A single pass is not always
 * enough, as a process can be spawned while the first pass runs.
 */
pub fn process_cleanup<P: AsRef<Path>>(state: &BuildState, mount_point: P) -> Result<()> {
    let mount_point = path_str(mount_point.as_ref())?;

    for _ in 0..2 {
        state.run_ignore_fail(&["fuser", "-mvk", mount_point])?;
    }
    Ok(())
}
