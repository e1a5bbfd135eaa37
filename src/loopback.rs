/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Context, Result};
use log::*;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cleanup::Cleanup;
use crate::state::{path_str, BuildState};

#[derive(Debug, Deserialize)]
struct LoopList {
    #[serde(default)]
    loopdevices: Vec<LoopInfo>,
}

#[derive(Debug, Deserialize)]
struct LoopInfo {
    name: String,
    #[serde(rename = "back-file")]
    back_file: Option<String>,
}

/**
 * Pull the mapper device names out of "kpartx -asv" output, in the order the
 * partitions appear in the table.  Lines look like:
 *
 *   add map loop7p1 (253:0): 0 262144 linear 7:7 2048
 */
pub fn parse_kpartx_output(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|l| {
            let mut words = l.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some("add"), Some("map"), Some(name)) => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

/**
 * Given a partition mapping name such as "loop7p1", return the name of the
 * whole-disk loop device, "loop7".
 */
pub fn whole_loop_device(name: &str) -> Option<&str> {
    let (disk, part) = name.rsplit_once('p')?;
    let num = disk.strip_prefix("loop")?;

    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if digits(part) && digits(num) {
        Some(disk)
    } else {
        None
    }
}

/**
 * Attach the image to a loop device and create a mapper device for each of
 * its partitions.
 */
pub fn loopback_setup(state: &mut BuildState) -> Result<()> {
    let image = state.image_file()?.to_path_buf();
    info!("mapping partitions of {:?}", image);

    let out = state.run(&["kpartx", "-asv", path_str(&image)?])?;
    let names = parse_kpartx_output(&out);

    /*
     * The order of registration matters.  Teardown runs backwards: first the
     * image-level unmap, then each partition mapping, then the loop device.
     */
    let loop_device = match names.first() {
        Some(n) => {
            let disk = whole_loop_device(n)
                .ok_or_else(|| anyhow!("unexpected kpartx mapping name \"{}\"", n))?;
            PathBuf::from("/dev").join(disk)
        }
        None => {
            state.schedule_cleanup(Cleanup::UnmapImage(image.clone()));
            bail!("kpartx created no partition mappings for {:?}", image);
        }
    };
    let devices: Vec<PathBuf> = names
        .iter()
        .map(|n| PathBuf::from("/dev/mapper").join(n))
        .collect();

    state.loop_device = Some(loop_device.clone());
    state.schedule_cleanup(Cleanup::ReleaseLoopDevice(loop_device));
    for dev in devices.iter() {
        state.schedule_cleanup(Cleanup::ReleasePartitionMapping(dev.clone()));
    }
    state.schedule_cleanup(Cleanup::UnmapImage(image));

    if devices.len() != state.partitions.len() {
        bail!(
            "kpartx mapped {} partitions but {} were created",
            devices.len(),
            state.partitions.len()
        );
    }

    let labels = state.partitions.clone();
    for (label, dev) in labels.into_iter().zip(devices.into_iter()) {
        info!("partition {} is {:?}", label, dev);
        state.set_device(label, dev)?;
    }

    Ok(())
}

pub fn force_release_loop_device<P: AsRef<Path>>(state: &BuildState, dev: P) -> Result<()> {
    let dev = path_str(dev.as_ref())?;
    state.run_ignore_fail(&["losetup", "-d", dev])?;
    Ok(())
}

pub fn force_release_partition_mapping<P: AsRef<Path>>(state: &BuildState, dev: P) -> Result<()> {
    let dev = path_str(dev.as_ref())?;
    state.run_ignore_fail(&["dmsetup", "remove", dev])?;
    Ok(())
}

pub fn loopback_teardown<P: AsRef<Path>>(state: &BuildState, image: P) -> Result<()> {
    let image = path_str(image.as_ref())?;
    state.run(&["kpartx", "-dsv", image])?;
    Ok(())
}

/**
 * A previous run that was killed may have left the image attached to a loop
 * device.  Find any loop devices backed by this file and detach them, along
 * with their partition mappings.  Returns the number of devices released.
 */
pub fn teardown_stale<P: AsRef<Path>>(state: &BuildState, image: P) -> Result<usize> {
    let image = image.as_ref();
    let abs = if image.exists() {
        std::fs::canonicalize(image).with_context(|| anyhow!("resolving {:?}", image))?
    } else {
        std::env::current_dir()?.join(image)
    };

    let out = state.run_ignore_fail(&["losetup", "--list", "--json"])?;
    if out.trim().is_empty() {
        return Ok(0);
    }
    let list: LoopList =
        serde_json::from_str(&out).context("parsing losetup --json output")?;

    let mut count = 0;
    for li in list.loopdevices.iter() {
        let back = match &li.back_file {
            Some(b) => b.trim_end_matches(" (deleted)"),
            None => continue,
        };
        if Path::new(back) != abs {
            continue;
        }

        warn!("stale loop device {} for {:?} -- removing...", li.name, abs);
        let disk = li.name.trim_start_matches("/dev/");
        let pattern = format!("/dev/mapper/{}p*", disk);
        for ent in glob::glob(&pattern)
            .map_err(|e| anyhow!("glob {}: {}", pattern, e))?
            .flatten()
        {
            force_release_partition_mapping(state, &ent)?;
        }
        force_release_loop_device(state, &li.name)?;
        count += 1;
    }

    Ok(count)
}
