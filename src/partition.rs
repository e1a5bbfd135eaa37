/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::Result;
use log::*;
use std::fmt;

use crate::profile::{PartitionTable, Profile};
use crate::size::DiskOffset;
use crate::state::{path_str, BuildState, Label};

/*
 * Partitions start 1MiB into the disk and are separated by 1MiB gaps, which
 * keeps them aligned for every firmware we build for.
 */
const ALIGNMENT_MIB: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEnd {
    At(DiskOffset),
    Fill,
}

impl fmt::Display for PartitionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionEnd::At(o) => write!(f, "{}", o),
            PartitionEnd::Fill => write!(f, "100%"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    pub label: Label,
    pub filesystem: String,
    pub start: DiskOffset,
    pub end: PartitionEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub table: PartitionTable,
    pub partitions: Vec<PlannedPartition>,

    /*
     * 1-based index of the partition that gets the boot flag.  This is
     * always the physically first one.
     */
    pub boot_partition: usize,
}

/**
 * Lay out the firmware or EFI partition, then boot, then root filling the
 * remainder of the disk.
 */
pub fn plan(profile: &Profile) -> Result<PartitionPlan> {
    let gap = DiskOffset::mib(ALIGNMENT_MIB);
    let mut offset = gap;
    let mut partitions = Vec::new();

    for (label, spec) in profile.sized_partitions() {
        let end = offset.add(&spec.size)?;
        partitions.push(PlannedPartition {
            label,
            filesystem: spec.filesystem.clone(),
            start: offset,
            end: PartitionEnd::At(end),
        });
        offset = end.add(&gap)?;
    }

    partitions.push(PlannedPartition {
        label: Label::Root,
        filesystem: profile.root_filesystem.clone(),
        start: offset,
        end: PartitionEnd::Fill,
    });

    Ok(PartitionPlan {
        table: profile.partition_table,
        partitions,
        boot_partition: 1,
    })
}

/**
 * parted knows FAT filesystems by their FAT width, not by the mkfs name.
 */
pub fn parted_type(filesystem: &str) -> &str {
    match filesystem {
        "vfat" => "fat32",
        other => other,
    }
}

pub fn create_partition_table(state: &BuildState, table: PartitionTable) -> Result<()> {
    let image = path_str(state.image_file()?)?;
    info!("creating {} partition table on {}", table.as_str(), image);
    state.run(&["parted", "-s", image, "mklabel", table.as_str()])?;
    Ok(())
}

pub fn create_partition(state: &mut BuildState, part: &PlannedPartition) -> Result<()> {
    let image = path_str(state.image_file()?)?.to_string();
    let start = part.start.to_string();
    let end = part.end.to_string();
    info!(
        "creating {} partition ({}) from {} to {}",
        part.label, part.filesystem, start, end
    );

    state.run(&[
        "parted",
        "-s",
        &image,
        "mkpart",
        "primary",
        parted_type(&part.filesystem),
        &start,
        &end,
    ])?;
    state.partitions.push(part.label);
    Ok(())
}

pub fn set_boot_flag(state: &BuildState, partition: usize) -> Result<()> {
    let image = path_str(state.image_file()?)?;
    info!("setting boot flag on partition {}", partition);
    state.run(&[
        "parted",
        "-s",
        image,
        "set",
        &partition.to_string(),
        "boot",
        "on",
    ])?;
    Ok(())
}

/**
 * Write the whole plan to the image file.  Any failure leaves a partial table
 * behind; the image is then only good for discarding.
 */
pub fn create_partitions(state: &mut BuildState, plan: &PartitionPlan) -> Result<()> {
    create_partition_table(state, plan.table)?;
    for part in plan.partitions.iter() {
        create_partition(state, part)?;
    }
    set_boot_flag(state, plan.boot_partition)
}
