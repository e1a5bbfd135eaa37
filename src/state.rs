/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::cleanup::Cleanup;
use crate::exec::{Executor, Invocation};

/**
 * The partitions an image can carry.  The EFI system partition occupies the
 * same slot as the firmware partition; a profile has at most one of the two.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Firmware,
    Efi,
    Boot,
    Root,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Firmware => "firmware",
            Label::Efi => "efi",
            Label::Boot => "boot",
            Label::Root => "root",
        }
    }

    /**
     * Where this partition is mounted, relative to the root mount point.  The
     * root partition itself has no sub-path.
     */
    pub fn mount_subdir(&self) -> Option<&'static str> {
        match self {
            Label::Firmware => Some("boot/firmware"),
            Label::Efi => Some("boot/efi"),
            Label::Boot => Some("boot"),
            Label::Root => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn path_str(p: &Path) -> Result<&str> {
    p.to_str()
        .ok_or_else(|| anyhow!("path {:?} is not valid UTF-8", p))
}

/**
 * Everything one image build has acquired so far.  A fresh BuildState is
 * created for each image and discarded once its cleanup stack has run.
 */
pub struct BuildState<'a> {
    exec: &'a dyn Executor,

    /*
     * Directory under which temporary mount points are created.
     */
    pub temp_root: PathBuf,

    pub image_file: Option<PathBuf>,
    pub partitions: Vec<Label>,
    pub devices: BTreeMap<Label, PathBuf>,
    pub loop_device: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,

    /*
     * Keyed by partition label, or by source path for bind mounts.  The value
     * is the path relative to the root mount point; None for root itself.
     */
    pub sub_mount_points: BTreeMap<String, Option<String>>,

    pub cleanup: Vec<Cleanup>,
    pub success: bool,
}

impl<'a> BuildState<'a> {
    pub fn new<P: AsRef<Path>>(exec: &'a dyn Executor, temp_root: P) -> BuildState<'a> {
        BuildState {
            exec,
            temp_root: temp_root.as_ref().to_path_buf(),
            image_file: None,
            partitions: Vec::new(),
            devices: BTreeMap::new(),
            loop_device: None,
            mount_point: None,
            sub_mount_points: BTreeMap::new(),
            cleanup: Vec::new(),
            success: true,
        }
    }

    pub fn execute(&self, inv: &Invocation) -> Result<String> {
        self.exec.execute(inv)
    }

    pub fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        self.exec.execute(&Invocation::new(args))
    }

    pub fn run_ignore_fail<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        self.exec.execute(&Invocation::new(args).ignore_fail())
    }

    pub fn run_in_chroot<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        self.execute_in_chroot(Invocation::new(args))
    }

    pub fn execute_in_chroot(&self, inv: Invocation) -> Result<String> {
        let root = path_str(self.mount_point()?)?.to_string();
        self.exec.execute(&inv.in_chroot(root))
    }

    pub fn image_file(&self) -> Result<&Path> {
        self.image_file
            .as_deref()
            .ok_or_else(|| anyhow!("no image file has been created"))
    }

    pub fn loop_device(&self) -> Result<&Path> {
        self.loop_device
            .as_deref()
            .ok_or_else(|| anyhow!("image is not attached to a loop device"))
    }

    pub fn mount_point(&self) -> Result<&Path> {
        self.mount_point
            .as_deref()
            .ok_or_else(|| anyhow!("root filesystem is not mounted"))
    }

    pub fn device(&self, label: Label) -> Result<&Path> {
        self.devices
            .get(&label)
            .map(|p| p.as_path())
            .ok_or_else(|| anyhow!("no device mapped for partition {}", label))
    }

    /**
     * Record the block device for a partition.  Only partitions that were
     * actually created can have a device.
     */
    pub fn set_device<P: AsRef<Path>>(&mut self, label: Label, dev: P) -> Result<()> {
        if !self.partitions.contains(&label) {
            bail!("partition {} was never created", label);
        }
        self.devices.insert(label, dev.as_ref().to_path_buf());
        Ok(())
    }

    /**
     * Translate a path inside the target system into a path on the build
     * host.  Leading "/" and any "." or ".." components are ignored, so the
     * result always lies beneath the mount point.
     */
    pub fn path_in_mount<P: AsRef<Path>>(&self, sub: P) -> Result<PathBuf> {
        let rel: PathBuf = sub
            .as_ref()
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        Ok(self.mount_point()?.join(rel))
    }
}
