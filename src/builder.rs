/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, Context, Result};
use log::*;
use std::path::{Path, PathBuf};

use crate::exec::{Executor, Invocation};
use crate::profile::{Profile, VmFormat};
use crate::size::DiskSize;
use crate::state::{path_str, BuildState};
use crate::{ensure, pipeline, skip, with_suffix};

pub const DEFAULT_MIRROR: &str = "http://deb.debian.org/debian";
pub const DEFAULT_DISTRIBUTION: &str = "bullseye";
pub const DEFAULT_HOSTNAME: &str = "freedombox";
pub const DEFAULT_IMAGE_SIZE: u64 = 7800 * 1024 * 1024;

/**
 * Today's date in UTC, used to stamp image names.
 */
pub fn today() -> String {
    let d = time::OffsetDateTime::now_utc().date();
    format!("{:04}-{:02}-{:02}", d.year(), u8::from(d.month()), d.day())
}

/**
 * Per-invocation settings shared by every target built in one run.
 */
#[derive(Debug, Clone)]
pub struct BuildArgs {
    pub build_dir: PathBuf,
    pub build_stamp: String,
    pub image_size: DiskSize,
    pub build_mirror: String,
    pub mirror: String,
    pub distribution: String,
    pub release_components: Vec<String>,
    pub packages: Vec<String>,
    pub custom_packages: Vec<PathBuf>,
    pub disable_backports: bool,
    pub hostname: String,
    pub sign: bool,
    pub force: bool,
    pub build_in_ram: bool,
    pub skip_compression: bool,
    pub temp_dir: PathBuf,
}

impl Default for BuildArgs {
    fn default() -> Self {
        BuildArgs {
            build_dir: PathBuf::from("build"),
            build_stamp: today(),
            image_size: DiskSize::from_bytes(DEFAULT_IMAGE_SIZE),
            build_mirror: DEFAULT_MIRROR.to_string(),
            mirror: DEFAULT_MIRROR.to_string(),
            distribution: DEFAULT_DISTRIBUTION.to_string(),
            release_components: Vec::new(),
            packages: Vec::new(),
            custom_packages: Vec::new(),
            disable_backports: false,
            hostname: DEFAULT_HOSTNAME.to_string(),
            sign: false,
            force: false,
            build_in_ram: false,
            skip_compression: false,
            temp_dir: std::env::temp_dir(),
        }
    }
}

/**
 * Builds the image for one target, then turns it into the artifact that is
 * published: converted for a VM if the profile asks for it, compressed, and
 * signed.
 */
pub struct ImageBuilder<'a> {
    pub profile: Profile,
    pub args: BuildArgs,
    pub image_file: PathBuf,
    exec: &'a dyn Executor,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(profile: Profile, args: BuildArgs, exec: &'a dyn Executor) -> Result<ImageBuilder<'a>> {
        profile.validate()?;

        let image_file = args
            .build_dir
            .join(format!("{}.img", image_base_name(&profile, &args)));

        Ok(ImageBuilder {
            profile,
            args,
            image_file,
            exec,
        })
    }

    pub fn image_base_name(&self) -> String {
        image_base_name(&self.profile, &self.args)
    }

    /**
     * The file produced before compression: the raw image, or its VM
     * conversion.
     */
    pub fn artifact(&self) -> PathBuf {
        match self.profile.vm_format {
            None => self.image_file.clone(),
            Some(VmFormat::Qcow2) => self.image_file.with_extension("qcow2"),
            Some(VmFormat::Vdi) => self.image_file.with_extension("vdi"),
            Some(VmFormat::Vagrant) => self.image_file.with_extension("box"),
        }
    }

    fn compresses(&self) -> bool {
        !self.args.skip_compression && self.profile.vm_format != Some(VmFormat::Vagrant)
    }

    /**
     * The file a complete build leaves behind.
     */
    pub fn output_file(&self) -> PathBuf {
        if self.compresses() {
            with_suffix(self.artifact(), ".xz")
        } else {
            self.artifact()
        }
    }

    pub fn should_skip_step<P: AsRef<Path>, D: AsRef<Path>>(&self, target: P, dependencies: &[D]) -> bool {
        skip::should_skip_step(self.args.force, target, dependencies)
    }

    fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        self.exec.execute(&Invocation::new(args))
    }

    pub fn build(&self) -> Result<()> {
        let output = self.output_file();
        let artifact = self.artifact();

        if self.should_skip_step(&output, self.args.custom_packages.as_slice()) {
            info!("{:?} is up to date", output);
        } else {
            if self.should_skip_step(&artifact, self.args.custom_packages.as_slice()) {
                info!("{:?} is up to date", artifact);
            } else {
                self.make_image()?;
                self.convert()?;
            }
            self.compress(&artifact)?;
        }

        self.sign(&output)
    }

    /**
     * Run the pipeline for a fresh raw image, unless an up-to-date one is
     * already there.
     */
    pub fn make_image(&self) -> Result<()> {
        if self.should_skip_step(&self.image_file, self.args.custom_packages.as_slice()) {
            info!("{:?} is up to date", self.image_file);
            return Ok(());
        }

        std::fs::create_dir_all(&self.args.build_dir)
            .with_context(|| anyhow!("creating build directory {:?}", self.args.build_dir))?;

        let mut state = BuildState::new(self.exec, &self.args.temp_dir);
        pipeline::make_image(self, &mut state)
    }

    fn convert(&self) -> Result<()> {
        let format = match self.profile.vm_format {
            Some(f) => f,
            None => return Ok(()),
        };
        let image = path_str(&self.image_file)?;

        match format {
            VmFormat::Qcow2 => {
                let qcow2 = self.image_file.with_extension("qcow2");
                self.run(&["qemu-img", "convert", "-O", "qcow2", image, path_str(&qcow2)?])?;
            }
            VmFormat::Vdi | VmFormat::Vagrant => {
                let vdi = self.image_file.with_extension("vdi");
                ensure::removed(&vdi)?;
                self.run(&["VBoxManage", "convertdd", image, path_str(&vdi)?])?;

                if format == VmFormat::Vagrant {
                    let bx = self.image_file.with_extension("box");
                    self.run(&["vagrant-package", "--output", path_str(&bx)?, path_str(&vdi)?])?;
                }
            }
        }

        info!("removing raw image {:?}", self.image_file);
        ensure::removed(&self.image_file)?;
        Ok(())
    }

    fn compress(&self, artifact: &Path) -> Result<()> {
        if !self.compresses() {
            info!("skipping compression of {:?}", artifact);
            return Ok(());
        }

        self.run(&[
            "xz",
            "--no-warn",
            "--threads=0",
            "-9",
            "--force",
            path_str(artifact)?,
        ])?;
        Ok(())
    }

    fn sign(&self, archive: &Path) -> Result<()> {
        if !self.args.sign {
            return Ok(());
        }

        let signature = with_suffix(archive, ".sig");
        if self.should_skip_step(&signature, &[archive]) {
            info!("{:?} is up to date", signature);
            return Ok(());
        }

        ensure::removed(&signature)?;
        self.run(&[
            "gpg",
            "--output",
            path_str(&signature)?,
            "--detach-sig",
            path_str(archive)?,
        ])?;
        Ok(())
    }
}

pub fn image_base_name(profile: &Profile, args: &BuildArgs) -> String {
    format!(
        "freedombox-{}-{}_{}_{}-{}",
        args.distribution,
        profile.free_tag(),
        args.build_stamp,
        profile.machine,
        profile.architecture
    )
}
