/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{bail, Result};
use log::*;

use crate::builder::ImageBuilder;
use crate::exec::interrupted;
use crate::size::DiskSize;
use crate::state::BuildState;
use crate::{install, loopback, mount, partition, storage};

type StageFn = fn(&ImageBuilder, &mut BuildState) -> Result<()>;

pub struct Stage {
    pub name: &'static str,
    pub run: StageFn,
}

/*
 * Every stage that acquires something registers its teardown before it
 * returns, so the stages can assume nothing about what ran before them
 * beyond what the BuildState accessors enforce.
 */
pub const STAGES: &[Stage] = &[
    Stage { name: "create_image", run: create_image },
    Stage { name: "create_partitions", run: create_partitions },
    Stage { name: "loopback_setup", run: loopback_setup },
    Stage { name: "create_filesystems", run: create_filesystems },
    Stage { name: "mount_filesystems", run: mount_filesystems },
    Stage { name: "setup_extra_storage", run: setup_extra_storage },
    Stage { name: "debootstrap", run: debootstrap },
    Stage { name: "set_hostname", run: set_hostname },
    Stage { name: "lock_root_user", run: lock_root_user },
    Stage { name: "create_sudo_user", run: create_sudo_user },
    Stage { name: "set_disk_image_flag", run: set_disk_image_flag },
    Stage { name: "create_fstab", run: create_fstab },
    Stage { name: "mount_additional_filesystems", run: mount_additional_filesystems },
    Stage { name: "setup_build_apt", run: setup_build_apt },
    Stage { name: "install_freedombox_packages", run: install_freedombox_packages },
    Stage { name: "remove_ssh_keys", run: remove_ssh_keys },
    Stage { name: "install_boot_loader", run: install_boot_loader },
    Stage { name: "update_initramfs", run: update_initramfs },
    Stage { name: "setup_final_apt", run: setup_final_apt },
    Stage { name: "fill_free_space_with_zeros", run: fill_free_space_with_zeros },
];

fn create_image(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    let size = ib.args.image_size;

    if ib.args.build_in_ram {
        /*
         * The extra storage file for a btrfs root lives next to the image,
         * so the tmpfs must have room for both.
         */
        let tmpfs = DiskSize::from_bytes(size.bytes() + ib.profile.extra_storage_size.bytes());
        crate::create_ram_directory_image(state, &ib.image_file, size, tmpfs)
    } else {
        crate::create_temp_image(state, &ib.image_file, size)
    }
}

fn create_partitions(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    let plan = partition::plan(&ib.profile)?;
    partition::create_partitions(state, &plan)
}

fn loopback_setup(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    loopback::loopback_setup(state)
}

fn create_filesystems(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    mount::create_filesystems(state, &ib.profile)
}

fn mount_filesystems(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    mount::mount_partitions(state)
}

fn setup_extra_storage(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    storage::setup_extra_storage(
        state,
        &ib.profile.root_filesystem,
        ib.profile.extra_storage_size,
    )
}

fn debootstrap(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    let packages = install::packages(&ib.profile, &ib.args.packages);
    let components = install::components(&ib.profile, &ib.args.release_components);

    install::qemu_debootstrap(
        state,
        &ib.profile.architecture,
        &ib.args.distribution,
        ib.profile.debootstrap_variant.as_deref(),
        &components,
        &packages,
        &ib.args.build_mirror,
    )
}

fn set_hostname(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    install::set_hostname(state, &ib.args.hostname)
}

fn lock_root_user(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    info!("locking root user");
    install::lock_root_user(state)
}

fn create_sudo_user(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    info!("creating sudo user {}", install::SUDO_USER);
    install::create_sudo_user(state, install::SUDO_USER)
}

fn set_disk_image_flag(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    install::set_disk_image_flag(state)
}

fn create_fstab(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    install::create_fstab(state, &ib.profile)
}

fn mount_additional_filesystems(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    mount::mount_additional_filesystems(state)
}

fn setup_apt(ib: &ImageBuilder, state: &mut BuildState, mirror: &str) -> Result<()> {
    let components = install::components(&ib.profile, &ib.args.release_components);
    install::setup_apt(
        state,
        mirror,
        &ib.args.distribution,
        &components,
        !ib.args.disable_backports,
    )
}

fn setup_build_apt(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    setup_apt(ib, state, &ib.args.build_mirror)
}

fn install_freedombox_packages(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    install::install_freedombox_packages(state, &ib.args.custom_packages)
}

fn remove_ssh_keys(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    install::remove_ssh_keys(state)
}

fn install_boot_loader(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    install::install_boot_loader(state, &ib.profile)
}

fn update_initramfs(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    install::update_initramfs(state)
}

fn setup_final_apt(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    setup_apt(ib, state, &ib.args.mirror)
}

fn fill_free_space_with_zeros(_: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    install::fill_free_space_with_zeros(state)
}

pub fn run_stages(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    for (count, stage) in STAGES.iter().enumerate() {
        if interrupted() {
            bail!("interrupted before step {} ({})", count, stage.name);
        }

        info!(target: stage.name, "STEP {}: {}", count, stage.name);
        (stage.run)(ib, state)?;
        info!(target: stage.name, "STEP {} ({}) COMPLETE", count, stage.name);
    }
    Ok(())
}

/**
 * Run every stage for one image.  Whatever happens, the cleanup stack is
 * unwound before this returns; a failure is reported only after that.
 */
pub fn make_image(ib: &ImageBuilder, state: &mut BuildState) -> Result<()> {
    info!(
        "building {} image {:?}",
        ib.profile.target, ib.image_file
    );

    let res = run_stages(ib, state);
    if let Err(e) = &res {
        error!("build of {} failed: {:?}", ib.profile.target, e);
        state.success = false;
    }

    state.run_cleanup();
    res
}
