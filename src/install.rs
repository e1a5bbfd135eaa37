/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Context, Result};
use log::*;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::cleanup::Cleanup;
use crate::ensure;
use crate::exec::Invocation;
use crate::mount::unmount_filesystem;
use crate::profile::{BootHook, BootLoader, DdBlob, Profile};
use crate::state::{path_str, BuildState, Label};

pub const BASE_PACKAGES: &[&str] = &["initramfs-tools", "firmware-ath9k-htc"];

pub const SECURITY_MIRROR: &str = "http://security.debian.org/debian-security/";

pub const SUDO_USER: &str = "fbx";

const DISK_IMAGE_FLAG_DIR: &str = "/var/lib/freedombox";
const DISK_IMAGE_FLAG: &str = "/var/lib/freedombox/is-freedombox-disk-image";

const NO_DAEMON_POLICY: &str = "#!/bin/sh\nexit 101\n";

/*
 * Keeps the DTBs on the EFI partition in step with the newest installed
 * kernel.  Installed as both a postinst and a postrm kernel hook.
 */
const DTB_SCRIPT: &str = r#"#!/bin/sh

set -e

if [ ! -e /boot/efi/ ]; then
    exit 0
fi

set -- $DEB_MAINT_PARAMS
action="$1"
action="${action#\'}"
action="${action%\'}"

hook="$(basename "$(dirname "$0")")"
case "$hook:$action" in
  postinst.d:configure|postinst.d:|postrm.d:remove|postrm.d:)
    latest_version=$(linux-version list | linux-version sort | tail -1)
    source_dir="/usr/lib/linux-image-${latest_version}"
    if [ -d "${source_dir}" ]; then
      echo "Copying DTBs from ${source_dir} to EFI partition" >&2
      rm -rf /boot/efi/dtb
      cp -r "${source_dir}" /boot/efi/dtb
    fi
  ;;
esac
"#;

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|i| i == item) {
        list.push(item.to_string());
    }
}

/**
 * The packages to bootstrap the target with: the base set, the kernel, the
 * boot loader, filesystem tools, and whatever the profile and the user add.
 */
pub fn packages(profile: &Profile, extra: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for p in BASE_PACKAGES.iter() {
        push_unique(&mut out, p);
    }

    if let Some(flavor) = &profile.kernel_flavor {
        push_unique(&mut out, &format!("linux-image-{}", flavor));
    }

    match &profile.boot_loader {
        BootLoader::Grub => push_unique(&mut out, "grub-pc"),
        BootLoader::UBoot => {
            if profile.architecture == "arm64" {
                push_unique(&mut out, "u-boot-sunxi");
            } else {
                push_unique(&mut out, "u-boot");
            }
            push_unique(&mut out, "u-boot-tools");
        }
        BootLoader::GrubEfi { .. } | BootLoader::None => (),
    }

    let labels = [Label::Root, Label::Boot, Label::Firmware, Label::Efi];
    if labels
        .iter()
        .any(|l| profile.filesystem(*l) == Some("btrfs"))
    {
        push_unique(&mut out, "btrfs-progs");
    }

    for p in profile.packages.iter().chain(extra.iter()) {
        push_unique(&mut out, p);
    }

    out
}

pub fn components(profile: &Profile, extra: &[String]) -> Vec<String> {
    let mut out = vec!["main".to_string()];
    if !profile.free {
        push_unique(&mut out, "contrib");
        push_unique(&mut out, "non-free");
    }
    for c in extra.iter() {
        push_unique(&mut out, c);
    }
    out
}

fn is_rolling(distribution: &str) -> bool {
    matches!(distribution, "sid" | "unstable")
}

/**
 * Populate the mounted root with a base system for another architecture.
 */
pub fn qemu_debootstrap(
    state: &mut BuildState,
    architecture: &str,
    distribution: &str,
    variant: Option<&str>,
    components: &[String],
    packages: &[String],
    mirror: &str,
) -> Result<()> {
    let target = path_str(state.mount_point()?)?.to_string();

    let mut args = vec![
        "qemu-debootstrap".to_string(),
        format!("--arch={}", architecture),
        format!("--variant={}", variant.unwrap_or("-")),
        format!("--components={}", components.join(",")),
    ];
    if !packages.is_empty() {
        args.push(format!("--include={}", packages.join(",")));
    }
    args.push(distribution.to_string());
    args.push(target);
    args.push(mirror.to_string());

    if let Err(e) = state.run(&args) {
        /*
         * debootstrap does not reliably unmount what it mounted inside the
         * target when it fails.
         */
        warn!("debootstrap failed; unmounting its filesystems");
        for sub in ["proc", "sys", "etc/machine-id"].iter() {
            let path = state.path_in_mount(sub)?;
            if let Err(ue) = unmount_filesystem(state, None, &path, true) {
                warn!("unmounting {:?}: {:?}", path, ue);
            }
        }
        return Err(e);
    }

    let mp = state.mount_point()?.to_path_buf();
    state.schedule_cleanup(Cleanup::RemoveEmulatorBinaries(mp.clone()));
    state.schedule_cleanup(Cleanup::Unmount {
        device: None,
        mount_point: mp.join("etc/machine-id"),
        ignore_fail: true,
    });
    Ok(())
}

/**
 * Remove the static emulator binaries that a cross-architecture bootstrap
 * leaves in the target.
 */
pub fn qemu_remove_binary<P: AsRef<Path>>(mount_point: P) -> Result<()> {
    let pattern = mount_point.as_ref().join("usr/bin/qemu-*-static");
    let pattern = path_str(&pattern)?;

    for ent in glob::glob(pattern).map_err(|e| anyhow!("glob {}: {}", pattern, e))? {
        let ent = ent.map_err(|e| anyhow!("glob {}: {}", pattern, e))?;
        ensure::removed(&ent)?;
    }
    Ok(())
}

pub fn set_hostname(state: &BuildState, hostname: &str) -> Result<()> {
    ensure::filestr(
        &format!("{}\n", hostname),
        state.path_in_mount("etc/hostname")?,
        0o644,
    )?;

    let hosts = state.path_in_mount("etc/hosts")?;
    let existing = match fs::read_to_string(&hosts) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => bail!("reading {:?}: {}", hosts, e),
    };

    let entry = format!("127.0.1.1 {}", hostname);
    let mut found = false;
    let mut out = String::new();
    for line in existing.lines() {
        if line.split_whitespace().next() == Some("127.0.1.1") {
            found = true;
            out.push_str(&entry);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    if !found {
        out.push_str(&entry);
        out.push('\n');
    }

    ensure::filestr(&out, &hosts, 0o644)
}

pub fn lock_root_user(state: &BuildState) -> Result<()> {
    state.run_in_chroot(&["passwd", "-l", "root"])?;
    Ok(())
}

pub fn create_sudo_user(state: &BuildState, username: &str) -> Result<()> {
    state.run_in_chroot(&[
        "adduser",
        "--gecos",
        username,
        "--disabled-password",
        username,
    ])?;
    state.run_in_chroot(&["adduser", username, "sudo"])?;
    Ok(())
}

/**
 * Leave a marker so the installed system can tell it came from a disk image
 * rather than from a package installation.
 */
pub fn set_disk_image_flag(state: &BuildState) -> Result<()> {
    state.run_in_chroot(&["mkdir", "-p", DISK_IMAGE_FLAG_DIR])?;
    state.run_in_chroot(&["touch", DISK_IMAGE_FLAG])?;
    Ok(())
}

pub fn get_uuid_of_device<P: AsRef<Path>>(state: &BuildState, device: P) -> Result<String> {
    let device = path_str(device.as_ref())?;
    let out = state.run(&["blkid", "--output=value", "--match-tag=UUID", device])?;
    let uuid = out.trim();
    if uuid.is_empty() {
        bail!("blkid found no UUID on {}", device);
    }
    Ok(uuid.to_string())
}

pub fn fstab_line(uuid: &str, mount_point: &str, fstype: &str, pass: u32) -> String {
    let options = if fstype == "btrfs" {
        "defaults"
    } else {
        "errors=remount-ro"
    };
    format!(
        "UUID={} {} {} {} 0 {}\n",
        uuid, mount_point, fstype, options, pass
    )
}

pub fn add_fstab_entry(
    state: &BuildState,
    label: Label,
    fstype: &str,
    pass: u32,
    append: bool,
) -> Result<()> {
    let uuid = get_uuid_of_device(state, state.device(label)?)?;
    let sub = state
        .sub_mount_points
        .get(label.as_str())
        .ok_or_else(|| anyhow!("partition {} is not mounted", label))?;
    let mount_point = format!("/{}", sub.as_deref().unwrap_or(""));
    let line = fstab_line(&uuid, &mount_point, fstype, pass);

    let fstab = state.path_in_mount("etc/fstab")?;
    let mut contents = if append {
        match fs::read_to_string(&fstab) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => bail!("reading {:?}: {}", fstab, e),
        }
    } else {
        String::new()
    };
    contents.push_str(&line);

    ensure::filestr(&contents, &fstab, 0o644)
}

/**
 * Write /etc/fstab with root first, then every other partition.
 */
pub fn create_fstab(state: &BuildState, profile: &Profile) -> Result<()> {
    let mut append = false;
    for label in [Label::Root, Label::Boot, Label::Firmware, Label::Efi].iter() {
        if !state.partitions.contains(label) {
            continue;
        }
        let fstype = profile
            .filesystem(*label)
            .ok_or_else(|| anyhow!("no filesystem type for partition {}", label))?;
        let pass = if *label == Label::Root { 1 } else { 2 };
        add_fstab_entry(state, *label, fstype, pass, append)?;
        append = true;
    }
    Ok(())
}

/**
 * While this exists, package installation inside the chroot will not start
 * any daemons.  The policy file is removed again when dropped.
 */
pub struct DaemonPolicy {
    path: PathBuf,
}

impl DaemonPolicy {
    pub fn install(state: &BuildState) -> Result<DaemonPolicy> {
        let path = state.path_in_mount("usr/sbin/policy-rc.d")?;
        ensure::filestr(NO_DAEMON_POLICY, &path, 0o755)?;
        Ok(DaemonPolicy { path })
    }
}

impl Drop for DaemonPolicy {
    fn drop(&mut self) {
        if let Err(e) = ensure::removed(&self.path) {
            warn!("removing daemon policy: {:?}", e);
        }
    }
}

pub fn install_package(state: &BuildState, package: &str) -> Result<()> {
    let _policy = DaemonPolicy::install(state)?;
    state.run_in_chroot(&["apt-get", "install", "-y", package])?;
    Ok(())
}

/**
 * Install a local .deb, letting gdebi pull in its dependencies.
 */
pub fn install_custom_package<P: AsRef<Path>>(state: &BuildState, package: P) -> Result<()> {
    let package = package.as_ref();
    let name = package
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad package file name {:?}", package))?;

    let dest = state.path_in_mount("tmp")?.join(name);
    ensure::directory(state.path_in_mount("tmp")?, 0o1777)?;
    fs::copy(package, &dest).with_context(|| anyhow!("copying {:?} to {:?}", package, dest))?;

    install_package(state, "gdebi-core")?;
    {
        let _policy = DaemonPolicy::install(state)?;
        state.run_in_chroot(&["gdebi", "-n", &format!("/tmp/{}", name)])?;
    }

    ensure::removed(&dest)?;
    Ok(())
}

fn package_file_contains(p: &Path, fragment: &str) -> bool {
    p.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains(fragment))
        .unwrap_or(false)
}

/**
 * Install the FreedomBox payload.  A locally built plinth .deb goes in
 * first, then a local freedombox-setup .deb or, without one, the archive's
 * freedombox-setup.  Any other local .debs follow in the order given.
 */
pub fn install_freedombox_packages<P: AsRef<Path>>(state: &BuildState, custom: &[P]) -> Result<()> {
    let custom: Vec<&Path> = custom.iter().map(|p| p.as_ref()).collect();

    let plinth = custom
        .iter()
        .rev()
        .find(|p| package_file_contains(p, "plinth_"))
        .copied();
    let setup = custom
        .iter()
        .rev()
        .find(|p| package_file_contains(p, "freedombox-setup_"))
        .copied();

    if let Some(p) = plinth {
        info!("installing custom plinth package {:?}", p);
        install_custom_package(state, p)?;
    }

    match setup {
        Some(p) => {
            info!("installing custom freedombox-setup package {:?}", p);
            install_custom_package(state, p)?;
        }
        None => install_package(state, "freedombox-setup")?,
    }

    for p in custom.iter() {
        if Some(*p) == plinth || Some(*p) == setup {
            continue;
        }
        info!("installing custom package {:?}", p);
        install_custom_package(state, p)?;
    }
    Ok(())
}

pub fn remove_ssh_keys(state: &BuildState) -> Result<()> {
    state.execute_in_chroot(
        Invocation::new(&["sh", "-c", "rm -f /etc/ssh/ssh_host_*"]).ignore_fail(),
    )?;
    Ok(())
}

pub fn apt_sources(mirror: &str, distribution: &str, components: &[String], backports: bool) -> String {
    let c = components.join(" ");
    let mut suites = vec![(mirror.to_string(), distribution.to_string())];

    if !is_rolling(distribution) {
        suites.push((mirror.to_string(), format!("{}-updates", distribution)));

        let security = match distribution {
            "stretch" | "buster" => format!("{}/updates", distribution),
            d => format!("{}-security", d),
        };
        suites.push((SECURITY_MIRROR.to_string(), security));

        if backports && distribution != "testing" {
            suites.push((mirror.to_string(), format!("{}-backports", distribution)));
        }
    }

    suites
        .iter()
        .map(|(m, s)| format!("deb {m} {s} {c}\ndeb-src {m} {s} {c}\n", m = m, s = s, c = c))
        .collect::<Vec<_>>()
        .join("\n")
}

/**
 * Point apt at a mirror and refresh the package lists.
 */
pub fn setup_apt(
    state: &BuildState,
    mirror: &str,
    distribution: &str,
    components: &[String],
    backports: bool,
) -> Result<()> {
    let contents = apt_sources(mirror, distribution, components, backports);
    ensure::filestr(&contents, state.path_in_mount("etc/apt/sources.list")?, 0o644)?;

    state.run_in_chroot(&["apt-get", "update"])?;
    state.run_in_chroot(&["apt-get", "clean"])?;
    Ok(())
}

/**
 * EFI installs never touch NVRAM: the image will boot on a machine other
 * than the one building it, and many boards have no NVRAM at all.
 */
pub fn install_grub(state: &BuildState, target: Option<&str>, efi: bool) -> Result<()> {
    let device = path_str(state.loop_device()?)?.to_string();

    state.run_in_chroot(&["update-grub"])?;

    let mut args = vec!["grub-install".to_string()];
    if let Some(t) = target {
        args.push(format!("--target={}", t));
    }
    if efi {
        args.push("--no-nvram".to_string());
    }
    args.push(device);
    state.run_in_chroot(&args)?;
    Ok(())
}

pub fn setup_flash_kernel(
    state: &BuildState,
    machine: &str,
    options: Option<&str>,
    boot_filesystem: Option<&str>,
) -> Result<()> {
    ensure::filestr(
        &format!("{}\n", machine),
        state.path_in_mount("etc/flash-kernel/machine")?,
        0o644,
    )?;

    if let Some(options) = options {
        let selection = format!(
            "flash-kernel flash-kernel/linux_cmdline string {}\n",
            options
        );
        state.execute_in_chroot(
            Invocation::new(&["debconf-set-selections"]).feed_stdin(selection),
        )?;
    }

    install_package(state, "flash-kernel")?;

    /*
     * flash-kernel cannot populate a vfat /boot.
     */
    if boot_filesystem == Some("vfat") {
        info!("not running flash-kernel on a vfat boot filesystem");
    } else {
        state.run_in_chroot(&["flash-kernel"])?;
    }
    Ok(())
}

pub fn install_boot_loader_part(state: &BuildState, blob: &DdBlob) -> Result<()> {
    let src = state.path_in_mount(&blob.path)?;
    let image = state.image_file()?;
    info!(
        "writing boot loader part {:?} at seek={} bs={} count={:?}",
        src, blob.seek, blob.block_size, blob.count
    );

    let mut args = vec![
        "dd".to_string(),
        format!("if={}", path_str(&src)?),
        format!("of={}", path_str(image)?),
        format!("seek={}", blob.seek),
        format!("bs={}", blob.block_size),
        "conv=notrunc".to_string(),
    ];
    if let Some(count) = blob.count {
        args.push(format!("count={}", count));
    }
    state.run(&args)?;
    Ok(())
}

/**
 * Use grub as the boot manager from the removable-media path, and give the
 * board firmware the DTBs it needs on the EFI partition.
 */
pub fn install_efi_boot_manager(state: &BuildState, efi_arch: &str) -> Result<()> {
    state.run_in_chroot(&["mkdir", "-p", "/boot/efi/EFI/boot/"])?;
    state.run_in_chroot(&[
        "cp",
        &format!("/boot/efi/EFI/debian/grub{}.efi", efi_arch),
        &format!("/boot/efi/EFI/boot/boot{}.efi", efi_arch),
    ])?;

    let pattern = state.path_in_mount("usr/lib")?.join("linux-image-*");
    let pattern = path_str(&pattern)?;
    let linux = glob::glob(pattern)
        .map_err(|e| anyhow!("glob {}: {}", pattern, e))?
        .flatten()
        .next()
        .ok_or_else(|| anyhow!("no kernel DTB directory matches {}", pattern))?;
    let linux = linux
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad kernel directory {:?}", linux))?
        .to_string();
    state.run_in_chroot(&["cp", "-r", &format!("/usr/lib/{}/", linux), "/boot/efi/dtb"])?;

    for dir in ["etc/kernel/postinst.d", "etc/kernel/postrm.d"].iter() {
        let script = state.path_in_mount(dir)?.join("zz-freedombox-efi-dtbs");
        ensure::filestr(DTB_SCRIPT, script, 0o755)?;
    }
    Ok(())
}

pub fn run_boot_hook(state: &BuildState, hook: &BootHook) -> Result<()> {
    match hook {
        BootHook::DdBlobs { parts } => {
            for part in parts.iter() {
                install_boot_loader_part(state, part)?;
            }
        }
        BootHook::CustomScript { payload } => {
            state.run_in_chroot(&["bash", "-c", payload])?;
        }
        BootHook::UBootInstaller { program } => {
            let device = path_str(state.loop_device()?)?.to_string();
            state.run_in_chroot(&[program.as_str(), &device])?;
        }
        BootHook::EfiBootManager { efi_arch } => {
            install_efi_boot_manager(state, efi_arch)?;
        }
    }
    Ok(())
}

/**
 * Install the distribution boot loader, then flash-kernel, then whatever the
 * board needs on top.
 */
pub fn install_boot_loader(state: &BuildState, profile: &Profile) -> Result<()> {
    match &profile.boot_loader {
        BootLoader::Grub => install_grub(state, None, false)?,
        BootLoader::GrubEfi { target } => install_grub(state, target.as_deref(), true)?,
        BootLoader::UBoot | BootLoader::None => (),
    }

    if let Some(fk) = &profile.flash_kernel {
        setup_flash_kernel(
            state,
            &fk.machine,
            fk.options.as_deref(),
            profile.filesystem(Label::Boot),
        )?;
    }

    if let Some(hook) = &profile.install_boot_loader {
        run_boot_hook(state, hook)?;
    }
    Ok(())
}

pub fn update_initramfs(state: &BuildState) -> Result<()> {
    state.run_in_chroot(&["update-initramfs", "-u"])?;
    Ok(())
}

/**
 * Fill unused blocks with zeros so that the image compresses well.  dd is
 * expected to fail when the disk fills up.
 */
pub fn fill_free_space_with_zeros(state: &BuildState) -> Result<()> {
    let zeros = state.path_in_mount("ZEROS")?;
    let zeros = path_str(&zeros)?;

    info!("filling free space on {:?} with zeros", state.mount_point()?);
    state.run_ignore_fail(&["dd", "if=/dev/zero", &format!("of={}", zeros), "bs=1M"])?;
    state.run(&["rm", "-f", zeros])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::find;
    use crate::testing::RecordingExecutor;

    fn mounted<'a>(ex: &'a RecordingExecutor, root: &Path) -> BuildState<'a> {
        let mut state = BuildState::new(ex, root);
        state.mount_point = Some(root.to_path_buf());
        state.image_file = Some("/build/test.img".into());
        state.loop_device = Some("/dev/loop0".into());
        state
    }

    #[test]
    fn package_sets() {
        let p = find("amd64", &[]).unwrap();
        assert_eq!(
            packages(&p, &["plinth".to_string()]),
            vec![
                "initramfs-tools",
                "firmware-ath9k-htc",
                "linux-image-amd64",
                "grub-pc",
                "btrfs-progs",
                "plinth",
            ]
        );

        let p = find("pine64-plus", &[]).unwrap();
        let pk = packages(&p, &[]);
        assert!(pk.contains(&"u-boot-sunxi".to_string()));
        assert!(pk.contains(&"u-boot-tools".to_string()));
        assert!(pk.contains(&"atf-allwinner".to_string()));
        assert!(!pk.contains(&"u-boot".to_string()));

        let p = Profile {
            root_filesystem: "ext4".into(),
            ..Profile::new("bare", "armhf")
        };
        assert_eq!(packages(&p, &[]), vec!["initramfs-tools", "firmware-ath9k-htc"]);
    }

    #[test]
    fn component_sets() {
        let free = find("amd64", &[]).unwrap();
        assert_eq!(components(&free, &[]), vec!["main"]);
        assert_eq!(
            components(&free, &["contrib".to_string()]),
            vec!["main", "contrib"]
        );

        let nonfree = find("raspberry3", &[]).unwrap();
        assert_eq!(
            components(&nonfree, &["contrib".to_string()]),
            vec!["main", "contrib", "non-free"]
        );
    }

    #[test]
    fn debootstrap_success_schedules_cleanup() {
        let ex = RecordingExecutor::new();
        let mut state = mounted(&ex, Path::new("/tmp/mnt"));

        qemu_debootstrap(
            &mut state,
            "armhf",
            "bullseye",
            None,
            &["main".to_string(), "contrib".to_string()],
            &["p1".to_string(), "p2".to_string()],
            "http://deb.debian.org/debian",
        )
        .unwrap();

        assert_eq!(
            ex.commands(),
            vec![
                "qemu-debootstrap --arch=armhf --variant=- --components=main,contrib \
                 --include=p1,p2 bullseye /tmp/mnt http://deb.debian.org/debian"
            ]
        );
        assert_eq!(
            state.cleanup,
            vec![
                Cleanup::RemoveEmulatorBinaries("/tmp/mnt".into()),
                Cleanup::Unmount {
                    device: None,
                    mount_point: "/tmp/mnt/etc/machine-id".into(),
                    ignore_fail: true,
                },
            ]
        );
    }

    #[test]
    fn debootstrap_failure_unmounts_leftovers() {
        let ex = RecordingExecutor::new();
        ex.fail_on("qemu-debootstrap");
        let mut state = mounted(&ex, Path::new("/tmp/mnt"));

        let err = qemu_debootstrap(
            &mut state,
            "amd64",
            "bullseye",
            Some("minbase"),
            &["main".to_string()],
            &[],
            "http://deb.debian.org/debian",
        )
        .unwrap_err();
        assert!(err.to_string().contains("qemu-debootstrap"));

        let cmds = ex.commands();
        assert_eq!(
            cmds[1..].to_vec(),
            vec![
                "umount /tmp/mnt/proc",
                "umount /tmp/mnt/sys",
                "umount /tmp/mnt/etc/machine-id",
            ]
        );
        assert!(cmds[0].contains("--variant=minbase"));
        assert!(!cmds[0].contains("--include"));
        assert!(ex.invocations()[1..].iter().all(|i| i.ignore_fail));
        assert!(state.cleanup.is_empty());
    }

    #[test]
    fn emulator_binaries_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("usr/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("qemu-arm-static"), "").unwrap();
        fs::write(bin.join("qemu-aarch64-static"), "").unwrap();
        fs::write(bin.join("bash"), "").unwrap();

        qemu_remove_binary(dir.path()).unwrap();
        assert!(!bin.join("qemu-arm-static").exists());
        assert!(!bin.join("qemu-aarch64-static").exists());
        assert!(bin.join("bash").exists());
        qemu_remove_binary(dir.path()).unwrap();
    }

    #[test]
    fn hostname_files() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());
        let etc = dir.path().join("etc");
        fs::create_dir_all(&etc).unwrap();

        fs::write(etc.join("hosts"), "127.0.0.1 localhost\n").unwrap();
        set_hostname(&state, "fbx").unwrap();
        assert_eq!(fs::read_to_string(etc.join("hostname")).unwrap(), "fbx\n");
        assert_eq!(
            fs::read_to_string(etc.join("hosts")).unwrap(),
            "127.0.0.1 localhost\n127.0.1.1 fbx\n"
        );

        fs::write(
            etc.join("hosts"),
            "127.0.0.1 localhost\n127.0.1.1 debian\n::1 localhost\n",
        )
        .unwrap();
        set_hostname(&state, "freedombox").unwrap();
        assert_eq!(
            fs::read_to_string(etc.join("hosts")).unwrap(),
            "127.0.0.1 localhost\n127.0.1.1 freedombox\n::1 localhost\n"
        );
    }

    #[test]
    fn chroot_account_setup() {
        let ex = RecordingExecutor::new();
        let state = mounted(&ex, Path::new("/tmp/mnt"));

        lock_root_user(&state).unwrap();
        create_sudo_user(&state, SUDO_USER).unwrap();
        set_disk_image_flag(&state).unwrap();
        remove_ssh_keys(&state).unwrap();
        update_initramfs(&state).unwrap();

        assert_eq!(
            ex.commands(),
            vec![
                "chroot /tmp/mnt passwd -l root",
                "chroot /tmp/mnt adduser --gecos fbx --disabled-password fbx",
                "chroot /tmp/mnt adduser fbx sudo",
                "chroot /tmp/mnt mkdir -p /var/lib/freedombox",
                "chroot /tmp/mnt touch /var/lib/freedombox/is-freedombox-disk-image",
                "chroot /tmp/mnt sh -c rm -f /etc/ssh/ssh_host_*",
                "chroot /tmp/mnt update-initramfs -u",
            ]
        );
        assert!(ex.invocations()[5].ignore_fail);
    }

    #[test]
    fn fstab_entries() {
        let ex = RecordingExecutor::new();
        ex.respond("blkid --output=value --match-tag=UUID /dev/mapper/loop0p1", "boot-uuid\n");
        ex.respond("blkid --output=value --match-tag=UUID /dev/mapper/loop0p2", "root-uuid\n");
        let dir = tempfile::tempdir().unwrap();
        let mut state = mounted(&ex, dir.path());
        state.partitions = vec![Label::Boot, Label::Root];
        state.set_device(Label::Boot, "/dev/mapper/loop0p1").unwrap();
        state.set_device(Label::Root, "/dev/mapper/loop0p2").unwrap();
        state.sub_mount_points.insert("root".into(), None);
        state.sub_mount_points.insert("boot".into(), Some("boot".into()));

        let profile = find("cubietruck", &[]).unwrap();
        create_fstab(&state, &profile).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/fstab")).unwrap(),
            "UUID=root-uuid / btrfs defaults 0 1\n\
             UUID=boot-uuid /boot ext2 errors=remount-ro 0 2\n"
        );

        create_fstab(&state, &profile).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/fstab"))
                .unwrap()
                .lines()
                .count(),
            2
        );
    }

    #[test]
    fn fstab_needs_a_uuid() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let mut state = mounted(&ex, dir.path());
        state.partitions = vec![Label::Root];
        state.set_device(Label::Root, "/dev/mapper/loop0p1").unwrap();
        state.sub_mount_points.insert("root".into(), None);

        let profile = Profile {
            root_filesystem: "ext4".into(),
            ..Profile::new("plain", "amd64")
        };
        assert!(create_fstab(&state, &profile).is_err());
    }

    #[test]
    fn apt_sources_by_distribution() {
        let c = vec!["main".to_string(), "contrib".to_string()];
        let m = "http://deb.debian.org/debian";

        assert_eq!(
            apt_sources(m, "unstable", &c, true),
            "deb http://deb.debian.org/debian unstable main contrib\n\
             deb-src http://deb.debian.org/debian unstable main contrib\n"
        );

        let stable = apt_sources(m, "bullseye", &c, true);
        assert!(stable.contains("deb http://deb.debian.org/debian bullseye-updates main contrib\n"));
        assert!(stable.contains(
            "deb http://security.debian.org/debian-security/ bullseye-security main contrib\n"
        ));
        assert!(stable.contains("deb-src http://deb.debian.org/debian bullseye-backports main contrib\n"));

        let old = apt_sources(m, "buster", &c, false);
        assert!(old.contains("debian-security/ buster/updates main contrib"));
        assert!(!old.contains("backports"));

        assert!(!apt_sources(m, "testing", &c, true).contains("backports"));
    }

    #[test]
    fn apt_setup_writes_and_refreshes() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());
        let m = dir.path().display().to_string();

        setup_apt(&state, "http://mirror/debian", "sid", &["main".to_string()], false).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/apt/sources.list")).unwrap(),
            "deb http://mirror/debian sid main\ndeb-src http://mirror/debian sid main\n"
        );
        assert_eq!(
            ex.commands(),
            vec![
                format!("chroot {} apt-get update", m),
                format!("chroot {} apt-get clean", m),
            ]
        );
    }

    #[test]
    fn grub_variants() {
        let ex = RecordingExecutor::new();
        let state = mounted(&ex, Path::new("/tmp/mnt"));

        install_grub(&state, None, false).unwrap();
        install_grub(&state, Some("arm-efi"), true).unwrap();
        assert_eq!(
            ex.commands(),
            vec![
                "chroot /tmp/mnt update-grub",
                "chroot /tmp/mnt grub-install /dev/loop0",
                "chroot /tmp/mnt update-grub",
                "chroot /tmp/mnt grub-install --target=arm-efi --no-nvram /dev/loop0",
            ]
        );
    }

    #[test]
    fn flash_kernel_with_options() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());
        let m = dir.path().display().to_string();

        setup_flash_kernel(&state, "TI AM335x BeagleBone Black", Some("console=ttyO0"), Some("ext2"))
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("etc/flash-kernel/machine")).unwrap(),
            "TI AM335x BeagleBone Black\n"
        );
        assert_eq!(
            ex.commands(),
            vec![
                format!("chroot {} debconf-set-selections", m),
                format!("chroot {} apt-get install -y flash-kernel", m),
                format!("chroot {} flash-kernel", m),
            ]
        );
        assert_eq!(
            ex.invocations()[0].stdin.as_deref(),
            Some(&b"flash-kernel flash-kernel/linux_cmdline string console=ttyO0\n"[..])
        );
        assert!(!dir.path().join("usr/sbin/policy-rc.d").exists());
    }

    #[test]
    fn flash_kernel_skipped_on_vfat() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());

        setup_flash_kernel(&state, "Globalscale Technologies Dreamplug", None, Some("vfat"))
            .unwrap();
        let cmds = ex.commands();
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].ends_with("apt-get install -y flash-kernel"));
    }

    #[test]
    fn dreamplug_boot_loader() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());
        let m = dir.path().display().to_string();

        install_boot_loader(&state, &find("dreamplug", &[]).unwrap()).unwrap();
        let cmds = ex.commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], format!("chroot {} apt-get install -y flash-kernel", m));
        assert!(cmds[1].starts_with(&format!("chroot {} bash -c", m)));
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/flash-kernel/machine")).unwrap(),
            "Globalscale Technologies Dreamplug\n"
        );
    }

    #[test]
    fn daemon_policy_lives_for_the_install() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());
        let policy = dir.path().join("usr/sbin/policy-rc.d");

        {
            let _p = DaemonPolicy::install(&state).unwrap();
            assert_eq!(fs::read_to_string(&policy).unwrap(), "#!/bin/sh\nexit 101\n");
        }
        assert!(!policy.exists());
    }

    #[test]
    fn custom_package_goes_through_gdebi() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        let deb = dir.path().join("plinth_1.0_all.deb");
        fs::write(&deb, "deb").unwrap();
        let state = mounted(&ex, &root);
        let m = root.display().to_string();

        install_custom_package(&state, &deb).unwrap();
        assert_eq!(
            ex.commands(),
            vec![
                format!("chroot {} apt-get install -y gdebi-core", m),
                format!("chroot {} gdebi -n /tmp/plinth_1.0_all.deb", m),
            ]
        );
        assert!(!root.join("tmp/plinth_1.0_all.deb").exists());
    }

    #[test]
    fn freedombox_setup_from_the_archive() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());

        install_freedombox_packages::<PathBuf>(&state, &[]).unwrap();
        assert_eq!(
            ex.commands(),
            vec![format!(
                "chroot {} apt-get install -y freedombox-setup",
                dir.path().display()
            )]
        );
    }

    #[test]
    fn local_plinth_before_local_setup() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        let debs: Vec<PathBuf> = ["extra_2.0_all.deb", "freedombox-setup_0.9_all.deb", "plinth_1.0_all.deb"]
            .iter()
            .map(|n| {
                let p = dir.path().join(n);
                fs::write(&p, "deb").unwrap();
                p
            })
            .collect();
        let state = mounted(&ex, &root);

        install_freedombox_packages(&state, &debs).unwrap();

        let gdebi: Vec<String> = ex
            .commands()
            .into_iter()
            .filter(|c| c.contains("gdebi -n"))
            .collect();
        let m = root.display().to_string();
        assert_eq!(
            gdebi,
            vec![
                format!("chroot {} gdebi -n /tmp/plinth_1.0_all.deb", m),
                format!("chroot {} gdebi -n /tmp/freedombox-setup_0.9_all.deb", m),
                format!("chroot {} gdebi -n /tmp/extra_2.0_all.deb", m),
            ]
        );
        assert!(!ex
            .commands()
            .iter()
            .any(|c| c.ends_with("apt-get install -y freedombox-setup")));
    }

    #[test]
    fn boot_hooks() {
        let ex = RecordingExecutor::new();
        let state = mounted(&ex, Path::new("/tmp/mnt"));

        let beaglebone = find("beaglebone", &[]).unwrap();
        run_boot_hook(&state, beaglebone.install_boot_loader.as_ref().unwrap()).unwrap();
        let pine = find("pine64-lts", &[]).unwrap();
        run_boot_hook(&state, pine.install_boot_loader.as_ref().unwrap()).unwrap();

        assert_eq!(
            ex.commands(),
            vec![
                "dd if=/tmp/mnt/usr/lib/u-boot/am335x_boneblack/MLO of=/build/test.img \
                 seek=1 bs=128K conv=notrunc count=1",
                "dd if=/tmp/mnt/usr/lib/u-boot/am335x_boneblack/u-boot.img of=/build/test.img \
                 seek=1 bs=384K conv=notrunc count=2",
                "chroot /tmp/mnt u-boot-install-sunxi64 /dev/loop0",
            ]
        );
    }

    #[test]
    fn a20_boot_loader_order() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());
        let m = dir.path().display().to_string();

        install_boot_loader(&state, &find("lamobo-r1", &[]).unwrap()).unwrap();
        assert_eq!(
            ex.commands(),
            vec![
                format!("chroot {} apt-get install -y flash-kernel", m),
                format!("chroot {} flash-kernel", m),
                format!(
                    "dd if={}/usr/lib/u-boot/Lamobo_R1/u-boot-sunxi-with-spl.bin \
                     of=/build/test.img seek=8 bs=1K conv=notrunc",
                    m
                ),
            ]
        );
    }

    #[test]
    fn efi_boot_manager() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/lib/linux-image-5.10.0-9-arm64")).unwrap();
        let state = mounted(&ex, dir.path());
        let m = dir.path().display().to_string();

        install_boot_loader(&state, &find("arm64", &[]).unwrap()).unwrap();
        assert_eq!(
            ex.commands(),
            vec![
                format!("chroot {} update-grub", m),
                format!("chroot {} grub-install --no-nvram /dev/loop0", m),
                format!("chroot {} mkdir -p /boot/efi/EFI/boot/", m),
                format!(
                    "chroot {} cp /boot/efi/EFI/debian/grubaa64.efi /boot/efi/EFI/boot/bootaa64.efi",
                    m
                ),
                format!(
                    "chroot {} cp -r /usr/lib/linux-image-5.10.0-9-arm64/ /boot/efi/dtb",
                    m
                ),
            ]
        );
        for hook in ["postinst.d", "postrm.d"].iter() {
            let script = dir
                .path()
                .join("etc/kernel")
                .join(hook)
                .join("zz-freedombox-efi-dtbs");
            assert!(fs::read_to_string(script).unwrap().starts_with("#!/bin/sh"));
        }
    }

    #[test]
    fn efi_boot_manager_needs_a_kernel() {
        let ex = RecordingExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let state = mounted(&ex, dir.path());
        assert!(install_efi_boot_manager(&state, "arm").is_err());
    }

    #[test]
    fn zero_fill() {
        let ex = RecordingExecutor::new();
        ex.fail_on("dd if=/dev/zero");
        let state = mounted(&ex, Path::new("/tmp/mnt"));

        fill_free_space_with_zeros(&state).unwrap();
        assert_eq!(
            ex.commands(),
            vec![
                "dd if=/dev/zero of=/tmp/mnt/ZEROS bs=1M",
                "rm -f /tmp/mnt/ZEROS",
            ]
        );
    }
}
