/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::size::{DiskOffset, DiskSize};
use crate::state::Label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTable {
    Msdos,
    Gpt,
}

impl Default for PartitionTable {
    fn default() -> Self {
        PartitionTable::Msdos
    }
}

impl PartitionTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionTable::Msdos => "msdos",
            PartitionTable::Gpt => "gpt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartitionSpec {
    pub filesystem: String,
    pub size: DiskOffset,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BootLoader {
    None,
    Grub,
    GrubEfi {
        #[serde(default)]
        target: Option<String>,
    },
    UBoot,
}

impl Default for BootLoader {
    fn default() -> Self {
        BootLoader::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FlashKernel {
    pub machine: String,
    #[serde(default)]
    pub options: Option<String>,
}

/**
 * One raw write of a boot loader blob, read from inside the target tree, into
 * the image at a fixed block offset.
 */
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DdBlob {
    pub path: String,
    pub seek: u64,
    pub block_size: DiskSize,
    #[serde(default)]
    pub count: Option<u64>,
}

/**
 * Board-specific work needed to make the image bootable, run after the
 * distribution boot loader packages are configured.
 */
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BootHook {
    DdBlobs { parts: Vec<DdBlob> },
    CustomScript { payload: String },
    UBootInstaller { program: String },
    EfiBootManager { efi_arch: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmFormat {
    Qcow2,
    Vdi,
    Vagrant,
}

fn default_machine() -> String {
    "all".to_string()
}

fn default_free() -> bool {
    true
}

fn default_root_filesystem() -> String {
    "btrfs".to_string()
}

fn default_extra_storage_size() -> DiskSize {
    DiskSize::from_bytes(1000 * 1024 * 1024)
}

/**
 * Everything that distinguishes one build target from another.  Profiles
 * are plain data; the pipeline decides what to do from the fields present.
 */
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub target: String,
    pub architecture: String,
    #[serde(default = "default_machine")]
    pub machine: String,
    #[serde(default = "default_free")]
    pub free: bool,
    #[serde(default)]
    pub partition_table: PartitionTable,
    #[serde(default = "default_root_filesystem")]
    pub root_filesystem: String,
    #[serde(default)]
    pub boot: Option<PartitionSpec>,
    #[serde(default)]
    pub firmware: Option<PartitionSpec>,
    #[serde(default)]
    pub efi: Option<PartitionSpec>,
    #[serde(default)]
    pub kernel_flavor: Option<String>,
    #[serde(default)]
    pub boot_loader: BootLoader,
    #[serde(default)]
    pub debootstrap_variant: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default = "default_extra_storage_size")]
    pub extra_storage_size: DiskSize,
    #[serde(default)]
    pub flash_kernel: Option<FlashKernel>,
    #[serde(default)]
    pub install_boot_loader: Option<BootHook>,
    #[serde(default)]
    pub vm_format: Option<VmFormat>,
}

impl Profile {
    pub fn new(target: &str, architecture: &str) -> Profile {
        Profile {
            target: target.to_string(),
            architecture: architecture.to_string(),
            machine: default_machine(),
            free: default_free(),
            partition_table: PartitionTable::default(),
            root_filesystem: default_root_filesystem(),
            boot: None,
            firmware: None,
            efi: None,
            kernel_flavor: None,
            boot_loader: BootLoader::None,
            debootstrap_variant: None,
            packages: Vec::new(),
            extra_storage_size: default_extra_storage_size(),
            flash_kernel: None,
            install_boot_loader: None,
            vm_format: None,
        }
    }

    /**
     * The fixed-size partitions in physical order.  Root always follows them
     * and takes the rest of the disk.
     */
    pub fn sized_partitions(&self) -> Vec<(Label, &PartitionSpec)> {
        let mut out = Vec::new();
        if let Some(p) = &self.firmware {
            out.push((Label::Firmware, p));
        }
        if let Some(p) = &self.efi {
            out.push((Label::Efi, p));
        }
        if let Some(p) = &self.boot {
            out.push((Label::Boot, p));
        }
        out
    }

    pub fn filesystem(&self, label: Label) -> Option<&str> {
        match label {
            Label::Root => Some(&self.root_filesystem),
            Label::Boot => self.boot.as_ref().map(|p| p.filesystem.as_str()),
            Label::Firmware => self.firmware.as_ref().map(|p| p.filesystem.as_str()),
            Label::Efi => self.efi.as_ref().map(|p| p.filesystem.as_str()),
        }
    }

    pub fn free_tag(&self) -> &'static str {
        if self.free {
            "free"
        } else {
            "nonfree"
        }
    }

    /**
     * Reject profiles that could never produce a bootable image, before any
     * resource is acquired for them.
     */
    pub fn validate(&self) -> Result<()> {
        let t = &self.target;

        if self.target.is_empty() {
            bail!("profile has an empty target name");
        }
        if self.firmware.is_some() && self.efi.is_some() {
            bail!("target {}: cannot have both firmware and EFI partitions", t);
        }

        match &self.boot_loader {
            BootLoader::UBoot if self.install_boot_loader.is_none() => {
                bail!("target {}: u-boot profile provides no boot loader installer", t);
            }
            BootLoader::GrubEfi { .. } if self.efi.is_none() => {
                bail!("target {}: grub-efi requires an EFI partition", t);
            }
            _ => (),
        }

        if let Some(BootHook::EfiBootManager { efi_arch }) = &self.install_boot_loader {
            if efi_arch.is_empty() {
                bail!("target {}: EFI architecture is not specified", t);
            }
            if self.efi.is_none() {
                bail!("target {}: EFI boot manager requires an EFI partition", t);
            }
        }

        Ok(())
    }
}

/*
 * The built-in catalogue.  Board families share a constructor; individual
 * boards only differ in their names and boot loader locations.
 */

fn mib(n: u64) -> DiskOffset {
    DiskOffset::mib(n)
}

fn part(filesystem: &str, size: DiskOffset) -> Option<PartitionSpec> {
    Some(PartitionSpec {
        filesystem: filesystem.to_string(),
        size,
    })
}

fn kib(n: u64) -> DiskSize {
    DiskSize::from_bytes(n * 1024)
}

fn flash_kernel(machine: &str, options: Option<&str>) -> Option<FlashKernel> {
    Some(FlashKernel {
        machine: machine.to_string(),
        options: options.map(str::to_string),
    })
}

fn pc(target: &str, arch: &str, flavor: &str, vm_format: Option<VmFormat>) -> Profile {
    Profile {
        kernel_flavor: Some(flavor.to_string()),
        boot_loader: BootLoader::Grub,
        vm_format,
        ..Profile::new(target, arch)
    }
}

fn arm_board(machine: &str, arch: &str, flavor: &str) -> Profile {
    Profile {
        machine: machine.to_string(),
        kernel_flavor: Some(flavor.to_string()),
        boot_loader: BootLoader::UBoot,
        boot: part("ext2", mib(128)),
        ..Profile::new(machine, arch)
    }
}

fn a20(machine: &str, fk_name: &str, u_boot_dir: &str) -> Profile {
    Profile {
        flash_kernel: flash_kernel(fk_name, None),
        install_boot_loader: Some(BootHook::DdBlobs {
            parts: vec![DdBlob {
                path: format!("usr/lib/u-boot/{}/u-boot-sunxi-with-spl.bin", u_boot_dir),
                seek: 8,
                block_size: kib(1),
                count: None,
            }],
        }),
        ..arm_board(machine, "armhf", "armmp-lpae")
    }
}

fn a64(machine: &str, fk_name: &str) -> Profile {
    Profile {
        flash_kernel: flash_kernel(fk_name, None),
        packages: vec!["atf-allwinner".into(), "device-tree-compiler".into()],
        install_boot_loader: Some(BootHook::UBootInstaller {
            program: "u-boot-install-sunxi64".into(),
        }),
        ..arm_board(machine, "arm64", "arm64")
    }
}

const RPI_FIRMWARE_SCRIPT: &str = r#"
set -e
set -x
set -o pipefail

apt-get install --no-install-recommends -y dpkg-dev
cd /tmp
apt-get source raspi3-firmware
cp raspi3-firmware*/boot/* /boot/firmware
rm -rf raspi3-firmware*
cd /

rm -f /boot/firmware/fixup_*
rm -f /boot/firmware/start_*

apt-get install -y u-boot-rpi
cp /usr/lib/u-boot/@VARIANT@/u-boot.bin /boot/firmware/kernel.img
"#;

fn raspberry(machine: &str, fk_name: &str, uboot_variant: &str) -> Profile {
    Profile {
        free: false,
        firmware: part("vfat", mib(60)),
        flash_kernel: flash_kernel(fk_name, None),
        install_boot_loader: Some(BootHook::CustomScript {
            payload: RPI_FIRMWARE_SCRIPT.replace("@VARIANT@", uboot_variant),
        }),
        ..arm_board(machine, "armhf", "armmp")
    }
}

/*
 * flash-kernel's initramfs hooks leave a conf/param.conf behind when run
 * under emulation, which overrides root= on the kernel command line.  Strip
 * it, then build the uImage and uInitrd the DreamPlug boots from.
 */
const DREAMPLUG_SCRIPT: &str = r#"
set -e
set -x
set -o pipefail

kernelVersion=$(ls /usr/lib/*/kirkwood-dreamplug.dtb | head -1 | cut -d/ -f4)
version=$(echo $kernelVersion | sed 's/linux-image-\(.*\)/\1/')
initRd=initrd.img-$version
vmlinuz=vmlinuz-$version

mkdir /tmp/initrd-repack

(cd /tmp/initrd-repack ; \
    zcat /boot/$initRd | cpio -i ; \
    rm -f conf/param.conf ; \
    find . | cpio --quiet -o -H newc | \
    gzip -9 > /boot/$initRd )

rm -rf /tmp/initrd-repack

(cd /boot ; \
    cp /usr/lib/$kernelVersion/kirkwood-dreamplug.dtb dtb ; \
    cat $vmlinuz dtb >> temp-kernel ; \
    mkimage -A arm -O linux -T kernel -n "Debian kernel ${version}" \
    -C none -a 0x8000 -e 0x8000 -d temp-kernel uImage ; \
    rm -f temp-kernel ; \
    mkimage -A arm -O linux -T ramdisk -C gzip -a 0x0 -e 0x0 \
    -n "Debian ramdisk ${version}" \
    -d $initRd uInitrd )

echo "T0:12345:respawn:/sbin/getty -L ttyS0 115200 vt100" >> /etc/inittab
"#;

fn dreamplug() -> Profile {
    Profile {
        boot: part("vfat", mib(128)),
        flash_kernel: flash_kernel("Globalscale Technologies Dreamplug", None),
        install_boot_loader: Some(BootHook::CustomScript {
            payload: DREAMPLUG_SCRIPT.to_string(),
        }),
        ..arm_board("dreamplug", "armel", "marvell")
    }
}

/*
 * The first-generation boards have no Debian kernel.  Kernel and firmware
 * come from a pinned rpi-update, which is refused if its hash is wrong.
 */
const RPI_UPDATE_SCRIPT: &str = r#"
set -e
set -x
set -o pipefail

apt-get install -y git-core binutils ca-certificates wget kmod

rpi_blob_repo='https://github.com/Hexxeh/rpi-update'
rpi_blob_commit='31615deb9406ffc3ab823e76d12dedf373c8e087'
rpi_blob_hash='9868671978541ae6efa692d087028ee5cc5019c340296fdd17793160b6cf403f'

rpi_tempdir=/tmp/fbx-rpi-update
if [ -d $rpi_tempdir ]; then
    rm -rf $rpi_tempdir
fi
git clone $rpi_blob_repo $rpi_tempdir
cd $rpi_tempdir
git checkout $rpi_blob_commit -b $rpi_blob_commit

downloaded_rpi_blob_hash=$(sha256sum $rpi_tempdir/rpi-update | awk -F ' ' '{print $1}')
if [ "$downloaded_rpi_blob_hash" != "$rpi_blob_hash" ]; then
    echo 'WARNING: Unable to verify Raspberry Pi boot blob'
    exit 1
fi

cp $rpi_tempdir/rpi-update /usr/bin/rpi-update

chmod a+x /usr/bin/rpi-update
mkdir -p /lib/modules
touch /boot/start.elf
SKIP_BACKUP=1 SKIP_WARNING=1 rpi-update | tee /root/rpi-update.log
"#;

fn raspberry_armel() -> Profile {
    Profile {
        machine: "raspberry".to_string(),
        free: false,
        root_filesystem: "ext4".to_string(),
        boot: part("vfat", mib(128)),
        install_boot_loader: Some(BootHook::CustomScript {
            payload: RPI_UPDATE_SCRIPT.to_string(),
        }),
        ..Profile::new("raspberry", "armel")
    }
}

fn arm_efi(target: &str, flavor: &str, efi_arch: &str, grub_target: Option<&str>) -> Profile {
    let grub_package = match target {
        "arm64" => "grub-efi-arm64",
        _ => "grub-efi-arm",
    };

    Profile {
        partition_table: PartitionTable::Gpt,
        efi: part("vfat", mib(256)),
        kernel_flavor: Some(flavor.to_string()),
        boot_loader: BootLoader::GrubEfi {
            target: grub_target.map(str::to_string),
        },
        packages: vec![grub_package.to_string()],
        install_boot_loader: Some(BootHook::EfiBootManager {
            efi_arch: efi_arch.to_string(),
        }),
        ..Profile::new(target, target)
    }
}

pub fn catalogue() -> Vec<Profile> {
    vec![
        pc("amd64", "amd64", "amd64", None),
        pc("i386", "i386", "686", None),
        pc("qemu-amd64", "amd64", "amd64", Some(VmFormat::Qcow2)),
        pc("qemu-i386", "i386", "686", Some(VmFormat::Qcow2)),
        pc("virtualbox-amd64", "amd64", "amd64", Some(VmFormat::Vdi)),
        pc("virtualbox-i386", "i386", "686", Some(VmFormat::Vdi)),
        pc("vagrant", "amd64", "amd64", Some(VmFormat::Vagrant)),
        Profile {
            flash_kernel: flash_kernel("TI AM335x BeagleBone Black", Some("console=ttyO0")),
            install_boot_loader: Some(BootHook::DdBlobs {
                parts: vec![
                    DdBlob {
                        path: "usr/lib/u-boot/am335x_boneblack/MLO".into(),
                        seek: 1,
                        block_size: kib(128),
                        count: Some(1),
                    },
                    DdBlob {
                        path: "usr/lib/u-boot/am335x_boneblack/u-boot.img".into(),
                        seek: 1,
                        block_size: kib(384),
                        count: Some(2),
                    },
                ],
            }),
            ..arm_board("beaglebone", "armhf", "armmp")
        },
        a20(
            "a20-olinuxino-lime",
            "Olimex A20-OLinuXino-LIME",
            "A20-OLinuXino-Lime",
        ),
        a20(
            "a20-olinuxino-lime2",
            "Olimex A20-OLinuXino-LIME2",
            "A20-OLinuXino-Lime2",
        ),
        a20(
            "a20-olinuxino-micro",
            "Olimex A20-Olinuxino Micro",
            "A20-OLinuXino_MICRO",
        ),
        a20("banana-pro", "LeMaker Banana Pro", "Bananapro"),
        a20("cubieboard2", "Cubietech Cubieboard2", "Cubieboard2"),
        a20("cubietruck", "Cubietech Cubietruck", "Cubietruck"),
        a20("lamobo-r1", "Lamobo R1", "Lamobo_R1"),
        a20("pcduino3", "LinkSprite pcDuino3", "Linksprite_pcDuino3"),
        a20("orange-pi-zero", "Xunlong Orange Pi Zero", "orangepi_zero"),
        dreamplug(),
        a64("pine64-plus", "Pine64+"),
        a64("pine64-lts", "Pine64 LTS"),
        raspberry_armel(),
        raspberry("raspberry2", "Raspberry Pi 2 Model B", "rpi_2"),
        raspberry("raspberry3", "Raspberry Pi 3 Model B", "rpi_3_32b"),
        raspberry("raspberry3-b-plus", "Raspberry Pi 3 Model B+", "rpi_3_32b"),
        arm_efi("arm64", "arm64", "aa64", None),
        arm_efi("armhf", "armmp-lpae", "arm", Some("arm-efi")),
    ]
}

/**
 * Load extra profile records from a JSON file containing an array of them.
 */
pub fn load_profiles<P: AsRef<Path>>(path: P) -> Result<Vec<Profile>> {
    let path = path.as_ref();

    let f = File::open(path).with_context(|| anyhow!("opening profiles {:?}", path))?;
    let profiles: Vec<Profile> = serde_json::from_reader(BufReader::new(f))
        .with_context(|| anyhow!("parsing profiles {:?}", path))?;
    for p in profiles.iter() {
        p.validate()
            .with_context(|| anyhow!("profile from {:?}", path))?;
    }
    Ok(profiles)
}

/**
 * Find the profile for a target.  Profiles loaded from a file take precedence
 * over the built-in ones with the same name.
 */
pub fn find(target: &str, extra: &[Profile]) -> Result<Profile> {
    let profile = extra
        .iter()
        .find(|p| p.target == target)
        .cloned()
        .or_else(|| catalogue().into_iter().find(|p| p.target == target))
        .ok_or_else(|| anyhow!("unknown target \"{}\"", target))?;

    profile.validate()?;
    Ok(profile)
}

/**
 * Every target name that can be built, in catalogue order, with file
 * profiles that add new names appended.
 */
pub fn targets(extra: &[Profile]) -> Vec<Profile> {
    let mut out = catalogue();
    for p in extra {
        if let Some(existing) = out.iter_mut().find(|e| e.target == p.target) {
            *existing = p.clone();
        } else {
            out.push(p.clone());
        }
    }
    out
}
