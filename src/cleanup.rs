/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::Result;
use log::*;
use std::path::PathBuf;

use crate::state::BuildState;
use crate::{ensure, loopback, mount, storage};

/**
 * A deferred teardown action together with the arguments it captured when
 * the resource was acquired.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    ReleaseLoopDevice(PathBuf),
    ReleasePartitionMapping(PathBuf),
    UnmapImage(PathBuf),
    Unmount {
        device: Option<String>,
        mount_point: PathBuf,
        ignore_fail: bool,
    },
    KillProcesses(PathBuf),
    RemoveDirectory(PathBuf),
    RemoveFile(PathBuf),
    RemoveEmulatorBinaries(PathBuf),
    DetachExtraStorage {
        mount_point: PathBuf,
        loop_device: PathBuf,
    },
    CopyImage {
        from: PathBuf,
        to: PathBuf,
    },
    MoveImage {
        from: PathBuf,
        to: PathBuf,
    },
}

impl Cleanup {
    fn run(&self, state: &BuildState) -> Result<()> {
        match self {
            Cleanup::ReleaseLoopDevice(dev) => loopback::force_release_loop_device(state, dev),
            Cleanup::ReleasePartitionMapping(dev) => {
                loopback::force_release_partition_mapping(state, dev)
            }
            Cleanup::UnmapImage(image) => loopback::loopback_teardown(state, image),
            Cleanup::Unmount {
                device,
                mount_point,
                ignore_fail,
            } => mount::unmount_filesystem(state, device.as_deref(), mount_point, *ignore_fail),
            Cleanup::KillProcesses(mp) => mount::process_cleanup(state, mp),
            Cleanup::RemoveDirectory(dir) => ensure::removed_dir(dir).map(|_| ()),
            Cleanup::RemoveFile(f) => ensure::removed(f).map(|_| ()),
            Cleanup::RemoveEmulatorBinaries(mp) => crate::install::qemu_remove_binary(mp),
            Cleanup::DetachExtraStorage {
                mount_point,
                loop_device,
            } => storage::cleanup_extra_storage(state, mount_point, loop_device),
            Cleanup::CopyImage { from, to } => crate::copy_image(state, from, to),
            Cleanup::MoveImage { from, to } => crate::move_image(state, from, to),
        }
    }
}

impl<'a> BuildState<'a> {
    /**
     * Register a teardown action.  Nothing runs until run_cleanup().
     */
    pub fn schedule_cleanup(&mut self, action: Cleanup) {
        debug!("scheduling cleanup: {:?}", action);
        self.cleanup.push(action);
    }

    /**
     * Run every scheduled action, most recently scheduled first.  A failing
     * action is logged and the remaining actions still run.  The stack is
     * consumed, so a second call does nothing.
     */
    pub fn run_cleanup(&mut self) {
        let actions = std::mem::take(&mut self.cleanup);
        if actions.is_empty() {
            return;
        }

        info!("running {} cleanup actions", actions.len());
        for action in actions.iter().rev() {
            info!("cleanup: {:?}", action);
            if let Err(e) = action.run(self) {
                error!("cleanup {:?} failed: {:?}", action, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingExecutor;

    #[test]
    fn schedule_does_not_run() {
        let ex = RecordingExecutor::new();
        let mut state = BuildState::new(&ex, "/tmp");

        state.schedule_cleanup(Cleanup::ReleaseLoopDevice("/dev/loop0".into()));
        assert!(ex.commands().is_empty());
        assert_eq!(
            state.cleanup,
            vec![Cleanup::ReleaseLoopDevice("/dev/loop0".into())]
        );
    }

    #[test]
    fn runs_in_reverse_exactly_once() {
        let ex = RecordingExecutor::new();
        let mut state = BuildState::new(&ex, "/tmp");

        for n in 1..=5 {
            state.schedule_cleanup(Cleanup::ReleasePartitionMapping(
                format!("/dev/mapper/loop0p{}", n).into(),
            ));
        }
        state.run_cleanup();

        assert_eq!(
            ex.commands(),
            (1..=5)
                .rev()
                .map(|n| format!("dmsetup remove /dev/mapper/loop0p{}", n))
                .collect::<Vec<_>>()
        );
        assert!(state.cleanup.is_empty());

        state.run_cleanup();
        assert_eq!(ex.commands().len(), 5);
    }

    #[test]
    fn failure_does_not_stop_teardown() {
        let ex = RecordingExecutor::new();
        ex.fail_on("umount /tmp/mnt/boot");
        let mut state = BuildState::new(&ex, "/tmp");

        state.schedule_cleanup(Cleanup::ReleaseLoopDevice("/dev/loop3".into()));
        state.schedule_cleanup(Cleanup::Unmount {
            device: Some("/dev/mapper/loop3p2".into()),
            mount_point: "/tmp/mnt".into(),
            ignore_fail: false,
        });
        state.schedule_cleanup(Cleanup::Unmount {
            device: Some("/dev/mapper/loop3p1".into()),
            mount_point: "/tmp/mnt/boot".into(),
            ignore_fail: false,
        });
        state.run_cleanup();

        assert_eq!(
            ex.commands(),
            vec![
                "umount /tmp/mnt/boot",
                "umount /tmp/mnt",
                "losetup -d /dev/loop3",
            ]
        );
    }
}
