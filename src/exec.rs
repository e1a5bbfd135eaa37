/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Context, Result};
use log::*;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/*
 * Every command runs with a fixed locale, and with the Debian package tools
 * told that nobody is there to answer questions.  Output is parsed in a few
 * places, so the locale matters.
 */
pub const SANITIZED_ENV: &[(&str, &str)] = &[
    ("LC_ALL", "C"),
    ("LANGUAGE", "C"),
    ("LANG", "C"),
    ("DEBIAN_FRONTEND", "noninteractive"),
    ("DEBCONF_NONINTERACTIVE_SEEN", "true"),
];

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/**
 * Catch SIGINT and SIGTERM so that an interrupted build still unwinds its
 * cleanup stack.  The running child receives the signal as well and fails on
 * its own; the pipeline notices the flag between stages.
 */
pub fn install_interrupt_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
    })
    .context("installing signal handler")
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/**
 * A single external command: argument vector, optional data for standard
 * input, and whether a non-zero exit should be tolerated.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub ignore_fail: bool,
}

impl Invocation {
    pub fn new<S: AsRef<str>>(args: &[S]) -> Invocation {
        Invocation {
            args: args.iter().map(|s| s.as_ref().to_string()).collect(),
            stdin: None,
            ignore_fail: false,
        }
    }

    pub fn ignore_fail(mut self) -> Invocation {
        self.ignore_fail = true;
        self
    }

    pub fn feed_stdin<B: Into<Vec<u8>>>(mut self, data: B) -> Invocation {
        self.stdin = Some(data.into());
        self
    }

    /**
     * Run this command inside a chroot rooted at "root".
     */
    pub fn in_chroot<S: AsRef<str>>(mut self, root: S) -> Invocation {
        let mut args = vec!["chroot".to_string(), root.as_ref().to_string()];
        args.append(&mut self.args);
        self.args = args;
        self
    }

    pub fn program(&self) -> &str {
        self.args.first().map(|s| s.as_str()).unwrap_or("")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/**
 * Runs external programs on behalf of the pipeline.  Returns the standard
 * output of the command.  A non-zero exit is an error unless the invocation
 * tolerates failure, in which case it is logged and whatever output was
 * produced is returned.
 */
pub trait Executor {
    fn execute(&self, inv: &Invocation) -> Result<String>;
}

/**
 * Executes commands on the build host.
 */
#[derive(Debug, Default)]
pub struct HostExecutor;

fn spawn_reader<T>(prefix: &'static str, stream: T) -> JoinHandle<Vec<String>>
where
    T: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut r = BufReader::new(stream);
        let mut lines = Vec::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match r.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(&['\n', '\r'][..]);
                    info!("{} {}", prefix, line);
                    lines.push(line.to_string());
                }
                Err(e) => {
                    warn!("{} read error: {}", prefix, e);
                    break;
                }
            }
        }

        lines
    })
}

impl Executor for HostExecutor {
    fn execute(&self, inv: &Invocation) -> Result<String> {
        if inv.args.is_empty() {
            bail!("cannot execute an empty command");
        }

        info!("exec: {:?}", inv.args);

        let mut cmd = Command::new(&inv.args[0]);
        cmd.args(&inv.args[1..]);
        for (k, v) in SANITIZED_ENV {
            cmd.env(k, v);
        }
        cmd.stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| anyhow!("exec {}: spawn failed", inv))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("exec {}: no stdout pipe", inv))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("exec {}: no stderr pipe", inv))?;
        let readout = spawn_reader(">", stdout);
        let readerr = spawn_reader("2>", stderr);

        if let Some(data) = &inv.stdin {
            /*
             * Drop the pipe once written so that the child sees end-of-file.
             */
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("exec {}: no stdin pipe", inv))?;
            if let Err(e) = pipe.write_all(data) {
                warn!("exec {}: writing stdin: {}", inv, e);
            }
        }

        let status = child
            .wait()
            .with_context(|| anyhow!("exec {}: wait failed", inv))?;
        let out = readout
            .join()
            .map_err(|_| anyhow!("exec {}: stdout reader panicked", inv))?;
        let err = readerr
            .join()
            .map_err(|_| anyhow!("exec {}: stderr reader panicked", inv))?;

        if !status.success() {
            if inv.ignore_fail {
                warn!("exec {}: ignoring failure: {}", inv, status);
            } else {
                bail!("exec {} failed: {}: {}", inv, status, err.join("\n"));
            }
        }

        let mut out = out.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = HostExecutor
            .execute(&Invocation::new(&["sh", "-c", "echo one; echo two"]))
            .unwrap();
        assert_eq!(out, "one\ntwo\n");
    }

    #[test]
    fn environment_is_sanitized() {
        let out = HostExecutor
            .execute(&Invocation::new(&[
                "sh",
                "-c",
                "echo $LC_ALL $LANGUAGE $LANG $DEBIAN_FRONTEND $DEBCONF_NONINTERACTIVE_SEEN",
            ]))
            .unwrap();
        assert_eq!(out.trim(), "C C C noninteractive true");
    }

    #[test]
    fn failure_is_an_error_with_stderr() {
        let err = HostExecutor
            .execute(&Invocation::new(&["sh", "-c", "echo broken >&2; exit 3"]))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken"), "{}", msg);
    }

    #[test]
    fn tolerated_failure_is_not_an_error() {
        let out = HostExecutor
            .execute(&Invocation::new(&["sh", "-c", "echo partial; exit 1"]).ignore_fail())
            .unwrap();
        assert_eq!(out, "partial\n");

        assert!(HostExecutor
            .execute(&Invocation::new(&["false"]).ignore_fail())
            .is_ok());
    }

    #[test]
    fn feeds_stdin() {
        let out = HostExecutor
            .execute(&Invocation::new(&["cat"]).feed_stdin("flash-kernel data\n"))
            .unwrap();
        assert_eq!(out, "flash-kernel data\n");
    }

    #[test]
    fn missing_program_is_an_error() {
        assert!(HostExecutor
            .execute(&Invocation::new(&["/nonexistent/program"]))
            .is_err());
        assert!(HostExecutor.execute(&Invocation::new::<&str>(&[])).is_err());
    }

    #[test]
    fn chroot_prefix() {
        let inv = Invocation::new(&["apt-get", "update"]).in_chroot("/tmp/root");
        assert_eq!(inv.args, vec!["chroot", "/tmp/root", "apt-get", "update"]);
        assert_eq!(inv.program(), "chroot");
        assert_eq!(inv.to_string(), "chroot /tmp/root apt-get update");
    }
}
