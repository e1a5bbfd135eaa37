/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Result};
use freedombox_image_builder::exec::{install_interrupt_handler, interrupted};
use freedombox_image_builder::profile::{self, Profile};
use freedombox_image_builder::size::parse_size;
use freedombox_image_builder::*;
use log::*;
use slog::{Drain, Logger};
use slog_async::Async;
use slog_scope::crit;
use slog_scope::{set_global_logger, GlobalLoggerGuard};
use slog_syslog::Facility;
use slog_term::{CompactFormat, TermDecorator};
use std::path::PathBuf;
use std::process::exit;

fn parse_log_level(s: &str) -> Result<(slog::Level, log::Level)> {
    Ok(match s {
        "critical" => (slog::Level::Critical, log::Level::Error),
        "error" => (slog::Level::Error, log::Level::Error),
        "warning" | "warn" => (slog::Level::Warning, log::Level::Warn),
        "info" => (slog::Level::Info, log::Level::Info),
        "debug" => (slog::Level::Debug, log::Level::Debug),
        other => bail!("invalid log level \"{}\"", other),
    })
}

fn init_slog_logging(use_syslog: bool, level: &str) -> Result<GlobalLoggerGuard> {
    let (slog_level, log_level) = parse_log_level(level)?;

    if use_syslog {
        let drain = slog_syslog::unix_3164(Facility::LOG_DAEMON)?
            .filter_level(slog_level)
            .fuse();
        let logger = Logger::root(drain, slog::slog_o!());

        let scope_guard = set_global_logger(logger);
        slog_stdlog::init_with_level(log_level)?;

        Ok(scope_guard)
    } else {
        let decorator = TermDecorator::new().stdout().build();
        let drain = CompactFormat::new(decorator).build().fuse();
        let drain = Async::new(drain).build().filter_level(slog_level).fuse();
        let logger = Logger::root(drain, slog::slog_o!());

        let scope_guard = set_global_logger(logger);
        slog_stdlog::init_with_level(log_level)?;

        Ok(scope_guard)
    }
}

fn main() -> Result<()> {
    let cmd = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("missing command name"))?;

    let mut opts = getopts::Options::new();
    opts.parsing_style(getopts::ParsingStyle::StopAtFirstFree);
    opts.optopt(
        "l",
        "log-level",
        "critical, error, warning, info or debug",
        "LEVEL",
    );
    opts.optflag("", "syslog", "log to syslog rather than the terminal");
    opts.optopt("P", "profiles", "load extra target profiles", "FILE");

    fn usage(opts: &getopts::Options) {
        let s = opts.usage("image-builder build [options] TARGET...\n       image-builder list");
        println!("{}", s);
    }

    let f: fn(&getopts::Matches) -> Result<()> = match cmd.as_str() {
        "build" => {
            opts.optopt("b", "build-dir", "directory for output images", "DIR");
            opts.optopt("s", "build-stamp", "stamp used in image names", "STAMP");
            opts.optopt("S", "image-size", "size of the raw image", "SIZE");
            opts.optopt("", "build-mirror", "mirror used while building", "URL");
            opts.optopt("", "mirror", "mirror configured in the image", "URL");
            opts.optopt("d", "distribution", "distribution to build", "DIST");
            opts.optmulti(
                "c",
                "add-release-component",
                "add an apt release component",
                "COMPONENT",
            );
            opts.optmulti("p", "package", "install an extra package", "PACKAGE");
            opts.optmulti(
                "C",
                "custom-package",
                "install a local .deb package",
                "FILE",
            );
            opts.optflag("", "disable-backports", "do not add backports to apt");
            opts.optopt("H", "hostname", "hostname of the image", "NAME");
            opts.optflag("", "sign", "sign the finished image with gpg");
            opts.optflag("f", "force", "rebuild even when output is up to date");
            opts.optflag("R", "build-in-ram", "build the image in a tmpfs");
            opts.optflag("", "skip-compression", "leave the image uncompressed");
            opts.optopt("T", "temp-dir", "directory for temporary mounts", "DIR");

            run_build
        }
        "list" => run_list,
        n => {
            usage(&opts);
            bail!("invalid command: {}", n);
        }
    };

    let mat = match opts.parse(std::env::args().skip(2)) {
        Ok(mat) => mat,
        Err(e) => {
            usage(&opts);
            bail!("invalid options: {:?}", e);
        }
    };

    let level = mat.opt_str("l").unwrap_or_else(|| "debug".to_string());
    let _guard = init_slog_logging(mat.opt_present("syslog"), &level)?;

    if let Err(e) = f(&mat) {
        crit!("fatal error: {:?}", e);
        exit(1);
    }

    Ok(())
}

fn extra_profiles(mat: &getopts::Matches) -> Result<Vec<Profile>> {
    match mat.opt_str("P") {
        Some(p) => profile::load_profiles(p),
        None => Ok(Vec::new()),
    }
}

fn run_list(mat: &getopts::Matches) -> Result<()> {
    for p in profile::targets(&extra_profiles(mat)?).iter() {
        println!("{:<24} {:<8} {}", p.target, p.architecture, p.machine);
    }
    Ok(())
}

fn build_args(mat: &getopts::Matches) -> Result<BuildArgs> {
    let mut args = BuildArgs::default();

    if let Some(d) = mat.opt_str("b") {
        args.build_dir = PathBuf::from(d);
    }
    if let Some(s) = mat.opt_str("s") {
        args.build_stamp = s;
    }
    if let Some(s) = mat.opt_str("S") {
        args.image_size = parse_size(&s)?;
    }
    if let Some(m) = mat.opt_str("build-mirror") {
        args.build_mirror = m;
    }
    if let Some(m) = mat.opt_str("mirror") {
        args.mirror = m;
    }
    if let Some(d) = mat.opt_str("d") {
        args.distribution = d;
    }
    if let Some(h) = mat.opt_str("H") {
        args.hostname = h;
    }
    if let Some(t) = mat.opt_str("T") {
        args.temp_dir = PathBuf::from(t);
    }

    args.release_components = mat.opt_strs("c");
    args.packages = mat.opt_strs("p");
    for c in mat.opt_strs("C") {
        let p = PathBuf::from(&c);
        match ensure::check(&p)? {
            Some(md) if md.is_file() => args.custom_packages.push(p),
            _ => bail!("custom package {:?} is not a file", p),
        }
    }

    args.disable_backports = mat.opt_present("disable-backports");
    args.sign = mat.opt_present("sign");
    args.force = mat.opt_present("f");
    args.build_in_ram = mat.opt_present("R");
    args.skip_compression = mat.opt_present("skip-compression");

    Ok(args)
}

fn build_target(target: &str, extra: &[Profile], args: &BuildArgs, exec: &dyn Executor) -> Result<()> {
    let profile = profile::find(target, extra)?;
    let ib = ImageBuilder::new(profile, args.clone(), exec)?;
    ib.build()
}

fn run_build(mat: &getopts::Matches) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        bail!("image builds need root privileges");
    }

    if mat.free.is_empty() {
        bail!("no targets specified");
    }

    let extra = extra_profiles(mat)?;
    let args = build_args(mat)?;
    install_interrupt_handler()?;

    let exec = HostExecutor;
    let mut failed = Vec::new();
    for target in mat.free.iter() {
        if interrupted() {
            warn!("interrupted; not building {}", target);
            failed.push(target.as_str());
            continue;
        }

        info!("building target {}", target);
        match build_target(target, &extra, &args, &exec) {
            Ok(()) => info!("target {} complete", target),
            Err(e) => {
                error!("target {} failed: {:?}", target, e);
                failed.push(target.as_str());
            }
        }
    }

    if !failed.is_empty() {
        bail!(
            "{} of {} targets failed: {}",
            failed.len(),
            mat.free.len(),
            failed.join(", ")
        );
    }

    Ok(())
}
