//! krill — run unmodified riscv64 Linux userspace binaries in-process.
//!
//! ```text
//! krill [--rootfs TARFILE] [--export-tar PATH] ENTRY_BINARY [ARG...]
//! ```
//!
//! The emulator runs on a worker thread; this thread owns the terminal
//! and the network adaptor, draining guest stdout on a timer and feeding
//! stdin through the bridge.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{bail, Context};
use bridge::RefusingAdaptor;
use tracing_subscriber::EnvFilter;

struct Args {
    rootfs: Option<String>,
    export_tar: Option<String>,
    entry: String,
    guest_args: Vec<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut rootfs = None;
    let mut export_tar = None;
    let mut entry = None;
    let mut guest_args = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rootfs" => rootfs = Some(args.next().context("--rootfs needs a path")?),
            "--export-tar" => {
                export_tar = Some(args.next().context("--export-tar needs a path")?)
            }
            "--help" | "-h" => {
                eprintln!("usage: krill [--rootfs TARFILE] [--export-tar PATH] ENTRY [ARG...]");
                std::process::exit(0);
            }
            _ => {
                entry = Some(arg);
                guest_args.extend(args.by_ref());
            }
        }
    }
    let Some(entry) = entry else {
        bail!("missing ENTRY_BINARY; see --help");
    };
    Ok(Args { rootfs, export_tar, entry, guest_args })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("KRILL_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("krill: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let args = parse_args()?;

    let mut fs = vfs::Vfs::new();
    if let Some(path) = &args.rootfs {
        let tar = std::fs::read(path).with_context(|| format!("reading rootfs {path}"))?;
        vfs::load_tar(&mut fs, &tar).context("loading rootfs tar")?;
    }
    let hostname = "krill".to_string();
    fs.populate_defaults(&hostname);

    let (worker_io, fg) = bridge::channel();

    let mut argv = vec![args.entry.clone()];
    argv.extend(args.guest_args.iter().cloned());
    let envp = vmm::default_env(&hostname);

    let cfg = vmm::EmuConfig::default();
    let entry = args.entry.clone();
    let export_tar = args.export_tar.clone();

    let emulator_thread = std::thread::Builder::new()
        .name("krill-guest".to_string())
        .spawn(move || -> i32 {
            let mut emu = match vmm::Emulator::new(cfg, fs, Box::new(worker_io.clone())) {
                Ok(emu) => emu,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build emulator");
                    bridge::HostIo::notify_exit(&worker_io, 1);
                    return 1;
                }
            };
            if let Err(e) = emu.load(&entry, &argv, &envp) {
                tracing::error!(error = %e, "failed to load entry binary");
                bridge::HostIo::notify_exit(&worker_io, 1);
                return 1;
            }
            let code = match emu.run() {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(error = %e, "fatal emulator error");
                    1
                }
            };
            if let Some(path) = export_tar {
                let bytes = vfs::export_tar(&emu.kernel.vfs);
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::error!(error = %e, path, "failed to export tar");
                }
            }
            code
        })
        .context("spawning the emulator thread")?;

    // Stdin pump: the terminal read blocks here, never on the emulator.
    {
        let fg = fg.clone();
        std::thread::Builder::new()
            .name("krill-stdin".to_string())
            .spawn(move || {
                let mut stdin = std::io::stdin();
                let mut buf = [0u8; 4096];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) | Err(_) => {
                            fg.close_stdin();
                            break;
                        }
                        Ok(n) => fg.push_stdin(&buf[..n]),
                    }
                }
            })
            .context("spawning the stdin pump")?;
    }

    // Foreground loop: drain stdout, service network RPCs, watch for exit.
    let mut adaptor = RefusingAdaptor::default();
    let mut stdout = std::io::stdout();
    loop {
        let out = fg.drain_stdout();
        if !out.is_empty() {
            let _ = stdout.write_all(&out);
            let _ = stdout.flush();
        }
        while fg.service_net(&mut adaptor) {}
        if fg.exited().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    // Final drain after the guest is done.
    let out = fg.drain_stdout();
    if !out.is_empty() {
        let _ = stdout.write_all(&out);
        let _ = stdout.flush();
    }

    let code = emulator_thread.join().unwrap_or(1);
    Ok(code)
}
