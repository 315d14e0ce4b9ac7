use clap::Parser;
use std::path::PathBuf;

mod config;
mod error;
mod overlay;

use config::Settings;

/// An encrypting overlay filesystem over FUSE.
///
/// Merges an ordered stack of read-only lower directories under one
/// writable upper directory and stores all upper-layer file data
/// encrypted.
#[derive(Parser, Debug)]
#[command(name = "veilfs", version)]
struct Args {
    /// Mount options, mount(8) style: -o lowerdir=/a:/b,upperdir=/u,workdir=/w
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// Where to mount the merged view
    mountpoint: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("VEILFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> error::Result<()> {
    let settings = Settings::parse(&args.options)?;

    raise_nofile_limit();

    tracing::info!(
        "mounting veilfs at {} ({} lower layer(s), upper={})",
        args.mountpoint.display(),
        settings.lowerdirs.len(),
        settings.has_upper()
    );
    overlay::mount(settings, &args.mountpoint)
}

/// Layer roots and the workdir hold long-lived descriptors and every
/// request opens more; run with the hard descriptor limit.
fn raise_nofile_limit() {
    // SAFETY: plain getrlimit/setrlimit calls on a local struct.
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) == 0
            && limit.rlim_cur < limit.rlim_max
        {
            limit.rlim_cur = limit.rlim_max;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
                tracing::warn!(
                    "could not raise RLIMIT_NOFILE: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}
