//! Builds a startup snapshot: `jsbridge-snapshot <out.snap> [script.js ...]`
//!
//! Runs the scripts, in order, in a fresh snapshot-enabled context and writes the resulting heap.
//! Point `JSBRIDGE_STARTUP_SNAPSHOT` at the output to start every context from it.
//! Logging is controlled by `JSBRIDGE_LOG` (default `info`).

use std::env;
use std::fs;
use std::process;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use jsbridge::{ContextConfig, Error, ErrorKind, Result};

const USAGE: &str = "usage: jsbridge-snapshot <out.snap> [script.js ...]";

/// The output path and the scripts, or `None` when the output path is missing.
fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Option<(String, Vec<String>)> {
    let mut args = args.into_iter();
    let out = args.next().filter(|a| !a.is_empty() && !a.starts_with('-'))?;
    Some((out, args.collect()))
}

fn run(out: &str, scripts: Vec<String>) -> Result<()> {
    let ctx = jsbridge::create_context(ContextConfig::default().with_snapshot_enabled(true))?;
    for path in scripts {
        let source = fs::read_to_string(&path)
            .map_err(|e| Error::new(ErrorKind::SnapshotFailed, format!("{}: {}", path, e)))?;
        ctx.eval(&source, Duration::ZERO)
            .map_err(|e| Error::new(e.kind(), format!("{}: {}", path, e.message())))?;
        tracing::info!(script = %path, "evaluated");
    }

    let snapshot = ctx.snapshot()?;
    snapshot.write_to(out)?;
    tracing::info!(path = %out, bytes = snapshot.payload().len(), engine = snapshot.engine_version(),
        "startup snapshot written");
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_env("JSBRIDGE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let (out, scripts) = match parse_args(env::args().skip(1)) {
        Some(args) => args,
        None => {
            eprintln!("{}", USAGE);
            process::exit(2);
        }
    };

    if let Err(e) = run(&out, scripts) {
        tracing::error!(error = %e, "snapshot failed");
        eprintln!("jsbridge-snapshot: {}", e);
        process::exit(1);
    }
}
