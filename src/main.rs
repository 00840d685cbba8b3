//! Entry point for the xld runner.
//!
//! 1. Parse command-line arguments using `clap`.
//! 2. Install a `tracing` subscriber filtered by `--log-level`.
//! 3. Load the binary into this process with the native target.
//! 4. Call the entrypoint (or `--symbol`) with `argc`/`argv` and exit with its result.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xld::config::Config;

#[cfg(unix)]
fn main() -> Result<()> {
    let config = Config::parse();
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level `{}`", config.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = run(&config)?;
    std::process::exit(code);
}

#[cfg(unix)]
fn run(config: &Config) -> Result<i32> {
    use tracing::info;
    use xld::engine::native::{DlsymResolver, NativeMemory, NativeSystem};
    use xld::loader;

    let mem = NativeMemory::new();
    let resolver = config
        .libs
        .iter()
        .fold(DlsymResolver::new(), |resolver, lib| resolver.with_library(lib.clone()));
    let system = NativeSystem::new(&mem, resolver).with_base_hint(config.base.unwrap_or(0));

    let loaded = loader::from_file(
        &config.binary,
        config.format.format(),
        &system,
        config.bind.into(),
    )
    .with_context(|| format!("failed to load {}", config.binary.display()))?;

    let addr = match &config.symbol {
        Some(name) => {
            let addr = loaded.symbol_address(name);
            if addr == 0 {
                anyhow::bail!("symbol {} not found in {}", name, config.binary.display());
            }
            addr
        }
        None => loaded.entrypoint(),
    };

    let args: Vec<String> = std::iter::once(config.binary.display().to_string())
        .chain(config.args.iter().cloned())
        .collect();
    info!("Calling 0x{:x} with {} arguments", addr, args.len());
    // SAFETY: `addr` is code inside the image we just mapped and relocated for this host.
    let code = unsafe { loader::call_main(addr, &args) }?;
    Ok(code)
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    let _config = Config::parse();
    anyhow::bail!("xld can only run binaries on unix hosts")
}
