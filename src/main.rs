use clap::Parser;
use color_eyre::eyre::Result;
use kube_toolbelt::{CliOpts, do_main};

fn init_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap_or_default();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    color_eyre::config::HookBuilder::default()
        .panic_section("consider reporting the bug with the command line you used")
        .install()?;
    let cli_opts = CliOpts::parse();
    // single thread, commands run one call after the other
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let res = runtime.block_on(do_main(&cli_opts));
    // a console read may still be pending in the blocking pool, do not wait for it
    runtime.shutdown_background();
    res?;
    Ok(())
}
