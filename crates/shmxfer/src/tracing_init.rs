use std::{fs::File, path::PathBuf};

use rustix::process::getpid;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::cli::Args;

pub fn init_tracing(args: &Args) -> std::io::Result<()> {
    let common = args.common();

    if common.stderr_log {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
        return Ok(());
    }

    let log_path = common.log_path.clone().unwrap_or_else(|| {
        let pid = getpid().as_raw_nonzero();
        PathBuf::from(format!("/tmp/shmxfer-{}-{pid}.log", args.role_name()))
    });
    let file = File::create(log_path)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(false),
        )
        .init();
    Ok(())
}
