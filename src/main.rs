//! Service entry point: wire the production backends together and serve.

use std::fs::OpenOptions;
use std::sync::Arc;

use detd::{
    DeviceRegistry, Manager, Service, ServiceConfig, ShellBackend, SysfsNetDevInfo,
};

/// Routes log output to the configured sink, falling back to stderr when the
/// log file cannot be opened (e.g. running unprivileged).
fn init_logging(config: &ServiceConfig) {
    let env = env_logger::Env::default().default_filter_or("info");
    let mut builder = env_logger::Builder::from_env(env);
    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)
    {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Err(error) => {
            eprintln!(
                "detd: cannot open {} ({}); logging to stderr",
                config.log_path.display(),
                error
            );
        }
    }
    builder.init();
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = ServiceConfig::default();
    init_logging(&config);

    let manager = Arc::new(Manager::new(
        DeviceRegistry::default(),
        Arc::new(SysfsNetDevInfo::new()),
        Arc::new(ShellBackend::new()),
    ));

    Service::new(config, manager).run().await
}
