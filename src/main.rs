pub mod config;
pub mod controller;
pub mod hardware;
pub mod mqtt;

#[cfg(test)]
mod testing;

use crate::config::Config;
use crate::controller::controller_handle::{spawn_stdin_reader, ValveController};
use color_eyre::{eyre::WrapErr, Result};
use mqtt::transport::MqttConnector;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = Config::config_path();
    let config = Config::load_or_create(&path)
        .await
        .wrap_err_with(|| format!("Failed to load config from {}", path.display()))?;

    let connector = MqttConnector::new(&config.broker);
    let controller = ValveController::create(config);
    let endpoint = controller.endpoint();
    info!(
        "Connecting to {}:{} (control: '{}', schedule: '{}')",
        endpoint.host, endpoint.port, endpoint.control_channel, endpoint.schedule_channel
    );

    let controller = controller.start(connector).await?;
    info!("Session {}", controller.connection_state());

    info!("Press ENTER to inject error / CTRL-D to exit");
    let operator = spawn_stdin_reader()?;
    controller.supervise(operator).await?;

    info!("Done");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
