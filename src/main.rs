use siab_operator::config::{ClientConfig, OperatorConfig};
use siab_operator::runner::run_operator;

fn main() {
    env_logger::init();

    let config = match OperatorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("Invalid operator configuration: {}", err);
            std::process::exit(1);
        }
    };
    let client_config = match ClientConfig::load(config.operator_name.as_str()) {
        Ok(conf) => conf,
        Err(err) => {
            log::error!("Failed to load kubernetes client configuration: {}", err);
            std::process::exit(1);
        }
    };

    log::info!(
        "Starting {} for namespace: {}",
        config.operator_name,
        config.namespace.as_deref().unwrap_or("<all>")
    );
    let err = run_operator(config, client_config);
    log::error!("Operator exited with error: {:?}", err);
    std::process::exit(1);
}
