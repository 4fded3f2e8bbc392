use iec2mqtt::{mqtt::internal_commands::CommandHandler, Config, Iec62056Manager, MqttManager};
use tokio::task::JoinHandle;
use std::{env, time::Duration};
use log::{error, info};


#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("IEC2MQTT_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    env::set_var("RUST_BACKTRACE", "1");

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let (mut mqtt, tx) = MqttManager::new(&config.mqtt, &config.meter.name);

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    // manual readouts requested over MQTT
    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel(1);

    let mut iec62056 = Iec62056Manager::new(tx.clone(), config.clone(), trigger_rx);
    threads.push(tokio::spawn(async move {
        if let Err(e) = iec62056.start_thread().await {
            error!("IEC 62056-21 thread failed: {e}");
        }
    }));

    /* Last but not least start our command handling */
    let command = CommandHandler::new(tx, &config.meter.name, trigger_tx);
    threads.push(tokio::spawn(async move {
        command.start_thread().await;
    }));


    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }

        if threads.iter().any(|task| task.is_finished()) {
            break;
        }
    }

    for task in threads.iter_mut() {
        task.abort();
    }
}
