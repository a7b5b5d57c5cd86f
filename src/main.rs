use log::info;
use std::sync::Arc;

use sysgpio::{
    AppConfig, Direction, EdgeDetect, GpioBackend, GpioError, GpioManager, Pwm, PwmState, Value,
};

#[cfg(not(feature = "hardware-gpio"))]
use sysgpio::MockGpioBackend;
#[cfg(feature = "hardware-gpio")]
use sysgpio::SysfsGpioBackend;

const USAGE: &str = "Usage is \"sysgpio get <id>\" | \"sysgpio set <id> <0|1>\" | \
                     \"sysgpio watch <id> [rising|falling|both]\" | \
                     \"sysgpio pwm <chip> <channel> <period_ns> <duty_percent>\"";

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match std::env::var("SYSGPIO_CONFIG") {
        Ok(path) => AppConfig::load_from_file(&path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
        Err(_) => AppConfig::default(),
    };
    let config = Arc::new(config);

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(SysfsGpioBackend::new(config.gpio_root.clone()))
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            log::warn!("built without hardware-gpio, using the in-memory mock backend");
            Arc::new(MockGpioBackend::default())
        }
    };
    let manager = GpioManager::new(config.clone(), backend);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    if let Err(e) = run(&manager, &config, &args).await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run<B: GpioBackend>(
    manager: &GpioManager<B>,
    config: &AppConfig,
    args: &[&str],
) -> Result<(), GpioError> {
    match args {
        ["get", id] => {
            let pin = manager.open(parse_arg(id)?, Direction::In)?;
            println!("{}", pin.value()?);
        }
        ["set", id, value] => {
            let pin = manager.open(parse_arg(id)?, Direction::Out)?;
            pin.set_value(value.parse()?)?;
            info!("gpio{} set to {}, holding until Ctrl-C", pin.id(), pin.value()?);
            wait_for_ctrl_c().await?;
        }
        ["watch", id] => watch(manager, parse_arg(id)?, EdgeDetect::Both).await?,
        ["watch", id, edge] => watch(manager, parse_arg(id)?, edge.parse()?).await?,
        ["pwm", chip, channel, period_ns, duty] => {
            let pwm = Pwm::new(&config.pwm_root, parse_arg(chip)?, parse_arg(channel)?)?;
            pwm.set_period(parse_arg(period_ns)?)?;
            pwm.set_duty_percent(parse_arg(duty)?)?;
            pwm.set_state(PwmState::Enabled)?;
            info!(
                "pwm{} enabled: period {}ns, duty {}ns, holding until Ctrl-C",
                pwm.channel(),
                pwm.period()?,
                pwm.duty_cycle()?
            );
            wait_for_ctrl_c().await?;
        }
        _ => {
            eprintln!("ERROR: {USAGE}");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn watch<B: GpioBackend>(
    manager: &GpioManager<B>,
    pin_id: u32,
    edge: EdgeDetect,
) -> Result<(), GpioError> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let pin = manager.watch(pin_id, edge, move |value| {
        let _ = tx.send(value);
    })?;
    info!("Watching gpio{pin_id} for {} edges, Ctrl-C to stop", edge.as_sysfs());

    let ctrl_c = wait_for_ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            Some(value) = rx.recv() => println!("gpio{pin_id}: {value}"),
            res = &mut ctrl_c => {
                res?;
                break;
            }
        }
    }

    if pin.dropped_events() > 0 {
        info!("gpio{pin_id}: {} events dropped under backpressure", pin.dropped_events());
    }
    Ok(())
}

async fn wait_for_ctrl_c() -> Result<(), GpioError> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| GpioError::io("listen for Ctrl-C", e))?;
    info!("Caught Ctrl-C, releasing pins");
    Ok(())
}

fn parse_arg<T>(raw: &str) -> Result<T, GpioError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| GpioError::InvalidValue(format!("{raw:?}: {e}")))
}
