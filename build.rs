use std::{env, error::Error, fs, path::Path};

use serde::Deserialize;

#[derive(Deserialize)]
struct RawDefaults {
    measurement_interval_minutes: u16,
    environmental_bulk_size: u16,
    environmental_bulk_sleep_seconds: u16,
    particulate_warm_up_seconds: u16,
    particulate_bulk_size: u16,
    particulate_bulk_sleep_seconds: u16,
    wifi_auth: String,
    mqtt_broker_url: String,
}

fn auth_code(name: &str) -> Result<u16, Box<dyn Error>> {
    match name {
        "open" => Ok(0),
        "wpa2" => Ok(1),
        "wpa2e" => Ok(2),
        other => Err(format!("unknown wifi_auth {other:?}, expected open, wpa2 or wpa2e").into()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // Tell Cargo to rerun if toml changes
    println!("cargo:rerun-if-changed=cfg.toml");

    // Read and parse
    let toml_str = fs::read_to_string("cfg.toml")?;
    let raw: RawDefaults = toml::from_str(&toml_str)?;

    if raw.mqtt_broker_url.len() > 255 {
        return Err("mqtt_broker_url exceeds 255 bytes".into());
    }

    // Generate Rust code
    let out_dir = env::var("OUT_DIR")?;
    let dest_path = Path::new(&out_dir).join("defaults.rs");
    let code = format!(
        r#"
        pub const DEFAULTS: BuildDefaults = BuildDefaults {{
            measurement_interval_minutes: {interval},
            environmental_bulk_size: {env_size},
            environmental_bulk_sleep_seconds: {env_sleep},
            particulate_warm_up_seconds: {warm_up},
            particulate_bulk_size: {pm_size},
            particulate_bulk_sleep_seconds: {pm_sleep},
            wifi_auth: {auth},
            mqtt_broker_url: {broker:?},
        }};
    "#,
        interval = raw.measurement_interval_minutes,
        env_size = raw.environmental_bulk_size,
        env_sleep = raw.environmental_bulk_sleep_seconds,
        warm_up = raw.particulate_warm_up_seconds,
        pm_size = raw.particulate_bulk_size,
        pm_sleep = raw.particulate_bulk_sleep_seconds,
        auth = auth_code(&raw.wifi_auth)?,
        broker = raw.mqtt_broker_url,
    );

    fs::write(dest_path, code)?;
    Ok(())
}
