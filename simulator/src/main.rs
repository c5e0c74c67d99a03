mod location;

use clap::Parser;
use location::Walker;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes random-walk location updates for a simulated fleet.
///
/// Device ids are `<prefix>-<n>`; the tracker only accepts updates for
/// devices that are registered, so register them first.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Updates per second across all devices.
    #[arg(long, env = "RATE", default_value_t = 50)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 20)]
    devices: usize,

    #[arg(long, env = "DEVICE_PREFIX", default_value = "sim-dev")]
    device_prefix: String,

    #[arg(long, env = "TOPIC_PREFIX", default_value = "locations")]
    topic_prefix: String,

    #[arg(long, env = "CENTER_LAT", default_value_t = -6.208763, allow_negative_numbers = true)]
    center_lat: f64,

    #[arg(long, env = "CENTER_LNG", default_value_t = 106.845172, allow_negative_numbers = true)]
    center_lng: f64,

    /// Maximum movement per update, in degrees.
    #[arg(long, env = "STEP_DEGREES", default_value_t = 0.0005)]
    step: f64,
}

const MAX_RATE: u64 = 1_000_000;

/// Interval between publishes; never zero, which `interval` rejects.
fn publish_period(rate: u64) -> Duration {
    Duration::from_micros((1_000_000 / rate.max(1)).max(1))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.devices == 0 || !(1..=MAX_RATE).contains(&args.rate) {
        error!("--devices must be positive and --rate between 1 and {}", MAX_RATE);
        std::process::exit(2);
    }

    info!("Starting location simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.rate, args.devices
    );

    let mut rng = rand::thread_rng();
    let client_id = format!("sim-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut walkers: Vec<Walker> = (0..args.devices)
        .map(|n| {
            Walker::spawn(
                &mut rng,
                format!("{}-{}", args.device_prefix, n),
                (args.center_lat, args.center_lng),
                0.05,
            )
        })
        .collect();

    info!("Connected to MQTT broker, publishing locations");

    let mut ticker = tokio::time::interval(publish_period(args.rate));
    let mut counter = 0u64;

    loop {
        ticker.tick().await;

        let index = rng.gen_range(0..walkers.len());
        let update = walkers[index].step(&mut rng, args.step);
        let topic = format!("{}/{}", args.topic_prefix, update.device_id);

        let payload = match serde_json::to_string(&update) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize update: {}", e);
                continue;
            }
        };

        match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            Ok(_) => counter += 1,
            Err(e) => warn!("Failed to publish: {}", e),
        }

        if counter > 0 && counter % 1000 == 0 {
            info!("Published {} updates", counter);
        }
    }
}
