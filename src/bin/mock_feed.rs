//! Mock analytics feed - publishes a scripted visitor scenario
//!
//! Drives a local `presence-gateway` (with `[broker] enabled = true`) through
//! entries, zone moves and exits, plus occupancy pushes. Includes one alert
//! for a foreign site and one with an unknown direction so both drop paths
//! can be seen in the gateway's logs and metrics.
//!
//! Usage:
//!   cargo run --bin mock-feed -- --site S1 --step-ms 500

use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mock-feed")]
#[command(about = "Publish a scripted visitor scenario to the presence feed")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    port: u16,

    /// Topic prefix (alerts go to <prefix>/alert)
    #[arg(long, default_value = "analytics")]
    prefix: String,

    /// Site the scenario happens at
    #[arg(long, default_value = "S1")]
    site: String,

    /// Delay between messages
    #[arg(long, default_value = "500")]
    step_ms: u64,

    /// Repeat the scenario this many times (0 = forever)
    #[arg(long, default_value = "1")]
    rounds: u32,
}

/// One scripted step: (direction, person, zone, site override)
const SCRIPT: &[(&str, &str, &str, Option<&str>)] = &[
    ("entry", "P1", "Z1", None),
    ("entry", "P2", "Z1", None),
    ("zone-entry", "P1", "Z2", None),
    ("entry", "P9", "Z1", Some("OTHER")),
    ("zone-exit", "P1", "Z2", None),
    ("teleport", "P2", "Z1", None),
    ("exit", "P1", "Z1", None),
    ("exit", "P3", "Z1", None),
    ("exit", "P2", "Z1", None),
];

fn alert_message(direction: &str, person: &str, zone: &str, site: &str, seq: u64) -> String {
    json!({
        "ts": Utc::now().timestamp_millis(),
        "eventId": format!("mock-{seq}"),
        "direction": direction,
        "personId": person,
        "personName": format!("Visitor {person}"),
        "zoneId": zone,
        "zoneName": format!("Zone {zone}"),
        "siteId": site,
        "siteName": format!("Site {site}"),
        "severity": "low",
    })
    .to_string()
}

fn occupancy_message(site: &str, site_occupancy: i64) -> String {
    json!({
        "ts": Utc::now().timestamp_millis(),
        "siteId": site,
        "siteOccupancy": site_occupancy,
        "zoneId": "Z1",
        "zoneOccupancy": site_occupancy,
    })
    .to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut mqtt_options = MqttOptions::new(format!("mock-feed-{}", std::process::id()), &args.host, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    // Event loop must be polled for publishes to go out
    let poll_handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => println!("connected"),
                Ok(_) => {}
                Err(e) => {
                    eprintln!("mqtt error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let alert_topic = format!("{}/alert", args.prefix);
    let occupancy_topic = format!("{}/live_occupancy", args.prefix);
    let step = Duration::from_millis(args.step_ms);

    let mut seq = 0u64;
    let mut round = 0u32;
    while args.rounds == 0 || round < args.rounds {
        round += 1;
        let mut inside: i64 = 0;

        for &(direction, person, zone, site_override) in SCRIPT {
            seq += 1;
            let site = site_override.unwrap_or(&args.site);
            let msg = alert_message(direction, person, zone, site, seq);
            client.publish(&alert_topic, QoS::AtLeastOnce, false, msg).await?;
            println!("round {round} alert {direction:<10} {person} {zone} @ {site}");

            if site_override.is_none() {
                match direction {
                    "entry" => inside += 1,
                    "exit" => inside = (inside - 1).max(0),
                    _ => {}
                }
                client
                    .publish(&occupancy_topic, QoS::AtLeastOnce, false, occupancy_message(&args.site, inside))
                    .await?;
            }

            tokio::time::sleep(step).await;
        }
    }

    // Give the event loop a moment to flush
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.disconnect().await?;
    poll_handle.abort();
    println!("published {seq} alerts");
    Ok(())
}
