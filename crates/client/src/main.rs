use clap::{Parser, Subcommand};
use tokio::time::Duration;

use hail_common::config::{load_config, ClientConfig};
use hail_common::ids::{new_message_id, new_ride_id};
use hail_geo::LatLng;
use hail_protocol::{
    envelope, ActorKind, DriverLocation, Envelope, RideAccept, RideCancel, RideRequest,
    RideStatus, RideStatusUpdate, RideUpdate, ServerError,
};

use crate::net::{connect, now_ms, Connection, OutgoingMessage};

mod net;

#[derive(Parser, Debug)]
#[command(name = "hail-client")]
struct Args {
    #[arg(long, default_value = "config/client.toml")]
    config: String,
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Simulated driver: streams location updates and takes the first ride
    /// request it receives.
    Driver {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "-23.5505,-46.6333")]
        start: String,
    },
    /// Passenger: requests one ride and follows it to a terminal state.
    Passenger {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "-23.5505,-46.6333")]
        pickup: String,
        #[arg(long, default_value = "-23.5614,-46.6560")]
        destination: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config: ClientConfig = load_config(&args.config)?;

    match args.role {
        Role::Driver { id, start } => {
            let start = parse_latlng(&start)?;
            let connection = connect(&config, &id, ActorKind::Driver).await?;
            println!("driver {id} online (session {})", connection.welcome.session_id);
            run_driver(connection, &id, start).await
        }
        Role::Passenger {
            id,
            pickup,
            destination,
        } => {
            let pickup = parse_latlng(&pickup)?;
            let destination = parse_latlng(&destination)?;
            let connection = connect(&config, &id, ActorKind::Passenger).await?;
            println!("passenger {id} online (session {})", connection.welcome.session_id);
            run_passenger(connection, &id, pickup, destination).await
        }
    }
}

fn parse_latlng(value: &str) -> anyhow::Result<LatLng> {
    let (lat, lng) = value
        .split_once(',')
        .ok_or_else(|| anyhow::anyhow!("expected <lat>,<lng>, got {value}"))?;
    Ok(LatLng {
        lat: lat.trim().parse()?,
        lng: lng.trim().parse()?,
    })
}

fn send(
    outgoing: &tokio::sync::mpsc::UnboundedSender<OutgoingMessage>,
    message_type: &str,
    payload: &impl serde::Serialize,
) -> anyhow::Result<()> {
    let env = envelope(message_type, &new_message_id(), now_ms(), payload)?;
    outgoing.send(OutgoingMessage::Envelope(env))?;
    Ok(())
}

async fn run_driver(mut connection: Connection, id: &str, start: LatLng) -> anyhow::Result<()> {
    let outgoing = connection.outgoing.clone();
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let mut position = start;
    let mut active_ride: Option<String> = None;
    let mut stage = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // crawl east so the passenger sees movement
                position.lng += 0.0005;
                send(&outgoing, "driver:location", &DriverLocation {
                    driver_id: id.to_string(),
                    location: position,
                    heading: Some(90.0),
                    speed: Some(8.0),
                    timestamp: Some(now_ms()),
                })?;

                if let Some(ride_id) = active_ride.clone() {
                    stage += 1;
                    let status = match stage {
                        2 => Some(RideStatus::Arriving),
                        4 => Some(RideStatus::InProgress),
                        6 => Some(RideStatus::Completed),
                        _ => None,
                    };
                    if let Some(status) = status {
                        send(&outgoing, "ride:status", &RideStatusUpdate {
                            ride_id: ride_id.clone(),
                            status,
                        })?;
                        println!("ride {ride_id} -> {status}");
                        if status == RideStatus::Completed {
                            active_ride = None;
                            stage = 0;
                        }
                    }
                }
            }
            env = connection.incoming.recv() => {
                let Some(env) = env else { break };
                handle_driver_event(&outgoing, id, env, &mut active_ride, &mut stage)?;
            }
        }
    }
    Ok(())
}

fn handle_driver_event(
    outgoing: &tokio::sync::mpsc::UnboundedSender<OutgoingMessage>,
    id: &str,
    env: Envelope,
    active_ride: &mut Option<String>,
    stage: &mut u32,
) -> anyhow::Result<()> {
    match env.message_type.as_str() {
        "ride:request" => {
            let Ok(request) = serde_json::from_value::<RideRequest>(env.payload) else {
                return Ok(());
            };
            if active_ride.is_some() {
                println!("ignoring request {} while busy", request.ride_id);
                return Ok(());
            }
            println!("ride request {} from {}", request.ride_id, request.passenger_id);
            send(outgoing, "ride:accept", &RideAccept {
                ride_id: request.ride_id.clone(),
                driver_id: id.to_string(),
            })?;
            *active_ride = Some(request.ride_id);
            *stage = 0;
        }
        "ride:update" => {
            if let Ok(update) = serde_json::from_value::<RideUpdate>(env.payload) {
                println!("ride {} is {}", update.ride_id, update.status);
                if update.status.is_terminal() && active_ride.as_deref() == Some(&update.ride_id) {
                    *active_ride = None;
                    *stage = 0;
                }
            }
        }
        "server:error" => {
            if let Ok(err) = serde_json::from_value::<ServerError>(env.payload) {
                println!("server error: {} ({})", err.message, err.code);
                if matches!(err.code.as_str(), "ride_unavailable" | "driver_busy") {
                    *active_ride = None;
                    *stage = 0;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

async fn run_passenger(
    mut connection: Connection,
    id: &str,
    pickup: LatLng,
    destination: LatLng,
) -> anyhow::Result<()> {
    let outgoing = connection.outgoing.clone();
    let ride_id = new_ride_id();
    send(&outgoing, "ride:request", &RideRequest {
        ride_id: ride_id.clone(),
        passenger_id: id.to_string(),
        pickup: Some(pickup),
        destination: Some(destination),
        extra: serde_json::Map::new(),
    })?;
    println!("requested ride {ride_id}, waiting for a driver");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                send(&outgoing, "ride:cancel", &RideCancel {
                    ride_id: ride_id.clone(),
                    reason: Some("passenger cancelled".to_string()),
                })?;
                println!("cancelling ride {ride_id}");
            }
            env = connection.incoming.recv() => {
                let Some(env) = env else { break };
                match env.message_type.as_str() {
                    "ride:update" => {
                        let Ok(update) = serde_json::from_value::<RideUpdate>(env.payload) else {
                            continue;
                        };
                        match &update.reason {
                            Some(reason) => println!("ride {} is {} ({reason})", update.ride_id, update.status),
                            None => println!("ride {} is {}", update.ride_id, update.status),
                        }
                        if let Some(driver_id) = &update.driver_id {
                            println!("driver {driver_id} assigned");
                        }
                        if update.status.is_terminal() {
                            break;
                        }
                    }
                    "driver:location:update" => {
                        if let Ok(location) = serde_json::from_value::<DriverLocation>(env.payload) {
                            println!(
                                "driver {} at {:.4},{:.4}",
                                location.driver_id, location.location.lat, location.location.lng
                            );
                        }
                    }
                    "server:error" => {
                        if let Ok(err) = serde_json::from_value::<ServerError>(env.payload) {
                            println!("server error: {} ({})", err.message, err.code);
                            if err.code == "duplicate_ride" {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = connection.outgoing.send(OutgoingMessage::Close);
    Ok(())
}
