use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use hail_geo::{rank_nearest, LatLng};
use hail_protocol::{
    ActorKind, DriverLocation, RideAccept, RideCancel, RideRequest, RideStatus, RideStatusUpdate,
    RideUpdate,
};

use crate::errors::DispatchError;
use crate::registry::ConnectionRegistry;
use crate::server::{now_ms, send_envelope, send_error};
use crate::state::RelayState;

pub const NO_DRIVERS_REASON: &str = "no drivers found";

/// Caches the driver's motion fields and relays the payload to the
/// passenger of the driver's active ride, if there is one.
pub async fn handle_driver_location(
    payload: DriverLocation,
    state: &Arc<RwLock<RelayState>>,
    tx: &mpsc::UnboundedSender<Message>,
    env_id: &str,
) -> anyhow::Result<()> {
    let mut state_guard = state.write().await;
    if state_guard
        .registry
        .get(ActorKind::Driver, &payload.driver_id)
        .is_none()
    {
        let err = DispatchError::UnknownActor(payload.driver_id.clone());
        send_error(tx, err.code(), &err.to_string(), Some(env_id))?;
        return Ok(());
    }
    state_guard.registry.update_location(
        &payload.driver_id,
        payload.location,
        payload.heading,
        payload.speed,
    );
    if let Some(ride) = state_guard.rides.find_active_by_driver(&payload.driver_id) {
        if let Some(handle) = state_guard.clients.get(&ride.passenger_conn) {
            send_envelope(&handle.tx, "driver:location:update", &payload)?;
        }
    }
    Ok(())
}

/// Creates the ride record and fans the request out to candidate drivers,
/// annotated with the server-side dispatch timestamp.
pub async fn handle_ride_request(
    request: RideRequest,
    raw: serde_json::Value,
    conn_id: &str,
    state: &Arc<RwLock<RelayState>>,
    config: &hail_common::config::RelayConfig,
    tx: &mpsc::UnboundedSender<Message>,
    env_id: &str,
) -> anyhow::Result<()> {
    let now = now_ms();
    {
        let mut state_guard = state.write().await;
        if let Err(err) = state_guard.rides.create(
            &request.ride_id,
            &request.passenger_id,
            conn_id,
            raw.clone(),
            now,
        ) {
            send_error(tx, err.code(), &err.to_string(), Some(env_id))?;
            return Ok(());
        }

        let mut annotated = raw;
        if let Some(object) = annotated.as_object_mut() {
            object.insert("timestamp".to_string(), serde_json::json!(now));
        }

        let candidates =
            select_candidates(&state_guard.registry, request.pickup, config.max_fanout);
        let mut notified = 0usize;
        for conn in &candidates {
            if let Some(handle) = state_guard.clients.get(conn) {
                send_envelope(&handle.tx, "ride:request", &annotated)?;
                notified += 1;
            }
        }
        info!(
            "ride {} requested by {}; notified {notified} of {} available drivers",
            request.ride_id,
            request.passenger_id,
            state_guard.registry.list_available_drivers().len()
        );
    }

    spawn_request_expiry(
        Arc::clone(state),
        request.ride_id.clone(),
        config.request_timeout_secs,
    );
    Ok(())
}

/// Candidate connection handles: available located drivers, nearest to the
/// pickup first when the request carries coordinates, registration order
/// otherwise, truncated to the fan-out cap.
fn select_candidates(
    registry: &ConnectionRegistry,
    pickup: Option<LatLng>,
    max_fanout: usize,
) -> Vec<String> {
    let drivers = registry.list_available_drivers();
    let ordered: Vec<String> = match pickup {
        Some(origin) => rank_nearest(
            origin,
            drivers
                .iter()
                .filter_map(|d| d.location.map(|loc| (d.conn_id.clone(), loc)))
                .collect(),
        ),
        None => drivers.iter().map(|d| d.conn_id.clone()).collect(),
    };
    ordered.into_iter().take(max_fanout).collect()
}

fn spawn_request_expiry(state: Arc<RwLock<RelayState>>, ride_id: String, timeout_secs: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        if let Err(err) = expire_ride(&state, &ride_id).await {
            warn!("ride {ride_id} expiry failed: {err}");
        }
    });
}

/// Drops a ride that is still unaccepted and tells the passenger no driver
/// took it. Anything past `requested` is left alone.
pub async fn expire_ride(state: &Arc<RwLock<RelayState>>, ride_id: &str) -> anyhow::Result<()> {
    let mut state_guard = state.write().await;
    match state_guard.rides.get(ride_id) {
        Some(ride) if ride.status == RideStatus::Requested => {}
        _ => return Ok(()),
    }
    let Some(ride) = state_guard.rides.remove(ride_id) else {
        return Ok(());
    };
    if let Some(handle) = state_guard.clients.get(&ride.passenger_conn) {
        let update = RideUpdate {
            ride_id: ride.ride_id.clone(),
            status: RideStatus::Cancelled,
            driver_id: None,
            driver_location: None,
            reason: Some(NO_DRIVERS_REASON.to_string()),
        };
        send_envelope(&handle.tx, "ride:update", &update)?;
    }
    info!("ride {ride_id} expired unaccepted");
    Ok(())
}

/// First accept wins. Late or conflicting accepts get an explicit
/// rejection instead of the legacy silent drop.
pub async fn handle_ride_accept(
    payload: RideAccept,
    conn_id: &str,
    state: &Arc<RwLock<RelayState>>,
    tx: &mpsc::UnboundedSender<Message>,
    env_id: &str,
) -> anyhow::Result<()> {
    let mut state_guard = state.write().await;
    let verdict = match state_guard.rides.get(&payload.ride_id) {
        None => Err(DispatchError::RideUnavailable(payload.ride_id.clone())),
        Some(ride) if ride.status != RideStatus::Requested => {
            Err(DispatchError::RideUnavailable(payload.ride_id.clone()))
        }
        Some(_) => {
            if state_guard
                .rides
                .find_active_by_driver(&payload.driver_id)
                .is_some()
            {
                Err(DispatchError::DriverBusy(payload.driver_id.clone()))
            } else {
                Ok(())
            }
        }
    };
    if let Err(err) = verdict {
        send_error(tx, err.code(), &err.to_string(), Some(env_id))?;
        warn!(
            "ride {} accept by {} rejected: {}",
            payload.ride_id,
            payload.driver_id,
            err.code()
        );
        return Ok(());
    }

    state_guard
        .rides
        .assign_driver(&payload.ride_id, &payload.driver_id, conn_id);
    state_guard
        .registry
        .set_availability(&payload.driver_id, false);

    let driver_location = state_guard
        .registry
        .get(ActorKind::Driver, &payload.driver_id)
        .and_then(|d| d.location);
    if let Some(ride) = state_guard.rides.get(&payload.ride_id) {
        if let Some(handle) = state_guard.clients.get(&ride.passenger_conn) {
            let update = RideUpdate {
                ride_id: payload.ride_id.clone(),
                status: RideStatus::Accepted,
                driver_id: Some(payload.driver_id.clone()),
                driver_location,
                reason: None,
            };
            send_envelope(&handle.tx, "ride:update", &update)?;
        }
    }
    info!("ride {} accepted by driver {}", payload.ride_id, payload.driver_id);
    Ok(())
}

/// Applies a client-supplied status change. Transitions outside the ride
/// state machine are rejected; terminal statuses free the driver and drop
/// the record.
pub async fn handle_ride_status(
    payload: RideStatusUpdate,
    state: &Arc<RwLock<RelayState>>,
    tx: &mpsc::UnboundedSender<Message>,
    env_id: &str,
) -> anyhow::Result<()> {
    let mut state_guard = state.write().await;
    let current = match state_guard.rides.get(&payload.ride_id) {
        Some(ride) => ride.status,
        None => {
            let err = DispatchError::UnknownRide(payload.ride_id.clone());
            send_error(tx, err.code(), &err.to_string(), Some(env_id))?;
            return Ok(());
        }
    };
    if !current.can_transition_to(payload.status) {
        let err = DispatchError::InvalidTransition {
            from: current,
            to: payload.status,
        };
        send_error(tx, err.code(), &err.to_string(), Some(env_id))?;
        return Ok(());
    }
    state_guard.rides.set_status(&payload.ride_id, payload.status);
    finish_status_change(&mut state_guard, &payload.ride_id, payload.status, None)?;
    info!("ride {} status -> {}", payload.ride_id, payload.status);
    Ok(())
}

/// A cancel is a status update to `cancelled` that also carries an
/// optional reason, echoed verbatim to both parties.
pub async fn handle_ride_cancel(
    payload: RideCancel,
    state: &Arc<RwLock<RelayState>>,
    tx: &mpsc::UnboundedSender<Message>,
    env_id: &str,
) -> anyhow::Result<()> {
    let mut state_guard = state.write().await;
    if state_guard.rides.get(&payload.ride_id).is_none() {
        let err = DispatchError::UnknownRide(payload.ride_id.clone());
        send_error(tx, err.code(), &err.to_string(), Some(env_id))?;
        return Ok(());
    }
    state_guard
        .rides
        .set_status(&payload.ride_id, RideStatus::Cancelled);
    finish_status_change(
        &mut state_guard,
        &payload.ride_id,
        RideStatus::Cancelled,
        payload.reason.clone(),
    )?;
    info!(
        "ride {} cancelled{}",
        payload.ride_id,
        payload
            .reason
            .as_deref()
            .map(|r| format!(": {r}"))
            .unwrap_or_default()
    );
    Ok(())
}

/// Notifies whichever of the two party connections exist, then performs
/// terminal cleanup: the assigned driver becomes available again and the
/// record is removed.
pub fn finish_status_change(
    state: &mut RelayState,
    ride_id: &str,
    status: RideStatus,
    reason: Option<String>,
) -> anyhow::Result<()> {
    let Some(ride) = state.rides.get(ride_id).cloned() else {
        return Ok(());
    };
    let update = RideUpdate {
        ride_id: ride_id.to_string(),
        status,
        driver_id: None,
        driver_location: None,
        reason,
    };
    let targets = [Some(ride.passenger_conn.clone()), ride.driver_conn.clone()];
    for conn in targets.into_iter().flatten() {
        if let Some(handle) = state.clients.get(&conn) {
            send_envelope(&handle.tx, "ride:update", &update)?;
        }
    }
    if status.is_terminal() {
        if let Some(driver_id) = &ride.driver_id {
            state.registry.set_availability(driver_id, true);
        }
        state.rides.remove(ride_id);
    }
    Ok(())
}
