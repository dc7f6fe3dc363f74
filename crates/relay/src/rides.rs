use std::collections::HashMap;

use hail_protocol::RideStatus;

use crate::errors::DispatchError;

/// One ride from request to terminal state. Connection references are weak
/// lookups into the live connection table, not ownership; reconciliation
/// removes the record when a referenced connection goes away.
#[derive(Debug, Clone)]
pub struct RideRecord {
    pub ride_id: String,
    pub passenger_id: String,
    pub passenger_conn: String,
    pub driver_id: Option<String>,
    pub driver_conn: Option<String>,
    pub status: RideStatus,
    /// The original request payload, opaque to the relay.
    pub request: serde_json::Value,
    pub created_ms: i64,
}

/// Sole owner of in-flight [`RideRecord`]s, keyed by ride id. Terminal
/// rides are removed, so everything in here is active.
#[derive(Debug, Default)]
pub struct RideRegistry {
    rides: HashMap<String, RideRecord>,
}

impl RideRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        ride_id: &str,
        passenger_id: &str,
        passenger_conn: &str,
        request: serde_json::Value,
        created_ms: i64,
    ) -> Result<(), DispatchError> {
        if self.rides.contains_key(ride_id) {
            return Err(DispatchError::DuplicateRide(ride_id.to_string()));
        }
        self.rides.insert(
            ride_id.to_string(),
            RideRecord {
                ride_id: ride_id.to_string(),
                passenger_id: passenger_id.to_string(),
                passenger_conn: passenger_conn.to_string(),
                driver_id: None,
                driver_conn: None,
                status: RideStatus::Requested,
                request,
                created_ms,
            },
        );
        Ok(())
    }

    /// No-op if the ride is absent.
    pub fn assign_driver(&mut self, ride_id: &str, driver_id: &str, driver_conn: &str) {
        if let Some(ride) = self.rides.get_mut(ride_id) {
            ride.driver_id = Some(driver_id.to_string());
            ride.driver_conn = Some(driver_conn.to_string());
            ride.status = RideStatus::Accepted;
        }
    }

    /// Overwrites the status verbatim. Transition policy is the dispatch
    /// layer's business, not this registry's.
    pub fn set_status(&mut self, ride_id: &str, status: RideStatus) {
        if let Some(ride) = self.rides.get_mut(ride_id) {
            ride.status = status;
        }
    }

    pub fn get(&self, ride_id: &str) -> Option<&RideRecord> {
        self.rides.get(ride_id)
    }

    /// Any rides referencing the connection as passenger or driver. Used
    /// for disconnect reconciliation.
    pub fn find_by_connection(&self, conn_id: &str) -> Vec<RideRecord> {
        self.rides
            .values()
            .filter(|ride| {
                ride.passenger_conn == conn_id || ride.driver_conn.as_deref() == Some(conn_id)
            })
            .cloned()
            .collect()
    }

    pub fn find_active_by_driver(&self, driver_id: &str) -> Option<&RideRecord> {
        self.rides
            .values()
            .find(|ride| ride.driver_id.as_deref() == Some(driver_id) && !ride.status.is_terminal())
    }

    /// Idempotent.
    pub fn remove(&mut self, ride_id: &str) -> Option<RideRecord> {
        self.rides.remove(ride_id)
    }

    pub fn active_count(&self) -> usize {
        self.rides.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> serde_json::Value {
        serde_json::json!({ "rideId": "r1", "passengerId": "p1" })
    }

    #[test]
    fn duplicate_ride_id_is_rejected() {
        let mut rides = RideRegistry::new();
        rides.create("r1", "p1", "conn-p1", request(), 0).expect("first create");
        let err = rides.create("r1", "p1", "conn-p1", request(), 1).unwrap_err();
        assert_eq!(err, DispatchError::DuplicateRide("r1".to_string()));
        assert_eq!(rides.active_count(), 1);
    }

    #[test]
    fn assign_driver_moves_to_accepted() {
        let mut rides = RideRegistry::new();
        rides.create("r1", "p1", "conn-p1", request(), 0).expect("create");
        rides.assign_driver("r1", "d1", "conn-d1");

        let ride = rides.get("r1").expect("ride");
        assert_eq!(ride.status, RideStatus::Accepted);
        assert_eq!(ride.driver_id.as_deref(), Some("d1"));
        assert!(rides.find_active_by_driver("d1").is_some());
    }

    #[test]
    fn set_status_is_verbatim() {
        let mut rides = RideRegistry::new();
        rides.create("r1", "p1", "conn-p1", request(), 0).expect("create");
        // the registry itself applies whatever it is told
        rides.set_status("r1", RideStatus::InProgress);
        assert_eq!(rides.get("r1").expect("ride").status, RideStatus::InProgress);
        rides.set_status("missing", RideStatus::Completed);
    }

    #[test]
    fn find_by_connection_matches_either_side() {
        let mut rides = RideRegistry::new();
        rides.create("r1", "p1", "conn-p1", request(), 0).expect("create");
        rides.assign_driver("r1", "d1", "conn-d1");

        assert_eq!(rides.find_by_connection("conn-p1").len(), 1);
        assert_eq!(rides.find_by_connection("conn-d1").len(), 1);
        assert!(rides.find_by_connection("conn-x").is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut rides = RideRegistry::new();
        rides.create("r1", "p1", "conn-p1", request(), 0).expect("create");
        assert!(rides.remove("r1").is_some());
        assert!(rides.remove("r1").is_none());
        assert_eq!(rides.active_count(), 0);
    }
}
