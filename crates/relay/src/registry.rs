use std::collections::HashMap;

use hail_geo::LatLng;
use hail_protocol::ActorKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ActorKey {
    kind: ActorKind,
    id: String,
}

impl ActorKey {
    fn new(kind: ActorKind, id: &str) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }
}

/// One live connection's registered actor.
#[derive(Debug, Clone)]
pub struct ConnectedActor {
    pub identifier: String,
    pub kind: ActorKind,
    pub conn_id: String,
    pub location: Option<LatLng>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    /// Drivers only; passengers keep the initial `false`.
    pub available: bool,
}

/// Sole owner of all [`ConnectedActor`]s. At most one entry exists per
/// (kind, identifier) pair; a later register with the same pair silently
/// overwrites the previous one.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    actors: HashMap<ActorKey, ConnectedActor>,
    order: Vec<ActorKey>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the actor. Drivers come up available with no
    /// known location until their first `driver:location`.
    pub fn register(&mut self, identifier: &str, kind: ActorKind, conn_id: &str) {
        let key = ActorKey::new(kind, identifier);
        let actor = ConnectedActor {
            identifier: identifier.to_string(),
            kind,
            conn_id: conn_id.to_string(),
            location: None,
            heading: None,
            speed: None,
            available: kind == ActorKind::Driver,
        };
        if self.actors.insert(key.clone(), actor).is_none() {
            self.order.push(key);
        }
    }

    /// Overwrites a driver's motion fields. No-op for unknown identifiers.
    pub fn update_location(
        &mut self,
        driver_id: &str,
        location: LatLng,
        heading: Option<f64>,
        speed: Option<f64>,
    ) {
        let key = ActorKey::new(ActorKind::Driver, driver_id);
        if let Some(actor) = self.actors.get_mut(&key) {
            actor.location = Some(location);
            actor.heading = heading;
            actor.speed = speed;
        }
    }

    /// No-op for unknown identifiers.
    pub fn set_availability(&mut self, driver_id: &str, available: bool) {
        let key = ActorKey::new(ActorKind::Driver, driver_id);
        if let Some(actor) = self.actors.get_mut(&key) {
            actor.available = available;
        }
    }

    /// Idempotent.
    pub fn deregister(&mut self, kind: ActorKind, identifier: &str) {
        let key = ActorKey::new(kind, identifier);
        if self.actors.remove(&key).is_some() {
            self.order.retain(|k| k != &key);
        }
    }

    pub fn get(&self, kind: ActorKind, identifier: &str) -> Option<&ConnectedActor> {
        self.actors.get(&ActorKey::new(kind, identifier))
    }

    /// Drivers that are available and have reported a location, in
    /// registration order.
    pub fn list_available_drivers(&self) -> Vec<&ConnectedActor> {
        self.order
            .iter()
            .filter(|key| key.kind == ActorKind::Driver)
            .filter_map(|key| self.actors.get(key))
            .filter(|actor| actor.available && actor.location.is_some())
            .collect()
    }

    pub fn online_driver_count(&self) -> usize {
        self.actors
            .keys()
            .filter(|key| key.kind == ActorKind::Driver)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(lat: f64, lng: f64) -> LatLng {
        LatLng { lat, lng }
    }

    #[test]
    fn register_overwrites_the_same_identifier() {
        let mut registry = ConnectionRegistry::new();
        registry.register("d1", ActorKind::Driver, "conn-a");
        registry.update_location("d1", loc(1.0, 2.0), None, None);
        registry.register("d1", ActorKind::Driver, "conn-b");

        assert_eq!(registry.online_driver_count(), 1);
        let actor = registry.get(ActorKind::Driver, "d1").expect("registered");
        assert_eq!(actor.conn_id, "conn-b");
        // re-registration resets telemetry
        assert!(actor.location.is_none());
        assert!(actor.available);
    }

    #[test]
    fn same_identifier_different_kind_is_a_distinct_actor() {
        let mut registry = ConnectionRegistry::new();
        registry.register("u1", ActorKind::Driver, "conn-a");
        registry.register("u1", ActorKind::Passenger, "conn-b");

        assert_eq!(registry.online_driver_count(), 1);
        assert!(registry.get(ActorKind::Passenger, "u1").is_some());
    }

    #[test]
    fn available_drivers_require_a_location() {
        let mut registry = ConnectionRegistry::new();
        registry.register("d1", ActorKind::Driver, "conn-1");
        registry.register("d2", ActorKind::Driver, "conn-2");
        registry.update_location("d2", loc(1.0, 1.0), None, None);

        let ids: Vec<&str> = registry
            .list_available_drivers()
            .iter()
            .map(|d| d.identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["d2"]);
    }

    #[test]
    fn available_drivers_keep_registration_order() {
        let mut registry = ConnectionRegistry::new();
        for id in ["d1", "d2", "d3"] {
            registry.register(id, ActorKind::Driver, id);
            registry.update_location(id, loc(0.0, 0.0), None, None);
        }
        registry.set_availability("d2", false);

        let ids: Vec<&str> = registry
            .list_available_drivers()
            .iter()
            .map(|d| d.identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["d1", "d3"]);
    }

    #[test]
    fn deregister_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        registry.register("d1", ActorKind::Driver, "conn-1");
        registry.deregister(ActorKind::Driver, "d1");
        registry.deregister(ActorKind::Driver, "d1");
        assert!(registry.get(ActorKind::Driver, "d1").is_none());
        assert_eq!(registry.online_driver_count(), 0);
    }

    #[test]
    fn location_round_trip() {
        let mut registry = ConnectionRegistry::new();
        registry.register("d1", ActorKind::Driver, "conn-1");
        registry.update_location("d1", loc(-23.55, -46.63), Some(90.0), Some(12.5));

        let listed = registry.list_available_drivers();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].location, Some(loc(-23.55, -46.63)));
        assert_eq!(listed[0].heading, Some(90.0));

        registry.deregister(ActorKind::Driver, "d1");
        assert!(registry.list_available_drivers().is_empty());
    }

    #[test]
    fn unknown_identifier_updates_are_noops() {
        let mut registry = ConnectionRegistry::new();
        registry.update_location("ghost", loc(0.0, 0.0), None, None);
        registry.set_availability("ghost", true);
        assert_eq!(registry.online_driver_count(), 0);
    }
}
