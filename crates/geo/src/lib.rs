use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle distance in kilometers.
pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Orders items by distance from `origin`, closest first. The sort is
/// stable, so items at equal distance keep their input order.
pub fn rank_nearest<T>(origin: LatLng, items: Vec<(T, LatLng)>) -> Vec<T> {
    let mut ranked: Vec<(f64, T)> = items
        .into_iter()
        .map(|(item, pos)| (haversine_km(origin, pos), item))
        .collect();
    ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    ranked.into_iter().map(|(_, item)| item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAO_PAULO: LatLng = LatLng { lat: -23.5505, lng: -46.6333 };
    const RIO: LatLng = LatLng { lat: -22.9068, lng: -43.1729 };
    const CAMPINAS: LatLng = LatLng { lat: -22.9099, lng: -47.0626 };

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_km(SAO_PAULO, SAO_PAULO), 0.0);
    }

    #[test]
    fn haversine_sao_paulo_to_rio() {
        let km = haversine_km(SAO_PAULO, RIO);
        assert!((km - 357.0).abs() < 5.0, "got {km}");
    }

    #[test]
    fn haversine_is_symmetric() {
        let ab = haversine_km(SAO_PAULO, RIO);
        let ba = haversine_km(RIO, SAO_PAULO);
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn rank_nearest_orders_by_distance() {
        let ranked = rank_nearest(
            SAO_PAULO,
            vec![("rio", RIO), ("campinas", CAMPINAS)],
        );
        assert_eq!(ranked, vec!["campinas", "rio"]);
    }

    #[test]
    fn rank_nearest_is_stable_for_equal_distances() {
        let ranked = rank_nearest(
            SAO_PAULO,
            vec![("first", RIO), ("second", RIO), ("third", CAMPINAS)],
        );
        assert_eq!(ranked, vec!["third", "first", "second"]);
    }
}
