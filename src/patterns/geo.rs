//! Geographic region lookup for event locations.
//!
//! Fixed bounding boxes over seismically interesting areas, scanned in
//! order with first match winning. Open-ended bounds use infinities.

use std::collections::HashMap;

struct RegionBox {
    name: &'static str,
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
}

const fn region(
    name: &'static str,
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
) -> RegionBox {
    RegionBox {
        name,
        lat_min,
        lat_max,
        lon_min,
        lon_max,
    }
}

const REGIONS: &[RegionBox] = &[
    region("Iceland", 63.0, 67.0, -25.0, -13.0),
    region("South Atlantic", -61.0, -54.0, -30.0, -24.0),
    region("Alaska", 50.0, f64::INFINITY, f64::NEG_INFINITY, -130.0),
    region("Japan", 30.0, 50.0, 125.0, 150.0),
    region("Philippines", 4.0, 20.0, 118.0, 128.0),
    region("Indonesia", -15.0, 10.0, 90.0, 145.0),
    region("Pacific Islands", -60.0, -10.0, 160.0, f64::INFINITY),
    region("Chile", -45.0, -10.0, -85.0, -60.0),
    region("California", 30.0, 45.0, -130.0, -110.0),
    region("Turkey/Greece", 32.0, 42.0, 25.0, 45.0),
    region("Taiwan", 20.0, 28.0, 119.0, 123.0),
    region("Antarctic", f64::NEG_INFINITY, -60.0, f64::NEG_INFINITY, f64::INFINITY),
];

/// Named region for a coordinate pair; "Global" when nothing matches.
pub fn region_from_coords(lat: f64, lon: f64) -> &'static str {
    for r in REGIONS {
        if lat > r.lat_min && lat < r.lat_max && lon > r.lon_min && lon < r.lon_max {
            return r.name;
        }
    }
    "Global"
}

/// Dominant region across recorded event locations: needs at least 3
/// samples, considers the most recent 100, and only reports a region
/// covering >= 30% of them (never the "Global" fallback).
pub fn dominant_region(locations: &[(f64, f64)]) -> Option<String> {
    if locations.len() < 3 {
        return None;
    }
    let recent = &locations[locations.len().saturating_sub(100)..];
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for (lat, lon) in recent {
        *counts.entry(region_from_coords(*lat, *lon)).or_default() += 1;
    }
    let (region, count) = counts.into_iter().max_by_key(|(_, c)| *c)?;
    if region != "Global" && count as f64 / recent.len() as f64 >= 0.3 {
        Some(region.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_regions() {
        assert_eq!(region_from_coords(64.5, -18.0), "Iceland");
        assert_eq!(region_from_coords(-57.0, -26.0), "South Atlantic");
        assert_eq!(region_from_coords(61.0, -150.0), "Alaska");
        assert_eq!(region_from_coords(36.0, 140.0), "Japan");
        assert_eq!(region_from_coords(13.0, 122.0), "Philippines");
        assert_eq!(region_from_coords(-5.0, 120.0), "Indonesia");
        assert_eq!(region_from_coords(-20.0, 175.0), "Pacific Islands");
        assert_eq!(region_from_coords(-30.0, -71.0), "Chile");
        assert_eq!(region_from_coords(37.0, -122.0), "California");
        assert_eq!(region_from_coords(38.0, 27.0), "Turkey/Greece");
        assert_eq!(region_from_coords(23.5, 121.0), "Taiwan");
        assert_eq!(region_from_coords(-70.0, 0.0), "Antarctic");
    }

    #[test]
    fn test_unmatched_is_global() {
        assert_eq!(region_from_coords(0.0, 0.0), "Global");
        assert_eq!(region_from_coords(48.0, 2.0), "Global");
    }

    #[test]
    fn test_dominant_region_requires_three_samples() {
        assert_eq!(dominant_region(&[(36.0, 140.0), (36.0, 140.0)]), None);
    }

    #[test]
    fn test_dominant_region_majority() {
        let locations = vec![(36.0, 140.0), (35.5, 139.0), (37.0, 141.0), (0.0, 0.0)];
        assert_eq!(dominant_region(&locations), Some("Japan".to_string()));
    }

    #[test]
    fn test_dominant_region_ignores_global_majority() {
        let locations = vec![(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (36.0, 140.0)];
        // "Global" dominates but is never reported; Japan sits below 30%.
        assert_eq!(dominant_region(&locations), None);
    }

    #[test]
    fn test_dominant_region_uses_last_hundred() {
        let mut locations = vec![(36.0, 140.0); 200];
        // Most recent 100 are all Iceland.
        for loc in locations.iter_mut().skip(100) {
            *loc = (64.5, -18.0);
        }
        assert_eq!(dominant_region(&locations), Some("Iceland".to_string()));
    }
}
