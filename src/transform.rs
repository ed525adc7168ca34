//! Tag transformation: raw OSM tags in, the normalised key set out.
//!
//! The transform is a capability interface so the build can host an external
//! script or, as shipped here, a built-in rule table. Adapters are stateful
//! across a pass and single-threaded; callers create one before ingest and
//! must not share it between threads. An empty result map means "drop this
//! element".

use std::collections::BTreeMap;

use crate::config::TagTransformConfig;

/// Normalised tags. BTreeMap so iteration order is stable.
pub type TagMap = BTreeMap<String, String>;

pub trait Transform {
    /// Normalise the tags of a way (`is_way`) or node. Must be total over
    /// valid input; an adapter that cannot process an element drops it by
    /// returning an empty map.
    fn transform(&mut self, is_way: bool, tags: &TagMap) -> TagMap;
}

/// Highway-type table: (default access for cars, default speed kph, class).
fn highway_defaults(highway: &str) -> Option<(bool, f64, RClass)> {
    use RClass::*;
    Some(match highway {
        "motorway" => (true, 105.0, Motorway),
        "motorway_link" => (true, 65.0, Motorway),
        "trunk" => (true, 90.0, Trunk),
        "trunk_link" => (true, 55.0, Trunk),
        "primary" => (true, 65.0, Primary),
        "primary_link" => (true, 45.0, Primary),
        "secondary" => (true, 60.0, Secondary),
        "secondary_link" => (true, 45.0, Secondary),
        "tertiary" | "tertiary_link" | "unclassified" => (true, 50.0, TertiaryUnclassified),
        "residential" | "living_street" => (true, 35.0, Residential),
        "service" => (true, 25.0, Service),
        "track" => (true, 15.0, Track),
        "road" => (true, 40.0, Other),
        "footway" | "path" | "pedestrian" | "steps" | "bridleway" => (false, 5.0, Other),
        "cycleway" => (false, 20.0, Other),
        _ => return None,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum RClass {
    Motorway,
    Trunk,
    Primary,
    Secondary,
    TertiaryUnclassified,
    Residential,
    Service,
    Track,
    Other,
}

impl RClass {
    fn as_int(self) -> u8 {
        match self {
            RClass::Motorway => 0,
            RClass::Trunk => 1,
            RClass::Primary => 2,
            RClass::Secondary => 3,
            RClass::TertiaryUnclassified => 4,
            RClass::Residential => 5,
            RClass::Service => 6,
            RClass::Track => 7,
            RClass::Other => 8,
        }
    }
}

fn is_denied(value: Option<&String>) -> bool {
    matches!(value.map(|s| s.as_str()), Some("no") | Some("private"))
}

fn is_true(value: Option<&String>) -> bool {
    matches!(value.map(|s| s.as_str()), Some("yes") | Some("true") | Some("1"))
}

/// Parse a maxspeed value; handles bare kph and "NN mph".
fn parse_speed(v: &str) -> Option<f64> {
    let v = v.trim();
    if let Some(mph) = v.strip_suffix("mph").map(|s| s.trim()) {
        return mph.parse::<f64>().ok().map(|m| m * 1.609344);
    }
    v.parse::<f64>().ok()
}

/// The built-in transform. The configured script/function names are carried
/// for provenance but this implementation is pure Rust.
pub struct BuiltinTransform {
    pub way_function: String,
    pub node_function: String,
}

impl BuiltinTransform {
    pub fn new() -> Self {
        Self {
            way_function: "way_defaults".to_string(),
            node_function: "node_defaults".to_string(),
        }
    }

    pub fn from_config(cfg: Option<&TagTransformConfig>) -> Self {
        let mut t = Self::new();
        if let Some(cfg) = cfg {
            if let Some(f) = &cfg.way_function {
                t.way_function = f.clone();
            }
            if let Some(f) = &cfg.node_function {
                t.node_function = f.clone();
            }
        }
        t
    }

    fn transform_way(&self, tags: &TagMap) -> TagMap {
        let mut out = TagMap::new();

        // Ferries route like roads; everything else needs a highway tag.
        let is_ferry = tags.get("route").map(|v| v == "ferry").unwrap_or(false)
            || tags.get("route").map(|v| v == "shuttle_train").unwrap_or(false);
        let highway = tags.get("highway").map(|s| s.as_str());

        let (mut auto, default_speed, rclass) = match highway.and_then(highway_defaults) {
            Some(t) => t,
            None if is_ferry => (true, 20.0, RClass::Other),
            None => return out,
        };

        if highway == Some("construction") {
            return out;
        }

        // Explicit access tags override the class default.
        if is_denied(tags.get("motor_vehicle")) || is_denied(tags.get("vehicle")) {
            auto = false;
        }
        let access_tag = tags.get("access").map(|s| s.as_str());
        let private = matches!(access_tag, Some("private"));
        let no_thru = matches!(access_tag, Some("destination"))
            || matches!(tags.get("motor_vehicle").map(|s| s.as_str()), Some("destination"));
        if matches!(access_tag, Some("no")) {
            auto = false;
        }

        let mut pedestrian = !matches!(
            highway,
            Some("motorway") | Some("motorway_link") | Some("cycleway")
        );
        if is_denied(tags.get("foot")) {
            pedestrian = false;
        } else if is_true(tags.get("foot")) {
            pedestrian = true;
        }

        let mut bike = !matches!(
            highway,
            Some("motorway") | Some("motorway_link") | Some("footway") | Some("steps")
                | Some("pedestrian")
        );
        if is_denied(tags.get("bicycle")) {
            bike = false;
        } else if is_true(tags.get("bicycle")) {
            bike = true;
        }

        if !auto && !pedestrian && !bike && !is_ferry {
            return out;
        }

        // Directionality
        let mut oneway = match tags.get("oneway").map(|s| s.as_str()) {
            Some("yes") | Some("1") | Some("true") => true,
            Some("-1") | Some("reverse") => true, // normalised below by swapping
            _ => false,
        };
        let reversed = matches!(tags.get("oneway").map(|s| s.as_str()), Some("-1") | Some("reverse"));
        let roundabout = tags.get("junction").map(|v| v == "roundabout").unwrap_or(false);
        if roundabout {
            oneway = true;
        }
        if matches!(highway, Some("motorway") | Some("motorway_link"))
            && tags.get("oneway").is_none()
        {
            oneway = true;
        }

        let (auto_fwd, auto_bwd) = if oneway {
            if reversed {
                (false, auto)
            } else {
                (auto, false)
            }
        } else {
            (auto, auto)
        };
        let bike_both = tags.get("oneway:bicycle").map(|v| v == "no").unwrap_or(false);
        let (bike_fwd, bike_bwd) = if oneway && !bike_both {
            if reversed {
                (false, bike)
            } else {
                (bike, false)
            }
        } else {
            (bike, bike)
        };

        out.insert("road_class".into(), rclass.as_int().to_string());
        out.insert("auto_forward".into(), auto_fwd.to_string());
        out.insert("auto_backward".into(), auto_bwd.to_string());
        out.insert("bike_forward".into(), bike_fwd.to_string());
        out.insert("bike_backward".into(), bike_bwd.to_string());
        out.insert("pedestrian".into(), pedestrian.to_string());
        out.insert("oneway".into(), oneway.to_string());
        out.insert("default_speed".into(), format!("{}", default_speed));

        if private {
            out.insert("private".into(), "true".into());
        }
        if roundabout {
            out.insert("roundabout".into(), "true".into());
        }
        if highway.map(|h| h.ends_with("_link")).unwrap_or(false) {
            out.insert("link".into(), "true".into());
        }
        if is_ferry {
            out.insert("ferry".into(), "true".into());
            if tags.get("route").map(|v| v == "shuttle_train").unwrap_or(false) {
                out.insert("rail".into(), "true".into());
            }
        }

        // Specialized uses
        let use_int: u8 = match highway {
            Some("cycleway") => 1,
            Some("footway") | Some("path") | Some("pedestrian") => 2,
            Some("steps") => 8,
            Some("service") => match tags.get("service").map(|s| s.as_str()) {
                Some("driveway") => 3,
                Some("alley") => 4,
                Some("parking_aisle") => 5,
                Some("emergency_access") => 6,
                Some("drive-through") | Some("drive_through") => 7,
                _ => 0,
            },
            _ => 0,
        };
        if use_int != 0 {
            out.insert("use".into(), use_int.to_string());
        }

        if is_true(tags.get("toll")) {
            out.insert("toll".into(), "true".into());
        }
        if is_true(tags.get("tunnel")) {
            out.insert("tunnel".into(), "true".into());
        }
        if is_true(tags.get("bridge")) {
            out.insert("bridge".into(), "true".into());
        }
        if matches!(
            tags.get("surface").map(|s| s.as_str()),
            Some("unpaved") | Some("gravel") | Some("dirt") | Some("grass") | Some("ground")
                | Some("sand") | Some("mud")
        ) || highway == Some("track")
        {
            out.insert("surface".into(), "true".into());
        }
        if no_thru {
            out.insert("no_thru_traffic".into(), "true".into());
        }
        if is_true(tags.get("hgv")) || tags.get("hgv").map(|v| v == "designated").unwrap_or(false) {
            out.insert("truck_route".into(), "true".into());
        }
        if let Some(v) = tags.get("maxspeed") {
            if let Some(kph) = parse_speed(v) {
                out.insert("speed".into(), format!("{}", kph));
            }
        }
        if let Some(v) = tags.get("maxspeed:hgv") {
            if let Some(kph) = parse_speed(v) {
                out.insert("truck_speed".into(), format!("{}", kph));
            }
        }
        for key in ["maxheight", "maxwidth", "maxlength", "maxweight", "maxaxleload"] {
            if let Some(v) = tags.get(key) {
                out.insert(key.into(), v.clone());
            }
        }
        if tags.get("hazmat").map(|v| v == "no").unwrap_or(false) {
            out.insert("hazmat".into(), "true".into());
        }

        match tags.get("cycleway").map(|s| s.as_str()) {
            Some("shared_lane") | Some("shared") => {
                out.insert("cycle_lane".into(), "1".into());
            }
            Some("lane") => {
                out.insert("cycle_lane".into(), "2".into());
            }
            Some("track") | Some("opposite_track") => {
                out.insert("cycle_lane".into(), "3".into());
            }
            _ => {}
        }

        if let Some(lanes) = tags.get("lanes") {
            if lanes.parse::<u8>().is_ok() {
                out.insert("lanes".into(), lanes.clone());
            }
        }

        for (from, to) in [
            ("name", "name"),
            ("name:en", "name:en"),
            ("alt_name", "alt_name"),
            ("official_name", "official_name"),
            ("ref", "ref"),
            ("int_ref", "int_ref"),
            ("destination", "destination"),
            ("destination:ref", "destination:ref"),
            ("destination:ref:to", "destination:ref:to"),
            ("junction:ref", "junction_ref"),
        ] {
            if let Some(v) = tags.get(from) {
                if !v.is_empty() {
                    out.insert(to.into(), v.clone());
                }
            }
        }

        out
    }

    fn transform_node(&self, tags: &TagMap) -> TagMap {
        let mut out = TagMap::new();
        if let Some(v) = tags.get("exit_to") {
            out.insert("exit_to".into(), v.clone());
        }
        if let Some(v) = tags.get("ref") {
            out.insert("ref".into(), v.clone());
        }
        let barrier = tags.get("barrier").map(|s| s.as_str());
        if matches!(barrier, Some("gate") | Some("lift_gate")) {
            out.insert("gate".into(), "true".into());
        }
        if matches!(barrier, Some("bollard") | Some("block")) {
            out.insert("bollard".into(), "true".into());
        }
        if tags.get("highway").map(|v| v == "traffic_signals").unwrap_or(false) {
            out.insert("traffic_signal".into(), "true".into());
        }
        // Barriers restrict the modes that can pass the node.
        if matches!(barrier, Some("bollard") | Some("block")) {
            // pedestrian | bicycle
            out.insert("modes_mask".into(), "6".into());
        }
        out
    }
}

impl Default for BuiltinTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for BuiltinTransform {
    fn transform(&mut self, is_way: bool, tags: &TagMap) -> TagMap {
        if is_way {
            self.transform_way(tags)
        } else {
            self.transform_node(tags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_untagged_way_is_dropped() {
        let mut t = BuiltinTransform::new();
        let out = t.transform(true, &tags(&[("building", "yes")]));
        assert!(out.is_empty());
    }

    #[test]
    fn test_residential_way() {
        let mut t = BuiltinTransform::new();
        let out = t.transform(true, &tags(&[("highway", "residential"), ("name", "Elm St")]));
        assert_eq!(out.get("road_class").unwrap(), "5");
        assert_eq!(out.get("auto_forward").unwrap(), "true");
        assert_eq!(out.get("auto_backward").unwrap(), "true");
        assert_eq!(out.get("name").unwrap(), "Elm St");
        assert!(out.get("speed").is_none());
        assert!(out.get("default_speed").is_some());
    }

    #[test]
    fn test_oneway_motorway() {
        let mut t = BuiltinTransform::new();
        let out = t.transform(true, &tags(&[("highway", "motorway")]));
        assert_eq!(out.get("oneway").unwrap(), "true");
        assert_eq!(out.get("auto_forward").unwrap(), "true");
        assert_eq!(out.get("auto_backward").unwrap(), "false");
        assert_eq!(out.get("pedestrian").unwrap(), "false");
    }

    #[test]
    fn test_reverse_oneway_swaps_direction() {
        let mut t = BuiltinTransform::new();
        let out = t.transform(true, &tags(&[("highway", "primary"), ("oneway", "-1")]));
        assert_eq!(out.get("auto_forward").unwrap(), "false");
        assert_eq!(out.get("auto_backward").unwrap(), "true");
    }

    #[test]
    fn test_maxspeed_mph() {
        let mut t = BuiltinTransform::new();
        let out = t.transform(true, &tags(&[("highway", "primary"), ("maxspeed", "30 mph")]));
        let kph: f64 = out.get("speed").unwrap().parse().unwrap();
        assert!((kph - 48.28).abs() < 0.1);
    }

    #[test]
    fn test_ferry_without_highway() {
        let mut t = BuiltinTransform::new();
        let out = t.transform(true, &tags(&[("route", "ferry")]));
        assert_eq!(out.get("ferry").unwrap(), "true");
    }

    #[test]
    fn test_access_private_sets_destination_only() {
        let mut t = BuiltinTransform::new();
        let out = t.transform(true, &tags(&[("highway", "service"), ("access", "private")]));
        assert_eq!(out.get("private").unwrap(), "true");
    }

    #[test]
    fn test_node_bollard() {
        let mut t = BuiltinTransform::new();
        let out = t.transform(false, &tags(&[("barrier", "bollard")]));
        assert_eq!(out.get("bollard").unwrap(), "true");
        assert_eq!(out.get("modes_mask").unwrap(), "6");
    }

    #[test]
    fn test_plain_node_is_dropped() {
        let mut t = BuiltinTransform::new();
        assert!(t.transform(false, &tags(&[("tourism", "viewpoint")])).is_empty());
    }
}
