//! Pedestrian street network.
//!
//! Builds an unsimplified, bidirectional edge list from raw OSM ways: one
//! edge per consecutive node pair of every accepted way, in both directions.
//! Parallel edges between the same node pair are told apart by `key`.

use std::collections::{BTreeMap, HashMap};

use geo::{Coord, Geometry as GeoGeometry, HaversineLength, Intersects, LineString, MultiPolygon, Point};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collect::overpass::{OverpassElement, OverpassResponse};
use crate::commons::geometry_ops::buffer;
use crate::commons::vector_io::{float_value, FeatureTable, VectorFeature};
use crate::error::{PipelineError, Result};
use crate::geo_core::{CrsTransformer, EPSG_WGS84};

/// OSM tag filter for walkable ways.
///
/// A way is accepted when it carries every `required` key and, for each
/// `excluded` key it carries, the value contains none of the `|`-separated
/// alternatives (the Overpass `!~` operator, unanchored).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WayFilter {
    pub required: Vec<String>,
    pub excluded: BTreeMap<String, String>,
}

impl Default for WayFilter {
    fn default() -> Self {
        let excluded = [
            ("area", "yes"),
            ("highway", "motor|proposed|construction|abandoned|platform|raceway"),
            ("foot", "no"),
            ("service", "private"),
            ("access", "private"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        WayFilter {
            required: vec!["highway".to_string()],
            excluded,
        }
    }
}

impl WayFilter {
    pub fn accepts(&self, tags: &BTreeMap<String, String>) -> bool {
        if !self.required.iter().all(|key| tags.contains_key(key)) {
            return false;
        }

        self.excluded.iter().all(|(key, pattern)| match tags.get(key) {
            Some(value) => !pattern
                .split('|')
                .filter(|alt| !alt.is_empty())
                .any(|alt| value.contains(alt)),
            None => true,
        })
    }

    /// Overpass QL tag filter, e.g. `["highway"]["foot"!~"no"]`
    pub fn to_overpass_filter(&self) -> String {
        let required = self.required.iter().map(|key| format!("[\"{}\"]", key));
        let excluded = self
            .excluded
            .iter()
            .map(|(key, pattern)| format!("[\"{}\"!~\"{}\"]", key, pattern));
        required.chain(excluded).collect()
    }
}

/// Multigraph edge identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub u: i64,
    pub v: i64,
    pub key: u32,
}

impl EdgeKey {
    pub fn new(u: i64, v: i64, key: u32) -> Self {
        EdgeKey { u, v, key }
    }

    /// Read back the `u`, `v`, `key` attributes written by [`EdgeKey::insert_into`]
    pub fn from_properties(properties: &serde_json::Map<String, Value>) -> Option<Self> {
        let u = properties.get("u")?.as_i64()?;
        let v = properties.get("v")?.as_i64()?;
        let key = properties.get("key")?.as_u64()?;
        Some(EdgeKey::new(u, v, u32::try_from(key).ok()?))
    }

    pub fn insert_into(&self, properties: &mut serde_json::Map<String, Value>) {
        properties.insert("u".to_string(), Value::from(self.u));
        properties.insert("v".to_string(), Value::from(self.v));
        properties.insert("key".to_string(), Value::from(self.key));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreetEdge {
    pub key: EdgeKey,
    /// OSM way id
    pub osmid: i64,
    pub highway: String,
    pub name: Option<String>,
    pub oneway: bool,
    /// Traversal against the way's node order
    pub reversed: bool,
    /// Great-circle length in meters
    pub length: f64,
    pub geometry: LineString<f64>,
}

impl StreetEdge {
    pub fn properties(&self) -> serde_json::Map<String, Value> {
        let mut properties = serde_json::Map::new();
        self.key.insert_into(&mut properties);
        properties.insert("osmid".to_string(), Value::from(self.osmid));
        properties.insert("highway".to_string(), Value::from(self.highway.clone()));
        properties.insert(
            "name".to_string(),
            self.name.clone().map_or(Value::Null, Value::String),
        );
        properties.insert("oneway".to_string(), Value::from(self.oneway));
        properties.insert("reversed".to_string(), Value::from(self.reversed));
        properties.insert("length".to_string(), float_value(self.length));
        properties
    }
}

/// Buffered polygon sampled for one edge
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingZone {
    pub key: EdgeKey,
    pub geometry: GeoGeometry<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreetNetwork {
    pub epsg: i32,
    pub edges: Vec<StreetEdge>,
}

impl StreetNetwork {
    /// Walk network of the accepted ways, truncated by edge to `aoi`.
    ///
    /// `aoi` is in WGS84 (x = lon). An edge is kept when at least one of its
    /// endpoints lies inside the area; disconnected components are retained.
    pub fn from_overpass(
        response: &OverpassResponse,
        aoi: &MultiPolygon<f64>,
        filter: &WayFilter,
    ) -> Result<StreetNetwork> {
        let nodes: HashMap<i64, Coord<f64>> = response
            .elements
            .iter()
            .filter_map(|element| match element {
                OverpassElement::Node { id, lat, lon, .. } => {
                    Some((*id, Coord { x: *lon, y: *lat }))
                }
                _ => None,
            })
            .collect();

        let mut key_counter: HashMap<(i64, i64), u32> = HashMap::new();
        let mut next_key = |u: i64, v: i64| {
            let counter = key_counter.entry((u, v)).or_insert(0);
            let key = *counter;
            *counter += 1;
            EdgeKey::new(u, v, key)
        };

        let mut edges = Vec::new();
        let mut ways = 0usize;
        let mut missing_nodes = 0usize;

        for element in &response.elements {
            let OverpassElement::Way { id, nodes: refs, tags } = element else {
                continue;
            };
            if !filter.accepts(tags) {
                continue;
            }
            ways += 1;

            let highway = tags.get("highway").cloned().unwrap_or_default();
            let name = tags.get("name").cloned();

            for pair in refs.windows(2) {
                let (u, v) = (pair[0], pair[1]);
                let (Some(&start), Some(&end)) = (nodes.get(&u), nodes.get(&v)) else {
                    missing_nodes += 1;
                    continue;
                };

                let inside = aoi.intersects(&Point::from(start)) || aoi.intersects(&Point::from(end));
                if !inside {
                    continue;
                }

                let length = LineString::new(vec![start, end]).haversine_length();
                for (from, to, a, b, reversed) in [(u, v, start, end, false), (v, u, end, start, true)] {
                    edges.push(StreetEdge {
                        key: next_key(from, to),
                        osmid: *id,
                        highway: highway.clone(),
                        name: name.clone(),
                        oneway: false,
                        reversed,
                        length,
                        geometry: LineString::new(vec![a, b]),
                    });
                }
            }
        }

        if missing_nodes > 0 {
            log::warn!("{} way segments reference nodes absent from the OSM data", missing_nodes);
        }
        if edges.is_empty() {
            return Err(PipelineError::Network(
                "No pedestrian ways found within the area of interest".to_string(),
            ));
        }

        log::info!("Street network: {} ways, {} edges", ways, edges.len());
        Ok(StreetNetwork {
            epsg: EPSG_WGS84,
            edges,
        })
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn to_crs(&self, to_epsg: i32) -> Result<StreetNetwork> {
        if self.epsg == to_epsg {
            return Ok(self.clone());
        }

        let transformer = CrsTransformer::new(self.epsg, to_epsg)?;
        let edges = self
            .edges
            .iter()
            .map(|edge| {
                Ok(StreetEdge {
                    geometry: transformer.transform_line_string(&edge.geometry)?,
                    ..edge.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StreetNetwork {
            epsg: to_epsg,
            edges,
        })
    }

    /// Buffer every edge; the edges themselves keep their linestrings
    pub fn sampling_zones(&self, distance: f64) -> Result<Vec<SamplingZone>> {
        self.edges
            .iter()
            .map(|edge| {
                Ok(SamplingZone {
                    key: edge.key,
                    geometry: buffer(&GeoGeometry::LineString(edge.geometry.clone()), distance)?,
                })
            })
            .collect()
    }

    pub fn to_feature_table(&self) -> FeatureTable {
        let mut table = FeatureTable::new(self.epsg);
        for edge in &self.edges {
            table.push(VectorFeature {
                geometry: GeoGeometry::LineString(edge.geometry.clone()),
                properties: edge.properties(),
            });
        }
        table
    }
}
