use std::path::Path;

use gdal::spatial_ref::SpatialRef;
use gdal::vector::{FieldValue, LayerAccess, LayerOptions, OGRFieldType, OGRwkbGeometryType};
use gdal::{Dataset, DriverManager};
use geo::Geometry as GeoGeometry;
use geojson::{Feature, FeatureCollection, GeoJson};
use serde_json::{json, Map, Value};

use crate::commons::geometry_ops::{from_wkt, to_wkt};
use crate::error::{PipelineError, Result};
use crate::geo_core::{CrsTransformer, EPSG_WGS84};

/// JSON number for a float attribute; NaN and infinities become null
pub fn float_value(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// One record: geometry plus named attributes
#[derive(Debug, Clone, PartialEq)]
pub struct VectorFeature {
    pub geometry: GeoGeometry<f64>,
    pub properties: Map<String, Value>,
}

impl VectorFeature {
    pub fn new(geometry: GeoGeometry<f64>) -> Self {
        VectorFeature {
            geometry,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// Ordered feature table with an explicit CRS (GeoDataFrame equivalent)
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub epsg: i32,
    /// Attribute columns in schema order
    pub columns: Vec<String>,
    pub features: Vec<VectorFeature>,
}

impl FeatureTable {
    pub fn new(epsg: i32) -> Self {
        FeatureTable {
            epsg,
            columns: Vec::new(),
            features: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Append a feature, extending the schema with unseen attribute names
    pub fn push(&mut self, feature: VectorFeature) {
        for key in feature.properties.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
        self.features.push(feature);
    }

    /// Fail with a schema error listing every absent column
    pub fn require_columns(&self, required: &[&str]) -> Result<()> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !self.columns.iter().any(|c| c == name))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Schema(format!(
                "Missing attribute column(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Reproject every geometry; the target EPSG becomes the table CRS
    pub fn to_crs(&self, to_epsg: i32) -> Result<FeatureTable> {
        if self.epsg == to_epsg {
            return Ok(self.clone());
        }

        let transformer = CrsTransformer::new(self.epsg, to_epsg)?;
        let features = self
            .features
            .iter()
            .map(|f| {
                Ok(VectorFeature {
                    geometry: transformer.transform_geometry(&f.geometry)?,
                    properties: f.properties.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FeatureTable {
            epsg: to_epsg,
            columns: self.columns.clone(),
            features,
        })
    }

    /// Read a vector file fully into memory.
    ///
    /// `.geojson`/`.json` are parsed with the `geojson` crate, every other
    /// extension goes through GDAL/OGR (first layer).
    pub fn read(path: impl AsRef<Path>) -> Result<FeatureTable> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::io(path, "file does not exist"));
        }

        if is_geojson_path(path) {
            let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
            let geojson: GeoJson = content
                .parse()
                .map_err(|e| PipelineError::io(path, format!("invalid GeoJSON: {}", e)))?;
            Self::from_geojson(&geojson)
        } else {
            Self::read_with_gdal(path)
        }
    }

    /// Write the table. GeoJSON by extension, otherwise a GeoPackage layer.
    pub fn write(&self, path: impl AsRef<Path>, layer_name: &str) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
            }
        }

        if is_geojson_path(path) {
            let content = self.to_geojson().to_string();
            std::fs::write(path, content).map_err(|e| PipelineError::io(path, e))?;
        } else {
            self.write_with_gdal(path, layer_name)?;
        }

        log::info!("{} features saved to: {:?}", self.len(), path);
        Ok(())
    }

    /// Build from a GeoJSON document.
    /// Honors the legacy `crs` member GDAL and GeoPandas write for
    /// non-WGS84 GeoJSON; defaults to EPSG:4326.
    pub fn from_geojson(geojson: &GeoJson) -> Result<FeatureTable> {
        let (features, epsg) = match geojson {
            GeoJson::FeatureCollection(fc) => {
                let epsg = fc
                    .foreign_members
                    .as_ref()
                    .and_then(|m| m.get("crs"))
                    .and_then(parse_crs_member)
                    .unwrap_or(EPSG_WGS84);
                (fc.features.clone(), epsg)
            }
            GeoJson::Feature(f) => (vec![f.clone()], EPSG_WGS84),
            GeoJson::Geometry(g) => (vec![Feature::from(g.clone())], EPSG_WGS84),
        };

        let mut table = FeatureTable::new(epsg);
        for feature in features {
            let Some(geometry) = feature.geometry else {
                continue;
            };
            let geometry: GeoGeometry<f64> = geometry.try_into().map_err(|e| {
                PipelineError::Geometry(format!("Unsupported GeoJSON geometry: {}", e))
            })?;
            table.push(VectorFeature {
                geometry,
                properties: feature.properties.unwrap_or_default(),
            });
        }

        Ok(table)
    }

    pub fn to_geojson(&self) -> GeoJson {
        let features = self
            .features
            .iter()
            .map(|f| {
                let geometry = geojson::Geometry::new(geojson::Value::from(&f.geometry));
                let mut feature = Feature::from(geometry);
                for (key, value) in &f.properties {
                    feature.set_property(key.clone(), value.clone());
                }
                feature
            })
            .collect();

        let foreign_members = (self.epsg != EPSG_WGS84).then(|| {
            let mut members = Map::new();
            members.insert(
                "crs".to_string(),
                json!({
                    "type": "name",
                    "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", self.epsg) }
                }),
            );
            members
        });

        GeoJson::FeatureCollection(FeatureCollection {
            bbox: None,
            features,
            foreign_members,
        })
    }

    fn read_with_gdal(path: &Path) -> Result<FeatureTable> {
        let dataset = Dataset::open(path).map_err(|e| PipelineError::io(path, e))?;
        let mut layer = dataset
            .layer(0)
            .map_err(|e| PipelineError::Schema(format!("No layer in {:?}: {}", path, e)))?;

        let epsg = match layer.spatial_ref() {
            Some(srs) => epsg_code(srs).ok_or_else(|| {
                PipelineError::Projection(format!("Layer CRS of {:?} has no EPSG code", path))
            })?,
            None => {
                log::warn!("No CRS on {:?}, assuming EPSG:{}", path, EPSG_WGS84);
                EPSG_WGS84
            }
        };

        let mut table = FeatureTable::new(epsg);
        table.columns = layer.defn().fields().map(|field| field.name()).collect();

        for feature in layer.features() {
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            let wkt = geometry
                .wkt()
                .map_err(|e| PipelineError::Geometry(format!("Failed to get WKT: {}", e)))?;

            let mut properties = Map::new();
            for (name, value) in feature.fields() {
                properties.insert(name, field_value_to_json(value));
            }

            table.features.push(VectorFeature {
                geometry: from_wkt(&wkt)?,
                properties,
            });
        }

        Ok(table)
    }

    fn write_with_gdal(&self, path: &Path, layer_name: &str) -> Result<()> {
        let gdal_err = |e: gdal::errors::GdalError| PipelineError::io(path, e);

        if path.exists() {
            std::fs::remove_file(path).map_err(|e| PipelineError::io(path, e))?;
        }

        let driver = DriverManager::get_driver_by_name("GPKG").map_err(gdal_err)?;
        let mut dataset = driver.create_vector_only(path).map_err(gdal_err)?;
        let srs = SpatialRef::from_epsg(self.epsg as u32)
            .map_err(|e| PipelineError::Projection(e.to_string()))?;

        let field_defs: Vec<(String, u32)> = self
            .columns
            .iter()
            .map(|name| (name.clone(), self.column_field_type(name)))
            .collect();

        let mut txn = dataset.start_transaction().map_err(gdal_err)?;
        {
            let mut layer = txn
                .create_layer(LayerOptions {
                    name: layer_name,
                    srs: Some(&srs),
                    ty: OGRwkbGeometryType::wkbUnknown,
                    options: None,
                })
                .map_err(gdal_err)?;

            let defs: Vec<(&str, u32)> = field_defs.iter().map(|(n, t)| (n.as_str(), *t)).collect();
            layer.create_defn_fields(&defs).map_err(gdal_err)?;

            for feature in &self.features {
                let geometry = gdal::vector::Geometry::from_wkt(&to_wkt(&feature.geometry)?)
                    .map_err(|e| PipelineError::Geometry(e.to_string()))?;

                let mut names = Vec::new();
                let mut values = Vec::new();
                for (name, field_type) in &field_defs {
                    if let Some(value) = feature
                        .properties
                        .get(name)
                        .and_then(|v| json_to_field_value(v, *field_type))
                    {
                        names.push(name.as_str());
                        values.push(value);
                    }
                }

                layer
                    .create_feature_fields(geometry, &names, &values)
                    .map_err(gdal_err)?;
            }
        }

        txn.commit().map_err(gdal_err)?;
        Ok(())
    }

    /// OGR type able to hold every non-null value of a column
    fn column_field_type(&self, name: &str) -> u32 {
        let mut all_int = true;
        let mut all_number = true;
        let mut any = false;

        for value in self.features.iter().filter_map(|f| f.properties.get(name)) {
            match value {
                Value::Null => continue,
                Value::Number(n) => {
                    any = true;
                    if !(n.is_i64() || n.is_u64()) {
                        all_int = false;
                    }
                }
                Value::Bool(_) => {
                    any = true;
                }
                _ => {
                    any = true;
                    all_int = false;
                    all_number = false;
                }
            }
        }

        if !any || !all_number {
            OGRFieldType::OFTString
        } else if all_int {
            OGRFieldType::OFTInteger64
        } else {
            OGRFieldType::OFTReal
        }
    }
}

/// EPSG code of a spatial reference, identified from its definition when
/// the WKT carries no top-level authority
pub fn epsg_code(mut srs: SpatialRef) -> Option<i32> {
    if let Ok(code) = srs.auth_code() {
        return Some(code);
    }
    srs.auto_identify_epsg().ok()?;
    srs.auth_code().ok()
}

fn is_geojson_path(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase())
            .as_deref(),
        Some("geojson") | Some("json")
    )
}

/// `urn:ogc:def:crs:EPSG::28992` or `EPSG:28992` -> 28992
fn parse_crs_member(crs: &Value) -> Option<i32> {
    let name = crs.get("properties")?.get("name")?.as_str()?;
    name.rsplit(':').next()?.parse().ok()
}

fn field_value_to_json(value: Option<FieldValue>) -> Value {
    match value {
        None => Value::Null,
        Some(FieldValue::IntegerValue(v)) => Value::from(v),
        Some(FieldValue::Integer64Value(v)) => Value::from(v),
        Some(FieldValue::RealValue(v)) => float_value(v),
        Some(FieldValue::StringValue(v)) => Value::String(v),
        Some(other) => other.into_string().map_or(Value::Null, Value::String),
    }
}

fn json_to_field_value(value: &Value, field_type: u32) -> Option<FieldValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) if field_type == OGRFieldType::OFTString => {
            Some(FieldValue::StringValue(b.to_string()))
        }
        Value::Bool(b) => Some(FieldValue::Integer64Value(i64::from(*b))),
        Value::Number(n) if field_type == OGRFieldType::OFTInteger64 => {
            n.as_i64().map(FieldValue::Integer64Value)
        }
        Value::Number(n) if field_type == OGRFieldType::OFTReal => {
            n.as_f64().map(FieldValue::RealValue)
        }
        Value::String(s) => Some(FieldValue::StringValue(s.clone())),
        other => Some(FieldValue::StringValue(other.to_string())),
    }
}
