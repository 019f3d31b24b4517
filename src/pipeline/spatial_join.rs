use crate::error::{GeoflowError, Result};
use crate::pipeline::{CancelToken, Session, Stage, StageReport};
use crate::storage::SpatialTable;
use crate::types::{Record, RecordSet, Value};
use geo::{BoundingRect, Contains, Geometry, InteriorPoint, MultiPolygon, Point, Rect};
use metrics::counter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// One step of the join chain: copy `fields` from the polygon layer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpatialJoinConfig {
    pub layer: PathBuf,
    pub fields: Vec<String>,
}

struct Zone {
    shape: MultiPolygon<f64>,
    bounds: Option<Rect<f64>>,
    attributes: Record,
}

impl Zone {
    fn contains(&self, point: &Point<f64>) -> bool {
        if let Some(b) = self.bounds {
            let (min, max) = (b.min(), b.max());
            if point.x() < min.x || point.x() > max.x || point.y() < min.y || point.y() > max.y {
                return false;
            }
        }
        self.shape.contains(point)
    }
}

/// Polygon features of a spatial table, in file order
pub struct PolygonLayer {
    source: String,
    schema: Vec<String>,
    zones: Vec<Zone>,
}

impl PolygonLayer {
    pub fn load(path: &Path) -> Result<Self> {
        let table = SpatialTable::read(path)?;
        let set = table.records;
        let zones = set
            .records
            .into_iter()
            .filter_map(|record| {
                let shape = match &record.geometry {
                    Some(Geometry::Polygon(p)) => MultiPolygon::new(vec![p.clone()]),
                    Some(Geometry::MultiPolygon(mp)) => mp.clone(),
                    _ => return None,
                };
                Some(Zone {
                    bounds: shape.bounding_rect(),
                    shape,
                    attributes: record,
                })
            })
            .collect();
        Ok(Self {
            source: set.source,
            schema: set.schema,
            zones,
        })
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    fn require_fields(&self, fields: &[String]) -> Result<Vec<String>> {
        let lookup = RecordSet::new(self.source.clone(), self.schema.clone());
        fields.iter().map(|f| lookup.require_field(f)).collect()
    }

    fn first_containing(&self, point: &Point<f64>) -> Option<&Record> {
        self.zones
            .iter()
            .find(|zone| zone.contains(point))
            .map(|zone| &zone.attributes)
    }
}

/// The point used for point-in-polygon tests: the point itself, or a point
/// guaranteed to lie inside a polygon.
pub fn representative_point(geometry: &Geometry<f64>) -> Option<Point<f64>> {
    match geometry {
        Geometry::Point(p) => Some(*p),
        other => other.interior_point(),
    }
}

/// Keep-all spatial join: every record is kept; fields from the first
/// containing polygon are copied, Null when nothing contains it.
#[instrument(skip_all, fields(records = %set.source, layer = %layer.source))]
pub fn spatial_join(
    set: &RecordSet,
    layer: &PolygonLayer,
    fields: &[String],
    cancel: &CancelToken,
) -> Result<(RecordSet, usize)> {
    let fields = layer.require_fields(fields)?;
    let mut out = RecordSet::new(set.source.clone(), set.schema.clone());
    for field in &fields {
        out.push_field(field);
    }

    let mut matched = 0usize;
    for record in &set.records {
        cancel.check()?;
        let hit = record
            .geometry
            .as_ref()
            .and_then(representative_point)
            .and_then(|p| layer.first_containing(&p));
        matched += usize::from(hit.is_some());
        let joined = fields.iter().fold(record.clone(), |acc, field| {
            let value = hit.map(|zone| zone.get(field).clone()).unwrap_or(Value::Null);
            acc.with(field, value)
        });
        out.records.push(joined);
    }
    counter!("geoflow_spatial_join_matches_total").increment(matched as u64);
    Ok((out, matched))
}

/// Runs the configured join chain in order.
pub struct SpatialJoinStage;

impl Stage for SpatialJoinStage {
    fn name(&self) -> &'static str {
        "spatial_join"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<StageReport> {
        let joins = &session.job.spatial_join;
        if joins.is_empty() {
            return Ok(StageReport::success(self.name(), 0, "no spatial joins"));
        }
        let mut current = session.current.clone();
        let mut summary = Vec::with_capacity(joins.len());
        for join in joins {
            let layer = PolygonLayer::load(&join.layer)?;
            if layer.is_empty() {
                return Err(GeoflowError::Schema(format!(
                    "join layer {} has no polygon features",
                    join.layer.display()
                )));
            }
            let (joined, matched) = spatial_join(&current, &layer, &join.fields, &session.cancel)?;
            info!(
                "🗺️  Joined {} of {} records to {} ({} polygons)",
                matched,
                joined.len(),
                join.layer.display(),
                layer.len()
            );
            summary.push(format!("{}: {}", join.layer.display(), matched));
            current = joined;
        }
        let count = current.len();
        session.current = current;
        Ok(StageReport::success(self.name(), count, summary.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{atomic_write, write_features, FieldDef, TableSchema};
    use geo::{LineString, Polygon};
    use tempfile::tempdir;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                (x0, y0),
                (x0 + size, y0),
                (x0 + size, y0 + size),
                (x0, y0 + size),
                (x0, y0),
            ]),
            vec![],
        )
    }

    fn zoning_layer(dir: &Path) -> PathBuf {
        let path = dir.join("zoning.geojson");
        let schema = TableSchema::new(vec![FieldDef::text("ZONE", 10), FieldDef::text("DESC", 40)]).unwrap();
        let zones = vec![
            Record::from_iter([("ZONE", Value::Text("R1".into())), ("DESC", Value::Text("residential".into()))])
                .with_geometry(Some(Geometry::Polygon(square(0.0, 0.0, 10.0)))),
            Record::from_iter([("ZONE", Value::Text("C2".into())), ("DESC", Value::Text("overlap".into()))])
                .with_geometry(Some(Geometry::Polygon(square(5.0, 5.0, 10.0)))),
        ];
        atomic_write(&path, |f| write_features(f, "EPSG:4326", &schema, &zones, &CancelToken::new())).unwrap();
        path
    }

    fn targets() -> RecordSet {
        let mut set = RecordSet::new("parcels", vec!["AIN".into()]);
        set.records.push(
            Record::from_iter([("AIN", Value::Int(1))]).with_geometry(Some(Geometry::Point(Point::new(2.0, 2.0)))),
        );
        set.records.push(
            Record::from_iter([("AIN", Value::Int(2))]).with_geometry(Some(Geometry::Polygon(square(6.0, 6.0, 1.0)))),
        );
        set.records.push(
            Record::from_iter([("AIN", Value::Int(3))]).with_geometry(Some(Geometry::Point(Point::new(50.0, 50.0)))),
        );
        set.records.push(Record::from_iter([("AIN", Value::Int(4))]));
        set
    }

    #[test]
    fn keeps_every_record_and_takes_first_containing_polygon() {
        let dir = tempdir().unwrap();
        let layer = PolygonLayer::load(&zoning_layer(dir.path())).unwrap();
        assert_eq!(layer.len(), 2);

        let (out, matched) =
            spatial_join(&targets(), &layer, &["zone".to_string()], &CancelToken::new()).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(matched, 2);
        assert_eq!(out.schema, vec!["AIN", "ZONE"]);
        assert_eq!(out.records[0].get("ZONE"), &Value::Text("R1".into()));
        // inside both squares; the first feature wins
        assert_eq!(out.records[1].get("ZONE"), &Value::Text("R1".into()));
        assert!(out.records[2].get("ZONE").is_null());
        assert!(out.records[3].get("ZONE").is_null());
        assert!(out.records[3].contains("ZONE"));
    }

    #[test]
    fn unknown_layer_field_is_schema_error() {
        let dir = tempdir().unwrap();
        let layer = PolygonLayer::load(&zoning_layer(dir.path())).unwrap();
        let err = spatial_join(&targets(), &layer, &["ZIP".to_string()], &CancelToken::new()).unwrap_err();
        assert!(matches!(err, GeoflowError::Schema(_)));
    }

    #[test]
    fn representative_point_of_polygon_is_inside() {
        let polygon = square(0.0, 0.0, 4.0);
        let p = representative_point(&Geometry::Polygon(polygon.clone())).unwrap();
        assert!(polygon.contains(&p));
    }
}
