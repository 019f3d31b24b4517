use crate::error::{GeoflowError, Result};
use crate::pipeline::{SkipReason, Session, Stage, StageReport};
use crate::services::{GeocodeQuery, Services};
use crate::types::{Record, RecordSet};
use geo::{Geometry, Point};
use metrics::counter;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Kind of place a lookup resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceKind {
    /// Point from the geocoder
    City,
    /// Boundary polygon; needs a state qualifier
    County,
    /// Boundary polygon
    State,
}

/// How each record gets its geometry
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GeometryMode {
    /// Tabular only; records keep whatever geometry they came with
    #[default]
    None,
    Direct {
        lat_field: String,
        lon_field: String,
    },
    Lookup {
        place: PlaceKind,
        field: String,
        #[serde(default)]
        qualifier: Option<String>,
    },
}

impl GeometryMode {
    pub fn needs_services(&self) -> bool {
        matches!(self, GeometryMode::Lookup { .. })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            GeometryMode::None => Ok(()),
            GeometryMode::Direct { lat_field, lon_field } => {
                if lat_field.trim().is_empty() || lon_field.trim().is_empty() {
                    return Err(GeoflowError::Config(
                        "direct geometry needs lat_field and lon_field".to_string(),
                    ));
                }
                Ok(())
            }
            GeometryMode::Lookup {
                place,
                field,
                qualifier,
            } => {
                if field.trim().is_empty() {
                    return Err(GeoflowError::Config("lookup geometry needs a place field".to_string()));
                }
                let missing_qualifier = qualifier.as_deref().map_or(true, |q| q.trim().is_empty());
                if *place == PlaceKind::County && missing_qualifier {
                    return Err(GeoflowError::Config(
                        "county lookups need a qualifier (the state)".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn coordinate(record: &Record, field: &str, limit: f64) -> Result<f64> {
    let raw = record.get(field);
    if raw.is_null() {
        return Err(GeoflowError::GeometryParse(format!("{} is empty", field)));
    }
    let value = raw
        .as_f64()
        .ok_or_else(|| GeoflowError::GeometryParse(format!("{} = '{}' is not a number", field, raw)))?;
    if value.abs() > limit {
        return Err(GeoflowError::GeometryParse(format!(
            "{} = {} is out of range",
            field, value
        )));
    }
    Ok(value)
}

/// Point from coordinate columns.
pub fn point_from_fields(record: &Record, lat_field: &str, lon_field: &str) -> Result<Point<f64>> {
    let lat = coordinate(record, lat_field, 90.0)?;
    let lon = coordinate(record, lon_field, 180.0)?;
    Ok(Point::new(lon, lat))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    place: PlaceKind,
    query: String,
    qualifier: Option<String>,
}

type Outcome = std::result::Result<Geometry<f64>, (SkipReason, String)>;

/// Resolves geometry for records, caching lookups by place within a run
pub struct GeometryResolver<'s> {
    mode: GeometryMode,
    services: &'s Services,
    cache: HashMap<LookupKey, Outcome>,
}

impl<'s> GeometryResolver<'s> {
    pub fn new(mode: GeometryMode, services: &'s Services) -> Self {
        Self {
            mode,
            services,
            cache: HashMap::new(),
        }
    }

    /// Fails with `SchemaError` when the fields the mode reads are absent.
    pub fn check_schema(&self, set: &RecordSet) -> Result<()> {
        match &self.mode {
            GeometryMode::None => Ok(()),
            GeometryMode::Direct { lat_field, lon_field } => {
                set.require_field(lat_field)?;
                set.require_field(lon_field)?;
                Ok(())
            }
            GeometryMode::Lookup { field, .. } => set.require_field(field).map(|_| ()),
        }
    }

    pub fn cached_lookups(&self) -> usize {
        self.cache.len()
    }

    /// Geometry for one record. Soft errors mean "no geometry for this record".
    pub fn resolve(&mut self, record: &Record) -> Result<Option<Geometry<f64>>> {
        let mode = self.mode.clone();
        match mode {
            GeometryMode::None => Ok(None),
            GeometryMode::Direct { lat_field, lon_field } => {
                point_from_fields(record, &lat_field, &lon_field).map(|p| Some(Geometry::Point(p)))
            }
            GeometryMode::Lookup {
                place,
                field,
                qualifier,
            } => {
                let Some(name) = record.get(&field).key_string().filter(|s| !s.is_empty()) else {
                    return Err(GeoflowError::LookupMiss(format!("{} is empty", field)));
                };
                let key = LookupKey {
                    place,
                    query: name.to_lowercase(),
                    qualifier: qualifier.clone(),
                };
                if let Some(hit) = self.cache.get(&key) {
                    counter!("geoflow_lookup_cache_hits_total").increment(1);
                    return hit.clone().map(Some).map_err(|(r, m)| r.to_error(m));
                }
                let outcome: Outcome = match self.lookup(place, &name, qualifier.as_deref()) {
                    Ok(g) => Ok(g),
                    Err(GeoflowError::GeometryParse(m)) => Err((SkipReason::GeometryParse, m)),
                    Err(GeoflowError::LookupMiss(m)) => Err((SkipReason::LookupMiss, m)),
                    Err(GeoflowError::Service(m)) => Err((SkipReason::ServiceError, m)),
                    Err(fatal) => return Err(fatal),
                };
                self.cache.insert(key, outcome.clone());
                outcome.map(Some).map_err(|(r, m)| r.to_error(m))
            }
        }
    }

    fn lookup(&self, place: PlaceKind, name: &str, qualifier: Option<&str>) -> Result<Geometry<f64>> {
        let query = match (place, qualifier) {
            (PlaceKind::City, None) => GeocodeQuery::FreeText(name.to_string()),
            (PlaceKind::City, Some(q)) => GeocodeQuery::FreeText(format!("{}, {}", name, q)),
            (PlaceKind::County, q) => GeocodeQuery::Structured(vec![
                ("county".to_string(), name.to_string()),
                ("state".to_string(), q.unwrap_or_default().to_string()),
            ]),
            (PlaceKind::State, _) => {
                GeocodeQuery::Structured(vec![("state".to_string(), name.to_string())])
            }
        };
        counter!("geoflow_lookups_total", "place" => format!("{:?}", place)).increment(1);
        let candidates = self.services.geocoder.search(&query)?;
        let Some(first) = candidates.into_iter().next() else {
            return Err(GeoflowError::LookupMiss(name.to_string()));
        };
        debug!(place = ?place, name, lon = first.lon, lat = first.lat, "geocoded");

        if place == PlaceKind::City {
            return Ok(Geometry::Point(Point::new(first.lon, first.lat)));
        }
        let osm_id = first
            .osm_id
            .ok_or_else(|| GeoflowError::LookupMiss(format!("{}: no boundary id", name)))?;
        self.services
            .boundaries
            .boundary(osm_id)?
            .map(Geometry::Polygon)
            .ok_or_else(|| GeoflowError::LookupMiss(format!("{}: empty boundary for {}", name, osm_id)))
    }
}

/// Attaches point or polygon geometry to every record that can get one.
pub struct GeometryStage;

impl Stage for GeometryStage {
    fn name(&self) -> &'static str {
        "geometry"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<StageReport> {
        let mode = session.job.geometry.clone();
        if mode == GeometryMode::None {
            let existing = session.current.geometry_count();
            return Ok(StageReport::success(
                self.name(),
                existing,
                format!("no geometry mode; {} records carry geometry", existing),
            ));
        }

        let mut resolver = GeometryResolver::new(mode, session.services);
        resolver.check_schema(&session.current)?;

        let source = session.current.source.clone();
        let mut resolved = 0usize;
        let mut skipped = 0usize;
        let mut records = Vec::with_capacity(session.current.len());
        for (row, record) in session.current.records.iter().enumerate() {
            session.cancel.check()?;
            if record.geometry.is_some() {
                resolved += 1;
                records.push(record.clone());
                continue;
            }
            match resolver.resolve(record) {
                Ok(geometry) => {
                    resolved += usize::from(geometry.is_some());
                    records.push(record.with_geometry(geometry));
                }
                Err(e) => match SkipReason::of(&e) {
                    Some(reason) => {
                        warn!(source = %source, row = row + 1, reason = reason.as_str(), "{}", e);
                        session.skipped.record(reason);
                        skipped += 1;
                        records.push(record.with_geometry(None));
                    }
                    None => return Err(e),
                },
            }
        }

        info!(
            resolved,
            skipped,
            lookups = resolver.cached_lookups(),
            "🌍 Resolved geometry"
        );
        session.current = RecordSet {
            source,
            schema: session.current.schema.clone(),
            records,
        };
        Ok(StageReport::with_skipped(
            self.name(),
            resolved,
            skipped,
            format!("{} records with geometry", resolved),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{BoundaryService, Candidate, GeocodingService};
    use crate::types::Value;
    use geo::{LineString, Polygon};
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingGeocoder {
        calls: Rc<Cell<usize>>,
    }

    impl GeocodingService for CountingGeocoder {
        fn search(&self, query: &GeocodeQuery) -> Result<Vec<Candidate>> {
            self.calls.set(self.calls.get() + 1);
            let text = format!("{:?}", query);
            if text.contains("Atlantis") {
                return Ok(Vec::new());
            }
            if text.contains("Flaky") {
                return Err(GeoflowError::Service("HTTP 503".into()));
            }
            Ok(vec![Candidate {
                lon: -118.3,
                lat: 34.2,
                osm_id: Some(42),
                display_name: None,
            }])
        }
    }

    struct SquareBoundary;

    impl BoundaryService for SquareBoundary {
        fn boundary(&self, osm_id: i64) -> Result<Option<Polygon<f64>>> {
            if osm_id != 42 {
                return Ok(None);
            }
            Ok(Some(Polygon::new(
                LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]),
                vec![],
            )))
        }
    }

    fn services(calls: Rc<Cell<usize>>) -> Services {
        Services::new(Box::new(CountingGeocoder { calls }), Box::new(SquareBoundary))
    }

    fn place(name: &str) -> Record {
        [("PLACE", Value::Text(name.to_string()))].into_iter().collect()
    }

    #[test]
    fn direct_mode_parses_and_range_checks() {
        let ok: Record = [("LAT", Value::Float(34.18)), ("LON", Value::Text("-118.31".into()))]
            .into_iter()
            .collect();
        assert_eq!(point_from_fields(&ok, "lat", "lon").unwrap(), Point::new(-118.31, 34.18));

        let bad: Record = [("LAT", Value::Text("north".into())), ("LON", Value::Int(1))]
            .into_iter()
            .collect();
        assert!(matches!(point_from_fields(&bad, "LAT", "LON"), Err(GeoflowError::GeometryParse(_))));

        let far: Record = [("LAT", Value::Int(95)), ("LON", Value::Int(1))].into_iter().collect();
        assert!(matches!(point_from_fields(&far, "LAT", "LON"), Err(GeoflowError::GeometryParse(_))));
    }

    #[test]
    fn city_lookups_are_cached_by_name() {
        let calls = Rc::new(Cell::new(0));
        let services = services(calls.clone());
        let mode = GeometryMode::Lookup {
            place: PlaceKind::City,
            field: "place".into(),
            qualifier: None,
        };
        let mut resolver = GeometryResolver::new(mode, &services);

        for name in ["Burbank", "burbank", "BURBANK"] {
            let geometry = resolver.resolve(&place(name)).unwrap();
            assert_eq!(geometry, Some(Geometry::Point(Point::new(-118.3, 34.2))));
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn misses_and_service_errors_are_soft_and_cached() {
        let calls = Rc::new(Cell::new(0));
        let services = services(calls.clone());
        let mode = GeometryMode::Lookup {
            place: PlaceKind::State,
            field: "PLACE".into(),
            qualifier: None,
        };
        let mut resolver = GeometryResolver::new(mode, &services);

        let miss = resolver.resolve(&place("Atlantis")).unwrap_err();
        assert!(matches!(miss, GeoflowError::LookupMiss(_)));
        assert!(resolver.resolve(&place("Atlantis")).is_err());

        let flaky = resolver.resolve(&place("Flaky")).unwrap_err();
        assert!(matches!(flaky, GeoflowError::Service(_)));
        assert!(flaky.is_soft());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn state_lookup_returns_boundary_polygon() {
        let calls = Rc::new(Cell::new(0));
        let services = services(calls);
        let mode = GeometryMode::Lookup {
            place: PlaceKind::State,
            field: "PLACE".into(),
            qualifier: None,
        };
        let mut resolver = GeometryResolver::new(mode, &services);
        let geometry = resolver.resolve(&place("California")).unwrap();
        assert!(matches!(geometry, Some(Geometry::Polygon(_))));
    }

    #[test]
    fn county_requires_qualifier() {
        let mode = GeometryMode::Lookup {
            place: PlaceKind::County,
            field: "NAME".into(),
            qualifier: None,
        };
        assert!(matches!(mode.validate(), Err(GeoflowError::Config(_))));
    }

    #[test]
    fn missing_coordinate_field_is_schema_error() {
        let services = Services::offline();
        let resolver = GeometryResolver::new(
            GeometryMode::Direct {
                lat_field: "LAT".into(),
                lon_field: "LON".into(),
            },
            &services,
        );
        let set = RecordSet::new("s", vec!["NAME".into(), "LAT".into()]);
        assert!(matches!(resolver.check_schema(&set), Err(GeoflowError::Schema(_))));
    }
}
