//! External lookup services used by the geometry resolver.
//!
//! The resolver only sees the two traits below; the production
//! implementation talks to Nominatim and the OSM polygons service, tests plug
//! in fixed answers.

pub mod nominatim;
pub mod rate_limiter;

use crate::error::Result;
use crate::pipeline::CancelToken;
use geo::Polygon;
use std::rc::Rc;

pub use nominatim::{NominatimClient, ServiceSettings};
pub use rate_limiter::{Limits, RateLimiter};

/// A geocoding request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GeocodeQuery {
    /// Free-text search (`q=`)
    FreeText(String),
    /// Structured search, e.g. `county=Los Angeles&state=CA`
    Structured(Vec<(String, String)>),
}

impl GeocodeQuery {
    /// Query parameters as sent to the service
    pub fn params(&self) -> Vec<(String, String)> {
        match self {
            GeocodeQuery::FreeText(q) => vec![("q".to_string(), q.clone())],
            GeocodeQuery::Structured(pairs) => pairs.clone(),
        }
    }
}

/// One geocoder result
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub lon: f64,
    pub lat: f64,
    /// OSM object id used for the boundary lookup
    pub osm_id: Option<i64>,
    pub display_name: Option<String>,
}

pub trait GeocodingService {
    /// Ordered candidates; an empty list means "no match", not an error.
    fn search(&self, query: &GeocodeQuery) -> Result<Vec<Candidate>>;
}

pub trait BoundaryService {
    /// Outer ring (plus holes) for an OSM id, or `None` when the service has nothing.
    fn boundary(&self, osm_id: i64) -> Result<Option<Polygon<f64>>>;
}

/// The pair of services a run resolves geometry against
pub struct Services {
    pub geocoder: Box<dyn GeocodingService>,
    pub boundaries: Box<dyn BoundaryService>,
}

impl Services {
    pub fn new(geocoder: Box<dyn GeocodingService>, boundaries: Box<dyn BoundaryService>) -> Self {
        Self { geocoder, boundaries }
    }

    /// Both roles served by one shared Nominatim client that gives up
    /// retrying once `cancel` fires.
    pub fn nominatim(settings: ServiceSettings, cancel: &CancelToken) -> Result<Self> {
        let client = Rc::new(NominatimClient::new(settings)?.with_cancel(cancel.clone()));
        Ok(Self {
            geocoder: Box::new(client.clone()),
            boundaries: Box::new(client),
        })
    }

    /// Services that never match, for jobs without lookups.
    pub fn offline() -> Self {
        Self::new(Box::new(NoLookup), Box::new(NoLookup))
    }
}

impl<T: GeocodingService + ?Sized> GeocodingService for Rc<T> {
    fn search(&self, query: &GeocodeQuery) -> Result<Vec<Candidate>> {
        (**self).search(query)
    }
}

impl<T: BoundaryService + ?Sized> BoundaryService for Rc<T> {
    fn boundary(&self, osm_id: i64) -> Result<Option<Polygon<f64>>> {
        (**self).boundary(osm_id)
    }
}

/// A geocoder that never matches; used when no lookup mode is configured.
pub struct NoLookup;

impl GeocodingService for NoLookup {
    fn search(&self, _query: &GeocodeQuery) -> Result<Vec<Candidate>> {
        Ok(Vec::new())
    }
}

impl BoundaryService for NoLookup {
    fn boundary(&self, _osm_id: i64) -> Result<Option<Polygon<f64>>> {
        Ok(None)
    }
}
