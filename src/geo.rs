//! Great-circle distances and the radius/category filter used by map and
//! list views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Mean earth radius in meters (spherical approximation).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Exact international mile.
pub const METERS_PER_MILE: f64 = 1_609.344;
pub const METERS_PER_KILOMETER: f64 = 1_000.0;

/// A point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Returns `None` for non-finite or out-of-range values.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    pub fn distance_to(&self, other: &Coordinates) -> Distance {
        haversine(*self, *other)
    }
}

/// Haversine distance between two points.
pub fn haversine(a: Coordinates, b: Coordinates) -> Distance {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = phi2 - phi1;
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    Distance::from_meters(2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    Miles,
    Kilometers,
}

/// A non-negative distance, stored in meters.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distance(f64);

impl Distance {
    pub fn from_meters(meters: f64) -> Self {
        Self(meters.max(0.0))
    }

    pub fn new(value: f64, unit: DistanceUnit) -> Self {
        match unit {
            DistanceUnit::Miles => Self::from_meters(value * METERS_PER_MILE),
            DistanceUnit::Kilometers => Self::from_meters(value * METERS_PER_KILOMETER),
        }
    }

    pub fn meters(self) -> f64 {
        self.0
    }

    pub fn miles(self) -> f64 {
        self.0 / METERS_PER_MILE
    }

    pub fn kilometers(self) -> f64 {
        self.0 / METERS_PER_KILOMETER
    }

    pub fn in_unit(self, unit: DistanceUnit) -> f64 {
        match unit {
            DistanceUnit::Miles => self.miles(),
            DistanceUnit::Kilometers => self.kilometers(),
        }
    }

    /// Human-readable label, e.g. `"6.9 mi"` or `"850 m"`.
    pub fn display(self, unit: DistanceUnit) -> String {
        match unit {
            DistanceUnit::Miles => format!("{:.1} mi", self.miles()),
            DistanceUnit::Kilometers if self.0 < METERS_PER_KILOMETER => {
                format!("{:.0} m", self.0)
            }
            DistanceUnit::Kilometers => format!("{:.1} km", self.kilometers()),
        }
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display(DistanceUnit::Kilometers))
    }
}

/// Anything that can be placed on the map.
pub trait Geotagged {
    fn coordinates(&self) -> Option<Coordinates>;

    fn category(&self) -> Option<&str> {
        None
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// A map pin supplied by a client (points of interest, saved places).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Geotagged for Place {
    fn coordinates(&self) -> Option<Coordinates> {
        Coordinates::new(self.latitude?, self.longitude?)
    }

    fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceOrder {
    #[default]
    None,
    Distance,
    Recency,
}

/// Radius, category and ordering options for a set of geotagged items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceFilter {
    #[serde(default)]
    pub origin: Option<Coordinates>,
    #[serde(default)]
    pub max_distance: Option<Distance>,
    /// Empty means every category passes.
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub order: PlaceOrder,
}

/// An item that passed a [`PlaceFilter`], with its distance from the origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Nearby<T> {
    pub item: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<Distance>,
}

impl PlaceFilter {
    pub fn new(origin: Option<Coordinates>) -> Self {
        Self {
            origin,
            ..Self::default()
        }
    }

    pub fn within(mut self, max_distance: Distance) -> Self {
        self.max_distance = Some(max_distance);
        self
    }

    pub fn categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn order(mut self, order: PlaceOrder) -> Self {
        self.order = order;
        self
    }

    fn category_matches(&self, category: Option<&str>) -> bool {
        if self.categories.is_empty() {
            return true;
        }
        category.is_some_and(|c| self.categories.contains(c))
    }

    pub fn apply<T, I>(&self, items: I) -> Vec<Nearby<T>>
    where
        T: Geotagged,
        I: IntoIterator<Item = T>,
    {
        if self.max_distance.is_some() && self.origin.is_none() {
            tracing::debug!("radius filter requested without an origin, skipping it");
        }

        let mut kept: Vec<Nearby<T>> = items
            .into_iter()
            .filter(|item| self.category_matches(item.category()))
            .filter_map(|item| {
                let distance = self
                    .origin
                    .zip(item.coordinates())
                    .map(|(origin, at)| origin.distance_to(&at));

                if let (Some(limit), Some(_)) = (self.max_distance, self.origin) {
                    match distance {
                        Some(d) if d <= limit => {}
                        _ => return None,
                    }
                }
                Some(Nearby { item, distance })
            })
            .collect();

        match self.order {
            PlaceOrder::None => {}
            PlaceOrder::Distance => {
                kept.sort_by(|a, b| missing_last(a.distance, b.distance, |x, y| x.meters().total_cmp(&y.meters())))
            }
            PlaceOrder::Recency => kept.sort_by(|a, b| {
                missing_last(a.item.recorded_at(), b.item.recorded_at(), |x, y| y.cmp(&x))
            }),
        }
        kept
    }
}

/// Compare two optional keys, placing `None` after every `Some`.
pub(crate) fn missing_last<K>(a: Option<K>, b: Option<K>, cmp: impl FnOnce(K, K) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
