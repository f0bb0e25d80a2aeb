use crate::primitive::{ElementKind, Tags, TagsExt};
use geo::{Contains, Coord, InteriorPoint, LineString, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Closed polygon boundary: first coordinate equals the last, at least four
/// coordinates. Coordinates use `x = longitude`, `y = latitude`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ring(Vec<Coord<f64>>);

pub const MIN_RING_POINTS: usize = 4;

impl Ring {
    pub fn new(coords: Vec<Coord<f64>>) -> Option<Self> {
        let closed = coords.len() >= MIN_RING_POINTS && coords.first() == coords.last();
        if closed {
            Some(Ring(coords))
        } else {
            None
        }
    }

    pub fn coords(&self) -> &[Coord<f64>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_line_string(&self) -> LineString<f64> {
        LineString::new(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceKind {
    City,
    Town,
    Village,
    Hamlet,
}

impl PlaceKind {
    pub fn from_tag(value: &str) -> Option<Self> {
        match value {
            "city" => Some(PlaceKind::City),
            "town" => Some(PlaceKind::Town),
            "village" => Some(PlaceKind::Village),
            "hamlet" => Some(PlaceKind::Hamlet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceKind::City => "city",
            PlaceKind::Town => "town",
            PlaceKind::Village => "village",
            PlaceKind::Hamlet => "hamlet",
        }
    }
}

/// Collects `name` (as `default`) and every `name:<lang>` tag.
pub fn names_from_tags(tags: &Tags) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|(key, value)| {
            if key == "name" {
                Some(("default".to_string(), value.clone()))
            } else {
                key.strip_prefix("name:")
                    .filter(|lang| !lang.is_empty())
                    .map(|lang| (lang.to_string(), value.clone()))
            }
        })
        .collect()
}

pub fn display_name(
    names: &BTreeMap<String, String>,
    languages: &[String],
    fallback: impl FnOnce() -> String,
) -> String {
    languages
        .iter()
        .map(String::as_str)
        .chain(std::iter::once("default"))
        .find_map(|lang| names.get(lang))
        .cloned()
        .unwrap_or_else(fallback)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryRecord {
    pub osm_id: i64,
    pub iso_alpha2: String,
    pub iso_alpha3: Option<String>,
    pub names: BTreeMap<String, String>,
    pub display_name: String,
    pub outer: Vec<Ring>,
    pub inner: Vec<Ring>,
    pub center: Option<Coord<f64>>,
    pub timezone: Option<String>,
    pub continent: Option<String>,
    pub region: Option<String>,
    pub currency: Option<String>,
    pub official_languages: Vec<String>,
}

impl CountryRecord {
    /// Polygons for containment tests. Each hole goes to the first outer
    /// ring that contains an interior point of the hole, so holes touching
    /// their outer ring are kept; orphan holes are left out.
    pub fn multi_polygon(&self) -> MultiPolygon<f64> {
        let outers: Vec<Polygon<f64>> = self
            .outer
            .iter()
            .map(|ring| Polygon::new(ring.to_line_string(), vec![]))
            .collect();
        let mut holes: Vec<Vec<LineString<f64>>> = vec![Vec::new(); outers.len()];
        for ring in &self.inner {
            let hole = ring.to_line_string();
            let inside = match Polygon::new(hole.clone(), vec![]).interior_point() {
                Some(point) => point,
                None => continue,
            };
            if let Some(index) = outers.iter().position(|outer| outer.contains(&inside)) {
                holes[index].push(hole);
            }
        }
        MultiPolygon(
            outers
                .into_iter()
                .zip(holes)
                .map(|(outer, interiors)| Polygon::new(outer.exterior().clone(), interiors))
                .collect(),
        )
    }

    pub fn boundary_geojson(&self) -> String {
        let value = geojson::Value::from(&self.multi_polygon());
        geojson::Geometry::new(value).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRecord {
    pub osm_kind: ElementKind,
    pub osm_id: i64,
    pub place_kind: PlaceKind,
    pub lat: f64,
    pub lon: f64,
    pub names: BTreeMap<String, String>,
    pub display_name: String,
    pub region_state: Option<String>,
    pub population: Option<u64>,
    pub country_ref: Option<String>,
    pub timezone: Option<String>,
}

impl CityRecord {
    pub fn from_tags(
        osm_kind: ElementKind,
        osm_id: i64,
        location: Coord<f64>,
        tags: &Tags,
        languages: &[String],
    ) -> Option<Self> {
        let place_kind = PlaceKind::from_tag(tags.value("place")?)?;
        let names = names_from_tags(tags);
        let display_name = display_name(&names, languages, || format!("Place {}", osm_id));
        Some(CityRecord {
            osm_kind,
            osm_id,
            place_kind,
            lat: location.y,
            lon: location.x,
            names,
            display_name,
            region_state: tags
                .value("addr:state")
                .or_else(|| tags.value("state"))
                .map(String::from),
            population: tags
                .value("population")
                .and_then(|value| value.replace(&[',', ' '][..], "").parse().ok()),
            country_ref: None,
            timezone: None,
        })
    }

    pub fn location(&self) -> Coord<f64> {
        Coord {
            x: self.lon,
            y: self.lat,
        }
    }
}

/// Unique identity of a record in the sink.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RecordKey {
    Country(String),
    City(ElementKind, i64),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Country(iso) => write!(f, "country {}", iso),
            RecordKey::City(kind, id) => write!(f, "city {}/{}", kind, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::build::tags;

    fn square(min: f64, max: f64) -> Ring {
        Ring::new(vec![
            Coord { x: min, y: min },
            Coord { x: max, y: min },
            Coord { x: max, y: max },
            Coord { x: min, y: max },
            Coord { x: min, y: min },
        ])
        .unwrap()
    }

    #[test]
    fn ring_requires_closure_and_four_points() {
        let open = vec![
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 1.0, y: 0.0 },
            Coord { x: 1.0, y: 1.0 },
            Coord { x: 0.0, y: 1.0 },
        ];
        assert!(Ring::new(open).is_none());
        let too_short = vec![
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 1.0, y: 0.0 },
            Coord { x: 0.0, y: 0.0 },
        ];
        assert!(Ring::new(too_short).is_none());
        assert_eq!(square(0.0, 1.0).len(), 5);
    }

    #[test]
    fn collects_names_and_display_name() {
        let tags = tags(&[
            ("name", "France"),
            ("name:de", "Frankreich"),
            ("name:en", "France"),
            ("name:", "broken"),
            ("official_name", "République française"),
        ]);
        let names = names_from_tags(&tags);
        assert_eq!(names.len(), 3);
        assert_eq!(names["default"], "France");
        assert_eq!(names["de"], "Frankreich");

        let languages = vec!["de".to_string()];
        assert_eq!(display_name(&names, &languages, || "x".into()), "Frankreich");
        assert_eq!(display_name(&BTreeMap::new(), &languages, || "x".into()), "x");
    }

    #[test]
    fn holes_attach_to_containing_outer() {
        let country = CountryRecord {
            osm_id: 1,
            iso_alpha2: "ZZ".into(),
            iso_alpha3: None,
            names: BTreeMap::new(),
            display_name: "Zed".into(),
            outer: vec![square(0.0, 10.0), square(20.0, 30.0)],
            inner: vec![square(22.0, 24.0), square(50.0, 51.0)],
            center: None,
            timezone: None,
            continent: None,
            region: None,
            currency: None,
            official_languages: Vec::new(),
        };
        let mp = country.multi_polygon();
        assert_eq!(mp.0.len(), 2);
        assert!(mp.0[0].interiors().is_empty());
        assert_eq!(mp.0[1].interiors().len(), 1);
        assert!(!mp.contains(&Coord { x: 23.0, y: 23.0 }));
        assert!(mp.contains(&Coord { x: 5.0, y: 5.0 }));
        assert!(country.boundary_geojson().contains("MultiPolygon"));
    }

    #[test]
    fn keeps_hole_touching_its_outer_ring() {
        let hole = Ring::new(vec![
            Coord { x: 0.0, y: 2.0 },
            Coord { x: 3.0, y: 2.0 },
            Coord { x: 3.0, y: 5.0 },
            Coord { x: 0.0, y: 2.0 },
        ])
        .unwrap();
        let country = CountryRecord {
            osm_id: 1,
            iso_alpha2: "ZZ".into(),
            iso_alpha3: None,
            names: BTreeMap::new(),
            display_name: "Zed".into(),
            outer: vec![square(0.0, 10.0)],
            inner: vec![hole],
            center: None,
            timezone: None,
            continent: None,
            region: None,
            currency: None,
            official_languages: Vec::new(),
        };
        let mp = country.multi_polygon();
        assert_eq!(mp.0[0].interiors().len(), 1);
        assert!(!mp.contains(&Coord { x: 2.0, y: 3.0 }));
        assert!(mp.contains(&Coord { x: 8.0, y: 8.0 }));
    }

    #[test]
    fn city_from_place_tags() {
        let tags = tags(&[
            ("place", "town"),
            ("name", "Annecy"),
            ("population", "130,721"),
            ("addr:state", "Auvergne-Rhône-Alpes"),
        ]);
        let city = CityRecord::from_tags(
            ElementKind::Node,
            42,
            Coord { x: 6.12, y: 45.9 },
            &tags,
            &[],
        )
        .unwrap();
        assert_eq!(city.place_kind, PlaceKind::Town);
        assert_eq!(city.display_name, "Annecy");
        assert_eq!(city.population, Some(130_721));
        assert_eq!(city.lat, 45.9);
        assert!(city.country_ref.is_none());

        let suburb = crate::primitive::build::tags(&[("place", "suburb")]);
        assert!(CityRecord::from_tags(ElementKind::Node, 1, Coord { x: 0.0, y: 0.0 }, &suburb, &[])
            .is_none());
    }
}
