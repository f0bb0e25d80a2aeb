use crate::error::ImportError;
use crate::issues::IssueLog;
use crate::lookup::{IndexedArea, PolygonIndex};
use crate::record::{display_name, CityRecord, CountryRecord};
use geo::algorithm::centroid::Centroid;
use geo::algorithm::contains::Contains;
use geo::algorithm::interior_point::InteriorPoint;
use geo_types::{Coord, Geometry, MultiPolygon};
use geojson::GeoJson;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::path::Path;
use tracing::{debug, info};

const BUILTIN_COUNTRIES: &str = include_str!("countries.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryInfo {
    pub alpha2: String,
    pub alpha3: String,
    pub name: String,
    pub continent: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    /// ISO 639 codes of the official languages.
    #[serde(default)]
    pub languages: Vec<String>,
}

/// ISO 3166-1 alpha-2 keyed country metadata.
#[derive(Debug, Clone, Default)]
pub struct CountryTable {
    entries: HashMap<String, CountryInfo>,
}

impl CountryTable {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let rows: Vec<CountryInfo> = serde_json::from_str(text)?;
        let entries = rows
            .into_iter()
            .map(|info| (info.alpha2.to_ascii_uppercase(), info))
            .collect();
        Ok(CountryTable { entries })
    }

    pub fn builtin() -> Result<Self, ImportError> {
        Self::from_json(BUILTIN_COUNTRIES).map_err(|err| ImportError::Dataset {
            path: "<builtin countries>".into(),
            reason: err.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ImportError> {
        let dataset_error = |reason: String| ImportError::Dataset {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|err| dataset_error(err.to_string()))?;
        let table = Self::from_json(&text).map_err(|err| dataset_error(err.to_string()))?;
        info!(path = ?path, countries = table.len(), "country table loaded");
        Ok(table)
    }

    pub fn get(&self, alpha2: &str) -> Option<&CountryInfo> {
        self.entries.get(alpha2)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Timezone boundaries keyed by IANA `tzid`.
pub struct TimezoneIndex {
    index: PolygonIndex<String>,
}

impl TimezoneIndex {
    pub fn empty() -> Self {
        TimezoneIndex {
            index: PolygonIndex::new(Vec::new()),
        }
    }

    /// Reads a FeatureCollection whose features carry a `tzid` property.
    /// Features without one, or without polygonal geometry, are skipped.
    pub fn from_geojson(text: &str) -> Result<Self, String> {
        let geojson: GeoJson = text.parse().map_err(|err: geojson::Error| err.to_string())?;
        let features = match geojson {
            GeoJson::FeatureCollection(collection) => collection.features,
            GeoJson::Feature(feature) => vec![feature],
            GeoJson::Geometry(_) => return Err("expected features with a tzid property".into()),
        };
        let mut areas = Vec::with_capacity(features.len());
        for feature in features {
            let tzid = match feature.property("tzid").and_then(|value| value.as_str()) {
                Some(tzid) => tzid.to_string(),
                None => continue,
            };
            let geometry = match feature.geometry {
                Some(geometry) => geometry,
                None => continue,
            };
            let mp = match Geometry::<f64>::try_from(geometry) {
                Ok(Geometry::Polygon(polygon)) => MultiPolygon(vec![polygon]),
                Ok(Geometry::MultiPolygon(mp)) => mp,
                _ => {
                    debug!(tzid = %tzid, "skipping non-polygonal timezone feature");
                    continue;
                }
            };
            areas.extend(IndexedArea::new(mp, tzid));
        }
        Ok(TimezoneIndex {
            index: PolygonIndex::new(areas),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ImportError> {
        let dataset_error = |reason: String| ImportError::Dataset {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|err| dataset_error(err.to_string()))?;
        let index = Self::from_geojson(&text).map_err(dataset_error)?;
        info!(path = ?path, zones = index.len(), "timezone boundaries loaded");
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn timezone_at(&self, coord: Coord<f64>) -> Option<&str> {
        self.index.smallest_containing(coord).map(String::as_str)
    }
}

/// Centroid when it lies inside the area, otherwise a deterministic interior
/// point.
pub fn representative_point(mp: &MultiPolygon<f64>) -> Option<Coord<f64>> {
    match mp.centroid() {
        Some(centroid) if mp.contains(&centroid) => Some(centroid.0),
        _ => mp.interior_point().map(|point| point.0),
    }
}

/// Country lookup for cities, keyed by alpha-2 code.
pub fn country_index(countries: &[CountryRecord]) -> PolygonIndex<String> {
    let areas = countries
        .iter()
        .filter_map(|country| IndexedArea::new(country.multi_polygon(), country.iso_alpha2.clone()))
        .collect();
    PolygonIndex::new(areas)
}

pub struct Enricher<'a> {
    countries: &'a CountryTable,
    timezones: &'a TimezoneIndex,
    languages: &'a [String],
}

impl<'a> Enricher<'a> {
    pub fn new(
        countries: &'a CountryTable,
        timezones: &'a TimezoneIndex,
        languages: &'a [String],
    ) -> Self {
        Enricher {
            countries,
            timezones,
            languages,
        }
    }

    pub fn enrich_country(&self, mut country: CountryRecord) -> CountryRecord {
        if let Some(info) = self.countries.get(&country.iso_alpha2) {
            if country.iso_alpha3.is_none() {
                country.iso_alpha3 = Some(info.alpha3.clone());
            }
            if !country.names.contains_key("en") {
                country.names.insert("en".to_string(), info.name.clone());
            }
            country.continent = Some(info.continent.clone());
            country.region = info.region.clone();
            country.currency = info.currency.clone();
            country.official_languages = info.languages.clone();
        } else {
            debug!(iso = %country.iso_alpha2, "no static metadata for country");
        }
        let osm_id = country.osm_id;
        country.display_name = display_name(&country.names, self.languages, || {
            format!("Country {}", osm_id)
        });
        country.center = representative_point(&country.multi_polygon());
        country.timezone = country
            .center
            .and_then(|center| self.timezones.timezone_at(center))
            .map(String::from);
        country
    }

    /// Cities outside every country keep `country_ref = None` and are counted.
    pub fn enrich_city(
        &self,
        mut city: CityRecord,
        countries: &PolygonIndex<String>,
        issues: &IssueLog,
    ) -> CityRecord {
        let location = city.location();
        city.country_ref = countries.smallest_containing(location).cloned();
        if city.country_ref.is_none() {
            debug!(kind = %city.osm_kind, id = city.osm_id, "city outside every country");
            issues.unresolved_city_country();
        }
        city.timezone = self.timezones.timezone_at(location).map(String::from);
        city
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::ElementKind;
    use crate::record::{PlaceKind, Ring};
    use std::collections::BTreeMap;

    const ZONES: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": {"tzid": "Europe/Wide"},
                "geometry": {"type": "Polygon", "coordinates": [[[-10, 40], [10, 40], [10, 60], [-10, 60], [-10, 40]]]}
            },
            {
                "type": "Feature",
                "properties": {"tzid": "Europe/Paris"},
                "geometry": {"type": "MultiPolygon", "coordinates": [[[[-5, 42], [8, 42], [8, 51], [-5, 51], [-5, 42]]]]}
            },
            {
                "type": "Feature",
                "properties": {"name": "no tzid"},
                "geometry": {"type": "Polygon", "coordinates": [[[-5, 42], [8, 42], [8, 51], [-5, 42]]]}
            },
            {
                "type": "Feature",
                "properties": {"tzid": "Etc/Point"},
                "geometry": {"type": "Point", "coordinates": [0, 0]}
            }
        ]
    }"#;

    fn square(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Ring {
        Ring::new(vec![
            Coord { x: min_x, y: min_y },
            Coord { x: max_x, y: min_y },
            Coord { x: max_x, y: max_y },
            Coord { x: min_x, y: max_y },
            Coord { x: min_x, y: min_y },
        ])
        .unwrap()
    }

    fn country(iso: &str, outer: Vec<Ring>) -> CountryRecord {
        let mut names = BTreeMap::new();
        names.insert("default".to_string(), format!("Land {}", iso));
        CountryRecord {
            osm_id: 1,
            iso_alpha2: iso.into(),
            iso_alpha3: None,
            display_name: format!("Land {}", iso),
            names,
            outer,
            inner: vec![],
            center: None,
            timezone: None,
            continent: None,
            region: None,
            currency: None,
            official_languages: Vec::new(),
        }
    }

    fn city(lon: f64, lat: f64) -> CityRecord {
        CityRecord {
            osm_kind: ElementKind::Node,
            osm_id: 100,
            place_kind: PlaceKind::City,
            lat,
            lon,
            names: BTreeMap::new(),
            display_name: "Place 100".into(),
            region_state: None,
            population: None,
            country_ref: None,
            timezone: None,
        }
    }

    #[test]
    fn builtin_table_covers_iso_codes() {
        let table = CountryTable::builtin().unwrap();
        assert!(table.len() >= 249);
        let france = table.get("FR").unwrap();
        assert_eq!(france.alpha3, "FRA");
        assert_eq!(france.continent, "Europe");
        assert_eq!(france.currency.as_deref(), Some("EUR"));
        assert_eq!(table.get("CH").unwrap().languages, vec!["de", "fr", "it", "rm"]);
        assert!(table.get("ZZ").is_none());
    }

    #[test]
    fn timezone_lookup_prefers_smallest_zone() {
        let zones = TimezoneIndex::from_geojson(ZONES).unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones.timezone_at(Coord { x: 2.35, y: 48.85 }), Some("Europe/Paris"));
        assert_eq!(zones.timezone_at(Coord { x: 9.5, y: 55.0 }), Some("Europe/Wide"));
        assert_eq!(zones.timezone_at(Coord { x: 50.0, y: 0.0 }), None);
        assert!(TimezoneIndex::from_geojson("not json").is_err());
    }

    #[test]
    fn fills_country_metadata() {
        let table = CountryTable::builtin().unwrap();
        let zones = TimezoneIndex::from_geojson(ZONES).unwrap();
        let languages = vec!["en".to_string()];
        let enricher = Enricher::new(&table, &zones, &languages);

        let france = enricher.enrich_country(country("FR", vec![square(-5.0, 42.0, 8.0, 51.0)]));
        assert_eq!(france.iso_alpha3.as_deref(), Some("FRA"));
        assert_eq!(france.continent.as_deref(), Some("Europe"));
        assert_eq!(france.region.as_deref(), Some("Western Europe"));
        assert_eq!(france.currency.as_deref(), Some("EUR"));
        assert_eq!(france.official_languages, vec!["fr"]);
        assert_eq!(france.names["en"], "France");
        assert_eq!(france.display_name, "France");
        let center = france.center.unwrap();
        assert!((center.x - 1.5).abs() < 1e-9 && (center.y - 46.5).abs() < 1e-9);
        assert_eq!(france.timezone.as_deref(), Some("Europe/Paris"));

        let unknown = enricher.enrich_country(country("ZZ", vec![square(100.0, 0.0, 101.0, 1.0)]));
        assert_eq!(unknown.continent, None);
        assert!(unknown.official_languages.is_empty());
        assert_eq!(unknown.timezone, None);
        assert_eq!(unknown.display_name, "Land ZZ");
    }

    #[test]
    fn center_falls_back_to_interior_point() {
        // Two far-apart parts: the centroid lies in the gap between them.
        let mp = country("XX", vec![square(0.0, 0.0, 1.0, 1.0), square(10.0, 0.0, 11.0, 1.0)])
            .multi_polygon();
        let center = representative_point(&mp).unwrap();
        assert!(mp.contains(&center));
    }

    #[test]
    fn assigns_smallest_containing_country() {
        let table = CountryTable::default();
        let zones = TimezoneIndex::empty();
        let enricher = Enricher::new(&table, &zones, &[]);
        let countries = vec![
            country("AA", vec![square(0.0, 0.0, 10.0, 10.0)]),
            country("BB", vec![square(2.0, 2.0, 4.0, 4.0)]),
        ];
        let index = country_index(&countries);
        let issues = IssueLog::new();

        let nested = enricher.enrich_city(city(3.0, 3.0), &index, &issues);
        assert_eq!(nested.country_ref.as_deref(), Some("BB"));
        let outer = enricher.enrich_city(city(8.0, 8.0), &index, &issues);
        assert_eq!(outer.country_ref.as_deref(), Some("AA"));
        let nowhere = enricher.enrich_city(city(50.0, 50.0), &index, &issues);
        assert_eq!(nowhere.country_ref, None);
        assert_eq!(issues.counts().unresolved_city_countries, 1);
    }
}
