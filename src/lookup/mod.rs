use geo::algorithm::area::Area;
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geo_types::{Coord, MultiPolygon, Point};
use rstar::primitives::Rectangle;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

type Point2D = [f64; 2];

/// A keyed multi-polygon, indexed by its bounding box.
#[derive(Debug, Clone)]
pub struct IndexedArea<K> {
    rect: Rectangle<Point2D>,
    area: f64,
    pub key: K,
    pub mp: MultiPolygon<f64>,
}

impl<K> IndexedArea<K> {
    /// `None` for an empty multi-polygon.
    pub fn new(mp: MultiPolygon<f64>, key: K) -> Option<Self> {
        let rect = mp.bounding_rect()?;
        let lower = [rect.min().x, rect.min().y];
        let upper = [rect.max().x, rect.max().y];
        let rect = Rectangle::from_aabb(AABB::from_corners(lower, upper));
        let area = mp.unsigned_area();
        Some(IndexedArea {
            rect,
            area,
            key,
            mp,
        })
    }

    pub fn contains(&self, point: &Point2D) -> bool {
        let [x, y] = point;
        self.mp.contains(&Point::new(*x, *y))
    }
}

impl<K> RTreeObject for IndexedArea<K> {
    type Envelope = AABB<Point2D>;

    fn envelope(&self) -> Self::Envelope {
        self.rect.envelope()
    }
}

impl<K> PointDistance for IndexedArea<K> {
    fn distance_2(&self, point: &Point2D) -> f64 {
        self.rect.distance_2(point)
    }
}

/// Point-in-polygon lookup over many areas. Bounding boxes narrow the
/// candidates, exact containment decides.
pub struct PolygonIndex<K> {
    tree: RTree<IndexedArea<K>>,
}

impl<K: Ord> PolygonIndex<K> {
    pub fn new(areas: Vec<IndexedArea<K>>) -> Self {
        PolygonIndex {
            tree: RTree::bulk_load(areas),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    pub fn containing(&self, coord: Coord<f64>) -> impl Iterator<Item = &IndexedArea<K>> {
        let point = [coord.x, coord.y];
        self.tree
            .locate_all_at_point(&point)
            .filter(move |area| area.contains(&point))
    }

    /// Nested or overlapping areas resolve to the smallest one; equal areas
    /// fall back to the smaller key.
    pub fn smallest_containing(&self, coord: Coord<f64>) -> Option<&K> {
        self.containing(coord)
            .min_by(|a, b| a.area.total_cmp(&b.area).then_with(|| a.key.cmp(&b.key)))
            .map(|area| &area.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn rect_area(lower: Point2D, upper: Point2D, key: &str) -> IndexedArea<String> {
        let [min_x, min_y] = lower;
        let [max_x, max_y] = upper;
        let mp: MultiPolygon<f64> = polygon![
            (x: min_x, y: min_y),
            (x: min_x, y: max_y),
            (x: max_x, y: max_y),
            (x: max_x, y: min_y),
            (x: min_x, y: min_y),
        ]
        .into();
        IndexedArea::new(mp, key.to_string()).unwrap()
    }

    fn test_index() -> PolygonIndex<String> {
        PolygonIndex::new(vec![
            rect_area([0.0, 0.0], [0.4, 1.0], "left"),
            rect_area([0.0, 0.0], [0.3, 1.0], "small left"),
            rect_area([0.6, 0.0], [1.0, 1.0], "right"),
            rect_area([0.25, 0.0], [0.75, 1.0], "middle"),
            rect_area([0., 0.], [1.0, 1.0], "huge"),
        ])
    }

    fn at(x: f64, y: f64) -> Coord<f64> {
        Coord { x, y }
    }

    #[test]
    fn picks_smallest_containing_area() {
        let index = test_index();
        assert_eq!(index.len(), 5);
        let mut keys: Vec<&String> = index.containing(at(0.2, 0.2)).map(|a| &a.key).collect();
        keys.sort();
        assert_eq!(keys, ["huge", "left", "small left"]);
        assert_eq!(
            index.smallest_containing(at(0.2, 0.2)).map(String::as_str),
            Some("small left")
        );
        assert_eq!(
            index.smallest_containing(at(0.8, 0.5)).map(String::as_str),
            Some("right")
        );
        assert_eq!(index.smallest_containing(at(1.1, 0.5)), None);
    }

    #[test]
    fn equal_areas_break_ties_by_key() {
        let index = PolygonIndex::new(vec![
            rect_area([0.0, 0.0], [1.0, 1.0], "b"),
            rect_area([0.0, 0.0], [1.0, 1.0], "a"),
        ]);
        assert_eq!(
            index.smallest_containing(at(0.5, 0.5)).map(String::as_str),
            Some("a")
        );
    }

    #[test]
    fn bounding_box_hit_is_not_containment() {
        let mp: MultiPolygon<f64> = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 0.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ]
        .into();
        let index = PolygonIndex::new(vec![IndexedArea::new(mp, 1).unwrap()]);
        assert_eq!(index.smallest_containing(at(0.9, 0.9)), None);
        assert_eq!(index.smallest_containing(at(0.1, 0.1)), Some(&1));
    }
}
