use crate::record::{CountryRecord, Ring, MIN_RING_POINTS};
use geo::{Coord, Intersects, Line, Simplify};
use rstar::primitives::{GeomWithData, Line as IndexedLine};
use rstar::{RTree, RTreeObject};

type Segment = GeomWithData<IndexedLine<[f64; 2]>, usize>;

/// True when two non-adjacent edges of the closed ring touch or cross.
pub fn self_intersects(ring: &Ring) -> bool {
    let coords = ring.coords();
    let edges = coords.len().saturating_sub(1);
    if edges < 3 {
        return false;
    }
    let segments: Vec<Segment> = coords
        .windows(2)
        .enumerate()
        .map(|(index, pair)| {
            GeomWithData::new(
                IndexedLine::new([pair[0].x, pair[0].y], [pair[1].x, pair[1].y]),
                index,
            )
        })
        .collect();
    let adjacent = |i: usize, j: usize| {
        let (low, high) = if i < j { (i, j) } else { (j, i) };
        high - low == 1 || (low == 0 && high == edges - 1)
    };
    let tree = RTree::bulk_load(segments.clone());
    segments.iter().any(|segment| {
        let i = segment.data;
        tree.locate_in_envelope_intersecting(&segment.envelope())
            .filter(|other| other.data > i && !adjacent(i, other.data))
            .any(|other| {
                let j = other.data;
                Line::new(coords[i], coords[i + 1])
                    .intersects(&Line::new(coords[j], coords[j + 1]))
            })
    })
}

/// Pure function of `(ring, epsilon)`.
pub fn simplify_ring(ring: &Ring, epsilon: f64) -> Ring {
    if !(epsilon >= 0.0) || ring.len() <= MIN_RING_POINTS {
        return ring.clone();
    }
    let kept: Vec<Coord<f64>> = ring.to_line_string().simplify(&epsilon).0;
    if kept.len() == ring.len() {
        return ring.clone();
    }
    match Ring::new(kept) {
        Some(simplified) if !self_intersects(&simplified) || self_intersects(ring) => simplified,
        _ => ring.clone(),
    }
}

pub fn simplify_country(mut country: CountryRecord, epsilon: f64) -> CountryRecord {
    country.outer = country
        .outer
        .iter()
        .map(|ring| simplify_ring(ring, epsilon))
        .collect();
    country.inner = country
        .inner
        .iter()
        .map(|ring| simplify_ring(ring, epsilon))
        .collect();
    country
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ring(points: &[(f64, f64)]) -> Ring {
        Ring::new(points.iter().map(|(x, y)| Coord { x: *x, y: *y }).collect()).unwrap()
    }

    fn wobbly_square() -> Ring {
        ring(&[
            (0.0, 0.0),
            (5.0, 0.01),
            (10.0, 0.0),
            (10.01, 5.0),
            (10.0, 10.0),
            (5.0, 9.99),
            (0.0, 10.0),
            (0.01, 5.0),
            (0.0, 0.0),
        ])
    }

    #[test]
    fn zero_tolerance_keeps_ring() {
        let input = ring(&[
            (0.0, 0.0),
            (2.0, 0.0),
            (4.0, 0.0),
            (4.0, 4.0),
            (0.0, 4.0),
            (0.0, 0.0),
        ]);
        assert_eq!(simplify_ring(&input, 0.0), input);

        let wobbly = wobbly_square();
        assert_eq!(simplify_ring(&wobbly, 0.0), wobbly);
    }

    #[test]
    fn drops_collinear_points_at_any_positive_tolerance() {
        let input = ring(&[
            (0.0, 0.0),
            (2.0, 0.0),
            (4.0, 0.0),
            (4.0, 4.0),
            (0.0, 4.0),
            (0.0, 0.0),
        ]);
        assert_eq!(
            simplify_ring(&input, 1e-9),
            ring(&[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)])
        );
    }

    #[test]
    fn removes_points_within_tolerance() {
        let simplified = simplify_ring(&wobbly_square(), 0.1);
        assert_eq!(
            simplified,
            ring(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)])
        );
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.05)]
    #[case(1.0)]
    #[case(100.0)]
    #[case(1e9)]
    fn never_drops_below_four_points_and_stays_closed(#[case] epsilon: f64) {
        for input in [wobbly_square(), ring(&[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (0.0, 0.0)])] {
            let simplified = simplify_ring(&input, epsilon);
            assert!(simplified.len() >= MIN_RING_POINTS);
            assert_eq!(simplified.coords().first(), simplified.coords().last());
        }
    }

    #[test]
    fn is_deterministic() {
        let input = wobbly_square();
        assert_eq!(simplify_ring(&input, 0.3), simplify_ring(&input, 0.3));
    }

    #[test]
    fn detects_bow_tie() {
        let bow_tie = ring(&[(0.0, 0.0), (2.0, 2.0), (2.0, 0.0), (0.0, 2.0), (0.0, 0.0)]);
        assert!(self_intersects(&bow_tie));
        assert!(!self_intersects(&wobbly_square()));

        // Non-adjacent edges meeting in a single vertex.
        let figure_eight = ring(&[
            (0.0, 0.0),
            (2.0, 0.0),
            (1.0, 1.0),
            (2.0, 2.0),
            (0.0, 2.0),
            (1.0, 1.0),
            (0.0, 0.0),
        ]);
        assert!(self_intersects(&figure_eight));
    }

    #[test]
    fn rejects_reduction_that_crosses_itself() {
        // A narrow inlet whose removal of the spike's base would cut across
        // the opposite edge.
        let input = ring(&[
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 10.0),
            (5.2, 10.0),
            (5.1, 1.0),
            (5.0, 0.5),
            (4.9, 1.0),
            (4.8, 10.0),
            (0.0, 10.0),
            (0.0, 0.0),
        ]);
        let simplified = simplify_ring(&input, 0.6);
        assert!(!self_intersects(&simplified));
        assert!(simplified.len() >= MIN_RING_POINTS);
    }
}
