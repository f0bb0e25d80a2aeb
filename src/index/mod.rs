use crate::assemble::{is_country_relation, BoundaryRelation, MemberGeometry, Role};
use crate::decoder::PrimitiveDecoder;
use crate::error::{
    ImportError, IncompleteGeometryError, IncompleteReason, UnresolvedReferenceError,
};
use crate::issues::IssueLog;
use crate::primitive::{ElementKind, NodeCoord, RawPrimitive, RawRelation, RawWay, Tags, TagsExt};
use crate::record::{PlaceKind, MIN_RING_POINTS};
use geo::algorithm::centroid::Centroid;
use geo::{Coord, LineString, Polygon};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, instrument};

/// A node or closed way that carries a usable `place` tag.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceCandidate {
    pub kind: ElementKind,
    pub id: i64,
    pub location: Coord<f64>,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub country_relations: usize,
    pub relations: usize,
    pub ways: usize,
    pub nodes: usize,
    pub place_nodes: usize,
    pub place_ways: usize,
    pub resolve_rounds: u32,
}

#[derive(Debug, Default)]
struct MemberWalk {
    ways: Vec<(i64, Role)>,
    missing_relations: Vec<i64>,
    revisited: Vec<i64>,
}

#[derive(Debug, Default)]
pub struct ReferenceIndex {
    relations: HashMap<i64, RawRelation>,
    countries: BTreeSet<i64>,
    ways: HashMap<i64, Vec<i64>>,
    place_nodes: Vec<PlaceCandidate>,
    place_ways: Vec<RawWay>,
    coords: HashMap<i64, NodeCoord>,
    resolve_rounds: u32,
}

fn is_place(tags: &Tags) -> bool {
    tags.value("place").and_then(PlaceKind::from_tag).is_some()
}

fn is_closed_area(nodes: &[i64]) -> bool {
    nodes.len() >= MIN_RING_POINTS && nodes.first() == nodes.last()
}

impl ReferenceIndex {
    /// Structure scan, resolve rounds for members found late, then one
    /// coordinate scan for the nodes retained ways need.
    #[instrument(skip(decoder))]
    pub fn build(
        decoder: &PrimitiveDecoder<'_>,
        max_resolve_rounds: u32,
    ) -> Result<Self, ImportError> {
        let mut index = ReferenceIndex::default();
        decoder.scan("structure", |primitive| index.keep_structure(primitive))?;
        info!(
            countries = index.countries.len(),
            place_nodes = index.place_nodes.len(),
            place_ways = index.place_ways.len(),
            "structure scan done"
        );
        index.resolve_members(decoder, max_resolve_rounds)?;
        index.prune_ways();
        index.collect_coordinates(decoder)?;
        info!(stats = ?index.stats(), "reference index built");
        Ok(index)
    }

    fn keep_structure(&mut self, primitive: RawPrimitive) {
        match primitive {
            RawPrimitive::Node(node) => {
                if is_place(&node.tags) {
                    self.place_nodes.push(PlaceCandidate {
                        kind: ElementKind::Node,
                        id: node.id,
                        location: node.coord.to_coord(),
                        tags: node.tags,
                    });
                }
            }
            RawPrimitive::Way(way) => {
                if way.tags.has("boundary", "administrative") {
                    self.ways.insert(way.id, way.nodes.clone());
                }
                if is_place(&way.tags) && is_closed_area(&way.nodes) {
                    self.place_ways.push(way);
                }
            }
            RawPrimitive::Relation(relation) => {
                if is_country_relation(&relation.tags) {
                    self.countries.insert(relation.id);
                    self.relations.insert(relation.id, relation);
                }
            }
        }
    }

    fn walk_members(&self, root: i64) -> MemberWalk {
        let mut walk = MemberWalk::default();
        let mut visited = HashSet::new();
        visited.insert(root);
        self.visit(root, Role::Outer, &mut visited, &mut walk);
        walk
    }

    fn visit(&self, id: i64, inherited: Role, visited: &mut HashSet<i64>, walk: &mut MemberWalk) {
        let relation = match self.relations.get(&id) {
            Some(relation) => relation,
            None => return,
        };
        for member in &relation.members {
            let role = match Role::parse(&member.role, inherited) {
                Some(role) => role,
                None => continue,
            };
            match member.kind {
                ElementKind::Way => walk.ways.push((member.id, role)),
                ElementKind::Relation => {
                    if !visited.insert(member.id) {
                        walk.revisited.push(member.id);
                    } else if self.relations.contains_key(&member.id) {
                        self.visit(member.id, role, visited, walk);
                    } else {
                        walk.missing_relations.push(member.id);
                    }
                }
                ElementKind::Node => {}
            }
        }
    }

    fn wanted(&self) -> (HashSet<i64>, HashSet<i64>) {
        let mut ways = HashSet::new();
        let mut relations = HashSet::new();
        for root in &self.countries {
            let walk = self.walk_members(*root);
            ways.extend(
                walk.ways
                    .into_iter()
                    .map(|(id, _)| id)
                    .filter(|id| !self.ways.contains_key(id)),
            );
            relations.extend(walk.missing_relations);
        }
        (ways, relations)
    }

    /// Re-reads the source for members that were not retained yet. Sub-relations
    /// found in one round can reference further members, hence the rounds.
    fn resolve_members(
        &mut self,
        decoder: &PrimitiveDecoder<'_>,
        max_rounds: u32,
    ) -> Result<(), ImportError> {
        let mut requested_ways = HashSet::new();
        let mut requested_relations = HashSet::new();
        for round in 1..=max_rounds {
            let (ways, relations) = self.wanted();
            let ways: HashSet<i64> = ways
                .into_iter()
                .filter(|id| requested_ways.insert(*id))
                .collect();
            let relations: HashSet<i64> = relations
                .into_iter()
                .filter(|id| requested_relations.insert(*id))
                .collect();
            if ways.is_empty() && relations.is_empty() {
                break;
            }
            debug!(
                round,
                ways = ways.len(),
                relations = relations.len(),
                "resolving members"
            );
            decoder.scan("resolve", |primitive| match primitive {
                RawPrimitive::Way(way) if ways.contains(&way.id) => {
                    self.ways.insert(way.id, way.nodes);
                }
                RawPrimitive::Relation(relation) if relations.contains(&relation.id) => {
                    self.relations.insert(relation.id, relation);
                }
                _ => {}
            })?;
            self.resolve_rounds = round;
        }
        Ok(())
    }

    /// Drops boundary ways no country relation references.
    fn prune_ways(&mut self) {
        let referenced: HashSet<i64> = self
            .countries
            .iter()
            .flat_map(|root| self.walk_members(*root).ways)
            .map(|(id, _)| id)
            .collect();
        self.ways.retain(|id, _| referenced.contains(id));
    }

    fn collect_coordinates(&mut self, decoder: &PrimitiveDecoder<'_>) -> Result<(), ImportError> {
        let needed: HashSet<i64> = self
            .ways
            .values()
            .flatten()
            .chain(self.place_ways.iter().flat_map(|way| way.nodes.iter()))
            .copied()
            .collect();
        let coords = &mut self.coords;
        decoder.scan("coordinates", |primitive| {
            if let RawPrimitive::Node(node) = primitive {
                if needed.contains(&node.id) {
                    coords.insert(node.id, node.coord);
                }
            }
        })?;
        Ok(())
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            country_relations: self.countries.len(),
            relations: self.relations.len(),
            ways: self.ways.len(),
            nodes: self.coords.len(),
            place_nodes: self.place_nodes.len(),
            place_ways: self.place_ways.len(),
            resolve_rounds: self.resolve_rounds,
        }
    }

    /// Coordinates of a way, or `None` with a recorded issue when one of its
    /// nodes is missing.
    fn way_coords(&self, way_id: i64, nodes: &[i64], issues: &IssueLog) -> Option<Vec<Coord<f64>>> {
        let mut coords = Vec::with_capacity(nodes.len());
        for node in nodes {
            match self.coords.get(node) {
                Some(coord) => coords.push(coord.to_coord()),
                None => {
                    issues.unresolved_reference(UnresolvedReferenceError {
                        kind: ElementKind::Way,
                        id: way_id,
                        missing_kind: ElementKind::Node,
                        missing_id: *node,
                    });
                    return None;
                }
            }
        }
        Some(coords)
    }

    /// Country relations with member ways resolved to coordinates, ordered by
    /// relation id. Ways shared between countries are resolved, and reported
    /// missing, once.
    pub fn boundary_relations(&self, issues: &IssueLog) -> Vec<BoundaryRelation> {
        let mut resolved: HashMap<i64, Option<Vec<Coord<f64>>>> = HashMap::new();
        let mut missing_relations = HashSet::new();
        let mut boundaries = Vec::with_capacity(self.countries.len());
        for root in &self.countries {
            let relation = match self.relations.get(root) {
                Some(relation) => relation,
                None => continue,
            };
            let incomplete = |reason| {
                issues.incomplete_geometry(IncompleteGeometryError {
                    relation_id: *root,
                    reason,
                })
            };
            let walk = self.walk_members(*root);
            for id in walk.revisited {
                incomplete(IncompleteReason::CyclicRelation { id });
            }
            for id in walk.missing_relations {
                if missing_relations.insert(id) {
                    issues.unresolved_reference(UnresolvedReferenceError {
                        kind: ElementKind::Relation,
                        id: *root,
                        missing_kind: ElementKind::Relation,
                        missing_id: id,
                    });
                }
                incomplete(IncompleteReason::MissingMember {
                    kind: ElementKind::Relation,
                    id,
                });
            }
            let mut members = Vec::with_capacity(walk.ways.len());
            for (way_id, role) in walk.ways {
                let coords = resolved
                    .entry(way_id)
                    .or_insert_with(|| match self.ways.get(&way_id) {
                        Some(nodes) => self.way_coords(way_id, nodes, issues),
                        None => {
                            issues.unresolved_reference(UnresolvedReferenceError {
                                kind: ElementKind::Relation,
                                id: *root,
                                missing_kind: ElementKind::Way,
                                missing_id: way_id,
                            });
                            None
                        }
                    });
                match coords {
                    Some(coords) => members.push(MemberGeometry {
                        way_id,
                        role,
                        coords: coords.clone(),
                    }),
                    None => incomplete(IncompleteReason::MissingMember {
                        kind: ElementKind::Way,
                        id: way_id,
                    }),
                }
            }
            boundaries.push(BoundaryRelation {
                id: relation.id,
                tags: relation.tags.clone(),
                members,
            });
        }
        boundaries
    }

    /// Place nodes and the centroids of closed place ways, ordered by
    /// `(kind, id)`.
    pub fn places(&self, issues: &IssueLog) -> Vec<PlaceCandidate> {
        let mut places = self.place_nodes.clone();
        for way in &self.place_ways {
            let coords = match self.way_coords(way.id, &way.nodes, issues) {
                Some(coords) => coords,
                None => continue,
            };
            let polygon = Polygon::new(LineString::new(coords), vec![]);
            if let Some(centroid) = polygon.centroid() {
                places.push(PlaceCandidate {
                    kind: ElementKind::Way,
                    id: way.id,
                    location: centroid.0,
                    tags: way.tags.clone(),
                });
            }
        }
        places.sort_by_key(|place| (place.kind, place.id));
        places.dedup_by_key(|place| (place.kind, place.id));
        places
    }
}
