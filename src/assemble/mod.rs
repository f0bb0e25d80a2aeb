use crate::error::{IncompleteGeometryError, IncompleteReason, RecordRejectedError};
use crate::issues::IssueLog;
use crate::primitive::{Tags, TagsExt};
use crate::record::{display_name, names_from_tags, CountryRecord, Ring, MIN_RING_POINTS};
use geo::Coord;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Outer,
    Inner,
}

impl Role {
    /// Roles that contribute geometry; an empty role counts as `inherited`.
    pub fn parse(role: &str, inherited: Role) -> Option<Role> {
        match role {
            "outer" => Some(Role::Outer),
            "inner" => Some(Role::Inner),
            "" => Some(inherited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberGeometry {
    pub way_id: i64,
    pub role: Role,
    pub coords: Vec<Coord<f64>>,
}

/// A boundary relation with its member ways resolved to coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryRelation {
    pub id: i64,
    pub tags: Tags,
    pub members: Vec<MemberGeometry>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Assembly {
    pub outer: Vec<Ring>,
    pub inner: Vec<Ring>,
    pub issues: Vec<IncompleteGeometryError>,
}

type EndpointKey = (u64, u64);

fn key(coord: &Coord<f64>) -> EndpointKey {
    (coord.x.to_bits(), coord.y.to_bits())
}

fn is_closed(chain: &[Coord<f64>]) -> bool {
    match (chain.first(), chain.last()) {
        (Some(first), Some(last)) => chain.len() > 1 && key(first) == key(last),
        _ => false,
    }
}

fn push_distinct(chain: &mut Vec<Coord<f64>>, coord: Coord<f64>) {
    if chain.last().map(key) != Some(key(&coord)) {
        chain.push(coord);
    }
}

fn append(chain: &mut Vec<Coord<f64>>, fragment: &[Coord<f64>]) {
    let joins_forward = chain.last().map(key) == fragment.first().map(key);
    if joins_forward {
        fragment.iter().for_each(|coord| push_distinct(chain, *coord));
    } else {
        fragment
            .iter()
            .rev()
            .for_each(|coord| push_distinct(chain, *coord));
    }
}

fn stitch(
    relation_id: i64,
    fragments: &[&[Coord<f64>]],
    rings: &mut Vec<Ring>,
    issues: &mut Vec<IncompleteGeometryError>,
) {
    let mut endpoints: HashMap<EndpointKey, Vec<usize>> = HashMap::new();
    for (index, fragment) in fragments.iter().enumerate() {
        if let (Some(first), Some(last)) = (fragment.first(), fragment.last()) {
            endpoints.entry(key(first)).or_default().push(index);
            if key(first) != key(last) {
                endpoints.entry(key(last)).or_default().push(index);
            }
        }
    }

    let mut used = vec![false; fragments.len()];
    for start in 0..fragments.len() {
        if used[start] || fragments[start].is_empty() {
            continue;
        }
        used[start] = true;
        let mut chain = Vec::with_capacity(fragments[start].len());
        append(&mut chain, fragments[start]);

        // Every join consumes a fragment and the chain turns around at most
        // once, which bounds the attempts per chain.
        let mut reversed = false;
        while !is_closed(&chain) {
            let end = match chain.last() {
                Some(end) => key(end),
                None => break,
            };
            let next = endpoints
                .get(&end)
                .and_then(|candidates| candidates.iter().copied().find(|index| !used[*index]));
            match next {
                Some(index) => {
                    used[index] = true;
                    append(&mut chain, fragments[index]);
                }
                None if !reversed => {
                    chain.reverse();
                    reversed = true;
                }
                None => break,
            }
        }

        let reason = if !is_closed(&chain) {
            let point = |coord: Option<&Coord<f64>>| coord.map_or([f64::NAN; 2], |c| [c.x, c.y]);
            IncompleteReason::OpenChain {
                start: point(chain.first()),
                end: point(chain.last()),
            }
        } else if chain.len() < MIN_RING_POINTS {
            IncompleteReason::DegenerateRing {
                points: chain.len(),
            }
        } else if let Some(ring) = Ring::new(chain) {
            rings.push(ring);
            continue;
        } else {
            continue;
        };
        issues.push(IncompleteGeometryError {
            relation_id,
            reason,
        });
    }
}

/// Joins member ways into closed outer and inner rings. Candidates sharing an
/// endpoint are taken in member order.
pub fn assemble_rings(relation_id: i64, members: &[MemberGeometry]) -> Assembly {
    let mut assembly = Assembly::default();
    for role in [Role::Outer, Role::Inner] {
        let fragments: Vec<&[Coord<f64>]> = members
            .iter()
            .filter(|member| member.role == role)
            .map(|member| member.coords.as_slice())
            .collect();
        let rings = match role {
            Role::Outer => &mut assembly.outer,
            Role::Inner => &mut assembly.inner,
        };
        stitch(relation_id, &fragments, rings, &mut assembly.issues);
    }
    assembly
}

pub fn is_country_relation(tags: &Tags) -> bool {
    tags.has("boundary", "administrative") && tags.has("admin_level", "2")
}

pub fn iso_alpha2(tags: &Tags) -> Option<String> {
    tags.value("ISO3166-1:alpha2")
        .or_else(|| tags.value("ISO3166-1"))
        .map(str::trim)
        .filter(|code| code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()))
        .map(str::to_ascii_uppercase)
}

fn iso_alpha3(tags: &Tags) -> Option<String> {
    tags.value("ISO3166-1:alpha3")
        .map(str::trim)
        .filter(|code| code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()))
        .map(str::to_ascii_uppercase)
}

/// Builds a country from one admin_level=2 relation. Geometry problems are
/// recorded in `issues`; the country is rejected only when no outer ring
/// closes or it carries no ISO alpha-2 code.
pub fn build_country(
    relation: &BoundaryRelation,
    languages: &[String],
    issues: &IssueLog,
) -> Result<CountryRecord, RecordRejectedError> {
    let rejected = |reason: &str| RecordRejectedError {
        key: format!("relation {}", relation.id),
        reason: reason.to_string(),
    };
    let iso_alpha2 =
        iso_alpha2(&relation.tags).ok_or_else(|| rejected("no ISO 3166-1 alpha-2 code"))?;

    let assembly = assemble_rings(relation.id, &relation.members);
    for issue in assembly.issues {
        issues.incomplete_geometry(issue);
    }
    if assembly.outer.is_empty() {
        return Err(rejected("no closed outer ring"));
    }
    debug!(
        relation = relation.id,
        iso = %iso_alpha2,
        outer = assembly.outer.len(),
        inner = assembly.inner.len(),
        "assembled country"
    );

    let names = names_from_tags(&relation.tags);
    let display_name = display_name(&names, languages, || format!("Country {}", relation.id));
    Ok(CountryRecord {
        osm_id: relation.id,
        iso_alpha3: iso_alpha3(&relation.tags),
        iso_alpha2,
        names,
        display_name,
        outer: assembly.outer,
        inner: assembly.inner,
        center: None,
        timezone: None,
        continent: None,
        region: None,
        currency: None,
        official_languages: Vec::new(),
    })
}
