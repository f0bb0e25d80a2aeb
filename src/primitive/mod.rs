use osmpbfreader::{OsmId, OsmObj};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::Node => "node",
            ElementKind::Way => "way",
            ElementKind::Relation => "relation",
        };
        f.write_str(name)
    }
}

/// Coordinates are kept at the PBF's native 1e-7 degree resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeCoord {
    pub decimicro_lat: i32,
    pub decimicro_lon: i32,
}

impl NodeCoord {
    pub fn from_degrees(lat: f64, lon: f64) -> Self {
        NodeCoord {
            decimicro_lat: (lat * 1e7).round() as i32,
            decimicro_lon: (lon * 1e7).round() as i32,
        }
    }

    pub fn lat(&self) -> f64 {
        f64::from(self.decimicro_lat) / 1e7
    }

    pub fn lon(&self) -> f64 {
        f64::from(self.decimicro_lon) / 1e7
    }

    pub fn to_coord(self) -> geo_types::Coord<f64> {
        geo_types::Coord {
            x: self.lon(),
            y: self.lat(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub id: i64,
    pub coord: NodeCoord,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawWay {
    pub id: i64,
    pub nodes: Vec<i64>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub kind: ElementKind,
    pub id: i64,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRelation {
    pub id: i64,
    pub members: Vec<Member>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawPrimitive {
    Node(RawNode),
    Way(RawWay),
    Relation(RawRelation),
}

impl RawPrimitive {
    pub fn kind(&self) -> ElementKind {
        match self {
            RawPrimitive::Node(_) => ElementKind::Node,
            RawPrimitive::Way(_) => ElementKind::Way,
            RawPrimitive::Relation(_) => ElementKind::Relation,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            RawPrimitive::Node(node) => node.id,
            RawPrimitive::Way(way) => way.id,
            RawPrimitive::Relation(rel) => rel.id,
        }
    }

    pub fn tags(&self) -> &Tags {
        match self {
            RawPrimitive::Node(node) => &node.tags,
            RawPrimitive::Way(way) => &way.tags,
            RawPrimitive::Relation(rel) => &rel.tags,
        }
    }
}

pub trait TagsExt {
    fn has(&self, key: &str, value: &str) -> bool;
    fn value(&self, key: &str) -> Option<&str>;
}

impl TagsExt for Tags {
    fn has(&self, key: &str, value: &str) -> bool {
        self.get(key).map(String::as_str) == Some(value)
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

fn convert_tags(tags: &osmpbfreader::Tags) -> Tags {
    tags.iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

impl From<OsmObj> for RawPrimitive {
    fn from(obj: OsmObj) -> Self {
        match obj {
            OsmObj::Node(node) => RawPrimitive::Node(RawNode {
                id: node.id.0,
                coord: NodeCoord {
                    decimicro_lat: node.decimicro_lat,
                    decimicro_lon: node.decimicro_lon,
                },
                tags: convert_tags(&node.tags),
            }),
            OsmObj::Way(way) => RawPrimitive::Way(RawWay {
                id: way.id.0,
                nodes: way.nodes.iter().map(|node| node.0).collect(),
                tags: convert_tags(&way.tags),
            }),
            OsmObj::Relation(rel) => RawPrimitive::Relation(RawRelation {
                id: rel.id.0,
                members: rel
                    .refs
                    .iter()
                    .map(|reference| {
                        let (kind, id) = match reference.member {
                            OsmId::Node(id) => (ElementKind::Node, id.0),
                            OsmId::Way(id) => (ElementKind::Way, id.0),
                            OsmId::Relation(id) => (ElementKind::Relation, id.0),
                        };
                        Member {
                            kind,
                            id,
                            role: reference.role.to_string(),
                        }
                    })
                    .collect(),
                tags: convert_tags(&rel.tags),
            }),
        }
    }
}

/// Shorthand constructors used by tests and in-memory sources.
pub mod build {
    use super::*;

    pub fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    pub fn node(id: i64, lat: f64, lon: f64, pairs: &[(&str, &str)]) -> RawPrimitive {
        RawPrimitive::Node(RawNode {
            id,
            coord: NodeCoord::from_degrees(lat, lon),
            tags: tags(pairs),
        })
    }

    pub fn way(id: i64, nodes: &[i64], pairs: &[(&str, &str)]) -> RawPrimitive {
        RawPrimitive::Way(RawWay {
            id,
            nodes: nodes.to_vec(),
            tags: tags(pairs),
        })
    }

    pub fn relation(
        id: i64,
        members: &[(ElementKind, i64, &str)],
        pairs: &[(&str, &str)],
    ) -> RawPrimitive {
        RawPrimitive::Relation(RawRelation {
            id,
            members: members
                .iter()
                .map(|(kind, id, role)| Member {
                    kind: *kind,
                    id: *id,
                    role: role.to_string(),
                })
                .collect(),
            tags: tags(pairs),
        })
    }
}
