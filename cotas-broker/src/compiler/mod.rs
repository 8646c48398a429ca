//! Path-to-graph-update compiler.
//!
//! Update documents arrive flat: every field name is a path key (see
//! [`PathKey`]) and every value the new state of the property the key ends
//! in. [`compile_update`] turns one document into a single
//! DELETE/INSERT/WHERE unit anchored on the object's id, so the store can
//! apply it atomically. The same path walk also builds the initial state
//! graph of a subscription ([`compile_registration`]) and the criteria of a
//! search ([`compile_search`]).
//!
//! Every intermediate node a path reaches gets a synthetic variable. The name
//! is derived from the parent node, the property followed and the types
//! asserted on the node, and is recorded in a [`VariableTable`] keyed by the
//! sub-path. Two keys that share a prefix therefore resolve that prefix to
//! the same variable, and the set based clause dedup leaves exactly one
//! pattern per real edge.

pub mod graph;
mod path;

use cotas_pdu::ObjectId;
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    hash::Hash,
    net::IpAddr,
};
use thiserror::Error;

pub use graph::{Literal, Pattern, Term, Triple, SPARQL_PREFIXES};
pub use path::{tokenize, Hop, PathKey, Token};

/// Variable bound to the object node every update is anchored on
pub const ANCHOR: &str = "device";
pub const ID_PROPERTY: &str = "objectId";
pub const IP_PROPERTY: &str = "ipAddress";
pub const PORT_PROPERTY: &str = "port";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CompileError {
    #[error("Malformed path key {key:?}: {reason}")]
    MalformedKey { key: String, reason: &'static str },
    #[error("Invalid name {0:?}")]
    InvalidName(String),
    #[error("Unsupported value for {0:?}")]
    UnsupportedValue(String),
    #[error("Document has no fields to compile")]
    EmptyDocument,
}

/// Ordered set: keeps first-insertion order so rendered text is stable
#[derive(Debug, Clone)]
pub struct ClauseSet<T> {
    items: Vec<T>,
    seen: HashSet<T>,
}

impl<T> Default for ClauseSet<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl<T: Clone + Eq + Hash> ClauseSet<T> {
    pub fn insert(&mut self, item: T) -> bool {
        if self.seen.insert(item.clone()) {
            self.items.push(item);
            true
        } else {
            false
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

/// Naming table of synthetic variables: sub-path -> variable name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableTable {
    by_path: BTreeMap<String, String>,
    claimed: HashSet<String>,
}

impl Default for VariableTable {
    fn default() -> Self {
        let mut table = Self {
            by_path: BTreeMap::new(),
            claimed: HashSet::new(),
        };
        table.claim("", ANCHOR.to_string());
        table
    }
}

impl VariableTable {
    /// Name for `subpath`. The first sighting mints `proposed`, suffixed with
    /// a counter if another sub-path already owns that name
    fn claim(&mut self, subpath: &str, proposed: String) -> String {
        if let Some(name) = self.by_path.get(subpath) {
            return name.clone();
        }
        let mut name = proposed.clone();
        let mut n = 2;
        while self.claimed.contains(&name) {
            name = format!("{proposed}_{n}");
            n += 1;
        }
        self.claimed.insert(name.clone());
        self.by_path.insert(subpath.to_string(), name.clone());
        name
    }

    pub fn get(&self, subpath: &str) -> Option<&str> {
        self.by_path.get(subpath).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

fn sanitize(name: &str) -> String {
    name.replace('-', "_")
}

/// Usable as the local part of a `cot:` name: `[A-Za-z0-9_-]`, not
/// starting with `-`
fn is_local_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn check_name(name: &str) -> Result<(), CompileError> {
    if is_local_name(name) {
        Ok(())
    } else {
        Err(CompileError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
enum NodeKind {
    Var,
    Blank,
}

/// Where a path walk ended: the node holding the leaf property
struct LeafNode {
    term: Term,
    name: String,
}

struct Walker<'a> {
    table: &'a mut VariableTable,
    kind: NodeKind,
    anchor: Term,
}

impl Walker<'_> {
    /// Follow every hop of `key`, emitting one edge per hop and one type
    /// assertion per `/Type`
    fn walk(&mut self, key: &PathKey, structure: &mut ClauseSet<Triple>) -> LeafNode {
        let mut node = self.anchor.clone();
        let mut node_name = ANCHOR.to_string();
        let mut subpath = String::new();

        for hop in &key.hops {
            if !subpath.is_empty() {
                subpath.push('.');
            }
            subpath.push_str(&hop.property);

            let mut suffix = String::new();
            for ty in &hop.types {
                subpath.push('/');
                subpath.push_str(ty);
                suffix.push('_');
                suffix.push_str(&sanitize(ty));
            }

            let proposed = format!("{node_name}_{}{suffix}", sanitize(&hop.property));
            let next_name = self.table.claim(&subpath, proposed);
            let next = match self.kind {
                NodeKind::Var => Term::Var(next_name.clone()),
                NodeKind::Blank => Term::Blank(next_name.clone()),
            };

            structure.insert(Triple::new(
                node.clone(),
                Term::name(&hop.property),
                next.clone(),
            ));
            for ty in &hop.types {
                structure.insert(Triple::new(next.clone(), Term::RdfType, Term::name(ty)));
            }

            node = next;
            node_name = next_name;
        }

        LeafNode {
            term: node,
            name: node_name,
        }
    }
}

/// Values a leaf takes: one per array element, none for `null`
fn leaf_values(value: &Value) -> Vec<Term> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| match Literal::from_json(v) {
                Some(l) => Term::Literal(l),
                None => Term::Literal(Literal::String(v.to_string())),
            })
            .collect(),
        v => Literal::from_json(v).map(Term::Literal).into_iter().collect(),
    }
}

fn object_node(id: ObjectId) -> Term {
    Term::name(format!("object{id}"))
}

/// One atomic graph update: delete the old values, insert the new ones, with
/// the patterns that bind the nodes in between
#[derive(Debug, Clone)]
pub struct CompiledUpdate {
    pub anchor: Triple,
    pub deletes: Vec<Triple>,
    pub inserts: Vec<Triple>,
    pub binds: Vec<Pattern>,
    pub variables: VariableTable,
}

impl CompiledUpdate {
    /// WHERE patterns in evaluation order: the anchor, the structural binds,
    /// then the optional old-value binds
    pub fn where_patterns(&self) -> Vec<Pattern> {
        let mut patterns = vec![Pattern::required(self.anchor.clone())];
        patterns.extend(self.binds.iter().filter(|p| !p.optional).cloned());
        patterns.extend(self.binds.iter().filter(|p| p.optional).cloned());
        patterns
    }
}

impl fmt::Display for CompiledUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SPARQL_PREFIXES}DELETE {{\n")?;
        for t in &self.deletes {
            writeln!(f, "  {t}")?;
        }
        write!(f, "}}\nINSERT {{\n")?;
        for t in &self.inserts {
            writeln!(f, "  {t}")?;
        }
        write!(f, "}}\nWHERE {{\n")?;
        for p in self.where_patterns() {
            writeln!(f, "  {p}")?;
        }
        write!(f, "}}")
    }
}

/// Compile a flat update document for the object `anchor_id`. Control fields
/// (`id`, `req`, ...) must already be stripped
pub fn compile_update(
    anchor_id: ObjectId,
    document: &Map<String, Value>,
) -> Result<CompiledUpdate, CompileError> {
    if document.is_empty() {
        return Err(CompileError::EmptyDocument);
    }

    let device = Term::var(ANCHOR);
    let mut variables = VariableTable::default();
    let mut deletes = ClauseSet::default();
    let mut inserts = ClauseSet::default();
    let mut binds = ClauseSet::default();

    for (key, value) in document {
        let path = PathKey::parse(key)?;
        let mut structure = ClauseSet::default();
        let leaf = Walker {
            table: &mut variables,
            kind: NodeKind::Var,
            anchor: device.clone(),
        }
        .walk(&path, &mut structure);

        for triple in structure.into_vec() {
            binds.insert(Pattern::required(triple));
        }

        let old_name = variables.claim(
            &format!("={key}"),
            format!("old_{}_{}", leaf.name, sanitize(&path.leaf)),
        );
        let property = Term::name(&path.leaf);
        let old_value = Triple::new(leaf.term.clone(), property.clone(), Term::Var(old_name));

        deletes.insert(old_value.clone());
        binds.insert(Pattern::optional(old_value));
        for new_value in leaf_values(value) {
            inserts.insert(Triple::new(leaf.term.clone(), property.clone(), new_value));
        }
    }

    Ok(CompiledUpdate {
        anchor: Triple::new(
            device,
            Term::name(ID_PROPERTY),
            Term::Literal(Literal::Integer(anchor_id.to_string())),
        ),
        deletes: deletes.into_vec(),
        inserts: inserts.into_vec(),
        binds: binds.into_vec(),
        variables,
    })
}

/// Concrete triples to add, nested nodes as blank nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphInsert {
    pub triples: Vec<Triple>,
}

impl fmt::Display for GraphInsert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SPARQL_PREFIXES}INSERT DATA {{\n")?;
        for t in &self.triples {
            writeln!(f, "  {t}")?;
        }
        write!(f, "}}")
    }
}

/// Everything the graph records about a freshly registered object
#[derive(Debug, Clone)]
pub struct ObjectDescription<'a> {
    pub id: ObjectId,
    pub ip: IpAddr,
    pub port: u16,
    pub category: Option<&'a str>,
    pub state: &'a Map<String, Value>,
}

/// Initial state graph of a subscription: the object node with its id,
/// address and category, plus every path key of the subscribe document
pub fn compile_registration(
    object: &ObjectDescription<'_>,
) -> Result<GraphInsert, CompileError> {
    let node = object_node(object.id);
    let mut triples = ClauseSet::default();

    triples.insert(Triple::new(
        node.clone(),
        Term::name(ID_PROPERTY),
        Term::Literal(Literal::Integer(object.id.to_string())),
    ));
    triples.insert(Triple::new(
        node.clone(),
        Term::name(IP_PROPERTY),
        Term::Literal(Literal::String(object.ip.to_string())),
    ));
    triples.insert(Triple::new(
        node.clone(),
        Term::name(PORT_PROPERTY),
        Term::Literal(Literal::Integer(object.port.to_string())),
    ));
    if let Some(category) = object.category {
        check_name(category)?;
        triples.insert(Triple::new(
            node.clone(),
            Term::RdfType,
            Term::name(category),
        ));
    }

    let mut variables = VariableTable::default();
    for (key, value) in object.state {
        let path = PathKey::parse(key)?;
        let leaf = Walker {
            table: &mut variables,
            kind: NodeKind::Blank,
            anchor: node.clone(),
        }
        .walk(&path, &mut triples);

        for v in leaf_values(value) {
            triples.insert(Triple::new(leaf.term.clone(), Term::name(&path.leaf), v));
        }
    }

    Ok(GraphInsert {
        triples: triples.into_vec(),
    })
}

/// Read-only query projecting the address of every matching object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    pub projection: Vec<String>,
    pub patterns: Vec<Triple>,
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SPARQL_PREFIXES}SELECT")?;
        for v in &self.projection {
            write!(f, " ?{v}")?;
        }
        write!(f, "\nWHERE {{\n")?;
        for t in &self.patterns {
            writeln!(f, "  {t}")?;
        }
        write!(f, "}}")
    }
}

/// Search criteria: `type` restricts the category, every other key is a path
/// key whose leaf must hold the given value
pub fn compile_search(criteria: &Map<String, Value>) -> Result<SelectQuery, CompileError> {
    if criteria.is_empty() {
        return Err(CompileError::EmptyDocument);
    }

    let device = Term::var(ANCHOR);
    let mut variables = VariableTable::default();
    let ip = variables.claim("#ip", "ip".to_string());
    let port = variables.claim("#port", "port".to_string());

    let mut patterns = ClauseSet::default();
    patterns.insert(Triple::new(
        device.clone(),
        Term::name(IP_PROPERTY),
        Term::var(&ip),
    ));
    patterns.insert(Triple::new(
        device.clone(),
        Term::name(PORT_PROPERTY),
        Term::var(&port),
    ));

    for (key, value) in criteria {
        if key == "type" {
            let Some(category) = value.as_str() else {
                return Err(CompileError::UnsupportedValue(key.clone()));
            };
            check_name(category)?;
            patterns.insert(Triple::new(
                device.clone(),
                Term::RdfType,
                Term::name(category),
            ));
            continue;
        }

        let path = PathKey::parse(key)?;
        let values = leaf_values(value);
        if values.is_empty() {
            return Err(CompileError::UnsupportedValue(key.clone()));
        }
        let leaf = Walker {
            table: &mut variables,
            kind: NodeKind::Var,
            anchor: device.clone(),
        }
        .walk(&path, &mut patterns);
        for v in values {
            patterns.insert(Triple::new(leaf.term.clone(), Term::name(&path.leaf), v));
        }
    }

    Ok(SelectQuery {
        projection: vec![ip, port],
        patterns: patterns.into_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn edges<'a>(binds: &'a [Pattern], property: &str) -> Vec<&'a Pattern> {
        binds
            .iter()
            .filter(|p| p.triple.predicate == Term::name(property))
            .collect()
    }

    #[test]
    fn direct_property_compiles_to_one_bind() {
        let update = compile_update(42, &doc(json!({"color": "red"}))).unwrap();

        assert_eq!(
            update.anchor,
            Triple::new(
                Term::var("device"),
                Term::name("objectId"),
                Term::Literal(Literal::Integer("42".into()))
            )
        );
        assert_eq!(
            update.deletes,
            vec![Triple::new(
                Term::var("device"),
                Term::name("color"),
                Term::var("old_device_color")
            )]
        );
        assert_eq!(
            update.inserts,
            vec![Triple::new(
                Term::var("device"),
                Term::name("color"),
                Term::Literal(Literal::String("red".into()))
            )]
        );
        assert_eq!(update.binds.len(), 1);
        assert!(update.binds[0].optional);
    }

    #[test]
    fn shared_prefix_binds_once() {
        let update =
            compile_update(7, &doc(json!({"a/B.x": 1, "a/B.y": "two"}))).unwrap();

        let a_edges = edges(&update.binds, "a");
        assert_eq!(a_edges.len(), 1);
        assert_eq!(a_edges[0].triple.object, Term::var("device_a_B"));

        let types: Vec<_> = update
            .binds
            .iter()
            .filter(|p| p.triple.predicate == Term::RdfType)
            .collect();
        assert_eq!(types.len(), 1);

        assert_eq!(update.deletes.len(), 2);
        assert_eq!(update.inserts.len(), 2);
        assert!(update
            .deletes
            .iter()
            .all(|t| t.subject == Term::var("device_a_B")));
        assert_eq!(update.variables.get("a/B"), Some("device_a_B"));
    }

    #[test]
    fn diverging_types_get_distinct_nodes() {
        let update = compile_update(7, &doc(json!({"a/B.x": 1, "a/C.x": 2}))).unwrap();
        let a_edges = edges(&update.binds, "a");
        assert_eq!(a_edges.len(), 2);
        assert_ne!(a_edges[0].triple.object, a_edges[1].triple.object);
        assert_eq!(update.deletes.len(), 2);
    }

    #[test]
    fn repeated_relation_names_do_not_collide() {
        let update =
            compile_update(7, &doc(json!({"part.part.size": 3, "part.size": 4}))).unwrap();

        let part_edges = edges(&update.binds, "part");
        assert_eq!(part_edges.len(), 2);
        assert_eq!(part_edges[0].triple.subject, Term::var("device"));
        assert_eq!(part_edges[0].triple.object, Term::var("device_part"));
        assert_eq!(part_edges[1].triple.subject, Term::var("device_part"));
        assert_eq!(part_edges[1].triple.object, Term::var("device_part_part"));

        let old: HashSet<_> = update.deletes.iter().map(|t| t.object.clone()).collect();
        assert_eq!(old.len(), 2);
    }

    #[test]
    fn underscore_names_are_disambiguated() {
        // "a_b" then "c" and "a" then "b_c" would both propose device_a_b_c
        let update = compile_update(1, &doc(json!({"a_b.c.x": 1, "a.b_c.x": 2}))).unwrap();
        let subjects: HashSet<_> = update.deletes.iter().map(|t| t.subject.clone()).collect();
        assert_eq!(subjects.len(), 2);
    }

    #[test]
    fn null_deletes_and_arrays_fan_out() {
        let update = compile_update(1, &doc(json!({"gone": null, "tags": ["x", "y"]}))).unwrap();
        assert_eq!(update.deletes.len(), 2);
        assert_eq!(update.inserts.len(), 2);
        assert!(update
            .inserts
            .iter()
            .all(|t| t.predicate == Term::name("tags")));
    }

    #[test]
    fn malformed_key_fails_compilation() {
        assert!(matches!(
            compile_update(1, &doc(json!({"a..b": 1}))),
            Err(CompileError::MalformedKey { .. })
        ));
        assert_eq!(
            compile_update(1, &Map::new()).unwrap_err(),
            CompileError::EmptyDocument
        );
    }

    #[test]
    fn rendered_update_puts_optionals_last() {
        let update = compile_update(9, &doc(json!({"a/B.x": 1}))).unwrap();
        let text = update.to_string();
        let where_clause = text.split("WHERE").nth(1).unwrap();
        let optional_at = where_clause.find("OPTIONAL").unwrap();
        let type_at = where_clause.find("?device_a_B a cot:B .").unwrap();
        assert!(type_at < optional_at);
        assert!(text.contains("?device cot:objectId 9 ."));
        assert!(text.contains("INSERT {\n  ?device_a_B cot:x 1 .\n}"));
    }

    #[test]
    fn registration_shares_blank_nodes_for_shared_prefixes() {
        let state = doc(json!({
            "physicalStorage/CoatHanger.material": "wood",
            "physicalStorage/CoatHanger.hooks": 4,
        }));
        let insert = compile_registration(&ObjectDescription {
            id: 20001,
            ip: "10.0.0.2".parse().unwrap(),
            port: 19,
            category: Some("Wardrobe"),
            state: &state,
        })
        .unwrap();

        let node = Term::name("object20001");
        assert!(insert
            .triples
            .contains(&Triple::new(node.clone(), Term::RdfType, Term::name("Wardrobe"))));
        let storage: Vec<_> = insert
            .triples
            .iter()
            .filter(|t| t.predicate == Term::name("physicalStorage"))
            .collect();
        assert_eq!(storage.len(), 1);
        assert_eq!(
            storage[0].object,
            Term::Blank("device_physicalStorage_CoatHanger".into())
        );
        // id, ip, port, type, edge, node type, two leaves
        assert_eq!(insert.triples.len(), 8);
        assert!(insert.to_string().contains("INSERT DATA {"));
    }

    #[test]
    fn registration_rejects_bad_category() {
        let state = Map::new();
        let err = compile_registration(&ObjectDescription {
            id: 1,
            ip: "::1".parse().unwrap(),
            port: 1,
            category: Some("not a name"),
            state: &state,
        })
        .unwrap_err();
        assert_eq!(err, CompileError::InvalidName("not a name".into()));

        let err = compile_registration(&ObjectDescription {
            id: 1,
            ip: "::1".parse().unwrap(),
            port: 1,
            category: Some("-Lamp"),
            state: &state,
        })
        .unwrap_err();
        assert_eq!(err, CompileError::InvalidName("-Lamp".into()));
    }

    #[test]
    fn search_projects_address_and_filters() {
        let query =
            compile_search(&doc(json!({"type": "Camera", "room/Kitchen.floor": 1}))).unwrap();
        assert_eq!(query.projection, vec!["ip".to_string(), "port".to_string()]);
        assert!(query
            .patterns
            .contains(&Triple::new(Term::var("device"), Term::RdfType, Term::name("Camera"))));
        assert!(query.patterns.contains(&Triple::new(
            Term::var("device_room_Kitchen"),
            Term::name("floor"),
            Term::Literal(Literal::Integer("1".into()))
        )));
        assert!(query.to_string().contains("SELECT ?ip ?port"));
    }

    #[test]
    fn search_needs_criteria() {
        assert_eq!(
            compile_search(&Map::new()).unwrap_err(),
            CompileError::EmptyDocument
        );
        assert!(compile_search(&doc(json!({"type": 3}))).is_err());
        assert!(compile_search(&doc(json!({"color": null}))).is_err());
    }
}
