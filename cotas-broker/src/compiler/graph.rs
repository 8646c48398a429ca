//! Graph vocabulary shared by the compiler and the store adapters: terms,
//! triples and the SPARQL text they render to.

use serde_json::{Number, Value};
use std::fmt;

/// Prefix block of the context ontology. Every rendered query and update
/// starts with it
pub const SPARQL_PREFIXES: &str = "BASE <http://nesped1.caf.ufv.br/od4cot>\n\
PREFIX cot: <#>\n\
PREFIX rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#>\n\
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>\n\
PREFIX xsd: <http://www.w3.org/2001/XMLSchema#>\n";

/// Literals are kept in lexical form so triples stay hashable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Literal {
    String(String),
    Integer(String),
    Decimal(String),
    Boolean(bool),
}

impl Literal {
    /// `None` for `null` and arrays, which the compiler expands itself
    pub fn from_json(value: &Value) -> Option<Literal> {
        match value {
            Value::Null | Value::Array(_) => None,
            Value::Bool(b) => Some(Literal::Boolean(*b)),
            Value::Number(n) => Some(Self::from_number(n)),
            Value::String(s) => Some(Literal::String(s.clone())),
            // Nested objects are not path keys, keep them as JSON text
            Value::Object(_) => Some(Literal::String(value.to_string())),
        }
    }

    fn from_number(n: &Number) -> Literal {
        if n.is_i64() || n.is_u64() {
            Literal::Integer(n.to_string())
        } else {
            Literal::Decimal(n.to_string())
        }
    }

    pub fn lexical(&self) -> String {
        match self {
            Literal::String(s) | Literal::Integer(s) | Literal::Decimal(s) => s.clone(),
            Literal::Boolean(b) => b.to_string(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "\"{}\"", escape(s)),
            Literal::Integer(s) => write!(f, "{s}"),
            Literal::Decimal(s) => write!(f, "\"{s}\"^^xsd:double"),
            Literal::Boolean(b) => write!(f, "{b}"),
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Var(String),
    Blank(String),
    /// Local name in the `cot:` namespace
    Name(String),
    /// `rdf:type`, rendered as `a`
    RdfType,
    Literal(Literal),
}

impl Term {
    pub fn var(name: impl Into<String>) -> Term {
        Term::Var(name.into())
    }

    pub fn name(local: impl Into<String>) -> Term {
        Term::Name(local.into())
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Term::Var(_))
    }

    /// The value reported in a result row
    pub fn lexical(&self) -> String {
        match self {
            Term::Var(v) => v.clone(),
            Term::Blank(b) => b.clone(),
            Term::Name(n) => n.clone(),
            Term::RdfType => "type".to_string(),
            Term::Literal(l) => l.lexical(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(v) => write!(f, "?{v}"),
            Term::Blank(b) => write!(f, "_:{b}"),
            Term::Name(n) => write!(f, "cot:{n}"),
            Term::RdfType => write!(f, "a"),
            Term::Literal(l) => write!(f, "{l}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triple {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl Triple {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} .", self.subject, self.predicate, self.object)
    }
}

/// A graph pattern of a WHERE clause. Optional patterns bind old values that
/// may not exist yet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub triple: Triple,
    pub optional: bool,
}

impl Pattern {
    pub fn required(triple: Triple) -> Self {
        Self {
            triple,
            optional: false,
        }
    }

    pub fn optional(triple: Triple) -> Self {
        Self {
            triple,
            optional: true,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.optional {
            write!(f, "OPTIONAL {{ {} }}", self.triple)
        } else {
            write!(f, "{}", self.triple)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literals_render_typed() {
        assert_eq!(Literal::from_json(&json!("a \"b\"")).unwrap().to_string(), r#""a \"b\"""#);
        assert_eq!(Literal::from_json(&json!(42)).unwrap().to_string(), "42");
        assert_eq!(
            Literal::from_json(&json!(21.5)).unwrap().to_string(),
            "\"21.5\"^^xsd:double"
        );
        assert_eq!(Literal::from_json(&json!(true)).unwrap().to_string(), "true");
        assert_eq!(Literal::from_json(&json!(null)), None);
    }

    #[test]
    fn optional_pattern_wraps_triple() {
        let t = Triple::new(Term::var("device"), Term::name("color"), Term::var("old"));
        assert_eq!(Pattern::required(t.clone()).to_string(), "?device cot:color ?old .");
        assert_eq!(
            Pattern::optional(t).to_string(),
            "OPTIONAL { ?device cot:color ?old . }"
        );
    }
}
