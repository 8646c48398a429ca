//! Path keys: `physicalStorage/CoatHanger.material` reads as "the device has
//! a `physicalStorage` node, that node is a `CoatHanger`, and its `material`
//! is being set". `.` descends to a new node, `/` declares the type of the
//! current one.

use super::CompileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Property(String),
    Descend,
    TypedAs,
}

/// Split on `.` and `/`, keeping the delimiters as tokens in between the
/// names. Empty names are kept so the parser can reject them
pub fn tokenize(key: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut name = String::new();
    for c in key.chars() {
        match c {
            '.' | '/' => {
                tokens.push(Token::Property(std::mem::take(&mut name)));
                tokens.push(if c == '.' {
                    Token::Descend
                } else {
                    Token::TypedAs
                });
            }
            c => name.push(c),
        }
    }
    tokens.push(Token::Property(name));
    tokens
}

/// One step away from the current node: follow `property`, then assert the
/// new node is each of `types`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub property: String,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub hops: Vec<Hop>,
    pub leaf: String,
}

impl PathKey {
    pub fn parse(key: &str) -> Result<Self, CompileError> {
        let malformed = |reason: &'static str| CompileError::MalformedKey {
            key: key.to_string(),
            reason,
        };

        let mut hops: Vec<Hop> = Vec::new();
        let mut tokens = tokenize(key).into_iter();
        let mut pending: Option<Token> = None;

        while let Some(token) = tokens.next() {
            let Token::Property(name) = token else {
                return Err(malformed("delimiter out of place"));
            };
            if name.is_empty() {
                return Err(malformed("empty name"));
            }
            if !super::is_local_name(&name) {
                return Err(malformed("names use [A-Za-z0-9_-] and may not start with -"));
            }

            match pending.take() {
                // First name, or `.name`: a new hop from the current node
                None | Some(Token::Descend) => hops.push(Hop {
                    property: name,
                    types: Vec::new(),
                }),
                // `/Type`: stays on the node the last hop reached
                Some(Token::TypedAs) => match hops.last_mut() {
                    Some(hop) => hop.types.push(name),
                    None => return Err(malformed("type before any property")),
                },
                Some(Token::Property(_)) => return Err(malformed("adjacent names")),
            }
            pending = tokens.next();
        }

        let Some(last) = hops.pop() else {
            return Err(malformed("empty key"));
        };
        if !last.types.is_empty() {
            return Err(malformed("key ends in a type assertion"));
        }
        Ok(Self {
            hops,
            leaf: last.property,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_keeps_delimiters_interleaved() {
        assert_eq!(
            tokenize("a/B.c"),
            vec![
                Token::Property("a".into()),
                Token::TypedAs,
                Token::Property("B".into()),
                Token::Descend,
                Token::Property("c".into()),
            ]
        );
    }

    #[test]
    fn direct_property_has_no_hops() {
        let key = PathKey::parse("color").unwrap();
        assert!(key.hops.is_empty());
        assert_eq!(key.leaf, "color");
    }

    #[test]
    fn types_attach_to_the_node_they_follow() {
        let key = PathKey::parse("physicalStorage/CoatHanger/Furniture.room.material").unwrap();
        assert_eq!(
            key.hops,
            vec![
                Hop {
                    property: "physicalStorage".into(),
                    types: vec!["CoatHanger".into(), "Furniture".into()],
                },
                Hop {
                    property: "room".into(),
                    types: vec![],
                },
            ]
        );
        assert_eq!(key.leaf, "material");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for key in [
            "", ".a", "a.", "a..b", "a/B", "a/B/C", "a b", "a/.b", "é", "-x", "a.-b", "a/-T.b",
        ] {
            assert!(PathKey::parse(key).is_err(), "{key:?} should not parse");
        }
    }
}
