use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use super::{GraphUpdate, Row, StoreError, TripleStore};
use crate::compiler::{GraphInsert, Pattern, SelectQuery, Term, Triple};

type Binding = HashMap<String, Term>;

#[derive(Default)]
struct Graph {
    triples: HashSet<Triple>,
    next_blank: u64,
}

impl Graph {
    fn insert_data(&mut self, insert: &GraphInsert) {
        // Blank node labels are scoped to one insert
        let mut labels: HashMap<String, Term> = HashMap::new();
        let mut relabel = |term: &Term, next_blank: &mut u64| match term {
            Term::Blank(label) => labels
                .entry(label.clone())
                .or_insert_with(|| {
                    *next_blank += 1;
                    Term::Blank(format!("b{next_blank}"))
                })
                .clone(),
            other => other.clone(),
        };

        for t in &insert.triples {
            let triple = Triple::new(
                relabel(&t.subject, &mut self.next_blank),
                t.predicate.clone(),
                relabel(&t.object, &mut self.next_blank),
            );
            self.triples.insert(triple);
        }
    }

    fn solve(&self, patterns: &[Pattern]) -> Vec<Binding> {
        let mut solutions = vec![Binding::new()];
        for pattern in patterns {
            let mut next = Vec::new();
            for solution in &solutions {
                let extended: Vec<Binding> = self
                    .triples
                    .iter()
                    .filter_map(|t| match_triple(&pattern.triple, t, solution))
                    .collect();
                if extended.is_empty() && pattern.optional {
                    next.push(solution.clone());
                } else {
                    next.extend(extended);
                }
            }
            solutions = next;
        }
        solutions
    }
}

fn match_term(pattern: &Term, ground: &Term, binding: &mut Binding) -> bool {
    match pattern {
        Term::Var(name) => match binding.get(name) {
            Some(bound) => bound == ground,
            None => {
                binding.insert(name.clone(), ground.clone());
                true
            }
        },
        other => other == ground,
    }
}

fn match_triple(pattern: &Triple, ground: &Triple, binding: &Binding) -> Option<Binding> {
    let mut binding = binding.clone();
    (match_term(&pattern.subject, &ground.subject, &mut binding)
        && match_term(&pattern.predicate, &ground.predicate, &mut binding)
        && match_term(&pattern.object, &ground.object, &mut binding))
    .then_some(binding)
}

/// Template instantiation; `None` if a variable is left unbound
fn instantiate(template: &Triple, binding: &Binding) -> Option<Triple> {
    let resolve = |term: &Term| match term {
        Term::Var(name) => binding.get(name).cloned(),
        other => Some(other.clone()),
    };
    Some(Triple::new(
        resolve(&template.subject)?,
        resolve(&template.predicate)?,
        resolve(&template.object)?,
    ))
}

/// In-process triple store. Every update runs under one lock, so a
/// delete/insert pair is never observed half applied
#[derive(Default)]
pub struct MemoryStore {
    graph: Mutex<Graph>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.graph.lock().await.triples.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, triple: &Triple) -> bool {
        self.graph.lock().await.triples.contains(triple)
    }

    /// Every ground triple with the given subject and predicate
    pub async fn objects(&self, subject: &Term, predicate: &Term) -> Vec<Term> {
        self.graph
            .lock()
            .await
            .triples
            .iter()
            .filter(|t| &t.subject == subject && &t.predicate == predicate)
            .map(|t| t.object.clone())
            .collect()
    }
}

#[async_trait]
impl TripleStore for MemoryStore {
    async fn run_query(&self, query: &SelectQuery) -> Result<Vec<Row>, StoreError> {
        let patterns: Vec<Pattern> = query
            .patterns
            .iter()
            .cloned()
            .map(Pattern::required)
            .collect();
        let graph = self.graph.lock().await;
        Ok(graph
            .solve(&patterns)
            .into_iter()
            .map(|solution| {
                query
                    .projection
                    .iter()
                    .filter_map(|var| solution.get(var).map(|t| (var.clone(), t.lexical())))
                    .collect()
            })
            .collect())
    }

    async fn run_update(&self, update: &GraphUpdate) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        match update {
            GraphUpdate::InsertData(insert) => graph.insert_data(insert),
            GraphUpdate::Modify(update) => {
                let solutions = graph.solve(&update.where_patterns());
                let mut deletes = Vec::new();
                let mut inserts = Vec::new();
                for solution in &solutions {
                    deletes.extend(update.deletes.iter().filter_map(|t| instantiate(t, solution)));
                    inserts.extend(update.inserts.iter().filter_map(|t| instantiate(t, solution)));
                }
                log::trace!(
                    "Applying {} deletes, {} inserts over {} solutions",
                    deletes.len(),
                    inserts.len(),
                    solutions.len()
                );
                for t in &deletes {
                    graph.triples.remove(t);
                }
                graph.triples.extend(inserts);
            }
        }
        Ok(())
    }
}
