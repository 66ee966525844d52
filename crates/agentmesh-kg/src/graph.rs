//! In-memory triple set with incremental indices and query evaluation.

use crate::index::{GraphIndex, TripleId};
use crate::query::{BindingRow, Query, Term, TriplePattern};
use crate::store::{Update, UpdateReceipt};
use crate::term::{Iri, Triple, Value, Vocab};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct Graph {
    triples: BTreeMap<TripleId, Triple>,
    ids: HashMap<Triple, TripleId>,
    next_id: TripleId,
    index: GraphIndex,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.ids.contains_key(triple)
    }

    pub fn index(&self) -> &GraphIndex {
        &self.index
    }

    /// Triples in insertion order.
    pub fn triples(&self) -> impl Iterator<Item = &Triple> {
        self.triples.values()
    }

    /// Insert a triple; returns false if an identical fact is already present.
    pub fn insert(&mut self, triple: Triple) -> bool {
        if self.ids.contains_key(&triple) {
            return false;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.index.insert(id, &triple);
        self.ids.insert(triple.clone(), id);
        self.triples.insert(id, triple);
        true
    }

    /// Remove a triple; returns the stored fact (with its provenance) if present.
    pub fn remove(&mut self, triple: &Triple) -> Option<Triple> {
        let id = self.ids.remove(triple)?;
        let stored = self.triples.remove(&id)?;
        self.index.remove(id, &stored);
        Some(stored)
    }

    /// Removals first, then insertions. The receipt lists only effective changes.
    pub fn apply(&mut self, update: &Update) -> UpdateReceipt {
        let mut receipt = UpdateReceipt::default();
        for triple in &update.remove {
            if let Some(stored) = self.remove(triple) {
                receipt.removed.push(stored);
            }
        }
        for triple in &update.insert {
            if self.insert(triple.clone()) {
                receipt.inserted.push(triple.clone());
            }
        }
        receipt
    }

    /// `class` and every class transitively declared `rdfs:subClassOf` it.
    pub fn subclass_closure(&self, class: &Iri) -> Vec<Iri> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([class.clone()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(ids) = self.index.incoming(&current) {
                for id in ids {
                    let t = &self.triples[id];
                    if Vocab::SubClassOf.matches(&t.predicate) {
                        queue.push_back(t.subject.clone());
                    }
                }
            }
            order.push(current);
        }
        order
    }

    /// Instances of `class`, including instances asserted only as a subclass.
    pub fn instances_of(&self, class: &Iri) -> Vec<Iri> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for c in self.subclass_closure(class) {
            if let Some(instances) = self.index.direct_instances(&c) {
                for subject in instances {
                    if seen.insert(subject.clone()) {
                        out.push(subject.clone());
                    }
                }
            }
        }
        out
    }

    pub fn is_instance_of(&self, subject: &Iri, class: &Iri) -> bool {
        self.subclass_closure(class).iter().any(|c| {
            self.index
                .direct_instances(c)
                .is_some_and(|set| set.contains(subject))
        })
    }

    /// Triples matching a fully-resolved pattern, using the narrowest index.
    pub fn matching(
        &self,
        subject: Option<&Iri>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
    ) -> Vec<&Triple> {
        let empty = BTreeSet::new();
        let candidates: Box<dyn Iterator<Item = &TripleId> + '_> = if let Some(s) = subject {
            Box::new(self.index.outgoing(s).unwrap_or(&empty).iter())
        } else if let Some(target) = object.and_then(|o| o.as_ref_iri()) {
            Box::new(self.index.incoming(target).unwrap_or(&empty).iter())
        } else if let Some(p) = predicate {
            Box::new(self.index.with_predicate(p).unwrap_or(&empty).iter())
        } else {
            Box::new(self.triples.keys())
        };
        candidates
            .filter_map(|id| self.triples.get(id))
            .filter(|t| subject.map_or(true, |s| &t.subject == s))
            .filter(|t| predicate.map_or(true, |p| &t.predicate == p))
            .filter(|t| object.map_or(true, |o| &t.object == o))
            .collect()
    }

    /// Evaluate a query: patterns joined left to right, then filters,
    /// projection and limit. Rows come out in triple insertion order.
    pub fn evaluate(&self, query: &Query) -> Vec<BindingRow> {
        let mut rows = vec![BindingRow::default()];
        for pattern in &query.patterns {
            let mut next = Vec::new();
            for row in &rows {
                self.extend_row(row, pattern, &mut next);
            }
            rows = next;
            if rows.is_empty() {
                break;
            }
        }

        let filtered = rows.into_iter().filter(|row| {
            query.filters.iter().all(|f| {
                row.get(&f.var)
                    .is_some_and(|value| f.op.holds(value, &f.value))
            })
        });

        let projected = filtered.map(|row| {
            if query.select.is_empty() {
                row
            } else {
                let mut out = BindingRow::default();
                for v in &query.select {
                    if let Some(value) = row.get(v) {
                        out.bind(v, value.clone());
                    }
                }
                out
            }
        });

        match query.limit {
            Some(n) => projected.take(n).collect(),
            None => projected.collect(),
        }
    }

    fn extend_row(&self, row: &BindingRow, pattern: &TriplePattern, out: &mut Vec<BindingRow>) {
        let resolve = |term: &Term| -> Option<Value> {
            match term {
                Term::Const(v) => Some(v.clone()),
                Term::Var(name) => row.get(name).cloned(),
            }
        };
        let subject = resolve(&pattern.subject);
        let predicate = resolve(&pattern.predicate);
        let object = resolve(&pattern.object);

        // a bound non-resource in subject or predicate position never matches
        let subject_iri = match &subject {
            Some(Value::Ref(iri)) => Some(iri.clone()),
            Some(_) => return,
            None => None,
        };
        let predicate_iri = match &predicate {
            Some(Value::Ref(iri)) => Some(iri.clone()),
            Some(_) => return,
            None => None,
        };

        // type membership goes through the subclass closure
        if let (Some(p), Some(Value::Ref(class))) = (&predicate_iri, &object) {
            if Vocab::Type.matches(p) {
                match &subject_iri {
                    Some(s) => {
                        if self.is_instance_of(s, class) {
                            out.push(row.clone());
                        }
                    }
                    None => {
                        for instance in self.instances_of(class) {
                            let mut extended = row.clone();
                            if let Term::Var(name) = &pattern.subject {
                                extended.bind(name, Value::Ref(instance));
                            }
                            out.push(extended);
                        }
                    }
                }
                return;
            }
        }

        for triple in self.matching(subject_iri.as_ref(), predicate_iri.as_ref(), object.as_ref()) {
            let mut extended = row.clone();
            let bound = [
                (&pattern.subject, Value::Ref(triple.subject.clone())),
                (&pattern.predicate, Value::Ref(triple.predicate.clone())),
                (&pattern.object, triple.object.clone()),
            ];
            let mut consistent = true;
            for (term, value) in bound {
                if let Term::Var(name) = term {
                    match extended.get(name) {
                        Some(existing) if *existing != value => {
                            consistent = false;
                            break;
                        }
                        Some(_) => {}
                        None => extended.bind(name, value),
                    }
                }
            }
            if consistent {
                out.push(extended);
            }
        }
    }
}
