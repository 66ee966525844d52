//! Derived lookup indices over the triple set.
//!
//! Indices are maintained incrementally on every insert and remove and are
//! never authoritative: `GraphIndex::rebuild` reconstructs them from the
//! triples alone. Empty buckets are dropped so that inserting and then
//! removing the same triples leaves the index exactly as it was.

use crate::term::{Iri, Triple, Vocab};
use std::collections::{BTreeSet, HashMap};

pub type TripleId = u64;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphIndex {
    /// predicate -> triples using it
    by_predicate: HashMap<Iri, BTreeSet<TripleId>>,
    /// class -> subjects directly asserted `rdf:type` of it
    by_type: HashMap<Iri, BTreeSet<Iri>>,
    /// subject -> triples it is the subject of
    outgoing: HashMap<Iri, BTreeSet<TripleId>>,
    /// referenced resource -> triples pointing at it
    incoming: HashMap<Iri, BTreeSet<TripleId>>,
}

fn add_to<K: std::hash::Hash + Eq, V: Ord>(map: &mut HashMap<K, BTreeSet<V>>, key: K, value: V) {
    map.entry(key).or_default().insert(value);
}

fn remove_from<K: std::hash::Hash + Eq, V: Ord>(map: &mut HashMap<K, BTreeSet<V>>, key: &K, value: &V) {
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

impl GraphIndex {
    pub fn rebuild<'a>(triples: impl IntoIterator<Item = (TripleId, &'a Triple)>) -> Self {
        let mut index = Self::default();
        for (id, triple) in triples {
            index.insert(id, triple);
        }
        index
    }

    pub fn insert(&mut self, id: TripleId, triple: &Triple) {
        add_to(&mut self.by_predicate, triple.predicate.clone(), id);
        add_to(&mut self.outgoing, triple.subject.clone(), id);
        if let Some(target) = triple.object.as_ref_iri() {
            add_to(&mut self.incoming, target.clone(), id);
            if Vocab::Type.matches(&triple.predicate) {
                add_to(&mut self.by_type, target.clone(), triple.subject.clone());
            }
        }
    }

    pub fn remove(&mut self, id: TripleId, triple: &Triple) {
        remove_from(&mut self.by_predicate, &triple.predicate, &id);
        remove_from(&mut self.outgoing, &triple.subject, &id);
        if let Some(target) = triple.object.as_ref_iri() {
            remove_from(&mut self.incoming, target, &id);
            if Vocab::Type.matches(&triple.predicate) {
                remove_from(&mut self.by_type, target, &triple.subject);
            }
        }
    }

    pub fn with_predicate(&self, predicate: &Iri) -> Option<&BTreeSet<TripleId>> {
        self.by_predicate.get(predicate)
    }

    /// Subjects asserted directly as instances of `class` (no inference).
    pub fn direct_instances(&self, class: &Iri) -> Option<&BTreeSet<Iri>> {
        self.by_type.get(class)
    }

    pub fn outgoing(&self, subject: &Iri) -> Option<&BTreeSet<TripleId>> {
        self.outgoing.get(subject)
    }

    pub fn incoming(&self, target: &Iri) -> Option<&BTreeSet<TripleId>> {
        self.incoming.get(target)
    }

    pub fn is_empty(&self) -> bool {
        self.by_predicate.is_empty()
            && self.by_type.is_empty()
            && self.outgoing.is_empty()
            && self.incoming.is_empty()
    }
}
