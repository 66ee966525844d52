//! HTTP wire format shared by the endpoint and the remote backend.
//!
//! Terms travel as SPARQL-JSON-style objects: every value is a string plus a
//! `datatype` IRI, and the receiving side coerces it back into a typed
//! [`Value`]. Callers of either backend never see the wire form.

use crate::query::BindingRow;
use crate::store::{Update, UpdateReceipt};
use crate::term::{Iri, Triple, Value};
use agentmesh_core::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Uri,
    Literal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTerm {
    #[serde(rename = "type")]
    pub kind: WireKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
}

impl From<&Value> for WireTerm {
    fn from(value: &Value) -> Self {
        let literal = |value: String, datatype: &str| WireTerm {
            kind: WireKind::Literal,
            value,
            datatype: Some(datatype.to_string()),
        };
        match value {
            Value::Ref(iri) => WireTerm {
                kind: WireKind::Uri,
                value: iri.to_string(),
                datatype: None,
            },
            Value::Str(s) => literal(s.clone(), XSD_STRING),
            Value::Int(i) => literal(i.to_string(), XSD_INTEGER),
            Value::Float(f) => literal(f.to_string(), XSD_DOUBLE),
            Value::Bool(b) => literal(b.to_string(), XSD_BOOLEAN),
        }
    }
}

impl WireTerm {
    /// Coerce into the declared type. Unknown datatypes stay strings; a
    /// lexical form that does not fit its datatype is a protocol error.
    pub fn into_value(self) -> Result<Value, StoreError> {
        if self.kind == WireKind::Uri {
            return Ok(Value::Ref(Iri::new(self.value)));
        }
        let bad = |what: &str| StoreError::Protocol(format!("invalid {} literal {:?}", what, self.value));
        match self.datatype.as_deref() {
            Some(XSD_INTEGER) => self.value.parse().map(Value::Int).map_err(|_| bad("integer")),
            Some(XSD_DOUBLE) => self.value.parse().map(Value::Float).map_err(|_| bad("double")),
            Some(XSD_BOOLEAN) => match self.value.as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(bad("boolean")),
            },
            _ => Ok(Value::Str(self.value)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTriple {
    pub subject: String,
    pub predicate: String,
    pub object: WireTerm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl From<&Triple> for WireTriple {
    fn from(t: &Triple) -> Self {
        Self {
            subject: t.subject.to_string(),
            predicate: t.predicate.to_string(),
            object: WireTerm::from(&t.object),
            provenance: t.provenance.clone(),
        }
    }
}

impl WireTriple {
    pub fn into_triple(self) -> Result<Triple, StoreError> {
        let mut triple = Triple::new(self.subject, self.predicate, self.object.into_value()?);
        triple.provenance = self.provenance;
        Ok(triple)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub vars: Vec<String>,
    pub bindings: Vec<BTreeMap<String, WireTerm>>,
}

impl QueryResponse {
    pub fn from_rows(vars: Vec<String>, rows: &[BindingRow]) -> Self {
        let bindings = rows
            .iter()
            .map(|row| {
                row.0
                    .iter()
                    .map(|(k, v)| (k.clone(), WireTerm::from(v)))
                    .collect()
            })
            .collect();
        Self { vars, bindings }
    }

    pub fn into_rows(self) -> Result<Vec<BindingRow>, StoreError> {
        self.bindings
            .into_iter()
            .map(|binding| {
                let mut row = BindingRow::default();
                for (name, term) in binding {
                    row.bind(&name, term.into_value()?);
                }
                Ok(row)
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireUpdate {
    #[serde(default)]
    pub insert: Vec<WireTriple>,
    #[serde(default)]
    pub remove: Vec<WireTriple>,
}

impl From<&Update> for WireUpdate {
    fn from(u: &Update) -> Self {
        Self {
            insert: u.insert.iter().map(WireTriple::from).collect(),
            remove: u.remove.iter().map(WireTriple::from).collect(),
        }
    }
}

impl WireUpdate {
    pub fn into_update(self) -> Result<Update, StoreError> {
        Ok(Update {
            insert: triples(self.insert)?,
            remove: triples(self.remove)?,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(flatten)]
    pub update: WireUpdate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub inserted: Vec<WireTriple>,
    pub removed: Vec<WireTriple>,
}

impl From<&UpdateReceipt> for UpdateResponse {
    fn from(r: &UpdateReceipt) -> Self {
        Self {
            inserted: r.inserted.iter().map(WireTriple::from).collect(),
            removed: r.removed.iter().map(WireTriple::from).collect(),
        }
    }
}

impl UpdateResponse {
    pub fn into_receipt(self) -> Result<UpdateReceipt, StoreError> {
        Ok(UpdateReceipt {
            inserted: triples(self.inserted)?,
            removed: triples(self.removed)?,
        })
    }
}

/// Error body returned by the endpoint alongside a non-2xx status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

fn triples(wire: Vec<WireTriple>) -> Result<Vec<Triple>, StoreError> {
    wire.into_iter().map(WireTriple::into_triple).collect()
}
