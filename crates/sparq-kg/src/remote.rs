//! SPARQL-protocol backend (feature `remote`).
//!
//! Implements [`KgBackend`] against a SPARQL HTTP endpoint (Wikidata-style):
//! queries are rendered to real SPARQL with configurable entity/relation
//! prefixes, sent via GET, and results parsed from the SPARQL 1.1 JSON
//! results format. Label search uses a `rdfs:label` CONTAINS filter, which
//! is adequate for endpoints with a label service but far slower than the
//! in-memory token index; the in-memory backend remains the default.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::backend::{KgBackend, KgError, LabelHit};
use crate::exec::{AnswerEntry, ResultSet};
use crate::query::{GraphQuery, QueryForm, Term};
use crate::{KgId, TermKind};

/// Default prefix declarations, matching the Wikidata endpoint.
fn default_prefixes() -> Vec<(String, String)> {
    vec![
        ("wd".into(), "http://www.wikidata.org/entity/".into()),
        ("wdt".into(), "http://www.wikidata.org/prop/direct/".into()),
        ("rdfs".into(), "http://www.w3.org/2000/01/rdf-schema#".into()),
    ]
}

pub struct SparqlEndpoint {
    client: reqwest::Client,
    endpoint_url: String,
    entity_prefix: String,
    relation_prefix: String,
    prefixes: Vec<(String, String)>,
}

impl SparqlEndpoint {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            endpoint_url: endpoint_url.into(),
            entity_prefix: "wd".into(),
            relation_prefix: "wdt".into(),
            prefixes: default_prefixes(),
        }
    }

    pub fn with_prefixes(
        mut self,
        entity_prefix: impl Into<String>,
        relation_prefix: impl Into<String>,
        prefixes: Vec<(String, String)>,
    ) -> Self {
        self.entity_prefix = entity_prefix.into();
        self.relation_prefix = relation_prefix.into();
        self.prefixes = prefixes;
        self
    }

    fn prefix_header(&self) -> String {
        self.prefixes
            .iter()
            .map(|(p, uri)| format!("PREFIX {p}: <{uri}>\n"))
            .collect()
    }

    fn render_term(&self, term: &Term) -> String {
        match term {
            Term::Var(v) => format!("?{v}"),
            Term::Id(id) => format!("{}:{}", self.entity_prefix, id),
            Term::Literal(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        }
    }

    /// Render to endpoint SPARQL (prefixed, not the local `kg:` form).
    pub fn render(&self, query: &GraphQuery) -> String {
        let mut out = self.prefix_header();
        match &query.form {
            QueryForm::Select { vars } => {
                out.push_str("SELECT");
                for v in vars {
                    out.push_str(&format!(" ?{v}"));
                }
                out.push_str(" WHERE {\n");
            }
            QueryForm::Ask => out.push_str("ASK {\n"),
        }
        for p in &query.patterns {
            out.push_str(&format!(
                "  {} {}:{} {} .\n",
                self.render_term(&p.subject),
                self.relation_prefix,
                p.relation,
                self.render_term(&p.object)
            ));
        }
        out.push('}');
        if matches!(query.form, QueryForm::Select { .. }) {
            out.push_str(&format!(" LIMIT {}", query.limit));
        }
        out
    }

    async fn run(&self, sparql: &str) -> Result<SparqlResults, KgError> {
        debug!(endpoint = %self.endpoint_url, "dispatching SPARQL query");
        let response = self
            .client
            .get(&self.endpoint_url)
            .query(&[("query", sparql), ("format", "json")])
            .header("Accept", "application/sparql-results+json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    KgError::Timeout
                } else {
                    KgError::Unavailable {
                        detail: e.to_string(),
                    }
                }
            })?;
        if !response.status().is_success() {
            return Err(KgError::Unavailable {
                detail: format!("endpoint returned {}", response.status()),
            });
        }
        response
            .json::<SparqlResults>()
            .await
            .map_err(|e| KgError::Decode {
                detail: e.to_string(),
            })
    }
}

// ============================================================================
// SPARQL 1.1 JSON results format
// ============================================================================

#[derive(Debug, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    results: Option<SparqlBindings>,
    #[serde(default)]
    boolean: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SparqlBindings {
    bindings: Vec<HashMap<String, SparqlValue>>,
}

#[derive(Debug, Deserialize)]
struct SparqlValue {
    #[serde(rename = "type")]
    value_type: String,
    value: String,
}

/// Local name of a URI: the segment after the last `/` or `#`.
fn local_name(uri: &str) -> &str {
    uri.rsplit(['/', '#']).next().unwrap_or(uri)
}

fn entry_from_value(value: &SparqlValue, label: Option<&str>) -> AnswerEntry {
    match value.value_type.as_str() {
        "uri" => {
            let id = local_name(&value.value);
            AnswerEntry {
                kg_id: KgId::new(id),
                label: label.unwrap_or(id).to_string(),
                kind: TermKind::Entity,
            }
        }
        _ => AnswerEntry {
            kg_id: KgId::new(value.value.as_str()),
            label: value.value.clone(),
            kind: TermKind::Literal,
        },
    }
}

#[async_trait]
impl KgBackend for SparqlEndpoint {
    async fn search(
        &self,
        text: &str,
        kind: TermKind,
        limit: usize,
    ) -> Result<Vec<LabelHit>, KgError> {
        let escaped = text.replace('"', "\\\"").to_lowercase();
        let sparql = format!(
            "{}SELECT ?s ?label WHERE {{ ?s rdfs:label ?label . \
             FILTER(CONTAINS(LCASE(STR(?label)), \"{escaped}\")) }} LIMIT {limit}",
            self.prefix_header()
        );
        let results = self.run(&sparql).await?;
        let mut hits = Vec::new();
        for binding in results.results.map(|r| r.bindings).unwrap_or_default() {
            let (Some(s), Some(label)) = (binding.get("s"), binding.get("label")) else {
                continue;
            };
            let id = local_name(&s.value);
            // Wikidata convention: P-ids are properties, everything else an
            // entity. The endpoint has no literal label search.
            let hit_kind = if id.starts_with('P') {
                TermKind::Relation
            } else {
                TermKind::Entity
            };
            if hit_kind != kind {
                continue;
            }
            hits.push(LabelHit {
                id: KgId::new(id),
                label: label.value.clone(),
                // The label service returns one surface form per row.
                aliases: vec![],
                kind: hit_kind,
                // Remote endpoints expose no cheap degree statistic.
                prior: 0.0,
            });
        }
        Ok(hits)
    }

    async fn execute(&self, query: &GraphQuery) -> Result<ResultSet, KgError> {
        let sparql = self.render(query);
        let results = self.run(&sparql).await?;

        if let Some(boolean) = results.boolean {
            return Ok(ResultSet::boolean(boolean));
        }
        let QueryForm::Select { vars } = &query.form else {
            return Err(KgError::Decode {
                detail: "ASK query returned no boolean".into(),
            });
        };
        let Some(primary) = vars.first() else {
            return Err(KgError::MalformedQuery {
                query: query.to_string(),
                detail: "select with no projection variables".into(),
            });
        };
        let mut entries = Vec::new();
        for binding in results.results.map(|r| r.bindings).unwrap_or_default() {
            if let Some(value) = binding.get(primary.as_str()) {
                let entry = entry_from_value(value, None);
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
        Ok(ResultSet { entries })
    }

    async fn label(&self, id: &KgId) -> Result<Option<String>, KgError> {
        let sparql = format!(
            "{}SELECT ?label WHERE {{ {}:{} rdfs:label ?label }} LIMIT 1",
            self.prefix_header(),
            self.entity_prefix,
            id
        );
        let results = self.run(&sparql).await?;
        Ok(results
            .results
            .and_then(|r| r.bindings.into_iter().next())
            .and_then(|mut b| b.remove("label"))
            .map(|v| v.value))
    }

    async fn connected(&self, node: &KgId, relation: &KgId) -> Result<bool, KgError> {
        let sparql = format!(
            "{}ASK {{ {{ {ep}:{node} {rp}:{relation} ?o }} UNION {{ ?s {rp}:{relation} {ep}:{node} }} }}",
            self.prefix_header(),
            ep = self.entity_prefix,
            rp = self.relation_prefix,
        );
        let results = self.run(&sparql).await?;
        Ok(results.boolean.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::TriplePattern;

    #[test]
    fn renders_wikidata_sparql() {
        let ep = SparqlEndpoint::new("https://query.wikidata.org/sparql");
        let q = GraphQuery::select(
            vec!["x".into()],
            vec![TriplePattern {
                subject: Term::Id(KgId::new("Q25188")),
                relation: KgId::new("P57"),
                object: Term::Var("x".into()),
            }],
        );
        let sparql = ep.render(&q);
        assert!(sparql.contains("PREFIX wd: <http://www.wikidata.org/entity/>"));
        assert!(sparql.contains("wd:Q25188 wdt:P57 ?x ."));
        assert!(sparql.ends_with("LIMIT 50"));
    }

    #[test]
    fn local_name_strips_uri() {
        assert_eq!(local_name("http://www.wikidata.org/entity/Q25191"), "Q25191");
        assert_eq!(local_name("http://example.org/ns#thing"), "thing");
        assert_eq!(local_name("bare"), "bare");
    }

    #[test]
    fn parses_results_json() {
        let json = r#"{
            "head": {"vars": ["x"]},
            "results": {"bindings": [
                {"x": {"type": "uri", "value": "http://www.wikidata.org/entity/Q25191"}}
            ]}
        }"#;
        let parsed: SparqlResults = serde_json::from_str(json).unwrap();
        let bindings = parsed.results.unwrap().bindings;
        assert_eq!(bindings.len(), 1);
        let entry = entry_from_value(&bindings[0]["x"], None);
        assert_eq!(entry.kg_id, KgId::new("Q25191"));
        assert_eq!(entry.kind, TermKind::Entity);
    }

    #[test]
    fn parses_ask_json() {
        let parsed: SparqlResults = serde_json::from_str(r#"{"head": {}, "boolean": true}"#).unwrap();
        assert_eq!(parsed.boolean, Some(true));
    }
}
