//! Snapshot persistence and TSV ingestion.
//!
//! Snapshots store the logical graph (declarations + triples), not the
//! derived indexes; loading replays through [`KgBuilder`] so every index is
//! rebuilt consistently. Format: an 8-byte magic/version header followed by
//! a bincode body.
//!
//! TSV ingestion covers the common "indexed dump" case:
//!
//! - labels file, one per line: `id <TAB> kind <TAB> label [<TAB> alias|alias...]`
//!   where kind is `entity` or `relation`;
//! - triples file, one per line: `subject <TAB> relation <TAB> object`.
//!   Objects that were never declared become literal nodes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::info;

use crate::backend::KgError;
use crate::{KgBuilder, KnowledgeGraph, NodeKind};

const MAGIC: &[u8; 8] = b"SPQKG\x01\x00\x00";

/// Serializable logical view of a graph.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KgSnapshot {
    pub entities: Vec<NodeDecl>,
    pub literals: Vec<String>,
    pub relations: Vec<RelDecl>,
    pub triples: Vec<(String, String, String)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeDecl {
    pub id: String,
    pub label: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelDecl {
    pub id: String,
    pub label: String,
    pub aliases: Vec<String>,
}

impl KgSnapshot {
    /// Capture the logical content of a built graph.
    pub fn capture(kg: &KnowledgeGraph) -> Self {
        let mut snap = KgSnapshot::default();
        for id in 0..kg.nodes.len() as u32 {
            let Some(external) = kg.nodes.external(id) else {
                continue;
            };
            let label = kg
                .nodes
                .label_sym(id)
                .map(|s| kg.string(s))
                .unwrap_or_default();
            match kg.nodes.kind(id) {
                Some(NodeKind::Entity) => snap.entities.push(NodeDecl {
                    id: external.0.clone(),
                    label,
                    aliases: kg
                        .nodes
                        .alias_syms(id)
                        .iter()
                        .map(|&s| kg.string(s))
                        .collect(),
                }),
                Some(NodeKind::Literal) => snap.literals.push(label),
                None => {}
            }
        }
        for id in 0..kg.rels.len() as u32 {
            let Some(external) = kg.rels.external(id) else {
                continue;
            };
            snap.relations.push(RelDecl {
                id: external.0.clone(),
                label: kg
                    .rels
                    .label_sym(id)
                    .map(|s| kg.string(s))
                    .unwrap_or_default(),
                aliases: kg
                    .rels
                    .alias_syms(id)
                    .iter()
                    .map(|&s| kg.string(s))
                    .collect(),
            });
        }
        for edge_id in 0..kg.edges.len() as u32 {
            let Some(edge) = kg.edges.get(edge_id) else {
                continue;
            };
            let (Some(s), Some(r), Some(o)) = (
                kg.nodes.external(edge.source),
                kg.rels.external(edge.rel),
                kg.nodes.external(edge.target),
            ) else {
                continue;
            };
            snap.triples.push((s.0.clone(), r.0.clone(), o.0.clone()));
        }
        snap
    }

    /// Replay the snapshot into a fresh builder.
    pub fn into_builder(self) -> KgBuilder {
        let mut b = KgBuilder::new();
        for e in &self.entities {
            let aliases: Vec<&str> = e.aliases.iter().map(String::as_str).collect();
            b.entity(e.id.as_str(), &e.label, &aliases);
        }
        for l in &self.literals {
            b.literal(l);
        }
        for r in &self.relations {
            let aliases: Vec<&str> = r.aliases.iter().map(String::as_str).collect();
            b.relation(r.id.as_str(), &r.label, &aliases);
        }
        for (s, r, o) in self.triples {
            b.triple(s.as_str(), r.as_str(), o.as_str());
        }
        b
    }
}

/// Write a graph snapshot to disk.
pub fn save(kg: &KnowledgeGraph, path: &Path) -> Result<(), KgError> {
    let snap = KgSnapshot::capture(kg);
    let body = bincode::serialize(&snap).map_err(|e| KgError::Decode {
        detail: e.to_string(),
    })?;
    let mut file = fs::File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&body)?;
    info!(path = %path.display(), entities = snap.entities.len(), triples = snap.triples.len(), "saved KG snapshot");
    Ok(())
}

/// Load a graph snapshot from disk.
pub fn load(path: &Path) -> Result<KnowledgeGraph, KgError> {
    let bytes = fs::read(path)?;
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(KgError::Decode {
            detail: "bad magic: not a KG snapshot".into(),
        });
    }
    let snap: KgSnapshot =
        bincode::deserialize(&bytes[MAGIC.len()..]).map_err(|e| KgError::Decode {
            detail: e.to_string(),
        })?;
    Ok(snap.into_builder().build())
}

/// Load a graph from TSV label + triple files.
pub fn load_tsv(labels_path: &Path, triples_path: &Path) -> Result<KnowledgeGraph, KgError> {
    let mut b = KgBuilder::new();

    let labels = fs::File::open(labels_path)?;
    for (line_no, line) in BufReader::new(labels).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            return Err(KgError::Decode {
                detail: format!("labels line {}: expected at least 3 fields", line_no + 1),
            });
        }
        let aliases: Vec<&str> = fields
            .get(3)
            .map(|a| a.split('|').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        match fields[1] {
            "entity" => {
                b.entity(fields[0], fields[2], &aliases);
            }
            "relation" => {
                b.relation(fields[0], fields[2], &aliases);
            }
            other => {
                return Err(KgError::Decode {
                    detail: format!("labels line {}: unknown kind {other:?}", line_no + 1),
                });
            }
        }
    }

    let triples = fs::File::open(triples_path)?;
    for (line_no, line) in BufReader::new(triples).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 3 {
            return Err(KgError::Decode {
                detail: format!("triples line {}: expected 3 fields", line_no + 1),
            });
        }
        b.triple(fields[0], fields[1], fields[2]);
    }

    Ok(b.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KgId, TermKind};

    fn sample_kg() -> KnowledgeGraph {
        let mut b = KgBuilder::new();
        b.entity("Q25188", "Inception", &["Inception (film)"]);
        b.entity("Q25191", "Christopher Nolan", &[]);
        b.relation("P57", "director", &["directed by"]);
        b.triple("Q25188", "P57", "Q25191");
        b.triple("Q25188", "P577", "2010");
        b.build()
    }

    #[test]
    fn snapshot_round_trip() {
        let kg = sample_kg();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movies.kg");

        save(&kg, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.node_count(), kg.node_count());
        assert_eq!(loaded.edge_count(), kg.edge_count());
        assert_eq!(
            loaded.label_of(&KgId::new("Q25191")).as_deref(),
            Some("Christopher Nolan")
        );
        assert_eq!(loaded.kind_of(&KgId::new("2010")), Some(TermKind::Literal));
        assert!(loaded.connected(&KgId::new("Q25188"), &KgId::new("P57")));
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.kg");
        fs::write(&path, b"not a snapshot").unwrap();
        assert!(matches!(load(&path), Err(KgError::Decode { .. })));
    }

    #[test]
    fn tsv_ingestion() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("labels.tsv");
        let triples = dir.path().join("triples.tsv");

        let mut f = fs::File::create(&labels).unwrap();
        writeln!(f, "Q25188\tentity\tInception\tInception (film)").unwrap();
        writeln!(f, "Q25191\tentity\tChristopher Nolan").unwrap();
        writeln!(f, "P57\trelation\tdirector\tdirected by|directed").unwrap();
        let mut f = fs::File::create(&triples).unwrap();
        writeln!(f, "Q25188\tP57\tQ25191").unwrap();
        writeln!(f, "# comment").unwrap();

        let kg = load_tsv(&labels, &triples).unwrap();
        assert_eq!(kg.node_count(), 2);
        assert_eq!(kg.edge_count(), 1);
        assert_eq!(kg.label_of(&KgId::new("P57")).as_deref(), Some("director"));
    }

    #[test]
    fn tsv_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("labels.tsv");
        let triples = dir.path().join("triples.tsv");
        fs::write(&labels, "Q1\tgizmo\tThing\n").unwrap();
        fs::write(&triples, "").unwrap();
        assert!(matches!(
            load_tsv(&labels, &triples),
            Err(KgError::Decode { .. })
        ));
    }
}
