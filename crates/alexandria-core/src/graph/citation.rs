//! Citation Subgraph
//!
//! Extracts citation candidates (URLs, DOIs) from archived content with a
//! ±120-character context window, classifies them by target domain or
//! extension, resolves them against known resources by normalized URL, and
//! scores importance with PageRank over the resolved edges. Extraction and
//! resolution are both idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kernel::Kernel;
use crate::resource::normalize_url;
use crate::storage::format_ts;

use super::pagerank::pagerank;

/// Context window radius around a citation, in bytes.
const CONTEXT_RADIUS: usize = 120;

/// Citation target classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationType {
    /// Academic reference (DOI, arXiv, scholar)
    Reference,
    /// Source code hosting
    Code,
    /// Data files or portals
    Dataset,
    /// Anything else
    General,
}

impl CitationType {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            CitationType::Reference => "reference",
            CitationType::Code => "code",
            CitationType::Dataset => "dataset",
            CitationType::General => "general",
        }
    }

    /// Parse a column value.
    pub fn parse(s: &str) -> CitationType {
        match s {
            "reference" => CitationType::Reference,
            "code" => CitationType::Code,
            "dataset" => CitationType::Dataset,
            _ => CitationType::General,
        }
    }
}

/// Classify a citation target by domain and extension.
pub fn classify_url(url: &str) -> CitationType {
    let lower = url.to_lowercase();
    let host = lower
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(&lower);

    if lower.starts_with("10.")
        || host.contains("doi.org")
        || host.contains("arxiv.org")
        || host.contains("scholar.google")
    {
        return CitationType::Reference;
    }
    if host.contains("github.com") || host.contains("gitlab.com") || host.contains("bitbucket.org")
    {
        return CitationType::Code;
    }
    let path = lower.split('?').next().unwrap_or(&lower);
    if [".csv", ".json", ".xml", ".xlsx", ".parquet"]
        .iter()
        .any(|ext| path.ends_with(ext))
        || host.contains("data.gov")
        || host.contains("kaggle.com")
        || host.contains("zenodo.org")
    {
        return CitationType::Dataset;
    }
    CitationType::General
}

/// A stored citation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// Citation id
    pub id: String,
    /// Citing resource
    pub source_resource_id: String,
    /// Target URL as written
    pub target_url: String,
    /// Canonicalized target URL
    pub normalized_url: String,
    /// Resolved internal target, when the URL matches a known resource
    pub target_resource_id: Option<String>,
    /// Target classification
    pub cite_type: CitationType,
    /// ±120 chars around the mention
    pub context: String,
    /// Sequential position in the document
    pub position: u32,
    /// PageRank importance of the target, once computed
    pub importance: Option<f64>,
}

fn citation_from_row(row: &Row<'_>) -> rusqlite::Result<Citation> {
    let cite_type: String = row.get("cite_type")?;
    Ok(Citation {
        id: row.get("id")?,
        source_resource_id: row.get("source_resource_id")?,
        target_url: row.get("target_url")?,
        normalized_url: row.get("normalized_url")?,
        target_resource_id: row.get("target_resource_id")?,
        cite_type: CitationType::parse(&cite_type),
        context: row.get("context")?,
        position: row.get::<_, i64>("position")? as u32,
        importance: row.get("importance")?,
    })
}

/// Directional view of a resource's citations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationsView {
    /// Citations made by the resource
    pub outbound: Vec<Citation>,
    /// Resolved citations pointing at the resource
    pub inbound: Vec<Citation>,
    /// Outbound count
    pub outbound_count: usize,
    /// Inbound count
    pub inbound_count: usize,
}

/// The citation subgraph service.
pub struct CitationGraph {
    kernel: Arc<Kernel>,
    url_pattern: Regex,
    doi_pattern: Regex,
}

impl CitationGraph {
    /// Create the service over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            url_pattern: Regex::new(r#"https?://[^\s<>"'\)\]]+"#)
                .expect("url pattern is valid"),
            doi_pattern: Regex::new(r#"\b10\.\d{4,9}/[^\s<>"'\)\]]+"#)
                .expect("doi pattern is valid"),
        }
    }

    /// Extract citation candidates from a resource's archive. Idempotent:
    /// prior extractions for the resource are replaced wholesale.
    pub fn extract(&self, resource_id: &str) -> Result<Vec<Citation>> {
        let archive = self
            .kernel
            .store
            .with_read(|conn| crate::resource::read_archive(conn, resource_id))?
            .map(|(content, _)| content)
            .ok_or_else(|| {
                CoreError::NotFound(format!("resource {resource_id} has no archived content"))
            })?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut citations: Vec<Citation> = Vec::new();

        let mut mentions: Vec<(usize, String)> = Vec::new();
        for m in self.url_pattern.find_iter(&archive) {
            let url = m.as_str().trim_end_matches(['.', ',', ';']).to_string();
            mentions.push((m.start(), url));
        }
        for m in self.doi_pattern.find_iter(&archive) {
            let doi = m.as_str().trim_end_matches(['.', ',', ';']);
            mentions.push((m.start(), format!("https://doi.org/{doi}")));
        }
        mentions.sort_by(|a, b| a.0.cmp(&b.0));

        for (offset, url) in mentions {
            let normalized = normalize_url(&url);
            if !seen.insert(normalized.clone()) {
                continue;
            }
            let position = citations.len() as u32;
            citations.push(Citation {
                id: Uuid::new_v4().to_string(),
                source_resource_id: resource_id.to_string(),
                target_url: url.clone(),
                normalized_url: normalized,
                target_resource_id: None,
                cite_type: classify_url(&url),
                context: context_window(&archive, offset),
                position,
                importance: None,
            });
        }

        let now = self.kernel.now();
        let stored = citations.clone();
        let resource_id_owned = resource_id.to_string();
        self.kernel.commit(move |tx, _fx| {
            tx.execute(
                "DELETE FROM citations WHERE source_resource_id = ?1",
                params![resource_id_owned],
            )?;
            for citation in &stored {
                tx.execute(
                    "INSERT INTO citations (id, source_resource_id, target_url, normalized_url,
                                            target_resource_id, cite_type, context, position,
                                            created_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8)",
                    params![
                        citation.id,
                        citation.source_resource_id,
                        citation.target_url,
                        citation.normalized_url,
                        citation.cite_type.as_str(),
                        citation.context,
                        citation.position as i64,
                        format_ts(now),
                    ],
                )?;
            }
            Ok(())
        })?;

        Ok(citations)
    }

    /// Resolve unresolved citations against known resources by normalized
    /// URL. Idempotent; returns the number of newly linked citations.
    pub fn resolve(&self) -> Result<usize> {
        self.kernel.commit(move |tx, _fx| {
            let linked = tx.execute(
                "UPDATE citations
                 SET target_resource_id = (
                     SELECT r.id FROM resources r WHERE r.normalized_url = citations.normalized_url
                 )
                 WHERE target_resource_id IS NULL
                   AND EXISTS (
                     SELECT 1 FROM resources r WHERE r.normalized_url = citations.normalized_url
                   )",
                [],
            )?;
            Ok(linked)
        })
    }

    /// PageRank over resolved citation edges; importances are stored per
    /// citation and returned per resource, normalized to [0, 1].
    pub fn compute_importance(&self) -> Result<HashMap<String, f64>> {
        // Read-consistent snapshot of the resolved edges
        let edges: Vec<(String, String)> = self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_resource_id, target_resource_id FROM citations
                 WHERE target_resource_id IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let scores = pagerank(&edges);

        let stored = scores.clone();
        self.kernel.commit(move |tx, _fx| {
            for (resource_id, score) in &stored {
                tx.execute(
                    "UPDATE citations SET importance = ?2 WHERE target_resource_id = ?1",
                    params![resource_id, score],
                )?;
            }
            Ok(())
        })?;

        Ok(scores)
    }

    /// Directional citations for a resource with counts.
    pub fn citations_for(&self, resource_id: &str) -> Result<CitationsView> {
        self.kernel.store.with_read(|conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM resources WHERE id = ?1",
                    params![resource_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(CoreError::NotFound(format!("resource {resource_id}")));
            }

            let mut outbound = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT * FROM citations WHERE source_resource_id = ?1 ORDER BY position ASC",
                )?;
                let rows = stmt.query_map(params![resource_id], citation_from_row)?;
                for row in rows {
                    outbound.push(row?);
                }
            }
            let mut inbound = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT * FROM citations WHERE target_resource_id = ?1
                     ORDER BY source_resource_id ASC, position ASC",
                )?;
                let rows = stmt.query_map(params![resource_id], citation_from_row)?;
                for row in rows {
                    inbound.push(row?);
                }
            }

            Ok(CitationsView {
                outbound_count: outbound.len(),
                inbound_count: inbound.len(),
                outbound,
                inbound,
            })
        })
    }

    /// Bounded visualization subgraph around a resource: breadth-first over
    /// resolved edges, at most `max_nodes` (≤100) nodes and 2 hops.
    pub fn subgraph(
        &self,
        center: &str,
        max_nodes: usize,
    ) -> Result<(Vec<String>, Vec<(String, String)>)> {
        const MAX_DEPTH: usize = 2;
        let max_nodes = max_nodes.clamp(1, 100);

        let edges: Vec<(String, String)> = self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_resource_id, target_resource_id FROM citations
                 WHERE target_resource_id IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut nodes: Vec<String> = vec![center.to_string()];
        let mut included: HashSet<String> = nodes.iter().cloned().collect();
        let mut frontier: Vec<String> = nodes.clone();

        for _ in 0..MAX_DEPTH {
            let mut next = Vec::new();
            for (source, target) in &edges {
                for (from, to) in [(source, target), (target, source)] {
                    if frontier.contains(from)
                        && !included.contains(to)
                        && included.len() < max_nodes
                    {
                        included.insert(to.clone());
                        nodes.push(to.clone());
                        next.push(to.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let kept_edges: Vec<(String, String)> = edges
            .into_iter()
            .filter(|(s, t)| included.contains(s) && included.contains(t))
            .collect();
        Ok((nodes, kept_edges))
    }
}

fn context_window(text: &str, offset: usize) -> String {
    let mut start = offset.saturating_sub(CONTEXT_RADIUS);
    let mut end = (offset + CONTEXT_RADIUS).min(text.len());
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[start..end].trim().to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_url() {
        assert_eq!(classify_url("https://doi.org/10.1000/xyz"), CitationType::Reference);
        assert_eq!(classify_url("https://arxiv.org/abs/1706.03762"), CitationType::Reference);
        assert_eq!(classify_url("https://github.com/rust-lang/rust"), CitationType::Code);
        assert_eq!(classify_url("https://example.com/data.csv"), CitationType::Dataset);
        assert_eq!(classify_url("https://zenodo.org/record/1"), CitationType::Dataset);
        assert_eq!(classify_url("https://example.com/blog"), CitationType::General);
    }

    #[test]
    fn test_context_window_bounds() {
        let text = format!("{}https://example.com{}", "a".repeat(300), "b".repeat(300));
        let window = context_window(&text, 300);
        assert!(window.contains("https://example.com"));
        assert!(window.len() <= 2 * CONTEXT_RADIUS + 4);
    }
}
