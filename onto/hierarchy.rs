//! # Term Hierarchy
//!
//! Parses an OBO-style vocabulary into an immutable directed acyclic graph and
//! precomputes, for every term, the duplicate-free set of all of its ancestors.
//!
//! - Edges run child -> parent and come from both `is_a` and `relationship`
//!   lines. A term frequently has several parents, so the same ancestor is
//!   often reachable along many paths; closures are built once, in
//!   topological order, and never by unguarded recursion.
//! - Obsolete terms are dropped together with every edge that points at them.
//! - Structural problems (dangling parents, cycles, duplicate ids) abort the
//!   build. Specificity is derived from the closures, so a silently repaired
//!   graph would corrupt every downstream number.

use ahash::{AHashMap, AHashSet};
use log::{debug, info};
use std::collections::VecDeque;
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;

use crate::shared::files::open_text;

/// A comprehensive error type for hierarchy parsing and construction.
#[derive(Error, Debug)]
pub enum OntologyError {
    #[error("I/O error while reading the term hierarchy: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed hierarchy file at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Term '{0}' is defined more than once in the hierarchy.")]
    DuplicateTerm(String),

    #[error(
        "Term '{child}' lists '{parent}' as a parent, but no such term is defined. The hierarchy file is incomplete or truncated."
    )]
    DanglingParent { child: String, parent: String },

    #[error("Cyclic ancestry detected: term '{0}' is its own ancestor.")]
    CyclicAncestry(String),
}

/// A single vocabulary term as declared in the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub id: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub definition: Option<String>,
    /// Direct parents, in declaration order, without duplicates.
    pub parents: Vec<String>,
}

impl Term {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            namespace: None,
            definition: None,
            parents: Vec::new(),
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for parent in parents {
            self.push_parent(parent.into());
        }
        self
    }

    fn push_parent(&mut self, parent: String) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }
}

/// Accumulates terms until the hierarchy is frozen by [`HierarchyBuilder::build`].
#[derive(Debug, Default)]
pub struct HierarchyBuilder {
    terms: Vec<Term>,
    positions: AHashMap<String, usize>,
    obsolete: AHashSet<String>,
}

impl HierarchyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a live term. Parent references are resolved at build time, so
    /// terms may be added in any order.
    pub fn add(&mut self, term: Term) -> Result<(), OntologyError> {
        if self.positions.contains_key(&term.id) || self.obsolete.contains(&term.id) {
            return Err(OntologyError::DuplicateTerm(term.id));
        }
        self.positions.insert(term.id.clone(), self.terms.len());
        self.terms.push(term);
        Ok(())
    }

    /// Records an obsolete id. Edges pointing at it are discarded instead of
    /// being reported as dangling.
    pub fn add_obsolete(&mut self, id: impl Into<String>) -> Result<(), OntologyError> {
        let id = id.into();
        if self.positions.contains_key(&id) || !self.obsolete.insert(id.clone()) {
            return Err(OntologyError::DuplicateTerm(id));
        }
        Ok(())
    }

    pub fn build(self) -> Result<TermHierarchy, OntologyError> {
        let HierarchyBuilder {
            mut terms,
            positions,
            obsolete,
        } = self;
        let n = terms.len();

        let mut parents: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut dropped_edges = 0usize;
        for term in &mut terms {
            let mut resolved = Vec::with_capacity(term.parents.len());
            let mut kept = Vec::with_capacity(term.parents.len());
            for parent in term.parents.drain(..) {
                if let Some(&idx) = positions.get(&parent) {
                    resolved.push(idx);
                    kept.push(parent);
                } else if obsolete.contains(&parent) {
                    dropped_edges += 1;
                } else {
                    return Err(OntologyError::DanglingParent {
                        child: term.id.clone(),
                        parent,
                    });
                }
            }
            term.parents = kept;
            parents.push(resolved);
        }
        if dropped_edges > 0 {
            debug!("Dropped {dropped_edges} edges that referenced obsolete terms");
        }

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (child, direct) in parents.iter().enumerate() {
            for &parent in direct {
                children[parent].push(child);
            }
        }

        let order = topological_order(&parents, &children)
            .map_err(|member| OntologyError::CyclicAncestry(terms[member].id.clone()))?;

        let mut closures: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &term in &order {
            let mut closure: Vec<usize> = Vec::new();
            for &parent in &parents[term] {
                closure.push(parent);
                closure.extend_from_slice(&closures[parent]);
            }
            closure.sort_unstable();
            closure.dedup();
            closures[term] = closure;
        }

        Ok(TermHierarchy {
            terms,
            index: positions,
            parents,
            children,
            closures,
        })
    }
}

/// Kahn's algorithm over child -> parent edges, roots first. On failure,
/// returns a term that lies on a cycle.
fn topological_order(parents: &[Vec<usize>], children: &[Vec<usize>]) -> Result<Vec<usize>, usize> {
    let n = parents.len();
    let mut unresolved: Vec<usize> = parents.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..n).filter(|&t| unresolved[t] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(term) = queue.pop_front() {
        order.push(term);
        for &child in &children[term] {
            unresolved[child] -= 1;
            if unresolved[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    // Every leftover term still waits on at least one leftover parent, so
    // walking leftover parents must eventually revisit a term on the cycle.
    let start = (0..n).find(|&t| unresolved[t] > 0).unwrap_or(0);
    let mut visited = vec![false; n];
    let mut current = start;
    while !visited[current] {
        visited[current] = true;
        match parents[current].iter().find(|&&p| unresolved[p] > 0) {
            Some(&next) => current = next,
            None => break,
        }
    }
    Err(current)
}

/// An immutable, validated term hierarchy with precomputed ancestor closures.
#[derive(Debug)]
pub struct TermHierarchy {
    terms: Vec<Term>,
    index: AHashMap<String, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    /// Sorted ancestor indices per term, self excluded.
    closures: Vec<Vec<usize>>,
}

impl TermHierarchy {
    /// Parses an OBO file (plain or gzip-compressed) from disk.
    pub fn from_obo_path(path: &Path) -> Result<Self, OntologyError> {
        info!("Loading term hierarchy from '{}'", path.display());
        let hierarchy = parse_obo(open_text(path)?)?;
        info!(
            "Term hierarchy loaded: {} terms, {} roots",
            hierarchy.len(),
            hierarchy.roots().len()
        );
        Ok(hierarchy)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Term> {
        self.index.get(id).map(|&idx| &self.terms[idx])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// # Panics
    /// If `idx` is not a valid term index of this hierarchy.
    pub fn term(&self, idx: usize) -> &Term {
        &self.terms[idx]
    }

    pub fn terms(&self) -> impl Iterator<Item = &Term> {
        self.terms.iter()
    }

    /// Every ancestor of `id` reachable along any parent chain, deduplicated,
    /// excluding `id` itself. `None` if the term is unknown.
    pub fn closure(&self, id: &str) -> Option<Vec<&str>> {
        let idx = self.index_of(id)?;
        Some(
            self.closures[idx]
                .iter()
                .map(|&a| self.terms[a].id.as_str())
                .collect(),
        )
    }

    /// Sorted ancestor indices of the term at `idx`, self excluded.
    ///
    /// # Panics
    /// If `idx` is not a valid term index of this hierarchy.
    pub fn closure_of(&self, idx: usize) -> &[usize] {
        &self.closures[idx]
    }

    /// True if `ancestor` is `term` itself or one of its ancestors.
    pub fn subsumes(&self, ancestor: usize, term: usize) -> bool {
        ancestor == term || self.closures[term].binary_search(&ancestor).is_ok()
    }

    pub fn children(&self, id: &str) -> Option<Vec<&str>> {
        let idx = self.index_of(id)?;
        Some(
            self.children[idx]
                .iter()
                .map(|&c| self.terms[c].id.as_str())
                .collect(),
        )
    }

    /// Terms without parents.
    pub fn roots(&self) -> Vec<&str> {
        self.parents
            .iter()
            .enumerate()
            .filter(|(_, direct)| direct.is_empty())
            .map(|(idx, _)| self.terms[idx].id.as_str())
            .collect()
    }
}

/// Term stanza under construction.
struct PendingTerm {
    term: Term,
    obsolete: bool,
}

/// Parses the line-oriented OBO format.
///
/// Only `[Term]` stanzas are read; `[Typedef]` and any other stanza kind is
/// skipped. Within a term stanza the `id`, `name`, `namespace`, `def`,
/// `is_a`, `relationship` and `is_obsolete` tags are interpreted and all
/// other tags are ignored.
pub fn parse_obo<R: BufRead>(reader: R) -> Result<TermHierarchy, OntologyError> {
    let mut builder = HierarchyBuilder::new();
    let mut pending: Option<PendingTerm> = None;
    let mut in_term_stanza = false;

    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = line_idx + 1;
        let trimmed = line.trim();

        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            flush(&mut builder, pending.take())?;
            in_term_stanza = trimmed == "[Term]";
            continue;
        }
        if trimmed.is_empty() {
            flush(&mut builder, pending.take())?;
            in_term_stanza = false;
            continue;
        }
        if !in_term_stanza || trimmed.starts_with('!') {
            continue;
        }
        let Some((tag, value)) = trimmed.split_once(':') else {
            continue;
        };
        let tag = tag.trim();
        let value = value.trim();

        if tag == "id" {
            flush(&mut builder, pending.take())?;
            if value.is_empty() {
                return Err(OntologyError::Malformed {
                    line: line_no,
                    reason: "empty 'id' tag".to_string(),
                });
            }
            pending = Some(PendingTerm {
                term: Term::new(value),
                obsolete: false,
            });
            continue;
        }

        let known = matches!(
            tag,
            "name" | "namespace" | "def" | "is_a" | "relationship" | "is_obsolete"
        );
        if !known {
            continue;
        }
        let Some(current) = pending.as_mut() else {
            return Err(OntologyError::Malformed {
                line: line_no,
                reason: format!("'{tag}' tag appears before the stanza's 'id' tag"),
            });
        };

        match tag {
            "name" => current.term.name = Some(value.to_string()),
            "namespace" => current.term.namespace = Some(value.to_string()),
            "def" => current.term.definition = Some(unquote_definition(value)),
            "is_obsolete" => current.obsolete = value == "true",
            "is_a" | "relationship" => {
                let target = edge_target(value, tag == "relationship").ok_or_else(|| {
                    OntologyError::Malformed {
                        line: line_no,
                        reason: format!("'{tag}' tag without a target term id"),
                    }
                })?;
                current.term.push_parent(target.to_string());
            }
            _ => {}
        }
    }
    flush(&mut builder, pending.take())?;

    builder.build()
}

fn flush(builder: &mut HierarchyBuilder, pending: Option<PendingTerm>) -> Result<(), OntologyError> {
    match pending {
        Some(PendingTerm {
            term,
            obsolete: true,
        }) => builder.add_obsolete(term.id),
        Some(PendingTerm { term, .. }) => builder.add(term),
        None => Ok(()),
    }
}

/// Extracts the target id of an `is_a` (`GO:0000002 ! label`) or
/// `relationship` (`part_of GO:0000002 ! label`) value.
fn edge_target(value: &str, is_relationship: bool) -> Option<&str> {
    let body = value.split('!').next().unwrap_or("");
    let body = match body.find('{') {
        Some(brace) => &body[..brace],
        None => body,
    };
    let mut tokens = body.split_whitespace();
    if is_relationship {
        tokens.next()?;
    }
    tokens.next()
}

/// `def: "text with \"escapes\"" [refs]` -> `text with "escapes"`.
fn unquote_definition(value: &str) -> String {
    let Some(rest) = value.strip_prefix('"') else {
        return value.to_string();
    };
    let mut text = String::with_capacity(rest.len());
    let mut escaped = false;
    for ch in rest.chars() {
        match (escaped, ch) {
            (true, c) => {
                text.push(c);
                escaped = false;
            }
            (false, '\\') => escaped = true,
            (false, '"') => return text,
            (false, c) => text.push(c),
        }
    }
    text
}
