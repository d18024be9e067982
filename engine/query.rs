//! Query parsing and validation against the controlled entity vocabulary.

use ahash::AHashMap;
use itertools::Itertools;
use log::{info, warn};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

use crate::network::Network;
use crate::shared::files::open_text;

const SYMBOL_COLUMN: &str = "gene_symbol";
const ALIAS_COLUMN: &str = "uniprot";

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("I/O error while reading the entity vocabulary: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse the entity vocabulary: {0}")]
    Csv(#[from] csv::Error),

    #[error("The entity vocabulary has no 'gene_symbol' column.")]
    MissingSymbolColumn,

    #[error("The query is empty. Supply at least one entity identifier.")]
    EmptyQuery,

    #[error(
        "None of the queried entities can be used. Unrecognized: [{}]. Recognized but absent from the network: [{}].",
        .unrecognized.join(", "),
        .not_in_network.join(", ")
    )]
    NoRecognizedEntities {
        unrecognized: Vec<String>,
        not_in_network: Vec<String>,
    },
}

/// The set of entity symbols a query may name, with optional aliases
/// (e.g. accession numbers). Matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct EntityVocabulary {
    symbols: BTreeSet<String>,
    aliases: AHashMap<String, String>,
}

impl EntityVocabulary {
    /// Reads a CSV with a `gene_symbol` column and an optional `uniprot`
    /// alias column. Other columns are ignored.
    pub fn from_csv_path(path: &Path) -> Result<Self, QueryError> {
        info!("Loading entity vocabulary from '{}'", path.display());
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(open_text(path)?);

        let headers = reader.headers()?.clone();
        let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let symbol_idx = find(SYMBOL_COLUMN).ok_or(QueryError::MissingSymbolColumn)?;
        let alias_idx = find(ALIAS_COLUMN);

        let mut vocabulary = EntityVocabulary::default();
        for record in reader.records() {
            let record = record?;
            let Some(symbol) = record.get(symbol_idx).filter(|s| !s.is_empty()) else {
                continue;
            };
            let symbol = symbol.to_ascii_uppercase();
            if let Some(alias) = alias_idx.and_then(|idx| record.get(idx)).filter(|a| !a.is_empty()) {
                vocabulary
                    .aliases
                    .insert(alias.to_ascii_uppercase(), symbol.clone());
            }
            vocabulary.symbols.insert(symbol);
        }
        info!(
            "Entity vocabulary loaded: {} symbols, {} aliases",
            vocabulary.symbols.len(),
            vocabulary.aliases.len()
        );
        Ok(vocabulary)
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            symbols: names
                .into_iter()
                .map(|name| name.as_ref().trim().to_ascii_uppercase())
                .filter(|name| !name.is_empty())
                .collect(),
            aliases: AHashMap::new(),
        }
    }

    /// Canonical (uppercase) symbol for a symbol or alias.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        let key = token.trim().to_ascii_uppercase();
        if let Some(symbol) = self.symbols.get(&key) {
            return Some(symbol.as_str());
        }
        self.aliases.get(&key).map(String::as_str)
    }

    /// Canonical symbols in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Splits free text on whitespace, commas and semicolons, uppercases every
/// token and drops repeats, keeping first-seen order.
pub fn parse_query(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|token| !token.is_empty())
        .map(str::to_ascii_uppercase)
        .unique()
        .collect()
}

/// Outcome of checking query tokens against the vocabulary and the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedQuery {
    /// Network entity names, in query order.
    pub accepted: Vec<String>,
    /// Tokens the vocabulary does not know.
    pub unrecognized: Vec<String>,
    /// Known symbols that did not make it into the network.
    pub not_in_network: Vec<String>,
}

pub fn validate_query(
    tokens: &[String],
    vocabulary: &EntityVocabulary,
    network: &Network,
) -> Result<ValidatedQuery, QueryError> {
    if tokens.is_empty() {
        return Err(QueryError::EmptyQuery);
    }
    let mut validated = ValidatedQuery::default();
    for token in tokens {
        match vocabulary.resolve(token) {
            None => validated.unrecognized.push(token.clone()),
            Some(symbol) => match network.index_of(symbol) {
                Some(idx) => {
                    let name = &network.entities()[idx];
                    if !validated.accepted.contains(name) {
                        validated.accepted.push(name.clone());
                    }
                }
                None => validated.not_in_network.push(symbol.to_string()),
            },
        }
    }

    if !validated.unrecognized.is_empty() {
        warn!(
            "Unrecognized query entities: {}",
            validated.unrecognized.join(", ")
        );
    }
    if !validated.not_in_network.is_empty() {
        warn!(
            "Query entities without enough annotations to be in the network: {}",
            validated.not_in_network.join(", ")
        );
    }
    if validated.accepted.is_empty() {
        return Err(QueryError::NoRecognizedEntities {
            unrecognized: validated.unrecognized,
            not_in_network: validated.not_in_network,
        });
    }
    Ok(validated)
}
