//! Conflict resolvers.
//!
//! When replicas disagree on a record, their answers are grouped into
//! [`Candidate`]s and passed through a [`ResolverChain`]. Each resolver either
//! names a winner, narrows the candidates for the next one, or passes.

use std::collections::BTreeSet;
use std::fmt::Debug;

use tessera_types::{NodeName, RawRecord, RecordId};

use crate::error::{ReplicationError, Result};

/// One distinct value of a record and the nodes holding it. `None` means the
/// nodes do not have the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub value: Option<RawRecord>,
    pub nodes: BTreeSet<NodeName>,
}

impl Candidate {
    /// Groups per-node values by equality, in first-seen order.
    pub fn group(replies: impl IntoIterator<Item = (NodeName, Option<RawRecord>)>) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = Vec::new();
        for (node, value) in replies {
            match candidates.iter_mut().find(|c| c.value == value) {
                Some(candidate) => {
                    candidate.nodes.insert(node);
                }
                None => candidates.push(Candidate {
                    value,
                    nodes: BTreeSet::from([node]),
                }),
            }
        }
        candidates
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub record: RecordId,
    pub owner: Option<&'a NodeName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Winner(Option<RawRecord>),
    Narrowed(Vec<Candidate>),
    Undecided,
}

pub trait ConflictResolver: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn resolve(&self, context: &ResolveContext<'_>, candidates: &[Candidate]) -> Resolution;
}

/// The value held by the most nodes wins, if no other value ties it.
#[derive(Debug, Default)]
pub struct MajorityResolver;

impl ConflictResolver for MajorityResolver {
    fn name(&self) -> &'static str {
        "majority"
    }

    fn resolve(&self, _context: &ResolveContext<'_>, candidates: &[Candidate]) -> Resolution {
        let Some(largest) = candidates.iter().map(|c| c.nodes.len()).max() else {
            return Resolution::Undecided;
        };
        let mut leaders = candidates.iter().filter(|c| c.nodes.len() == largest);
        match (leaders.next(), leaders.next()) {
            (Some(winner), None) => Resolution::Winner(winner.value.clone()),
            _ => Resolution::Undecided,
        }
    }
}

/// Merges candidates with identical content but different versions. The
/// merged candidate keeps the highest version.
#[derive(Debug, Default)]
pub struct ContentResolver;

impl ConflictResolver for ContentResolver {
    fn name(&self) -> &'static str {
        "content"
    }

    fn resolve(&self, _context: &ResolveContext<'_>, candidates: &[Candidate]) -> Resolution {
        let mut merged: Vec<Candidate> = Vec::new();
        for candidate in candidates {
            let same_content = merged.iter_mut().find(|m| match (&m.value, &candidate.value) {
                (Some(a), Some(b)) => a.content == b.content,
                (None, None) => true,
                _ => false,
            });
            match same_content {
                Some(existing) => {
                    existing.nodes.extend(candidate.nodes.iter().cloned());
                    if let (Some(kept), Some(other)) = (&existing.value, &candidate.value)
                        && other.version > kept.version
                    {
                        existing.value = candidate.value.clone();
                    }
                }
                None => merged.push(candidate.clone()),
            }
        }
        if merged.len() < candidates.len() {
            Resolution::Narrowed(merged)
        } else {
            Resolution::Undecided
        }
    }
}

/// The highest version wins, if unique. A missing record counts as version 0.
#[derive(Debug, Default)]
pub struct VersionResolver;

impl ConflictResolver for VersionResolver {
    fn name(&self) -> &'static str {
        "version"
    }

    fn resolve(&self, _context: &ResolveContext<'_>, candidates: &[Candidate]) -> Resolution {
        let version = |c: &Candidate| c.value.as_ref().map_or(0, |v| v.version.as_u32());
        let Some(highest) = candidates.iter().map(version).max() else {
            return Resolution::Undecided;
        };
        let mut leaders = candidates.iter().filter(|c| version(c) == highest);
        match (leaders.next(), leaders.next()) {
            (Some(winner), None) => Resolution::Winner(winner.value.clone()),
            _ => Resolution::Undecided,
        }
    }
}

/// The cluster owner's value wins.
#[derive(Debug, Default)]
pub struct OwnerResolver;

impl ConflictResolver for OwnerResolver {
    fn name(&self) -> &'static str {
        "owner"
    }

    fn resolve(&self, context: &ResolveContext<'_>, candidates: &[Candidate]) -> Resolution {
        context
            .owner
            .and_then(|owner| candidates.iter().find(|c| c.nodes.contains(owner)))
            .map_or(Resolution::Undecided, |c| Resolution::Winner(c.value.clone()))
    }
}

/// The chain's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub value: Option<RawRecord>,
    pub resolver: &'static str,
}

#[derive(Debug)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn ConflictResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Box<dyn ConflictResolver>>) -> Self {
        Self { resolvers }
    }

    /// Builds the chain from configured names, in order.
    pub fn from_names(names: &[String]) -> Result<Self> {
        let resolvers = names
            .iter()
            .map(|name| -> Result<Box<dyn ConflictResolver>> {
                match name.as_str() {
                    "majority" => Ok(Box::new(MajorityResolver)),
                    "content" => Ok(Box::new(ContentResolver)),
                    "version" => Ok(Box::new(VersionResolver)),
                    "owner" => Ok(Box::new(OwnerResolver)),
                    other => Err(ReplicationError::Configuration(format!(
                        "unknown conflict resolver '{other}'"
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(resolvers))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    /// Runs the chain. `None` when nothing decided; the record stays pending.
    pub fn resolve(&self, context: &ResolveContext<'_>, candidates: Vec<Candidate>) -> Option<Decision> {
        let mut current = candidates;
        if let [only] = current.as_slice() {
            return Some(Decision {
                value: only.value.clone(),
                resolver: "unanimous",
            });
        }
        for resolver in &self.resolvers {
            match resolver.resolve(context, &current) {
                Resolution::Winner(value) => {
                    return Some(Decision {
                        value,
                        resolver: resolver.name(),
                    });
                }
                Resolution::Narrowed(narrowed) => {
                    if let [only] = narrowed.as_slice() {
                        return Some(Decision {
                            value: only.value.clone(),
                            resolver: resolver.name(),
                        });
                    }
                    current = narrowed;
                }
                Resolution::Undecided => {}
            }
        }
        tracing::debug!(
            record = %context.record,
            candidates = current.len(),
            "conflict resolvers undecided"
        );
        None
    }
}
