/// Query inversion.
///
/// A watch runs its query once to seed results and then has to find out,
/// for every fact saved afterwards, whether that fact changed the result
/// set. Re-running the whole query per fact is too expensive, so each query
/// is inverted once at registration into a list of [`Inverse`]s.
///
/// An inverse answers three questions about a newly saved fact of a given
/// type:
///
/// - **affected**: walked from the new fact, which starting facts could see
///   a different result? The watch only reacts when its own start is among
///   them.
/// - **added**: walked from the new fact, which results appeared?
/// - **removed**: walked from the new fact, which results disappeared?
///
/// Inverses are produced at two kinds of steps:
///
/// - a **Successor** step, when the new fact is the one the step arrives at
///   and no later successor join makes it an intermediate. The rest of the
///   query, run from the new fact, yields the added results.
/// - an **Existential** step, once for every successor arrival inside its
///   subquery (at any depth). The candidate the condition guards is reached
///   by walking back out of the subquery, and the condition is re-checked
///   from there. Whether the arrival adds or removes results follows the
///   product of the quantifier signs it sits under: an addition requires
///   the condition to hold now, a removal requires it to fail now.
///
/// Reversed paths keep every condition guarding an earlier position, so the
/// affected and effect queries only pass through candidates that still
/// qualify. A new witness for a condition that already held is reported as
/// added again; the coordinator drops such repeats against the watch's
/// current results.
///
/// Predecessor steps never produce inverses: facts are immutable, so the
/// predecessors of an existing fact never change.
use crate::query::{Quantifier, Query, Step};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Incremental-update rule derived from a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inverse {
    /// Type of saved fact this rule applies to; `None` matches any type.
    pub fact_type: Option<String>,
    /// From the new fact, the starting facts whose results may change.
    pub affected: Query,
    /// From the new fact, the results that appear.
    pub added: Option<Query>,
    /// From the new fact, the results that disappear.
    pub removed: Option<Query>,
}

impl Inverse {
    /// Whether this rule applies to a fact of `fact_type`.
    pub fn applies_to(&self, fact_type: &str) -> bool {
        self.fact_type.as_deref().is_none_or(|t| t == fact_type)
    }
}

impl fmt::Display for Inverse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "affected: {}", self.affected)?;
        if let Some(added) = &self.added {
            write!(f, "; added: {}", added)?;
        }
        if let Some(removed) = &self.removed {
            write!(f, "; removed: {}", removed)?;
        }
        Ok(())
    }
}

/// A successor arrival inside an existential subquery.
struct Arrival {
    /// Type filters directly after the arriving successor step.
    filters: Vec<Step>,
    /// From the arriving fact back to the candidate guarded by the condition.
    back_to_candidate: Vec<Step>,
    /// Whether a new arrival makes the condition more true.
    positive: bool,
}

/// Derive the inverses of `query`.
///
/// The result order follows the order of the steps that produced them.
pub fn invert(query: &Query) -> Vec<Inverse> {
    let steps = query.steps();
    let mut inverses = Vec::new();

    for (i, step) in steps.iter().enumerate() {
        let back_to_start = reverse_path(&steps[..i]);
        match step {
            Step::Successor(role) => {
                let rest = &steps[i + 1..];
                if next_join_is_successor(rest) {
                    continue;
                }
                let filters = leading_filters(rest);
                let mut affected = filters.clone();
                affected.push(Step::predecessor(role.clone()));
                affected.extend(back_to_start);
                inverses.push(Inverse {
                    fact_type: first_type(&filters),
                    affected: Query::from_steps(affected),
                    added: Some(Query::from_steps(rest.to_vec())),
                    removed: None,
                });
            }
            Step::Existential {
                quantifier,
                steps: subquery,
            } => {
                let mut arrivals = Vec::new();
                collect_arrivals(
                    subquery,
                    &[],
                    *quantifier == Quantifier::Exists,
                    &mut arrivals,
                );
                let positional = positional_prefix(&steps[..i]);
                for arrival in arrivals {
                    let mut affected = arrival.back_to_candidate.clone();
                    affected.extend(back_to_start.iter().cloned());

                    // Re-check the whole condition on the candidate: it must
                    // now hold for an addition and now fail for a removal.
                    let recheck = if arrival.positive {
                        *quantifier
                    } else {
                        quantifier.negate()
                    };
                    let mut effect = arrival.back_to_candidate;
                    effect.extend(positional.iter().cloned());
                    effect.push(Step::existential(recheck, subquery.clone()));
                    effect.extend(steps[i + 1..].iter().cloned());
                    let effect = Query::from_steps(effect);

                    let (added, removed) = if arrival.positive {
                        (Some(effect), None)
                    } else {
                        (None, Some(effect))
                    };
                    inverses.push(Inverse {
                        fact_type: first_type(&arrival.filters),
                        affected: Query::from_steps(affected),
                        added,
                        removed,
                    });
                }
            }
            Step::Field(_) | Step::Predecessor(_) => {}
        }
    }

    inverses
}

/// Find every successor arrival inside `subquery`.
///
/// `tail` walks from the subquery's own start back to the guarded candidate.
fn collect_arrivals(subquery: &[Step], tail: &[Step], positive: bool, out: &mut Vec<Arrival>) {
    for (j, step) in subquery.iter().enumerate() {
        let mut back = reverse_path(&subquery[..j]);
        back.extend(tail.iter().cloned());
        match step {
            Step::Successor(role) => {
                let rest = &subquery[j + 1..];
                if next_join_is_successor(rest) {
                    continue;
                }
                let filters = leading_filters(rest);
                let mut back_to_candidate = filters.clone();
                back_to_candidate.push(Step::predecessor(role.clone()));
                back_to_candidate.extend(back);
                out.push(Arrival {
                    filters,
                    back_to_candidate,
                    positive,
                });
            }
            Step::Existential {
                quantifier,
                steps: nested,
            } => {
                let nested_positive = positive == (*quantifier == Quantifier::Exists);
                collect_arrivals(nested, &back, nested_positive, out);
            }
            Step::Field(_) | Step::Predecessor(_) => {}
        }
    }
}

/// Walk `prefix` backwards: joins flip direction.
///
/// Filters and existentials stay at the position they guard, so a fact
/// reached through a candidate that fails an earlier condition is not
/// reported as affected.
fn reverse_path(prefix: &[Step]) -> Vec<Step> {
    prefix.iter().rev().map(Step::reversed).collect()
}

fn next_join_is_successor(rest: &[Step]) -> bool {
    matches!(rest.iter().find(|step| step.is_join()), Some(Step::Successor(_)))
}

fn leading_filters(rest: &[Step]) -> Vec<Step> {
    rest.iter()
        .take_while(|step| matches!(step, Step::Field(_)))
        .cloned()
        .collect()
}

/// Filters and conditions that apply at the position reached by `prefix`.
fn positional_prefix(prefix: &[Step]) -> Vec<Step> {
    let start = prefix
        .iter()
        .rposition(Step::is_join)
        .map_or(0, |join| join + 1);
    prefix[start..].to_vec()
}

fn first_type(filters: &[Step]) -> Option<String> {
    filters.iter().find_map(|step| match step {
        Step::Field(fact_type) => Some(fact_type.clone()),
        _ => None,
    })
}
