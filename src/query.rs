/// Query model for fact-graph traversal.
///
/// A [`Query`] is an ordered sequence of [`Step`]s evaluated left to right
/// from a starting fact:
///
/// - **Field**: keep the current fact only if its type matches
/// - **Successor**: move to every fact that names the current fact as a
///   predecessor under a role
/// - **Predecessor**: move to the fact(s) the current fact names under a role
/// - **Existential**: keep the current fact only if a subquery from it is
///   non-empty (`E`) or empty (`N`)
///
/// Every query has a canonical text form, produced by `Display` and parsed
/// back by `FromStr`:
///
/// ```text
/// F.type="List" S.list F.type="Task" N(S.task F.type="Completion")
/// ```
///
/// Two structurally equal step sequences always render identically, so the
/// text doubles as a stable key for logging, tests, and the network layer.
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sign of an existential condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantifier {
    /// The subquery must yield at least one fact (`E(...)`).
    Exists,
    /// The subquery must yield nothing (`N(...)`).
    NotExists,
}

impl Quantifier {
    /// The opposite quantifier.
    pub fn negate(self) -> Self {
        match self {
            Quantifier::Exists => Quantifier::NotExists,
            Quantifier::NotExists => Quantifier::Exists,
        }
    }

    /// Whether a subquery result of the given emptiness passes.
    pub fn accepts(self, has_results: bool) -> bool {
        match self {
            Quantifier::Exists => has_results,
            Quantifier::NotExists => !has_results,
        }
    }

    fn token(self) -> char {
        match self {
            Quantifier::Exists => 'E',
            Quantifier::NotExists => 'N',
        }
    }
}

/// A single traversal or filter step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    /// Keep the current fact only if its type equals the value.
    Field(String),
    /// Traverse to successors that reference the current fact under the role.
    Successor(String),
    /// Traverse to the predecessor(s) the current fact declares under the role.
    Predecessor(String),
    /// Filter on the emptiness of a nested query.
    Existential {
        quantifier: Quantifier,
        steps: Vec<Step>,
    },
}

impl Step {
    /// Create a type filter.
    pub fn field(fact_type: impl Into<String>) -> Self {
        Self::Field(fact_type.into())
    }

    /// Create a successor traversal.
    pub fn successor(role: impl Into<String>) -> Self {
        Self::Successor(role.into())
    }

    /// Create a predecessor traversal.
    pub fn predecessor(role: impl Into<String>) -> Self {
        Self::Predecessor(role.into())
    }

    /// Create an existential filter.
    pub fn existential(quantifier: Quantifier, steps: Vec<Step>) -> Self {
        Self::Existential { quantifier, steps }
    }

    /// Whether this step moves to a different fact.
    pub fn is_join(&self) -> bool {
        matches!(self, Step::Successor(_) | Step::Predecessor(_))
    }

    /// The same traversal walked in the opposite direction.
    ///
    /// Filters are their own inverse. Existentials are not reversible and
    /// are returned unchanged.
    pub fn reversed(&self) -> Step {
        match self {
            Step::Successor(role) => Step::Predecessor(role.clone()),
            Step::Predecessor(role) => Step::Successor(role.clone()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Field(fact_type) => write!(f, "F.type=\"{}\"", escape(fact_type)),
            Step::Successor(role) => write!(f, "S.{}", role),
            Step::Predecessor(role) => write!(f, "P.{}", role),
            Step::Existential { quantifier, steps } => {
                write!(f, "{}(", quantifier.token())?;
                write_steps(f, steps)?;
                write!(f, ")")
            }
        }
    }
}

fn write_steps(f: &mut fmt::Formatter<'_>, steps: &[Step]) -> fmt::Result {
    for (index, step) in steps.iter().enumerate() {
        if index > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}", step)?;
    }
    Ok(())
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// An ordered sequence of steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    steps: Vec<Step>,
}

impl Query {
    /// Create an empty query. Evaluating it yields the start fact itself.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a query from a step sequence.
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Append a step.
    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Append a step, builder style.
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Append every step of `other`.
    pub fn concat(mut self, other: &Query) -> Self {
        self.steps.extend(other.steps.iter().cloned());
        self
    }

    /// The steps in evaluation order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Consume the query, returning its steps.
    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    /// Number of top-level steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the query has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The canonical text form (same as `to_string`).
    pub fn to_descriptive_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_steps(f, &self.steps)
    }
}

impl From<Vec<Step>> for Query {
    fn from(steps: Vec<Step>) -> Self {
        Self::from_steps(steps)
    }
}

impl FromStr for Query {
    type Err = SyncError;

    fn from_str(text: &str) -> SyncResult<Self> {
        let mut cursor = Cursor { text, position: 0 };
        let steps = cursor.steps(false)?;
        Ok(Query::from_steps(steps))
    }
}

/// Parse canonical query text.
pub fn parse_descriptive(text: &str) -> SyncResult<Query> {
    text.parse()
}

struct Cursor<'a> {
    text: &'a str,
    position: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.position..]
    }

    fn error(&self, reason: impl Into<String>) -> SyncError {
        SyncError::QuerySyntax {
            position: self.position,
            reason: reason.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.position += rest.len() - rest.trim_start().len();
    }

    fn steps(&mut self, nested: bool) -> SyncResult<Vec<Step>> {
        let mut steps = Vec::new();
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                if nested {
                    return Err(self.error("unclosed condition, expected ')'"));
                }
                return Ok(steps);
            }
            if rest.starts_with(')') {
                if !nested {
                    return Err(self.error("unexpected ')'"));
                }
                self.position += 1;
                return Ok(steps);
            }
            steps.push(self.step()?);
        }
    }

    fn step(&mut self) -> SyncResult<Step> {
        let rest = self.rest();
        if let Some(body) = rest.strip_prefix("S.") {
            let role = role_prefix(body);
            self.take_role(role).map(Step::Successor)
        } else if let Some(body) = rest.strip_prefix("P.") {
            let role = role_prefix(body);
            self.take_role(role).map(Step::Predecessor)
        } else if rest.starts_with("F.") {
            self.field()
        } else if rest.starts_with("E(") || rest.starts_with("N(") {
            let quantifier = if rest.starts_with('E') {
                Quantifier::Exists
            } else {
                Quantifier::NotExists
            };
            self.position += 2;
            let steps = self.steps(true)?;
            Ok(Step::existential(quantifier, steps))
        } else {
            Err(self.error("expected S., P., F., E( or N("))
        }
    }

    fn take_role(&mut self, role: &str) -> SyncResult<String> {
        if role.is_empty() {
            return Err(self.error("missing role name"));
        }
        let role = role.to_string();
        self.position += 2 + role.len();
        Ok(role)
    }

    fn field(&mut self) -> SyncResult<Step> {
        self.position += 2;
        let Some(after) = self.rest().strip_prefix("type=\"") else {
            return Err(self.error("only type filters are supported, expected type=\""));
        };
        let mut value = String::new();
        let mut chars = after.char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.position += "type=\"".len() + offset + 1;
                    return Ok(Step::Field(value));
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                other => value.push(other),
            }
        }
        Err(self.error("unterminated type string"))
    }
}

fn role_prefix(text: &str) -> &str {
    let end = text
        .find(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == '"')
        .unwrap_or(text.len());
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks_in_list() -> Query {
        Query::new()
            .then(Step::field("List"))
            .then(Step::successor("list"))
            .then(Step::field("Task"))
    }

    #[test]
    fn test_render_simple_steps() {
        assert_eq!(tasks_in_list().to_string(), "F.type=\"List\" S.list F.type=\"Task\"");
    }

    #[test]
    fn test_render_existentials() {
        let query = tasks_in_list().then(Step::existential(
            Quantifier::NotExists,
            vec![Step::successor("task"), Step::field("Completion")],
        ));
        assert_eq!(
            query.to_descriptive_string(),
            "F.type=\"List\" S.list F.type=\"Task\" N(S.task F.type=\"Completion\")"
        );

        let positive = Query::new().then(Step::existential(Quantifier::Exists, vec![]));
        assert_eq!(positive.to_string(), "E()");
    }

    #[test]
    fn test_empty_query_renders_empty() {
        assert_eq!(Query::new().to_string(), "");
        assert!(Query::new().is_empty());
    }

    #[test]
    fn test_structural_equality_matches_rendering() {
        let a = tasks_in_list();
        let b = Query::from_steps(vec![
            Step::Field("List".into()),
            Step::Successor("list".into()),
            Step::Field("Task".into()),
        ]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_parse_round_trip_nested() {
        let text = "S.list F.type=\"Task\" N(S.task F.type=\"Completion\" N(S.completion F.type=\"Revocation\"))";
        let query: Query = text.parse().unwrap();
        assert_eq!(query.len(), 3);
        assert_eq!(query.to_string(), text);
    }

    #[test]
    fn test_parse_dotted_type_names() {
        let text = "S.company F.type=\"ImprovingU.Office\" P.company";
        assert_eq!(parse_descriptive(text).unwrap().to_string(), text);
    }

    #[test]
    fn test_parse_tolerates_extra_whitespace() {
        let query: Query = "  P.list   E( S.x )  ".parse().unwrap();
        assert_eq!(query.to_string(), "P.list E(S.x)");
    }

    #[test]
    fn test_escaped_type_round_trip() {
        let query = Query::new().then(Step::field("say \"hi\""));
        let text = query.to_string();
        assert_eq!(text, "F.type=\"say \\\"hi\\\"\"");
        assert_eq!(text.parse::<Query>().unwrap(), query);
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "X.list",
            "S.",
            "E(S.list",
            "S.list)",
            "F.name=\"x\"",
            "F.type=\"open",
        ] {
            assert!(
                matches!(bad.parse::<Query>(), Err(SyncError::QuerySyntax { .. })),
                "expected syntax error for {}",
                bad
            );
        }
    }

    #[test]
    fn test_step_reversal() {
        assert_eq!(Step::successor("a").reversed(), Step::predecessor("a"));
        assert_eq!(Step::predecessor("a").reversed(), Step::successor("a"));
        assert_eq!(Step::field("T").reversed(), Step::field("T"));
    }

    #[test]
    fn test_quantifier_negation() {
        assert_eq!(Quantifier::Exists.negate(), Quantifier::NotExists);
        assert_eq!(Quantifier::Exists.negate().negate(), Quantifier::Exists);
        assert!(Quantifier::NotExists.accepts(false));
        assert!(!Quantifier::Exists.accepts(false));
    }
}
