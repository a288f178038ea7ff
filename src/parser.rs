/// Template parser: compiles declarative shapes into queries.
///
/// Applications describe what a watch should match with plain Rust values
/// instead of hand-writing steps. A template function receives a
/// [`Placeholder`] standing for "the fact we start from" and returns a
/// [`Specification`] built from it:
///
/// ```ignore
/// use factsync::parser::{matching, not_exists, Placeholder, Preposition, Template};
///
/// fn uncompleted_tasks_in_list(l: Placeholder) -> Specification {
///     matching(Template::of_type("Task").with("list", l.has_type("List")))
///         .such_that(|t| not_exists(Template::of_type("Completion").with("task", t)))
/// }
///
/// let preposition = Preposition::for_template(uncompleted_tasks_in_list)?;
/// assert_eq!(
///     preposition.query().to_string(),
///     r#"F.type="List" S.list F.type="Task" N(S.task F.type="Completion")"#
/// );
/// ```
///
/// The shape compiles as follows:
///
/// - navigating a placeholder with [`Placeholder::get`] produces a
///   **Predecessor** step per role, outer to inner
/// - a [`Template`] whose role points back at the placeholder produces a
///   **Successor** step for that role followed by a **Field** step for the
///   template's type; templates nest recursively
/// - a type asserted with [`Placeholder::has_type`] produces a **Field** step
///   at that position
/// - conditions attached with `such_that` become **Existential** steps, in
///   the order they were attached
///
/// Shapes that cannot be resolved into such a chain fail with
/// [`SyncError::Shape`] when the preposition is built, never later.
use crate::error::{SyncError, SyncResult};
use crate::query::{Quantifier, Query, Step};
use std::ops::Not;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct Hop {
    role: String,
    fact_type: Option<String>,
}

/// Symbolic stand-in for the fact being matched.
///
/// A placeholder records the predecessor roles navigated from it and the
/// types asserted along the way. Each placeholder belongs to the template or
/// condition function it was handed to; using it inside a different one is a
/// shape error.
#[derive(Debug, Clone)]
pub struct Placeholder {
    scope: u64,
    root_type: Option<String>,
    hops: Vec<Hop>,
}

impl Placeholder {
    fn fresh() -> Self {
        Self {
            scope: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            root_type: None,
            hops: Vec::new(),
        }
    }

    /// Assert the type of the fact at the current position.
    ///
    /// A later assertion at the same position replaces an earlier one.
    pub fn has_type(mut self, fact_type: impl Into<String>) -> Self {
        let fact_type = Some(fact_type.into());
        match self.hops.last_mut() {
            Some(hop) => hop.fact_type = fact_type,
            None => self.root_type = fact_type,
        }
        self
    }

    /// Navigate to the predecessor declared under `role`.
    pub fn get(mut self, role: impl Into<String>) -> Self {
        self.hops.push(Hop {
            role: role.into(),
            fact_type: None,
        });
        self
    }

    /// The type asserted at the current position, if any.
    pub fn fact_type(&self) -> Option<&str> {
        match self.hops.last() {
            Some(hop) => hop.fact_type.as_deref(),
            None => self.root_type.as_deref(),
        }
    }

    fn path_steps(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        if let Some(fact_type) = &self.root_type {
            steps.push(Step::field(fact_type.clone()));
        }
        for hop in &self.hops {
            if hop.role.is_empty() {
                continue;
            }
            steps.push(Step::predecessor(hop.role.clone()));
            if let Some(fact_type) = &hop.fact_type {
                steps.push(Step::field(fact_type.clone()));
            }
        }
        steps
    }

    fn check(&self, scope: u64) -> SyncResult<()> {
        if self.scope != scope {
            return Err(SyncError::shape(
                "placeholder used outside the template or condition it was given to",
            ));
        }
        if self.hops.iter().any(|hop| hop.role.is_empty()) {
            return Err(SyncError::shape("predecessor role names must not be empty"));
        }
        Ok(())
    }
}

/// An object-literal shape: a fact type plus the role that leads back to
/// the placeholder.
#[derive(Debug, Clone)]
pub struct Template {
    fact_type: String,
    roles: Vec<(String, Shape)>,
}

impl Template {
    /// Start a template for facts of `fact_type`.
    pub fn of_type(fact_type: impl Into<String>) -> Self {
        Self {
            fact_type: fact_type.into(),
            roles: Vec::new(),
        }
    }

    /// Declare a predecessor role and the shape it must match.
    pub fn with(mut self, role: impl Into<String>, value: impl Into<Shape>) -> Self {
        self.roles.push((role.into(), value.into()));
        self
    }
}

/// Anything that can appear in a template position.
#[derive(Debug, Clone)]
pub enum Shape {
    /// The placeholder, possibly navigated to one of its predecessors.
    Placeholder(Placeholder),
    /// A nested object literal.
    Template(Template),
    /// An array of predecessors; exactly one element is supported.
    List(Vec<Shape>),
}

impl From<Placeholder> for Shape {
    fn from(placeholder: Placeholder) -> Self {
        Shape::Placeholder(placeholder)
    }
}

impl From<Template> for Shape {
    fn from(template: Template) -> Self {
        Shape::Template(template)
    }
}

impl<T: Into<Shape>> From<Vec<T>> for Shape {
    fn from(items: Vec<T>) -> Self {
        Shape::List(items.into_iter().map(Into::into).collect())
    }
}

impl Shape {
    /// The type of fact this shape matches, when known.
    fn result_type(&self) -> Option<String> {
        match self {
            Shape::Placeholder(placeholder) => placeholder.fact_type().map(str::to_string),
            Shape::Template(template) => Some(template.fact_type.clone()),
            Shape::List(items) => items.first().and_then(Shape::result_type),
        }
    }

    fn compile(&self, scope: u64) -> SyncResult<Vec<Step>> {
        match self {
            Shape::Placeholder(placeholder) => {
                placeholder.check(scope)?;
                Ok(placeholder.path_steps())
            }
            Shape::Template(template) => {
                if template.fact_type.is_empty() {
                    return Err(SyncError::shape("template type must not be empty"));
                }
                let (role, value) = match template.roles.as_slice() {
                    [single] => single,
                    [] => {
                        return Err(SyncError::shape(format!(
                            "template of type '{}' does not reference the starting fact",
                            template.fact_type
                        )));
                    }
                    many => {
                        let names: Vec<&str> = many.iter().map(|(r, _)| r.as_str()).collect();
                        return Err(SyncError::shape(format!(
                            "template of type '{}' must reach the starting fact through one role, found {}",
                            template.fact_type,
                            names.join(", ")
                        )));
                    }
                };
                if role.is_empty() {
                    return Err(SyncError::shape("successor role names must not be empty"));
                }
                let mut steps = value.compile(scope)?;
                steps.push(Step::successor(role.clone()));
                steps.push(Step::field(template.fact_type.clone()));
                Ok(steps)
            }
            Shape::List(items) => match items.as_slice() {
                [single] => single.compile(scope),
                _ => Err(SyncError::shape(format!(
                    "predecessor arrays must hold exactly one element, found {}",
                    items.len()
                ))),
            },
        }
    }
}

/// Existential steps compiled so far, plus the first error seen.
#[derive(Debug, Default)]
struct Conditions {
    steps: Vec<Step>,
    error: Option<SyncError>,
}

impl Conditions {
    fn attach<F>(&mut self, condition: F)
    where
        F: FnOnce(Placeholder) -> Condition,
    {
        let placeholder = Placeholder::fresh();
        let scope = placeholder.scope;
        match condition(placeholder).compile(scope) {
            Ok(step) => self.steps.push(step),
            Err(error) => {
                self.error.get_or_insert(error);
            }
        }
    }
}

/// A shape to match plus the conditions attached to it.
#[derive(Debug)]
pub struct Specification {
    shape: Shape,
    conditions: Conditions,
}

impl Specification {
    /// Require `condition` to hold for every matched fact.
    ///
    /// The condition function receives a placeholder for the matched fact.
    pub fn such_that<F>(mut self, condition: F) -> Self
    where
        F: FnOnce(Placeholder) -> Condition,
    {
        self.conditions.attach(condition);
        self
    }

    fn compile(self, scope: u64) -> SyncResult<Vec<Step>> {
        if let Some(error) = self.conditions.error {
            return Err(error);
        }
        let mut steps = self.shape.compile(scope)?;
        steps.extend(self.conditions.steps);
        Ok(steps)
    }
}

/// Match facts of the given shape.
pub fn matching(shape: impl Into<Shape>) -> Specification {
    Specification {
        shape: shape.into(),
        conditions: Conditions::default(),
    }
}

/// An existential condition on a matched fact.
#[derive(Debug)]
pub struct Condition {
    quantifier: Quantifier,
    specification: Specification,
}

impl Condition {
    /// Whether this condition requires results (`true`) or their absence.
    pub fn is_positive(&self) -> bool {
        self.quantifier == Quantifier::Exists
    }

    /// Attach a nested condition to the facts this condition looks for.
    pub fn such_that<F>(mut self, condition: F) -> Self
    where
        F: FnOnce(Placeholder) -> Condition,
    {
        self.specification = self.specification.such_that(condition);
        self
    }

    fn compile(self, scope: u64) -> SyncResult<Step> {
        let steps = self.specification.compile(scope)?;
        Ok(Step::existential(self.quantifier, steps))
    }
}

impl Not for Condition {
    type Output = Condition;

    fn not(mut self) -> Condition {
        self.quantifier = self.quantifier.negate();
        self
    }
}

/// Condition that holds when at least one fact matches `shape`.
pub fn exists(shape: impl Into<Shape>) -> Condition {
    Condition {
        quantifier: Quantifier::Exists,
        specification: matching(shape),
    }
}

/// Condition that holds when no fact matches `shape`.
pub fn not_exists(shape: impl Into<Shape>) -> Condition {
    Condition {
        quantifier: Quantifier::NotExists,
        specification: matching(shape),
    }
}

/// Flip the sign of a condition function without reparsing it.
pub fn not<F>(condition: F) -> impl FnOnce(Placeholder) -> Condition
where
    F: FnOnce(Placeholder) -> Condition,
{
    move |placeholder| !condition(placeholder)
}

/// A compiled template, ready to be watched or queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preposition {
    query: Query,
    result_type: Option<String>,
}

impl Preposition {
    /// Compile a template function.
    pub fn for_template<F>(template: F) -> SyncResult<Self>
    where
        F: FnOnce(Placeholder) -> Specification,
    {
        let (steps, result_type) = compile_template(template)?;
        Ok(Self {
            query: Query::from_steps(steps),
            result_type,
        })
    }

    /// Continue from the facts this preposition matches.
    pub fn then<F>(self, template: F) -> SyncResult<Self>
    where
        F: FnOnce(Placeholder) -> Specification,
    {
        let (steps, result_type) = compile_template(template)?;
        let mut all = self.query.into_steps();
        all.extend(steps);
        Ok(Self {
            query: Query::from_steps(all),
            result_type,
        })
    }

    /// Wrap an already-built query.
    pub fn from_query(query: Query) -> Self {
        let result_type = query.steps().iter().rev().find_map(|step| match step {
            Step::Field(fact_type) => Some(fact_type.clone()),
            _ => None,
        });
        Self { query, result_type }
    }

    /// The compiled query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Consume the preposition, returning its query.
    pub fn into_query(self) -> Query {
        self.query
    }

    /// The type of the matched facts, when the template declares one.
    pub fn result_type(&self) -> Option<&str> {
        self.result_type.as_deref()
    }
}

fn compile_template<F>(template: F) -> SyncResult<(Vec<Step>, Option<String>)>
where
    F: FnOnce(Placeholder) -> Specification,
{
    let placeholder = Placeholder::fresh();
    let scope = placeholder.scope;
    let specification = template(placeholder);
    let result_type = specification.shape.result_type();
    let steps = specification.compile(scope)?;
    Ok((steps, result_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render<F>(template: F) -> String
    where
        F: FnOnce(Placeholder) -> Specification,
    {
        Preposition::for_template(template).unwrap().query().to_string()
    }

    fn tasks_in_list(l: Placeholder) -> Specification {
        matching(Template::of_type("Task").with("list", l.has_type("List")))
    }

    fn completions_in_list(l: Placeholder) -> Specification {
        matching(
            Template::of_type("Completion")
                .with("task", Template::of_type("Task").with("list", l.has_type("List"))),
        )
    }

    fn list_of_task(t: Placeholder) -> Specification {
        matching(t.has_type("Task").get("list"))
    }

    fn list_of_completion(c: Placeholder) -> Specification {
        matching(c.has_type("Completion").get("task").has_type("Task").get("list"))
    }

    fn task_is_completed(t: Placeholder) -> Condition {
        exists(Template::of_type("Completion").with("task", t))
    }

    fn task_is_not_completed(t: Placeholder) -> Condition {
        not_exists(Template::of_type("Completion").with("task", t))
    }

    fn uncompleted_tasks_in_list(l: Placeholder) -> Specification {
        tasks_in_list(l).such_that(task_is_not_completed)
    }

    fn completed_tasks_in_list(l: Placeholder) -> Specification {
        tasks_in_list(l).such_that(task_is_completed)
    }

    fn completion_is_not_revoked(c: Placeholder) -> Condition {
        not_exists(Template::of_type("Revocation").with("completion", c))
    }

    fn task_is_still_completed(t: Placeholder) -> Condition {
        not_exists(Template::of_type("Completion").with("task", t)).such_that(completion_is_not_revoked)
    }

    fn still_completed_tasks_in_list(l: Placeholder) -> Specification {
        matching(Template::of_type("Task").with("list", l)).such_that(task_is_still_completed)
    }

    fn con1(a: Placeholder) -> Condition {
        exists(Template::of_type("B").with("y", a))
    }

    fn con2(b: Placeholder) -> Condition {
        exists(Template::of_type("C").with("z", b))
    }

    fn a_of(s: Placeholder) -> Specification {
        matching(Template::of_type("A").with("x", s))
    }

    #[test]
    fn test_successor_query() {
        assert_eq!(render(tasks_in_list), r#"F.type="List" S.list F.type="Task""#);
    }

    #[test]
    fn test_two_successors() {
        assert_eq!(
            render(completions_in_list),
            r#"F.type="List" S.list F.type="Task" S.task F.type="Completion""#
        );
    }

    #[test]
    fn test_predecessor() {
        assert_eq!(render(list_of_task), r#"F.type="Task" P.list"#);
    }

    #[test]
    fn test_two_predecessors() {
        assert_eq!(
            render(list_of_completion),
            r#"F.type="Completion" P.task F.type="Task" P.list"#
        );
    }

    #[test]
    fn test_three_level_predecessors() {
        let text = render(|p| matching(p.get("grandchild").get("child").get("parent")));
        assert_eq!(text, "P.grandchild P.child P.parent");
    }

    #[test]
    fn test_negative_existential() {
        assert_eq!(
            render(uncompleted_tasks_in_list),
            r#"F.type="List" S.list F.type="Task" N(S.task F.type="Completion")"#
        );
    }

    #[test]
    fn test_positive_existential() {
        assert_eq!(
            render(completed_tasks_in_list),
            r#"F.type="List" S.list F.type="Task" E(S.task F.type="Completion")"#
        );
    }

    #[test]
    fn test_negation_outside_condition_function() {
        let text = render(|l| tasks_in_list(l).such_that(not(task_is_completed)));
        assert_eq!(text, render(uncompleted_tasks_in_list));
    }

    #[test]
    fn test_double_negation_collapses() {
        let text = render(|l| tasks_in_list(l).such_that(not(not(task_is_completed))));
        assert_eq!(text, render(completed_tasks_in_list));

        let via_operator = render(|l| tasks_in_list(l).such_that(|t| !!task_is_completed(t)));
        assert_eq!(via_operator, text);

        let flipped = render(|l| tasks_in_list(l).such_that(not(task_is_not_completed)));
        assert_eq!(flipped, render(completed_tasks_in_list));
    }

    #[test]
    fn test_chain_to_find_siblings() {
        let query = Preposition::for_template(list_of_task)
            .unwrap()
            .then(uncompleted_tasks_in_list)
            .unwrap();
        assert_eq!(
            query.query().to_string(),
            r#"F.type="Task" P.list F.type="List" S.list F.type="Task" N(S.task F.type="Completion")"#
        );
        assert_eq!(query.result_type(), Some("Task"));
    }

    #[test]
    fn test_array_with_one_predecessor() {
        let text = render(|l| {
            matching(Template::of_type("Task").with("list", vec![l.has_type("List")]))
                .such_that(task_is_completed)
        });
        assert_eq!(text, render(completed_tasks_in_list));
    }

    #[test]
    fn test_nested_conditions() {
        assert_eq!(
            render(still_completed_tasks_in_list),
            r#"S.list F.type="Task" N(S.task F.type="Completion" N(S.completion F.type="Revocation"))"#
        );
    }

    #[test]
    fn test_conjunctions_preserve_order() {
        assert_eq!(
            render(|s| a_of(s).such_that(con1).such_that(con2)),
            r#"S.x F.type="A" E(S.y F.type="B") E(S.z F.type="C")"#
        );
        assert_eq!(
            render(|s| a_of(s).such_that(con1).such_that(not(con2))),
            r#"S.x F.type="A" E(S.y F.type="B") N(S.z F.type="C")"#
        );
        assert_eq!(
            render(|s| a_of(s).such_that(not(con1)).such_that(not(con2))),
            r#"S.x F.type="A" N(S.y F.type="B") N(S.z F.type="C")"#
        );
        assert_eq!(
            render(|s| a_of(s).such_that(not(con1))),
            r#"S.x F.type="A" N(S.y F.type="B")"#
        );
    }

    #[test]
    fn test_nested_successors() {
        let text = render(|s| {
            matching(
                Template::of_type("Child")
                    .with("parent", Template::of_type("Parent").with("grandparent", s)),
            )
        });
        assert_eq!(text, r#"S.grandparent F.type="Parent" S.parent F.type="Child""#);
    }

    #[test]
    fn test_consecutive_existentials_with_arrays() {
        let text = render(|c| {
            matching(
                Template::of_type("ImprovingU.Abstract").with(
                    "idea",
                    Template::of_type("ImprovingU.Idea").with(
                        "semester",
                        Template::of_type("ImprovingU.Semester").with(
                            "office",
                            Template::of_type("ImprovingU.Office").with("company", c),
                        ),
                    ),
                ),
            )
            .such_that(|next| not_exists(Template::of_type("ImprovingU.Abstract").with("prior", vec![next])))
            .such_that(|a| {
                not_exists(Template::of_type("ImprovingU.Abstract.Migration").with("oldAbstract", a))
            })
        });
        assert_eq!(
            text,
            concat!(
                r#"S.company F.type="ImprovingU.Office" "#,
                r#"S.office F.type="ImprovingU.Semester" "#,
                r#"S.semester F.type="ImprovingU.Idea" "#,
                r#"S.idea F.type="ImprovingU.Abstract" "#,
                r#"N(S.prior F.type="ImprovingU.Abstract") "#,
                r#"N(S.oldAbstract F.type="ImprovingU.Abstract.Migration")"#
            )
        );
    }

    #[test]
    fn test_template_without_role_fails() {
        let result = Preposition::for_template(|_| matching(Template::of_type("Task")));
        assert!(matches!(result, Err(SyncError::Shape { .. })));
    }

    #[test]
    fn test_template_with_two_roles_fails() {
        let result = Preposition::for_template(|l| {
            matching(Template::of_type("Task").with("list", l.clone()).with("owner", l))
        });
        assert!(matches!(result, Err(SyncError::Shape { .. })));
    }

    #[test]
    fn test_empty_and_oversized_arrays_fail() {
        let empty = Preposition::for_template(|_| {
            matching(Template::of_type("Task").with("list", Vec::<Placeholder>::new()))
        });
        assert!(matches!(empty, Err(SyncError::Shape { .. })));

        let two = Preposition::for_template(|l| {
            matching(Template::of_type("Task").with("list", vec![l.clone(), l]))
        });
        assert!(matches!(two, Err(SyncError::Shape { .. })));
    }

    #[test]
    fn test_placeholder_from_outer_scope_fails() {
        let result = Preposition::for_template(|l| {
            let outer = l.clone();
            matching(Template::of_type("Task").with("list", l))
                .such_that(move |_t| exists(Template::of_type("Completion").with("task", outer)))
        });
        assert!(matches!(result, Err(SyncError::Shape { .. })));
    }

    #[test]
    fn test_error_in_nested_condition_surfaces() {
        let result = Preposition::for_template(|l| {
            tasks_in_list(l).such_that(|t| {
                not_exists(Template::of_type("Completion").with("task", t))
                    .such_that(|_c| exists(Template::of_type("Revocation")))
            })
        });
        assert!(matches!(result, Err(SyncError::Shape { .. })));
    }

    #[test]
    fn test_condition_sign() {
        assert!(task_is_completed(Placeholder::fresh()).is_positive());
        assert!(!task_is_not_completed(Placeholder::fresh()).is_positive());
        assert!(!(!task_is_completed(Placeholder::fresh())).is_positive());
    }

    #[test]
    fn test_from_query_infers_result_type() {
        let query: Query = r#"F.type="List" S.list F.type="Task" N(S.task F.type="Completion")"#
            .parse()
            .unwrap();
        let preposition = Preposition::from_query(query);
        assert_eq!(preposition.result_type(), Some("Task"));
    }
}
