//! Order analysis.
//!
//! Computes, for every variable of an equation set, the number of initial conditions it
//! needs: the highest derivative level referenced for it. Equations that reference a whole
//! vector variable are first expanded into one scalar equation per component, so that every
//! later stage only sees scalar equations.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::debug;

use crate::equation::Equation;
use crate::errors::OdeError;
use crate::expr::Expr;
use crate::symbols::{Model, Shape, VarId};

/// Required order of every variable of a system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderMap {
    orders: BTreeMap<VarId, usize>,
}

impl OrderMap {
    pub fn get(&self, var: VarId) -> Option<usize> {
        self.orders.get(&var).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, usize)> + '_ {
        self.orders.iter().map(|(v, o)| (*v, *o))
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Size of the flat state vector, `Σ order × components`.
    pub fn state_dimension(&self, model: &Model) -> usize {
        self.iter()
            .map(|(var, order)| order * model.info(var).shape.components())
            .sum()
    }
}

impl FromIterator<(VarId, usize)> for OrderMap {
    fn from_iter<I: IntoIterator<Item = (VarId, usize)>>(iter: I) -> Self {
        Self {
            orders: iter.into_iter().collect(),
        }
    }
}

/// Checks every term against the model and expands whole-vector references.
///
/// An equation referencing `u` (shape `n`) without a component becomes `n` equations, the
/// `i`-th with every whole-vector term replaced by its component `i`. All whole-vector
/// variables of one equation must have the same number of components.
pub fn expand_vector_equations(
    model: &Model,
    equations: &[Equation],
) -> Result<Vec<Equation>, OdeError> {
    let mut expanded = Vec::with_capacity(equations.len());

    for equation in equations {
        let mut width: Option<usize> = None;

        for term in equation.terms() {
            let info = model
                .get(term.var)
                .ok_or_else(|| OdeError::UnknownVariable(format!("{}", term)))?;
            let components = info.shape.components();

            match (info.shape, term.component) {
                (Shape::Scalar, Some(component)) => {
                    return Err(OdeError::ComponentOutOfRange {
                        variable: info.name.clone(),
                        component,
                        components: 0,
                    })
                }
                (Shape::Vector(n), Some(component)) if component >= n => {
                    return Err(OdeError::ComponentOutOfRange {
                        variable: info.name.clone(),
                        component,
                        components: n,
                    })
                }
                (Shape::Vector(n), None) => match width {
                    Some(w) if w != n => {
                        return Err(OdeError::ShapeMismatch {
                            variable: info.name.clone(),
                            expected: w,
                            got: components,
                        })
                    }
                    _ => width = Some(n),
                },
                _ => {}
            }
        }

        match width {
            None => expanded.push(equation.clone()),
            Some(n) => {
                for i in 0..n {
                    let pick = |node: &Expr| match node {
                        Expr::Term(t)
                            if t.component.is_none() && model.info(t.var).shape.is_vector() =>
                        {
                            Some(Expr::Term(t.at(i)))
                        }
                        _ => None,
                    };
                    expanded.push(Equation {
                        lhs: *equation.lhs.replace(&pick),
                        rhs: *equation.rhs.replace(&pick),
                    });
                }
            }
        }
    }

    debug!(
        "expanded {} equations into {} scalar equations",
        equations.len(),
        expanded.len()
    );
    Ok(expanded)
}

/// Highest derivative level referenced per variable.
///
/// Expects scalar equations (see [`expand_vector_equations`]). All components of a vector
/// variable that are referenced must reach the same highest level.
pub fn infer_orders(
    model: &Model,
    equations: &[Equation],
) -> Result<BTreeMap<VarId, usize>, OdeError> {
    let mut per_component: BTreeMap<(VarId, Option<usize>), usize> = BTreeMap::new();
    for term in equations.iter().flat_map(|e| e.terms()) {
        let level = per_component.entry((term.var, term.component)).or_insert(0);
        *level = (*level).max(term.level);
    }

    let mut orders = BTreeMap::new();
    for (var, group) in &per_component.iter().chunk_by(|((var, _), _)| *var) {
        let levels: Vec<(Option<usize>, usize)> =
            group.map(|((_, component), level)| (*component, *level)).collect();
        let highest = levels.iter().map(|(_, l)| *l).max().unwrap_or(0);

        if let Some((component, level)) = levels.iter().find(|(_, l)| *l != highest) {
            let name = model.name(var);
            return Err(OdeError::OrderMismatch {
                variable: name.to_string(),
                reason: format!(
                    "component {} reaches derivative level {} while another component reaches {}",
                    component.map_or_else(|| name.to_string(), |c| format!("{name}[{c}]")),
                    level,
                    highest
                ),
            });
        }
        orders.insert(var, highest);
    }
    Ok(orders)
}

/// Reconciles inferred orders with declared ones.
///
/// A declared order below the inferred one is an error; a higher one is accepted and
/// becomes the required order. Variables in `extra` that no equation references (for
/// example keys of the initial values) take their declared order, or fail without one.
pub fn resolve_orders(
    model: &Model,
    inferred: &BTreeMap<VarId, usize>,
    extra: &BTreeSet<VarId>,
) -> Result<OrderMap, OdeError> {
    let mut orders = BTreeMap::new();

    for (&var, &required) in inferred {
        let info = model.info(var);
        let order = match info.declared_order {
            Some(declared) if declared < required => {
                return Err(OdeError::OrderMismatch {
                    variable: info.name.clone(),
                    reason: format!(
                        "declared order {declared} but equations reference derivative level {required}"
                    ),
                })
            }
            Some(declared) => declared,
            None => required,
        };
        orders.insert(var, order);
    }

    for &var in extra.iter().filter(|v| !inferred.contains_key(v)) {
        let info = model
            .get(var)
            .ok_or_else(|| OdeError::UnknownVariable(format!("v{}", var.index())))?;
        match info.declared_order {
            Some(declared) => {
                orders.insert(var, declared);
            }
            None => {
                return Err(OdeError::OrderMismatch {
                    variable: info.name.clone(),
                    reason: "variable appears in no equation and has no declared order"
                        .to_string(),
                })
            }
        }
    }

    debug!(
        "resolved orders: {}",
        orders
            .iter()
            .map(|(v, o)| format!("{}={}", model.name(*v), o))
            .join(", ")
    );
    Ok(orders.into_iter().collect())
}
