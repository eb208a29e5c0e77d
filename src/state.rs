//! State-space reduction.
//!
//! A variable of order `k` with `c` components occupies `k × c` consecutive coordinates of
//! the flat state vector, ordered by derivative level first and component second:
//!
//! ```text
//! x (order 2), u (order 1, 2 components):
//!   0: x    1: x'    2: u[0]    3: u[1]
//! ```
//!
//! Variables follow their registration order. Every level below the highest is a carrier:
//! its derivative is simply the next level. The same [`StateMap`] is shared by the isolator,
//! the compiled functions, the integrator and the solution.

use std::fmt;

use colored::Colorize;

use crate::analyze::OrderMap;
use crate::errors::OdeError;
use crate::symbols::{Model, Term, VarId};

/// Placement of one variable inside the state vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarLayout {
    pub var: VarId,
    pub name: String,
    pub order: usize,
    pub components: usize,
    pub vector: bool,
    /// Index of level 0, component 0.
    pub offset: usize,
}

impl VarLayout {
    fn index(&self, level: usize, component: usize) -> usize {
        self.offset + level * self.components + component
    }

    /// The term stored at `level`, `component`.
    fn term(&self, level: usize, component: usize) -> Term {
        Term {
            var: self.var,
            component: self.vector.then_some(component),
            level,
        }
    }
}

/// Bijection between `(variable, level, component)` and state-vector indices.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMap {
    layouts: Vec<VarLayout>,
    keys: Vec<Term>,
}

impl StateMap {
    /// Lays out every variable of `orders` in registration order.
    pub fn new(model: &Model, orders: &OrderMap) -> Self {
        let mut layouts = Vec::with_capacity(orders.len());
        let mut keys = Vec::new();

        for (var, order) in orders.iter() {
            let info = model.info(var);
            let layout = VarLayout {
                var,
                name: info.name.clone(),
                order,
                components: info.shape.components(),
                vector: info.shape.is_vector(),
                offset: keys.len(),
            };
            for level in 0..order {
                for component in 0..layout.components {
                    keys.push(layout.term(level, component));
                }
            }
            layouts.push(layout);
        }

        Self { layouts, keys }
    }

    /// Number of state coordinates `N`.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn layouts(&self) -> &[VarLayout] {
        &self.layouts
    }

    pub fn layout(&self, var: VarId) -> Option<&VarLayout> {
        self.layouts.iter().find(|l| l.var == var)
    }

    /// Order of a variable in this system.
    pub fn order(&self, var: VarId) -> Option<usize> {
        self.layout(var).map(|l| l.order)
    }

    /// Terms in state-vector order.
    pub fn keys(&self) -> &[Term] {
        &self.keys
    }

    /// Index of a single stored coordinate.
    ///
    /// Returns `None` for whole-vector terms, levels at or above the order and components
    /// outside the shape.
    pub fn index_of(&self, term: &Term) -> Option<usize> {
        let layout = self.layout(term.var)?;
        if term.level >= layout.order {
            return None;
        }
        let component = match (layout.vector, term.component) {
            (false, None) => 0,
            (true, Some(c)) if c < layout.components => c,
            _ => return None,
        };
        Some(layout.index(term.level, component))
    }

    /// The term stored at `index`.
    pub fn key_of(&self, index: usize) -> Option<Term> {
        self.keys.get(index).copied()
    }

    /// Indices addressed by `term`: one for scalars and components, one per component for
    /// whole-vector terms.
    pub fn slots_for(&self, term: &Term) -> Result<Vec<usize>, OdeError> {
        let layout = self
            .layout(term.var)
            .ok_or_else(|| OdeError::UnknownVariable(format!("v{}", term.var.index())))?;
        if term.level >= layout.order {
            return Err(OdeError::LevelOutOfRange {
                variable: layout.name.clone(),
                level: term.level,
                order: layout.order,
            });
        }
        match (layout.vector, term.component) {
            (_, Some(c)) if !layout.vector || c >= layout.components => {
                Err(OdeError::ComponentOutOfRange {
                    variable: layout.name.clone(),
                    component: c,
                    components: if layout.vector { layout.components } else { 0 },
                })
            }
            (_, Some(c)) => Ok(vec![layout.index(term.level, c)]),
            (true, None) => Ok((0..layout.components)
                .map(|c| layout.index(term.level, c))
                .collect()),
            (false, None) => Ok(vec![layout.index(term.level, 0)]),
        }
    }

    /// Human readable name of the coordinate at `index`, e.g. `u[1]'`.
    pub fn slot_name(&self, index: usize) -> String {
        let Some(term) = self.key_of(index) else {
            return format!("state[{index}]");
        };
        let name = self
            .layout(term.var)
            .map(|l| l.name.as_str())
            .unwrap_or("?");
        let mut out = name.to_string();
        if let Some(c) = term.component {
            out.push_str(&format!("[{c}]"));
        }
        match term.level {
            0 => {}
            l @ 1..=3 => out.push_str(&"'".repeat(l)),
            l => out.push_str(&format!("^({l})")),
        }
        out
    }
}

impl fmt::Display for StateMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..self.len() {
            writeln!(f, "  {}: {}", index.to_string().cyan(), self.slot_name(index))?;
        }
        Ok(())
    }
}
