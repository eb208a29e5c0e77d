//! Initial-value validation.
//!
//! Initial values are keyed by terms: a bare variable means level 0, a derivative reference
//! means its level. Vector variables take one value per component, either as a whole vector
//! or per component (`u.at(i)`). For a variable of order `k` exactly the levels `0..k` must be
//! covered, every component once.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::analyze::OrderMap;
use crate::errors::OdeError;
use crate::state::StateMap;
use crate::symbols::{Model, Term, VarId};

/// Value of one initial condition.
#[derive(Debug, Clone, PartialEq)]
pub enum IvpValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl IvpValue {
    fn len(&self) -> usize {
        match self {
            IvpValue::Scalar(_) => 1,
            IvpValue::Vector(v) => v.len(),
        }
    }

    fn values(&self) -> Vec<f64> {
        match self {
            IvpValue::Scalar(v) => vec![*v],
            IvpValue::Vector(v) => v.clone(),
        }
    }
}

impl From<f64> for IvpValue {
    fn from(value: f64) -> Self {
        IvpValue::Scalar(value)
    }
}

impl From<Vec<f64>> for IvpValue {
    fn from(value: Vec<f64>) -> Self {
        IvpValue::Vector(value)
    }
}

impl From<&[f64]> for IvpValue {
    fn from(value: &[f64]) -> Self {
        IvpValue::Vector(value.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for IvpValue {
    fn from(value: [f64; N]) -> Self {
        IvpValue::Vector(value.to_vec())
    }
}

/// User supplied initial conditions, in insertion order.
///
/// # Example
/// ```
/// use odejit::symbols::Model;
/// use odejit::validate::InitialValues;
///
/// let mut model = Model::new();
/// let y = model.var("y");
/// let u = model.vector("u", 2);
///
/// let ivp = InitialValues::new()
///     .set(y, 1.0)
///     .set(y.d(1), 0.0)
///     .set(u, [1.0, 0.0]);
/// assert_eq!(ivp.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialValues {
    entries: Vec<(Term, IvpValue)>,
}

impl InitialValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition and returns the updated set.
    pub fn set(mut self, key: Term, value: impl Into<IvpValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: Term, value: impl Into<IvpValue>) {
        self.entries.push((key, value.into()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Term, IvpValue)> {
        self.entries.iter()
    }

    /// Variables named by any key.
    pub fn variables(&self) -> BTreeSet<VarId> {
        self.entries.iter().map(|(term, _)| term.var).collect()
    }
}

impl<V: Into<IvpValue>> FromIterator<(Term, V)> for InitialValues {
    fn from_iter<I: IntoIterator<Item = (Term, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }
}

/// Validated initial values: one value per `(variable, level, component)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedIvp {
    values: BTreeMap<(VarId, usize), Vec<f64>>,
}

impl NormalizedIvp {
    /// Component values of `var` at `level`.
    pub fn get(&self, var: VarId, level: usize) -> Option<&[f64]> {
        self.values.get(&(var, level)).map(Vec::as_slice)
    }

    /// Lays the values out as the initial state vector.
    pub fn to_state_vector(&self, map: &StateMap) -> Vec<f64> {
        map.keys()
            .iter()
            .map(|key| {
                self.get(key.var, key.level)
                    .and_then(|values| values.get(key.component.unwrap_or(0)))
                    .copied()
                    .unwrap_or(0.0)
            })
            .collect()
    }
}

/// Checks the initial values against the required orders.
///
/// Keys are processed in insertion order; the first offending key decides the error. Keys
/// for variables outside the system, levels at or above the order and repeated coverage are
/// reported as [`OdeError::OverdeterminedConditions`]. Afterwards the lowest uncovered level
/// (variables in registration order) is reported as [`OdeError::MissingInitialCondition`].
///
/// # Errors
/// Besides the two coverage errors, values with the wrong number of components raise
/// [`OdeError::ShapeMismatch`] and component keys outside the shape raise
/// [`OdeError::ComponentOutOfRange`].
pub fn validate_ivp(
    model: &Model,
    orders: &OrderMap,
    ivp: &InitialValues,
) -> Result<NormalizedIvp, OdeError> {
    let mut slots: BTreeMap<(VarId, usize), Vec<Option<f64>>> = BTreeMap::new();

    for (key, value) in ivp.iter() {
        let info = model
            .get(key.var)
            .ok_or_else(|| OdeError::UnknownVariable(format!("{key}")))?;
        let components = info.shape.components();
        let overdetermined = |reason: String| OdeError::OverdeterminedConditions {
            variable: info.name.clone(),
            level: key.level,
            reason,
        };

        let Some(order) = orders.get(key.var) else {
            return Err(overdetermined("variable is not part of the system".into()));
        };
        if key.level >= order {
            return Err(overdetermined(format!(
                "level {} is not below the order {order}",
                key.level
            )));
        }

        // Component range of this key, and the values it provides.
        let (first, provided) = match key.component {
            Some(c) if !info.shape.is_vector() || c >= components => {
                return Err(OdeError::ComponentOutOfRange {
                    variable: info.name.clone(),
                    component: c,
                    components: if info.shape.is_vector() { components } else { 0 },
                })
            }
            Some(c) => (c, expect_len(&info.name, value, 1)?),
            None => (0, expect_len(&info.name, value, components)?),
        };

        let entry = slots
            .entry((key.var, key.level))
            .or_insert_with(|| vec![None; components]);
        for (offset, v) in provided.into_iter().enumerate() {
            let slot = &mut entry[first + offset];
            if slot.is_some() {
                return Err(overdetermined("condition given more than once".into()));
            }
            *slot = Some(v);
        }
    }

    let mut values = BTreeMap::new();
    for (var, order) in orders.iter() {
        for level in 0..order {
            let complete = slots
                .get(&(var, level))
                .and_then(|entry| entry.iter().copied().collect::<Option<Vec<f64>>>());
            match complete {
                Some(v) => {
                    values.insert((var, level), v);
                }
                None => {
                    return Err(OdeError::MissingInitialCondition {
                        variable: model.info(var).name.clone(),
                        level,
                    })
                }
            }
        }
    }

    debug!("validated {} initial conditions", values.len());
    Ok(NormalizedIvp { values })
}

fn expect_len(name: &str, value: &IvpValue, expected: usize) -> Result<Vec<f64>, OdeError> {
    if value.len() != expected {
        return Err(OdeError::ShapeMismatch {
            variable: name.to_string(),
            expected,
            got: value.len(),
        });
    }
    Ok(value.values())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mixed {
        model: Model,
        x: Term,
        y: Term,
        u: Term,
        orders: OrderMap,
    }

    fn mixed() -> Mixed {
        let mut model = Model::new();
        let x = model.var("x");
        let y = model.var("y");
        let u = model.vector("u", 2);
        let orders = [(x.var, 2), (y.var, 1), (u.var, 1)].into_iter().collect();
        Mixed {
            model,
            x,
            y,
            u,
            orders,
        }
    }

    #[test]
    fn test_accepts_exact_coverage() -> Result<(), Box<dyn std::error::Error>> {
        let m = mixed();
        let ivp = InitialValues::new()
            .set(m.x, 1.0)
            .set(m.x.d(1), 2.0)
            .set(m.y, 3.0)
            .set(m.u.at(1), 5.0)
            .set(m.u.at(0), 4.0);
        let normalized = validate_ivp(&m.model, &m.orders, &ivp)?;
        assert_eq!(normalized.get(m.u.var, 0), Some(&[4.0, 5.0][..]));

        let map = StateMap::new(&m.model, &m.orders);
        assert_eq!(normalized.to_state_vector(&map), vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        // Idempotent
        assert_eq!(validate_ivp(&m.model, &m.orders, &ivp)?, normalized);
        Ok(())
    }

    #[test]
    fn test_missing_lowest_level() {
        let m = mixed();
        let ivp = InitialValues::new()
            .set(m.x, 1.0)
            .set(m.y, 3.0)
            .set(m.u, vec![0.0, 1.0]);
        let err = validate_ivp(&m.model, &m.orders, &ivp).unwrap_err();
        assert!(matches!(
            err,
            OdeError::MissingInitialCondition { ref variable, level: 1 } if variable == "x"
        ));
    }

    #[test]
    fn test_overdetermined() {
        let m = mixed();
        let base = InitialValues::new()
            .set(m.x, 1.0)
            .set(m.x.d(1), 2.0)
            .set(m.y, 3.0)
            .set(m.u, [0.0, 1.0]);

        let extra_level = base.clone().set(m.y.d(1), 0.0);
        assert!(matches!(
            validate_ivp(&m.model, &m.orders, &extra_level),
            Err(OdeError::OverdeterminedConditions { level: 1, .. })
        ));

        let duplicate = base.clone().set(m.u.at(0), 7.0);
        assert!(matches!(
            validate_ivp(&m.model, &m.orders, &duplicate),
            Err(OdeError::OverdeterminedConditions { level: 0, .. })
        ));

        let mut model = m.model.clone();
        let stranger = model.var("w");
        let outside = base.set(stranger, 1.0);
        assert!(matches!(
            validate_ivp(&model, &m.orders, &outside),
            Err(OdeError::OverdeterminedConditions { .. })
        ));
    }

    #[test]
    fn test_shape_errors() {
        let m = mixed();
        let ivp = InitialValues::new()
            .set(m.x, 1.0)
            .set(m.x.d(1), 2.0)
            .set(m.y, 3.0)
            .set(m.u, [0.0, 1.0, 2.0]);
        assert!(matches!(
            validate_ivp(&m.model, &m.orders, &ivp),
            Err(OdeError::ShapeMismatch { expected: 2, got: 3, .. })
        ));
    }

    #[test]
    fn test_exactly_one_coverage_error() {
        // Every subset of the required keys plus one spurious key yields exactly one error
        // kind: missing when a required key is absent, overdetermined when only the spurious
        // key is wrong.
        let m = mixed();
        let required: Vec<(Term, IvpValue)> = vec![
            (m.x, 1.0.into()),
            (m.x.d(1), 0.0.into()),
            (m.y, 2.0.into()),
            (m.u, vec![0.0, 0.0].into()),
        ];
        for mask in 0..(1u32 << required.len()) {
            let mut ivp: InitialValues = required
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << *i) != 0)
                .map(|(_, (k, v))| (*k, v.clone()))
                .collect();
            let complete = mask == (1 << required.len()) - 1;
            match validate_ivp(&m.model, &m.orders, &ivp) {
                Ok(_) => assert!(complete),
                Err(OdeError::MissingInitialCondition { .. }) => assert!(!complete),
                Err(other) => panic!("unexpected error {other}"),
            }

            ivp.insert(m.x.d(2), 1.0);
            assert!(matches!(
                validate_ivp(&m.model, &m.orders, &ivp),
                Err(OdeError::OverdeterminedConditions { .. })
            ));
        }
    }
}
