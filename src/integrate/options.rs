//! Integrator configuration.

use crate::errors::IntegrationError;

/// Stepping method.
///
/// | Method       | Order | Stages | Use Case |
/// |--------------|-------|--------|----------|
/// | Dopri5       | 5(4)  | 7 (FSAL) | Non-stiff problems |
/// | Rosenbrock23 | 2(3)  | 3      | Stiff problems, moderate accuracy |
/// | Auto         |       |        | Dopri5, switching to Rosenbrock23 on stiffness |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// Dormand-Prince 5(4), explicit.
    Dopri5,
    /// Linearly implicit Rosenbrock 2(3). Uses the analytic Jacobian when available and
    /// finite differences otherwise.
    Rosenbrock23,
    /// Starts with Dopri5 and switches to Rosenbrock23 once the stiffness test fires
    /// repeatedly. Only switches when an analytic Jacobian is available.
    #[default]
    Auto,
}

impl Method {
    /// Order of the embedded error estimate.
    pub fn error_order(&self) -> usize {
        match self {
            Self::Dopri5 | Self::Auto => 4,
            Self::Rosenbrock23 => 2,
        }
    }
}

/// Options for [`integrate`](super::integrate).
#[derive(Debug, Clone, PartialEq)]
pub struct IntegratorOptions {
    /// Stepping method (default: Auto)
    pub method: Method,
    /// Relative tolerance (default: 1e-6)
    pub rtol: f64,
    /// Absolute tolerance (default: 1e-9)
    pub atol: f64,
    /// Initial step size magnitude (default: estimated)
    pub first_step: Option<f64>,
    /// Largest step size magnitude (default: unbounded)
    pub max_step: f64,
    /// Smallest step size magnitude before failing (default: 1e-12)
    pub min_step: f64,
    /// Maximum number of attempted steps (default: 100000)
    pub max_steps: usize,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            method: Method::default(),
            rtol: 1e-6,
            atol: 1e-9,
            first_step: None,
            max_step: f64::INFINITY,
            min_step: 1e-12,
            max_steps: 100_000,
        }
    }
}

impl IntegratorOptions {
    /// Create options with specified tolerances.
    pub fn with_tolerances(rtol: f64, atol: f64) -> Self {
        Self {
            rtol,
            atol,
            ..Default::default()
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn first_step(mut self, h: f64) -> Self {
        self.first_step = Some(h);
        self
    }

    pub fn max_step(mut self, h: f64) -> Self {
        self.max_step = h;
        self
    }

    pub fn min_step(mut self, h: f64) -> Self {
        self.min_step = h;
        self
    }

    pub fn max_steps(mut self, n: usize) -> Self {
        self.max_steps = n;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), IntegrationError> {
        let invalid = |msg: &str| Err(IntegrationError::InvalidOptions(msg.to_string()));
        if !(self.rtol >= 0.0 && self.atol >= 0.0) || self.rtol + self.atol <= 0.0 {
            return invalid("tolerances must be non-negative and not both zero");
        }
        if !(self.min_step > 0.0) || !(self.max_step > 0.0) || self.min_step > self.max_step {
            return invalid("step bounds must satisfy 0 < min_step <= max_step");
        }
        if matches!(self.first_step, Some(h) if !(h.is_finite() && h != 0.0)) {
            return invalid("first_step must be finite and non-zero");
        }
        if self.max_steps == 0 {
            return invalid("max_steps must be positive");
        }
        Ok(())
    }
}
