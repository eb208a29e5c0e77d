use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use odejit::algebra::ClosedForm;
use odejit::errors::{AlgebraError, IntegrationError};
use odejit::expr::Wrt;
use odejit::prelude::*;

#[test]
fn test_harmonic_oscillator() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let y = model.var("y");

    let solution = model
        .problem(y.d(2) + y)
        .ivp(InitialValues::new().set(y, 1.0).set(y.d(1), 0.0))
        .t_span(0.0, 2.0 * PI)
        .options(IntegratorOptions::with_tolerances(1e-9, 1e-12))
        .solve_numeric()?;

    assert_eq!(solution.t().last().copied(), Some(2.0 * PI));
    assert!((solution.eval_scalar(y, 2.0 * PI)? - 1.0).abs() < 1e-6);
    assert!(solution.eval_scalar(y.d(1), 2.0 * PI)?.abs() < 1e-6);

    // Energy y² + y'² stays at 1
    let times: Vec<f64> = (0..=200).map(|i| i as f64 * 2.0 * PI / 200.0).collect();
    let position = solution.sample(y, &times)?;
    let velocity = solution.sample(y.d(1), &times)?;
    for (p, v) in position.iter().zip(&velocity) {
        assert!((p[0] * p[0] + v[0] * v[0] - 1.0).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn test_vector_oscillator() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let u = model.vector("u", 2);

    let solution = model
        .problem(u.d(2) + u)
        .ivp(InitialValues::new().set(u, [1.0, 0.0]).set(u.d(1), [0.0, 1.0]))
        .t_span(0.0, 4.0)
        .solve_numeric()?;

    assert_eq!(solution.state_map().len(), 4);
    let rows = solution.rows(u)?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], solution.row(u.at(0))?);
    assert_eq!(rows[1], solution.row(u.at(1))?);

    for (i, &t) in solution.t().iter().enumerate() {
        assert!((rows[0][i] - t.cos()).abs() < 1e-4);
        assert!((rows[1][i] - t.sin()).abs() < 1e-4);
    }
    Ok(())
}

#[test]
fn test_mixed_orders() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let x = model.var("x");
    let y = model.var("y");
    let equations = vec![eq(x.d(2), -x + y), eq(y.d(1), x - y)];

    let missing = model
        .problem(equations.clone())
        .ivp(InitialValues::new().set(x, 1.0).set(y, 0.0))
        .t_span(0.0, 1.0)
        .solve_numeric()
        .unwrap_err();
    assert!(
        matches!(
            &missing,
            OdeError::MissingInitialCondition { variable, level: 1 } if variable == "x"
        ),
        "{missing}"
    );

    let extra = model
        .problem(equations.clone())
        .ivp(
            InitialValues::new()
                .set(x, 1.0)
                .set(x.d(1), 0.0)
                .set(y, 0.0)
                .set(y.d(1), 0.0),
        )
        .t_span(0.0, 1.0)
        .solve_numeric()
        .unwrap_err();
    assert!(matches!(
        extra,
        OdeError::OverdeterminedConditions { level: 1, .. }
    ));

    let solution = model
        .problem(equations)
        .ivp(InitialValues::new().set(x, 1.0).set(x.d(1), 0.0).set(y, 0.0))
        .t_span(0.0, 1.0)
        .solve_numeric()?;
    assert_eq!(solution.state_map().len(), 3);
    assert!(matches!(
        solution.rows(y.d(1)),
        Err(OdeError::LevelOutOfRange {
            level: 1,
            order: 1,
            ..
        })
    ));
    Ok(())
}

#[test]
fn test_unsolvable_isolation() {
    let mut model = Model::new();
    let y = model.var("y");

    let err = model
        .problem(sin(y.d(2)) + y)
        .ivp(InitialValues::new().set(y, 0.1).set(y.d(1), 0.0))
        .t_span(0.0, 1.0)
        .solve_numeric()
        .unwrap_err();
    assert!(
        matches!(
            &err,
            OdeError::UnsolvableIsolation { equation: 0, term, .. } if term == "y''"
        ),
        "{err}"
    );
}

#[test]
fn test_nonlinear_highest_derivative() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let y = model.var("y");

    // y'^3 = y, y(0) = 1  =>  y = (1 + 2t/3)^(3/2)
    let solution = model
        .problem(eq(pow(y.d(1), 3), y))
        .ivp(InitialValues::new().set(y, 1.0))
        .t_span(0.0, 2.0)
        .options(IntegratorOptions::with_tolerances(1e-10, 1e-12))
        .solve_numeric()?;
    for t in [0.5f64, 1.0, 2.0] {
        let exact = (1.0 + 2.0 * t / 3.0).powf(1.5);
        assert!((solution.eval_scalar(y, t)? - exact).abs() < 1e-6);
    }

    // 1 / y'' + y = 0, i.e. y'' = -1 / y, conserves y'^2 / 2 + ln y
    let solution = model
        .problem(1.0 / y.d(2) + y)
        .ivp(InitialValues::new().set(y, 1.0).set(y.d(1), 0.0))
        .t_span(0.0, 1.0)
        .options(IntegratorOptions::with_tolerances(1e-10, 1e-12))
        .solve_numeric()?;
    let times: Vec<f64> = (0..=20).map(|i| i as f64 / 20.0).collect();
    let position = solution.sample(y, &times)?;
    let velocity = solution.sample(y.d(1), &times)?;
    for (p, v) in position.iter().zip(&velocity) {
        assert!((v[0] * v[0] / 2.0 + p[0].ln()).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn test_algebraic_variable_is_eliminated() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let x = model.var("x");
    let z = model.var("z");

    // z = x², x' = -z  =>  x = 1 / (1 + t)
    let solution = model
        .problem(vec![eq(z, pow(x, 2)), eq(x.d(1), -z)])
        .ivp(InitialValues::new().set(x, 1.0))
        .t_span(0.0, 1.0)
        .solve_numeric()?;

    assert_eq!(solution.state_map().len(), 1);
    assert!((solution.eval_scalar(x, 1.0)? - 0.5).abs() < 1e-6);
    assert!(solution.rows(z).is_err());
    Ok(())
}

#[test]
fn test_equation_count() {
    let mut model = Model::new();
    let x = model.var("x");
    let y = model.var("y");

    let err = model
        .problem(x.d(1) + y.d(1))
        .ivp(InitialValues::new().set(x, 1.0).set(y, 0.0))
        .t_span(0.0, 1.0)
        .solve_numeric()
        .unwrap_err();
    assert!(matches!(
        err,
        OdeError::UnderOrOverdeterminedSystem {
            equations: 1,
            unknowns: 2,
            ..
        }
    ));
}

/// Solves like the built-in engine but cannot differentiate.
struct NoDerivatives;

impl Algebra for NoDerivatives {
    fn differentiate(&self, _: &Expr, _: &Wrt, _: usize) -> Result<Expr, AlgebraError> {
        Err(AlgebraError::NonDifferentiable("disabled".to_string()))
    }

    fn solve_for(&self, residual: &Expr, unknown: &Term) -> Result<Expr, AlgebraError> {
        BuiltinAlgebra.solve_for(residual, unknown)
    }

    fn dsolve_closed_form(&self, _: &Expr, _: &Term) -> Result<ClosedForm, AlgebraError> {
        Err(AlgebraError::Unsupported("disabled".to_string()))
    }
}

#[test]
fn test_injected_algebra_without_jacobian() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let y = model.var("y");
    let problem = model
        .problem(y.d(2) + y)
        .ivp(InitialValues::new().set(y, 1.0).set(y.d(1), 0.0))
        .t_span(0.0, 1.0)
        .algebra(Arc::new(NoDerivatives));

    let solution = problem.solve_numeric()?;
    assert!(!solution.system().has_jacobian());
    assert!(solution.as_first_order().jacobian.is_none());
    assert!((solution.eval_scalar(y, 1.0)? - 1f64.cos()).abs() < 1e-5);

    assert!(matches!(
        problem.solve_symbolic(),
        Err(OdeError::Backend(message)) if message.contains("disabled")
    ));
    Ok(())
}

#[test]
fn test_step_size_underflow() {
    let mut model = Model::new();
    let y = model.var("y");

    // y' = 1000 sign(t - 1) jumps at t = 1 but stays finite
    let err = model
        .problem(eq(y.d(1), 1e3 * (time() - 1.0) / abs(time() - 1.0)))
        .ivp(InitialValues::new().set(y, 0.0))
        .t_span(0.0, 2.0)
        .options(
            IntegratorOptions::with_tolerances(1e-6, 1e-9)
                .method(Method::Dopri5)
                .min_step(1e-3),
        )
        .solve_numeric()
        .unwrap_err();
    assert!(
        matches!(
            err,
            OdeError::IntegrationFailure(IntegrationError::StepSizeUnderflow { t, .. })
                if t > 0.9 && t < 1.0
        ),
        "{err}"
    );
}

#[test]
fn test_backward_integration() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let y = model.var("y");

    let solution = model
        .problem(eq(y.d(1), y))
        .ivp(InitialValues::new().set(y, 1f64.exp()))
        .t_span(1.0, 0.0)
        .solve_numeric()?;

    assert_eq!(solution.t().first().copied(), Some(1.0));
    assert_eq!(solution.t().last().copied(), Some(0.0));
    assert!((solution.eval_scalar(y, 0.0)? - 1.0).abs() < 1e-5);
    assert!((solution.eval_scalar(y, 0.25)? - 0.25f64.exp()).abs() < 1e-4);
    assert!(matches!(
        solution.eval(y, 1.5),
        Err(OdeError::TimeOutOfRange { .. })
    ));
    Ok(())
}

#[test]
fn test_text_equations() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let x = model.var("x");

    let parsed = Equation::parse(&model, "d(x)", "-k * x + sin(t)")?;
    assert_eq!(parsed.lhs, Expr::Term(x.d(1)));
    assert!(parsed.rhs.symbols().contains("k"));

    let solution = model
        .problem(parsed)
        .parameter("k", 1.0)
        .ivp(InitialValues::new().set(x, 0.0))
        .t_span(0.0, 2.0)
        .solve_numeric()?;

    // x' = -x + sin t, x(0) = 0  =>  x = (sin t - cos t + e^-t) / 2
    let t = 2.0f64;
    let exact = (t.sin() - t.cos() + (-t).exp()) / 2.0;
    assert!((solution.eval_scalar(x, t)? - exact).abs() < 1e-5);
    Ok(())
}

#[test]
fn test_closed_form_matches_integration() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let y = model.var("y");
    let equation = y.d(2) + 3.0 * y.d(1) + 2.0 * y;
    let ivp = InitialValues::new().set(y, 1.0).set(y.d(1), 0.0);

    let general = model.problem(equation.clone()).solve_symbolic()?;
    assert_eq!(general.constants(), ["C1", "C2"]);

    let output = model
        .problem(equation.clone())
        .ivp(ivp.clone())
        .t_span(0.0, 3.0)
        .backend(Backend::Auto)
        .solve()?;
    let closed = output.as_symbolic().ok_or("expected a closed form")?;

    let numeric = model
        .problem(equation)
        .ivp(ivp)
        .t_span(0.0, 3.0)
        .solve_numeric()?;

    for t in [0.5f64, 1.5, 3.0] {
        let exact = 2.0 * (-t).exp() - (-2.0 * t).exp();
        let symbolic = closed.eval(y, t, &HashMap::new())?;
        assert!((symbolic - exact).abs() < 1e-12);
        assert!((numeric.eval_scalar(y, t)? - exact).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn test_stiff_problem_with_jacobian() -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::new();
    let y = model.var("y");

    let solution = model
        .problem(eq(y.d(1), -1000.0 * (y - cos(time()))))
        .ivp(InitialValues::new().set(y, 0.0))
        .t_span(0.0, 5.0)
        .solve_numeric()?;

    assert!(solution.system().has_jacobian());
    assert!((solution.eval_scalar(y, 5.0)? - 5f64.cos()).abs() < 1e-2);
    assert!(solution.stats().accepted_steps > 0);
    Ok(())
}
