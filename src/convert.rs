//! Conversion of evalexpr parse trees into symbolic expressions.
//!
//! Equations can be written as text, e.g. `"m * d(x, 2) + k * x"`. The text is parsed by
//! evalexpr and the resulting tree is converted here. Identifiers are resolved against a
//! [`Model`]:
//!
//! - registered variable names become [`Term`](crate::symbols::Term) leaves
//! - the name of the independent variable becomes `Time`
//! - `pi` becomes a constant unless a variable of that name exists
//! - any other identifier becomes a named `Symbol`
//!
//! Supported functions: `d(x)`, `d(x, n)`, `at(u, i)`, `sin`, `cos`, `exp`, `ln`, `log`,
//! `sqrt` and `abs`. `d` of a compound expression is its total time derivative.

use evalexpr::{Node, Operator};

use crate::{errors::ConvertError, expr::Expr, symbols::Model};

/// Converts an evalexpr parse tree node into an expression.
///
/// # Arguments
/// * `node` - The evalexpr node to convert
/// * `model` - Registry used to resolve variable names
///
/// # Returns
/// * `Result<Expr, ConvertError>` - The converted expression or an error if conversion fails
pub fn build_expr(node: &Node, model: &Model) -> Result<Expr, ConvertError> {
    match node.operator() {
        // Addition may carry more than two children
        Operator::Add => fold_children(node, model, |acc, e| acc + e),
        Operator::Mul => fold_children(node, model, |acc, e| acc * e),
        Operator::Div => {
            let [l, r] = binary(node, model)?;
            Ok(l / r)
        }
        Operator::Sub => {
            let [l, r] = binary(node, model)?;
            Ok(l - r)
        }
        Operator::Neg => {
            let children = node.children();
            let inner = children
                .first()
                .ok_or_else(|| ConvertError::UnsupportedOperator("empty negation".to_string()))?;
            Ok(-build_expr(inner, model)?)
        }
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::Const(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => resolve(identifier, model),
        Operator::FunctionIdentifier { identifier } => {
            let args = match node.children().first() {
                Some(child) => arguments(child),
                None => Vec::new(),
            };
            call(identifier, &args, model)
        }
        // Root node - parentheses or the top of the tree, must have exactly one child
        Operator::RootNode => {
            let children = node.children();
            if children.len() == 1 {
                build_expr(&children[0], model)
            } else {
                Err(ConvertError::RootNode(format!("{} children", children.len())))
            }
        }
        Operator::Exp => {
            let [base, exponent] = binary(node, model)?;
            match exponent.try_evaluate_constant() {
                Some(c) if c.fract() == 0.0 && c.abs() < i32::MAX as f64 => {
                    Ok(Expr::Pow(Box::new(base), c as i64))
                }
                Some(c) if c.is_finite() => Ok(Expr::PowFloat(Box::new(base), c)),
                Some(c) => Err(ConvertError::ExpOperator(format!("non-finite exponent {c}"))),
                None => Ok(Expr::PowExpr(Box::new(base), Box::new(exponent))),
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

fn fold_children<F>(node: &Node, model: &Model, op: F) -> Result<Expr, ConvertError>
where
    F: Fn(Expr, Expr) -> Expr,
{
    let children = node.children();
    let (first, rest) = children
        .split_first()
        .ok_or_else(|| ConvertError::UnsupportedOperator(format!("{:?}", node.operator())))?;
    rest.iter()
        .try_fold(build_expr(first, model)?, |acc, child| {
            Ok(op(acc, build_expr(child, model)?))
        })
}

fn binary(node: &Node, model: &Model) -> Result<[Expr; 2], ConvertError> {
    match node.children() {
        [l, r] => Ok([build_expr(l, model)?, build_expr(r, model)?]),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{:?} with {} operands",
            node.operator(),
            children.len()
        ))),
    }
}

fn resolve(identifier: &str, model: &Model) -> Result<Expr, ConvertError> {
    let ids = model.lookup(identifier);
    match ids.as_slice() {
        [id] => Ok(Expr::Term(crate::symbols::Term {
            var: *id,
            component: None,
            level: 0,
        })),
        [] if identifier == model.independent().name() => Ok(Expr::Time),
        [] if identifier == "pi" => Ok(Expr::Const(std::f64::consts::PI)),
        [] => Ok(Expr::Symbol(identifier.to_string())),
        _ => Err(ConvertError::AmbiguousVariable(identifier.to_string())),
    }
}

/// Unwraps parentheses and splits tuples into their elements.
fn arguments(node: &Node) -> Vec<&Node> {
    let mut current = node;
    while matches!(current.operator(), Operator::RootNode) && current.children().len() == 1 {
        current = &current.children()[0];
    }
    match current.operator() {
        Operator::Tuple => current.children().iter().collect(),
        _ => vec![current],
    }
}

fn call(function: &str, args: &[&Node], model: &Model) -> Result<Expr, ConvertError> {
    let invalid = |reason: &str| ConvertError::InvalidArguments {
        function: function.to_string(),
        reason: reason.to_string(),
    };

    match function {
        "d" => {
            let (target, n) = match args {
                [target] => (build_expr(target, model)?, 1),
                [target, n] => (build_expr(target, model)?, non_negative_int(n, model)?),
                _ => return Err(invalid("expected d(expr) or d(expr, n)")),
            };
            match target {
                Expr::Term(term) => Ok(Expr::Term(term.d(n))),
                other => Ok((0..n).fold(other, |acc, _| *acc.time_derivative())),
            }
        }
        "at" => match args {
            [target, i] => match build_expr(target, model)? {
                Expr::Term(term) => Ok(Expr::Term(term.at(non_negative_int(i, model)?))),
                _ => Err(invalid("first argument must be a variable")),
            },
            _ => Err(invalid("expected at(variable, index)")),
        },
        "sin" | "cos" | "exp" | "ln" | "log" | "sqrt" | "abs" => {
            let [arg] = args else {
                return Err(invalid("expected exactly one argument"));
            };
            let inner = Box::new(build_expr(arg, model)?);
            Ok(match function {
                "sin" => Expr::Sin(inner),
                "cos" => Expr::Cos(inner),
                "exp" => Expr::Exp(inner),
                "sqrt" => Expr::Sqrt(inner),
                "abs" => Expr::Abs(inner),
                _ => Expr::Ln(inner),
            })
        }
        _ => Err(ConvertError::UnsupportedFunction(function.to_string())),
    }
}

fn non_negative_int(node: &Node, model: &Model) -> Result<usize, ConvertError> {
    match build_expr(node, model)?.try_evaluate_constant() {
        Some(c) if c >= 0.0 && c.fract() == 0.0 => Ok(c as usize),
        _ => Err(ConvertError::InvalidArguments {
            function: "d/at".to_string(),
            reason: "expected a non-negative integer constant".to_string(),
        }),
    }
}
