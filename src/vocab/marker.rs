use crate::prelude::*;

/// Supplies the values of PEP 508 environment marker variables (`python_version`,
/// `sys_platform`, `extra`, etc.) during marker evaluation. Resolvers and installers
/// each provide their own implementation -- the resolver never probes the running
/// process for these, they always come from an explicit, serializable environment
/// description.
pub trait Env {
    fn get_marker_var(&self, var: &str) -> Option<&str>;
}

impl Env for HashMap<String, String> {
    fn get_marker_var(&self, var: &str) -> Option<&str> {
        self.get(var).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Variable(String),
    Literal(String),
}

impl Value {
    pub fn is_extra(&self) -> bool {
        matches!(self, Value::Variable(v) if v == "extra")
    }

    pub fn eval(&self, env: &dyn Env) -> Result<String> {
        match self {
            Value::Variable(varname) => env
                .get_marker_var(varname)
                .map(|s| s.to_owned())
                .ok_or_else(|| eyre!("no environment marker named '{}'", varname)),
            Value::Literal(s) => Ok(s.clone()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Variable(v) => write!(f, "{}", v),
            Value::Literal(s) => write!(f, "{:?}", s),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Compare(CompareOp),
    In,
    NotIn,
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Compare(op) => write!(f, "{}", op),
            Op::In => write!(f, "in"),
            Op::NotIn => write!(f, "not in"),
        }
    }
}

/// A PEP 508 marker expression, evaluated against an [`Env`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvMarkerExpr {
    And(Box<EnvMarkerExpr>, Box<EnvMarkerExpr>),
    Or(Box<EnvMarkerExpr>, Box<EnvMarkerExpr>),
    Operator { op: Op, lhs: Value, rhs: Value },
}

impl EnvMarkerExpr {
    pub fn is_extra(&self) -> bool {
        matches!(
            self,
            EnvMarkerExpr::Operator { lhs, rhs, .. } if lhs.is_extra() || rhs.is_extra()
        )
    }

    pub fn eval(&self, env: &dyn Env) -> Result<bool> {
        Ok(match self {
            EnvMarkerExpr::And(lhs, rhs) => lhs.eval(env)? && rhs.eval(env)?,
            EnvMarkerExpr::Or(lhs, rhs) => lhs.eval(env)? || rhs.eval(env)?,
            EnvMarkerExpr::Operator { op, lhs, rhs } => {
                let lhs_val = lhs.eval(env)?;
                let rhs_val = rhs.eval(env)?;
                match op {
                    Op::In => rhs_val.contains(&lhs_val),
                    Op::NotIn => !rhs_val.contains(&lhs_val),
                    Op::Compare(op) => {
                        // If the lhs parses as a version, and the rhs parses as a
                        // (possibly-wildcard) version specifier, do a version
                        // comparison; PEP 440 semantics apply even inside markers.
                        if let Ok(lhs_ver) = lhs_val.parse() {
                            if let Ok(rhs_ranges) = op.to_ranges(&rhs_val) {
                                return Ok(rhs_ranges.into_iter().any(|r| r.contains(&lhs_ver)));
                            }
                        }
                        // Otherwise, fall back to lexicographic string comparison.
                        use CompareOp::*;
                        match op {
                            LessThanEqual => lhs_val <= rhs_val,
                            StrictlyLessThan => lhs_val < rhs_val,
                            NotEqual => lhs_val != rhs_val,
                            Equal => lhs_val == rhs_val,
                            GreaterThanEqual => lhs_val >= rhs_val,
                            StrictlyGreaterThan => lhs_val > rhs_val,
                            Compatible => bail!("~= requires valid version strings"),
                        }
                    }
                }
            }
        })
    }
}

impl Display for EnvMarkerExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvMarkerExpr::And(lhs, rhs) => write!(f, "{} and {}", lhs, rhs),
            EnvMarkerExpr::Or(lhs, rhs) => write!(f, "{} or {}", lhs, rhs),
            EnvMarkerExpr::Operator { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
        }
    }
}

/// Wraps an [`EnvMarkerExpr`] so it can be used as a `HashMap` key and serialized
/// deterministically by its canonical string form. Used to record every marker
/// expression a resolve actually depended on, so a lock file can be checked for
/// staleness if the target environment shifts in a way that would change one of
/// these evaluations.
#[derive(Debug, Clone)]
pub struct StandaloneMarkerExpr(pub EnvMarkerExpr);

impl PartialEq for StandaloneMarkerExpr {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
impl Eq for StandaloneMarkerExpr {}

impl std::hash::Hash for StandaloneMarkerExpr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_string().hash(state)
    }
}

impl Display for StandaloneMarkerExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
