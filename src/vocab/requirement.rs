use crate::prelude::*;

// There are two kinds of special exact version constraints that aren't often
// used, and whose semantics are a bit unclear:
//
//  === "some string"
//  @ some_url
//
// For === it's easy enough to parse and represent (same as all the other binary
// comparisons), but PEP 440 says "the primary use case ... is to allow for
// specifying a version which cannot otherwise be represented by this PEP", which
// makes it awkward to fold into a range-based algebra. We reject it rather than
// give it fake semantics.
//
// '@' (direct URL references) would also need an entire copy of PEP 508's URL
// grammar, which is a large surface for very little payoff here, so it's
// rejected too -- see `urlspec` below.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseExtra {
    Allowed,
    NotAllowed,
}

/// A PEP 508-style dependency specification: a package name, optional extras,
/// a set of version specifiers, and an optional marker expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: PackageName,
    pub extras: Vec<Extra>,
    pub specifiers: Specifiers,
    pub env_marker_expr: Option<marker::EnvMarkerExpr>,
}

impl Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name.as_given())?;
        if !self.extras.is_empty() {
            write!(f, "[")?;
            for (i, e) in self.extras.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", e.as_given())?;
            }
            write!(f, "]")?;
        }
        if !self.specifiers.0.is_empty() {
            write!(f, " {}", self.specifiers)?;
        }
        if let Some(expr) = &self.env_marker_expr {
            write!(f, "; {}", expr)?;
        }
        Ok(())
    }
}

peg::parser! {
    grammar parser() for str {
        rule wsp()
            = quiet!{ [' ' | '\t' ] }

        rule letter_or_digit()
            = quiet!{['A'..='Z' | 'a'..='z' | '0'..='9']} / expected!("letter or digit")

        rule _()
            = quiet!{ wsp()* }

        rule version_cmp() -> &'input str
            = $("<=" / "<" / "!=" / "==" / ">=" / ">" / "~=" / "===")

        // Caret/tilde are constraint-only syntax (spec.md's C1 desugaring) --
        // they're not valid marker comparison operators, so markers keep using
        // version_cmp() above and only version_one() gets the wider set.
        rule constraint_cmp() -> &'input str
            = $("<=" / "<" / "!=" / "==" / ">=" / ">" / "~=" / "~" / "^" / "===")

        rule version()
            = (letter_or_digit() / "-" / "_" / "." / "*" / "+" / "!")+

        rule version_one() -> Specifier
            = _ op:constraint_cmp() _ v:$(version())
            {?
                Ok(Specifier {
                    op: op.try_into().or(Err("unrecognized comparison operator"))?,
                    value: v.into(),
                })
            }

        rule version_many() -> Vec<Specifier>
            = version_one() ++ (_ ",")

        pub rule versionspec() -> Vec<Specifier>
            = ("(" vm:version_many() ")" { vm }) / version_many()

        rule urlspec() -> Requirement
            = "@" {? Err("direct url references are not supported") }

        rule not_in() -> &'static str
            = "not" wsp()+ "in" { "not in" }

        rule marker_op() -> &'input str
            = _ op:(version_cmp() / $("in") / not_in()) { op }

        rule python_str_c() -> &'input str
            = $(quiet! { [' ' | '\t' | 'A'..='Z' | 'a'..='z' | '0'..='9' | '(' | ')'
                 | '.' | '{' | '}' | '-' | '_' | '*' | '#' | ':' | ';' | ','
                 | '/' | '?' | '[' | ']' | '!' | '~' | '`' | '@' | '$' | '%'
                 | '^' | '&' | '=' | '+' | '|' | '<' | '>'] })
              / expected!("printable character")

        // PEP 508 says backslash escapes don't have to be supported, so we
        // stick to the spec rather than guess at what a given implementation
        // does with them.
        rule python_squote_str() -> &'input str
            = "'" s:$((python_str_c() / "\"")*) "'" { s }

        rule python_dquote_str() -> &'input str
            = "\"" s:$((python_str_c() / "'")*) "\"" { s }

        rule python_str() -> marker::Value
            = s:(python_squote_str() / python_dquote_str())
              { marker::Value::Literal(s.to_owned()) }

        rule env_var(parse_extra: ParseExtra) -> marker::Value
            = var:$(
                "python_version" / "python_full_version" / "os_name"
                / "sys_platform" / "platform_release" / "platform_system"
                / "platform_version" / "platform_machine"
                / "platform_python_implementation" / "implementation_name"
                / "implementation_version" / "extra"
              )
              {?
               if ParseExtra::NotAllowed == parse_extra && var == "extra" {
                   return Err("'extra' marker is not valid in this context")
               }
               Ok(marker::Value::Variable(var.to_owned()))
              }

        rule marker_var(parse_extra: ParseExtra) -> marker::Value
            = _ v:(env_var(parse_extra) / python_str()) { v }

        rule marker_expr(parse_extra: ParseExtra) -> marker::EnvMarkerExpr
            = _ "(" m:marker(parse_extra) _ ")" { m }
              / lhs:marker_var(parse_extra) op:marker_op() rhs:marker_var(parse_extra)
              {
                  use marker::EnvMarkerExpr::Operator;
                  use CompareOp::*;
                  use marker::Op::*;
                  match op {
                      "<=" => Operator { op: Compare(LessThanEqual), lhs, rhs },
                      "<" => Operator { op: Compare(StrictlyLessThan), lhs, rhs },
                      "!=" => Operator { op: Compare(NotEqual), lhs, rhs },
                      "==" => Operator { op: Compare(Equal), lhs, rhs },
                      ">=" => Operator { op: Compare(GreaterThanEqual), lhs, rhs },
                      ">" => Operator { op: Compare(StrictlyGreaterThan), lhs, rhs },
                      "~=" => Operator { op: Compare(Compatible), lhs, rhs },
                      "in" => Operator { op: In, lhs, rhs },
                      "not in" => Operator { op: NotIn, lhs, rhs },
                      _ => unreachable!("op can't be {:?}", op),
                  }
              }

        rule marker_and(parse_extra: ParseExtra) -> marker::EnvMarkerExpr
            = lhs:marker_expr(parse_extra) _ "and" _ rhs:marker_and(parse_extra)
                 { marker::EnvMarkerExpr::And(Box::new(lhs), Box::new(rhs)) }
              / marker_expr(parse_extra)

        rule marker_or(parse_extra: ParseExtra) -> marker::EnvMarkerExpr
            = lhs:marker_and(parse_extra) _ "or" _ rhs:marker_or(parse_extra)
                 { marker::EnvMarkerExpr::Or(Box::new(lhs), Box::new(rhs)) }
              / marker_and(parse_extra)

        rule marker(parse_extra: ParseExtra) -> marker::EnvMarkerExpr
            = marker_or(parse_extra)

        rule quoted_marker(parse_extra: ParseExtra) -> marker::EnvMarkerExpr
            = ";" _ m:marker(parse_extra) { m }

        rule identifier() -> &'input str
            = $(letter_or_digit() (letter_or_digit() / "-" / "_" / ".")*)

        rule name() -> PackageName
            = n:identifier() {? n.try_into().or(Err("Error parsing package name")) }

        rule extra() -> Extra
            = e:identifier() {? e.try_into().or(Err("Error parsing extra name")) }

        rule extras() -> Vec<Extra>
            = "[" _ es:(extra() ** (_ "," _)) _ "]" { es }

        rule name_req(parse_extra: ParseExtra) -> Requirement
            = name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ specifiers:(versionspec() / "" { Vec::new() })
              _ env_marker_expr:(quoted_marker(parse_extra)?)
              {
                  Requirement {
                      name,
                      extras,
                      specifiers: Specifiers(specifiers),
                      env_marker_expr,
                  }
              }

        rule url_req(parse_extra: ParseExtra) -> Requirement
            = name:name()
              _ extras:(extras() / "" { Vec::new() })
              _ url:urlspec()
              _ ((wsp() quoted_marker(parse_extra))?)
            {
                // unreachable -- urlspec() errors out unconditionally above
                let _ = (name, extras, url);
                unreachable!()
            }

        pub rule specification(parse_extra: ParseExtra) -> Requirement
            = _ r:( url_req(parse_extra) / name_req(parse_extra) ) _ { r }
    }
}

impl Requirement {
    pub fn parse(input: &str, parse_extra: ParseExtra) -> Result<Requirement> {
        parser::specification(input, parse_extra)
            .wrap_err_with(|| format!("failed parsing requirement string {:?}", input))
    }
}

/// A requirement as written directly by a user (in a manifest, or on the command
/// line). The `extra` marker variable has no meaning here -- extras only come
/// into play when evaluating a *package's* own `requires_dist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRequirement(pub Requirement);

impl std::ops::Deref for UserRequirement {
    type Target = Requirement;
    fn deref(&self) -> &Requirement {
        &self.0
    }
}

impl Display for UserRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for UserRequirement {
    type Error = eyre::Report;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Ok(UserRequirement(Requirement::parse(input, ParseExtra::NotAllowed)?))
    }
}

try_from_str_boilerplate!(UserRequirement);

/// A requirement as it appears in a package's own metadata (`requires_dist`).
/// Here `extra == "..."` markers are meaningful, since they gate the extra's
/// additional dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequirement(pub Requirement);

impl std::ops::Deref for PackageRequirement {
    type Target = Requirement;
    fn deref(&self) -> &Requirement {
        &self.0
    }
}

impl Display for PackageRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for PackageRequirement {
    type Error = eyre::Report;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Ok(PackageRequirement(Requirement::parse(input, ParseExtra::Allowed)?))
    }
}

try_from_str_boilerplate!(PackageRequirement);

impl Serialize for PackageRequirement {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PackageRequirement {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        PackageRequirement::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

impl Serialize for UserRequirement {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserRequirement {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        UserRequirement::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_smoke() {
        let r: Requirement = parser::specification(
            "twisted[tls] >= 20, != 20.1.*; python_version >= '3'",
            ParseExtra::Allowed,
        )
        .unwrap();
        assert_eq!(r.name.as_given(), "twisted");
        assert_eq!(r.extras.len(), 1);
        assert_eq!(r.specifiers.0.len(), 2);
        assert!(r.env_marker_expr.is_some());
    }

    #[test]
    fn test_user_requirement_rejects_extra_marker() {
        assert!(UserRequirement::try_from("foo; extra == 'bar'").is_err());
        assert!(PackageRequirement::try_from("foo; extra == 'bar'").is_ok());
    }

    #[test]
    fn test_caret_tilde_constraints_parse() {
        let r: UserRequirement = "pathlib2 ^2.2".try_into().unwrap();
        assert_eq!(r.specifiers.0[0].op, CompareOp::Caret);
        assert_eq!(r.specifiers.0[0].value, "2.2");

        let r: UserRequirement = "foo <=1.9".try_into().unwrap();
        assert_eq!(r.specifiers.0[0].op, CompareOp::LessThanEqual);

        let r: UserRequirement = "foo ^2.0".try_into().unwrap();
        assert_eq!(r.specifiers.0[0].op, CompareOp::Caret);
    }

    #[test]
    fn test_caret_tilde_not_valid_marker_ops() {
        assert!(Requirement::parse("foo; python_version ^ '2.7'", ParseExtra::NotAllowed).is_err());
    }

    #[test]
    fn test_roundtrip_display() {
        let r: PackageRequirement = "foo[bar,baz]>=1.0,<2.0; python_version >= \"3\""
            .try_into()
            .unwrap();
        let s = r.to_string();
        let r2: PackageRequirement = s.as_str().try_into().unwrap();
        assert_eq!(r, r2);
    }
}
