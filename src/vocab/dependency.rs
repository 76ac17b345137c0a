//! C3: the dependency source model. `UserRequirement`/`PackageRequirement`
//! (see `requirement.rs`) cover the overwhelmingly common case -- a name, a
//! version constraint, and a marker, all resolved against a package index --
//! but spec.md's data model also allows a direct dependency to pin to a git
//! checkout, a local path, or a bare archive URL instead. Those four variants
//! have no fetch path in this crate (no git/filesystem/direct-download
//! transport lives in `package_db`), so they resolve as a single pinned
//! placeholder with no transitive dependencies of their own rather than
//! being silently dropped or rejected -- see `resolve::ResPkg::Direct`.

use crate::prelude::*;

/// Where a dependency's artifacts come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DependencySource {
    /// Looked up on a configured package index, same as any ordinary
    /// requirement. The default.
    Index,
    /// A git repository, optionally pinned to a branch/tag/rev and/or a
    /// subdirectory within it.
    Git {
        url: Url,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        git_ref: Option<GitRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdir: Option<String>,
    },
    /// A local filesystem path, either a source tree or a built artifact.
    Path {
        location: PathLocation,
        /// Editable/develop install -- doesn't affect resolution, only the
        /// eventual install step, but is part of the manifest-level
        /// declaration so it round-trips through the lock file.
        #[serde(default)]
        develop: bool,
    },
    /// A bare URL to a downloadable sdist or wheel, outside any index.
    Url { archive_url: Url },
    /// A local archive file (sdist or wheel) outside any index.
    File { local_archive_path: std::path::PathBuf },
}

impl Default for DependencySource {
    fn default() -> Self {
        DependencySource::Index
    }
}

impl DependencySource {
    /// A human-readable locator for this source, used the same way
    /// `WheelResolveMetadata.provenance` is used for index-sourced packages.
    pub fn provenance(&self) -> String {
        match self {
            DependencySource::Index => "<index>".to_string(),
            DependencySource::Git { url, git_ref, .. } => match git_ref {
                Some(r) => format!("git+{}@{}", url, r),
                None => format!("git+{}", url),
            },
            DependencySource::Path { location, .. } => location.to_string(),
            DependencySource::Url { archive_url } => archive_url.to_string(),
            DependencySource::File { local_archive_path } => {
                format!("file://{}", local_archive_path.display())
            }
        }
    }
}

/// A git ref to check out. Exactly one of these, same as `pip`'s
/// `git+url@ref` syntax allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitRef {
    Branch(String),
    Tag(String),
    Rev(String),
}

impl Display for GitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitRef::Branch(b) => write!(f, "{}", b),
            GitRef::Tag(t) => write!(f, "{}", t),
            GitRef::Rev(r) => write!(f, "{}", r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PathLocation {
    Dir(std::path::PathBuf),
    File(std::path::PathBuf),
}

impl Display for PathLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathLocation::Dir(p) | PathLocation::File(p) => {
                write!(f, "file://{}", p.display())
            }
        }
    }
}

/// A single direct dependency declaration, as it appears in a `Brief`.
/// Unlike `UserRequirement`, this is never parsed from a PEP 508 string --
/// manifest parsing is out of scope here (see spec.md's Non-goals), so a
/// `Brief`'s caller is expected to hand over already-decomposed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: PackageName,
    #[serde(default)]
    pub source: DependencySource,
    /// Ignored for every `source` other than `Index` -- there's no version
    /// axis to constrain on a git checkout or a bare archive URL; whatever
    /// is at the pinned ref/path/URL is what gets used.
    #[serde(default)]
    pub constraint: Specifiers,
    #[serde(default)]
    pub extras: Vec<Extra>,
    /// Declared but inactive per se -- this crate's data model has no
    /// "feature" or "extra-on-the-root-package" activation mechanism that
    /// would ever turn an optional dependency on, so these are recorded
    /// (round-tripping through a lock file that reads them back) but never
    /// themselves pulled into a resolve. See DESIGN.md.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub allow_prereleases: bool,
    /// A per-dependency Python constraint (e.g. Poetry's `python = "~2.7"`),
    /// distinct from `Brief.python`, which constrains every package
    /// uniformly. Folded into a marker on the virtual `python` package --
    /// see `python_marker`.
    #[serde(default, skip_serializing_if = "Specifiers::is_empty")]
    pub python: Specifiers,
    /// Pins this dependency to one specifically-named configured source,
    /// bypassing the normal primary/secondary/supplemental priority order
    /// (spec.md's C4 source-priority classes) -- the only way to reach a
    /// source declared with `SourcePriority::Explicit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

impl Dependency {
    /// The ordinary index-sourced requirement this dependency feeds into the
    /// resolver, with its `python` field desugared into a marker. Only
    /// meaningful when `source` is `DependencySource::Index` -- the other
    /// variants resolve via `resolve::ResPkg::Direct` instead and never call
    /// this.
    pub fn to_requirement(&self) -> Result<UserRequirement> {
        Ok(UserRequirement(Requirement {
            name: self.name.clone(),
            extras: self.extras.clone(),
            specifiers: self.constraint.clone(),
            env_marker_expr: self.python_marker()?,
        }))
    }

    /// Desugars `self.python` into a marker on `python_version`, ANDing
    /// together one clause per specifier. Ordinary PEP 440 comparisons map
    /// directly onto the matching marker operator; `^`/`~` have no single
    /// marker-grammar equivalent, so they expand via `Specifier::to_ranges`
    /// into an inclusive lower bound and (when finite) an exclusive upper
    /// bound, ORed across every disjoint range the constraint covers.
    pub fn python_marker(&self) -> Result<Option<marker::EnvMarkerExpr>> {
        use marker::{EnvMarkerExpr, Op, Value};

        fn compare(op: CompareOp, value: String) -> EnvMarkerExpr {
            EnvMarkerExpr::Operator {
                op: Op::Compare(op),
                lhs: Value::Variable("python_version".to_string()),
                rhs: Value::Literal(value),
            }
        }

        let mut expr: Option<EnvMarkerExpr> = None;
        for spec in &self.python.0 {
            let clause = match spec.op {
                CompareOp::Caret | CompareOp::Tilde => {
                    let mut clause: Option<EnvMarkerExpr> = None;
                    for range in spec.to_ranges()? {
                        let mut this = compare(CompareOp::GreaterThanEqual, range.start.to_string());
                        if range.end < *VERSION_INFINITY {
                            this = EnvMarkerExpr::And(
                                Box::new(this),
                                Box::new(compare(CompareOp::StrictlyLessThan, range.end.to_string())),
                            );
                        }
                        clause = Some(match clause {
                            None => this,
                            Some(prev) => EnvMarkerExpr::Or(Box::new(prev), Box::new(this)),
                        });
                    }
                    clause.ok_or_else(|| {
                        eyre!("python constraint {} has no satisfiable range", spec)
                    })?
                }
                op => compare(op, spec.value.clone()),
            };
            expr = Some(match expr {
                None => clause,
                Some(prev) => EnvMarkerExpr::And(Box::new(prev), Box::new(clause)),
            });
        }
        Ok(expr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_index_dependency_round_trips_as_requirement() {
        let dep = Dependency {
            name: "requests".try_into().unwrap(),
            source: DependencySource::Index,
            constraint: ">=2.0".try_into().unwrap(),
            extras: vec![],
            optional: false,
            allow_prereleases: false,
            python: Specifiers::any(),
            source_name: None,
        };
        let req = dep.to_requirement().unwrap();
        assert_eq!(req.0.name.normalized(), "requests");
        assert!(req.0.env_marker_expr.is_none());
    }

    #[test]
    fn test_ordinary_python_field_becomes_single_clause_marker() {
        let dep = Dependency {
            name: "foo".try_into().unwrap(),
            source: DependencySource::Index,
            constraint: Specifiers::any(),
            extras: vec![],
            optional: false,
            allow_prereleases: false,
            python: ">=3.8".try_into().unwrap(),
            source_name: None,
        };
        let expr = dep.python_marker().unwrap().unwrap();
        insta::assert_snapshot!(expr.to_string(), @r###"python_version >= "3.8""###);
    }

    #[test]
    fn test_caret_python_field_expands_to_bounded_range() {
        let dep = Dependency {
            name: "foo".try_into().unwrap(),
            source: DependencySource::Index,
            constraint: Specifiers::any(),
            extras: vec![],
            optional: false,
            allow_prereleases: false,
            python: "^2.7".try_into().unwrap(),
            source_name: None,
        };
        let rendered = dep.python_marker().unwrap().unwrap().to_string();
        assert!(rendered.contains(r#"python_version >= "2.7""#));
        assert!(rendered.contains("python_version <"));
    }

    #[test]
    fn test_non_index_dependency_has_provenance_without_fetching() {
        let dep = Dependency {
            name: "mylib".try_into().unwrap(),
            source: DependencySource::Git {
                url: "https://example.org/mylib.git".parse().unwrap(),
                git_ref: Some(GitRef::Tag("v1.0".to_string())),
                subdir: None,
            },
            constraint: Specifiers::any(),
            extras: vec![],
            optional: false,
            allow_prereleases: false,
            python: Specifiers::any(),
            source_name: None,
        };
        assert_eq!(
            dep.source.provenance(),
            "git+https://example.org/mylib.git@v1.0"
        );
    }
}
