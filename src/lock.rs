//! C6: serializes a `Blueprint` to and from a deterministic, content-hashed
//! TOML lock file.

use crate::error::ResolveError;
use crate::prelude::*;
use crate::resolve::{Blueprint, PinnedPackage, WheelResolveMetadata};

use indexmap::IndexMap;
use toml_edit::{value, Array, Document, InlineTable, Item, Table};

pub const LOCK_VERSION: i64 = 1;

/// A locked package's source, independent of its TOML representation.
/// Mirrors `vocab::DependencySource`, but `Registry` (the ordinary index
/// case) carries the exact artifact-bearing index URL rather than a source
/// name, since a lock file has to keep working even if the index config that
/// produced it changes later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockedSource {
    Registry {
        url: Url,
    },
    Git {
        url: Url,
        reference: Option<String>,
        resolved_reference: Option<String>,
        subdirectory: Option<String>,
    },
    Path {
        location: String,
        develop: bool,
    },
    Url {
        archive_url: Url,
    },
    File {
        local_archive_path: String,
    },
}

impl Display for LockedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockedSource::Registry { url } => write!(f, "{}", url),
            LockedSource::Git {
                url,
                resolved_reference,
                reference,
                ..
            } => {
                write!(f, "git+{}", url)?;
                if let Some(r) = resolved_reference.as_ref().or(reference.as_ref()) {
                    write!(f, "@{}", r)?;
                }
                Ok(())
            }
            LockedSource::Path { location, .. } => write!(f, "{}", location),
            LockedSource::Url { archive_url } => write!(f, "{}", archive_url),
            LockedSource::File { local_archive_path } => write!(f, "file://{}", local_archive_path),
        }
    }
}

/// Converts a `DependencySource` as recorded by a resolve into its locked
/// form. A git source with no `resolved_reference` yet (we have no git
/// transport to resolve a branch/tag to a commit) just carries the
/// requested reference through unresolved -- still enough to reproduce the
/// checkout, just not pinned to an exact commit.
fn locked_source_from(source: &DependencySource, registry_url: &str) -> LockedSource {
    match source {
        DependencySource::Index => LockedSource::Registry {
            url: registry_url
                .parse()
                .unwrap_or_else(|_| Url::parse("about:invalid").unwrap()),
        },
        DependencySource::Git { url, git_ref, subdir } => LockedSource::Git {
            url: url.clone(),
            reference: git_ref.as_ref().map(|r| r.to_string()),
            resolved_reference: None,
            subdirectory: subdir.clone(),
        },
        DependencySource::Path { location, develop } => LockedSource::Path {
            location: location.to_string(),
            develop: *develop,
        },
        DependencySource::Url { archive_url } => LockedSource::Url {
            archive_url: archive_url.clone(),
        },
        DependencySource::File { local_archive_path } => LockedSource::File {
            local_archive_path: local_archive_path.to_string_lossy().into_owned(),
        },
    }
}

/// A single `[[package]]` entry, independent of its TOML representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedPackage {
    pub name: PackageName,
    pub version: Version,
    pub source: LockedSource,
    /// name -> constraint string, e.g. `"requests" -> ">=2.0,<3"`.
    pub dependencies: IndexMap<PackageName, String>,
    /// Empty string means unconditional.
    pub markers: String,
    pub extras: Vec<Extra>,
    pub requires_python: Specifiers,
    /// (filename, hash), sorted by filename. Always empty for a non-registry
    /// source -- there's no index artifact list to draw it from.
    pub files: Vec<(String, ArtifactHash)>,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub packages: Vec<LockedPackage>,
    pub python_versions: Specifiers,
    pub content_hash: String,
    pub lock_version: i64,
}

/// Fingerprints the dependency-specification section of a manifest -- not
/// the whole file, just the part that changes what gets resolved. Since
/// manifest parsing itself is out of scope here, callers pass in the already
/// canonicalized requirement strings (one per direct dependency, sorted).
pub fn fingerprint_requirements<I, S>(python: &str, requirements: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut lines: Vec<String> = requirements.into_iter().map(|s| s.as_ref().to_string()).collect();
    lines.sort_unstable();

    let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
    ctx.update(python.as_bytes());
    ctx.update(b"\n");
    for line in &lines {
        ctx.update(line.as_bytes());
        ctx.update(b"\n");
    }
    let digest = ctx.finish();
    format!("sha256:{}", data_encoding::HEXLOWER.encode(digest.as_ref()))
}

/// Checks a loaded lock against the manifest it's supposed to be locking.
/// Raises `ResolveError::LockMismatch` rather than a bare bool so a `--locked`
/// caller can report exactly what didn't match.
pub fn check_fresh(lock: &Resolution, manifest_fingerprint: &str) -> Result<()> {
    if is_fresh(lock, manifest_fingerprint) {
        Ok(())
    } else {
        Err(ResolveError::LockMismatch {
            expected: manifest_fingerprint.to_string(),
            found: lock.content_hash.clone(),
        }
        .into())
    }
}

fn blueprint_to_locked(blueprint: &Blueprint) -> Vec<LockedPackage> {
    let mut packages: Vec<LockedPackage> = blueprint
        .packages
        .iter()
        .map(|(pin, meta)| locked_package_from(pin, meta, blueprint))
        .collect();
    packages.sort_unstable_by(|a, b| a.name.normalized().cmp(b.name.normalized()).then(a.version.cmp(&b.version)));
    packages
}

fn locked_package_from(pin: &PinnedPackage, meta: &WheelResolveMetadata, blueprint: &Blueprint) -> LockedPackage {
    let mut dependencies: IndexMap<PackageName, String> = IndexMap::new();
    for req in &meta.inner.requires_dist {
        dependencies.insert(req.0.name.clone(), req.0.specifiers.to_string());
    }
    dependencies.sort_keys();

    let source = match blueprint.package_sources.get(&pin.name) {
        Some(declared) => locked_source_from(declared, &meta.provenance),
        None => locked_source_from(&DependencySource::Index, &meta.provenance),
    };

    let mut files: Vec<(String, ArtifactHash)> = pin.files.clone();
    files.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.1.mode.cmp(&b.1.mode)));

    LockedPackage {
        name: pin.name.clone(),
        version: pin.version.clone(),
        source,
        dependencies,
        markers: blueprint
            .package_markers
            .get(&pin.name)
            .cloned()
            .unwrap_or_default(),
        extras: {
            let mut extras: Vec<Extra> = meta.inner.extras.iter().cloned().collect();
            extras.sort_unstable_by(|a, b| a.normalized().cmp(b.normalized()));
            extras
        },
        requires_python: meta.inner.requires_python.clone(),
        files,
    }
}

fn source_to_inline_table(source: &LockedSource) -> InlineTable {
    let mut t = InlineTable::new();
    match source {
        LockedSource::Registry { url } => {
            t.insert("kind", "registry".into());
            t.insert("url", url.to_string().into());
        }
        LockedSource::Git {
            url,
            reference,
            resolved_reference,
            subdirectory,
        } => {
            t.insert("kind", "git".into());
            t.insert("url", url.to_string().into());
            if let Some(r) = reference {
                t.insert("reference", r.as_str().into());
            }
            if let Some(r) = resolved_reference {
                t.insert("resolved_reference", r.as_str().into());
            }
            if let Some(s) = subdirectory {
                t.insert("subdirectory", s.as_str().into());
            }
        }
        LockedSource::Path { location, develop } => {
            t.insert("kind", "path".into());
            t.insert("path", location.as_str().into());
            if *develop {
                t.insert("develop", true.into());
            }
        }
        LockedSource::Url { archive_url } => {
            t.insert("kind", "url".into());
            t.insert("url", archive_url.to_string().into());
        }
        LockedSource::File { local_archive_path } => {
            t.insert("kind", "file".into());
            t.insert("path", local_archive_path.as_str().into());
        }
    }
    t
}

/// Canonical writer: fixed key order, sorted packages, sorted hash tuples.
pub fn write_lock(blueprint: &Blueprint, python_versions: &Specifiers, content_hash: &str) -> String {
    let packages = blueprint_to_locked(blueprint);

    let mut doc = Document::new();

    let mut package_array = toml_edit::ArrayOfTables::new();
    for pkg in &packages {
        let mut table = Table::new();
        table["name"] = value(pkg.name.normalized());
        table["version"] = value(pkg.version.to_string());
        table["source"] = Item::Value(toml_edit::Value::InlineTable(source_to_inline_table(&pkg.source)));

        let mut deps = InlineTable::new();
        for (name, constraint) in &pkg.dependencies {
            deps.insert(name.normalized(), constraint.as_str().into());
        }
        table["dependencies"] = Item::Value(toml_edit::Value::InlineTable(deps));

        table["markers"] = value(pkg.markers.as_str());

        if !pkg.extras.is_empty() {
            let mut arr = Array::new();
            for extra in &pkg.extras {
                arr.push(extra.normalized());
            }
            table["extras"] = value(arr);
        }

        table["python-versions"] = value(pkg.requires_python.to_string());

        let mut files = Array::new();
        for (name, hash) in &pkg.files {
            let mut file = toml_edit::InlineTable::new();
            file.insert("name", name.as_str().into());
            file.insert("hash", hash.to_string().into());
            files.push(toml_edit::Value::InlineTable(file));
        }
        table["files"] = value(files);

        package_array.push(table);
    }
    doc["package"] = Item::ArrayOfTables(package_array);

    let mut metadata = Table::new();
    metadata["python-versions"] = value(python_versions.to_string());
    metadata["content-hash"] = value(content_hash);
    metadata["lock-version"] = value(LOCK_VERSION);
    doc["metadata"] = Item::Table(metadata);

    let mut files_table = Table::new();
    for pkg in &packages {
        let mut arr = Array::new();
        for (name, hash) in &pkg.files {
            let mut file = toml_edit::InlineTable::new();
            file.insert("name", name.as_str().into());
            file.insert("hash", hash.to_string().into());
            arr.push(toml_edit::Value::InlineTable(file));
        }
        files_table[pkg.name.normalized()] = value(arr);
    }
    doc["metadata"]["files"] = Item::Table(files_table);

    doc.to_string()
}

#[derive(Debug, Deserialize)]
struct RawSource {
    kind: String,
    url: Option<String>,
    path: Option<String>,
    #[serde(default)]
    develop: bool,
    reference: Option<String>,
    resolved_reference: Option<String>,
    subdirectory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    name: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawPackage {
    name: String,
    version: String,
    source: RawSource,
    #[serde(default)]
    dependencies: IndexMap<String, String>,
    #[serde(default)]
    markers: String,
    #[serde(default)]
    extras: Vec<String>,
    python_versions: String,
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawMetadata {
    python_versions: String,
    content_hash: String,
    lock_version: i64,
}

#[derive(Debug, Deserialize)]
struct RawLock {
    #[serde(default)]
    package: Vec<RawPackage>,
    metadata: RawMetadata,
}

fn raw_source_to_locked(name: &str, raw: RawSource) -> Result<LockedSource> {
    Ok(match raw.kind.as_str() {
        "registry" => LockedSource::Registry {
            url: raw
                .url
                .ok_or_else(|| eyre!("registry source for {} is missing a url", name))?
                .parse()?,
        },
        "git" => LockedSource::Git {
            url: raw
                .url
                .ok_or_else(|| eyre!("git source for {} is missing a url", name))?
                .parse()?,
            reference: raw.reference,
            resolved_reference: raw.resolved_reference,
            subdirectory: raw.subdirectory,
        },
        "path" => LockedSource::Path {
            location: raw
                .path
                .ok_or_else(|| eyre!("path source for {} is missing a path", name))?,
            develop: raw.develop,
        },
        "url" => LockedSource::Url {
            archive_url: raw
                .url
                .ok_or_else(|| eyre!("url source for {} is missing a url", name))?
                .parse()?,
        },
        "file" => LockedSource::File {
            local_archive_path: raw
                .path
                .ok_or_else(|| eyre!("file source for {} is missing a path", name))?,
        },
        other => bail!("unsupported lock source kind {:?} for {}", other, name),
    })
}

/// Parses a lock file back into a `Resolution`. Ignores `[metadata.files]`
/// entirely -- it's a duplicate of the per-package `files` list, kept only
/// for tools that don't want to walk `[[package]]`.
pub fn read_lock(contents: &str) -> Result<Resolution> {
    let raw: RawLock = toml_edit::de::from_str(contents)?;

    if raw.metadata.lock_version > LOCK_VERSION {
        bail!(
            "lock file is lock-version {}, but this build only understands up to {}",
            raw.metadata.lock_version,
            LOCK_VERSION
        );
    }

    let mut packages = Vec::with_capacity(raw.package.len());
    for p in raw.package {
        let source = raw_source_to_locked(&p.name, p.source)?;

        let mut dependencies = IndexMap::new();
        for (name, constraint) in p.dependencies {
            dependencies.insert(name.as_str().try_into()?, constraint);
        }

        let mut extras = Vec::new();
        for e in p.extras {
            extras.push(e.as_str().try_into()?);
        }

        let mut files = Vec::new();
        for f in p.files {
            files.push((f.name, f.hash.as_str().try_into()?));
        }

        packages.push(LockedPackage {
            name: p.name.as_str().try_into()?,
            version: p.version.as_str().try_into()?,
            source,
            dependencies,
            markers: p.markers,
            extras,
            requires_python: p.python_versions.as_str().try_into()?,
            files,
        });
    }

    Ok(Resolution {
        packages,
        python_versions: raw.metadata.python_versions.as_str().try_into()?,
        content_hash: raw.metadata.content_hash,
        lock_version: raw.metadata.lock_version,
    })
}

/// Recomputes the manifest fingerprint and compares it against what's
/// recorded in the lock. `true` means the lock is still valid for this
/// manifest's dependency specification.
pub fn is_fresh(lock: &Resolution, manifest_fingerprint: &str) -> bool {
    lock.content_hash == manifest_fingerprint
}

#[derive(Debug, Clone)]
pub struct InstallStep {
    pub name: PackageName,
    pub version: Version,
    pub source: LockedSource,
    pub files: Vec<(String, ArtifactHash)>,
}

/// Evaluates each lock entry's marker against `env`, then returns the subset
/// that should be installed, in topological order (leaf dependencies
/// first) -- packages with no remaining uninstalled dependency come before
/// the packages that depend on them.
pub fn installer_plan(lock: &Resolution, env: &Environment) -> Result<Vec<InstallStep>> {
    let mut wanted: IndexMap<PackageName, &LockedPackage> = IndexMap::new();
    for pkg in &lock.packages {
        if pkg.markers.is_empty() {
            wanted.insert(pkg.name.clone(), pkg);
            continue;
        }
        let req = Requirement::parse(&format!("x; {}", pkg.markers), ParseExtra::NotAllowed)?;
        let expr = req
            .env_marker_expr
            .ok_or_else(|| eyre!("lock entry for {} has an empty markers string", pkg.name.as_given()))?;
        if expr.eval(env)? {
            wanted.insert(pkg.name.clone(), pkg);
        }
    }

    // Kahn's algorithm over the dependency edges restricted to `wanted`,
    // breaking ties by canonical name so the plan is deterministic.
    // indegree[p] = number of wanted dependencies p itself has, not yet emitted
    let mut indegree: IndexMap<PackageName, usize> = IndexMap::new();
    for pkg in wanted.values() {
        let count = pkg
            .dependencies
            .keys()
            .filter(|dep| wanted.contains_key(*dep))
            .count();
        indegree.insert(pkg.name.clone(), count);
    }

    let mut plan = Vec::with_capacity(wanted.len());
    let mut remaining = wanted.clone();
    while !remaining.is_empty() {
        let mut ready: Vec<PackageName> = remaining
            .keys()
            .filter(|name| indegree.get(*name).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        if ready.is_empty() {
            bail!("dependency cycle detected among: {:?}", remaining.keys().collect::<Vec<_>>());
        }
        ready.sort_unstable_by(|a, b| a.normalized().cmp(b.normalized()));

        for name in ready {
            let pkg = remaining.remove(&name).unwrap();
            plan.push(InstallStep {
                name: pkg.name.clone(),
                version: pkg.version.clone(),
                source: pkg.source.clone(),
                files: pkg.files.clone(),
            });
            for other in remaining.values() {
                if other.dependencies.contains_key(&name) {
                    if let Some(count) = indegree.get_mut(&other.name) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = fingerprint_requirements("3.11", ["foo>=1", "bar"]);
        let b = fingerprint_requirements("3.11", ["bar", "foo>=1"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_changes_with_python() {
        let a = fingerprint_requirements("3.11", ["foo>=1"]);
        let b = fingerprint_requirements("3.12", ["foo>=1"]);
        assert_ne!(a, b);
    }

    fn locked(name: &str, deps: &[&str]) -> LockedPackage {
        let mut dependencies = IndexMap::new();
        for dep in deps {
            dependencies.insert((*dep).try_into().unwrap(), "".to_string());
        }
        LockedPackage {
            name: name.try_into().unwrap(),
            version: "1.0".try_into().unwrap(),
            source: LockedSource::Registry {
                url: "https://example.org/simple/".parse().unwrap(),
            },
            dependencies,
            markers: String::new(),
            extras: Vec::new(),
            requires_python: Specifiers(Vec::new()),
            files: Vec::new(),
        }
    }

    fn resolution(packages: Vec<LockedPackage>) -> Resolution {
        Resolution {
            packages,
            python_versions: Specifiers(Vec::new()),
            content_hash: "sha256:deadbeef".to_string(),
            lock_version: LOCK_VERSION,
        }
    }

    fn empty_env() -> Environment {
        Environment {
            marker_values: HashMap::new(),
            compatible_tags: Vec::new(),
        }
    }

    #[test]
    fn test_installer_plan_topological_order() {
        let lock = resolution(vec![
            locked("top", &["mid"]),
            locked("leaf", &[]),
            locked("mid", &["leaf"]),
        ]);
        let plan = installer_plan(&lock, &empty_env()).unwrap();
        let order: Vec<&str> = plan.iter().map(|s| s.name.as_given()).collect();
        assert_eq!(order, vec!["leaf", "mid", "top"]);
    }

    #[test]
    fn test_installer_plan_detects_cycle() {
        let lock = resolution(vec![locked("a", &["b"]), locked("b", &["a"])]);
        assert!(installer_plan(&lock, &empty_env()).is_err());
    }

    #[test]
    fn test_check_fresh_raises_lock_mismatch() {
        let lock = resolution(vec![]);
        assert!(check_fresh(&lock, "sha256:deadbeef").is_ok());
        let err = check_fresh(&lock, "sha256:somethingelse").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ResolveError>(),
            Some(ResolveError::LockMismatch { .. })
        ));
    }

    #[test]
    fn test_locked_source_round_trips_through_inline_table() {
        let git = LockedSource::Git {
            url: "https://example.org/mylib.git".parse().unwrap(),
            reference: Some("v1.0".to_string()),
            resolved_reference: None,
            subdirectory: None,
        };
        let table = source_to_inline_table(&git);
        assert_eq!(table.get("kind").unwrap().as_str(), Some("git"));
        assert_eq!(table.get("reference").unwrap().as_str(), Some("v1.0"));
    }
}
