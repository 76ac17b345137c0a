use crate::error::ResolveError;
use crate::package_db::{ArtifactInfo, PackageDB, PackageMetadata};
use crate::platform_tags::{Platform, WheelPlatform};
use crate::prelude::*;
use elsa::FrozenMap;
use pubgrub::range::Range;
use pubgrub::report::DerivationTree;
use pubgrub::report::Reporter;
use pubgrub::solver::{Dependencies, DependencyConstraints};
use std::borrow::Borrow;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "AllowPreSerdeHelper", into = "AllowPreSerdeHelper")]
pub enum AllowPre {
    Some(HashSet<PackageName>),
    All,
}

impl AllowPre {
    pub fn allow_pre_for(&self, package: &PackageName) -> bool {
        match &self {
            AllowPre::Some(pkgs) => pkgs.contains(package),
            AllowPre::All => true,
        }
    }
}

impl Default for AllowPre {
    fn default() -> Self {
        AllowPre::Some(HashSet::new())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AllowPreSerdeHelper<'a> {
    Some(HashSet<PackageName>),
    Other(&'a str),
}

impl<'a> TryFrom<AllowPreSerdeHelper<'a>> for AllowPre {
    type Error = eyre::Report;

    fn try_from(value: AllowPreSerdeHelper) -> Result<Self, Self::Error> {
        match value {
            AllowPreSerdeHelper::Some(pkgs) => Ok(AllowPre::Some(pkgs)),
            AllowPreSerdeHelper::Other(value) => {
                if value == ":all:" {
                    Ok(AllowPre::All)
                } else {
                    bail!("expected a list of packages or the magic string ':all:'")
                }
            }
        }
    }
}

impl<'a> From<AllowPre> for AllowPreSerdeHelper<'a> {
    fn from(value: AllowPre) -> Self {
        match value {
            AllowPre::Some(pkgs) => AllowPreSerdeHelper::Some(pkgs),
            AllowPre::All => AllowPreSerdeHelper::Other(":all:"),
        }
    }
}

fn allow_pre_is_empty(value: &AllowPre) -> bool {
    if let AllowPre::Some(pkgs) = value {
        pkgs.is_empty()
    } else {
        false
    }
}

/// A cooperative cancellation flag, checked at every resolver suspension
/// point (the start of each `DependencyProvider` callback). Cloning shares
/// the same underlying flag, so a caller can hold one end (e.g. a signal
/// handler) while the resolve holds the other.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The default whole-resolve soft timeout.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Knobs that don't change what a resolve computes, only whether it's
/// allowed to keep computing: a cancellation flag and a wall-clock deadline,
/// both checked at every resolver suspension point and raised as
/// `ResolveError::Cancelled`/`ResolveError::TimedOut`.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub cancellation: CancellationToken,
    pub deadline: Option<Instant>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            cancellation: CancellationToken::new(),
            deadline: Some(Instant::now() + DEFAULT_RESOLVE_TIMEOUT),
        }
    }
}

/// A high-level description of a set of packages a user would like to be able
/// to install together. Doesn't necessarily have to be what the user types in
/// exactly, but has to represent their intentions, and you have to be able to
/// resolve the whole structure without looking at anything but a package
/// index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brief {
    /// Constrains the single virtual "python" package (see `ResPkg::Python`)
    /// that every other package's `Requires-Python` also depends on.
    pub python: RequiresPython,
    pub dependencies: Vec<Dependency>,
    #[serde(skip_serializing_if = "allow_pre_is_empty")]
    pub allow_pre: AllowPre,
    // XX TODO
    //pub constraints: Vec<UserRequirement>,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PinnedPackage {
    pub name: PackageName,
    pub version: Version,
    /// (artifact filename, hash) for every artifact available for this
    /// pinned version -- enough for the lock file's per-package `files` list
    /// without re-querying the index. Always empty for a non-`Index` source,
    /// which has no index artifacts to enumerate.
    pub files: Vec<(String, ArtifactHash)>,
}

impl Display for PinnedPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} (with {} known artifacts)",
            self.name.as_given(),
            self.version,
            self.files.len()
        )
    }
}

struct VersionHints<'a>(HashMap<&'a PackageName, (&'a Version, HashSet<&'a ArtifactHash>)>);

impl<'a> VersionHints<'a> {
    fn new() -> VersionHints<'a> {
        VersionHints(HashMap::new())
    }

    fn add_pinned(&mut self, pin: &'a PinnedPackage) {
        self.0.insert(
            &pin.name,
            (&pin.version, pin.files.iter().map(|(_, h)| h).collect()),
        );
    }

    fn from(blueprint: &'a Blueprint) -> VersionHints<'a> {
        let mut hints = VersionHints::new();
        for (pin, _) in &blueprint.packages {
            hints.add_pinned(pin);
        }
        hints
    }
}

/// The subset of a package's dependency metadata that the resolver actually
/// used, paired with where it came from.
///
/// As part of resolving a Brief -> a Blueprint, for each package+version, we
/// need the dependency metadata, which we get from some specific artifact
/// (the best-matching wheel, or an sdist fallback). But we want the Blueprint
/// to be usable across multiple platforms, and a different install might pick
/// a *different* artifact for that package+version. That artifact's metadata
/// *should* always agree -- but if it doesn't, we want to detect it and give a
/// diagnostic rather than silently install something that wasn't resolved, so
/// we record the resolver-relevant metadata we actually used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WheelResolveMetadata {
    pub provenance: String,
    #[serde(flatten)]
    pub inner: WheelResolveMetadataInner,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WheelResolveMetadataInner {
    pub requires_dist: Vec<PackageRequirement>,
    pub requires_python: Specifiers,
    pub extras: HashSet<Extra>,
}

impl From<&PackageMetadata> for WheelResolveMetadataInner {
    fn from(m: &PackageMetadata) -> WheelResolveMetadataInner {
        WheelResolveMetadataInner {
            requires_dist: m.requires_dist.clone(),
            requires_python: m.requires_python.clone(),
            extras: m.extras.clone(),
        }
    }
}

impl WheelResolveMetadata {
    pub fn from(ai: &ArtifactInfo, m: &PackageMetadata) -> WheelResolveMetadata {
        WheelResolveMetadata {
            provenance: ai.url.to_string(),
            inner: m.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Blueprint {
    pub packages: Vec<(PinnedPackage, WheelResolveMetadata)>,
    #[serde(serialize_with = "serialize_marker_exprs")]
    pub marker_expressions: HashMap<marker::StandaloneMarkerExpr, bool>,
    /// The marker expression each package needs to be re-evaluated against at
    /// install time, if any dependent's requirement on it was conditional.
    /// Feeds the lock file's per-package `markers` field. Absent entries are
    /// unconditional.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub package_markers: HashMap<PackageName, String>,
    /// The declared source of every package that didn't come from an index
    /// (git/path/url/file) -- absent entries are ordinary index packages.
    /// Feeds the lock file's per-package `source` table.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub package_sources: HashMap<PackageName, DependencySource>,
}

fn serialize_marker_exprs<S>(
    marker_exprs: &HashMap<marker::StandaloneMarkerExpr, bool>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let mut stringized = marker_exprs
        .iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<Vec<_>>();
    stringized.sort_unstable();
    s.collect_map(stringized.into_iter())
}

impl Display for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (pin, em) in &self.packages {
            writeln!(f, "{} (metadata from {})", pin, em.provenance)?;
        }
        Ok(())
    }
}

fn pinned(
    db: &PackageDB,
    name: PackageName,
    version: Version,
    source_name: Option<&str>,
) -> Result<PinnedPackage> {
    let files = db
        .artifacts_for_version(&name, &version, source_name)?
        .iter()
        .filter_map(|ai| ai.hash.clone().map(|hash| (ai.name.to_string(), hash)))
        .collect::<Vec<_>>();
    Ok(PinnedPackage {
        name,
        version,
        files,
    })
}

impl Brief {
    pub fn resolve(
        &self,
        db: &PackageDB,
        env: &Environment,
        like: Option<&Blueprint>,
        options: &ResolveOptions,
    ) -> Result<Blueprint> {
        let version_hints = like
            .map(VersionHints::from)
            .unwrap_or_else(VersionHints::new);
        let platform = WheelPlatform::new(env.compatible_tags.iter().cloned());
        let (packages, marker_exprs, package_markers, package_sources) =
            resolve_packages(db, self, env, &platform, &version_hints, options)?;
        Ok(Blueprint {
            packages,
            marker_expressions: marker_exprs,
            package_markers,
            package_sources,
        })
    }
}

struct PubgrubState<'a> {
    // These are inputs to the resolve process
    db: &'a PackageDB,
    env: &'a Environment,
    platform: &'a WheelPlatform,
    brief: &'a Brief,
    version_hints: &'a VersionHints<'a>,
    cancellation: &'a CancellationToken,
    deadline: Option<Instant>,
    /// Which named source (if any) each package was pinned to by a direct
    /// dependency's `source_name`. Assumes a package sees a consistent pin
    /// across one resolve -- the same scope decision `PackageDB` makes for
    /// its own per-`(package, source_name)` cache.
    source_pins: HashMap<PackageName, String>,

    marker_exprs: RefCell<HashMap<marker::StandaloneMarkerExpr, bool>>,
    // The marker expression (if any) under which each package was pulled in,
    // across every dependent that required it -- OR'd together, so the lock
    // file can be re-evaluated against a *different* environment later
    // without losing any branch. `None` means some dependent required it
    // unconditionally.
    package_markers: RefCell<HashMap<PackageName, Option<marker::EnvMarkerExpr>>>,
    // The declared source of each `ResPkg::Direct` package encountered so far.
    direct_sources: RefCell<HashMap<PackageName, DependencySource>>,
    python_full_version: Version,
    // record of the metadata we used, so we can record it and validate it later when
    // using the pins
    expected_metadata: FrozenMap<(PackageName, Version), Box<WheelResolveMetadata>>,
    // These are sorted with most-preferred first.
    versions: FrozenMap<PackageName, Vec<&'a Version>>,
}

fn get_or_fill<'a, 'b, K, V, F>(map: &'a FrozenMap<K, V>, key: &'b K, f: F) -> Result<&'a V::Target>
where
    K: Eq + std::hash::Hash + Clone,
    F: FnOnce() -> Result<V>,
    V: stable_deref_trait::StableDeref,
{
    if let Some(v) = map.get(key) {
        Ok(v)
    } else {
        Ok(map.insert(key.to_owned(), f()?))
    }
}

fn fetch_and_sort_versions<'a>(
    db: &'a PackageDB,
    brief: &Brief,
    package: &PackageName,
    source_name: Option<&str>,
    python_version: Option<&Version>,
    hints: &VersionHints,
) -> Result<Vec<&'a Version>> {
    let artifacts = db.available_artifacts_for(package, source_name)?;
    let mut versions = Vec::new();
    let all_pre = artifacts.iter().all(|(version, _)| version.is_prerelease());
    let allow_prerelease = all_pre || brief.allow_pre.allow_pre_for(package);
    let (version_hint, hash_hints) = match hints.0.get(&package) {
        Some((version, hash)) => (Some(version), Some(hash)),
        None => (None, None),
    };

    for (version, ais) in artifacts.iter() {
        if !allow_prerelease && version.is_prerelease() {
            continue;
        }
        for ai in ais {
            if ai.yanked.yanked {
                let is_pinned = match (&hash_hints, &ai.hash) {
                    (Some(hints), Some(hash)) => hints.contains(&hash),
                    _ => false,
                };
                if !is_pinned {
                    continue;
                }
            }
            if let (Some(python_version), Some(requires_python)) =
                (python_version, &ai.requires_python)
            {
                let requires_python: Specifiers = requires_python.parse()?;
                if !requires_python.satisfied_by(python_version)? {
                    continue;
                }
            }
            // we found a valid artifact for this version. So this version is valid, and
            // we can save it and move on to the next.
            versions.push(version);
            break;
        }
    }
    if let Some(version_hint) = version_hint {
        // if we have a version hint, then our preference ordering is:
        // - the hinted version
        // - the versions greater than the hinted version, in order from smallest to
        //   largest (so if our hint is 1.1, we prefer 1.2 over 1.3)
        // - the versions smaller than our hinted version, from largest to smallest (so
        //   if our hint is 1.1, we prefer 1.0 over 0.9).
        versions.sort_unstable_by_key(|v| {
            if v >= version_hint {
                (None, Some(*v))
            } else {
                (Some(std::cmp::Reverse(*v)), None)
            }
        });
    } else {
        versions.sort_unstable_by_key(|v| std::cmp::Reverse(*v));
    }

    // sort from highest to lowest
    versions.sort_unstable_by_key(|v| {
        (
            // false sorts before true, so version_hint = v sorts first
            version_hint != Some(v),
            // and otherwise, high versions come before low versions
            std::cmp::Reverse(*v),
        )
    });

    Ok(versions)
}

impl<'a> PubgrubState<'a> {
    /// Checked at the top of every `DependencyProvider` callback -- the only
    /// suspension points this resolve loop has.
    fn check_suspension_point(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(ResolveError::Cancelled.into());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ResolveError::TimedOut.into());
            }
        }
        Ok(())
    }

    fn metadata(&self, release: &(PackageName, Version)) -> Result<&WheelResolveMetadataInner> {
        Ok(&get_or_fill(&self.expected_metadata, release, || {
            let source_name = self.source_pins.get(&release.0).map(|s| s.as_str());
            let ais = self
                .db
                .artifacts_for_version(&release.0, &release.1, source_name)?;
            let (ai, metadata) = self.db.get_metadata(&release.0, &release.1, ais, self.platform)?;
            Ok(Box::new(WheelResolveMetadata::from(ai, &metadata)))
        })?
        .inner)
    }

    fn versions(&self, package: &PackageName) -> Result<&[&Version]> {
        get_or_fill(&self.versions, package, || {
            fetch_and_sort_versions(
                self.db,
                self.brief,
                package,
                self.source_pins.get(package).map(|s| s.as_str()),
                Some(&self.python_full_version),
                self.version_hints,
            )
        })
    }
}

fn resolve_packages(
    db: &PackageDB,
    brief: &Brief,
    env: &Environment,
    platform: &WheelPlatform,
    version_hints: &VersionHints,
    options: &ResolveOptions,
) -> Result<(
    Vec<(PinnedPackage, WheelResolveMetadata)>,
    HashMap<marker::StandaloneMarkerExpr, bool>,
    HashMap<PackageName, String>,
    HashMap<PackageName, DependencySource>,
)> {
    let source_pins: HashMap<PackageName, String> = brief
        .dependencies
        .iter()
        .filter_map(|dep| dep.source_name.as_ref().map(|sn| (dep.name.clone(), sn.clone())))
        .collect();

    let state = PubgrubState {
        db,
        env,
        platform,
        brief,
        version_hints,
        cancellation: &options.cancellation,
        deadline: options.deadline,
        source_pins,
        marker_exprs: Default::default(),
        package_markers: Default::default(),
        direct_sources: Default::default(),
        python_full_version: env.python_full_version()?,
        expected_metadata: Default::default(),
        versions: Default::default(),
    };

    // XX this error reporting is terrible. It's a hack to work around PubGrubError not
    // being convertible to eyre::Report, because eyre::Report requires Send.
    let result = pubgrub::solver::resolve(&state, ResPkg::Root, ROOT_VERSION.clone());

    use pubgrub::error::PubGrubError::*;

    match result {
        Ok(solution) => {
            let mut pins = Vec::new();
            let mut package_sources = HashMap::new();
            for (pkg, v) in solution {
                match pkg {
                    ResPkg::Package(name, None) => {
                        let source_name = state.source_pins.get(&name).cloned();
                        pins.push((
                            pinned(db, name.clone(), v.clone(), source_name.as_deref())?,
                            state.expected_metadata.get(&(name, v)).unwrap().clone(),
                        ));
                    }
                    ResPkg::Direct(name) => {
                        let source = state
                            .direct_sources
                            .borrow()
                            .get(&name)
                            .cloned()
                            .unwrap_or(DependencySource::Index);
                        let provenance = source.provenance();
                        pins.push((
                            PinnedPackage {
                                name: name.clone(),
                                version: v,
                                files: Vec::new(),
                            },
                            WheelResolveMetadata {
                                provenance,
                                inner: WheelResolveMetadataInner {
                                    requires_dist: Vec::new(),
                                    requires_python: Specifiers::any(),
                                    extras: HashSet::new(),
                                },
                            },
                        ));
                        package_sources.insert(name, source);
                    }
                    _ => {}
                }
            }
            let package_markers = state
                .package_markers
                .into_inner()
                .into_iter()
                .filter_map(|(name, expr)| expr.map(|expr| (name, expr.to_string())))
                .collect();
            Ok((
                pins,
                state.marker_exprs.into_inner(),
                package_markers,
                package_sources,
            ))
        }
        Err(err) => Err(match err {
            ErrorRetrievingDependencies {
                package,
                version,
                source,
            } => {
                context!("fetching dependencies of {} v{}", package, version);
                eyre!("{}", source)
            }
            ErrorChoosingPackageVersion(boxed_err) => {
                // TODO: this suuuucks... the dyn Error here is really an
                // eyre::Report. But pubgrub-rs erases the type, and eyre can't
                // wrap a plain dyn Error (it needs + Send + Sync as well), so
                // we have no choice except to stringify.
                eyre!("Error while choosing next package version to examine:\n{boxed_err:?}")
            }
            ErrorInShouldCancel(boxed_err) => eyre!("{}", boxed_err.to_string()),
            Failure(s) => eyre!("{}", s),
            // XX Maybe the empty-range and self-dependency cases should be filtered out
            // inside our code, for robustness?
            DependencyOnTheEmptySet {
                package,
                version,
                dependent,
            } => eyre!(
                "{} v{}'s dependency on {} has self-contradictory version ranges",
                package,
                version,
                dependent
            ),
            SelfDependency { package, version } => {
                eyre!("{} v{} depends on itself", package, version)
            }

            NoSolution(mut derivation_tree) => {
                fn dump_tree(tree: &DerivationTree<ResPkg, Version>, depth: usize) {
                    let indent = "   ".repeat(depth);
                    match tree {
                        DerivationTree::External(inner) => {
                            debug!("{}external: {}", indent, inner);
                        }
                        DerivationTree::Derived(inner) => {
                            debug!("{}derived (id={:?})", indent, inner.shared_id);
                            for (pkg, term) in inner.terms.iter() {
                                debug!("{}  {} -> {}", indent, pkg, term);
                            }
                            debug!("{}cause 1:", indent);
                            dump_tree(&inner.cause1, depth + 1);
                            debug!("{}cause 2:", indent);
                            dump_tree(&inner.cause2, depth + 1);
                        }
                    }
                }

                dump_tree(&derivation_tree, 0);
                derivation_tree.collapse_no_versions();
                dump_tree(&derivation_tree, 0);
                let explanation = pubgrub::report::DefaultStringReporter::report(&derivation_tree);
                let requirements = brief
                    .dependencies
                    .iter()
                    .map(|d| d.name.as_given().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                ResolveError::ResolutionImpossible {
                    requirements,
                    explanation,
                }
                .into()
            }
        }),
    }
}

struct ExtraEnv<'a> {
    extra: Option<&'a str>,
}

impl<'a> marker::Env for ExtraEnv<'a> {
    fn get_marker_var(&self, var: &str) -> Option<&str> {
        if var == "extra" {
            self.extra.or(Some(""))
        } else {
            None
        }
    }
}

enum Simplified {
    True,
    False,
    Expr(marker::EnvMarkerExpr),
}

impl Simplified {
    fn eval(&self, env: &dyn marker::Env) -> Result<bool> {
        match self {
            Simplified::True => Ok(true),
            Simplified::False => Ok(false),
            Simplified::Expr(expr) => expr.eval(env),
        }
    }
}

fn simplify_out_extra(expr: &marker::EnvMarkerExpr, extra: Option<&str>) -> Result<Simplified> {
    Ok(match expr {
        marker::EnvMarkerExpr::And(lhs, rhs) => {
            let lhs = simplify_out_extra(lhs, extra)?;
            let rhs = simplify_out_extra(rhs, extra)?;
            match (lhs, rhs) {
                (Simplified::True, Simplified::True) => Simplified::True,
                (_, Simplified::False) => Simplified::False,
                (Simplified::False, _) => Simplified::False,
                (Simplified::Expr(lhs), Simplified::True) => Simplified::Expr(lhs),
                (Simplified::True, Simplified::Expr(rhs)) => Simplified::Expr(rhs),
                (Simplified::Expr(lhs), Simplified::Expr(rhs)) => {
                    Simplified::Expr(marker::EnvMarkerExpr::And(Box::new(lhs), Box::new(rhs)))
                }
            }
        }
        marker::EnvMarkerExpr::Or(lhs, rhs) => {
            let lhs = simplify_out_extra(lhs, extra)?;
            let rhs = simplify_out_extra(rhs, extra)?;
            match (lhs, rhs) {
                (Simplified::False, Simplified::False) => Simplified::False,
                (_, Simplified::True) => Simplified::True,
                (Simplified::True, _) => Simplified::True,
                (Simplified::Expr(lhs), Simplified::False) => Simplified::Expr(lhs),
                (Simplified::False, Simplified::Expr(rhs)) => Simplified::Expr(rhs),
                (Simplified::Expr(lhs), Simplified::Expr(rhs)) => {
                    Simplified::Expr(marker::EnvMarkerExpr::Or(Box::new(lhs), Box::new(rhs)))
                }
            }
        }
        marker::EnvMarkerExpr::Operator { op: _, lhs, rhs } => match expr.eval(&ExtraEnv { extra }) {
            Ok(true) => Simplified::True,
            Ok(false) => Simplified::False,
            Err(_) => {
                if rhs.is_extra() || lhs.is_extra() {
                    bail!("anomalous 'extra' expression: {}", expr);
                }
                Simplified::Expr(expr.clone())
            }
        },
    })
}

// A "package" for purposes of resolving. This is an extended version of what PyPI
// considers a package, in four ways.
//
// First, the pubgrub crate assumes that resolution always starts with a single required
// package==version. So we make a virtual "root" package, pass that to pubgrub as our
// initial requirement, and then we tell pubgrub that Root depends on our actual
// requirements (plus the python constraint below).
//
// Second, there's a virtual "python" package representing the target interpreter.
// Root depends on it with whatever range `Brief::python` specifies, and it only ever
// has one version on offer: the actual `python_full_version` of the `Environment` we're
// resolving for. Any package's own `Requires-Python` is still enforced directly by
// `fetch_and_sort_versions`, rather than as a second edge to this package -- the point
// of modeling it as a package here is just to report "your requirement needs Python
// >=3.11, but you're resolving against 3.9" as an ordinary pubgrub conflict instead of
// a bespoke error path.
//
// Third, extras. To handle them properly, we create virtual packages for each extra.
// So e.g. "foo[bar,baz]" really means "foo, but with the [bar] and [baz] requirements
// added to its normal set". But that's not a concept that pubgrub understands. So
// instead, we pretend that there are two packages "foo[bar]" and "foo[baz]", and their
// requirements are:
//
// - the requirements of 'foo', when evaluated with the appropriate 'extra' set
// - a special requirement on itself 'foo', with the exact same version.
//
// Result: if we wanted "foo[bar,baz]", we end up with "foo", plus all the [bar] and
// [baz] requirements at the same version. So at the end, we can just go through and
// discard all the virtual extra packages, to get the real set of packages.
//
// This trick is stolen from pip's resolver.
//
// Fourth, non-index dependency sources (git/path/url/file). There's no fetch path for
// any of them here, so each one becomes a single-version virtual package with no
// transitive dependencies of its own -- see `DIRECT_VERSION`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ResPkg {
    Root,
    Python,
    Package(PackageName, Option<Extra>),
    Direct(PackageName),
}

static ROOT_VERSION: Lazy<Version> = Lazy::new(|| "0".try_into().unwrap());
// A local-segment marker so this never collides with a real release on any index.
static DIRECT_VERSION: Lazy<Version> = Lazy::new(|| "0+direct".try_into().unwrap());

impl Display for ResPkg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResPkg::Root => write!(f, "<root>"),
            ResPkg::Python => write!(f, "python"),
            ResPkg::Package(name, None) => write!(f, "{}", name.as_given()),
            ResPkg::Package(name, Some(extra)) => {
                write!(f, "{}[{}]", name.as_given(), extra.as_given())
            }
            ResPkg::Direct(name) => write!(f, "{} (direct)", name.as_given()),
        }
    }
}

impl<'a> PubgrubState<'a> {
    fn requirements_to_pubgrub<'r, R, I>(
        &self,
        reqs: I,
        dc: &mut DependencyConstraints<ResPkg, Version>,
        extra: Option<&Extra>,
    ) -> Result<()>
    where
        R: std::ops::Deref<Target = Requirement> + 'r,
        I: Iterator<Item = &'r R>,
    {
        for req in reqs {
            let mut symbolic_expr = None;
            if let Some(expr) = &req.env_marker_expr {
                let simplified = simplify_out_extra(expr, extra.map(|e| e.normalized()))?;
                let value = simplified.eval(self.env)?;
                if let Simplified::Expr(expr) = simplified {
                    self.marker_exprs
                        .borrow_mut()
                        .insert(marker::StandaloneMarkerExpr(expr.clone()), value);
                    symbolic_expr = Some(expr);
                }
                if !value {
                    continue;
                }
            }
            // Record the marker this requirement was conditional on (if any),
            // OR'd in with whatever other dependents already required this
            // package under -- `None` (unconditional) always wins, since one
            // unconditional dependent is enough to make the package
            // unconditionally needed.
            self.package_markers
                .borrow_mut()
                .entry(req.name.clone())
                .and_modify(|existing| {
                    *existing = match (existing.take(), &symbolic_expr) {
                        (None, _) | (_, None) => None,
                        (Some(lhs), Some(rhs)) => {
                            Some(marker::EnvMarkerExpr::Or(Box::new(lhs), Box::new(rhs.clone())))
                        }
                    };
                })
                .or_insert_with(|| symbolic_expr.clone());

            let mut maybe_extras: Vec<Option<Extra>> =
                req.extras.iter().map(|e| Some(e.clone())).collect();
            if maybe_extras.is_empty() {
                maybe_extras.push(None);
            }

            for maybe_extra in maybe_extras {
                let pkg = ResPkg::Package(req.name.clone(), maybe_extra);
                let range = specifiers_to_pubgrub(&req.specifiers)?;
                trace!("adding dependency: {} {}", pkg, range);
                dc.insert(pkg, range);
            }
        }
        Ok(())
    }

    /// Builds the root's dependency set from `Brief.dependencies`: index
    /// dependencies feed the ordinary PEP 508-ish requirement path; every
    /// other source becomes a `ResPkg::Direct` pin, gated by its own
    /// `python` marker if it has one. Optional dependencies are recorded
    /// (round-trippable) but never themselves activated -- see
    /// `Dependency.optional`'s doc comment.
    fn brief_dependencies_to_pubgrub(
        &self,
        dc: &mut DependencyConstraints<ResPkg, Version>,
    ) -> Result<()> {
        let index_reqs: Vec<UserRequirement> = self
            .brief
            .dependencies
            .iter()
            .filter(|dep| !dep.optional && matches!(dep.source, DependencySource::Index))
            .map(|dep| dep.to_requirement())
            .collect::<Result<Vec<_>>>()?;
        self.requirements_to_pubgrub(index_reqs.iter(), dc, None)?;

        for dep in &self.brief.dependencies {
            if dep.optional || matches!(dep.source, DependencySource::Index) {
                continue;
            }
            let active = match dep.python_marker()? {
                Some(expr) => expr.eval(self.env)?,
                None => true,
            };
            if !active {
                continue;
            }
            dc.insert(
                ResPkg::Direct(dep.name.clone()),
                Range::exact(DIRECT_VERSION.clone()),
            );
            self.direct_sources
                .borrow_mut()
                .insert(dep.name.clone(), dep.source.clone());
        }
        Ok(())
    }
}

fn specifiers_to_pubgrub(specs: &Specifiers) -> Result<Range<Version>> {
    let mut final_range = Range::any();
    for spec in &specs.0 {
        let spec_range = spec.to_ranges()?.into_iter().fold(Range::none(), |accum, r| {
            accum.union(&if r.end < *VERSION_INFINITY {
                Range::between(r.start, r.end)
            } else {
                Range::higher_than(r.start)
            })
        });
        final_range = final_range.intersection(&spec_range);
    }
    Ok(final_range)
}

impl<'a> pubgrub::solver::DependencyProvider<ResPkg, Version> for PubgrubState<'a> {
    fn choose_package_version<T, U>(
        &self,
        mut potential_packages: impl Iterator<Item = (T, U)>,
    ) -> Result<(T, Option<Version>), Box<dyn std::error::Error>>
    where
        T: Borrow<ResPkg>,
        U: Borrow<Range<Version>>,
    {
        trace!("----> pubgrub called choose_package_version");
        self.check_suspension_point()?;
        // XX TODO: laziest possible heuristic, just pick the first package offered
        let (respkg, range) = potential_packages.next().unwrap();

        match respkg.borrow() {
            ResPkg::Root => {
                trace!("<---- decision: root package magic version 0");
                Ok((respkg, Some(ROOT_VERSION.clone())))
            }
            ResPkg::Python => {
                if range.borrow().contains(&self.python_full_version) {
                    trace!("<---- decision: python {}", self.python_full_version);
                    Ok((respkg, Some(self.python_full_version.clone())))
                } else {
                    trace!("<---- decision: python version out of range");
                    Ok((respkg, None))
                }
            }
            ResPkg::Direct(name) => {
                trace!("<---- decision: {} (direct source) pinned to placeholder version", name.as_given());
                Ok((respkg, Some(DIRECT_VERSION.clone())))
            }
            ResPkg::Package(name, _) => {
                trace!("Considering {}", name.as_given());
                for &version in self.versions(name)? {
                    trace!("Considering {} {}", name.as_given(), version);
                    if !range.borrow().contains(version) {
                        trace!("Version {} is out of range", version);
                        continue;
                    }

                    let metadata = match self.metadata(&(name.clone(), version.clone())) {
                        Ok(metadata) => metadata,
                        Err(err) => {
                            if matches!(
                                err.downcast_ref::<ResolveError>(),
                                Some(ResolveError::MissingMetadata { .. })
                            ) {
                                trace!(
                                    "no metadata available for {} {}, treating as non-viable",
                                    name.as_given(),
                                    version
                                );
                                continue;
                            }
                            Err(err)?
                        }
                    };
                    if !metadata
                        .requires_python
                        .satisfied_by(&self.python_full_version)?
                    {
                        Err(eyre!(
                            "{} {}: bad requires-python, but the index didn't tell us!",
                            name.as_given(),
                            version
                        ))?;
                    }
                    trace!("<---- decision: {} {}", respkg.borrow(), version);
                    return Ok((respkg, Some(version.clone())));
                }

                trace!("<---- decision: no versions of {} in range", respkg.borrow());
                Ok((respkg, None))
            }
        }
    }

    fn get_dependencies(
        &self,
        pkg: &ResPkg,
        version: &Version,
    ) -> Result<pubgrub::solver::Dependencies<ResPkg, Version>, Box<dyn std::error::Error>> {
        trace!("----> pubgrub called get_dependencies {} v{}", pkg, version);
        self.check_suspension_point()?;

        match pkg {
            ResPkg::Root => {
                let mut dc: DependencyConstraints<ResPkg, Version> = Default::default();
                dc.insert(ResPkg::Python, specifiers_to_pubgrub(&self.brief.python.specifiers)?);
                self.brief_dependencies_to_pubgrub(&mut dc)?;
                trace!("<---- dependencies complete");
                Ok(Dependencies::Known(dc))
            }
            ResPkg::Python => {
                trace!("<---- dependencies complete");
                Ok(Dependencies::Known(Default::default()))
            }
            ResPkg::Direct(_name) => {
                trace!("<---- dependencies complete (direct source, no transitive metadata)");
                Ok(Dependencies::Known(Default::default()))
            }
            ResPkg::Package(name, extra) => {
                let metadata = self.metadata(&(name.clone(), version.clone()))?;

                let mut dc: DependencyConstraints<ResPkg, Version> = Default::default();

                self.requirements_to_pubgrub(metadata.requires_dist.iter(), &mut dc, extra.as_ref())?;

                if let Some(inner) = extra {
                    if !metadata.extras.contains(inner) {
                        Err(eyre!(
                            "package {} has no extra [{}]",
                            name.as_given(),
                            inner.as_given()
                        ))?;
                    }
                    dc.insert(ResPkg::Package(name.clone(), None), Range::exact(version.clone()));
                }

                trace!("<---- dependencies complete");
                Ok(Dependencies::Known(dc))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    impl Display for Simplified {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Simplified::True => write!(f, "true"),
                Simplified::False => write!(f, "false"),
                Simplified::Expr(e) => write!(f, "{}", e),
            }
        }
    }

    #[test]
    fn test_marker_simplify() {
        fn doit(req: &str, extra: Option<&str>) -> String {
            let req: PackageRequirement = req.parse().unwrap();
            let simplified = simplify_out_extra(req.env_marker_expr.as_ref().unwrap(), extra).unwrap();
            format!("{}", simplified)
        }

        insta::assert_snapshot!(
            doit("x; python_version < '3'", None),
            @r###"python_version < "3""###
        );
        insta::assert_snapshot!(
            doit("x; python_version < '3' and extra == 'foo'", None),
            @"false"
        );
        insta::assert_snapshot!(
            doit("x; python_version < '3' and extra == 'foo'", Some("foo")),
            @r###"python_version < "3""###
        );
        insta::assert_snapshot!(
            doit("x; python_version < '3' and extra == 'foo'", Some("bar")),
            @"false"
        );
        insta::assert_snapshot!(doit("x; extra == 'foo'", Some("foo")), @"true");
        insta::assert_snapshot!(
            doit("x; python_version < '3' or 'foo' == extra", Some("foo")),
            @"true"
        );
        insta::assert_snapshot!(
            doit("x; python_version < '3' or 'foo' == extra", Some("bar")),
            @r###"python_version < "3""###
        );

        // error b/c can't simplify out extra
        let req: PackageRequirement = "x; extra == python_version".parse().unwrap();
        assert!(simplify_out_extra(req.env_marker_expr.as_ref().unwrap(), None).is_err());
    }

    #[test]
    fn test_allow_pre_default_is_empty() {
        let brief = Brief {
            python: ">=3.8".try_into().unwrap(),
            dependencies: vec![],
            allow_pre: Default::default(),
        };
        assert!(!brief.allow_pre.allow_pre_for(&"foo".try_into().unwrap()));
    }

    #[test]
    fn test_cancellation_token_shares_state_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_resolve_options_default_deadline_is_in_the_future() {
        let options = ResolveOptions::default();
        assert!(options.deadline.unwrap() > Instant::now());
        assert!(!options.cancellation.is_cancelled());
    }
}
