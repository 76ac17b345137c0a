use crate::prelude::*;
use elsa::FrozenMap;
use indexmap::IndexMap;
use std::path::Path;

use super::http::{CacheMode, Http, NotCached};
use super::simple_api::{fetch_simple_api, pack_by_version, ArtifactInfo};
use crate::error::ResolveError;
use crate::kvstore::KVFileStore;
use crate::platform_tags::{Platform, WheelPlatform};

static NO_ARTIFACTS: [ArtifactInfo; 0] = [];

/// C4 source-priority classes: which indexes are consulted automatically,
/// and in what order, versus only when a dependency pins to them by name.
/// Declaration order within the enum is the consultation order among the
/// automatically-consulted classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePriority {
    Primary,
    Secondary,
    Supplemental,
    /// Never consulted unless a dependency names it via `source_name`.
    Explicit,
}

/// A single configured package index.
#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    pub url: Url,
    pub priority: SourcePriority,
}

/// C4: Package Metadata Provider. Presents version enumeration and dependency
/// extraction for a package from any configured index, with three cache
/// tiers (HTTP responses, per-package version lists, per-artifact parsed
/// metadata) layered in front of the network.
pub struct PackageDB {
    http: Http,
    metadata_cache: KVFileStore,
    version_list_cache: KVFileStore,
    sources: Vec<Source>,

    // memo table to make sure we're internally consistent within a single invocation,
    // and to let us return references instead of copying everything everywhere. Keyed
    // by (package, source_name) since a pinned dependency and an unpinned one could in
    // principle see different candidate sets for the same package within one resolve.
    artifacts: FrozenMap<(PackageName, Option<String>), Box<IndexMap<Version, Vec<ArtifactInfo>>>>,
}

/// Best-effort dependency information for a single package version, along
/// with where it came from. Always normalized down to the two fields the
/// resolver actually needs.
#[derive(Debug, Clone)]
pub struct PackageMetadata {
    pub requires_dist: Vec<PackageRequirement>,
    pub requires_python: Specifiers,
    // Sdist-derived metadata never carries this -- PKG-INFO and pyproject.toml
    // don't declare extras the way wheel METADATA does. A package whose only
    // available artifact is an sdist just won't support extras.
    pub extras: HashSet<Extra>,
}

impl From<&WheelCoreMetadata> for PackageMetadata {
    fn from(m: &WheelCoreMetadata) -> PackageMetadata {
        PackageMetadata {
            requires_dist: m.requires_dist.clone(),
            requires_python: m.requires_python.clone(),
            extras: m.extras.clone(),
        }
    }
}

impl From<&SdistMetadata> for PackageMetadata {
    fn from(m: &SdistMetadata) -> PackageMetadata {
        PackageMetadata {
            requires_dist: m.requires_dist().to_vec(),
            requires_python: m.requires_python(),
            extras: HashSet::new(),
        }
    }
}

impl PackageDB {
    pub fn new(sources: Vec<Source>, cache_path: &Path) -> Result<PackageDB> {
        let http_cache = KVFileStore::new(&cache_path.join("http"))?;
        let hash_cache = KVFileStore::new(&cache_path.join("by-hash"))?;
        Ok(PackageDB {
            http: Http::new(http_cache, hash_cache),
            metadata_cache: KVFileStore::new(&cache_path.join("metadata"))?,
            version_list_cache: KVFileStore::new(&cache_path.join("version-lists"))?,
            sources,
            artifacts: Default::default(),
        })
    }

    /// The sources a query for this package should consult, in order. With
    /// `source_name` given, only that one source -- of any priority class,
    /// including `Explicit` -- is eligible (spec.md's "pins to a source by
    /// name" rule); otherwise every non-`Explicit` source is eligible,
    /// ordered `Primary` before `Secondary` before `Supplemental`.
    fn eligible_sources(&self, source_name: Option<&str>) -> Vec<&Source> {
        match source_name {
            Some(name) => self.sources.iter().filter(|s| s.name == name).collect(),
            None => {
                let mut sources: Vec<&Source> = self
                    .sources
                    .iter()
                    .filter(|s| s.priority != SourcePriority::Explicit)
                    .collect();
                sources.sort_by_key(|s| s.priority);
                sources
            }
        }
    }

    pub fn artifacts_for_version(
        &self,
        p: &PackageName,
        v: &Version,
        source_name: Option<&str>,
    ) -> Result<&[ArtifactInfo]> {
        if let Some(artifacts) = self.available_artifacts_for(p, source_name)?.get(v) {
            Ok(artifacts)
        } else {
            Ok(&NO_ARTIFACTS)
        }
    }

    /// C4 candidate enumeration: fetch the simple-API listing from every
    /// eligible index (see `eligible_sources`), merge by version
    /// (first-winning source per version, in priority order), and sort
    /// highest-first. Results are memoized per `(package, source_name)` for
    /// the lifetime of this `PackageDB` -- one resolve sees a consistent
    /// snapshot even if the index changes mid-run. Assumes a package is
    /// queried with a consistent `source_name` throughout a single resolve
    /// (the same assumption `resolve::PubgrubState.source_pins` makes).
    pub fn available_artifacts_for(
        &self,
        p: &PackageName,
        source_name: Option<&str>,
    ) -> Result<&IndexMap<Version, Vec<ArtifactInfo>>> {
        context!("Looking up available files for {}", p.as_given());
        let key = (p.clone(), source_name.map(|s| s.to_string()));
        if let Some(cached) = self.artifacts.get(&key) {
            return Ok(cached);
        }

        let sources = self.eligible_sources(source_name);
        if sources.is_empty() {
            if let Some(name) = source_name {
                bail!("{} pins to unknown source {:?}", p.as_given(), name);
            }
        }

        let mut packed: IndexMap<Version, Vec<ArtifactInfo>> = Default::default();

        for source in &sources {
            let url = source.url.join(&format!("{}/", p.normalized()))?;
            // A bare 404 means the source answered and simply has no listing
            // for this name -- `fetch_simple_api` already reports that as
            // `Ok(None)`, same as "not found" on any other index. Only a
            // transport failure (connection refused, a non-404 error status,
            // retries exhausted) reaches this `map_err`.
            let maybe_pi = fetch_simple_api(&self.http, &self.version_list_cache, &url).map_err(
                |err| {
                    // The HTTP layer may already have raised this as a
                    // `SourceUnreachable` (a transport failure); pass that
                    // through as-is instead of wrapping it a second time.
                    if err.downcast_ref::<ResolveError>().is_some() {
                        err
                    } else {
                        ResolveError::SourceUnreachable {
                            url: url.to_string(),
                            reason: err.to_string(),
                        }
                        .into()
                    }
                },
            )?;
            if let Some(pi) = maybe_pi {
                pack_by_version(pi, &mut packed)?;
            }
        }

        // sort artifact-infos (arbitrarily) by name, just to have a consistent
        // order from run-to-run (and make resolution output more consistent)
        for artifact_infos in packed.values_mut() {
            artifact_infos.sort_by(|a, b| a.name.cmp(&b.name));
        }
        // sort into descending order by version
        packed.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));

        Ok(self.artifacts.insert(key, Box::new(packed)))
    }

    /// C4 candidate enumeration against every automatically-consulted
    /// source, in priority order. Equivalent to
    /// `available_artifacts_for(p, None)`.
    pub fn available_artifacts(
        &self,
        p: &PackageName,
    ) -> Result<&IndexMap<Version, Vec<ArtifactInfo>>> {
        self.available_artifacts_for(p, None)
    }

    /// C4 versions(): released versions for a package, highest first.
    pub fn versions(&self, p: &PackageName) -> Result<Vec<Version>> {
        Ok(self.available_artifacts(p)?.keys().cloned().collect())
    }

    fn metadata_from_cache(&self, ai: &ArtifactInfo) -> Option<PackageMetadata> {
        let hash = ai.hash.as_ref()?;
        let blob = slurp(&mut self.metadata_cache.get(hash)?).ok()?;
        let stored: StoredMetadata = ciborium::de::from_reader(blob.as_slice()).ok()?;
        stored.try_into().ok()
    }

    fn put_metadata_in_cache(&self, ai: &ArtifactInfo, meta: &PackageMetadata) -> Result<()> {
        if let Some(hash) = &ai.hash {
            let stored = StoredMetadata::from(meta);
            self.metadata_cache.get_or_set(hash, |w| {
                ciborium::ser::into_writer(&stored, w)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn open_artifact<T>(&self, ai: &ArtifactInfo, body: Box<dyn ReadPlusSeek>) -> Result<T>
    where
        T: Artifact,
    {
        let artifact_name = ai
            .name
            .inner_as::<T::Name>()
            .ok_or_else(|| eyre!("{} is not a {}", ai.name, std::any::type_name::<T>()))?
            .clone();
        T::new(artifact_name, body)
    }

    fn _get_artifact<T>(&self, ai: &ArtifactInfo, cache_mode: CacheMode) -> Result<T>
    where
        T: Artifact,
    {
        let body = self.http.get_hashed(&ai.url, ai.hash.as_ref(), cache_mode)?;
        self.open_artifact::<T>(ai, body)
    }

    pub fn get_artifact<T>(&self, ai: &ArtifactInfo) -> Result<T>
    where
        T: Artifact,
    {
        self._get_artifact(ai, CacheMode::Default)
    }

    /// C4 dependencies(): best-effort dependency extraction for one package
    /// version. Tries, in order: a cached parse, a wheel matching `platform`
    /// (downloading on demand), then the sdist fallback chain from
    /// §4.4 (`PKG-INFO` → static `pyproject.toml` → lexical `setup.py` scan).
    /// Returns `ResolveError::MissingMetadata` if every avenue is exhausted --
    /// the caller (`resolve::PubgrubState::choose_package_version`) folds
    /// that into "this version has no viable dependency edge" rather than
    /// aborting the whole resolve, unless no other version is left to try.
    pub fn get_metadata<'a>(
        &self,
        name: &PackageName,
        version: &Version,
        artifacts: &'a [ArtifactInfo],
        platform: &WheelPlatform,
    ) -> Result<(&'a ArtifactInfo, PackageMetadata)> {
        let wheels = || {
            artifacts
                .iter()
                .filter(|ai| matches!(ai.name, ArtifactName::Wheel(_)))
        };
        let sdists = || {
            artifacts
                .iter()
                .filter(|ai| matches!(ai.name, ArtifactName::Sdist(_)))
        };

        // cache hit, of either kind
        for ai in artifacts.iter() {
            if let Some(meta) = self.metadata_from_cache(ai) {
                return Ok((ai, meta));
            }
        }

        // prefer whichever wheel scores best against the target environment's
        // compatibility tags
        let best_wheel = wheels()
            .filter_map(|ai| {
                let name = ai.name.inner_as::<WheelName>()?;
                platform
                    .max_compatibility(name.all_tags())
                    .map(|score| (score, ai))
            })
            .max_by_key(|(score, _)| *score)
            .map(|(_, ai)| ai);

        if let Some(ai) = best_wheel {
            // already have it locally?
            let wheel = match self._get_artifact::<Wheel>(ai, CacheMode::OnlyIfCached) {
                Ok(wheel) => wheel,
                Err(err) => match err.downcast_ref::<NotCached>() {
                    Some(_) => self.get_artifact::<Wheel>(ai)?,
                    None => return Err(err),
                },
            };
            let (_, metadata) = wheel.metadata()?;
            let meta = PackageMetadata::from(&metadata);
            self.put_metadata_in_cache(ai, &meta)?;
            return Ok((ai, meta));
        }

        for ai in sdists() {
            let sdist = match self._get_artifact::<Sdist>(ai, CacheMode::OnlyIfCached) {
                Ok(sdist) => sdist,
                Err(err) => match err.downcast_ref::<NotCached>() {
                    Some(_) => self.get_artifact::<Sdist>(ai)?,
                    None => return Err(err),
                },
            };
            let fallback = sdist
                .pkg_info()?
                .map(SdistMetadata::PkgInfo)
                .or(sdist.pyproject_static()?)
                .or(sdist.setup_py_lexical()?);
            if let Some(meta) = fallback {
                let meta = PackageMetadata::from(&meta);
                self.put_metadata_in_cache(ai, &meta)?;
                return Ok((ai, meta));
            }
        }

        Err(ResolveError::MissingMetadata {
            name: name.as_given().to_string(),
            version: version.clone(),
        }
        .into())
    }
}

/// On-disk cache representation: the resolver-relevant fields only, not the
/// full metadata record they were extracted from -- the cache is keyed by
/// distribution hash, so we never need to reconstruct the source artifact.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMetadata {
    requires_dist: Vec<String>,
    requires_python: Specifiers,
    extras: HashSet<Extra>,
}

impl From<&PackageMetadata> for StoredMetadata {
    fn from(m: &PackageMetadata) -> StoredMetadata {
        StoredMetadata {
            requires_dist: m.requires_dist.iter().map(|r| r.to_string()).collect(),
            requires_python: m.requires_python.clone(),
            extras: m.extras.clone(),
        }
    }
}

impl TryFrom<StoredMetadata> for PackageMetadata {
    type Error = eyre::Report;

    fn try_from(stored: StoredMetadata) -> Result<PackageMetadata> {
        let requires_dist = stored
            .requires_dist
            .iter()
            .map(|s| s.as_str().try_into())
            .collect::<Result<Vec<PackageRequirement>, _>>()?;
        Ok(PackageMetadata {
            requires_dist,
            requires_python: stored.requires_python,
            extras: stored.extras,
        })
    }
}
