#![forbid(unsafe_code)]

mod error;
mod kvstore;
mod lock;
mod net;
mod output;
mod package_db;
mod platform_tags;
mod prelude;
mod resolve;
mod seek_slice;
mod util;
mod vocab;

#[cfg(test)]
mod test_util;

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use crate::error::ResolveError;
use crate::package_db::{PackageDB, Source, SourcePriority};
use crate::prelude::*;
use crate::resolve::{Blueprint, Brief, CancellationToken, ResolveOptions};

/// A dependency resolver and lock-file engine. Consumes an already-parsed
/// dependency specification and an explicit target environment; never reads
/// a manifest format or probes the process it's running in.
#[derive(Parser)]
#[command(name = "dresolve", version)]
struct Opt {
    #[command(flatten)]
    output: output::OutputArgs,

    /// Where to cache downloaded index pages, artifacts, and parsed metadata.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Base URL of a primary simple-API package index. May be repeated;
    /// consulted before any secondary or supplemental index.
    #[arg(long = "index-url", global = true, default_value = "https://pypi.org/simple/")]
    index_urls: Vec<Url>,

    /// Base URL of a secondary index, consulted after every primary index
    /// has been checked for a given package. May be repeated.
    #[arg(long = "secondary-index-url", global = true)]
    secondary_index_urls: Vec<Url>,

    /// Base URL of a supplemental index, consulted only after every primary
    /// and secondary index has come up empty for a given package. May be
    /// repeated.
    #[arg(long = "supplemental-index-url", global = true)]
    supplemental_index_urls: Vec<Url>,

    /// A named index that's never consulted automatically -- only a
    /// dependency that pins to it by name (`source-name` in a `Brief`) will
    /// see it. Format: `NAME=URL`. May be repeated.
    #[arg(long = "explicit-index", global = true, value_parser = parse_explicit_index)]
    explicit_indexes: Vec<(String, Url)>,

    /// Soft wall-clock budget for a single resolve, in seconds. A resolve
    /// still running past this raises `ResolveError::TimedOut` the next time
    /// the solver reaches a suspension point.
    #[arg(long = "timeout-secs", global = true)]
    timeout_secs: Option<u64>,

    /// Require the lock passed via `--like` to already be fresh for this
    /// brief (same content-hash); raise instead of silently producing a
    /// different resolve.
    #[arg(long, global = true)]
    locked: bool,

    #[command(subcommand)]
    command: Command,
}

fn parse_explicit_index(s: &str) -> Result<(String, Url), String> {
    let (name, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=URL, got {:?}", s))?;
    let url: Url = url.parse().map_err(|e| format!("{}", e))?;
    Ok((name.to_string(), url))
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a brief (JSON) against a target environment (JSON) and print
    /// the resulting lock file to stdout.
    Resolve {
        /// Path to a JSON-encoded `Brief`.
        brief: PathBuf,
        /// Path to a JSON-encoded `Environment`.
        environment: PathBuf,
        /// A previous lock file to use for version hints, so a re-resolve
        /// prefers staying on already-pinned versions.
        #[arg(long)]
        like: Option<PathBuf>,
    },
    /// Read a lock file and print the install order for a target environment.
    Plan {
        lock: PathBuf,
        environment: PathBuf,
    },
}

fn build_sources(opt: &Opt) -> Vec<Source> {
    let mut sources = Vec::new();
    for (i, url) in opt.index_urls.iter().enumerate() {
        sources.push(Source {
            name: format!("primary-{i}"),
            url: url.clone(),
            priority: SourcePriority::Primary,
        });
    }
    for (i, url) in opt.secondary_index_urls.iter().enumerate() {
        sources.push(Source {
            name: format!("secondary-{i}"),
            url: url.clone(),
            priority: SourcePriority::Secondary,
        });
    }
    for (i, url) in opt.supplemental_index_urls.iter().enumerate() {
        sources.push(Source {
            name: format!("supplemental-{i}"),
            url: url.clone(),
            priority: SourcePriority::Supplemental,
        });
    }
    for (name, url) in &opt.explicit_indexes {
        sources.push(Source {
            name: name.clone(),
            url: url.clone(),
            priority: SourcePriority::Explicit,
        });
    }
    sources
}

fn load_environment(path: &PathBuf) -> Result<Environment> {
    let text = fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).wrap_err_with(|| format!("parsing {} as an Environment", path.display()))
}

fn dependency_fingerprint_key(dep: &Dependency) -> String {
    let extras = dep.extras.iter().map(|e| e.as_given()).collect::<Vec<_>>().join(",");
    format!(
        "{}|{}|{}|{}|{}",
        dep.name.as_given(),
        dep.constraint,
        dep.source.provenance(),
        extras,
        dep.source_name.as_deref().unwrap_or(""),
    )
}

fn cmd_resolve(opt: &Opt, brief: &PathBuf, environment: &PathBuf, like: &Option<PathBuf>) -> Result<()> {
    let brief_text = fs::read_to_string(brief).wrap_err_with(|| format!("reading {}", brief.display()))?;
    let brief: Brief = serde_json::from_str(&brief_text)
        .wrap_err_with(|| format!("parsing {} as a Brief", brief.display()))?;
    let env = load_environment(environment)?;

    let python_versions = brief.python.specifiers.clone();
    let fingerprint = lock::fingerprint_requirements(
        &python_versions.to_string(),
        brief.dependencies.iter().map(dependency_fingerprint_key),
    );

    let like_blueprint: Option<Blueprint> = match like {
        Some(path) => {
            let text = fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
            let resolution = lock::read_lock(&text)?;
            if opt.locked {
                lock::check_fresh(&resolution, &fingerprint)?;
            }
            Some(resolution_as_hint_blueprint(&resolution))
        }
        None => None,
    };

    let cache_dir = opt
        .cache_dir
        .clone()
        .unwrap_or_else(|| PROJECT_DIRS.cache_dir().to_owned());
    let db = PackageDB::new(build_sources(opt), &cache_dir)?;

    let options = ResolveOptions {
        cancellation: CancellationToken::new(),
        deadline: Some(Instant::now() + Duration::from_secs(opt.timeout_secs.unwrap_or(10 * 60))),
    };

    let blueprint = brief.resolve(&db, &env, like_blueprint.as_ref(), &options)?;

    println!("{}", lock::write_lock(&blueprint, &python_versions, &fingerprint));
    Ok(())
}

/// A previously-written lock file doesn't carry everything a `Blueprint`
/// does (wheel provenance, `requires-python` per artifact), but the version
/// pins are enough to seed `VersionHints` for a re-resolve.
fn resolution_as_hint_blueprint(resolution: &lock::Resolution) -> Blueprint {
    let mut package_sources = HashMap::new();
    let packages = resolution
        .packages
        .iter()
        .map(|p| {
            let pin = resolve::PinnedPackage {
                name: p.name.clone(),
                version: p.version.clone(),
                files: p.files.clone(),
            };
            if !matches!(p.source, lock::LockedSource::Registry { .. }) {
                package_sources.insert(p.name.clone(), locked_source_as_dependency_source(&p.source));
            }
            let meta = resolve::WheelResolveMetadata {
                provenance: p.source.to_string(),
                inner: resolve::WheelResolveMetadataInner {
                    requires_dist: Vec::new(),
                    requires_python: p.requires_python.clone(),
                    extras: p.extras.iter().cloned().collect(),
                },
            };
            (pin, meta)
        })
        .collect();
    Blueprint {
        packages,
        marker_expressions: HashMap::new(),
        package_markers: HashMap::new(),
        package_sources,
    }
}

fn locked_source_as_dependency_source(source: &lock::LockedSource) -> DependencySource {
    match source {
        lock::LockedSource::Registry { .. } => DependencySource::Index,
        lock::LockedSource::Git { url, reference, .. } => DependencySource::Git {
            url: url.clone(),
            git_ref: reference.clone().map(GitRef::Rev),
            subdir: None,
        },
        lock::LockedSource::Path { location, develop } => DependencySource::Path {
            location: PathLocation::Dir(PathBuf::from(location)),
            develop: *develop,
        },
        lock::LockedSource::Url { archive_url } => DependencySource::Url {
            archive_url: archive_url.clone(),
        },
        lock::LockedSource::File { local_archive_path } => DependencySource::File {
            local_archive_path: PathBuf::from(local_archive_path),
        },
    }
}

fn cmd_plan(lock_path: &PathBuf, environment: &PathBuf) -> Result<()> {
    let text = fs::read_to_string(lock_path).wrap_err_with(|| format!("reading {}", lock_path.display()))?;
    let resolution = lock::read_lock(&text)?;
    let env = load_environment(environment)?;
    for step in lock::installer_plan(&resolution, &env)? {
        println!("{} v{} <- {}", step.name.as_given(), step.version, step.source);
    }
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    output::init(&opt.output);

    let result = match &opt.command {
        Command::Resolve { brief, environment, like } => cmd_resolve(&opt, brief, environment, like),
        Command::Plan { lock, environment } => cmd_plan(lock, environment),
    };

    if let Err(err) = &result {
        if matches!(err.downcast_ref::<ResolveError>(), Some(ResolveError::Cancelled)) {
            warn!("resolve was cancelled");
        }
    }
    result
}
