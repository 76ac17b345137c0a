use crate::prelude::*;
use thiserror::Error;

/// The resolver's own error taxonomy. Parsing failures from `vocab/` (bad
/// version strings, bad markers, ...) already carry their own `eyre::Report`
/// context by the time they get here; these variants are the ones the
/// resolve/lock pipeline raises on its own behalf, so callers can match on
/// them (e.g. `downcast_ref::<ResolveError>()`) instead of string-matching
/// an `eyre::Report`.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// Every avenue for extracting dependency metadata (cached parse, best
    /// wheel, sdist fallback chain) was exhausted for this package version.
    /// Not necessarily fatal to an overall resolve -- pubgrub can still try a
    /// different version -- unless there's no alternative left to try.
    #[error("couldn't determine dependencies of {name} {version}")]
    MissingMetadata { name: String, version: Version },

    /// A configured source didn't answer, even after the bounded retry-with-
    /// backoff schedule in `net::retry` was exhausted. Fatal: a resolve can't
    /// be completed in the presence of a source it can't reach if that source
    /// was required to answer a query.
    #[error("couldn't reach {url}: {reason}")]
    SourceUnreachable { url: String, reason: String },

    /// pubgrub found no solution; carries a rendered derivation tree as
    /// produced by `pubgrub::report::DefaultStringReporter`.
    #[error("no version of {requirements} could satisfy every constraint:\n{explanation}")]
    ResolutionImpossible {
        requirements: String,
        explanation: String,
    },

    /// The resolve was cancelled by the caller (e.g. a CLI timeout or a
    /// Ctrl-C) before it reached a conclusion.
    #[error("resolve cancelled")]
    Cancelled,

    /// A resolve-wide deadline elapsed before pubgrub converged.
    #[error("resolve timed out")]
    TimedOut,

    /// A lock file's `content-hash` doesn't match the manifest it's
    /// supposedly locking -- the manifest changed since the lock was last
    /// written. Whether this is a hard error or a warning is a policy
    /// decision made by the caller (e.g. `--locked` vs. a plain install).
    #[error("lock file is out of date with its manifest (expected content-hash {expected}, found {found})")]
    LockMismatch { expected: String, found: String },
}
