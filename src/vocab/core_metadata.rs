use crate::prelude::*;

use super::rfc822ish::RFC822ish;

/// The parsed contents of a wheel's `METADATA` file (equivalently, an sdist's
/// `PKG-INFO`). There are more core-metadata fields we could expose, but this
/// covers everything the resolver actually reasons about.
#[derive(Debug, Clone)]
#[cfg_attr(test, derive(Serialize))]
pub struct WheelCoreMetadata {
    pub metadata_version: Version,
    pub name: PackageName,
    pub version: Version,
    pub requires_dist: Vec<PackageRequirement>,
    pub requires_python: Specifiers,
    pub extras: HashSet<Extra>,
}

fn parse_common(input: &[u8]) -> Result<(Version, PackageName, Version, RFC822ish)> {
    let input = String::from_utf8_lossy(input);
    let mut parsed = RFC822ish::parse(&input)?;

    static NEXT_MAJOR_METADATA_VERSION: Lazy<Version> =
        Lazy::new(|| "3".try_into().unwrap());

    // Quoth https://packaging.python.org/specifications/core-metadata:
    // "Automated tools consuming metadata SHOULD warn if metadata_version
    // is greater than the highest version they support, and MUST fail if
    // metadata_version has a greater major version than the highest
    // version they support (as described in PEP 440, the major version is
    // the value before the first dot)."
    //
    // We do the MUST, but don't bother warning on unrecognized minor
    // revisions -- those are required to be backwards compatible, and
    // there are better ways to nudge people to upgrade than a warning
    // buried in dependency-resolution output.
    let metadata_version: Version = parsed.take_the("Metadata-Version")?.try_into()?;
    if metadata_version >= *NEXT_MAJOR_METADATA_VERSION {
        bail!("unsupported Metadata-Version {}", metadata_version);
    }

    Ok((
        metadata_version,
        parsed.take_the("Name")?.parse()?,
        parsed.take_the("Version")?.try_into()?,
        parsed,
    ))
}

impl TryFrom<&[u8]> for WheelCoreMetadata {
    type Error = eyre::Report;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (metadata_version, name, version, mut parsed) = parse_common(value)?;

        let mut requires_dist = Vec::new();
        for req_str in parsed.take_all("Requires-Dist").drain(..) {
            requires_dist.push(req_str.as_str().try_into()?);
        }

        let requires_python = match parsed.maybe_take_the("Requires-Python")? {
            Some(rp_str) => rp_str.as_str().try_into()?,
            None => Specifiers(Vec::new()),
        };

        let mut extras: HashSet<Extra> = HashSet::new();
        for extra in parsed.take_all("Provides-Extra").drain(..) {
            extras.insert(extra.parse()?);
        }

        Ok(WheelCoreMetadata {
            metadata_version,
            name,
            version,
            requires_dist,
            requires_python,
            extras,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_basic_core_parse() {
        let metadata_text = indoc! {r#"
            Metadata-Version: 2.1
            Name: trio
            Version: 0.16.0
            Summary: A friendly Python library for async concurrency and I/O
            Classifier: Framework :: Trio
            Requires-Python: >=3.6
            Requires-Dist: attrs (>=19.2.0)
            Requires-Dist: sortedcontainers
            Requires-Dist: contextvars[foo] (>=2.1) ; python_version < "3.7"

            The Trio project's goal is...
        "#}
        .as_bytes();

        let metadata: WheelCoreMetadata = metadata_text.try_into().unwrap();

        assert_eq!(metadata.name.as_given(), "trio");
        assert_eq!(metadata.version, "0.16.0".try_into().unwrap());
        assert_eq!(metadata.requires_dist.len(), 3);
        assert!(metadata
            .requires_python
            .satisfied_by(&"3.9".try_into().unwrap())
            .unwrap());
        assert!(metadata.extras.is_empty());
    }

    #[test]
    fn test_rejects_future_metadata_version() {
        let metadata_text = indoc! {r#"
            Metadata-Version: 3.0
            Name: trio
            Version: 0.16.0
        "#}
        .as_bytes();
        let metadata: Result<WheelCoreMetadata> = metadata_text.try_into();
        assert!(metadata.is_err());
    }
}
