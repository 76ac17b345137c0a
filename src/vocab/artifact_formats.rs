use super::rfc822ish::RFC822ish;
use crate::prelude::*;
use std::cell::RefCell;
use zip::ZipArchive;

/// A source distribution archive (`.tar.gz` or `.zip`). We only ever read
/// metadata out of these statically -- running an sdist's build backend would
/// mean executing arbitrary third-party code, which is out of scope here.
pub struct Sdist {
    name: SdistName,
    body: RefCell<Box<dyn ReadPlusSeek>>,
}

/// A built distribution archive (a zip with a fixed internal layout).
pub struct Wheel {
    name: WheelName,
    z: RefCell<ZipArchive<Box<dyn ReadPlusSeek>>>,
}

pub trait Artifact: Sized {
    type Name: Clone;

    fn new(name: Self::Name, f: Box<dyn ReadPlusSeek>) -> Result<Self>;
    fn name(&self) -> &Self::Name;
}

impl Artifact for Sdist {
    type Name = SdistName;

    fn new(name: Self::Name, body: Box<dyn ReadPlusSeek>) -> Result<Self> {
        Ok(Sdist {
            name,
            body: body.into(),
        })
    }

    fn name(&self) -> &Self::Name {
        &self.name
    }
}

fn slurp_entry<R: Read>(mut r: R) -> Result<Vec<u8>> {
    slurp(&mut r).map_err(Into::into)
}

/// Best-effort dependency information extracted from an sdist without running its
/// build backend. Increasingly unreliable the further down the list: `PkgInfo` is a
/// real (if possibly stale) metadata record, `SetupPyLexical` is a guess about what a
/// regex matched inside a file we never executed.
#[derive(Debug, Clone)]
pub enum SdistMetadata {
    PkgInfo(WheelCoreMetadata),
    PyprojectStatic {
        requires_dist: Vec<PackageRequirement>,
        requires_python: Specifiers,
    },
    SetupPyLexical {
        requires_dist: Vec<PackageRequirement>,
    },
}

impl SdistMetadata {
    pub fn requires_dist(&self) -> &[PackageRequirement] {
        match self {
            SdistMetadata::PkgInfo(m) => &m.requires_dist,
            SdistMetadata::PyprojectStatic { requires_dist, .. } => requires_dist,
            SdistMetadata::SetupPyLexical { requires_dist } => requires_dist,
        }
    }

    pub fn requires_python(&self) -> Specifiers {
        match self {
            SdistMetadata::PkgInfo(m) => m.requires_python.clone(),
            SdistMetadata::PyprojectStatic { requires_python, .. } => requires_python.clone(),
            SdistMetadata::SetupPyLexical { .. } => Specifiers(Vec::new()),
        }
    }
}

impl Sdist {
    /// Find a file directly at the sdist root (i.e. at most one path component
    /// below the top-level directory most sdists wrap their contents in).
    fn find_root_file(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        let mut boxed = self.body.borrow_mut();
        let body = boxed.as_mut();
        match self.name.format {
            SdistFormat::Zip => {
                let mut z = ZipArchive::new(&mut *body)?;
                let candidate = (0..z.len())
                    .map(|i| z.by_index(i).map(|f| f.name().to_owned()))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .find(|n| n.matches('/').count() <= 1 && n.ends_with(filename));
                match candidate {
                    Some(name) => Ok(Some(slurp_entry(z.by_name(&name)?)?)),
                    None => Ok(None),
                }
            }
            SdistFormat::TarGz => {
                let gz = flate2::read::GzDecoder::new(&mut *body);
                let mut archive = tar::Archive::new(gz);
                for entry in archive.entries()? {
                    let mut entry = entry?;
                    let path = entry.path()?.to_string_lossy().into_owned();
                    if path.matches('/').count() <= 1 && path.ends_with(filename) {
                        return Ok(Some(slurp_entry(&mut entry)?));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Statically extract `PKG-INFO` from the sdist root, if present. Most
    /// sdists ship a `PKG-INFO` that's accurate enough to resolve against
    /// without invoking a build backend. `Requires-Dist` in an sdist's
    /// PKG-INFO is frequently absent or stale (it's filled in at build time
    /// by some backends), so callers should treat the result as
    /// "distribution metadata was present", not as authoritative dependency
    /// information.
    pub fn pkg_info(&self) -> Result<Option<WheelCoreMetadata>> {
        self.find_root_file("PKG-INFO")?
            .map(|blob| blob.as_slice().try_into())
            .transpose()
    }

    /// Statically parse `[project]` out of `pyproject.toml`, if present and if
    /// it declares dependencies directly (as opposed to delegating to
    /// `dynamic = ["dependencies"]`, which we can't resolve without running
    /// the build backend).
    pub fn pyproject_static(&self) -> Result<Option<SdistMetadata>> {
        let Some(blob) = self.find_root_file("pyproject.toml")? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&blob);
        let doc: toml_edit::Document = text.parse()?;
        let Some(project) = doc.get("project").and_then(|p| p.as_table()) else {
            return Ok(None);
        };
        if let Some(dynamic) = project.get("dynamic").and_then(|d| d.as_array()) {
            if dynamic.iter().any(|v| v.as_str() == Some("dependencies")) {
                return Ok(None);
            }
        }
        let mut requires_dist = Vec::new();
        if let Some(deps) = project.get("dependencies").and_then(|d| d.as_array()) {
            for dep in deps {
                if let Some(s) = dep.as_str() {
                    requires_dist.push(s.try_into()?);
                }
            }
        }
        let requires_python = match project
            .get("requires-python")
            .and_then(|v| v.as_str())
        {
            Some(s) => s.try_into()?,
            None => Specifiers(Vec::new()),
        };
        Ok(Some(SdistMetadata::PyprojectStatic {
            requires_dist,
            requires_python,
        }))
    }

    /// Last-resort, read-only lexical scan of a legacy `setup.py` for an
    /// `install_requires=[...]` literal. Never executes the script; just
    /// regex-matches a quoted-string list, so it misses anything computed at
    /// runtime (which is most of what makes `setup.py` metadata unreliable in
    /// the first place).
    pub fn setup_py_lexical(&self) -> Result<Option<SdistMetadata>> {
        let Some(blob) = self.find_root_file("setup.py")? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&blob);

        static INSTALL_REQUIRES_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r#"(?s)install_requires\s*=\s*\[(?P<body>.*?)\]"#).unwrap()
        });
        static STRING_LITERAL_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#"["']([^"']+)["']"#).unwrap());

        let Some(captures) = INSTALL_REQUIRES_RE.captures(&text) else {
            return Ok(None);
        };
        let mut requires_dist = Vec::new();
        for m in STRING_LITERAL_RE.captures_iter(&captures["body"]) {
            requires_dist.push(m[1].try_into()?);
        }
        Ok(Some(SdistMetadata::SetupPyLexical { requires_dist }))
    }
}

impl Artifact for Wheel {
    type Name = WheelName;

    fn new(name: Self::Name, f: Box<dyn ReadPlusSeek>) -> Result<Self> {
        Ok(Wheel {
            name,
            z: RefCell::new(ZipArchive::new(f)?),
        })
    }

    #[inline]
    fn name(&self) -> &Self::Name {
        &self.name
    }
}

fn parse_format_metadata_and_check_version(
    input: &[u8],
    version_field: &str,
) -> Result<RFC822ish> {
    let input: &str = std::str::from_utf8(input)?;
    let mut parsed = RFC822ish::parse(input)?;

    let version = parsed.take_the(version_field)?;
    if !version.starts_with("1.") {
        bail!("unsupported {}: {:?}", version_field, version);
    }

    Ok(parsed)
}

fn slurp_from_zip<T: Read + Seek>(z: &mut ZipArchive<T>, name: &str) -> Result<Vec<u8>> {
    slurp(&mut z.by_name(name)?).map_err(Into::into)
}

pub struct WheelVitals {
    pub dist_info: String,
    pub data: String,
    pub root_is_purelib: bool,
    pub metadata_blob: Vec<u8>,
    pub metadata: WheelCoreMetadata,
}

impl Wheel {
    /// Little helper for picking out the .dist-info or .data directory from an
    /// iterator.
    pub fn find_special_wheel_dir<'a, I, S>(
        names: I,
        name: &PackageName,
        version: &Version,
        suffix: &str,
    ) -> Result<Option<S>>
    where
        I: IntoIterator<Item = S>,
        S: 'a + AsRef<str>,
    {
        static SPECIAL_WHEEL_DIR_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^(.*)-(.*)\..*").unwrap());

        assert!(suffix.starts_with('.'));

        let mut candidates = names
            .into_iter()
            .filter(|n| n.as_ref().ends_with(suffix))
            .collect::<Vec<_>>();

        let candidate = match candidates.pop() {
            Some(c) => c,
            None => return Ok(None),
        };
        if !candidates.is_empty() {
            bail!("found multiple {suffix}/ directories in wheel");
        }
        let candidate_str = candidate.as_ref();
        match SPECIAL_WHEEL_DIR_RE.captures(candidate_str) {
            None => bail!("invalid {suffix} name: couldn't find name/version"),
            Some(captures) => {
                let got_name: PackageName = captures.get(1).unwrap().as_str().try_into()?;
                if name != &got_name {
                    bail!(
                        "wrong name in {candidate_str}: expected {}",
                        name.as_given()
                    );
                }
                let got_version: Version = captures.get(2).unwrap().as_str().try_into()?;
                if version != &got_version {
                    bail!("wrong version in {candidate_str}: expected {version}");
                }
                Ok(Some(candidate))
            }
        }
    }

    pub fn get_vitals(&self) -> Result<WheelVitals> {
        let mut z = self.z.borrow_mut();

        let dist_info;
        let data;
        {
            let top_levels = z
                .file_names()
                .map(|n| {
                    if let Some((base, _rest)) = n.split_once(['/', '\\']) {
                        base
                    } else {
                        n
                    }
                })
                .collect::<HashSet<_>>()
                .into_iter()
                .collect::<Vec<_>>();

            dist_info = Wheel::find_special_wheel_dir(
                &top_levels,
                &self.name.distribution,
                &self.name.version,
                ".dist-info",
            )?
            .ok_or_else(|| eyre!(".dist-info/ missing"))?
            .to_string();

            if let Some(d) = Wheel::find_special_wheel_dir(
                &top_levels,
                &self.name.distribution,
                &self.name.version,
                ".data",
            )? {
                data = d.to_string();
            } else {
                // synthesize a fake .data directory, to reduce special cases later.
                data = format!("{}.data", dist_info.strip_suffix(".dist-info").unwrap());
            }
        }

        let wheel_path = format!("{dist_info}/WHEEL");
        let wheel_metadata = slurp_from_zip(&mut z, &wheel_path)?;

        let mut parsed =
            parse_format_metadata_and_check_version(&wheel_metadata, "Wheel-Version")?;

        let root_is_purelib = match &parsed.take_the("Root-Is-Purelib")?[..] {
            "true" => true,
            "false" => false,
            other => bail!(
                "Expected 'true' or 'false' for Root-Is-Purelib, not {}",
                other,
            ),
        };

        let metadata_path = format!("{dist_info}/METADATA");
        let metadata_blob = slurp_from_zip(&mut z, &metadata_path)?;

        let metadata: WheelCoreMetadata = metadata_blob.as_slice().try_into()?;

        if metadata.name != self.name.distribution {
            bail!(
                "name mismatch between {dist_info}/METADATA and filename ({} != {})",
                metadata.name.as_given(),
                self.name.distribution.as_given()
            );
        }
        if metadata.version != self.name.version {
            bail!(
                "version mismatch between {dist_info}/METADATA and filename ({} != {})",
                metadata.version,
                self.name.version
            );
        }

        Ok(WheelVitals {
            dist_info,
            data,
            root_is_purelib,
            metadata_blob,
            metadata,
        })
    }

    /// Parse a standalone `METADATA` blob, e.g. one fetched directly via a
    /// PEP 658 `.metadata` sidecar file without downloading the whole wheel.
    pub fn parse_metadata(value: &[u8]) -> Result<WheelCoreMetadata> {
        value.try_into()
    }

    pub fn metadata(&self) -> Result<(Vec<u8>, WheelCoreMetadata)> {
        let vitals = self.get_vitals()?;
        Ok((vitals.metadata_blob, vitals.metadata))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use zip::write::FileOptions;

    fn build_test_wheel() -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = zip::ZipWriter::new(Cursor::new(&mut buf));
            let opts = FileOptions::default();
            w.start_file("demo-1.0.dist-info/WHEEL", opts).unwrap();
            w.write_all(b"Wheel-Version: 1.0\nRoot-Is-Purelib: true\n")
                .unwrap();
            w.start_file("demo-1.0.dist-info/METADATA", opts).unwrap();
            w.write_all(b"Metadata-Version: 2.1\nName: demo\nVersion: 1.0\n")
                .unwrap();
            w.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_wheel_get_vitals() {
        let name: WheelName = "demo-1.0-py3-none-any.whl".try_into().unwrap();
        let buf = build_test_wheel();
        let wheel = Wheel::new(name, Box::new(Cursor::new(buf))).unwrap();
        let vitals = wheel.get_vitals().unwrap();
        assert_eq!(vitals.dist_info, "demo-1.0.dist-info");
        assert!(vitals.root_is_purelib);
        assert_eq!(vitals.metadata.name.as_given(), "demo");
    }
}
