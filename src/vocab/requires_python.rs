use crate::prelude::*;

/// The `Requires-Python` field from a package's metadata: a set of version
/// specifiers constraining which Python (or other host-language runtime)
/// versions the package supports.
#[derive(Debug, Clone, PartialEq, Eq, Default, SerializeDisplay, DeserializeFromStr)]
pub struct RequiresPython {
    pub specifiers: Specifiers,
}

impl RequiresPython {
    pub fn satisfied_by(&self, version: &Version) -> Result<bool> {
        self.specifiers.satisfied_by(version)
    }
}

impl Display for RequiresPython {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.specifiers)
    }
}

impl TryFrom<&str> for RequiresPython {
    type Error = eyre::Report;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        let specifiers = input
            .try_into()
            .wrap_err_with(|| format!("failed to parse Requires-Python string {:?}", input))?;
        Ok(RequiresPython { specifiers })
    }
}

try_from_str_boilerplate!(RequiresPython);
