use crate::prelude::*;

/// A fully explicit description of the target environment a resolve is being
/// performed for: the marker variables used to evaluate PEP 508 markers, plus
/// the ordered list of wheel compatibility tags accepted for that target.
///
/// This is always supplied by the caller. We never probe `std::env::consts`
/// or otherwise introspect the process we're running in -- a resolve has to be
/// reproducible on a machine that isn't the target, and the whole point of
/// recording it is so a lock file can later be checked against a *different*
/// environment than the one that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub marker_values: HashMap<String, String>,
    /// Wheel compatibility tags, most-preferred first.
    pub compatible_tags: Vec<String>,
}

impl Environment {
    pub fn python_full_version(&self) -> Result<Version> {
        self.marker_values
            .get("python_full_version")
            .ok_or_else(|| eyre!("environment is missing 'python_full_version'"))?
            .parse()
    }
}

impl marker::Env for Environment {
    fn get_marker_var(&self, var: &str) -> Option<&str> {
        self.marker_values.get(var).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_environment_marker_lookup() {
        let mut marker_values = HashMap::new();
        marker_values.insert("python_full_version".to_string(), "3.11.2".to_string());
        marker_values.insert("sys_platform".to_string(), "linux".to_string());
        let env = Environment {
            marker_values,
            compatible_tags: vec!["py3-none-any".to_string()],
        };
        assert_eq!(env.python_full_version().unwrap(), "3.11.2".try_into().unwrap());
        assert_eq!(marker::Env::get_marker_var(&env, "sys_platform"), Some("linux"));
        assert_eq!(marker::Env::get_marker_var(&env, "os_name"), None);
    }
}
